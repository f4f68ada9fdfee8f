//! Transfer-out engine: ledger, credit gate, mirror submitter and the desk
//! that runs them together.

pub mod credit;
pub mod desk;
pub mod ledger;
pub mod mirror;

pub use credit::{CreditDecision, CreditGate, CreditReason};
pub use desk::{DeskSettings, LinkedFailurePolicy, TransferDesk, WagerSubmission};
pub use ledger::{CommitOutcome, TransferLedger};
pub use mirror::MirrorSubmitter;

//! Integration tests for the transfer-out engine.

mod fixtures;
mod race;
mod sqlite_store;
mod suffix_groups;
mod timeout;
mod transfer_flow;

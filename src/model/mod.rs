//! Core data model types: addresses, inbound messages, and ledger records.

pub mod address;
pub mod message;
pub mod record;

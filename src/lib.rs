//! `mailledger`: duplicate-aware ingestion of mailed documents.
//!
//! Every inbound (message, recipient) delivery is logged exactly once,
//! while identical content is stored only once no matter how often it
//! arrives. A small bounded store answers "recently handled?" cheaply;
//! two append-only CSV ledgers hold the authoritative history.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod ledger;
pub mod lock;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod parser;
pub mod source;
pub mod store;

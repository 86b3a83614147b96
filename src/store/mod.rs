//! Stores outside the ledgers: the bounded fast store and the document store.

pub mod documents;
pub mod format;
pub mod quota;

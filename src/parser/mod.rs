//! Email parsing: EML files and lenient date handling.

pub mod date;
pub mod eml;

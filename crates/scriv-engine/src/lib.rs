//! Repair engine and turn consumer for Scriv.
//!
//! `repair` turns whatever argument payload the generation engine
//! produced into a valid mapping or an explicit unrecoverable record;
//! `turn` drives one request/response cycle's event stream through
//! validation, persistence, and the document merge.

pub mod ports;
pub mod repair;
pub mod turn;

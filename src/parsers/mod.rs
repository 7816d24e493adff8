//! Message-log parser registry (component H).

pub mod registry;

pub use registry::{known_ids, lookup, ExtraField, ParserEntry};

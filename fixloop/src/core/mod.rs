//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data (log text, report XML, counters) and return deterministic outputs
//! suitable for tests.

pub mod budget;
pub mod junit;
pub mod log_parser;
pub mod machine;
pub mod retry;
pub mod state;
pub mod types;

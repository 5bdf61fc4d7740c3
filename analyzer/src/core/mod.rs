//! Deterministic, pure logic shared by the run engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod backend;
pub mod diagnostics;
pub mod errors;
pub mod messages;
pub mod retry;
pub mod review;
pub mod run;
pub mod secret_flow;
pub mod truncate;
pub mod types;
pub mod validation;

//! Run orchestration for LLM agents working on a code repository.
//!
//! Every agent run gets its own workspace directory, its own resolved backend,
//! and an audit trail of every shell command it issued. The crate keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure logic (backend resolution, retry classification,
//!   report validation, run and workflow state machines). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, subprocesses, HTTP,
//!   cloning). Isolated behind traits so tests can script them.
//!
//! Orchestration modules ([`analyze`], [`code`], [`secrets`]) coordinate the
//! two through the [`agent`] loop and the [`runtime`] services.

pub mod agent;
pub mod analyze;
pub mod code;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod runtime;
pub mod secrets;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

#![forbid(unsafe_code)]

//! # siemply
//!
//! The provisioning core of SIEMply. Encapsulates abstractions for things
//! like:
//!
//! - Resilient SSH connections and single-command execution with timeouts
//! - Idempotent, dry-runnable install procedures for log forwarders and
//!   stream-processing nodes
//! - Job lifecycle tracking and asynchronous dispatch
//!   - Every remote command line is built from quoted tokens, never from
//!     string interpolation.

pub mod audit;
pub mod config;
pub mod executor;
pub mod inventory;
pub mod job;
pub mod log;
pub mod plan;
pub mod procedure;
pub mod shell;

#[cfg(test)]
pub(crate) mod testing;

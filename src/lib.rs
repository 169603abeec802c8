//! Inspection of a live or captured Linux kernel through a memflow
//! connector.
//!
//! Kernel objects are located through a symbol table (`System.map` or the
//! `vmlinux` ELF) and decoded with a [`schema::TypeSchema`] describing the
//! inspected build. On top of that the crate provides a process snapshot
//! ([`report::SnapshotReporter`]) and a mutex owner/waiter report
//! ([`kernel::LockWaiterWalker`]).

pub mod config;
pub mod error;
pub mod kernel;
pub mod mem;
pub mod report;
pub mod schema;
pub mod session;
pub mod symbols;
pub mod units;

#[cfg(test)]
mod fixture;

pub use error::{KstateError, Result};
pub use mem::{KernelMemory, ViewMemory};
pub use schema::TypeSchema;
pub use session::{KernelSession, TypedValue};
pub use symbols::SymbolTable;

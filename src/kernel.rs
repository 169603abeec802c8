//! Readers for the kernel objects the tool reports on.

pub mod list;
pub mod mm;
pub mod mutex;
pub mod task;

pub use list::{default_walk_limit, walk_list, EmbeddedField, ListIter};
pub use mm::{CounterLayout, MemoryAccountant, MemoryMapping};
pub use mutex::{LockReport, LockWaiterWalker, MutexFlags, TaskBrief};
pub use task::{Task, TaskEnumerator, TaskLayout};

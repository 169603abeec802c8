//! Text rendering of the process table and of a lock report.

use std::io::{self, Write};

use memflow::prelude::v1::Address;

use log::*;

use crate::error::{KstateError, Result};
use crate::kernel::mm::{MemoryAccountant, MemoryMapping};
use crate::kernel::mutex::{LockReport, TaskBrief};
use crate::kernel::task::{Task, TaskEnumerator};
use crate::mem::KernelMemory;
use crate::session::KernelSession;
use crate::units::number_in_binary_units;

pub const SNAPSHOT_HEADER: &str = "PID     PPID    CPU  ST    VMS     RSS  MEM%  COMM";

/// Task selection flags of the `ps` view. They are carried through but not
/// applied yet: every snapshot lists all tasks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub kernel_only: bool,
    pub user_only: bool,
    pub active_only: bool,
    pub threads: Vec<i32>,
    pub children_of: Vec<i32>,
}

impl TaskFilter {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotRow {
    pub task: Task,
    /// `None` for kernel threads. Zeroed when accounting failed.
    pub mapping: Option<MemoryMapping>,
    pub mem_percent: f64,
}

impl SnapshotRow {
    pub fn render(&self) -> String {
        let mapping = self.mapping.unwrap_or_default();
        let comm = if self.task.is_kernel_thread() {
            format!("[{}]", self.task.comm)
        } else {
            self.task.comm.clone()
        };

        format!(
            "{:<7} {:<7} {:<4} {} {:>7} {:>7} {:5.1} {}",
            self.task.pid,
            self.task.ppid,
            self.task.cpu,
            self.task.state,
            number_in_binary_units(mapping.virtual_size),
            number_in_binary_units(mapping.resident_size),
            self.mem_percent,
            comm
        )
    }
}

/// Joins the task list with per-task memory accounting.
pub struct SnapshotReporter {
    enumerator: TaskEnumerator,
    accountant: MemoryAccountant,
}

impl SnapshotReporter {
    pub fn new<M: KernelMemory>(session: &mut KernelSession<M>, limit: usize) -> Result<Self> {
        Ok(Self {
            enumerator: TaskEnumerator::new(session, limit)?,
            accountant: MemoryAccountant::new(session)?,
        })
    }

    pub fn collect<M: KernelMemory>(&self, session: &mut KernelSession<M>) -> Result<Vec<SnapshotRow>> {
        let tasks = self.enumerator.tasks(session)?;
        let mut rows = Vec::with_capacity(tasks.len());

        for task in tasks {
            let mapping = match self.accountant.account(session, &task) {
                Ok(mapping) => mapping,
                Err(KstateError::UnsupportedCounterLayout) => {
                    debug!("pid {}: rss counters unsupported, reporting zero", task.pid);
                    Some(MemoryMapping::default())
                }
                Err(err) => {
                    warn!("pid {} ({}): memory accounting failed: {}", task.pid, task.comm, err);
                    Some(MemoryMapping::default())
                }
            };

            let mem_percent = mapping
                .as_ref()
                .map(|m| self.accountant.mem_percent(m))
                .unwrap_or(0.0);

            rows.push(SnapshotRow {
                task,
                mapping,
                mem_percent,
            });
        }

        Ok(rows)
    }
}

pub fn write_snapshot<W: Write>(out: &mut W, rows: &[SnapshotRow]) -> io::Result<()> {
    writeln!(out, "{}", SNAPSHOT_HEADER)?;
    for row in rows {
        writeln!(out, "{}", row.render())?;
    }
    Ok(())
}

fn hex(addr: Address) -> String {
    format!("0x{:x}", addr.to_umem())
}

fn write_task_line<W: Write>(out: &mut W, task: &TaskBrief) -> io::Result<()> {
    write!(
        out,
        "PID: {}  TASK: {}  CPU: {}  COMMAND: {}",
        task.pid,
        hex(task.address),
        task.cpu,
        task.comm
    )
}

pub fn write_lock_report<W: Write>(out: &mut W, report: &LockReport) -> io::Result<()> {
    writeln!(out, "Current task with an active lock:")?;
    match &report.owner {
        Some(owner) => {
            write_task_line(out, owner)?;
            writeln!(out, "  FLAGS: {:#x}", report.flags.bits())?;
        }
        None => writeln!(out, "No current owner")?,
    }

    writeln!(out)?;
    writeln!(out, "List of waiters for {}:", report.name)?;

    if report.waiters.is_empty() {
        writeln!(out, "No waiters")?;
    }
    for waiter in &report.waiters {
        write_task_line(out, waiter)?;
        writeln!(out)?;
    }

    Ok(())
}

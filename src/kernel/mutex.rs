//! Owner and waiters of a `struct mutex`.
//!
//! `mutex.owner` packs the owning `task_struct *` together with three state
//! flags in its low bits. The waiters are `struct mutex_waiter` records linked
//! through their embedded `list` member into `mutex.wait_list`.

use memflow::prelude::v1::{Address, umem};

use log::*;

use crate::error::Result;
use crate::kernel::list::{walk_list, EmbeddedField};
use crate::kernel::task::TaskLayout;
use crate::mem::KernelMemory;
use crate::session::{KernelSession, TypedValue};

pub const MUTEX_FLAG_WAITERS: u64 = 0x01;
pub const MUTEX_FLAG_HANDOFF: u64 = 0x02;
pub const MUTEX_FLAG_PICKUP: u64 = 0x04;
pub const MUTEX_FLAGS: u64 = 0x07;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MutexFlags(u64);

impl MutexFlags {
    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn has_waiters(self) -> bool {
        self.0 & MUTEX_FLAG_WAITERS != 0
    }

    pub fn handoff(self) -> bool {
        self.0 & MUTEX_FLAG_HANDOFF != 0
    }

    pub fn pickup(self) -> bool {
        self.0 & MUTEX_FLAG_PICKUP != 0
    }
}

/// Splits an owner word into the owning task, if any, and the lock flags.
pub fn decode_owner(owner: u64) -> (Option<Address>, MutexFlags) {
    let task = owner & !MUTEX_FLAGS;
    let flags = MutexFlags(owner & MUTEX_FLAGS);

    if task == 0 {
        (None, flags)
    } else {
        (Some(Address::from(task as umem)), flags)
    }
}

/// The identifying bits of a task as printed in the lock report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskBrief {
    pub pid: i32,
    pub address: Address,
    pub cpu: u32,
    pub comm: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockReport {
    pub name: String,
    pub owner: Option<TaskBrief>,
    pub flags: MutexFlags,
    pub waiters: Vec<TaskBrief>,
}

pub struct LockWaiterWalker {
    tasks: TaskLayout,
    waiter_list: EmbeddedField,
    limit: usize,
}

impl LockWaiterWalker {
    pub fn new<M: KernelMemory>(session: &KernelSession<M>, limit: usize) -> Result<Self> {
        let schema = session.schema();

        schema.require_field("mutex", "owner")?;
        schema.require_field("mutex", "wait_list")?;
        schema.require_field("mutex_waiter", "task")?;

        Ok(Self {
            tasks: TaskLayout::probe(schema)?,
            waiter_list: EmbeddedField::resolve(schema, "mutex_waiter", "list")?,
            limit,
        })
    }

    fn brief<M: KernelMemory>(&self, session: &mut KernelSession<M>, address: Address) -> Result<TaskBrief> {
        let task = TypedValue::of_struct(address, "task_struct");
        Ok(TaskBrief {
            pid: self.tasks.pid(session, &task)?,
            address,
            cpu: self.tasks.cpu(session, &task)?,
            comm: self.tasks.comm(session, &task)?,
        })
    }

    /// Current owner of the mutex and its flags. An unheld mutex has no
    /// owner and nothing is dereferenced.
    pub fn owner<M: KernelMemory>(
        &self,
        session: &mut KernelSession<M>,
        mutex: &TypedValue,
    ) -> Result<(Option<TaskBrief>, MutexFlags)> {
        let owner = session.field(mutex, "owner")?;
        let (task, flags) = decode_owner(session.read_unsigned(&owner)?);

        debug!("mutex at {:x}: owner {:x?}, flags {:#x}", mutex.address, task, flags.bits());

        let owner = match task {
            Some(task) => Some(self.brief(session, task)?),
            None => None,
        };

        Ok((owner, flags))
    }

    /// Tasks queued on the mutex, in wait list order.
    pub fn waiters<M: KernelMemory>(
        &self,
        session: &mut KernelSession<M>,
        mutex: &TypedValue,
    ) -> Result<Vec<TaskBrief>> {
        let head = session.field(mutex, "wait_list")?;
        let nodes = walk_list(session, "mutex.wait_list", head.address, self.limit)?;

        let mut waiters = Vec::with_capacity(nodes.len());
        for node in nodes {
            let waiter = self.waiter_list.container_of(node);
            let task = session.field(&waiter, "task")?;
            let task = session.read_pointer(&task)?;
            trace!("waiter {:x} -> task {:x}", waiter.address, task);
            waiters.push(self.brief(session, task)?);
        }

        Ok(waiters)
    }

    pub fn inspect<M: KernelMemory>(
        &self,
        session: &mut KernelSession<M>,
        name: &str,
        mutex: &TypedValue,
    ) -> Result<LockReport> {
        let (owner, flags) = self.owner(session, mutex)?;
        let waiters = self.waiters(session, mutex)?;

        if owner.is_none() && !waiters.is_empty() {
            debug!("{} has {} waiters but no owner", name, waiters.len());
        }

        Ok(LockReport {
            name: name.to_string(),
            owner,
            flags,
            waiters,
        })
    }

    /// Inspects the mutex behind the global symbol `name`.
    pub fn inspect_global<M: KernelMemory>(
        &self,
        session: &mut KernelSession<M>,
        name: &str,
    ) -> Result<LockReport> {
        let mutex = session.resolve_global(name)?;
        self.inspect(session, name, &mutex)
    }
}

use memflow::prelude::v1::Address;

use log::*;

use crate::error::{KstateError, Result};
use crate::kernel::list::{walk_list, EmbeddedField};
use crate::mem::KernelMemory;
use crate::schema::TypeSchema;
use crate::session::{KernelSession, TypedValue};

/// `TASK_INTERRUPTIBLE | TASK_UNINTERRUPTIBLE | __TASK_STOPPED |
/// __TASK_TRACED | EXIT_DEAD | EXIT_ZOMBIE | TASK_PARKED`
pub const TASK_REPORT: u64 = 0x7f;
pub const TASK_UNINTERRUPTIBLE: u64 = 0x2;
/// `TASK_UNINTERRUPTIBLE | TASK_NOLOAD`
pub const TASK_IDLE: u64 = 0x402;
/// Sleeping on an rtmutex-based spinlock (PREEMPT_RT).
pub const TASK_RTLOCK_WAIT: u64 = 0x1000;
const TASK_REPORT_IDLE_INDEX: usize = 8;
const TASK_STATE_CHARS: &[u8; 9] = b"RSDTtXZPI";

/// Placeholder letter for a task whose state could not be read.
pub const UNKNOWN_STATE: char = '?';

/// Maps raw `__state`/`exit_state` words to the `ps` state letter, the same
/// way `__task_state_index()` does.
pub fn task_state_to_char(task_state: u64, exit_state: u64) -> char {
    let idx = if task_state & TASK_IDLE == TASK_IDLE {
        TASK_REPORT_IDLE_INDEX
    } else if task_state == TASK_RTLOCK_WAIT {
        fls(TASK_UNINTERRUPTIBLE)
    } else {
        fls((task_state | exit_state) & TASK_REPORT)
    };
    TASK_STATE_CHARS[idx] as char
}

fn fls(x: u64) -> usize {
    (64 - x.leading_zeros()) as usize
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuLocation {
    /// `task_struct.cpu`, `CONFIG_THREAD_INFO_IN_TASK` kernels.
    Task,
    /// `task_struct.thread_info.cpu`
    ThreadInfo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadLinkage {
    /// Threads share the `task_struct.thread_group` ring (before 6.7).
    ThreadGroup,
    /// `signal_struct.thread_head` anchors `task_struct.thread_node`.
    SignalThreadHead,
    /// Neither member exists; only thread group leaders are listed.
    LeadersOnly,
}

/// `task_struct` members that moved between kernel versions, probed once.
#[derive(Clone, Debug)]
pub struct TaskLayout {
    state_field: &'static str,
    has_exit_state: bool,
    parent_field: &'static str,
    cpu: CpuLocation,
    threads: ThreadLinkage,
    tasks: EmbeddedField,
}

impl TaskLayout {
    pub fn probe(schema: &TypeSchema) -> Result<Self> {
        for field in &["pid", "comm", "mm"] {
            schema.require_field("task_struct", field)?;
        }

        let has = |field| schema.has_field("task_struct", field);

        let state_field = if has("__state") {
            "__state"
        } else if has("state") {
            "state"
        } else {
            return Err(KstateError::unavailable("task_struct has neither __state nor state"));
        };

        // `parent` is the tracer while a task is ptraced, as ps reports it
        let parent_field = if has("parent") {
            "parent"
        } else if has("real_parent") {
            "real_parent"
        } else {
            return Err(KstateError::unavailable("task_struct has no parent member"));
        };

        let cpu = if has("cpu") {
            CpuLocation::Task
        } else if has("thread_info") && schema.has_field("thread_info", "cpu") {
            CpuLocation::ThreadInfo
        } else {
            return Err(KstateError::unavailable("cannot locate the cpu of a task"));
        };

        let threads = if has("thread_group") {
            ThreadLinkage::ThreadGroup
        } else if has("thread_node") && has("signal") && schema.has_field("signal_struct", "thread_head") {
            ThreadLinkage::SignalThreadHead
        } else {
            ThreadLinkage::LeadersOnly
        };

        let layout = Self {
            state_field,
            has_exit_state: has("exit_state"),
            parent_field,
            cpu,
            threads,
            tasks: EmbeddedField::resolve(schema, "task_struct", "tasks")?,
        };

        debug!("{:?}", layout);

        Ok(layout)
    }

    pub fn cpu_location(&self) -> CpuLocation {
        self.cpu
    }

    pub fn thread_linkage(&self) -> ThreadLinkage {
        self.threads
    }

    pub fn state_char<M: KernelMemory>(
        &self,
        session: &mut KernelSession<M>,
        task: &TypedValue,
    ) -> Result<char> {
        let state = session.field(task, self.state_field)?;
        let state = session.read_unsigned(&state)?;

        let exit_state = if self.has_exit_state {
            let exit_state = session.field(task, "exit_state")?;
            session.read_unsigned(&exit_state)?
        } else {
            0
        };

        Ok(task_state_to_char(state, exit_state))
    }

    pub fn cpu<M: KernelMemory>(&self, session: &mut KernelSession<M>, task: &TypedValue) -> Result<u32> {
        let cpu = match self.cpu {
            CpuLocation::Task => session.field(task, "cpu")?,
            CpuLocation::ThreadInfo => {
                let thread_info = session.field(task, "thread_info")?;
                session.field(&thread_info, "cpu")?
            }
        };
        Ok(session.read_unsigned(&cpu)? as u32)
    }

    pub fn pid<M: KernelMemory>(&self, session: &mut KernelSession<M>, task: &TypedValue) -> Result<i32> {
        let pid = session.field(task, "pid")?;
        Ok(session.read_signed(&pid)? as i32)
    }

    pub fn comm<M: KernelMemory>(&self, session: &mut KernelSession<M>, task: &TypedValue) -> Result<String> {
        let comm = session.field(task, "comm")?;
        session.read_c_string(&comm)
    }

    fn ppid<M: KernelMemory>(&self, session: &mut KernelSession<M>, task: &TypedValue) -> Result<i32> {
        let parent = session.field(task, self.parent_field)?;
        let parent = session.read_pointer(&parent)?;
        if parent.is_null() {
            return Ok(0);
        }
        self.pid(session, &TypedValue::of_struct(parent, "task_struct"))
    }

    /// Reads one task. The members are read one by one from live memory and
    /// may not be mutually consistent.
    ///
    /// Only the pid and `mm` are required. An unreadable parent, cpu, state
    /// or name is logged and replaced by a placeholder.
    pub fn read_task<M: KernelMemory>(&self, session: &mut KernelSession<M>, address: Address) -> Result<Task> {
        let task = TypedValue::of_struct(address, "task_struct");

        let pid = self.pid(session, &task)?;
        let mm = session.field(&task, "mm")?;
        let mm = session.read_pointer(&mm)?;

        let ppid = self.ppid(session, &task);
        let cpu = self.cpu(session, &task);
        let state = self.state_char(session, &task);
        let comm = self.comm(session, &task);

        Ok(Task {
            address,
            pid,
            ppid: placeholder(pid, "parent", ppid, 0)?,
            cpu: placeholder(pid, "cpu", cpu, 0)?,
            state: placeholder(pid, "state", state, UNKNOWN_STATE)?,
            comm: placeholder(pid, "comm", comm, String::new())?,
            mm: if mm.is_null() { None } else { Some(mm) },
        })
    }
}

/// Replaces a failed memory read of one task member. Schema errors still
/// propagate.
fn placeholder<T>(pid: i32, member: &str, value: Result<T>, fallback: T) -> Result<T> {
    match value {
        Err(KstateError::Memory(err)) => {
            warn!("pid {}: {} unreadable ({}), using a placeholder", pid, member, err);
            Ok(fallback)
        }
        other => other,
    }
}

/// A snapshot of one `task_struct`.
#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    pub address: Address,
    pub pid: i32,
    pub ppid: i32,
    pub cpu: u32,
    pub state: char,
    pub comm: String,
    /// `task->mm`, absent for kernel threads.
    pub mm: Option<Address>,
}

impl Task {
    pub fn is_kernel_thread(&self) -> bool {
        self.mm.is_none()
    }
}

pub struct TaskEnumerator {
    layout: TaskLayout,
    limit: usize,
}

impl TaskEnumerator {
    pub fn new<M: KernelMemory>(session: &KernelSession<M>, limit: usize) -> Result<Self> {
        Ok(Self {
            layout: TaskLayout::probe(session.schema())?,
            limit,
        })
    }

    pub fn layout(&self) -> &TaskLayout {
        &self.layout
    }

    /// Addresses of every thread reachable from `init_task.tasks`, in list
    /// order. `init_task` itself is the list head and is not included.
    pub fn task_addresses<M: KernelMemory>(&self, session: &mut KernelSession<M>) -> Result<Vec<Address>> {
        let init_task = session.resolve_global("init_task")?;
        let head = self.layout.tasks.member_of(init_task.address);

        let leaders = walk_list(session, "init_task.tasks", head, self.limit).map_err(|err| match err {
            KstateError::Memory(err) => KstateError::unavailable(format!("task list: {}", err)),
            other => other,
        })?;

        let mut tasks = Vec::with_capacity(leaders.len());

        for node in leaders {
            let leader = self.layout.tasks.container_of(node).address;
            tasks.push(leader);
            self.push_threads(session, leader, &mut tasks)?;
        }

        Ok(tasks)
    }

    fn push_threads<M: KernelMemory>(
        &self,
        session: &mut KernelSession<M>,
        leader: Address,
        out: &mut Vec<Address>,
    ) -> Result<()> {
        match self.layout.threads {
            ThreadLinkage::ThreadGroup => {
                let link = EmbeddedField::resolve(session.schema(), "task_struct", "thread_group")?;
                // the ring has no separate head, the leader's own node serves as one
                let nodes = walk_list(session, "thread_group", link.member_of(leader), self.limit)?;
                out.extend(nodes.into_iter().map(|n| link.container_of(n).address));
            }
            ThreadLinkage::SignalThreadHead => {
                let link = EmbeddedField::resolve(session.schema(), "task_struct", "thread_node")?;
                let task = TypedValue::of_struct(leader, "task_struct");
                let signal = session.field(&task, "signal")?;
                if session.read_pointer(&signal)?.is_null() {
                    return Ok(());
                }
                let head = session.field(&signal, "thread_head")?;
                let nodes = walk_list(session, "signal.thread_head", head.address, self.limit)?;
                out.extend(
                    nodes
                        .into_iter()
                        .map(|n| link.container_of(n).address)
                        .filter(|&t| t != leader),
                );
            }
            ThreadLinkage::LeadersOnly => {}
        }
        Ok(())
    }

    /// Every task, ascending by pid.
    pub fn tasks<M: KernelMemory>(&self, session: &mut KernelSession<M>) -> Result<Vec<Task>> {
        let addresses = self.task_addresses(session)?;

        let mut tasks = Vec::with_capacity(addresses.len());
        for addr in addresses {
            match self.layout.read_task(session, addr) {
                Ok(task) => tasks.push(task),
                // freed while the list was walked
                Err(KstateError::Memory(err)) => {
                    warn!("task at {:x} is unreadable, skipping: {}", addr, err)
                }
                Err(err) => return Err(err),
            }
        }

        tasks.sort_by_key(|t| t.pid);

        let before = tasks.len();
        tasks.dedup_by_key(|t| t.pid);
        if tasks.len() != before {
            debug!("dropped {} duplicate pids", before - tasks.len());
        }

        info!("enumerated {} tasks", tasks.len());

        Ok(tasks)
    }
}

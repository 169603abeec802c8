//! Synthetic kernels for tests.
//!
//! A [`FixtureKernel`] owns a flat region of fake kernel memory, a schema in
//! either the current (percpu_counter, `__state`, `thread_node`) or the
//! legacy (`mm_rss_stat`, `state`, `thread_group`) shape, and a symbol table.

use memflow::prelude::v1::*;

use std::collections::BTreeMap;

use crate::mem::KernelMemory;
use crate::schema::{Constants, FieldType, TypeSchema};
use crate::session::KernelSession;
use crate::symbols::SymbolTable;

pub const BASE: u64 = 0xffff_8880_0000_0000;
const SIZE: usize = 1 << 20;
pub const NR_CPUS: u64 = 2;
const PERCPU_UNIT: u64 = 0x1000;
const UNMAPPED: u64 = 0xffff_dead_0000_0000;

const TASK_SIZE: usize = 0x70;
const TASK_STATE: usize = 0x00;
const TASK_EXIT_STATE: usize = 0x08;
const TASK_CPU: usize = 0x0c;
const TASK_THREAD_INFO: usize = 0x10;
const TASK_TASKS: usize = 0x20;
const TASK_MM: usize = 0x30;
const TASK_PID: usize = 0x38;
const TASK_TGID: usize = 0x3c;
const TASK_PARENT: usize = 0x40;
const TASK_THREADS: usize = 0x48;
const TASK_SIGNAL: usize = 0x58;
const TASK_COMM: usize = 0x60;

const SIGNAL_THREAD_HEAD: usize = 0x10;
const MM_TOTAL_VM: usize = 0x08;
const MM_RSS_STAT: usize = 0x40;
const PERCPU_COUNTER_SIZE: usize = 0x28;
const MUTEX_OWNER: usize = 0x00;
const MUTEX_WAIT_LIST: usize = 0x10;
const WAITER_TASK: usize = 0x00;
const WAITER_LIST: usize = 0x08;

pub struct FixtureMemory {
    base: u64,
    data: Vec<u8>,
}

impl FixtureMemory {
    fn range(&self, addr: Address, len: usize) -> Option<std::ops::Range<usize>> {
        let start = (addr.to_umem() as u64).checked_sub(self.base)? as usize;
        let end = start.checked_add(len)?;
        if end <= self.data.len() {
            Some(start..end)
        } else {
            None
        }
    }
}

impl KernelMemory for FixtureMemory {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        let range = self
            .range(addr, out.len())
            .ok_or(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound))?;
        out.copy_from_slice(&self.data[range]);
        Ok(())
    }
}

pub struct FixtureKernel {
    mem: FixtureMemory,
    next: u64,
    percpu_next: u64,
    percpu_end: u64,
    schema: TypeSchema,
    symbols: SymbolTable,
    legacy: bool,
    init_task: Address,
    totalram: Address,
    leaders: Vec<Address>,
    threads: BTreeMap<Address, Vec<Address>>,
    waiters: BTreeMap<Address, Vec<Address>>,
}

impl FixtureKernel {
    /// Current kernel shape (6.7+).
    pub fn structured() -> Self {
        Self::new(false)
    }

    /// Pre-5.14 kernel shape.
    pub fn legacy() -> Self {
        Self::new(true)
    }

    fn new(legacy: bool) -> Self {
        let mut k = Self {
            mem: FixtureMemory {
                base: BASE,
                data: vec![0; SIZE],
            },
            next: BASE + 0x1000,
            percpu_next: 0,
            percpu_end: 0,
            schema: build_schema(legacy),
            symbols: SymbolTable::new(),
            legacy,
            init_task: Address::NULL,
            totalram: Address::NULL,
            leaders: vec![],
            threads: BTreeMap::new(),
            waiters: BTreeMap::new(),
        };

        let chunk = k.alloc((NR_CPUS * PERCPU_UNIT) as usize).to_umem() as u64;
        k.percpu_next = chunk;
        k.percpu_end = chunk + PERCPU_UNIT;

        let offsets = k.alloc(8 * 8);
        for cpu in 0..NR_CPUS {
            k.write_u64(offsets + cpu as usize * 8, cpu * PERCPU_UNIT);
        }
        k.add_symbol("__per_cpu_offset", offsets);

        let nr_cpu_ids = k.alloc(4);
        k.write_u32(nr_cpu_ids, NR_CPUS as u32);
        k.add_symbol("nr_cpu_ids", nr_cpu_ids);

        k.totalram = k.alloc(8);
        k.write_u64(k.totalram, 1 << 18);
        let totalram_name = if legacy {
            "totalram_pages"
        } else {
            "_totalram_pages"
        };
        k.add_symbol(totalram_name, k.totalram);

        k.init_task = k.alloc(TASK_SIZE);
        k.write_task(k.init_task, 0, "swapper/0", Address::NULL, 0, 0, None);
        k.link_list(k.init_task + TASK_TASKS, &[]);
        k.add_symbol("init_task", k.init_task);

        k
    }

    pub fn schema(&self) -> &TypeSchema {
        &self.schema
    }

    pub fn init_task(&self) -> Address {
        self.init_task
    }

    pub fn open(self) -> KernelSession<FixtureMemory> {
        KernelSession::open(self.mem, self.schema, self.symbols).expect("fixture session")
    }

    pub fn alloc(&mut self, size: usize) -> Address {
        let addr = (self.next + 15) & !15;
        self.next = addr + size as u64;
        assert!(self.next <= BASE + SIZE as u64, "fixture memory exhausted");
        Address::from(addr)
    }

    fn alloc_percpu(&mut self, size: u64) -> u64 {
        let addr = self.percpu_next;
        self.percpu_next += (size + 7) & !7;
        assert!(self.percpu_next <= self.percpu_end, "fixture percpu area exhausted");
        addr
    }

    fn add_symbol(&mut self, name: &str, addr: Address) {
        self.symbols.insert(name, addr);
    }

    pub fn write_bytes(&mut self, addr: Address, bytes: &[u8]) {
        let range = self.mem.range(addr, bytes.len()).expect("fixture write out of range");
        self.mem.data[range].copy_from_slice(bytes);
    }

    pub fn write_u64(&mut self, addr: Address, value: u64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, addr: Address, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_i32(&mut self, addr: Address, value: i32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    fn read_u64(&mut self, addr: Address) -> u64 {
        self.mem.read_u64(addr).expect("fixture read out of range")
    }

    /// Links `head` and `nodes` into one circular `list_head` ring.
    pub fn link_list(&mut self, head: Address, nodes: &[Address]) {
        let mut ring = vec![head];
        ring.extend_from_slice(nodes);
        let n = ring.len();

        for i in 0..n {
            let next = ring[(i + 1) % n];
            let prev = ring[(i + n - 1) % n];
            self.write_u64(ring[i], next.to_umem() as u64);
            self.write_u64(ring[i] + 8, prev.to_umem() as u64);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write_task(
        &mut self,
        task: Address,
        pid: i32,
        comm: &str,
        parent: Address,
        state: u64,
        cpu: u32,
        mm: Option<Address>,
    ) {
        if self.legacy {
            self.write_u64(task + TASK_STATE, state);
            self.write_u32(task + TASK_THREAD_INFO + 8, cpu);
        } else {
            self.write_u32(task + TASK_STATE, state as u32);
            self.write_u32(task + TASK_CPU, cpu);
        }
        self.write_i32(task + TASK_EXIT_STATE, 0);
        self.write_i32(task + TASK_PID, pid);
        self.write_i32(task + TASK_TGID, pid);
        self.write_u64(task + TASK_PARENT, parent.to_umem() as u64);
        self.write_u64(task + TASK_MM, mm.map(|a| a.to_umem() as u64).unwrap_or(0));

        let mut name = [0u8; 16];
        let len = comm.len().min(15);
        name[..len].copy_from_slice(&comm.as_bytes()[..len]);
        self.write_bytes(task + TASK_COMM, &name);
    }

    /// Adds a thread group leader to `init_task.tasks`.
    pub fn add_task(
        &mut self,
        pid: i32,
        comm: &str,
        parent: Address,
        state: u64,
        cpu: u32,
        mm: Option<Address>,
    ) -> Address {
        let task = self.alloc(TASK_SIZE);
        self.write_task(task, pid, comm, parent, state, cpu, mm);

        if self.legacy {
            self.link_list(task + TASK_THREADS, &[]);
        } else {
            let signal = self.alloc(0x20);
            self.write_u64(task + TASK_SIGNAL, signal.to_umem() as u64);
            self.link_list(signal + SIGNAL_THREAD_HEAD, &[task + TASK_THREADS]);
        }

        self.leaders.push(task);
        let nodes: Vec<_> = self.leaders.iter().map(|t| *t + TASK_TASKS).collect();
        self.link_list(self.init_task + TASK_TASKS, &nodes);

        task
    }

    /// Adds a non-leader thread sharing `leader`'s mm and parent.
    pub fn add_thread(&mut self, leader: Address, pid: i32, comm: &str, state: u64, cpu: u32) -> Address {
        let parent = Address::from(self.read_u64(leader + TASK_PARENT));
        let mm = match self.read_u64(leader + TASK_MM) {
            0 => None,
            mm => Some(Address::from(mm)),
        };

        let task = self.alloc(TASK_SIZE);
        self.write_task(task, pid, comm, parent, state, cpu, mm);

        let threads = self.threads.entry(leader).or_default();
        threads.push(task);
        let mut nodes: Vec<_> = threads.iter().map(|t| *t + TASK_THREADS).collect();

        if self.legacy {
            // the leader's own node closes the ring
            self.link_list(leader + TASK_THREADS, &nodes);
        } else {
            let signal = Address::from(self.read_u64(leader + TASK_SIGNAL));
            self.write_u64(task + TASK_SIGNAL, signal.to_umem() as u64);
            nodes.insert(0, leader + TASK_THREADS);
            self.link_list(signal + SIGNAL_THREAD_HEAD, &nodes);
        }

        task
    }

    /// Allocates an `mm_struct` with `rss` pages in the four RSS counters.
    /// Per-CPU counters carry deltas of +3 and -1 on top of the shared count.
    pub fn add_mm(&mut self, total_vm: u64, rss: [i64; 4]) -> Address {
        let mm = self.alloc(0x100);
        self.write_u64(mm + MM_TOTAL_VM, total_vm);

        for (i, pages) in rss.iter().enumerate() {
            if self.legacy {
                self.write_u64(mm + MM_RSS_STAT + i * 8, *pages as u64);
            } else {
                let counter = mm + MM_RSS_STAT + i * PERCPU_COUNTER_SIZE;
                let percpu = self.alloc_percpu(4);
                self.write_u64(counter + 0x08, (*pages - 2) as u64);
                self.write_u64(counter + 0x20, percpu);
                self.write_i32(Address::from(percpu), 3);
                self.write_i32(Address::from(percpu + PERCPU_UNIT), -1);
            }
        }

        mm
    }

    /// Drops the per-CPU part of every RSS counter of `mm`, as a counter
    /// that was never allocated.
    pub fn clear_percpu_counters(&mut self, mm: Address) {
        if !self.legacy {
            for i in 0..4 {
                let counter = mm + MM_RSS_STAT + i * PERCPU_COUNTER_SIZE;
                self.write_u64(counter + 0x20, 0);
            }
        }
    }

    pub fn set_nr_cpu_ids(&mut self, n: u32) {
        let addr = self.symbols.lookup("nr_cpu_ids").expect("nr_cpu_ids");
        self.write_u32(addr, n);
    }

    /// Points the parent of `task` at unmapped memory, as left behind by a
    /// parent that exited while the list was walked.
    pub fn dangle_parent(&mut self, task: Address) {
        self.write_u64(task + TASK_PARENT, UNMAPPED);
    }

    pub fn set_totalram_pages(&mut self, pages: u64) {
        let addr = self.totalram;
        self.write_u64(addr, pages);
    }

    pub fn set_nr_threads(&mut self, n: i32) {
        let addr = self.alloc(4);
        self.write_i32(addr, n);
        self.add_symbol("nr_threads", addr);
        self.schema.insert_global("nr_threads", "i32".parse().expect("type"));
    }

    /// Points `name` at unmapped memory.
    pub fn break_symbol(&mut self, name: &str) {
        self.add_symbol(name, Address::from(UNMAPPED));
    }

    /// Replaces `mm_struct` with one whose RSS counters match no known shape.
    pub fn drop_rss_stat(&mut self) {
        self.schema
            .insert_struct("mm_struct", 0x100, &[("total_vm", MM_TOTAL_VM, "u64")]);
    }

    /// Adds the global mutex `name` with the given owner word and waiters.
    pub fn add_mutex(&mut self, name: &str, owner: u64, waiters: &[Address]) -> Address {
        let mutex = self.alloc(0x20);
        self.write_u64(mutex + MUTEX_OWNER, owner);

        let mut nodes = Vec::with_capacity(waiters.len());
        for task in waiters {
            let waiter = self.alloc(0x20);
            self.write_u64(waiter + WAITER_TASK, task.to_umem() as u64);
            nodes.push(waiter + WAITER_LIST);
        }
        self.link_list(mutex + MUTEX_WAIT_LIST, &nodes);

        self.add_symbol(name, mutex);
        self.schema
            .insert_global(name, FieldType::Struct("mutex".into()));
        self.waiters.insert(mutex, nodes);

        mutex
    }

    /// `mutex_waiter.list` nodes of a mutex added with [`FixtureKernel::add_mutex`].
    pub fn waiter_nodes(&self, mutex: Address) -> Vec<Address> {
        self.waiters.get(&mutex).cloned().unwrap_or_default()
    }
}

fn build_schema(legacy: bool) -> TypeSchema {
    let mut schema = TypeSchema::new(Constants { page_size: 4096 })
        .with_struct("list_head", 16, &[("next", 0, "ptr list_head"), ("prev", 8, "ptr list_head")])
        .with_struct("atomic_long_t", 8, &[("counter", 0, "i64")])
        .with_struct("signal_struct", 0x20, &[("thread_head", SIGNAL_THREAD_HEAD, "list_head")])
        .with_struct(
            "mutex",
            0x20,
            &[
                ("owner", MUTEX_OWNER, "atomic_long_t"),
                ("wait_lock", 0x08, "u32"),
                ("wait_list", MUTEX_WAIT_LIST, "list_head"),
            ],
        )
        .with_struct(
            "mutex_waiter",
            0x20,
            &[
                ("task", WAITER_TASK, "ptr task_struct"),
                ("list", WAITER_LIST, "list_head"),
                ("ww_ctx", 0x18, "ptr u8"),
            ],
        )
        .with_global("init_task", "task_struct")
        .with_global("nr_cpu_ids", "u32")
        .with_global("__per_cpu_offset", "u64[8]");

    let mut task_fields = vec![
        ("exit_state", TASK_EXIT_STATE, "i32"),
        ("tasks", TASK_TASKS, "list_head"),
        ("mm", TASK_MM, "ptr mm_struct"),
        ("pid", TASK_PID, "i32"),
        ("tgid", TASK_TGID, "i32"),
        ("comm", TASK_COMM, "char[16]"),
    ];

    if legacy {
        task_fields.extend_from_slice(&[
            ("state", TASK_STATE, "i64"),
            ("thread_info", TASK_THREAD_INFO, "thread_info"),
            ("parent", TASK_PARENT, "ptr task_struct"),
            ("thread_group", TASK_THREADS, "list_head"),
        ]);
        schema.insert_struct("thread_info", 16, &[("flags", 0, "u64"), ("cpu", 8, "u32")]);
        schema.insert_struct("mm_rss_stat", 32, &[("count", 0, "atomic_long_t[4]")]);
        schema.insert_struct(
            "mm_struct",
            0x100,
            &[("total_vm", MM_TOTAL_VM, "u64"), ("rss_stat", MM_RSS_STAT, "mm_rss_stat")],
        );
        schema.insert_global("totalram_pages", "u64".parse().expect("type"));
    } else {
        task_fields.extend_from_slice(&[
            ("__state", TASK_STATE, "u32"),
            ("cpu", TASK_CPU, "u32"),
            ("real_parent", TASK_PARENT, "ptr task_struct"),
            ("thread_node", TASK_THREADS, "list_head"),
            ("signal", TASK_SIGNAL, "ptr signal_struct"),
        ]);
        schema.insert_struct(
            "percpu_counter",
            PERCPU_COUNTER_SIZE,
            &[
                ("lock", 0x00, "u32"),
                ("count", 0x08, "i64"),
                ("list", 0x10, "list_head"),
                ("counters", 0x20, "ptr i32"),
            ],
        );
        schema.insert_struct(
            "mm_struct",
            0x100,
            &[
                ("total_vm", MM_TOTAL_VM, "u64"),
                ("rss_stat", MM_RSS_STAT, "percpu_counter[4]"),
            ],
        );
        schema.insert_global("_totalram_pages", FieldType::Struct("atomic_long_t".into()));
    }

    schema.insert_struct("task_struct", TASK_SIZE, &task_fields);
    schema
}

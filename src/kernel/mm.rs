use log::*;

use crate::error::{KstateError, Result};
use crate::kernel::task::Task;
use crate::mem::KernelMemory;
use crate::schema::{FieldType, TypeSchema};
use crate::session::{KernelSession, TypedValue};

pub const MM_FILEPAGES: usize = 0;
pub const MM_ANONPAGES: usize = 1;
pub const MM_SWAPENTS: usize = 2;
pub const MM_SHMEMPAGES: usize = 3;

/// Counters that make up the resident set. Swap entries are not resident.
pub const RSS_COUNTERS: [usize; 3] = [MM_FILEPAGES, MM_ANONPAGES, MM_SHMEMPAGES];

/// Shape of `mm_struct.rss_stat`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterLayout {
    /// `struct mm_rss_stat { atomic_long_t count[NR_MM_COUNTERS]; }`
    Legacy,
    /// `struct percpu_counter rss_stat[NR_MM_COUNTERS]` (6.2+)
    Structured,
}

impl CounterLayout {
    pub fn probe(schema: &TypeSchema) -> Result<Self> {
        let rss_stat = schema
            .field_type("mm_struct", "rss_stat")
            .ok_or(KstateError::UnsupportedCounterLayout)?;

        match rss_stat {
            FieldType::Array(elem, len) if *len > MM_SHMEMPAGES => {
                let counter = elem.struct_name().unwrap_or_default();
                if schema.has_field(counter, "count") && schema.has_field(counter, "counters") {
                    return Ok(CounterLayout::Structured);
                }
            }
            FieldType::Struct(name) => {
                if let Some(FieldType::Array(_, len)) = schema.field_type(name, "count") {
                    if *len > MM_SHMEMPAGES {
                        return Ok(CounterLayout::Legacy);
                    }
                }
            }
            _ => {}
        }

        Err(KstateError::UnsupportedCounterLayout)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryMapping {
    pub virtual_size: u64,
    pub resident_size: u64,
}

/// Computes VMS/RSS for tasks. The counter layout and the amount of RAM are
/// determined once, when the accountant is created.
pub struct MemoryAccountant {
    layout: Option<CounterLayout>,
    page_size: u64,
    total_ram: u64,
}

impl MemoryAccountant {
    pub fn new<M: KernelMemory>(session: &mut KernelSession<M>) -> Result<Self> {
        let layout = match CounterLayout::probe(session.schema()) {
            Ok(layout) => {
                debug!("rss counter layout: {:?}", layout);
                Some(layout)
            }
            Err(err) => {
                warn!("{}, user task memory will be reported as zero", err);
                None
            }
        };

        let page_size = session.page_size();
        let pages = totalram_pages(session)?;
        let total_ram = pages
            .checked_mul(page_size)
            .ok_or(KstateError::Implausible {
                what: "totalram_pages",
                value: pages,
            })?;

        info!("total ram: {} bytes", total_ram);

        Ok(Self {
            layout,
            page_size,
            total_ram,
        })
    }

    pub fn layout(&self) -> Option<CounterLayout> {
        self.layout
    }

    pub fn total_ram(&self) -> u64 {
        self.total_ram
    }

    /// `None` for kernel threads.
    pub fn account<M: KernelMemory>(
        &self,
        session: &mut KernelSession<M>,
        task: &Task,
    ) -> Result<Option<MemoryMapping>> {
        let mm = match task.mm {
            Some(mm) => TypedValue::of_struct(mm, "mm_struct"),
            None => return Ok(None),
        };

        let layout = self.layout.ok_or(KstateError::UnsupportedCounterLayout)?;

        let total_vm = session.field(&mm, "total_vm")?;
        let total_vm = session.read_unsigned(&total_vm)?;
        let virtual_size = self.pages_to_bytes("total_vm", total_vm)?;

        let rss_stat = session.field(&mm, "rss_stat")?;
        let pages = match layout {
            CounterLayout::Structured => {
                let mut sum = 0i64;
                for &idx in RSS_COUNTERS.iter() {
                    let counter = session.element(&rss_stat, idx)?;
                    sum = add_pages(sum, session.percpu_counter_sum(&counter)?)?;
                }
                sum
            }
            CounterLayout::Legacy => {
                let count = session.field(&rss_stat, "count")?;
                let mut sum = 0i64;
                for &idx in RSS_COUNTERS.iter() {
                    let counter = session.element(&count, idx)?;
                    sum = add_pages(sum, session.read_signed(&counter)?)?;
                }
                sum
            }
        };

        // per-cpu deltas can leave the sum transiently negative
        let resident_size = self.pages_to_bytes("rss page count", pages.max(0) as u64)?;

        Ok(Some(MemoryMapping {
            virtual_size,
            resident_size,
        }))
    }

    fn pages_to_bytes(&self, what: &'static str, pages: u64) -> Result<u64> {
        pages
            .checked_mul(self.page_size)
            .ok_or(KstateError::Implausible { what, value: pages })
    }

    pub fn mem_percent(&self, mapping: &MemoryMapping) -> f64 {
        if self.total_ram == 0 {
            return 0.0;
        }
        100.0 * mapping.resident_size as f64 / self.total_ram as f64
    }
}

fn add_pages(sum: i64, pages: i64) -> Result<i64> {
    sum.checked_add(pages).ok_or(KstateError::Implausible {
        what: "rss page count",
        value: pages as u64,
    })
}

/// `totalram_pages()`: an atomic since 5.0, a plain `unsigned long` before.
fn totalram_pages<M: KernelMemory>(session: &mut KernelSession<M>) -> Result<u64> {
    for name in &["_totalram_pages", "totalram_pages"] {
        if session.has_symbol(name) {
            let pages = session.resolve_global(name)?;
            return session.read_unsigned(&pages);
        }
    }
    Err(KstateError::unavailable("symbol _totalram_pages"))
}

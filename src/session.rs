//! Typed access to kernel memory.
//!
//! A [`KernelSession`] binds raw memory, the type schema and the symbol
//! table together. It is passed explicitly to every reconstruction step and
//! is the only state they share.

use memflow::prelude::v1::{Address, umem};

use log::*;

use crate::error::{KstateError, Result};
use crate::mem::KernelMemory;
use crate::schema::{FieldType, TypeSchema};
use crate::symbols::SymbolTable;

/// An object of a known type at a known kernel address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypedValue {
    pub address: Address,
    pub ty: FieldType,
}

impl TypedValue {
    pub fn new(address: Address, ty: FieldType) -> Self {
        Self { address, ty }
    }

    pub fn of_struct(address: Address, name: &str) -> Self {
        Self::new(address, FieldType::Struct(name.to_string()))
    }
}

pub struct KernelSession<M> {
    mem: M,
    schema: TypeSchema,
    symbols: SymbolTable,
    percpu_offsets: Option<Vec<u64>>,
}

impl<M: KernelMemory> KernelSession<M> {
    /// Opens a session. The task list anchor must resolve, otherwise there is
    /// nothing either view could be built from.
    pub fn open(mem: M, schema: TypeSchema, symbols: SymbolTable) -> Result<Self> {
        let session = Self {
            mem,
            schema,
            symbols,
            percpu_offsets: None,
        };

        let init_task = session.resolve_global("init_task")?;
        info!(
            "session opened: init_task at {:x}, {} symbols, page size {}",
            init_task.address,
            session.symbols.len(),
            session.schema.page_size()
        );

        Ok(session)
    }

    /// Ends the session and hands back the underlying memory.
    pub fn close(self) -> M {
        debug!("session closed");
        self.mem
    }

    pub fn schema(&self) -> &TypeSchema {
        &self.schema
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn page_size(&self) -> u64 {
        self.schema.page_size()
    }

    pub fn has_symbol(&self, name: &str) -> bool {
        self.symbols.lookup(name).is_some() && self.schema.global_type(name).is_some()
    }

    pub fn resolve_global(&self, name: &str) -> Result<TypedValue> {
        let address = self
            .symbols
            .lookup(name)
            .ok_or_else(|| KstateError::unavailable(format!("symbol {}", name)))?;
        let ty = self
            .schema
            .global_type(name)
            .ok_or_else(|| KstateError::unavailable(format!("type of global {}", name)))?;

        trace!("{} = ({}) {:x}", name, ty, address);

        Ok(TypedValue::new(address, ty.clone()))
    }

    /// Member access. Pointers to structs are followed first, the same way
    /// `task->mm` reads in C.
    pub fn field(&mut self, value: &TypedValue, name: &str) -> Result<TypedValue> {
        let owner = match &value.ty {
            FieldType::Pointer(_) => self.deref(value)?,
            _ => value.clone(),
        };

        let struct_name = owner.ty.struct_name().ok_or_else(|| {
            KstateError::unavailable(format!("member {} of non-struct {}", name, owner.ty))
        })?;

        let field = self.schema.require_field(struct_name, name)?;

        Ok(TypedValue::new(owner.address + field.offset, field.ty.clone()))
    }

    pub fn deref(&mut self, value: &TypedValue) -> Result<TypedValue> {
        match &value.ty {
            FieldType::Pointer(inner) => {
                let target = self.read_pointer(value)?;
                Ok(TypedValue::new(target, (**inner).clone()))
            }
            other => Err(KstateError::unavailable(format!(
                "dereference of non-pointer {}",
                other
            ))),
        }
    }

    /// Element `idx` of an array value.
    pub fn element(&self, value: &TypedValue, idx: usize) -> Result<TypedValue> {
        match &value.ty {
            FieldType::Array(elem, len) if idx < *len => {
                let stride = self.schema.size_of(elem)?;
                Ok(TypedValue::new(
                    value.address + idx * stride,
                    (**elem).clone(),
                ))
            }
            FieldType::Array(_, len) => Err(KstateError::unavailable(format!(
                "index {} out of bounds for array of {}",
                idx, len
            ))),
            other => Err(KstateError::unavailable(format!("index into non-array {}", other))),
        }
    }

    pub fn read_pointer(&mut self, value: &TypedValue) -> Result<Address> {
        if !matches!(value.ty, FieldType::Pointer(_)) && value.ty != POINTER_WORD {
            return Err(KstateError::unavailable(format!("{} is not a pointer", value.ty)));
        }
        Ok(Address::from(self.mem.read_u64(value.address)? as umem))
    }

    pub fn read_unsigned(&mut self, value: &TypedValue) -> Result<u64> {
        match value.ty {
            FieldType::Int { size, .. } => Ok(self.mem.read_uint(value.address, size)?),
            FieldType::Pointer(_) => Ok(self.mem.read_u64(value.address)?),
            _ => self.read_wrapped(value).map(|v| v as u64),
        }
    }

    pub fn read_signed(&mut self, value: &TypedValue) -> Result<i64> {
        match value.ty {
            FieldType::Int { size, signed: true } => Ok(self.mem.read_int(value.address, size)?),
            FieldType::Int { size, signed: false } => {
                Ok(self.mem.read_uint(value.address, size)? as i64)
            }
            _ => self.read_wrapped(value),
        }
    }

    /// `atomic_t`, `atomic_long_t` and friends are structs wrapping a single
    /// `counter`; read through them transparently.
    fn read_wrapped(&mut self, value: &TypedValue) -> Result<i64> {
        let counter = self.field(value, "counter")?;
        if !counter.ty.is_int() {
            return Err(KstateError::unavailable(format!(
                "{}.counter is not an integer",
                value.ty
            )));
        }
        self.read_signed(&counter)
    }

    /// Reads a fixed size `char[N]` buffer up to its first NUL.
    pub fn read_c_string(&mut self, value: &TypedValue) -> Result<String> {
        let len = match &value.ty {
            FieldType::Array(elem, len) if matches!(**elem, FieldType::Int { size: 1, .. }) => *len,
            other => {
                return Err(KstateError::unavailable(format!(
                    "{} is not a character array",
                    other
                )))
            }
        };

        let mut buf = vec![0u8; len];
        self.mem.read_raw_into(value.address, &mut buf)?;

        let end = buf.iter().position(|&b| b == 0).unwrap_or(len);
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    /// Recovers the record containing the embedded `field` at `field_ptr`.
    pub fn container_of(&self, field_ptr: Address, record: &str, field: &str) -> Result<TypedValue> {
        let field = self.schema.require_field(record, field)?;
        Ok(TypedValue::of_struct(field_ptr - field.offset, record))
    }

    /// Per-CPU base offsets, `__per_cpu_offset[0..nr_cpu_ids]`.
    fn load_percpu_offsets(&mut self) -> Result<()> {
        if self.percpu_offsets.is_some() {
            return Ok(());
        }

        let nr_cpu_ids = self.resolve_global("nr_cpu_ids")?;
        let nr_cpu_ids = self.read_unsigned(&nr_cpu_ids)?;
        let table = self.resolve_global("__per_cpu_offset")?;

        let slots = match &table.ty {
            FieldType::Array(_, len) => *len,
            other => {
                return Err(KstateError::unavailable(format!(
                    "__per_cpu_offset is {}, not an array",
                    other
                )))
            }
        };

        let nr_cpus = if nr_cpu_ids > slots as u64 {
            warn!(
                "nr_cpu_ids {} exceeds the {} slots of __per_cpu_offset",
                nr_cpu_ids, slots
            );
            slots
        } else {
            nr_cpu_ids as usize
        };

        let mut offsets = Vec::with_capacity(nr_cpus);
        for cpu in 0..nr_cpus {
            let slot = self.element(&table, cpu)?;
            offsets.push(self.read_unsigned(&slot)?);
        }

        debug!("per-cpu offsets for {} cpus: {:x?}", nr_cpus, offsets);

        self.percpu_offsets = Some(offsets);
        Ok(())
    }

    /// Exact value of a `struct percpu_counter`: the shared count plus every
    /// CPU's `s32` delta, as `percpu_counter_sum()` computes it.
    pub fn percpu_counter_sum(&mut self, counter: &TypedValue) -> Result<i64> {
        self.load_percpu_offsets()?;

        let count = self.field(counter, "count")?;
        let mut sum = self.read_signed(&count)?;

        let counters = self.field(counter, "counters")?;
        let base = self.read_pointer(&counters)?.to_umem() as u64;
        if base == 0 {
            return Ok(sum);
        }

        if let Some(offsets) = &self.percpu_offsets {
            for offset in offsets {
                let addr = Address::from(base.wrapping_add(*offset) as umem);
                sum = sum
                    .checked_add(self.mem.read_i32(addr)? as i64)
                    .ok_or(KstateError::Implausible {
                        what: "percpu_counter count",
                        value: sum as u64,
                    })?;
            }
        }

        Ok(sum)
    }
}

/// `unsigned long` holding a pointer, as in `atomic_long_t` owner words.
const POINTER_WORD: FieldType = FieldType::Int {
    size: 8,
    signed: false,
};

//! Intrusive `struct list_head` traversal.
//!
//! Lists are walked in a live kernel, so every walk is bounded: a node seen
//! twice, a NULL link, or more nodes than the limit all end the walk with
//! [`KstateError::ListIntegrity`] instead of spinning forever.

use memflow::prelude::v1::{Address, umem};

use std::collections::BTreeSet;

use log::*;

use crate::error::{KstateError, Result};
use crate::mem::KernelMemory;
use crate::schema::{FieldType, TypeSchema};
use crate::session::{KernelSession, TypedValue};

/// Lower bound for limits derived from the thread count.
pub const MIN_WALK_LIMIT: usize = 1024;
/// Used when `nr_threads` cannot be read.
pub const FALLBACK_WALK_LIMIT: usize = 65536;

/// A struct member that is embedded inline in a larger record, with its
/// offset resolved once from the schema.
#[derive(Clone, Debug)]
pub struct EmbeddedField {
    record: String,
    field: String,
    offset: usize,
}

impl EmbeddedField {
    pub fn resolve(schema: &TypeSchema, record: &str, field: &str) -> Result<Self> {
        let offset = schema.require_field(record, field)?.offset;
        Ok(Self {
            record: record.to_string(),
            field: field.to_string(),
            offset,
        })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// `container_of(field_ptr, record, field)`.
    pub fn container_of(&self, field_ptr: Address) -> TypedValue {
        let record = (field_ptr.to_umem() as u64).wrapping_sub(self.offset as u64);
        TypedValue::of_struct(Address::from(record as umem), &self.record)
    }

    /// Address of the embedded member inside the record at `record`.
    pub fn member_of(&self, record: Address) -> Address {
        record + self.offset
    }
}

impl std::fmt::Display for EmbeddedField {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.record, self.field)
    }
}

/// Iterates the nodes of a circular list, excluding the head.
pub struct ListIter<'a, M> {
    session: &'a mut KernelSession<M>,
    name: String,
    head: Address,
    cur: Address,
    next_offset: usize,
    visited: BTreeSet<Address>,
    limit: usize,
    done: bool,
}

impl<'a, M: KernelMemory> ListIter<'a, M> {
    pub fn new(
        session: &'a mut KernelSession<M>,
        name: impl Into<String>,
        head: Address,
        limit: usize,
    ) -> Result<Self> {
        let next_offset = session.schema().require_field("list_head", "next")?.offset;
        let first = read_link(session, head, next_offset)?;

        Ok(Self {
            session,
            name: name.into(),
            head,
            cur: first,
            next_offset,
            visited: BTreeSet::new(),
            limit,
            done: false,
        })
    }

    fn fail(&mut self, reason: &'static str) -> Option<Result<Address>> {
        self.done = true;
        warn!(
            "{} list at {:x}: {} after {} nodes",
            self.name,
            self.head,
            reason,
            self.visited.len()
        );
        Some(Err(KstateError::ListIntegrity {
            list: self.name.clone(),
            visited: self.visited.len(),
            reason,
        }))
    }
}

impl<'a, M: KernelMemory> Iterator for ListIter<'a, M> {
    type Item = Result<Address>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let node = self.cur;

        if node == self.head {
            self.done = true;
            trace!("{} list: {} nodes", self.name, self.visited.len());
            return None;
        }

        if node.is_null() {
            return self.fail("null link");
        }

        if self.visited.len() >= self.limit {
            return self.fail("step limit exceeded before reaching the head");
        }

        if !self.visited.insert(node) {
            return self.fail("node visited twice");
        }

        match read_link(self.session, node, self.next_offset) {
            Ok(next) => self.cur = next,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        }

        trace!("{} list: node {:x}", self.name, node);

        Some(Ok(node))
    }
}

fn read_link<M: KernelMemory>(
    session: &mut KernelSession<M>,
    node: Address,
    offset: usize,
) -> Result<Address> {
    let link = TypedValue::new(
        node + offset,
        FieldType::Pointer(Box::new(FieldType::Struct("list_head".into()))),
    );
    session.read_pointer(&link)
}

/// Collects the nodes of the list anchored at `head`.
pub fn walk_list<M: KernelMemory>(
    session: &mut KernelSession<M>,
    name: &str,
    head: Address,
    limit: usize,
) -> Result<Vec<Address>> {
    ListIter::new(session, name, head, limit)?.collect()
}

/// A generous bound for lists whose length is at most the number of
/// threads: four times `nr_threads`, or a fixed fallback.
pub fn default_walk_limit<M: KernelMemory>(session: &mut KernelSession<M>) -> usize {
    let nr_threads = session
        .resolve_global("nr_threads")
        .and_then(|v| session.read_unsigned(&v));

    match nr_threads {
        Ok(n) => {
            let limit = (n as usize).saturating_mul(4).max(MIN_WALK_LIMIT);
            debug!("nr_threads = {}, list walk limit {}", n, limit);
            limit
        }
        Err(err) => {
            debug!("nr_threads unavailable ({}), list walk limit {}", err, FALLBACK_WALK_LIMIT);
            FALLBACK_WALK_LIMIT
        }
    }
}

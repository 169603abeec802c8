use memflow::prelude::v1::*;

use std::collections::HashMap;
use std::io::BufRead;
use std::iter::FromIterator;
use std::path::Path;

use goblin::elf::Elf;
use log::*;

use crate::error::{KstateError, Result};

/// Global kernel symbols, keyed by name.
///
/// Addresses are stored as linked. A KASLR slide, when set, is added on
/// every lookup so the same table can serve several boots of one build.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    syms: HashMap<String, Address>,
    slide: u64,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `System.map` / `/proc/kallsyms` formatted lines:
    /// `ffffffff82a0c940 D init_task`.
    ///
    /// Lines with an unparsable address are skipped, module symbols
    /// (`name [module]`) keep only the name.
    pub fn from_system_map(reader: impl BufRead) -> Result<Self> {
        let mut table = Self::new();

        for line in reader.lines() {
            let line = line?;
            let mut parts = line.split_whitespace();

            let (addr, name) = match (parts.next(), parts.next(), parts.next()) {
                (Some(addr), Some(_kind), Some(name)) => (addr, name),
                _ => continue,
            };

            match u64::from_str_radix(addr, 16) {
                // kallsyms reports zeroes to unprivileged readers
                Ok(0) => continue,
                Ok(addr) => table.insert(name, addr.into()),
                Err(_) => trace!("skipping system map line {:?}", line),
            }
        }

        if table.is_empty() {
            return Err(KstateError::Symbols("no symbols in system map".into()));
        }

        debug!("loaded {} symbols from system map", table.len());

        Ok(table)
    }

    /// Reads the ELF symbol table of an uncompressed `vmlinux`.
    pub fn from_elf(bytes: &[u8]) -> Result<Self> {
        let elf = Elf::parse(bytes).map_err(|e| KstateError::Symbols(e.to_string()))?;

        let table = elf
            .syms
            .iter()
            .filter(|sym| sym.st_value != 0)
            .filter_map(|sym| {
                elf.strtab
                    .get_at(sym.st_name)
                    .filter(|name| !name.is_empty())
                    .map(|name| (Address::from(sym.st_value), name.to_string()))
            })
            .collect::<Self>();

        if table.is_empty() {
            return Err(KstateError::Symbols("vmlinux has no symbol table".into()));
        }

        debug!("loaded {} symbols from vmlinux", table.len());

        Ok(table)
    }

    pub fn load_system_map(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_system_map(std::io::BufReader::new(file))
    }

    pub fn load_elf(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_elf(&bytes)
    }

    pub fn with_slide(mut self, slide: u64) -> Self {
        self.slide = slide;
        self
    }

    pub fn insert(&mut self, name: &str, addr: Address) {
        self.syms.insert(name.to_string(), addr);
    }

    pub fn len(&self) -> usize {
        self.syms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    /// Runtime address of `name`.
    pub fn lookup(&self, name: &str) -> Option<Address> {
        self.syms
            .get(name)
            .map(|addr| Address::from(addr.to_umem().wrapping_add(self.slide)))
    }
}

impl FromIterator<(Address, String)> for SymbolTable {
    fn from_iter<I: IntoIterator<Item = (Address, String)>>(iter: I) -> Self {
        Self {
            syms: iter.into_iter().map(|(addr, name)| (name, addr)).collect(),
            slide: 0,
        }
    }
}

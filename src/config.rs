//! Session configuration.
//!
//! Settings come from an optional TOML file and from the command line; a
//! value given on the command line replaces the one from the file.
//! Addresses are strings so that full 64-bit kernel values survive TOML's
//! signed integers:
//!
//! ```toml
//! connector = "kcore"
//! dtb = "0x1ad4c000"
//! kaslr_offset = "0x1e000000"
//! system_map = "/boot/System.map-6.8.0"
//! schema = "/etc/kstate/6.8.0.toml"
//! max_list_steps = 100000
//! ```

use std::path::{Path, PathBuf};

use memflow::architecture::x86::x64;
use memflow::prelude::v1::*;
use serde::Deserialize;

use log::*;

use crate::error::{KstateError, Result};
use crate::mem::{KernelMemory, ViewMemory};
use crate::schema::TypeSchema;
use crate::session::KernelSession;
use crate::symbols::SymbolTable;

pub const DEFAULT_CONNECTOR: &str = "kcore";

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    pub connector: Option<String>,
    pub connector_args: Option<String>,
    /// Physical address of the kernel page table root.
    pub dtb: Option<String>,
    pub kaslr_offset: Option<String>,
    pub system_map: Option<PathBuf>,
    pub vmlinux: Option<PathBuf>,
    pub schema: Option<PathBuf>,
    pub max_list_steps: Option<usize>,
}

/// Parses `0x`-prefixed hex or plain decimal.
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|_| KstateError::Config(format!("invalid address `{}`", s)))
}

impl SessionConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| KstateError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| KstateError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&contents)?;
        debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Fields set in `overrides` replace ours.
    pub fn merge(self, overrides: SessionConfig) -> Self {
        Self {
            connector: overrides.connector.or(self.connector),
            connector_args: overrides.connector_args.or(self.connector_args),
            dtb: overrides.dtb.or(self.dtb),
            kaslr_offset: overrides.kaslr_offset.or(self.kaslr_offset),
            system_map: overrides.system_map.or(self.system_map),
            vmlinux: overrides.vmlinux.or(self.vmlinux),
            schema: overrides.schema.or(self.schema),
            max_list_steps: overrides.max_list_steps.or(self.max_list_steps),
        }
    }

    pub fn dtb(&self) -> Result<Address> {
        let dtb = self
            .dtb
            .as_deref()
            .ok_or_else(|| KstateError::Config("no page table root (dtb) given".into()))?;
        Ok(Address::from(parse_address(dtb)?))
    }

    pub fn kaslr_offset(&self) -> Result<u64> {
        self.kaslr_offset
            .as_deref()
            .map(parse_address)
            .unwrap_or(Ok(0))
    }

    /// Loads symbols from the system map, or from the vmlinux ELF if no map
    /// is configured, and applies the KASLR slide.
    pub fn load_symbols(&self) -> Result<SymbolTable> {
        let table = match (&self.system_map, &self.vmlinux) {
            (Some(map), _) => SymbolTable::load_system_map(map)?,
            (None, Some(vmlinux)) => SymbolTable::load_elf(vmlinux)?,
            (None, None) => {
                return Err(KstateError::Config(
                    "either system_map or vmlinux must be given".into(),
                ))
            }
        };
        Ok(table.with_slide(self.kaslr_offset()?))
    }

    pub fn load_schema(&self) -> Result<TypeSchema> {
        let path = self
            .schema
            .as_ref()
            .ok_or_else(|| KstateError::Config("no type schema given".into()))?;
        TypeSchema::load(path)
    }

    /// Instantiates the configured connector and opens a session on the
    /// kernel's virtual address space.
    pub fn open_session(&self) -> Result<KernelSession<Box<dyn KernelMemory>>> {
        let schema = self.load_schema()?;
        let symbols = self.load_symbols()?;
        let dtb = self.dtb()?;

        let name = self.connector.as_deref().unwrap_or(DEFAULT_CONNECTOR);
        let args = match &self.connector_args {
            Some(args) => args.parse::<ConnectorArgs>()?,
            None => ConnectorArgs::default(),
        };

        info!("opening connector {} (dtb {:x})", name, dtb);

        let mut inventory = Inventory::scan();
        let connector = inventory.create_connector(name, None, Some(&args))?;

        let mem = VirtualDma::new(connector, x64::ARCH, x64::new_translator(dtb));
        let mem: Box<dyn KernelMemory> = Box::new(ViewMemory(mem));

        KernelSession::open(mem, schema, symbols)
    }
}

//! Kernel type schema.
//!
//! The schema is the debug-info substrate of the tool: struct sizes, member
//! offsets and member types for the handful of kernel types that are read,
//! the type of each global symbol, and a few build constants. It is usually
//! generated from `pahole`/BTF output of the inspected kernel and stored as
//! TOML:
//!
//! ```toml
//! [constants]
//! page_size = 4096
//!
//! [globals]
//! init_task = "task_struct"
//! rtnl_mutex = "mutex"
//!
//! [types.list_head]
//! size = 16
//! fields = { next = { offset = 0, type = "ptr list_head" }, prev = { offset = 8, type = "ptr list_head" } }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{KstateError, Result};

pub const POINTER_SIZE: usize = 8;

/// Type of a struct member or global.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldType {
    Int { size: usize, signed: bool },
    Pointer(Box<FieldType>),
    Struct(String),
    Array(Box<FieldType>, usize),
}

impl FieldType {
    pub fn struct_name(&self) -> Option<&str> {
        match self {
            FieldType::Struct(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_int(&self) -> bool {
        matches!(self, FieldType::Int { .. })
    }
}

impl FromStr for FieldType {
    type Err = KstateError;

    /// Parses `u32`, `i64`, `ptr task_struct`, `char[16]`, `percpu_counter[4]`
    /// and plain struct names.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        if s.is_empty() {
            return Err(KstateError::Schema("empty type".into()));
        }

        if let Some(inner) = s.strip_prefix("ptr ") {
            return Ok(FieldType::Pointer(Box::new(inner.parse()?)));
        }

        if let Some(body) = s.strip_suffix(']') {
            let open = body
                .rfind('[')
                .ok_or_else(|| KstateError::Schema(format!("unbalanced array type `{}`", s)))?;
            let len = body[open + 1..]
                .trim()
                .parse::<usize>()
                .map_err(|_| KstateError::Schema(format!("bad array length in `{}`", s)))?;
            let elem = body[..open].parse()?;
            return Ok(FieldType::Array(Box::new(elem), len));
        }

        let int = |size, signed| Ok(FieldType::Int { size, signed });

        match s {
            "u8" | "char" => int(1, false),
            "u16" => int(2, false),
            "u32" => int(4, false),
            "u64" => int(8, false),
            "i8" => int(1, true),
            "i16" => int(2, true),
            "i32" => int(4, true),
            "i64" => int(8, true),
            name => Ok(FieldType::Struct(name.to_string())),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldType::Int { size, signed } => {
                write!(f, "{}{}", if *signed { 'i' } else { 'u' }, size * 8)
            }
            FieldType::Pointer(inner) => write!(f, "ptr {}", inner),
            FieldType::Struct(name) => f.write_str(name),
            FieldType::Array(elem, len) => write!(f, "{}[{}]", elem, len),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Field {
    pub offset: usize,
    pub ty: FieldType,
}

#[derive(Clone, Debug)]
pub struct StructLayout {
    pub size: usize,
    pub fields: HashMap<String, Field>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Constants {
    pub page_size: u64,
}

#[derive(Deserialize)]
struct RawField {
    offset: usize,
    #[serde(rename = "type")]
    ty: String,
}

#[derive(Deserialize)]
struct RawStruct {
    size: usize,
    #[serde(default)]
    fields: HashMap<String, RawField>,
}

#[derive(Deserialize)]
struct RawSchema {
    constants: Constants,
    #[serde(default)]
    globals: HashMap<String, String>,
    #[serde(default)]
    types: HashMap<String, RawStruct>,
}

#[derive(Clone, Debug)]
pub struct TypeSchema {
    constants: Constants,
    globals: HashMap<String, FieldType>,
    types: HashMap<String, StructLayout>,
}

impl TypeSchema {
    pub fn new(constants: Constants) -> Self {
        Self {
            constants,
            globals: HashMap::new(),
            types: HashMap::new(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let raw: RawSchema = toml::from_str(s).map_err(|e| KstateError::Schema(e.to_string()))?;

        let mut schema = Self::new(raw.constants);

        for (name, ty) in raw.globals {
            schema.globals.insert(name, ty.parse()?);
        }

        for (name, raw_struct) in raw.types {
            let mut fields = HashMap::with_capacity(raw_struct.fields.len());
            for (field, raw_field) in raw_struct.fields {
                fields.insert(
                    field,
                    Field {
                        offset: raw_field.offset,
                        ty: raw_field.ty.parse()?,
                    },
                );
            }
            schema.types.insert(
                name,
                StructLayout {
                    size: raw_struct.size,
                    fields,
                },
            );
        }

        if schema.constants.page_size == 0 || !schema.constants.page_size.is_power_of_two() {
            return Err(KstateError::Schema(format!(
                "page_size {} is not a power of two",
                schema.constants.page_size
            )));
        }

        Ok(schema)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Adds or replaces a struct layout. `fields` are `(name, offset, type)`.
    pub fn insert_struct(&mut self, name: &str, size: usize, fields: &[(&str, usize, &str)]) {
        let fields = fields
            .iter()
            .map(|(field, offset, ty)| {
                let ty = ty
                    .parse()
                    .unwrap_or_else(|_| FieldType::Struct((*ty).to_string()));
                (
                    (*field).to_string(),
                    Field {
                        offset: *offset,
                        ty,
                    },
                )
            })
            .collect();
        self.types
            .insert(name.to_string(), StructLayout { size, fields });
    }

    pub fn insert_global(&mut self, name: &str, ty: FieldType) {
        self.globals.insert(name.to_string(), ty);
    }

    pub fn with_struct(mut self, name: &str, size: usize, fields: &[(&str, usize, &str)]) -> Self {
        self.insert_struct(name, size, fields);
        self
    }

    pub fn with_global(mut self, name: &str, ty: &str) -> Self {
        let ty = ty
            .parse()
            .unwrap_or_else(|_| FieldType::Struct(ty.to_string()));
        self.insert_global(name, ty);
        self
    }

    pub fn page_size(&self) -> u64 {
        self.constants.page_size
    }

    pub fn global_type(&self, name: &str) -> Option<&FieldType> {
        self.globals.get(name)
    }

    pub fn layout(&self, ty: &str) -> Option<&StructLayout> {
        self.types.get(ty)
    }

    pub fn field(&self, ty: &str, field: &str) -> Option<&Field> {
        self.types.get(ty)?.fields.get(field)
    }

    pub fn has_field(&self, ty: &str, field: &str) -> bool {
        self.field(ty, field).is_some()
    }

    pub fn field_type(&self, ty: &str, field: &str) -> Option<&FieldType> {
        self.field(ty, field).map(|f| &f.ty)
    }

    /// Like [`TypeSchema::field`], but a missing member is fatal.
    pub fn require_field(&self, ty: &str, field: &str) -> Result<&Field> {
        self.field(ty, field)
            .ok_or_else(|| KstateError::unavailable(format!("struct {} has no member {}", ty, field)))
    }

    pub fn size_of(&self, ty: &FieldType) -> Result<usize> {
        match ty {
            FieldType::Int { size, .. } => Ok(*size),
            FieldType::Pointer(_) => Ok(POINTER_SIZE),
            FieldType::Struct(name) => self
                .layout(name)
                .map(|l| l.size)
                .ok_or_else(|| KstateError::unavailable(format!("struct {}", name))),
            FieldType::Array(elem, len) => Ok(self.size_of(elem)? * len),
        }
    }
}

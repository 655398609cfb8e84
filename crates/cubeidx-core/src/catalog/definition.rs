//! Metadata type documents and field definitions.
//!
//! Documents are TOML. A field's extraction expression and definition hash
//! are derived from its offset and value type only, so two definitions that
//! extract the same value the same way always hash identically.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Longest accepted type or field name. Keeps derived index names short.
pub const MAX_NAME_LEN: usize = 48;

/// Column names a field may not take, since views already expose them.
pub const RESERVED_NAMES: &[&str] = &["id", "added", "archived", "metadata", "metadata_type_id"];

const DEFAULT_TYPES_TOML: &str = include_str!("default_types.toml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    String,
    Integer,
    Numeric,
    Datetime,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Numeric => "numeric",
            Self::Datetime => "datetime",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "string" => Ok(Self::String),
            "integer" => Ok(Self::Integer),
            "numeric" => Ok(Self::Numeric),
            "datetime" => Ok(Self::Datetime),
            other => Err(Error::Catalog(format!("unknown value type '{}'", other))),
        }
    }
}

fn default_indexed() -> bool {
    true
}

/// One field as written in a metadata type document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDef {
    pub name: String,
    /// Path of keys into the record's JSON metadata.
    pub offset: Vec<String>,
    #[serde(rename = "type", default)]
    pub value_type: ValueType,
    #[serde(default = "default_indexed")]
    pub indexed: bool,
}

impl FieldDef {
    pub fn expression(&self) -> String {
        expression(&self.offset, self.value_type)
    }

    pub fn definition_hash(&self) -> String {
        definition_hash(&self.offset, self.value_type)
    }

    pub fn validate(&self) -> Result<()> {
        validate_name("field", &self.name)?;
        if RESERVED_NAMES.contains(&self.name.as_str()) {
            return Err(Error::Catalog(format!(
                "field name '{}' is reserved for a base column",
                self.name
            )));
        }
        if self.offset.is_empty() {
            return Err(Error::Catalog(format!("field '{}' has an empty offset", self.name)));
        }
        for key in &self.offset {
            let ok = !key.is_empty()
                && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !ok {
                return Err(Error::Catalog(format!(
                    "field '{}' has invalid offset key '{}'",
                    self.name, key
                )));
            }
        }
        Ok(())
    }
}

/// A metadata type document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataTypeDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

impl MetadataTypeDef {
    /// Parse and validate a single TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let def: Self = toml::from_str(content)
            .map_err(|e| Error::Catalog(format!("invalid metadata type document: {}", e)))?;
        def.validate()?;
        Ok(def)
    }

    pub fn validate(&self) -> Result<()> {
        validate_name("metadata type", &self.name)?;
        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            field.validate()?;
            if !seen.insert(field.name.as_str()) {
                return Err(Error::Catalog(format!(
                    "metadata type '{}' defines field '{}' twice",
                    self.name, field.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct DefaultTypes {
    types: Vec<MetadataTypeDef>,
}

/// Metadata types seeded by `--default-types`.
pub fn default_types() -> Result<Vec<MetadataTypeDef>> {
    let doc: DefaultTypes = toml::from_str(DEFAULT_TYPES_TOML)
        .map_err(|e| Error::Catalog(format!("bundled default types are invalid: {}", e)))?;
    for def in &doc.types {
        def.validate()?;
    }
    Ok(doc.types)
}

/// Names become SQL identifiers, so only lowercase ASCII, digits, and `_`.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    let mut chars = name.chars();
    let starts_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !starts_ok || !rest_ok {
        return Err(Error::Catalog(format!(
            "invalid {} name '{}': use lowercase letters, digits and '_', starting with a letter",
            kind, name
        )));
    }
    if name.contains("__") || name.ends_with('_') {
        return Err(Error::Catalog(format!(
            "invalid {} name '{}': '__' and a trailing '_' are reserved",
            kind, name
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::Catalog(format!(
            "{} name '{}' is longer than {} characters",
            kind, name, MAX_NAME_LEN
        )));
    }
    Ok(())
}

/// SQL expression extracting the value at `offset` from a record's metadata.
pub fn expression(offset: &[String], value_type: ValueType) -> String {
    let path = format!("$.{}", offset.join("."));
    let extract = format!("json_extract(metadata, '{}')", path);
    match value_type {
        ValueType::Integer => format!("CAST({} AS INTEGER)", extract),
        ValueType::Numeric => format!("CAST({} AS REAL)", extract),
        ValueType::String | ValueType::Datetime => extract,
    }
}

/// Content hash of expression + type, as lowercase hex SHA-256.
pub fn definition_hash(offset: &[String], value_type: ValueType) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value_type.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(expression(offset, value_type).as_bytes());
    format!("{:x}", hasher.finalize())
}

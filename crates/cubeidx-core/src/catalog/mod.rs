//! The field catalog: metadata types and their fields.
//!
//! [`FieldCatalog::load`] reads the authoritative catalog from the database.
//! The mutating functions take a plain `&Connection` and never open their own
//! transaction, so callers run them inside the lock coordinator's transaction
//! together with any DDL they belong to.

pub mod definition;

pub use definition::{FieldDef, MetadataTypeDef, ValueType, default_types};

use crate::error::{Error, Result};
use indexmap::IndexMap;
use rusqlite::{Connection, OptionalExtension, params};

/// An indexable (or merely viewable) field of a metadata type.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub id: i64,
    pub name: String,
    pub offset: Vec<String>,
    pub value_type: ValueType,
    pub indexable: bool,
    pub definition_hash: String,
    pub position: i64,
}

impl Field {
    pub fn expression(&self) -> String {
        definition::expression(&self.offset, self.value_type)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataType {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    /// Fields in catalog order.
    pub fields: IndexMap<String, Field>,
}

impl MetadataType {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.keys().map(String::as_str).collect()
    }
}

/// Snapshot of every metadata type and field, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct FieldCatalog {
    types: IndexMap<String, MetadataType>,
}

impl FieldCatalog {
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut types: IndexMap<String, MetadataType> = IndexMap::new();
        let mut by_id: IndexMap<i64, String> = IndexMap::new();

        let mut stmt = conn.prepare("SELECT id, name, description FROM metadata_type ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(MetadataType {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                fields: IndexMap::new(),
            })
        })?;
        for row in rows {
            let ty = row?;
            by_id.insert(ty.id, ty.name.clone());
            types.insert(ty.name.clone(), ty);
        }

        let mut stmt = conn.prepare(
            "SELECT id, metadata_type_id, name, offset_path, value_type, indexable,
                    definition_hash, position
             FROM metadata_field
             ORDER BY metadata_type_id, position",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(1)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                Field {
                    id: row.get(0)?,
                    name: row.get(2)?,
                    offset: Vec::new(),
                    value_type: ValueType::String,
                    indexable: row.get(5)?,
                    definition_hash: row.get(6)?,
                    position: row.get(7)?,
                },
            ))
        })?;
        for row in rows {
            let (type_id, offset_json, value_type, mut field) = row?;
            field.offset = serde_json::from_str(&offset_json).map_err(|e| {
                Error::schema(format!("field {} has a corrupt offset: {}", field.name, e))
            })?;
            field.value_type = ValueType::parse(&value_type)?;
            let ty = by_id
                .get(&type_id)
                .and_then(|name| types.get_mut(name))
                .ok_or_else(|| {
                    Error::schema(format!(
                        "field {} references missing metadata type {}",
                        field.name, type_id
                    ))
                })?;
            ty.fields.insert(field.name.clone(), field);
        }

        Ok(Self { types })
    }

    pub fn get(&self, name: &str) -> Option<&MetadataType> {
        self.types.get(name)
    }

    pub fn types(&self) -> impl Iterator<Item = &MetadataType> {
        self.types.values()
    }

    /// Every indexable field, paired with its owning type.
    pub fn indexable_fields(&self) -> impl Iterator<Item = (&MetadataType, &Field)> {
        self.types
            .values()
            .flat_map(|ty| ty.fields.values().map(move |f| (ty, f)))
            .filter(|(_, f)| f.indexable)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// What [`update_metadata_type`] changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TypeUpdate {
    pub type_created: bool,
    pub fields_added: Vec<String>,
    pub fields_redefined: Vec<String>,
}

impl TypeUpdate {
    pub fn is_noop(&self) -> bool {
        !self.type_created && self.fields_added.is_empty() && self.fields_redefined.is_empty()
    }
}

fn type_id(conn: &Connection, name: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row("SELECT id FROM metadata_type WHERE name = ?1", [name], |row| {
            row.get(0)
        })
        .optional()?)
}

fn require_type_id(conn: &Connection, name: &str) -> Result<i64> {
    type_id(conn, name)?.ok_or_else(|| Error::Catalog(format!("unknown metadata type '{}'", name)))
}

/// Insert a new metadata type with its fields. Fails if the name is taken.
pub fn add_metadata_type(conn: &Connection, def: &MetadataTypeDef) -> Result<i64> {
    def.validate()?;
    if type_id(conn, &def.name)?.is_some() {
        return Err(Error::Catalog(format!(
            "metadata type '{}' already exists",
            def.name
        )));
    }
    conn.execute(
        "INSERT INTO metadata_type (name, description) VALUES (?1, ?2)",
        params![def.name, def.description],
    )?;
    let id = conn.last_insert_rowid();
    for field in &def.fields {
        insert_field(conn, id, field)?;
    }
    log::info!(
        "added metadata type {} with {} fields",
        def.name,
        def.fields.len()
    );
    Ok(id)
}

/// Append a field to an existing type. Fails if the field already exists.
pub fn add_field(conn: &Connection, type_name: &str, def: &FieldDef) -> Result<i64> {
    def.validate()?;
    let type_id = require_type_id(conn, type_name)?;
    let id = insert_field(conn, type_id, def)?;
    log::info!("added field {}.{}", type_name, def.name);
    Ok(id)
}

fn insert_field(conn: &Connection, type_id: i64, def: &FieldDef) -> Result<i64> {
    let exists: bool = conn
        .query_row(
            "SELECT 1 FROM metadata_field WHERE metadata_type_id = ?1 AND name = ?2",
            params![type_id, def.name],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);
    if exists {
        return Err(Error::Catalog(format!("field '{}' already exists", def.name)));
    }

    let offset_json = serde_json::to_string(&def.offset)
        .map_err(|e| Error::Catalog(format!("cannot encode offset: {}", e)))?;
    conn.execute(
        "INSERT INTO metadata_field
            (metadata_type_id, name, offset_path, value_type, indexable, definition_hash, position)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6,
            (SELECT COALESCE(MAX(position), -1) + 1 FROM metadata_field WHERE metadata_type_id = ?1))",
        params![
            type_id,
            def.name,
            offset_json,
            def.value_type.as_str(),
            def.indexed,
            def.definition_hash()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Replace an existing field's definition.
///
/// Returns `false` when nothing changed. When the definition hash changes, a
/// `valid` index for the field is marked `stale` in the same transaction.
pub fn redefine_field(conn: &Connection, type_name: &str, def: &FieldDef) -> Result<bool> {
    def.validate()?;
    let type_id = require_type_id(conn, type_name)?;
    let current: Option<(i64, String, bool)> = conn
        .query_row(
            "SELECT id, definition_hash, indexable FROM metadata_field
             WHERE metadata_type_id = ?1 AND name = ?2",
            params![type_id, def.name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((field_id, old_hash, old_indexable)) = current else {
        return Err(Error::Catalog(format!(
            "unknown field '{}.{}'",
            type_name, def.name
        )));
    };

    let new_hash = def.definition_hash();
    if new_hash == old_hash && def.indexed == old_indexable {
        return Ok(false);
    }

    let offset_json = serde_json::to_string(&def.offset)
        .map_err(|e| Error::Catalog(format!("cannot encode offset: {}", e)))?;
    conn.execute(
        "UPDATE metadata_field
         SET offset_path = ?1, value_type = ?2, indexable = ?3, definition_hash = ?4
         WHERE id = ?5",
        params![
            offset_json,
            def.value_type.as_str(),
            def.indexed,
            new_hash,
            field_id
        ],
    )?;
    if new_hash != old_hash {
        let marked = conn.execute(
            "UPDATE field_index SET state = 'stale', updated_at = datetime('now')
             WHERE field_id = ?1 AND state = 'valid'",
            [field_id],
        )?;
        log::info!(
            "redefined field {}.{} ({} index marked stale)",
            type_name,
            def.name,
            marked
        );
    }
    Ok(true)
}

/// Create the type if missing, otherwise add new fields and redefine changed ones.
///
/// Fields missing from `def` are left in place: the engine never deletes fields.
pub fn update_metadata_type(conn: &Connection, def: &MetadataTypeDef) -> Result<TypeUpdate> {
    def.validate()?;
    if type_id(conn, &def.name)?.is_none() {
        add_metadata_type(conn, def)?;
        return Ok(TypeUpdate {
            type_created: true,
            fields_added: def.fields.iter().map(|f| f.name.clone()).collect(),
            fields_redefined: Vec::new(),
        });
    }

    conn.execute(
        "UPDATE metadata_type SET description = ?1 WHERE name = ?2",
        params![def.description, def.name],
    )?;

    let catalog = FieldCatalog::load(conn)?;
    let existing = catalog
        .get(&def.name)
        .ok_or_else(|| Error::Catalog(format!("unknown metadata type '{}'", def.name)))?;

    let mut update = TypeUpdate::default();
    for field in &def.fields {
        if existing.field(&field.name).is_some() {
            if redefine_field(conn, &def.name, field)? {
                update.fields_redefined.push(field.name.clone());
            }
        } else {
            add_field(conn, &def.name, field)?;
            update.fields_added.push(field.name.clone());
        }
    }
    for name in existing.field_names() {
        if !def.fields.iter().any(|f| f.name == name) {
            log::warn!(
                "field {}.{} is not in the new definition; fields are never removed",
                def.name,
                name
            );
        }
    }
    Ok(update)
}

/// Insert every bundled default type that does not exist yet.
pub fn seed_default_types(conn: &Connection) -> Result<Vec<String>> {
    let mut added = Vec::new();
    for def in default_types()? {
        if type_id(conn, &def.name)?.is_none() {
            add_metadata_type(conn, &def)?;
            added.push(def.name);
        }
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::apply_migrations;
    use tempfile::TempDir;

    fn migrated() -> (Connection, TempDir) {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open(dir.path().join("c.db")).unwrap();
        apply_migrations(&conn, 0).unwrap();
        (conn, dir)
    }

    fn fdef(name: &str, offset: &[&str]) -> FieldDef {
        FieldDef {
            name: name.to_string(),
            offset: offset.iter().map(|s| s.to_string()).collect(),
            value_type: ValueType::String,
            indexed: true,
        }
    }

    fn tdef(name: &str, fields: Vec<FieldDef>) -> MetadataTypeDef {
        MetadataTypeDef {
            name: name.to_string(),
            description: None,
            fields,
        }
    }

    #[test]
    fn load_preserves_field_order() {
        let (conn, _dir) = migrated();
        add_metadata_type(
            &conn,
            &tdef("t", vec![fdef("zeta", &["z"]), fdef("alpha", &["a"])]),
        )
        .unwrap();
        add_field(&conn, "t", &fdef("mid", &["m"])).unwrap();

        let catalog = FieldCatalog::load(&conn).unwrap();
        let ty = catalog.get("t").unwrap();
        assert_eq!(ty.field_names(), vec!["zeta", "alpha", "mid"]);
        assert_eq!(ty.field("mid").unwrap().position, 2);
        assert_eq!(ty.field("alpha").unwrap().offset, vec!["a".to_string()]);
    }

    #[test]
    fn type_with_no_fields_loads() {
        let (conn, _dir) = migrated();
        add_metadata_type(&conn, &tdef("t", vec![])).unwrap();
        let catalog = FieldCatalog::load(&conn).unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("t").unwrap().fields.is_empty());
        assert_eq!(catalog.indexable_fields().count(), 0);
    }

    #[test]
    fn duplicate_type_and_field_rejected() {
        let (conn, _dir) = migrated();
        add_metadata_type(&conn, &tdef("t", vec![fdef("f", &["f"])])).unwrap();
        assert!(matches!(
            add_metadata_type(&conn, &tdef("t", vec![])),
            Err(Error::Catalog(_))
        ));
        assert!(matches!(
            add_field(&conn, "t", &fdef("f", &["g"])),
            Err(Error::Catalog(_))
        ));
        assert!(matches!(
            add_field(&conn, "missing", &fdef("g", &["g"])),
            Err(Error::Catalog(_))
        ));
    }

    #[test]
    fn indexable_fields_skips_unindexed() {
        let (conn, _dir) = migrated();
        let mut hidden = fdef("hidden", &["h"]);
        hidden.indexed = false;
        add_metadata_type(&conn, &tdef("t", vec![fdef("shown", &["s"]), hidden])).unwrap();
        let catalog = FieldCatalog::load(&conn).unwrap();
        let names: Vec<&str> = catalog
            .indexable_fields()
            .map(|(_, f)| f.name.as_str())
            .collect();
        assert_eq!(names, vec!["shown"]);
    }

    #[test]
    fn redefine_changes_hash_and_marks_index_stale() {
        let (conn, _dir) = migrated();
        add_metadata_type(&conn, &tdef("t", vec![fdef("f1", &["a"])])).unwrap();
        let before = FieldCatalog::load(&conn).unwrap();
        let field = before.get("t").unwrap().field("f1").unwrap().clone();
        conn.execute(
            "INSERT INTO field_index (field_id, index_name, definition_hash, state)
             VALUES (?1, 'dix_t__f1', ?2, 'valid')",
            params![field.id, field.definition_hash],
        )
        .unwrap();

        assert!(!redefine_field(&conn, "t", &fdef("f1", &["a"])).unwrap());
        assert!(redefine_field(&conn, "t", &fdef("f1", &["b"])).unwrap());

        let after = FieldCatalog::load(&conn).unwrap();
        let redefined = after.get("t").unwrap().field("f1").unwrap();
        assert_ne!(redefined.definition_hash, field.definition_hash);
        assert_eq!(redefined.id, field.id);

        let state: String = conn
            .query_row(
                "SELECT state FROM field_index WHERE field_id = ?1",
                [field.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(state, "stale");
    }

    #[test]
    fn update_adds_and_redefines() {
        let (conn, _dir) = migrated();
        let created = update_metadata_type(&conn, &tdef("t", vec![fdef("f1", &["a"])])).unwrap();
        assert!(created.type_created);

        let update = update_metadata_type(
            &conn,
            &tdef("t", vec![fdef("f1", &["changed"]), fdef("f2", &["b"])]),
        )
        .unwrap();
        assert!(!update.type_created);
        assert_eq!(update.fields_added, vec!["f2".to_string()]);
        assert_eq!(update.fields_redefined, vec!["f1".to_string()]);

        let again = update_metadata_type(
            &conn,
            &tdef("t", vec![fdef("f1", &["changed"]), fdef("f2", &["b"])]),
        )
        .unwrap();
        assert!(again.is_noop());
    }

    #[test]
    fn update_never_removes_fields() {
        let (conn, _dir) = migrated();
        update_metadata_type(&conn, &tdef("t", vec![fdef("f1", &["a"]), fdef("f2", &["b"])]))
            .unwrap();
        update_metadata_type(&conn, &tdef("t", vec![fdef("f1", &["a"])])).unwrap();
        let catalog = FieldCatalog::load(&conn).unwrap();
        assert_eq!(catalog.get("t").unwrap().field_names(), vec!["f1", "f2"]);
    }

    #[test]
    fn default_types_seed_once() {
        let (conn, _dir) = migrated();
        let first = seed_default_types(&conn).unwrap();
        assert_eq!(first, vec!["eo".to_string(), "telemetry".to_string()]);
        let second = seed_default_types(&conn).unwrap();
        assert!(second.is_empty());
    }
}

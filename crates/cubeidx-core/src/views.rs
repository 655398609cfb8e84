//! Per-type dynamic views over the dataset table.
//!
//! Each view exposes the base record columns followed by one column per field
//! of its metadata type, in catalog order. Views are replaced by drop and
//! create inside a single transaction, so readers see either the old view or
//! the new one, never neither.

use crate::catalog::{FieldCatalog, MetadataType};
use crate::error::Result;
use crate::lock::LockCoordinator;
use rusqlite::Connection;

/// Columns every view starts with, taken straight from `dataset`.
pub const BASE_COLUMNS: &[&str] = &["id", "added", "archived"];

/// Result of a view rebuild pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ViewRebuild {
    /// Metadata types whose view was rebuilt, in catalog order.
    pub rebuilt: Vec<String>,
    /// Views that could not be rebuilt, with the reason.
    pub failures: Vec<(String, String)>,
}

pub fn view_name(type_name: &str) -> String {
    format!("dv_{}_dataset", type_name)
}

pub fn create_view_sql(ty: &MetadataType) -> String {
    let mut columns: Vec<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
    for field in ty.fields.values() {
        columns.push(format!("{} AS \"{}\"", field.expression(), field.name));
    }
    format!(
        "CREATE VIEW \"{}\" AS SELECT {} FROM dataset WHERE metadata_type_id = {}",
        view_name(&ty.name),
        columns.join(", "),
        ty.id
    )
}

/// Replace the view of every metadata type in `catalog`.
///
/// A failing view does not stop the others; it is reported in `failures`.
pub fn rebuild_views(
    conn: &mut Connection,
    catalog: &FieldCatalog,
    locks: &mut LockCoordinator,
) -> ViewRebuild {
    let mut out = ViewRebuild::default();
    for ty in catalog.types() {
        match rebuild_view(conn, ty, locks) {
            Ok(()) => out.rebuilt.push(ty.name.clone()),
            Err(e) => {
                log::warn!("view for {} not rebuilt: {}", ty.name, e);
                out.failures.push((view_name(&ty.name), e.to_string()));
            }
        }
    }
    out
}

pub fn rebuild_view(
    conn: &mut Connection,
    ty: &MetadataType,
    locks: &mut LockCoordinator,
) -> Result<()> {
    let name = view_name(&ty.name);
    let sql = create_view_sql(ty);
    locks.with_optional_lock(conn, &name, |tx| {
        tx.execute_batch(&format!("DROP VIEW IF EXISTS \"{}\"", name))?;
        log::debug!("{}", sql);
        tx.execute_batch(&sql)?;
        Ok(())
    })?;
    log::info!("rebuilt view {} ({} fields)", name, ty.fields.len());
    Ok(())
}

/// Column names of a view or table, in order.
pub fn view_columns(conn: &Connection, view: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let rows = stmt.query_map([view], |row| row.get::<_, String>(0))?;
    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, FieldDef, MetadataTypeDef, ValueType};
    use crate::schema::{apply_migrations, object_exists};
    use tempfile::TempDir;

    fn setup(fields: Vec<FieldDef>) -> (Connection, TempDir) {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open(dir.path().join("v.db")).unwrap();
        apply_migrations(&conn, 0).unwrap();
        catalog::add_metadata_type(
            &conn,
            &MetadataTypeDef {
                name: "t".to_string(),
                description: None,
                fields,
            },
        )
        .unwrap();
        (conn, dir)
    }

    fn fdef(name: &str, offset: &[&str], value_type: ValueType) -> FieldDef {
        FieldDef {
            name: name.to_string(),
            offset: offset.iter().map(|s| s.to_string()).collect(),
            value_type,
            indexed: true,
        }
    }

    #[test]
    fn empty_type_view_has_base_columns_only() {
        let (mut conn, _dir) = setup(vec![]);
        let catalog = FieldCatalog::load(&conn).unwrap();
        let mut locks = LockCoordinator::new(true);
        let result = rebuild_views(&mut conn, &catalog, &mut locks);
        assert_eq!(result.rebuilt, vec!["t".to_string()]);
        assert_eq!(view_columns(&conn, "dv_t_dataset").unwrap(), BASE_COLUMNS);
    }

    #[test]
    fn view_columns_follow_catalog_order() {
        let (mut conn, _dir) = setup(vec![
            fdef("zeta", &["z"], ValueType::String),
            fdef("alpha", &["a"], ValueType::Integer),
        ]);
        let catalog = FieldCatalog::load(&conn).unwrap();
        let mut locks = LockCoordinator::new(false);
        rebuild_views(&mut conn, &catalog, &mut locks);
        assert_eq!(
            view_columns(&conn, "dv_t_dataset").unwrap(),
            vec!["id", "added", "archived", "zeta", "alpha"]
        );
    }

    #[test]
    fn view_projects_field_values() {
        let (mut conn, _dir) = setup(vec![fdef("orbit", &["acq", "orbit"], ValueType::Integer)]);
        let catalog = FieldCatalog::load(&conn).unwrap();
        let type_id = catalog.get("t").unwrap().id;
        conn.execute(
            "INSERT INTO dataset (id, metadata_type_id, metadata) VALUES ('d1', ?1, ?2)",
            rusqlite::params![type_id, r#"{"acq": {"orbit": "42"}}"#],
        )
        .unwrap();
        let mut locks = LockCoordinator::new(true);
        rebuild_views(&mut conn, &catalog, &mut locks);
        let orbit: i64 = conn
            .query_row("SELECT orbit FROM dv_t_dataset WHERE id = 'd1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(orbit, 42);
    }

    #[test]
    fn rebuild_replaces_existing_view() {
        let (mut conn, _dir) = setup(vec![fdef("f1", &["a"], ValueType::String)]);
        let mut locks = LockCoordinator::new(true);
        let catalog = FieldCatalog::load(&conn).unwrap();
        rebuild_views(&mut conn, &catalog, &mut locks);

        catalog::add_field(&conn, "t", &fdef("f2", &["b"], ValueType::String)).unwrap();
        let catalog = FieldCatalog::load(&conn).unwrap();
        rebuild_views(&mut conn, &catalog, &mut locks);
        assert_eq!(
            view_columns(&conn, "dv_t_dataset").unwrap(),
            vec!["id", "added", "archived", "f1", "f2"]
        );
    }

    #[test]
    fn failing_view_is_isolated() {
        let (mut conn, _dir) = setup(vec![]);
        catalog::add_metadata_type(
            &conn,
            &MetadataTypeDef {
                name: "u".to_string(),
                description: None,
                fields: vec![],
            },
        )
        .unwrap();
        // A table squatting on t's view name makes DROP VIEW fail.
        conn.execute_batch("CREATE TABLE dv_t_dataset (x INTEGER);")
            .unwrap();
        let catalog = FieldCatalog::load(&conn).unwrap();
        let mut locks = LockCoordinator::new(true);
        let result = rebuild_views(&mut conn, &catalog, &mut locks);
        assert_eq!(result.rebuilt, vec!["u".to_string()]);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].0, "dv_t_dataset");
        assert!(object_exists(&conn, "view", "dv_u_dataset").unwrap());
    }
}

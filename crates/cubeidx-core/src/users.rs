//! Role membership lookups.

use crate::error::Result;
use rusqlite::Connection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleMember {
    pub username: String,
    pub role: String,
    pub description: String,
}

/// Roles held by `username`, least privileged first.
pub fn roles_for(conn: &Connection, username: &str) -> Result<Vec<String>> {
    Ok(list_members(conn)?
        .into_iter()
        .filter(|m| m.username == username)
        .map(|m| m.role)
        .collect())
}

/// Every role membership, ordered by user and then role seniority.
pub fn list_members(conn: &Connection) -> Result<Vec<RoleMember>> {
    let mut stmt = conn.prepare(
        "SELECT m.username, m.role, r.description
         FROM role_member m JOIN role r ON r.name = m.role
         ORDER BY m.username, r.rowid",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(RoleMember {
            username: row.get(0)?,
            role: row.get(1)?,
            description: row.get(2)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

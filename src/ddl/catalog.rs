//! Catalog snapshots and the schema changes between two of them.
//!
//! SQLite has no event triggers, so schema changes are observed by reading
//! `sqlite_master` before and after a DDL batch. Tables are matched by name
//! and, for renames, by root page. Indexes, views and triggers only report
//! creation and removal.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rusqlite::Connection;

use crate::audit::AuditResult;

/// Kind of catalog object, in the order changes are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Table,
    View,
    Index,
    Trigger,
}

impl ObjectKind {
    /// Catalog type name, as stored in `sqlite_master.type`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::View => "view",
            Self::Index => "index",
            Self::Trigger => "trigger",
        }
    }

    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "table" => Some(Self::Table),
            "view" => Some(Self::View),
            "index" => Some(Self::Index),
            "trigger" => Some(Self::Trigger),
            _ => None,
        }
    }

    /// Whether the object is identified relative to its table.
    #[must_use]
    pub fn is_table_scoped(&self) -> bool {
        matches!(self, Self::Index | Self::Trigger)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Create, alter or drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeKind {
    Drop,
    Alter,
    Create,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Alter => "ALTER",
            Self::Drop => "DROP",
        }
    }
}

/// One catalog change detected across a DDL batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub kind: ChangeKind,
    pub object: ObjectKind,
    /// Object name after the change (before it, for drops).
    pub name: String,
    /// Table the object belongs to; the object itself for tables and views.
    pub table: String,
    /// Former name of a renamed table.
    pub previous_name: Option<String>,
}

impl SchemaChange {
    /// Command tag such as `CREATE TABLE` or `DROP TRIGGER`.
    #[must_use]
    pub fn command_tag(&self) -> String {
        format!(
            "{} {}",
            self.kind.as_str(),
            self.object.as_str().to_ascii_uppercase()
        )
    }

    /// Qualified identity: `schema.name`, or `name on schema.table` for
    /// indexes and triggers.
    #[must_use]
    pub fn identity(&self, schema: &str) -> String {
        if self.object.is_table_scoped() {
            format!("{} on {schema}.{}", self.name, self.table)
        } else {
            format!("{schema}.{}", self.name)
        }
    }

    /// Whether this is a table rename.
    #[must_use]
    pub fn is_rename(&self) -> bool {
        self.previous_name.is_some()
    }
}

/// One row of `sqlite_master`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogObject {
    pub kind: ObjectKind,
    pub name: String,
    pub table: String,
    pub sql: String,
    pub rootpage: i64,
}

/// The main schema's catalog at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogSnapshot {
    objects: BTreeMap<(ObjectKind, String), CatalogObject>,
}

impl CatalogSnapshot {
    /// Read the catalog, skipping SQLite's internal objects.
    ///
    /// # Errors
    ///
    /// Returns an error if `sqlite_master` cannot be read.
    pub fn capture(conn: &Connection) -> AuditResult<Self> {
        let mut stmt = conn.prepare(
            "SELECT type, name, tbl_name, COALESCE(sql, ''), COALESCE(rootpage, 0)
             FROM sqlite_master
             WHERE name NOT LIKE 'sqlite\\_%' ESCAPE '\\'",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    CatalogObject {
                        kind: ObjectKind::Table,
                        name: row.get(1)?,
                        table: row.get(2)?,
                        sql: row.get(3)?,
                        rootpage: row.get(4)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let objects = rows
            .into_iter()
            .filter_map(|(kind, object)| {
                let kind = ObjectKind::parse(&kind)?;
                Some(((kind, object.name.clone()), CatalogObject { kind, ..object }))
            })
            .collect();
        Ok(Self { objects })
    }

    #[must_use]
    pub fn get(&self, kind: ObjectKind, name: &str) -> Option<&CatalogObject> {
        self.objects.get(&(kind, name.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Whether the table had its change interceptor attached.
    #[must_use]
    pub fn is_monitored(&self, table: &str) -> bool {
        let trigger = crate::provision::AuditTableNames::for_table(table).insert_trigger;
        self.get(ObjectKind::Trigger, &trigger)
            .is_some_and(|object| object.table == table)
    }

    fn of_kind(&self, kind: ObjectKind) -> impl Iterator<Item = &CatalogObject> {
        self.objects
            .values()
            .filter(move |object| object.kind == kind)
    }

    /// Changes that turn `self` into `after`, drops first, then alters,
    /// then creates.
    #[must_use]
    pub fn diff(&self, after: &Self) -> Vec<SchemaChange> {
        let mut changes = Vec::new();

        let mut dropped: Vec<&CatalogObject> = self
            .of_kind(ObjectKind::Table)
            .filter(|t| after.get(ObjectKind::Table, &t.name).is_none())
            .collect();
        let mut created: Vec<&CatalogObject> = after
            .of_kind(ObjectKind::Table)
            .filter(|t| self.get(ObjectKind::Table, &t.name).is_none())
            .collect();

        // Renames keep their root page
        let mut renamed = Vec::new();
        dropped.retain(|old| {
            if old.rootpage == 0 {
                return true;
            }
            match created.iter().position(|new| new.rootpage == old.rootpage) {
                Some(idx) => {
                    renamed.push((old.name.clone(), created.remove(idx)));
                    false
                }
                None => true,
            }
        });

        // Tables that are gone, including ones rebuilt under the same name
        let mut removed_tables: BTreeSet<String> =
            dropped.iter().map(|t| t.name.clone()).collect();

        for (previous, new) in renamed {
            changes.push(table_change(ChangeKind::Alter, new, Some(previous)));
        }
        for old in &dropped {
            changes.push(table_change(ChangeKind::Drop, old, None));
        }
        for new in &created {
            changes.push(table_change(ChangeKind::Create, new, None));
        }

        for old in self.of_kind(ObjectKind::Table) {
            let Some(new) = after.get(ObjectKind::Table, &old.name) else {
                continue;
            };
            if old.rootpage != new.rootpage {
                removed_tables.insert(old.name.clone());
                changes.push(table_change(ChangeKind::Drop, old, None));
                changes.push(table_change(ChangeKind::Create, new, None));
            } else if old.sql != new.sql {
                changes.push(table_change(ChangeKind::Alter, new, None));
            }
        }

        for kind in [ObjectKind::View, ObjectKind::Index, ObjectKind::Trigger] {
            for old in self.of_kind(kind) {
                if after.get(kind, &old.name).is_none() && !removed_tables.contains(&old.table) {
                    changes.push(object_change(ChangeKind::Drop, old));
                }
            }
            for new in after.of_kind(kind) {
                if self.get(kind, &new.name).is_none() {
                    changes.push(object_change(ChangeKind::Create, new));
                }
            }
        }

        changes.sort_by(|a, b| {
            (a.kind, a.object, &a.name).cmp(&(b.kind, b.object, &b.name))
        });
        changes
    }
}

fn table_change(kind: ChangeKind, table: &CatalogObject, previous_name: Option<String>) -> SchemaChange {
    SchemaChange {
        kind,
        object: ObjectKind::Table,
        name: table.name.clone(),
        table: table.name.clone(),
        previous_name,
    }
}

fn object_change(kind: ChangeKind, object: &CatalogObject) -> SchemaChange {
    SchemaChange {
        kind,
        object: object.kind,
        name: object.name.clone(),
        table: object.table.clone(),
        previous_name: None,
    }
}

//! Versioned schema migrations for the project store.
//!
//! The current schema version lives in SQLite's `user_version` pragma. Every
//! pending migration is applied in order at open, each inside its own
//! transaction; any failure aborts startup.
//!
//! Rules for adding migrations:
//!  1. Always append to the end; never reorder or modify existing entries.
//!  2. For column/constraint changes, use the SQLite "recreate table"
//!     pattern: CREATE new → INSERT SELECT → DROP old → ALTER RENAME.
//!  3. Keep each migration idempotent where the primitive allows.

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction};
use tracing::info;

pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub up: fn(&Transaction) -> rusqlite::Result<()>,
}

pub fn migrations() -> &'static [Migration] {
    &[
        Migration {
            version: 1,
            description: "create projects table",
            up: |tx| {
                tx.execute_batch(
                    "CREATE TABLE IF NOT EXISTS projects (
                        id TEXT PRIMARY KEY,
                        name TEXT NOT NULL,
                        description TEXT NOT NULL DEFAULT '',
                        odoo_version TEXT NOT NULL,
                        postgres_version TEXT NOT NULL,
                        port INTEGER NOT NULL,
                        status TEXT NOT NULL DEFAULT 'stopped',
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    )",
                )
            },
        },
        Migration {
            version: 2,
            description: "add UNIQUE constraints to name and port",
            up: |tx| {
                // SQLite cannot add constraints to existing tables, so the
                // table is recreated with the desired schema.
                tx.execute_batch(
                    "CREATE TABLE projects_new (
                        id TEXT PRIMARY KEY,
                        name TEXT NOT NULL UNIQUE,
                        description TEXT NOT NULL DEFAULT '',
                        odoo_version TEXT NOT NULL,
                        postgres_version TEXT NOT NULL,
                        port INTEGER NOT NULL UNIQUE,
                        status TEXT NOT NULL DEFAULT 'stopped',
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );
                    INSERT INTO projects_new SELECT * FROM projects;
                    DROP TABLE projects;
                    ALTER TABLE projects_new RENAME TO projects;",
                )
            },
        },
        Migration {
            version: 3,
            description: "add git_repo_url column and settings table",
            up: |tx| {
                tx.execute_batch(
                    "ALTER TABLE projects ADD COLUMN git_repo_url TEXT NOT NULL DEFAULT '';
                    CREATE TABLE IF NOT EXISTS settings (
                        key TEXT PRIMARY KEY,
                        value TEXT NOT NULL DEFAULT ''
                    );",
                )
            },
        },
        Migration {
            version: 4,
            description: "add git_repo_branch column",
            up: |tx| {
                tx.execute_batch(
                    "ALTER TABLE projects ADD COLUMN git_repo_branch TEXT NOT NULL DEFAULT ''",
                )
            },
        },
        Migration {
            version: 5,
            description: "add enterprise_enabled column",
            up: |tx| {
                tx.execute_batch(
                    "ALTER TABLE projects ADD COLUMN enterprise_enabled INTEGER NOT NULL DEFAULT 0",
                )
            },
        },
        Migration {
            version: 6,
            description: "add design_themes_enabled column",
            up: |tx| {
                tx.execute_batch(
                    "ALTER TABLE projects ADD COLUMN design_themes_enabled INTEGER NOT NULL DEFAULT 0",
                )
            },
        },
    ]
}

fn schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .context("Failed to read schema version")
}

/// Apply all pending migrations in order, one transaction each.
pub fn run(conn: &mut Connection) -> Result<()> {
    let current = schema_version(conn)?;

    for m in migrations() {
        if m.version <= current {
            continue;
        }

        info!("Running migration {}: {}", m.version, m.description);

        let tx = conn
            .transaction()
            .with_context(|| format!("migration {}: failed to begin transaction", m.version))?;

        (m.up)(&tx).with_context(|| format!("migration {} ({}) failed", m.version, m.description))?;

        tx.pragma_update(None, "user_version", m.version)
            .with_context(|| format!("migration {}: failed to update schema version", m.version))?;

        tx.commit()
            .with_context(|| format!("migration {}: failed to commit", m.version))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_strictly_ordered() {
        let mut prev = 0;
        for m in migrations() {
            assert!(m.version > prev, "migration versions must increase");
            prev = m.version;
        }
    }

    #[test]
    fn test_fresh_database_reaches_latest_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        let latest = migrations().last().unwrap().version;
        assert_eq!(schema_version(&conn).unwrap(), latest);
    }

    #[test]
    fn test_run_is_a_noop_when_current() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap();
        let latest = migrations().last().unwrap().version;
        assert_eq!(schema_version(&conn).unwrap(), latest);
    }

    #[test]
    fn test_v1_data_survives_unique_migration() {
        let mut conn = Connection::open_in_memory().unwrap();

        // Apply only the first migration, insert a legacy row, then migrate
        // the rest of the way.
        let tx = conn.transaction().unwrap();
        (migrations()[0].up)(&tx).unwrap();
        tx.pragma_update(None, "user_version", 1).unwrap();
        tx.commit().unwrap();
        conn.execute(
            "INSERT INTO projects (id, name, description, odoo_version, postgres_version, port, status, created_at, updated_at)
             VALUES ('p1', 'legacy', '', '17.0', '15', 8069, 'stopped', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        run(&mut conn).unwrap();

        let (name, port): (String, i64) = conn
            .query_row("SELECT name, port FROM projects WHERE id = 'p1'", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(name, "legacy");
        assert_eq!(port, 8069);

        // New columns picked up their defaults.
        let ent: i64 = conn
            .query_row(
                "SELECT enterprise_enabled FROM projects WHERE id = 'p1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(ent, 0);
    }

    #[test]
    fn test_unique_constraints_enforced_after_migration() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();

        conn.execute(
            "INSERT INTO projects (id, name, description, odoo_version, postgres_version, port, status, created_at, updated_at)
             VALUES ('a', 'one', '', '18.0', '16', 8070, 'stopped', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        let dup_name = conn.execute(
            "INSERT INTO projects (id, name, description, odoo_version, postgres_version, port, status, created_at, updated_at)
             VALUES ('b', 'one', '', '18.0', '16', 8071, 'stopped', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            [],
        );
        assert!(dup_name.is_err());

        let dup_port = conn.execute(
            "INSERT INTO projects (id, name, description, odoo_version, postgres_version, port, status, created_at, updated_at)
             VALUES ('c', 'two', '', '18.0', '16', 8070, 'stopped', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            [],
        );
        assert!(dup_port.is_err());
    }
}

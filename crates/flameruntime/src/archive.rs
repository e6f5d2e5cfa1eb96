//! Runtime store for retained outputs.
//!
//! One SQLite database per run hosts an append-only table per retained EUI
//! with `(time, value)` rows. The supervisor creates tables in the resolve
//! phase, node processes insert during execution, and the archive phase
//! harvests retention-2 tables into the archive file. The database is
//! recreated at every executor start, so stale tables never survive a crash.

use flamecore::Eui;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Runtime database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Archive IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Quote an EUI for use as a SQLite table name.
fn table_name(eui: &Eui) -> String {
    format!("\"{}\"", eui.to_string().replace('"', "\"\""))
}

/// The per-run runtime database of retained outputs.
pub struct ArchiveStore {
    path: PathBuf,
    conn: Connection,
}

impl ArchiveStore {
    /// Drop any previous runtime database at this path and open a fresh one.
    pub fn reset(path: &Path) -> Result<Self, ArchiveError> {
        for suffix in ["", "-wal", "-shm"] {
            let stale = PathBuf::from(format!("{}{}", path.display(), suffix));
            if stale.exists() {
                std::fs::remove_file(&stale)?;
            }
        }
        let conn = Connection::open(path)?;
        // WAL so node processes can insert while the supervisor holds the db
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    /// Open an existing runtime database (the node side of the contract).
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the append-only table for one retained EUI.
    pub fn create_table(&self, eui: &Eui) -> Result<(), ArchiveError> {
        self.conn.execute(
            &format!(
                "CREATE TABLE {} (time TEXT NOT NULL, value TEXT)",
                table_name(eui)
            ),
            [],
        )?;
        Ok(())
    }

    /// Append one `(time, value)` row; `value` is the JSON encoding of the
    /// published message.
    pub fn insert(&self, eui: &Eui, time: &str, value: &str) -> Result<(), ArchiveError> {
        self.conn.execute(
            &format!("INSERT INTO {} (time, value) VALUES (?1, ?2)", table_name(eui)),
            rusqlite::params![time, value],
        )?;
        Ok(())
    }

    /// All rows of one table in insertion order.
    pub fn rows(&self, eui: &Eui) -> Result<Vec<(String, String)>, ArchiveError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT time, value FROM {} ORDER BY rowid",
            table_name(eui)
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn row_count(&self, eui: &Eui) -> Result<usize, ArchiveError> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", table_name(eui)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_insert_harvest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtimedata.sqlite");
        let store = ArchiveStore::reset(&path).unwrap();

        let eui = Eui::new("b", "y");
        store.create_table(&eui).unwrap();
        store.insert(&eui, "2026-01-01T00:00:00.000Z", "84").unwrap();
        store.insert(&eui, "2026-01-01T00:00:01.000Z", "85").unwrap();

        assert_eq!(store.row_count(&eui).unwrap(), 2);
        let rows = store.rows(&eui).unwrap();
        assert_eq!(rows[0], ("2026-01-01T00:00:00.000Z".into(), "84".into()));
        assert_eq!(rows[1].1, "85");
    }

    #[test]
    fn second_writer_sees_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtimedata.sqlite");
        let store = ArchiveStore::reset(&path).unwrap();
        let eui = Eui::new("a", "x");
        store.create_table(&eui).unwrap();

        let writer = ArchiveStore::open(&path).unwrap();
        writer.insert(&eui, "2026-01-01T00:00:00.000Z", "\"v\"").unwrap();
        assert_eq!(store.row_count(&eui).unwrap(), 1);
    }

    #[test]
    fn reset_drops_previous_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtimedata.sqlite");
        let eui = Eui::new("a", "x");
        {
            let store = ArchiveStore::reset(&path).unwrap();
            store.create_table(&eui).unwrap();
        }
        let store = ArchiveStore::reset(&path).unwrap();
        // the table is gone, so creating it again succeeds
        store.create_table(&eui).unwrap();
    }
}

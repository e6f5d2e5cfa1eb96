//! Node-side writer for retained outputs: appends rows to the per-EUI
//! tables of the runtime database the executor created in the resolve
//! phase. The database location comes from the `dataserver` directory key.

use flamecore::{DirectoryClient, DirectoryError, Eui, FlameError};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::Mutex;

pub struct RetentionWriter {
    conn: Mutex<Connection>,
}

impl RetentionWriter {
    pub async fn open(directory: &DirectoryClient) -> Result<Self, FlameError> {
        let path = directory
            .get("dataserver")
            .await?
            .ok_or_else(|| DirectoryError::Protocol("no dataserver registered".to_string()))?;
        let conn = Connection::open(PathBuf::from(path))
            .map_err(|e| FlameError::Archive(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| FlameError::Archive(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert(&self, eui: &Eui, value: &serde_json::Value) -> Result<(), FlameError> {
        let time = chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string();
        let table = format!("\"{}\"", eui.to_string().replace('"', "\"\""));
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!("INSERT INTO {table} (time, value) VALUES (?1, ?2)"),
            rusqlite::params![time, value.to_string()],
        )
        .map_err(|e| FlameError::Archive(e.to_string()))?;
        Ok(())
    }
}

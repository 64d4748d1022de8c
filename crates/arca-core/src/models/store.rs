//! Store metadata rows. The row carries the flags orchestration consults
//! (`ingestible`, `enabled`) plus the JSON blobs the concrete driver and
//! transfer managers are built from; the driver itself is constructed on
//! demand and never persisted.

use rusqlite::{params, Connection, OptionalExtension, Row};

use arca_store::async_transfer::{async_transfer_manager_from_config, AsyncTransferManager};
use arca_store::transfer::{transfer_manager_from_config, TransferManager};
use arca_store::{store_driver_from_config, StagedEntry, StoreDriver};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone)]
pub struct StoreRow {
    pub id: i64,
    pub name: String,
    pub store_type: String,
    pub ingestible: bool,
    pub enabled: bool,
    pub store_data: serde_json::Value,
    pub transfer_manager_data: serde_json::Value,
    pub async_transfer_manager_data: serde_json::Value,
}

impl StoreRow {
    pub fn create(
        conn: &Connection,
        name: &str,
        store_type: &str,
        ingestible: bool,
        store_data: &serde_json::Value,
        transfer_manager_data: &serde_json::Value,
        async_transfer_manager_data: &serde_json::Value,
    ) -> Result<StoreRow> {
        conn.execute(
            "INSERT INTO stores
                 (name, store_type, ingestible, enabled, store_data,
                  transfer_manager_data, async_transfer_manager_data)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)",
            params![
                name,
                store_type,
                ingestible as i64,
                store_data.to_string(),
                transfer_manager_data.to_string(),
                async_transfer_manager_data.to_string(),
            ],
        )?;
        Ok(StoreRow {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            store_type: store_type.to_string(),
            ingestible,
            enabled: true,
            store_data: store_data.clone(),
            transfer_manager_data: transfer_manager_data.clone(),
            async_transfer_manager_data: async_transfer_manager_data.clone(),
        })
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<StoreRow> {
        let store_data: String = row.get("store_data")?;
        let tm_data: String = row.get("transfer_manager_data")?;
        let atm_data: String = row.get("async_transfer_manager_data")?;
        Ok(StoreRow {
            id: row.get("id")?,
            name: row.get("name")?,
            store_type: row.get("store_type")?,
            ingestible: row.get::<_, i64>("ingestible")? != 0,
            enabled: row.get::<_, i64>("enabled")? != 0,
            store_data: serde_json::from_str(&store_data).unwrap_or(serde_json::Value::Null),
            transfer_manager_data: serde_json::from_str(&tm_data)
                .unwrap_or(serde_json::Value::Null),
            async_transfer_manager_data: serde_json::from_str(&atm_data)
                .unwrap_or(serde_json::Value::Null),
        })
    }

    const COLUMNS: &'static str = "id, name, store_type, ingestible, enabled, store_data,
                                   transfer_manager_data, async_transfer_manager_data";

    pub fn get(conn: &Connection, id: i64) -> Result<Option<StoreRow>> {
        conn.query_row(
            &format!("SELECT {} FROM stores WHERE id = ?1", Self::COLUMNS),
            params![id],
            StoreRow::from_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn get_by_name(conn: &Connection, name: &str) -> Result<Option<StoreRow>> {
        conn.query_row(
            &format!("SELECT {} FROM stores WHERE name = ?1", Self::COLUMNS),
            params![name],
            StoreRow::from_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn all(conn: &Connection) -> Result<Vec<StoreRow>> {
        let mut stmt = conn.prepare(&format!("SELECT {} FROM stores ORDER BY id", Self::COLUMNS))?;
        let rows = stmt.query_map([], StoreRow::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn set_state(
        &self,
        conn: &Connection,
        enabled: Option<bool>,
        ingestible: Option<bool>,
    ) -> Result<()> {
        if let Some(enabled) = enabled {
            conn.execute(
                "UPDATE stores SET enabled = ?1 WHERE id = ?2",
                params![enabled as i64, self.id],
            )?;
        }
        if let Some(ingestible) = ingestible {
            conn.execute(
                "UPDATE stores SET ingestible = ?1 WHERE id = ?2",
                params![ingestible as i64, self.id],
            )?;
        }
        Ok(())
    }

    pub fn disable(&self, conn: &Connection) -> Result<()> {
        self.set_state(conn, Some(false), None)
    }

    /// Build the storage driver for this row.
    pub fn driver(&self) -> Result<Box<dyn StoreDriver>> {
        store_driver_from_config(&self.store_type, &self.store_data).map_err(CoreError::from)
    }

    /// The synchronous transfer manager this store prefers.
    pub fn transfer_manager(&self) -> Result<Box<dyn TransferManager>> {
        let name = self
            .transfer_manager_data
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("local");
        transfer_manager_from_config(name).map_err(CoreError::from)
    }

    /// The asynchronous transfer manager configured for this store.
    pub fn async_transfer_manager(&self) -> Result<(String, Box<dyn AsyncTransferManager>)> {
        let name = self
            .async_transfer_manager_data
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("local_async")
            .to_string();
        let config = self
            .async_transfer_manager_data
            .get("config")
            .cloned()
            .unwrap_or(serde_json::json!({}));
        let manager = async_transfer_manager_from_config(&name, &config)?;
        Ok((name, manager))
    }

    pub fn async_transfer_manager_named(&self, name: &str) -> Result<Box<dyn AsyncTransferManager>> {
        let config = self
            .async_transfer_manager_data
            .get("config")
            .cloned()
            .unwrap_or(serde_json::json!({}));
        async_transfer_manager_from_config(name, &config).map_err(CoreError::from)
    }

    /// Stage an ingest slot. Enforces the (ingestible ∧ enabled ∧
    /// available) gate on top of the driver's capacity checks.
    pub fn stage_ingest(&self, name: &str, expected_size: u64) -> Result<StagedEntry> {
        if !self.enabled {
            return Err(CoreError::Store(arca_store::StoreError::Disabled));
        }
        if !self.ingestible {
            return Err(CoreError::Store(arca_store::StoreError::NotIngestible));
        }
        let driver = self.driver()?;
        if !driver.available() {
            return Err(CoreError::Store(arca_store::StoreError::Unavailable));
        }
        driver.stage(name, expected_size).map_err(CoreError::from)
    }

    /// Stage a clone slot. Clones are accepted on non-ingestible stores;
    /// only `enabled` and availability gate them.
    pub fn stage_clone(&self, name: &str, expected_size: u64) -> Result<StagedEntry> {
        if !self.enabled {
            return Err(CoreError::Store(arca_store::StoreError::Disabled));
        }
        let driver = self.driver()?;
        if !driver.available() {
            return Err(CoreError::Store(arca_store::StoreError::Unavailable));
        }
        driver.stage(name, expected_size).map_err(CoreError::from)
    }
}

//! Outgoing and incoming transfer records with guarded state transitions.
//!
//! Transitions go through [`OutgoingTransfer::advance`] /
//! [`IncomingTransfer::advance`], which validate the move against the state
//! machine; out-of-order transitions are rejected rather than applied.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use arca_protocol::{Checksum, TransferStatus};

use crate::db::{from_sql_time, to_sql_time};
use crate::error::{CoreError, Result};

#[derive(Debug, Clone)]
pub struct OutgoingTransfer {
    pub id: i64,
    pub status: TransferStatus,
    pub destination: String,
    pub file_name: String,
    pub instance_id: Option<i64>,
    pub store_id: Option<i64>,
    pub transfer_size: u64,
    pub transfer_checksum: Checksum,
    /// The destination's IncomingTransfer id, learned at stage time.
    pub remote_transfer_id: Option<i64>,
    pub transfer_manager_name: Option<String>,
    /// Absolute path of the source instance bytes.
    pub source_path: Option<String>,
    /// Absolute staging path on the destination endpoint.
    pub dest_path: Option<String>,
    pub batch_id: Option<String>,
    pub send_queue_id: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl OutgoingTransfer {
    const COLUMNS: &'static str = "id, status, destination, file_name, instance_id, store_id,
         transfer_size, transfer_checksum, remote_transfer_id, transfer_manager_name,
         source_path, dest_path, batch_id, send_queue_id, start_time, end_time, error";

    /// Insert a fresh INITIATED transfer. The partial unique index rejects
    /// a second live transfer for the same (destination, file).
    pub fn new_transfer(
        conn: &Connection,
        destination: &str,
        file_name: &str,
        instance_id: i64,
        store_id: i64,
        size: u64,
        checksum: &Checksum,
        source_path: &str,
    ) -> Result<OutgoingTransfer> {
        let start_time = Utc::now();
        conn.execute(
            "INSERT INTO outgoing_transfers
                 (status, destination, file_name, instance_id, store_id,
                  transfer_size, transfer_checksum, source_path, start_time)
             VALUES ('INITIATED', ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                destination,
                file_name,
                instance_id,
                store_id,
                size as i64,
                checksum.as_str(),
                source_path,
                to_sql_time(start_time),
            ],
        )?;
        Ok(OutgoingTransfer {
            id: conn.last_insert_rowid(),
            status: TransferStatus::Initiated,
            destination: destination.to_string(),
            file_name: file_name.to_string(),
            instance_id: Some(instance_id),
            store_id: Some(store_id),
            transfer_size: size,
            transfer_checksum: checksum.clone(),
            remote_transfer_id: None,
            transfer_manager_name: None,
            source_path: Some(source_path.to_string()),
            dest_path: None,
            batch_id: None,
            send_queue_id: None,
            start_time,
            end_time: None,
            error: None,
        })
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<OutgoingTransfer> {
        let status: String = row.get("status")?;
        let checksum: String = row.get("transfer_checksum")?;
        let start: String = row.get("start_time")?;
        let end: Option<String> = row.get("end_time")?;
        Ok(OutgoingTransfer {
            id: row.get("id")?,
            status: TransferStatus::from_str_opt(&status).unwrap_or(TransferStatus::Failed),
            destination: row.get("destination")?,
            file_name: row.get("file_name")?,
            instance_id: row.get("instance_id")?,
            store_id: row.get("store_id")?,
            transfer_size: row.get::<_, i64>("transfer_size")? as u64,
            transfer_checksum: Checksum::parse(&checksum)
                .unwrap_or_else(|_| Checksum::from_digest_bytes(&[])),
            remote_transfer_id: row.get("remote_transfer_id")?,
            transfer_manager_name: row.get("transfer_manager_name")?,
            source_path: row.get("source_path")?,
            dest_path: row.get("dest_path")?,
            batch_id: row.get("batch_id")?,
            send_queue_id: row.get("send_queue_id")?,
            start_time: from_sql_time(&start).unwrap_or_else(|_| Utc::now()),
            end_time: end.as_deref().and_then(|s| from_sql_time(s).ok()),
            error: row.get("error")?,
        })
    }

    pub fn get(conn: &Connection, id: i64) -> Result<Option<OutgoingTransfer>> {
        conn.query_row(
            &format!("SELECT {} FROM outgoing_transfers WHERE id = ?1", Self::COLUMNS),
            params![id],
            OutgoingTransfer::from_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    /// Advance the state machine. Already-in-state is a no-op (idempotent
    /// replays); anything not on a valid edge is rejected.
    pub fn advance(&mut self, conn: &Connection, to: TransferStatus) -> Result<()> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.outgoing_successors().contains(&to) {
            return Err(CoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        let end_time = to.is_terminal().then(|| to_sql_time(Utc::now()));
        conn.execute(
            "UPDATE outgoing_transfers SET status = ?1, end_time = ?2 WHERE id = ?3",
            params![to.as_str(), end_time, self.id],
        )?;
        self.status = to;
        Ok(())
    }

    pub fn fail(&mut self, conn: &Connection, reason: &str) -> Result<()> {
        if self.status.is_terminal() {
            return Ok(());
        }
        conn.execute(
            "UPDATE outgoing_transfers SET status = 'FAILED', error = ?1, end_time = ?2
             WHERE id = ?3",
            params![reason, to_sql_time(Utc::now()), self.id],
        )?;
        self.status = TransferStatus::Failed;
        self.error = Some(reason.to_string());
        Ok(())
    }

    /// Operator re-initiation of a failed transfer.
    pub fn reinitiate(&mut self, conn: &Connection) -> Result<()> {
        if self.status != TransferStatus::Failed {
            return Err(CoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: TransferStatus::Initiated,
            });
        }
        conn.execute(
            "UPDATE outgoing_transfers
             SET status = 'INITIATED', error = NULL, end_time = NULL,
                 send_queue_id = NULL, remote_transfer_id = NULL, start_time = ?1
             WHERE id = ?2",
            params![to_sql_time(Utc::now()), self.id],
        )?;
        self.status = TransferStatus::Initiated;
        Ok(())
    }

    pub fn record_staging(
        &mut self,
        conn: &Connection,
        remote_transfer_id: i64,
        dest_path: &str,
        batch_id: &str,
    ) -> Result<()> {
        conn.execute(
            "UPDATE outgoing_transfers
             SET remote_transfer_id = ?1, dest_path = ?2, batch_id = ?3
             WHERE id = ?4",
            params![remote_transfer_id, dest_path, batch_id, self.id],
        )?;
        self.remote_transfer_id = Some(remote_transfer_id);
        self.dest_path = Some(dest_path.to_string());
        self.batch_id = Some(batch_id.to_string());
        Ok(())
    }

    pub fn assign_queue(
        &mut self,
        conn: &Connection,
        send_queue_id: i64,
        manager_name: &str,
    ) -> Result<()> {
        conn.execute(
            "UPDATE outgoing_transfers SET send_queue_id = ?1, transfer_manager_name = ?2
             WHERE id = ?3",
            params![send_queue_id, manager_name, self.id],
        )?;
        self.send_queue_id = Some(send_queue_id);
        self.transfer_manager_name = Some(manager_name.to_string());
        Ok(())
    }

    /// Extend the staleness deadline after a hypervisor confirmed the peer
    /// is still making progress.
    pub fn extend_deadline(&mut self, conn: &Connection) -> Result<()> {
        let now = Utc::now();
        conn.execute(
            "UPDATE outgoing_transfers SET start_time = ?1 WHERE id = ?2",
            params![to_sql_time(now), self.id],
        )?;
        self.start_time = now;
        Ok(())
    }

    pub fn by_send_queue(conn: &Connection, send_queue_id: i64) -> Result<Vec<OutgoingTransfer>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM outgoing_transfers WHERE send_queue_id = ?1 ORDER BY id",
            Self::COLUMNS
        ))?;
        let rows = stmt.query_map(params![send_queue_id], OutgoingTransfer::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Transfers stuck in ONGOING or STAGED for longer than `age_in_days`.
    pub fn stale(conn: &Connection, age_in_days: i64) -> Result<Vec<OutgoingTransfer>> {
        let cutoff = to_sql_time(Utc::now() - Duration::days(age_in_days));
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM outgoing_transfers
             WHERE status IN ('ONGOING', 'STAGED') AND start_time < ?1
             ORDER BY id",
            Self::COLUMNS
        ))?;
        let rows = stmt.query_map(params![cutoff], OutgoingTransfer::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct IncomingTransfer {
    pub id: i64,
    pub status: TransferStatus,
    /// The source peer's configured name.
    pub source: String,
    /// The source's OutgoingTransfer id; the idempotency key.
    pub source_transfer_id: Option<i64>,
    pub uploader: String,
    pub upload_name: String,
    pub transfer_size: u64,
    pub transfer_checksum: Checksum,
    pub store_id: Option<i64>,
    pub staging_path: Option<String>,
    pub store_path: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl IncomingTransfer {
    const COLUMNS: &'static str = "id, status, source, source_transfer_id, uploader, upload_name,
         transfer_size, transfer_checksum, store_id, staging_path, store_path,
         start_time, end_time, error";

    #[allow(clippy::too_many_arguments)]
    pub fn new_transfer(
        conn: &Connection,
        source: &str,
        source_transfer_id: i64,
        uploader: &str,
        upload_name: &str,
        size: u64,
        checksum: &Checksum,
    ) -> Result<IncomingTransfer> {
        let start_time = Utc::now();
        conn.execute(
            "INSERT INTO incoming_transfers
                 (status, source, source_transfer_id, uploader, upload_name,
                  transfer_size, transfer_checksum, start_time)
             VALUES ('INITIATED', ?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                source,
                source_transfer_id,
                uploader,
                upload_name,
                size as i64,
                checksum.as_str(),
                to_sql_time(start_time),
            ],
        )?;
        Ok(IncomingTransfer {
            id: conn.last_insert_rowid(),
            status: TransferStatus::Initiated,
            source: source.to_string(),
            source_transfer_id: Some(source_transfer_id),
            uploader: uploader.to_string(),
            upload_name: upload_name.to_string(),
            transfer_size: size,
            transfer_checksum: checksum.clone(),
            store_id: None,
            staging_path: None,
            store_path: None,
            start_time,
            end_time: None,
            error: None,
        })
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<IncomingTransfer> {
        let status: String = row.get("status")?;
        let checksum: String = row.get("transfer_checksum")?;
        let start: String = row.get("start_time")?;
        let end: Option<String> = row.get("end_time")?;
        Ok(IncomingTransfer {
            id: row.get("id")?,
            status: TransferStatus::from_str_opt(&status).unwrap_or(TransferStatus::Failed),
            source: row.get("source")?,
            source_transfer_id: row.get("source_transfer_id")?,
            uploader: row.get("uploader")?,
            upload_name: row.get("upload_name")?,
            transfer_size: row.get::<_, i64>("transfer_size")? as u64,
            transfer_checksum: Checksum::parse(&checksum)
                .unwrap_or_else(|_| Checksum::from_digest_bytes(&[])),
            store_id: row.get("store_id")?,
            staging_path: row.get("staging_path")?,
            store_path: row.get("store_path")?,
            start_time: from_sql_time(&start).unwrap_or_else(|_| Utc::now()),
            end_time: end.as_deref().and_then(|s| from_sql_time(s).ok()),
            error: row.get("error")?,
        })
    }

    pub fn get(conn: &Connection, id: i64) -> Result<Option<IncomingTransfer>> {
        conn.query_row(
            &format!("SELECT {} FROM incoming_transfers WHERE id = ?1", Self::COLUMNS),
            params![id],
            IncomingTransfer::from_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    /// Look up by the idempotency key carried on every cross-peer call.
    pub fn find_by_source_key(
        conn: &Connection,
        source: &str,
        source_transfer_id: i64,
    ) -> Result<Option<IncomingTransfer>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM incoming_transfers
                 WHERE source = ?1 AND source_transfer_id = ?2",
                Self::COLUMNS
            ),
            params![source, source_transfer_id],
            IncomingTransfer::from_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn find_by_source_transfer_id(
        conn: &Connection,
        source_transfer_id: i64,
    ) -> Result<Option<IncomingTransfer>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM incoming_transfers WHERE source_transfer_id = ?1
                 ORDER BY id DESC LIMIT 1",
                Self::COLUMNS
            ),
            params![source_transfer_id],
            IncomingTransfer::from_row,
        )
        .optional()
        .map_err(CoreError::from)
    }

    /// Non-terminal transfers whose declared checksum matches; used to
    /// detect conflicting re-stages.
    pub fn active_with_checksum(
        conn: &Connection,
        checksum: &Checksum,
    ) -> Result<Vec<IncomingTransfer>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM incoming_transfers
             WHERE transfer_checksum = ?1
               AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
             ORDER BY id",
            Self::COLUMNS
        ))?;
        let rows = stmt.query_map(params![checksum.as_str()], IncomingTransfer::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn with_status(
        conn: &Connection,
        status: TransferStatus,
        limit: usize,
    ) -> Result<Vec<IncomingTransfer>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM incoming_transfers WHERE status = ?1 ORDER BY id LIMIT ?2",
            Self::COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![status.as_str(), limit as i64],
            IncomingTransfer::from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn advance(&mut self, conn: &Connection, to: TransferStatus) -> Result<()> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.incoming_successors().contains(&to) {
            return Err(CoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        let end_time = to.is_terminal().then(|| to_sql_time(Utc::now()));
        conn.execute(
            "UPDATE incoming_transfers SET status = ?1, end_time = ?2 WHERE id = ?3",
            params![to.as_str(), end_time, self.id],
        )?;
        self.status = to;
        Ok(())
    }

    pub fn fail(&mut self, conn: &Connection, reason: &str) -> Result<()> {
        if self.status.is_terminal() {
            return Ok(());
        }
        conn.execute(
            "UPDATE incoming_transfers SET status = 'FAILED', error = ?1, end_time = ?2
             WHERE id = ?3",
            params![reason, to_sql_time(Utc::now()), self.id],
        )?;
        self.status = TransferStatus::Failed;
        self.error = Some(reason.to_string());
        Ok(())
    }

    pub fn record_staging(
        &mut self,
        conn: &Connection,
        store_id: i64,
        staging_path: &str,
    ) -> Result<()> {
        conn.execute(
            "UPDATE incoming_transfers SET store_id = ?1, staging_path = ?2 WHERE id = ?3",
            params![store_id, staging_path, self.id],
        )?;
        self.store_id = Some(store_id);
        self.staging_path = Some(staging_path.to_string());
        Ok(())
    }

    pub fn record_store_path(&mut self, conn: &Connection, store_path: &str) -> Result<()> {
        conn.execute(
            "UPDATE incoming_transfers SET store_path = ?1 WHERE id = ?2",
            params![store_path, self.id],
        )?;
        self.store_path = Some(store_path.to_string());
        Ok(())
    }

    /// Transfers stuck in INITIATED or STAGED for longer than `age_in_days`.
    pub fn stale(conn: &Connection, age_in_days: i64) -> Result<Vec<IncomingTransfer>> {
        let cutoff = to_sql_time(Utc::now() - Duration::days(age_in_days));
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM incoming_transfers
             WHERE status IN ('INITIATED', 'STAGED') AND start_time < ?1
             ORDER BY id",
            Self::COLUMNS
        ))?;
        let rows = stmt.query_map(params![cutoff], IncomingTransfer::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{DeletionPolicy, File, Instance};

    fn checksum() -> Checksum {
        Checksum::parse("00000000000000000000000000000000").unwrap()
    }

    fn setup() -> (Database, Instance) {
        let db = Database::open_in_memory().unwrap();
        File::create(db.conn(), "f.dat", 4, &checksum(), "u", "s").unwrap();
        db.conn()
            .execute(
                "INSERT INTO stores (name, store_type, store_data) VALUES ('vault', 'local', '{}')",
                [],
            )
            .unwrap();
        let instance =
            Instance::create(db.conn(), "f.dat", 1, "f.dat", DeletionPolicy::Allowed).unwrap();
        (db, instance)
    }

    fn outgoing(db: &Database, instance: &Instance) -> OutgoingTransfer {
        OutgoingTransfer::new_transfer(
            db.conn(),
            "peer-b",
            "f.dat",
            instance.id,
            1,
            4,
            &checksum(),
            "/stores/vault/f.dat",
        )
        .unwrap()
    }

    #[test]
    fn outgoing_walks_the_machine() {
        let (db, instance) = setup();
        let mut t = outgoing(&db, &instance);

        t.advance(db.conn(), TransferStatus::Ongoing).unwrap();
        t.advance(db.conn(), TransferStatus::Staged).unwrap();
        t.advance(db.conn(), TransferStatus::Completed).unwrap();

        let reloaded = OutgoingTransfer::get(db.conn(), t.id).unwrap().unwrap();
        assert_eq!(reloaded.status, TransferStatus::Completed);
        assert!(reloaded.end_time.is_some());
    }

    #[test]
    fn out_of_order_transitions_rejected() {
        let (db, instance) = setup();
        let mut t = outgoing(&db, &instance);

        let err = t.advance(db.conn(), TransferStatus::Staged).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(t.status, TransferStatus::Initiated);

        // Same-state advances are idempotent no-ops.
        t.advance(db.conn(), TransferStatus::Initiated).unwrap();
    }

    #[test]
    fn failed_transfers_can_be_reinitiated() {
        let (db, instance) = setup();
        let mut t = outgoing(&db, &instance);
        t.fail(db.conn(), "transport died").unwrap();
        assert_eq!(t.status, TransferStatus::Failed);

        t.reinitiate(db.conn()).unwrap();
        let reloaded = OutgoingTransfer::get(db.conn(), t.id).unwrap().unwrap();
        assert_eq!(reloaded.status, TransferStatus::Initiated);
        assert!(reloaded.error.is_none());
    }

    #[test]
    fn one_live_transfer_per_destination_and_file() {
        let (db, instance) = setup();
        let _t = outgoing(&db, &instance);
        // Second live transfer for the same (destination, file) violates
        // the partial unique index.
        assert!(OutgoingTransfer::new_transfer(
            db.conn(),
            "peer-b",
            "f.dat",
            instance.id,
            1,
            4,
            &checksum(),
            "/stores/vault/f.dat",
        )
        .is_err());

        // A different destination is fine.
        assert!(OutgoingTransfer::new_transfer(
            db.conn(),
            "peer-c",
            "f.dat",
            instance.id,
            1,
            4,
            &checksum(),
            "/stores/vault/f.dat",
        )
        .is_ok());
    }

    #[test]
    fn incoming_idempotency_key_lookup() {
        let (db, _instance) = setup();
        let t = IncomingTransfer::new_transfer(
            db.conn(),
            "peer-a",
            77,
            "uploader",
            "g.dat",
            10,
            &checksum(),
        )
        .unwrap();

        let found = IncomingTransfer::find_by_source_key(db.conn(), "peer-a", 77)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, t.id);

        // Duplicate (source, source_transfer_id) rows are rejected.
        assert!(IncomingTransfer::new_transfer(
            db.conn(),
            "peer-a",
            77,
            "uploader",
            "g.dat",
            10,
            &checksum(),
        )
        .is_err());
    }

    #[test]
    fn incoming_machine_skips_ongoing() {
        let (db, _instance) = setup();
        let mut t = IncomingTransfer::new_transfer(
            db.conn(),
            "peer-a",
            1,
            "u",
            "g.dat",
            10,
            &checksum(),
        )
        .unwrap();

        assert!(t.advance(db.conn(), TransferStatus::Ongoing).is_err());
        t.advance(db.conn(), TransferStatus::Staged).unwrap();
        t.advance(db.conn(), TransferStatus::Ingesting).unwrap();
        t.advance(db.conn(), TransferStatus::Completed).unwrap();
    }

    #[test]
    fn stale_selects_by_age_and_status() {
        let (db, instance) = setup();
        let mut t = outgoing(&db, &instance);
        t.advance(db.conn(), TransferStatus::Ongoing).unwrap();

        // age 0: anything started before "now" is stale.
        assert_eq!(OutgoingTransfer::stale(db.conn(), 0).unwrap().len(), 1);
        // age 7: the fresh transfer is not stale.
        assert!(OutgoingTransfer::stale(db.conn(), 7).unwrap().is_empty());

        t.advance(db.conn(), TransferStatus::Staged).unwrap();
        t.advance(db.conn(), TransferStatus::Completed).unwrap();
        assert!(OutgoingTransfer::stale(db.conn(), 0).unwrap().is_empty());
    }
}

//! Re-hash recent files on a store and quarantine corrupted instances.

use arca_protocol::errors::{ErrorCategory, ErrorSeverity};

use crate::context::CoreContext;
use crate::error::{CoreError, Result};
use crate::models::{log_error, File, Instance, StoreRow};
use crate::tasks::{BackgroundTask, CheckIntegrityConfig, Deadline};

pub struct CheckIntegrity {
    config: CheckIntegrityConfig,
}

impl CheckIntegrity {
    pub fn from_config(config: CheckIntegrityConfig) -> Self {
        Self { config }
    }
}

impl BackgroundTask for CheckIntegrity {
    fn name(&self) -> &str {
        &self.config.task_name
    }

    fn run(&self, ctx: &CoreContext) -> Result<()> {
        let store = ctx
            .with_db(|c| StoreRow::get_by_name(c, &self.config.store))?
            .ok_or_else(|| CoreError::StoreNotFound(self.config.store.clone()))?;
        let driver = store.driver()?;

        let files = ctx.with_db(|c| File::recent_on_store(c, store.id, self.config.age_in_days))?;
        let deadline = Deadline::after(std::time::Duration::from_secs(
            self.config.soft_timeout_seconds,
        ));

        for file in files {
            if deadline.expired() {
                return Ok(());
            }
            let Some(instance) = ctx.with_db(|c| Instance::find(c, &file.name, store.id))? else {
                continue;
            };
            if !instance.available {
                continue;
            }

            let verdict = driver.path_info(&instance.path);
            let failure = match verdict {
                Ok(info) => {
                    if info.checksum.matches(&file.checksum) && info.size == file.size {
                        None
                    } else {
                        Some(format!(
                            "checksum/size mismatch on store '{}': expected {} ({} bytes), \
                             found {} ({} bytes)",
                            store.name, file.checksum, file.size, info.checksum, info.size
                        ))
                    }
                }
                Err(e) => Some(format!(
                    "instance unreadable on store '{}': {e}",
                    store.name
                )),
            };

            if let Some(reason) = failure {
                ctx.with_db(|c| {
                    log_error(
                        c,
                        ErrorSeverity::Critical,
                        ErrorCategory::Integrity,
                        &format!("file '{}': {reason}", file.name),
                    )?;
                    // Quarantine regardless of deletion policy; the bytes
                    // are already bad.
                    instance.mark_unavailable(c, true)?;
                    Ok(())
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{shared, Database};
    use crate::encryption::CredentialKey;
    use crate::ingest::ingest_staged_file;
    use crate::models::DeletionPolicy;
    use arca_protocol::errors::ErrorSeverity;
    use arca_store::checksum_of_bytes;

    fn ctx_with_store(tmp: &tempfile::TempDir) -> CoreContext {
        let db = shared(Database::open_in_memory().unwrap());
        let keys = CredentialKey::from_hex(&"00".repeat(32)).unwrap();
        let ctx = CoreContext::new(db, keys, "site-a");
        ctx.with_db(|c| {
            StoreRow::create(
                c,
                "vault",
                "local",
                true,
                &serde_json::json!({
                    "staging_path": tmp.path().join("staging"),
                    "store_path": tmp.path().join("store"),
                    "capacity_bytes": 1u64 << 20,
                }),
                &serde_json::json!({}),
                &serde_json::json!({}),
            )?;
            Ok(())
        })
        .unwrap();
        ctx
    }

    fn ingest(ctx: &CoreContext, name: &str, payload: &[u8]) {
        ctx.with_db(|c| {
            let store = StoreRow::get_by_name(c, "vault")?.unwrap();
            let slot = store.stage_ingest(name, payload.len() as u64)?;
            std::fs::write(&slot.path, payload)?;
            ingest_staged_file(
                c,
                &store,
                &slot.path,
                name,
                payload.len() as u64,
                &checksum_of_bytes(payload),
                "obs",
                "site-a",
                DeletionPolicy::Disallowed,
            )?;
            Ok(())
        })
        .unwrap();
    }

    fn task() -> CheckIntegrity {
        CheckIntegrity::from_config(CheckIntegrityConfig {
            task_name: "integrity".into(),
            every_seconds: 3600,
            soft_timeout_seconds: 60,
            age_in_days: 7,
            store: "vault".into(),
        })
    }

    #[test]
    fn intact_files_stay_available() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx_with_store(&tmp);
        ingest(&ctx, "good.dat", b"pristine");

        task().run(&ctx).unwrap();

        ctx.with_db(|c| {
            let instances = Instance::for_file(c, "good.dat")?;
            assert!(instances[0].available);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn corrupted_instances_are_quarantined() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx_with_store(&tmp);
        ingest(&ctx, "bad.dat", b"original contents");

        // Corrupt the bytes behind the instance.
        std::fs::write(tmp.path().join("store/bad.dat"), b"tampered contents").unwrap();

        task().run(&ctx).unwrap();

        ctx.with_db(|c| {
            let instances = Instance::for_file(c, "bad.dat")?;
            assert!(!instances[0].available);

            let rows = crate::models::ErrorLogRow::with_category(
                c,
                arca_protocol::errors::ErrorCategory::Integrity,
            )?;
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].severity, ErrorSeverity::Critical);
            assert!(rows[0].message.contains("bad.dat"));
            Ok(())
        })
        .unwrap();
    }
}

//! Local cloning: mirror files from one store onto others on the same
//! instance, via the synchronous transfer manager.

use arca_protocol::errors::{ErrorCategory, ErrorSeverity};

use crate::context::CoreContext;
use crate::error::{CoreError, Result};
use crate::models::{log_error, DeletionPolicy, File, Instance, StoreRow};
use crate::tasks::{BackgroundTask, CreateLocalCloneConfig, Deadline};

pub struct CreateLocalClone {
    config: CreateLocalCloneConfig,
}

impl CreateLocalClone {
    pub fn from_config(config: CreateLocalCloneConfig) -> Self {
        Self { config }
    }

    /// First destination store that can take the file right now, with a
    /// staging slot already allocated on it.
    fn pick_destination(
        &self,
        destinations: &[StoreRow],
        name: &str,
        size: u64,
    ) -> Option<(usize, arca_store::StagedEntry)> {
        for (index, store) in destinations.iter().enumerate() {
            match store.stage_clone(name, size) {
                Ok(slot) => return Some((index, slot)),
                Err(e) => {
                    tracing::debug!(store = %store.name, error = %e, "destination not usable");
                }
            }
        }
        None
    }

    fn clone_file(
        &self,
        ctx: &CoreContext,
        file: &File,
        source: &StoreRow,
        destinations: &[StoreRow],
    ) -> Result<bool> {
        let Some(instance) = ctx.with_db(|c| Instance::find(c, &file.name, source.id))? else {
            return Ok(true);
        };
        if !instance.available {
            return Ok(true);
        }

        let Some((dest_index, slot)) = self.pick_destination(destinations, &file.name, file.size)
        else {
            // Every destination is full (or unusable).
            if self.config.disable_store_on_full {
                ctx.with_db(|c| {
                    for store in destinations {
                        store.disable(c)?;
                        log_error(
                            c,
                            ErrorSeverity::Error,
                            ErrorCategory::Store,
                            &format!("store '{}' disabled: clone destinations are full", store.name),
                        )?;
                    }
                    Ok(())
                })?;
            } else {
                ctx.with_db(|c| {
                    log_error(
                        c,
                        ErrorSeverity::Error,
                        ErrorCategory::Store,
                        &format!(
                            "no clone destination can take '{}' ({} bytes)",
                            file.name, file.size
                        ),
                    )
                })?;
            }
            return Ok(false);
        };

        let dest = &destinations[dest_index];
        let dest_driver = dest.driver()?;
        let staged_path = slot.path.clone();

        let source_abs = source.driver()?.resolve(&instance.path)?;
        let copier = source.transfer_manager()?;

        let result = copier
            .submit(&source_abs, &staged_path)
            .map_err(CoreError::from)
            .and_then(|()| {
                ctx.transaction(|tx| {
                    let path = dest_driver.commit(&staged_path, &file.name, &file.checksum)?;
                    Instance::create(tx, &file.name, dest.id, &path, DeletionPolicy::Disallowed)?;
                    Ok(())
                })
            });

        if let Err(e) = result {
            let _ = dest_driver.unstage(&slot.dir);
            ctx.with_db(|c| {
                log_error(
                    c,
                    ErrorSeverity::Error,
                    ErrorCategory::Store,
                    &format!(
                        "local clone of '{}' from '{}' to '{}' failed: {e}",
                        file.name, source.name, dest.name
                    ),
                )
            })?;
        } else {
            tracing::info!(file = %file.name, from = %source.name, to = %dest.name, "cloned locally");
        }
        Ok(true)
    }
}

impl BackgroundTask for CreateLocalClone {
    fn name(&self) -> &str {
        &self.config.task_name
    }

    fn run(&self, ctx: &CoreContext) -> Result<()> {
        let source = ctx
            .with_db(|c| StoreRow::get_by_name(c, &self.config.clone_from))?
            .ok_or_else(|| CoreError::StoreNotFound(self.config.clone_from.clone()))?;

        let mut destinations = Vec::new();
        for name in &self.config.clone_to {
            let store = ctx
                .with_db(|c| StoreRow::get_by_name(c, name))?
                .ok_or_else(|| CoreError::StoreNotFound(name.clone()))?;
            destinations.push(store);
        }
        let dest_ids: Vec<i64> = destinations.iter().map(|s| s.id).collect();

        let files = ctx.with_db(|c| {
            File::needing_local_clone(
                c,
                source.id,
                &dest_ids,
                self.config.age_in_days,
                self.config.files_per_run,
            )
        })?;

        let deadline = Deadline::after(std::time::Duration::from_secs(
            self.config.soft_timeout_seconds,
        ));
        for file in files {
            if deadline.expired() {
                return Ok(());
            }
            if !self.clone_file(ctx, &file, &source, &destinations)? {
                return Ok(());
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
    use arca_store::checksum_of_bytes;

    fn add_store(ctx: &CoreContext, tmp: &tempfile::TempDir, name: &str, capacity: u64) {
        ctx.with_db(|c| {
            StoreRow::create(
                c,
                name,
                "local",
                true,
                &serde_json::json!({
                    "staging_path": tmp.path().join(name).join("staging"),
                    "store_path": tmp.path().join(name).join("store"),
                    "capacity_bytes": capacity,
                }),
                &serde_json::json!({"name": "local"}),
                &serde_json::json!({}),
            )?;
            Ok(())
        })
        .unwrap();
    }

    fn ingest(ctx: &CoreContext, store_name: &str, name: &str, payload: &[u8]) {
        ctx.with_db(|c| {
            let store = StoreRow::get_by_name(c, store_name)?.unwrap();
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

    fn task(disable_on_full: bool) -> CreateLocalClone {
        CreateLocalClone::from_config(CreateLocalCloneConfig {
            task_name: "local clone".into(),
            every_seconds: 3600,
            soft_timeout_seconds: 60,
            clone_from: "primary".into(),
            clone_to: vec!["mirror".into()],
            files_per_run: 16,
            age_in_days: 0,
            disable_store_on_full: disable_on_full,
        })
    }

    fn ctx() -> CoreContext {
        let db = shared(Database::open_in_memory().unwrap());
        let keys = CredentialKey::from_hex(&"00".repeat(32)).unwrap();
        CoreContext::new(db, keys, "site-a")
    }

    #[test]
    fn mirrors_files_onto_the_destination_store() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx();
        add_store(&ctx, &tmp, "primary", 1 << 20);
        add_store(&ctx, &tmp, "mirror", 1 << 20);
        ingest(&ctx, "primary", "obs.dat", b"observation");

        task(false).run(&ctx).unwrap();

        ctx.with_db(|c| {
            let instances = Instance::for_file(c, "obs.dat")?;
            assert_eq!(instances.len(), 2);
            let mirror = StoreRow::get_by_name(c, "mirror")?.unwrap();
            let copied = instances.iter().find(|i| i.store_id == mirror.id).unwrap();
            let bytes = std::fs::read(mirror.driver()?.resolve(&copied.path)?)?;
            assert_eq!(bytes, b"observation");
            Ok(())
        })
        .unwrap();

        // A second run finds nothing left to clone.
        task(false).run(&ctx).unwrap();
        ctx.with_db(|c| {
            assert_eq!(Instance::for_file(c, "obs.dat")?.len(), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn full_destinations_are_disabled_when_configured() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx();
        add_store(&ctx, &tmp, "primary", 1 << 20);
        // Too small for the payload.
        add_store(&ctx, &tmp, "mirror", 8);
        ingest(&ctx, "primary", "obs.dat", b"more than eight bytes");

        task(true).run(&ctx).unwrap();

        ctx.with_db(|c| {
            assert_eq!(Instance::for_file(c, "obs.dat")?.len(), 1);
            let mirror = StoreRow::get_by_name(c, "mirror")?.unwrap();
            assert!(!mirror.enabled);
            Ok(())
        })
        .unwrap();
    }
}

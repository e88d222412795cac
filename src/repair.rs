//! Background reconciliation of rows and indexes.
//!
//! Two workers run on the master node. The entity scanner probes random
//! backend keys: rows of deleted tables are removed, live rows are re-run
//! through their table's change-set path with no-op row mutations so every
//! index entry gets recomputed. The table scanner walks each table's primary
//! and secondary indexes and drops entries whose row no longer exists
//! (typically TTL expiry).
//!
//! Both workers sleep the configured frequency between operations so they
//! consume bounded CPU even on large keyspaces. Errors are logged and never
//! terminate the loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use crate::driver::Driver;
use crate::error::Result;
use crate::index::extract_id;
use crate::resp::Command;
use crate::schema::split_qualified;
use crate::table::Table;
use crate::value::Key;

/// Chunk size for index walks during repair.
const REPAIR_SCAN_CHUNK: usize = 10;

/// Handle to the running repair workers: run counters for observability and
/// a stop flag both workers poll every tick.
pub struct RepairHandle {
    stop: Arc<AtomicBool>,
    entity_runs: Arc<AtomicU64>,
    table_runs: Arc<AtomicU64>,
}

impl RepairHandle {
    pub fn stop(&self) {
        self.stop.store(true, AtomicOrdering::Relaxed);
    }

    pub fn entity_runs(&self) -> u64 {
        self.entity_runs.load(AtomicOrdering::Relaxed)
    }

    pub fn table_runs(&self) -> u64 {
        self.table_runs.load(AtomicOrdering::Relaxed)
    }
}

impl Drop for RepairHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn start(driver: Driver, freq: Duration) -> RepairHandle {
    tracing::info!("starting repair loop");
    let stop = Arc::new(AtomicBool::new(false));
    let entity_runs = Arc::new(AtomicU64::new(0));
    let table_runs = Arc::new(AtomicU64::new(0));

    {
        let driver = driver.clone();
        let stop = stop.clone();
        let runs = entity_runs.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(freq).await;
                if stop.load(AtomicOrdering::Relaxed) {
                    return;
                }
                if let Err(err) = driver.repair_entities_step().await {
                    tracing::error!(%err, "entity repair step failed");
                }
                runs.fetch_add(1, AtomicOrdering::Relaxed);
            }
        });
    }

    {
        let stop = stop.clone();
        let runs = table_runs.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(freq).await;
                if stop.load(AtomicOrdering::Relaxed) {
                    return;
                }
                if let Err(err) = driver.repair_tables_pass(freq).await {
                    tracing::error!(%err, "table repair pass failed");
                }
                runs.fetch_add(1, AtomicOrdering::Relaxed);
            }
        });
    }

    RepairHandle {
        stop,
        entity_runs,
        table_runs,
    }
}

impl Driver {
    /// One entity-scanner step: probe a random backend key. Rows of unknown
    /// tables are deleted; known rows are reloaded and reindexed.
    pub async fn repair_entities_step(&self) -> Result<()> {
        let mut conn = self.inner().pool.get().await?;
        let reply = conn.call(&Command::new("RANDOMKEY")).await?;
        let Some(key) = reply.as_str().map(str::to_string) else {
            return Ok(());
        };

        let Some((qualified, id)) = parse_entity_key(&key) else {
            return Ok(());
        };
        drop(conn);

        let Some(table) = self.table(&qualified) else {
            tracing::warn!(%key, "deleting key from non-existent table");
            let mut conn = self.inner().pool.get().await?;
            conn.call(&Command::new("DEL").arg(key.as_str())).await?;
            return Ok(());
        };

        let entities = table.load(&[id.clone()], &[]).await?;
        if entities.is_empty() {
            tracing::debug!(%id, table = table.name(), "row vanished before reindex");
            return Ok(());
        }
        tracing::debug!(%id, table = table.name(), "reindexing entity");
        table.reindex(entities).await
    }

    /// One table-scanner pass over every table, pausing `pause` between
    /// per-row operations.
    pub async fn repair_tables_pass(&self, pause: Duration) -> Result<()> {
        let tables: Vec<Arc<Table>> = self.inner().tables.read().values().cloned().collect();
        for table in tables {
            table.repair(pause).await;
        }
        Ok(())
    }
}

impl Table {
    /// Walks the primary and every secondary index, removing entries whose
    /// row no longer exists.
    pub(crate) async fn repair(&self, pause: Duration) {
        tracing::debug!(table = self.name(), "repairing table");

        let mut ids = self.primary.scan(&self.pool, REPAIR_SCAN_CHUNK);
        while let Some(id) = ids.recv().await {
            match self.load(&[id.clone()], &[]).await {
                Ok(entities) if entities.is_empty() => {
                    tracing::info!(%id, table = self.name(), "row gone, unindexing from primary");
                    if let Err(err) = self.primary.unindex(&self.pool, &[id]).await {
                        tracing::error!(%err, "could not unindex id");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(%err, "error loading row during repair");
                }
            }
            maybe_pause(pause).await;
        }

        for index in &self.indexes {
            let mut entries = index.raw_entries(&self.pool, REPAIR_SCAN_CHUNK);
            while let Some(entry) = entries.recv().await {
                let Some(id) = extract_id(&entry) else {
                    continue;
                };
                match self.load(&[id.clone()], &[]).await {
                    Ok(entities) if entities.is_empty() => {
                        tracing::info!(
                            %id,
                            index = index.redis_key(),
                            "row gone, removing index entry"
                        );
                        if let Err(err) = index.remove_entry(&self.pool, &entry).await {
                            tracing::error!(%err, "could not remove index entry");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!(%err, "error loading row during repair");
                    }
                }
                maybe_pause(pause).await;
            }
        }
    }
}

async fn maybe_pause(pause: Duration) {
    if !pause.is_zero() {
        tokio::time::sleep(pause).await;
    }
}

/// Splits a raw backend key into `(qualified_table, id)` if it is shaped like
/// a row key (`<schema>.<table>:<id>`). Index keys (`k:...`) and primary keys
/// (`...::PRIMARY`) do not match.
fn parse_entity_key(key: &str) -> Option<(String, Key)> {
    let (qualified, id) = key.split_once(':')?;
    split_qualified(qualified)?;
    if id.is_empty() || id.starts_with(':') {
        return None;
    }
    Some((qualified.to_string(), Key::new(id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_keys_parse() {
        let (table, id) = parse_entity_key("test.Users:abc123").unwrap();
        assert_eq!(table, "test.Users");
        assert_eq!(id.as_str(), "abc123");
    }

    #[test]
    fn non_row_keys_do_not_parse() {
        assert!(parse_entity_key("test.Users::PRIMARY").is_none());
        assert!(parse_entity_key("k:test.Users/name").is_none());
        assert!(parse_entity_key("plainkey").is_none());
        assert!(parse_entity_key("test.Users:").is_none());
        assert!(parse_entity_key("__mdz_schemas__").is_none());
    }

    #[test]
    fn ids_may_contain_colons_after_the_first() {
        let (table, id) = parse_entity_key("test.Apps:me.everything|en|").unwrap();
        assert_eq!(table, "test.Apps");
        assert_eq!(id.as_str(), "me.everything|en|");
    }
}

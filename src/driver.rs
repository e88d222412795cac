//! The driver: a registry of tables keyed by `<schema>.<table>`, fed by a
//! schema provider, dispatching Put/Get/Update/Delete/Dump.
//!
//! Table swaps happen atomically under a write lock; readers grab an `Arc`
//! to a stable table and run lock-free afterwards. When configured as master
//! with repair enabled, the driver owns the background repair loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::codec::{Decoder, Encoder};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::normalize::NormalizerPool;
use crate::pool::Pool;
use crate::query::{
    DelQuery, DelResponse, GetQuery, GetResponse, PingResponse, PutQuery, PutResponse,
    UpdateQuery, UpdateResponse,
};
use crate::repair::RepairHandle;
use crate::resp::Command;
use crate::schema::{Schema, SchemaProvider};
use crate::table::{Table, TableStats};
use crate::value::Entity;

/// How many rows a dump loads per chunk.
const DUMP_CHUNK_SIZE: usize = 50;
/// How many primary entries `stats` samples per table.
const STATS_SAMPLE_SIZE: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub tables: HashMap<String, TableStats>,
}

#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

pub(crate) struct DriverInner {
    pub(crate) tables: RwLock<HashMap<String, Arc<Table>>>,
    schemas: RwLock<HashMap<String, Schema>>,
    pub(crate) pool: Pool,
    encoder: Encoder,
    decoder: Decoder,
    normalizers: Arc<NormalizerPool>,
    pub(crate) config: Config,
    repair: Mutex<Option<RepairHandle>>,
}

impl Driver {
    /// Builds tables for every schema the provider knows, subscribes to its
    /// update stream, and starts the repair loop when this node is the
    /// master and repair is enabled.
    pub async fn init<P: SchemaProvider>(provider: &P, config: Config) -> Result<Driver> {
        let driver = Driver {
            inner: Arc::new(DriverInner {
                tables: RwLock::new(HashMap::new()),
                schemas: RwLock::new(HashMap::new()),
                pool: Pool::new(&config),
                encoder: Encoder::new(config.text_compress_threshold),
                decoder: Decoder::new(),
                normalizers: Arc::new(NormalizerPool::new()),
                config,
                repair: Mutex::new(None),
            }),
        };

        for schema in provider.schemas() {
            if let Err(err) = driver.handle_schema(schema) {
                tracing::error!(%err, "could not load schema into driver");
                return Err(err);
            }
        }

        driver.monitor_updates(provider.updates());

        let config = &driver.inner.config;
        if config.master && config.repair_enabled {
            let freq = config.repair_frequency();
            tracing::info!(freq_ms = freq.as_millis() as u64, "running repair loop");
            *driver.inner.repair.lock() = Some(crate::repair::start(driver.clone(), freq));
        }

        Ok(driver)
    }

    fn monitor_updates(&self, mut updates: tokio::sync::broadcast::Receiver<Schema>) {
        let driver = self.clone();
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(schema) => {
                        tracing::info!(schema = %schema.name, "detected schema change");
                        if let Err(err) = driver.handle_schema(schema) {
                            tracing::error!(%err, "could not apply schema update");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "schema update stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Builds or replaces the tables of one schema. Indexes present on the
    /// old table but absent from the new one get their backing keys deleted
    /// in the background.
    fn handle_schema(&self, mut schema: Schema) -> Result<()> {
        schema.validate()?;

        for spec in schema.tables.values() {
            tracing::debug!(table = %spec.name, "creating table");
            let table = Arc::new(Table::new(
                spec.clone(),
                self.inner.pool.clone(),
                self.inner.encoder.clone(),
                self.inner.decoder.clone(),
                self.inner.normalizers.clone(),
                self.inner.config.delete_chunk_size,
            )?);

            let dropped: Vec<String> = {
                let tables = self.inner.tables.read();
                match tables.get(spec.name.as_str()) {
                    Some(old) => old
                        .indexes
                        .iter()
                        .filter(|old_idx| {
                            !table
                                .indexes
                                .iter()
                                .any(|new_idx| new_idx.identity() == old_idx.identity())
                        })
                        .map(|idx| idx.redis_key().to_string())
                        .collect(),
                    None => Vec::new(),
                }
            };
            for key in dropped {
                tracing::info!(%key, "index dropped from schema, deleting backing key");
                let pool = self.inner.pool.clone();
                tokio::spawn(async move {
                    match pool.get().await {
                        Ok(mut conn) => {
                            if let Err(err) = conn.call(&Command::new("DEL").arg(key.as_str())).await
                            {
                                tracing::error!(%key, %err, "could not delete dropped index");
                            }
                        }
                        Err(err) => tracing::error!(%err, "could not get connection"),
                    }
                });
            }

            self.inner
                .tables
                .write()
                .insert(spec.name.clone(), table);
        }

        self.inner
            .schemas
            .write()
            .insert(schema.name.clone(), schema);
        Ok(())
    }

    pub(crate) fn table(&self, name: &str) -> Option<Arc<Table>> {
        let table = self.inner.tables.read().get(name).cloned();
        if table.is_none() {
            tracing::warn!(table = name, "non-existing table");
        }
        table
    }

    pub async fn put(&self, query: PutQuery) -> PutResponse {
        let start = Instant::now();
        let mut response = PutResponse::default();
        match self.do_put(query).await {
            Ok(ids) => response.ids = ids,
            Err(err) => response.error = Some(err),
        }
        response.elapsed = start.elapsed();
        response
    }

    async fn do_put(&self, query: PutQuery) -> Result<Vec<crate::value::Key>> {
        query.validate()?;
        let table = self
            .table(&query.table)
            .ok_or_else(|| Error::invalid_table(&query.table))?;
        table.put(query.entities).await
    }

    pub async fn get(&self, query: GetQuery) -> GetResponse {
        let start = Instant::now();
        let mut response = GetResponse::default();
        match self.do_get(query).await {
            Ok((entities, total)) => {
                response.entities = entities;
                response.total = total;
            }
            Err(err) => response.error = Some(err),
        }
        response.elapsed = start.elapsed();
        response
    }

    async fn do_get(&self, query: GetQuery) -> Result<(Vec<Entity>, usize)> {
        query.validate()?;
        let table = self
            .table(&query.table)
            .ok_or_else(|| Error::invalid_table(&query.table))?;
        table.get(&query).await
    }

    pub async fn update(&self, query: UpdateQuery) -> UpdateResponse {
        let start = Instant::now();
        let mut response = UpdateResponse::default();
        match self.do_update(query).await {
            Ok(num) => response.num = num,
            Err(err) => response.error = Some(err),
        }
        response.elapsed = start.elapsed();
        response
    }

    async fn do_update(&self, query: UpdateQuery) -> Result<usize> {
        query.validate()?;
        let table = self
            .table(&query.table)
            .ok_or_else(|| Error::invalid_table(&query.table))?;
        table.update(&query).await
    }

    pub async fn delete(&self, query: DelQuery) -> DelResponse {
        let start = Instant::now();
        let mut response = DelResponse::default();
        match self.do_delete(query).await {
            Ok(num) => response.num = num,
            Err(err) => response.error = Some(err),
        }
        response.elapsed = start.elapsed();
        response
    }

    async fn do_delete(&self, query: DelQuery) -> Result<usize> {
        query.validate()?;
        let table = self
            .table(&query.table)
            .ok_or_else(|| Error::invalid_table(&query.table))?;
        table.delete(&query.filters).await
    }

    pub async fn ping(&self) -> PingResponse {
        let start = Instant::now();
        let mut response = PingResponse::default();
        if let Err(err) = self.backend_ping().await {
            response.error = Some(err);
        }
        response.elapsed = start.elapsed();
        response
    }

    async fn backend_ping(&self) -> Result<()> {
        let mut conn = self.inner.pool.get().await?;
        conn.call(&Command::new("PING")).await?;
        Ok(())
    }

    /// Streams every entity of a table by paging its primary index. Dropping
    /// the stream (or calling [`DumpStream::stop`]) aborts the producer at
    /// the next chunk boundary.
    pub fn dump(&self, table: &str) -> Result<DumpStream> {
        let table = self
            .table(table)
            .ok_or_else(|| Error::invalid_table(table))?;

        let (tx, rx) = mpsc::channel(DUMP_CHUNK_SIZE);
        tokio::spawn(async move {
            let mut ids = table.primary.scan(&table.pool, DUMP_CHUNK_SIZE);
            let mut chunk = Vec::with_capacity(DUMP_CHUNK_SIZE);
            loop {
                let next = ids.recv().await;
                let drained = next.is_none();
                if let Some(id) = next {
                    chunk.push(id);
                    if chunk.len() < DUMP_CHUNK_SIZE {
                        continue;
                    }
                }
                if !chunk.is_empty() {
                    let entities = match table.load(&chunk, &[]).await {
                        Ok(entities) => entities,
                        Err(err) => {
                            tracing::error!(%err, "error loading entities for dump");
                            return;
                        }
                    };
                    chunk.clear();
                    for entity in entities {
                        if tx.send(entity).await.is_err() {
                            tracing::info!("dump stopped by caller");
                            return;
                        }
                    }
                }
                if drained {
                    return;
                }
            }
        });

        Ok(DumpStream { rx })
    }

    /// Readiness: at least one schema and table loaded, and the backend
    /// answers a ping.
    pub async fn status(&self) -> Result<()> {
        if self.inner.schemas.read().is_empty() {
            return Err(Error::backend("no loaded schema"));
        }
        if self.inner.tables.read().is_empty() {
            return Err(Error::backend("no loaded table"));
        }
        self.backend_ping().await
    }

    /// Sampled size estimates for every table.
    pub async fn stats(&self) -> Result<Stats> {
        let tables: Vec<Arc<Table>> = self.inner.tables.read().values().cloned().collect();
        let mut stats = Stats::default();
        for table in tables {
            match table.stats(STATS_SAMPLE_SIZE).await {
                Ok(ts) => {
                    stats.tables.insert(table.name().to_string(), ts);
                }
                Err(err) => tracing::error!(table = table.name(), %err, "error sampling table"),
            }
        }
        Ok(stats)
    }

    pub(crate) fn inner(&self) -> &DriverInner {
        &self.inner
    }

    /// Stops the repair loop, if this node was running one.
    pub fn stop_repair(&self) {
        if let Some(handle) = self.inner.repair.lock().take() {
            handle.stop();
        }
    }

    pub fn repair_running(&self) -> bool {
        self.inner.repair.lock().is_some()
    }
}

/// A paced stream of entities produced by `Driver::dump`.
pub struct DumpStream {
    rx: mpsc::Receiver<Entity>,
}

impl DumpStream {
    pub async fn next(&mut self) -> Option<Entity> {
        self.rx.recv().await
    }

    /// Aborts the dump; the producer notices at the next chunk boundary.
    pub fn stop(&mut self) {
        self.rx.close();
    }
}

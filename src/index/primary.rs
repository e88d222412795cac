//! Primary indexes: id ownership and existence.
//!
//! The primary is a sorted set of every live id in the table. The random
//! variant hands out URL-safe ids from 8 bytes of OS randomness; the compound
//! variant derives the id from the declared column values, optionally hashed
//! with FNV-1a/64. `find` verifies claimed ids against the row store and
//! read-repairs dangling entries out of the set.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::{mpsc, oneshot};

use crate::batch::{Batch, Transaction};
use crate::changeset::{ChangeKind, EntityDiff};
use crate::codec::Encoder;
use crate::error::{Error, Result};
use crate::index::{encoding, prepare_value, spawn_pipeline};
use crate::normalize::NormalizerPool;
use crate::pool::Pool;
use crate::query::{Filter, Filters, Operator, Ordering};
use crate::resp::Command;
use crate::value::{Entity, Key, Value, ID_KEY};

/// Buffered depth of the scan channels feeding dump and repair.
const SCAN_CHANNEL_DEPTH: usize = 64;

pub(crate) enum PrimaryIndex {
    Random(RandomPrimary),
    Compound(CompoundPrimary),
}

impl PrimaryIndex {
    pub(crate) fn random(table: &str) -> Self {
        PrimaryIndex::Random(RandomPrimary {
            base: PrimaryBase::new(table),
        })
    }

    pub(crate) fn compound(table: &str, columns: Vec<String>, hashed: bool) -> Self {
        PrimaryIndex::Compound(CompoundPrimary {
            base: PrimaryBase::new(table),
            columns,
            hashed,
        })
    }

    fn base(&self) -> &PrimaryBase {
        match self {
            PrimaryIndex::Random(idx) => &idx.base,
            PrimaryIndex::Compound(idx) => &idx.base,
        }
    }

    pub(crate) fn redis_key(&self) -> &str {
        &self.base().key
    }

    /// Columns this index covers: the compound variant reports its column
    /// list (they feed id recomputation), the random one just `id`.
    pub(crate) fn properties(&self) -> Vec<String> {
        match self {
            PrimaryIndex::Random(_) => vec![ID_KEY.to_string()],
            PrimaryIndex::Compound(idx) => idx.columns.clone(),
        }
    }

    pub(crate) fn matches(&self, filters: &Filters, _order: &Ordering) -> bool {
        if let Some(filter) = filters.one() {
            if filter.property == ID_KEY {
                return true;
            }
        }
        match self {
            PrimaryIndex::Random(_) => false,
            PrimaryIndex::Compound(idx) => {
                filters.len() == idx.columns.len()
                    && idx.columns.iter().all(|c| filters.contains(c))
            }
        }
    }

    /// Returns the id to store the entity under. Random primaries honor a
    /// caller-supplied id; compound primaries always recompute, because the
    /// id is a function of the column values.
    pub(crate) fn generate_id(
        &self,
        entity: &Entity,
        normalizers: &NormalizerPool,
        encoder: &Encoder,
    ) -> Result<Key> {
        match self {
            PrimaryIndex::Random(_) => {
                if !entity.id.is_null() {
                    return Ok(entity.id.clone());
                }
                let mut raw = [0u8; 8];
                OsRng.fill_bytes(&mut raw);
                Ok(Key::new(URL_SAFE_NO_PAD.encode(raw)))
            }
            PrimaryIndex::Compound(idx) => idx.generate_id(entity, normalizers, encoder),
        }
    }

    pub(crate) async fn find(
        &self,
        pool: &Pool,
        filters: &Filters,
        offset: usize,
        limit: Option<usize>,
        order: &Ordering,
        normalizers: &NormalizerPool,
        encoder: &Encoder,
    ) -> Result<(Vec<Key>, usize)> {
        if let Some(filter) = filters.one() {
            if filter.property == ID_KEY {
                return self.find_by_id(pool, filter, offset, limit, order).await;
            }
        }
        match self {
            PrimaryIndex::Random(_) => Err(Error::validation(
                "filters do not match the primary key",
            )),
            PrimaryIndex::Compound(idx) => {
                let ids = idx.filters_to_ids(filters, normalizers, encoder)?;
                let found = self.base().find_existing(pool, ids).await?;
                Ok(page_ids(found, offset, limit))
            }
        }
    }

    async fn find_by_id(
        &self,
        pool: &Pool,
        filter: &Filter,
        offset: usize,
        limit: Option<usize>,
        order: &Ordering,
    ) -> Result<(Vec<Key>, usize)> {
        let base = self.base();
        match filter.operator {
            Operator::All => {
                // the scan pages server-side, so the ids arrive pre-windowed;
                // the total is the index cardinality, which is what ALL matches
                let (ids, total) = base.scan_page(pool, offset, limit, order.ascending).await?;
                let found = base.find_existing(pool, ids).await?;
                Ok((found, total))
            }
            Operator::Eq | Operator::In => {
                let mut ids = Vec::with_capacity(filter.values.len());
                for value in &filter.values {
                    match value {
                        Value::Text(s) => ids.push(Key::new(s.clone())),
                        Value::Binary(b) => {
                            ids.push(Key::new(String::from_utf8_lossy(b).into_owned()))
                        }
                        other => {
                            tracing::warn!(value = ?other, "non-text id in primary key query");
                        }
                    }
                }
                let found = base.find_existing(pool, ids).await?;
                Ok(page_ids(found, offset, limit))
            }
            Operator::Between => Err(Error::op_not_supported(
                "BETWEEN is not supported by the primary key",
            )),
        }
    }

    /// Streams every id in the index in chunks. Dropping the receiver stops
    /// the scan at the next chunk boundary.
    pub(crate) fn scan(&self, pool: &Pool, chunk: usize) -> mpsc::Receiver<Key> {
        self.base().scan(pool.clone(), chunk)
    }

    pub(crate) async fn unindex(&self, pool: &Pool, ids: &[Key]) -> Result<()> {
        tracing::info!(key = self.redis_key(), count = ids.len(), "unindexing ids from primary");
        self.base().remove_ids(pool, ids).await
    }

    /// Indexing pipeline: ids of deleted entities are ZREMed, everything else
    /// is (re-)ZADDed.
    pub(crate) fn pipeline(
        &self,
        tx: &Transaction,
    ) -> (mpsc::Sender<EntityDiff>, oneshot::Receiver<Result<()>>) {
        spawn_pipeline(self.base().key.clone(), tx.clone(), |diff, writer| {
            let entry = Bytes::copy_from_slice(diff.id.as_bytes());
            if diff.kind == ChangeKind::Delete {
                writer.remove(entry);
            } else {
                writer.add(entry);
            }
        })
    }
}

pub(crate) struct RandomPrimary {
    base: PrimaryBase,
}

pub(crate) struct CompoundPrimary {
    base: PrimaryBase,
    columns: Vec<String>,
    hashed: bool,
}

impl CompoundPrimary {
    fn generate_id(
        &self,
        entity: &Entity,
        normalizers: &NormalizerPool,
        encoder: &Encoder,
    ) -> Result<Key> {
        let mut raw = BytesMut::with_capacity(self.columns.len() * 10);
        for column in &self.columns {
            let value = entity.get(column).ok_or_else(|| {
                Error::validation(format!(
                    "cannot index entity with missing value for {column}"
                ))
            })?;
            let prepared = prepare_value(value, normalizers, encoder)?.ok_or_else(|| {
                Error::validation(format!("cannot index entity with nil value for {column}"))
            })?;
            raw.put_slice(&prepared);
            raw.put_u8(b'|');
        }
        Ok(self.process_id(&raw))
    }

    fn process_id(&self, raw: &[u8]) -> Key {
        if raw.is_empty() {
            return Key::default();
        }
        if self.hashed {
            return Key::new(format!("{:x}", encoding::fnv1a_64(raw)));
        }
        Key::new(String::from_utf8_lossy(raw).into_owned())
    }

    /// Expands the filter set into the Cartesian product of candidate ids,
    /// one per combination of filter values, in column order.
    fn filters_to_ids(
        &self,
        filters: &Filters,
        normalizers: &NormalizerPool,
        encoder: &Encoder,
    ) -> Result<Vec<Key>> {
        let mut buffers: Vec<BytesMut> = vec![BytesMut::new()];

        for column in &self.columns {
            let filter = filters.get(column).ok_or_else(|| {
                Error::validation(format!("filter for {column} not found in query"))
            })?;
            if !matches!(filter.operator, Operator::Eq | Operator::In) {
                return Err(Error::op_not_supported(format!(
                    "operator {:?} on compound primary column {column}",
                    filter.operator
                )));
            }

            let mut next = Vec::with_capacity(buffers.len() * filter.values.len());
            for buffer in &buffers {
                for value in &filter.values {
                    let prepared = prepare_value(value, normalizers, encoder)?;
                    let mut candidate = buffer.clone();
                    if let Some(bytes) = prepared {
                        candidate.put_slice(&bytes);
                    }
                    candidate.put_u8(b'|');
                    next.push(candidate);
                }
            }
            buffers = next;
        }

        Ok(buffers.iter().map(|b| self.process_id(b)).collect())
    }
}

/// Storage shared by both primary variants: the sorted set of live ids.
struct PrimaryBase {
    table: String,
    key: String,
}

impl PrimaryBase {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            key: format!("{table}::PRIMARY"),
        }
    }

    fn row_key(&self, id: &Key) -> String {
        format!("{}:{}", self.table, id)
    }

    /// Verifies each claimed id against the row store and returns the ones
    /// that exist, in order. Dangling ids are read-repaired out of the
    /// primary set.
    async fn find_existing(&self, pool: &Pool, ids: Vec<Key>) -> Result<Vec<Key>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = pool.get().await?;
        let batch = Batch::new(conn);
        let mut exists = Vec::with_capacity(ids.len());
        for id in &ids {
            exists.push(
                batch
                    .send(Command::new("EXISTS").arg(self.row_key(id)))
                    .await,
            );
        }
        batch.execute().await?;

        let mut found = Vec::with_capacity(ids.len());
        let mut repairs = Vec::new();
        for (id, promise) in ids.into_iter().zip(&exists) {
            let alive = promise
                .reply()
                .map(|r| r.as_bool())
                .transpose()?
                .unwrap_or(false);
            if alive {
                found.push(id);
            } else {
                repairs.push(id);
            }
        }
        // release the batch connection before borrowing another for repairs
        drop(batch);

        if !repairs.is_empty() {
            tracing::info!(
                count = repairs.len(),
                key = %self.key,
                "repairing dangling entries in primary key"
            );
            self.remove_ids(pool, &repairs).await?;
        }

        Ok(found)
    }

    async fn scan_page(
        &self,
        pool: &Pool,
        offset: usize,
        limit: Option<usize>,
        ascending: bool,
    ) -> Result<(Vec<Key>, usize)> {
        let name = if ascending { "ZRANGE" } else { "ZREVRANGE" };
        let mut cmd = Command::new(name).arg(self.key.as_str());
        match limit {
            Some(limit) => {
                cmd.add(offset);
                cmd.add((offset + limit) as i64 - 1);
            }
            None => {
                cmd.add(0usize);
                cmd.add(-1i64);
            }
        }

        let tx = Transaction::new(pool.get().await?);
        let ids = tx.send(cmd).await;
        let total = tx.send(Command::new("ZCARD").arg(self.key.as_str())).await;
        tx.execute().await?;

        let ids = match ids.reply() {
            Some(reply) => reply.clone().into_strings()?,
            None => Vec::new(),
        };
        let total = total.reply().map(|r| r.as_int()).transpose()?.unwrap_or(0);
        Ok((ids.into_iter().map(Key::new).collect(), total as usize))
    }

    fn scan(&self, pool: Pool, chunk: usize) -> mpsc::Receiver<Key> {
        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_DEPTH);
        let base = PrimaryBase::new(&self.table);
        tokio::spawn(async move {
            let mut offset = 0;
            loop {
                let (ids, total) = match base.scan_page(&pool, offset, Some(chunk), true).await {
                    Ok(page) => page,
                    Err(err) => {
                        tracing::error!(key = %base.key, %err, "error scanning primary index");
                        return;
                    }
                };
                let count = ids.len();
                for id in ids {
                    if tx.send(id).await.is_err() {
                        return;
                    }
                }
                if count == 0 || total < offset + chunk {
                    return;
                }
                offset += chunk;
            }
        });
        rx
    }

    async fn remove_ids(&self, pool: &Pool, ids: &[Key]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut cmd = Command::new("ZREM").arg(self.key.as_str());
        for id in ids {
            cmd.add(id);
        }
        let mut conn = pool.get().await?;
        match conn.call(&cmd).await {
            Ok(_) => Ok(()),
            Err(err) => {
                conn.poison();
                Err(err)
            }
        }
    }
}

/// Windows a value-resolved id list by the query's paging. The total is the
/// full match count, independent of the slice.
fn page_ids(found: Vec<Key>, offset: usize, limit: Option<usize>) -> (Vec<Key>, usize) {
    let total = found.len();
    let ids = match limit {
        Some(limit) => found.into_iter().skip(offset).take(limit).collect(),
        None if offset > 0 => found.into_iter().skip(offset).collect(),
        None => found,
    };
    (ids, total)
}

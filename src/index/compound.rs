//! The compound secondary index.
//!
//! Entries live in one lexicographically sorted set per index, shaped as
//! `v1|v2|...|vK|::<id>` over prepared (normalized / order-preserving)
//! values. Queries whose filter columns are a prefix of the index columns
//! translate into a single lexicographic range; ordering rides on the last
//! column. See the module docs on `index` for the shared pipeline contract.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

use crate::batch::{Batch, Transaction};
use crate::changeset::{ChangeKind, EntityDiff};
use crate::codec::Encoder;
use crate::error::{Error, Result};
use crate::index::{build_entry, extract_id, prepare_value, spawn_pipeline};
use crate::normalize::NormalizerPool;
use crate::pool::Pool;
use crate::query::{Filters, Operator, Ordering};
use crate::resp::Command;
use crate::schema::IndexSpec;
use crate::value::Key;

const SCAN_CHANNEL_DEPTH: usize = 64;

pub(crate) struct CompoundIndex {
    columns: Vec<String>,
    key: String,
    identity: String,
}

impl CompoundIndex {
    pub(crate) fn new(spec: &IndexSpec, table: &str) -> Self {
        Self {
            key: format!("k:{table}/{}", spec.columns.join("_")),
            identity: spec.identity(table),
            columns: spec.columns.clone(),
        }
    }

    pub(crate) fn identity(&self) -> &str {
        &self.identity
    }

    pub(crate) fn redis_key(&self) -> &str {
        &self.key
    }

    pub(crate) fn properties(&self) -> &[String] {
        &self.columns
    }

    /// Would a change to any of these properties dirty this index?
    pub(crate) fn matches_properties<'a>(
        &self,
        mut properties: impl Iterator<Item = &'a str>,
    ) -> bool {
        properties.all(|p| self.columns.iter().any(|c| c == p))
    }

    /// Prefix matching: the filter columns must be a prefix of the index
    /// columns, and an ordering clause must name the last column. The score
    /// is the matched fraction of the column list, so the planner prefers
    /// tighter indexes.
    pub(crate) fn matches(&self, filters: &Filters, order: &Ordering) -> Option<f32> {
        let mut expected = filters.len();
        if !order.is_none() {
            if self.columns.last().map(String::as_str) != Some(order.by.as_str()) {
                tracing::debug!(index = %self.key, order = %order.by, "cannot order by this index");
                return None;
            }
            if !filters.contains(&order.by) {
                expected += 1;
            }
        }
        if expected > self.columns.len() {
            return None;
        }

        let mut matched = 0;
        for column in &self.columns {
            if !filters.contains(column) {
                if !order.is_none() && *column == order.by {
                    matched += 1;
                    continue;
                }
                return None;
            }
            matched += 1;
            if matched == expected {
                break;
            }
        }
        Some(matched as f32 / self.columns.len() as f32)
    }

    /// Builds the `[low`, `(high` lexicographic bounds for the filter set.
    /// Walks the columns in index order: equality filters extend both bounds,
    /// the single allowed BETWEEN extends them differently and must come
    /// last. Returns `None` when no filter column overlaps the index.
    fn range_bounds(
        &self,
        filters: &Filters,
        order: &Ordering,
        normalizers: &NormalizerPool,
        encoder: &Encoder,
    ) -> Result<Option<(Bytes, Bytes)>> {
        let mut low = BytesMut::from(&b"["[..]);
        let mut high = BytesMut::from(&b"("[..]);
        let mut matched = 0usize;
        let mut ranges = 0usize;

        for column in &self.columns {
            // the first missing column ends the prefix
            let Some(filter) = filters.get(column) else {
                break;
            };
            matched += 1;

            match filter.operator {
                Operator::Eq => {
                    if ranges > 0 {
                        return Err(Error::validation(
                            "ranges must come after equality filters in the index's column order",
                        ));
                    }
                    let prepared = prepare_value(&filter.values[0], normalizers, encoder)?
                        .unwrap_or_default();
                    low.put_slice(&prepared);
                    low.put_u8(b'|');
                    high.put_slice(&prepared);
                    high.put_u8(b'|');
                }
                Operator::Between => {
                    if !order.is_none() && order.by != *column {
                        return Err(Error::validation(
                            "range queries can only be ordered by the range property",
                        ));
                    }
                    if ranges > 0 {
                        return Err(Error::validation("only a single range per query allowed"));
                    }
                    ranges += 1;
                    let min = prepare_value(&filter.values[0], normalizers, encoder)?
                        .unwrap_or_default();
                    let max = prepare_value(&filter.values[1], normalizers, encoder)?
                        .unwrap_or_default();
                    low.put_slice(&min);
                    high.put_slice(&max);
                }
                other => {
                    return Err(Error::op_not_supported(format!(
                        "filter operator {other:?} for index {}",
                        self.key
                    )));
                }
            }
        }

        if matched == 0 {
            return Ok(None);
        }
        // make the high bound right-inclusive for the last appended value
        high.put_u8(0xff);
        Ok(Some((low.freeze(), high.freeze())))
    }

    /// Resolves ids within the filter range, paged. The total counts every
    /// key in the range regardless of paging.
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
        let Some((low, high)) = self.range_bounds(filters, order, normalizers, encoder)? else {
            return Err(Error::no_index());
        };
        tracing::debug!(
            index = %self.key,
            low = %String::from_utf8_lossy(&low),
            high = %String::from_utf8_lossy(&high),
            "range for filters"
        );

        let descending = !order.is_none() && !order.ascending;
        let mut cmd = if descending {
            Command::new("ZREVRANGEBYLEX")
                .arg(self.key.as_str())
                .arg(high.clone())
                .arg(low.clone())
        } else {
            Command::new("ZRANGEBYLEX")
                .arg(self.key.as_str())
                .arg(low.clone())
                .arg(high.clone())
        };
        if let Some(limit) = limit {
            cmd.add("LIMIT");
            cmd.add(offset);
            cmd.add(limit);
        }

        let batch = Batch::new(pool.get().await?);
        let entries = batch.send(cmd).await;
        let total = batch
            .send(
                Command::new("ZLEXCOUNT")
                    .arg(self.key.as_str())
                    .arg(low)
                    .arg(high),
            )
            .await;
        batch.execute().await?;

        let entries = match entries.reply() {
            Some(reply) => reply.clone().into_byte_options()?,
            None => Vec::new(),
        };
        let ids = entries
            .into_iter()
            .flatten()
            .filter_map(|entry| extract_id(&entry))
            .collect();
        let total = total.reply().map(|r| r.as_int()).transpose()?.unwrap_or(0);
        Ok((ids, total as usize))
    }

    /// Indexing pipeline. DELETE diffs drop the old entry; INSERT/UPDATE
    /// diffs swap old for new only when they differ.
    pub(crate) fn pipeline(
        &self,
        tx: &Transaction,
    ) -> (mpsc::Sender<EntityDiff>, oneshot::Receiver<Result<()>>) {
        let columns = self.columns.clone();
        spawn_pipeline(self.key.clone(), tx.clone(), move |diff, writer| {
            let old = entry_for(&columns, diff, false);
            if diff.kind == ChangeKind::Delete {
                if let Some(old) = old {
                    writer.remove(old);
                }
                return;
            }
            let new = entry_for(&columns, diff, true);
            if new != old {
                if let Some(new) = new {
                    writer.add(new);
                }
                if let Some(old) = old {
                    writer.remove(old);
                }
            }
        })
    }

    async fn scan_raw(
        &self,
        pool: &Pool,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Bytes>, usize)> {
        let mut cmd = Command::new("ZRANGE").arg(self.key.as_str());
        cmd.add(offset);
        cmd.add((offset + limit) as i64 - 1);

        let tx = Transaction::new(pool.get().await?);
        let entries = tx.send(cmd).await;
        let total = tx.send(Command::new("ZCARD").arg(self.key.as_str())).await;
        tx.execute().await?;

        let entries = match entries.reply() {
            Some(reply) => reply
                .clone()
                .into_byte_options()?
                .into_iter()
                .flatten()
                .collect(),
            None => Vec::new(),
        };
        let total = total.reply().map(|r| r.as_int()).transpose()?.unwrap_or(0);
        Ok((entries, total as usize))
    }

    /// Streams raw entries for repair. Dropping the receiver stops the scan
    /// at the next chunk boundary.
    pub(crate) fn raw_entries(&self, pool: &Pool, chunk: usize) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_DEPTH);
        let index = CompoundIndex {
            columns: self.columns.clone(),
            key: self.key.clone(),
            identity: self.identity.clone(),
        };
        let pool = pool.clone();
        tokio::spawn(async move {
            let mut offset = 0;
            loop {
                let (entries, total) = match index.scan_raw(&pool, offset, chunk).await {
                    Ok(page) => page,
                    Err(err) => {
                        tracing::error!(key = %index.key, %err, "error scanning index");
                        return;
                    }
                };
                let count = entries.len();
                for entry in entries {
                    if tx.send(entry).await.is_err() {
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

    /// Streams ids (entry suffixes) for dump-style enumeration.
    #[allow(dead_code)]
    pub(crate) fn scan(&self, pool: &Pool, chunk: usize) -> mpsc::Receiver<Key> {
        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_DEPTH);
        let mut raw = self.raw_entries(pool, chunk);
        tokio::spawn(async move {
            while let Some(entry) = raw.recv().await {
                if let Some(id) = extract_id(&entry) {
                    if tx.send(id).await.is_err() {
                        return;
                    }
                }
            }
        });
        rx
    }

    /// Removes one raw entry; used by repair when the entry's row is gone.
    pub(crate) async fn remove_entry(&self, pool: &Pool, entry: &[u8]) -> Result<()> {
        let cmd = Command::new("ZREM")
            .arg(self.key.as_str())
            .arg(entry.to_vec());
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

fn entry_for(columns: &[String], diff: &EntityDiff, use_new: bool) -> Option<Bytes> {
    build_entry(columns, &diff.id, |column| {
        let pd = diff.diffs.get(column)?;
        Some(if use_new {
            pd.new.as_ref()
        } else {
            pd.old.as_ref()
        })
    })
}

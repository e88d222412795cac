//! A table: one primary index, N secondary indexes, and the read/write paths
//! over them.
//!
//! Reads route to the best-scoring index for the filter set; writes are
//! serialized through a [`ChangeSet`](crate::changeset::ChangeSet) so the row
//! and every affected index stay coherent.

use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use rustc_hash::FxHashMap;

use crate::changeset::{ChangeKind, ChangeSet, EntityChange};
use crate::codec::{Decoder, Encoder};
use crate::error::{Error, Result};
use crate::index::{encoding, CompoundIndex, PrimaryIndex};
use crate::normalize::NormalizerPool;
use crate::pool::Pool;
use crate::query::{Change, Filters, GetQuery, Ordering, UpdateQuery};
use crate::resp::Command;
use crate::schema::{PrimarySpec, TableSpec};
use crate::value::{Entity, Key, Value, ID_KEY};

/// Extrapolated sizing for one table, sampled from the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub rows: usize,
    pub data_bytes: usize,
    pub keys_bytes: usize,
}

pub(crate) struct Table {
    pub(crate) spec: TableSpec,
    pub(crate) primary: PrimaryIndex,
    pub(crate) indexes: Vec<CompoundIndex>,
    pub(crate) pool: Pool,
    pub(crate) encoder: Encoder,
    pub(crate) decoder: Decoder,
    pub(crate) normalizers: Arc<NormalizerPool>,
    delete_chunk: usize,
    /// Memoized indexable-property lists, keyed by change kind plus the
    /// FNV-1a signature of the sorted changed-property list.
    indexable: RwLock<FxHashMap<(u8, u64), Arc<Vec<String>>>>,
}

impl Table {
    pub(crate) fn new(
        spec: TableSpec,
        pool: Pool,
        encoder: Encoder,
        decoder: Decoder,
        normalizers: Arc<NormalizerPool>,
        delete_chunk: usize,
    ) -> Result<Self> {
        let primary = match spec.primary() {
            PrimarySpec::Random => PrimaryIndex::random(&spec.name),
            PrimarySpec::Compound { columns, hashed } => {
                PrimaryIndex::compound(&spec.name, columns.clone(), *hashed)
            }
        };
        let indexes = spec
            .indexes
            .iter()
            .map(|idx| CompoundIndex::new(idx, &spec.name))
            .collect();

        Ok(Self {
            spec,
            primary,
            indexes,
            pool,
            encoder,
            decoder,
            normalizers,
            delete_chunk: delete_chunk.max(1),
            indexable: RwLock::new(FxHashMap::default()),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.spec.name
    }

    /// The backend key holding this entity's field map.
    pub(crate) fn row_key(&self, id: &Key) -> String {
        format!("{}:{}", self.spec.name, id)
    }

    /// Writes entities with overwrite semantics and returns their ids in
    /// order. The primary always gets a say on the id: a compound primary
    /// recomputes it from the column values even when the caller supplied
    /// one, and a differing id marks the change as an insert.
    pub(crate) async fn put(&self, entities: Vec<Entity>) -> Result<Vec<Key>> {
        let mut ids = Vec::with_capacity(entities.len());
        let mut cs = ChangeSet::new(self, entities.len());

        for mut entity in entities {
            let id = self
                .primary
                .generate_id(&entity, &self.normalizers, &self.encoder)?;
            let kind = if id != entity.id {
                entity.id = id.clone();
                ChangeKind::Insert
            } else {
                ChangeKind::Update
            };
            ids.push(id.clone());

            let mut changes: Vec<Change> = entity
                .properties
                .iter()
                .map(|(name, value)| Change::set(name.clone(), value.clone()))
                .collect();
            // the expiry must land after the row writes
            if !entity.ttl.is_zero() {
                changes.push(Change::expire(entity.ttl));
            }

            cs.add(EntityChange::new(id, kind, changes));
        }

        cs.execute().await?;
        tracing::debug!(table = self.name(), count = ids.len(), "put entities");
        Ok(ids)
    }

    /// Resolves the ids matching a filter set, paged. `None` limit means all.
    pub(crate) async fn get_ids(
        &self,
        filters: &Filters,
        offset: usize,
        limit: Option<usize>,
        order: &Ordering,
    ) -> Result<(Vec<Key>, usize)> {
        if self.primary.matches(filters, order) {
            // every primary branch windows its own ids by offset/limit
            return self
                .primary
                .find(
                    &self.pool,
                    filters,
                    offset,
                    limit,
                    order,
                    &self.normalizers,
                    &self.encoder,
                )
                .await;
        }

        let index = self.select_index(filters, order).ok_or_else(Error::no_index)?;
        index
            .find(
                &self.pool,
                filters,
                offset,
                limit,
                order,
                &self.normalizers,
                &self.encoder,
            )
            .await
    }

    /// Picks the secondary index with the best match score, if any.
    fn select_index(&self, filters: &Filters, order: &Ordering) -> Option<&CompoundIndex> {
        let mut best: Option<(&CompoundIndex, f32)> = None;
        for index in &self.indexes {
            if let Some(score) = index.matches(filters, order) {
                tracing::debug!(index = index.redis_key(), score, "index match");
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((index, score));
                }
            }
        }
        best.map(|(index, _)| index)
    }

    pub(crate) async fn get(&self, query: &GetQuery) -> Result<(Vec<Entity>, usize)> {
        let (ids, total) = self
            .get_ids(
                &query.filters,
                query.paging.offset,
                Some(query.paging.limit),
                &query.order,
            )
            .await?;
        let entities = self.load(&ids, &query.properties).await?;
        Ok((entities, total))
    }

    /// Applies the same change list to every row matching the filters.
    /// Returns the number of rows written.
    pub(crate) async fn update(&self, query: &UpdateQuery) -> Result<usize> {
        let (ids, _) = self
            .get_ids(&query.filters, 0, None, &Ordering::default())
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }
        tracing::debug!(table = self.name(), rows = ids.len(), "updating rows");

        let mut cs = ChangeSet::new(self, ids.len());
        for id in ids {
            cs.add(EntityChange::new(
                id,
                ChangeKind::Update,
                query.changes.clone(),
            ));
        }
        cs.execute().await
    }

    /// Deletes matching rows in chunks until none remain. Each chunk is one
    /// change set, so the rows and their index entries go together.
    pub(crate) async fn delete(&self, filters: &Filters) -> Result<usize> {
        let mut total = 0;
        loop {
            let (ids, _) = self
                .get_ids(filters, 0, Some(self.delete_chunk), &Ordering::default())
                .await?;
            if ids.is_empty() {
                break;
            }

            let mut cs = ChangeSet::new(self, ids.len());
            for id in ids {
                cs.add(EntityChange::new(
                    id,
                    ChangeKind::Delete,
                    vec![Change::delete()],
                ));
            }
            total += cs.execute().await?;
        }
        tracing::info!(table = self.name(), total, "deleted rows");
        Ok(total)
    }

    /// Re-submits entities through the change-set path with no-op row
    /// mutations, recomputing every index entry. Used by the repair loop.
    pub(crate) async fn reindex(&self, entities: Vec<Entity>) -> Result<()> {
        let mut cs = ChangeSet::new(self, entities.len());
        for entity in entities {
            if entity.id.is_null() {
                return Err(Error::validation(
                    "cannot reindex an entity with an empty id",
                ));
            }
            let changes: Vec<Change> = entity
                .properties
                .iter()
                .map(|(name, value)| Change::noop(name.clone(), value.clone()))
                .collect();
            cs.add(EntityChange::new(entity.id, ChangeKind::Reindex, changes));
        }
        let count = cs.len();
        cs.execute().await?;
        tracing::debug!(table = self.name(), count, "reindexed entities");
        Ok(())
    }

    /// Loads rows by id. Missing rows are skipped, so the result can be
    /// shorter than `ids`. An empty `properties` list loads everything.
    pub(crate) async fn load(&self, ids: &[Key], properties: &[String]) -> Result<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let batch = crate::batch::Batch::new(self.pool.get().await?);
        let mut promises = Vec::with_capacity(ids.len());
        for id in ids {
            let cmd = if properties.is_empty() {
                Command::new("HGETALL").arg(self.row_key(id))
            } else {
                let mut cmd = Command::new("HMGET").arg(self.row_key(id));
                for prop in properties {
                    cmd.add(prop.as_str());
                }
                cmd
            };
            promises.push(batch.send(cmd).await);
        }
        batch.execute().await?;

        let mut entities = Vec::with_capacity(ids.len());
        for (id, promise) in ids.iter().zip(promises) {
            let Some(reply) = promise.reply() else {
                continue;
            };
            let values = reply.clone().into_byte_options()?;

            let mut entity = Entity::with_id(id.clone());
            if properties.is_empty() {
                // HGETALL: flat field/value pairs
                for pair in values.chunks_exact(2) {
                    let (Some(field), Some(value)) = (&pair[0], &pair[1]) else {
                        continue;
                    };
                    let name = String::from_utf8_lossy(field).into_owned();
                    self.read_property(&mut entity, name, value);
                }
            } else {
                // HMGET: zip the requested properties with the values
                for (name, value) in properties.iter().zip(values) {
                    let Some(value) = value else { continue };
                    self.read_property(&mut entity, name.clone(), &value);
                }
            }

            // rows that loaded nothing are dead (expired or deleted)
            if !entity.properties.is_empty() {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    fn read_property(&self, entity: &mut Entity, name: String, raw: &[u8]) {
        if name == ID_KEY {
            return;
        }
        match self.decoder.decode(raw) {
            Ok(Value::Nil) => {}
            Ok(value) => {
                entity.properties.insert(name, value);
            }
            Err(err) => {
                tracing::error!(table = self.name(), property = %name, %err, "error loading property");
            }
        }
    }

    /// Random-samples primary entries and extrapolates row count and byte
    /// sizes from the backend's serialized lengths.
    pub(crate) async fn stats(&self, samples: usize) -> Result<TableStats> {
        let mut conn = self.pool.get().await?;

        let rows = conn
            .call(&Command::new("ZCARD").arg(self.primary.redis_key()))
            .await?
            .as_int()? as usize;
        let samples = samples.min(rows);

        let mut data_bytes = 0usize;
        let mut keys_bytes = 0usize;
        for _ in 0..samples {
            let offset = rand::thread_rng().gen_range(0..rows);
            let entries = conn
                .call(
                    &Command::new("ZRANGE")
                        .arg(self.primary.redis_key())
                        .arg(offset)
                        .arg(offset),
                )
                .await?
                .into_strings()?;
            let Some(id) = entries.first() else { continue };

            let info = conn
                .call(
                    &Command::new("DEBUG")
                        .arg("OBJECT")
                        .arg(self.row_key(&Key::new(id.clone()))),
                )
                .await?;
            let Some(info) = info.as_str() else { continue };
            if let Some(size) = parse_serialized_length(info) {
                data_bytes += size;
                keys_bytes += id.len();
            }
        }

        if rows > samples && samples > 0 {
            let ratio = rows as f64 / samples as f64;
            data_bytes = (data_bytes as f64 * ratio) as usize;
            keys_bytes = (keys_bytes as f64 * ratio) as usize;
        }

        Ok(TableStats {
            rows,
            data_bytes,
            keys_bytes,
        })
    }

    /// Which properties must be read before applying this change so every
    /// affected index can be re-pointed: the primary's columns, plus the full
    /// column list of every secondary the change dirties (all of them, for
    /// deletes).
    pub(crate) fn indexable_properties(
        &self,
        change: &EntityChange,
    ) -> Arc<Vec<String>> {
        let mut signature = Vec::with_capacity(change.changed_properties.len() * 8);
        for prop in &change.changed_properties {
            signature.extend_from_slice(prop.as_bytes());
            signature.push(0);
        }
        let key = (change.kind.discriminant(), encoding::fnv1a_64(&signature));

        if let Some(cached) = self.indexable.read().get(&key) {
            return cached.clone();
        }

        let mut props: Vec<String> = self.primary.properties();
        if change.kind == ChangeKind::Delete {
            for index in &self.indexes {
                for prop in index.properties() {
                    if !props.contains(prop) {
                        props.push(prop.clone());
                    }
                }
            }
        } else {
            for changed in &change.changed_properties {
                for index in &self.indexes {
                    if index.matches_properties(std::iter::once(changed.as_str())) {
                        for prop in index.properties() {
                            if !props.contains(prop) {
                                props.push(prop.clone());
                            }
                        }
                    }
                }
            }
        }

        let props = Arc::new(props);
        self.indexable.write().insert(key, props.clone());
        props
    }
}

fn parse_serialized_length(info: &str) -> Option<usize> {
    let rest = info.split("serializedlength:").nth(1)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

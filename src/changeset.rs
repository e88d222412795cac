//! The per-batch unit of mutation.
//!
//! A change set collects entity changes for one table and executes them in
//! three phases on a single backend transaction:
//!
//! 1. **Read**: for UPDATE/DELETE changes, HMGET the properties any affected
//!    index sorts on, so diffs can be computed.
//! 2. **Row mutation**: emit the backend primitives for every change op.
//! 3. **Commit and index**: execute the transaction (the reads return), build
//!    per-property diffs, stream them through every index's pipeline, and
//!    execute a second time to flush the index mutations.
//!
//! Nothing partially commits: any backend error discards the transaction and
//! surfaces unchanged. Index drift caused by a crash between the two
//! executions is reconciled by the repair loop, never inline.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::batch::{Promise, Transaction};
use crate::error::{Error, Result};
use crate::index::prepare_value;
use crate::query::{Change, ChangeOp};
use crate::resp::Command;
use crate::table::Table;
use crate::value::{Key, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangeKind {
    Update,
    Insert,
    Delete,
    Reindex,
}

impl ChangeKind {
    pub(crate) fn discriminant(self) -> u8 {
        match self {
            ChangeKind::Update => 0,
            ChangeKind::Insert => 1,
            ChangeKind::Delete => 2,
            ChangeKind::Reindex => 3,
        }
    }
}

/// One entity's worth of requested changes.
pub(crate) struct EntityChange {
    pub(crate) id: Key,
    pub(crate) kind: ChangeKind,
    pub(crate) changes: Vec<Change>,
    /// Sorted property names touched by the change list.
    pub(crate) changed_properties: Vec<String>,
}

impl EntityChange {
    pub(crate) fn new(id: Key, kind: ChangeKind, changes: Vec<Change>) -> Self {
        let mut changed_properties: Vec<String> = changes
            .iter()
            .filter(|c| !c.property.is_empty())
            .map(|c| c.property.clone())
            .collect();
        changed_properties.sort();
        changed_properties.dedup();
        Self {
            id,
            kind,
            changes,
            changed_properties,
        }
    }

    /// Translates the change ops into row-mutation commands. A whole-entity
    /// DEL short-circuits everything else for that change.
    fn commands(&self, table: &Table) -> Result<Vec<Command>> {
        let row_key = table.row_key(&self.id);
        let mut hmset = Command::new("HMSET").arg(row_key.as_str());
        let mut extra = Vec::new();

        for change in &self.changes {
            match change.op {
                ChangeOp::Noop => continue,
                ChangeOp::Set => {
                    let encoded = table.encoder.encode(&change.value)?;
                    hmset.add(change.property.as_str());
                    hmset.add(encoded);
                }
                ChangeOp::Del => {
                    return Ok(vec![Command::new("DEL").arg(row_key.as_str())]);
                }
                ChangeOp::Increment => {
                    let delta = change.value.as_int().ok_or_else(|| {
                        Error::validation(format!(
                            "increment of {} requires an integer value",
                            change.property
                        ))
                    })?;
                    extra.push(
                        Command::new("HINCRBY")
                            .arg(row_key.as_str())
                            .arg(change.property.as_str())
                            .arg(delta),
                    );
                }
                ChangeOp::PropDel => {
                    extra.push(
                        Command::new("HDEL")
                            .arg(row_key.as_str())
                            .arg(change.property.as_str()),
                    );
                }
                ChangeOp::Expire => {
                    let millis = match &change.value {
                        Value::Uint(ms) => *ms,
                        Value::Int(ms) if *ms >= 0 => *ms as u64,
                        other => {
                            return Err(Error::validation(format!(
                                "invalid value for TTL: {other:?}"
                            )))
                        }
                    };
                    extra.push(
                        Command::new("PEXPIRE")
                            .arg(row_key.as_str())
                            .arg(millis),
                    );
                }
                other => {
                    tracing::error!(op = ?other, "unsupported change op");
                    return Err(Error::op_not_supported(format!("change op {other:?}")));
                }
            }
        }

        let mut commands = Vec::with_capacity(extra.len() + 1);
        if hmset.arg_count() > 1 {
            commands.push(hmset);
        }
        commands.extend(extra);
        Ok(commands)
    }
}

/// Per-property diff driving the index pipelines: prepared old and new
/// values, whether the change actually touched the property, and whether it
/// was loaded only to keep compound entries intact.
#[derive(Debug, Clone, Default)]
pub(crate) struct PropertyDiff {
    pub(crate) old: Option<Bytes>,
    pub(crate) new: Option<Bytes>,
    pub(crate) changed: bool,
    pub(crate) load_only: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct EntityDiff {
    pub(crate) id: Key,
    pub(crate) kind: ChangeKind,
    pub(crate) diffs: BTreeMap<String, PropertyDiff>,
}

/// Decoded old/new values for one property, before index preparation.
#[derive(Default)]
struct RawDiff {
    old: Option<Value>,
    new: Option<Value>,
    changed: bool,
    load_only: bool,
}

pub(crate) struct ChangeSet<'a> {
    table: &'a Table,
    changes: Vec<EntityChange>,
}

impl<'a> ChangeSet<'a> {
    pub(crate) fn new(table: &'a Table, capacity_hint: usize) -> Self {
        Self {
            table,
            changes: Vec::with_capacity(capacity_hint),
        }
    }

    pub(crate) fn add(&mut self, change: EntityChange) {
        self.changes.push(change);
    }

    pub(crate) fn len(&self) -> usize {
        self.changes.len()
    }

    /// Runs all three phases. Returns the number of changes executed.
    pub(crate) async fn execute(&self) -> Result<usize> {
        if self.changes.is_empty() {
            return Ok(0);
        }

        let conn = self.table.pool.get().await?;
        let tx = Transaction::new(conn);

        // phase 1: queue reads of indexable properties, phase 2: row mutation
        let mut pending: Vec<(std::sync::Arc<Vec<String>>, Option<Promise>, &EntityChange)> =
            Vec::with_capacity(self.changes.len());
        for change in &self.changes {
            let indexable = self.table.indexable_properties(change);
            if !indexable.is_empty() {
                let promise = match change.kind {
                    ChangeKind::Update | ChangeKind::Delete => {
                        let mut cmd =
                            Command::new("HMGET").arg(self.table.row_key(&change.id));
                        for prop in indexable.iter() {
                            cmd.add(prop.as_str());
                        }
                        Some(tx.send(cmd).await)
                    }
                    ChangeKind::Insert | ChangeKind::Reindex => None,
                };
                pending.push((indexable, promise, change));
            }

            for cmd in change.commands(self.table)? {
                tx.send(cmd).await;
            }
        }

        tx.execute().await?;

        // phase 3: diff, feed every index pipeline, flush the index commands
        let mut diffs = Vec::with_capacity(pending.len());
        for (properties, promise, change) in &pending {
            diffs.push(self.build_diff(properties, promise.as_ref(), change)?);
        }

        self.feed_pipeline(self.table.primary.pipeline(&tx), &diffs)
            .await?;
        for index in &self.table.indexes {
            self.feed_pipeline(index.pipeline(&tx), &diffs).await?;
        }

        tx.execute().await?;
        Ok(self.changes.len())
    }

    async fn feed_pipeline(
        &self,
        pipeline: (
            tokio::sync::mpsc::Sender<EntityDiff>,
            tokio::sync::oneshot::Receiver<Result<()>>,
        ),
        diffs: &[EntityDiff],
    ) -> Result<()> {
        let (sender, done) = pipeline;
        for diff in diffs {
            if sender.send(diff.clone()).await.is_err() {
                return Err(Error::backend("index pipeline went away"));
            }
        }
        drop(sender);
        done.await
            .map_err(|_| Error::backend("index pipeline dropped its result"))?
    }

    /// Builds the entity diff for one change: decoded old values from the
    /// phase-1 read, new values from the change list, both passed through
    /// index preparation. Loaded-but-unchanged properties keep their old
    /// value on both sides so compound entries containing them survive.
    fn build_diff(
        &self,
        properties: &[String],
        promise: Option<&Promise>,
        change: &EntityChange,
    ) -> Result<EntityDiff> {
        let olds: Option<Vec<Option<Bytes>>> = match promise.and_then(|p| p.reply()) {
            Some(reply) => Some(reply.clone().into_byte_options()?),
            None => None,
        };

        let mut raw: BTreeMap<&str, RawDiff> = BTreeMap::new();
        for (i, property) in properties.iter().enumerate() {
            let mut diff = RawDiff {
                load_only: change
                    .changed_properties
                    .binary_search(property)
                    .is_err(),
                ..RawDiff::default()
            };
            if let Some(olds) = &olds {
                if let Some(Some(bytes)) = olds.get(i) {
                    match self.table.decoder.decode(bytes) {
                        Ok(Value::Nil) => {}
                        Ok(value) => diff.old = Some(value),
                        Err(err) => {
                            return Err(Error::codec(format!(
                                "could not decode stored value of {property}: {err}"
                            )))
                        }
                    }
                }
            }
            raw.insert(property.as_str(), diff);
        }

        if change.kind != ChangeKind::Delete {
            for ch in &change.changes {
                if let Some(diff) = raw.get_mut(ch.property.as_str()) {
                    diff.changed = match &diff.old {
                        None => !ch.value.is_nil(),
                        Some(old) => *old != ch.value,
                    };
                    diff.new = Some(ch.value.clone());
                }
            }
        }

        let mut diffs = BTreeMap::new();
        for (property, raw_diff) in raw {
            let old = match &raw_diff.old {
                Some(value) => {
                    prepare_value(value, &self.table.normalizers, &self.table.encoder)?
                }
                None => None,
            };
            let mut new = match &raw_diff.new {
                Some(value) => {
                    prepare_value(value, &self.table.normalizers, &self.table.encoder)?
                }
                None => None,
            };
            if raw_diff.load_only && change.kind != ChangeKind::Delete {
                new = old.clone();
            }
            diffs.insert(
                property.to_string(),
                PropertyDiff {
                    old,
                    new,
                    changed: raw_diff.changed,
                    load_only: raw_diff.load_only,
                },
            );
        }

        Ok(EntityDiff {
            id: change.id.clone(),
            kind: change.kind,
            diffs,
        })
    }
}

//! Index implementations.
//!
//! Three index shapes share one capability set: query matching with a score,
//! id lookup, streaming add/remove pipelines driven by entity diffs, and
//! paginated enumeration for dump and repair. The primary variants own id
//! generation; the compound secondary owns lexicographic range queries.

pub(crate) mod encoding;
mod compound;
mod primary;

pub(crate) use compound::CompoundIndex;
pub(crate) use primary::PrimaryIndex;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

use crate::batch::Transaction;
use crate::changeset::EntityDiff;
use crate::codec::Encoder;
use crate::error::Result;
use crate::normalize::NormalizerPool;
use crate::resp::Command;
use crate::value::{Key, Value};

/// Marker separating the composite key from the entity id in secondary-index
/// entries, and terminating compound primary ids.
const ID_MARKER: &[u8] = b"::";

/// Prepares a value for use inside an index entry or a compound id:
/// text is normalized, numbers get the order-preserving encoding, and
/// everything else falls back to the storage codec. `None` means nil.
pub(crate) fn prepare_value(
    value: &Value,
    normalizers: &NormalizerPool,
    encoder: &Encoder,
) -> Result<Option<Bytes>> {
    match value {
        Value::Nil => Ok(None),
        Value::Text(s) => {
            let mut normalizer = normalizers.get();
            let normalized = normalizer.normalize(s);
            normalizers.put(normalizer);
            Ok(Some(Bytes::from(normalized)))
        }
        Value::Binary(b) => {
            let text = String::from_utf8_lossy(b);
            let mut normalizer = normalizers.get();
            let normalized = normalizer.normalize(&text);
            normalizers.put(normalizer);
            Ok(Some(Bytes::from(normalized)))
        }
        Value::Int(i) => Ok(Some(Bytes::from(encoding::encode_int(*i)))),
        Value::Uint(u) => Ok(Some(Bytes::from(encoding::encode_uint(*u)))),
        Value::Float(f) => Ok(Some(Bytes::from(encoding::encode_float(*f)))),
        other => encoder.encode(other).map(Some),
    }
}

/// Recovers the entity id from a raw secondary-index entry
/// (`v1|...|vK|::<id>`).
pub(crate) fn extract_id(entry: &[u8]) -> Option<Key> {
    let pos = entry
        .windows(ID_MARKER.len())
        .rposition(|w| w == ID_MARKER)?;
    let id = &entry[pos + ID_MARKER.len()..];
    if id.is_empty() {
        return None;
    }
    Some(Key::new(String::from_utf8_lossy(id).into_owned()))
}

/// Accumulates index mutations and enqueues them on a transaction as at most
/// one bulk ZREM plus one bulk ZADD.
pub(crate) struct IndexWriter {
    key: String,
    add: Vec<Bytes>,
    remove: Vec<Bytes>,
}

impl IndexWriter {
    fn new(key: String) -> Self {
        Self {
            key,
            add: Vec::new(),
            remove: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, entry: Bytes) {
        self.add.push(entry);
    }

    pub(crate) fn remove(&mut self, entry: Bytes) {
        self.remove.push(entry);
    }

    async fn flush(self, tx: &Transaction) -> Result<()> {
        if !self.remove.is_empty() {
            let mut cmd = Command::new("ZREM").arg(self.key.as_str());
            for entry in self.remove {
                cmd.add(entry);
            }
            tx.send(cmd).await;
        }
        if !self.add.is_empty() {
            let mut cmd = Command::new("ZADD").arg(self.key.as_str());
            for entry in self.add {
                cmd.add(0i64);
                cmd.add(entry);
            }
            tx.send(cmd).await;
        }
        Ok(())
    }
}

/// Shared pipeline plumbing: a task drains entity diffs, classifies them via
/// `build`, and enqueues the accumulated bulk commands on the transaction.
/// The caller closes the input by dropping the sender, then awaits the single
/// terminal result on the output.
pub(crate) fn spawn_pipeline<F>(
    key: String,
    tx: Transaction,
    mut build: F,
) -> (mpsc::Sender<EntityDiff>, oneshot::Receiver<Result<()>>)
where
    F: FnMut(&EntityDiff, &mut IndexWriter) + Send + 'static,
{
    let (diff_tx, mut diff_rx) = mpsc::channel::<EntityDiff>(64);
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut writer = IndexWriter::new(key);
        while let Some(diff) = diff_rx.recv().await {
            build(&diff, &mut writer);
        }
        let result = writer.flush(&tx).await;
        let _ = done_tx.send(result);
    });

    (diff_tx, done_rx)
}

/// Builds the `v1|...|vK|::<id>` entry bytes from prepared column values.
/// Returns `None` unless at least one value is non-nil and every column is
/// present in `values`.
pub(crate) fn build_entry<'a>(
    columns: &[String],
    id: &Key,
    mut values: impl FnMut(&str) -> Option<Option<&'a Bytes>>,
) -> Option<Bytes> {
    let mut out = BytesMut::with_capacity(columns.len() * 10 + id.as_bytes().len() + 3);
    let mut valid = false;

    for (n, column) in columns.iter().enumerate() {
        let value = values(column)?;
        if n > 0 {
            out.put_u8(b'|');
        }
        if let Some(bytes) = value {
            valid = true;
            out.put_slice(bytes);
        }
    }

    if !valid {
        return None;
    }
    out.put_u8(b'|');
    out.put_slice(ID_MARKER);
    out.put_slice(id.as_bytes());
    Some(out.freeze())
}

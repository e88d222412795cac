//! Storage codec for typed values.
//!
//! Every stored value is a byte string whose first byte is a type tag:
//!
//! ```text
//! i int    u uint   f float   b bool ('b0'/'b1')
//! x text   Z snappy text      z zstd text (legacy, decode only)
//! r binary t timestamp (unix seconds)
//! s set    l list    m map    N nil
//! ```
//!
//! Container payloads are bincode documents following the tag. Untagged
//! decimal payloads decode as numbers: the backend's HINCRBY rewrites
//! counters without a tag, so the decoder must accept both forms. Floats are
//! always rendered with a decimal marker so they can never be mistaken for
//! integers on the way back.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::value::{Timestamp, Value};

const INT_TAG: u8 = b'i';
const UINT_TAG: u8 = b'u';
const FLOAT_TAG: u8 = b'f';
const BOOL_TAG: u8 = b'b';
const TEXT_TAG: u8 = b'x';
const COMPRESSED_TAG_LEGACY: u8 = b'z';
const COMPRESSED_TAG: u8 = b'Z';
const BINARY_TAG: u8 = b'r';
const TIMESTAMP_TAG: u8 = b't';
const SET_TAG: u8 = b's';
const LIST_TAG: u8 = b'l';
const MAP_TAG: u8 = b'm';
const NIL_TAG: u8 = b'N';

/// Encodes values for storage, compressing text above the threshold.
#[derive(Debug, Clone)]
pub struct Encoder {
    text_compress_threshold: usize,
}

impl Encoder {
    /// A threshold of 0 disables compression.
    pub fn new(text_compress_threshold: usize) -> Self {
        Self {
            text_compress_threshold,
        }
    }

    pub fn encode(&self, value: &Value) -> Result<Bytes> {
        let buf = match value {
            Value::Nil => Bytes::from_static(&[NIL_TAG]),
            Value::Int(i) => tagged(INT_TAG, i.to_string().as_bytes()),
            Value::Uint(u) => tagged(UINT_TAG, u.to_string().as_bytes()),
            Value::Float(f) => tagged(FLOAT_TAG, format_float(*f).as_bytes()),
            Value::Bool(b) => {
                if *b {
                    Bytes::from_static(b"b1")
                } else {
                    Bytes::from_static(b"b0")
                }
            }
            Value::Text(s) => self.encode_text(s)?,
            Value::Binary(b) => tagged(BINARY_TAG, b),
            Value::Timestamp(ts) => {
                if ts.is_zero() {
                    Bytes::new()
                } else {
                    tagged(TIMESTAMP_TAG, ts.0.to_string().as_bytes())
                }
            }
            Value::Set(items) => {
                let ordered: Vec<&Value> = items.iter().collect();
                encode_document(SET_TAG, &ordered)?
            }
            Value::List(items) => {
                let refs: Vec<&Value> = items.iter().collect();
                encode_document(LIST_TAG, &refs)?
            }
            Value::Map(entries) => encode_document(MAP_TAG, entries)?,
        };
        Ok(buf)
    }

    fn encode_text(&self, text: &str) -> Result<Bytes> {
        if self.text_compress_threshold > 0 && text.len() >= self.text_compress_threshold {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(text.as_bytes())
                .map_err(|e| Error::codec(format!("could not compress text: {e}")))?;
            tracing::debug!(len = text.len(), "storing text compressed");
            return Ok(tagged(COMPRESSED_TAG, &compressed));
        }
        Ok(tagged(TEXT_TAG, text.as_bytes()))
    }
}

fn tagged(tag: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_u8(tag);
    buf.put_slice(payload);
    buf.freeze()
}

fn encode_document<T: serde::Serialize>(tag: u8, doc: &T) -> Result<Bytes> {
    let payload =
        bincode::serialize(doc).map_err(|e| Error::codec(format!("could not encode document: {e}")))?;
    Ok(tagged(tag, &payload))
}

/// Floats are rendered at full precision; a `.0` suffix is appended when the
/// rendering carries no decimal marker so the decoder cannot read the value
/// back as an integer.
fn format_float(f: f64) -> String {
    let mut s = format!("{f}");
    if !s.contains('.') && !s.contains('e') && !s.contains("inf") && !s.contains("NaN") {
        s.push_str(".0");
    }
    s
}

/// Decodes stored byte strings back into values.
#[derive(Debug, Clone, Default)]
pub struct Decoder;

impl Decoder {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&self, data: &[u8]) -> Result<Value> {
        let Some((&tag, payload)) = data.split_first() else {
            return Ok(Value::Nil);
        };

        match tag {
            NIL_TAG => Ok(Value::Nil),
            INT_TAG => parse_utf8(payload)?
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|e| Error::codec(format!("bad int payload: {e}"))),
            UINT_TAG => parse_utf8(payload)?
                .parse::<u64>()
                .map(Value::Uint)
                .map_err(|e| Error::codec(format!("bad uint payload: {e}"))),
            FLOAT_TAG => parse_utf8(payload)?
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|e| Error::codec(format!("bad float payload: {e}"))),
            BOOL_TAG => decode_bool(payload),
            TEXT_TAG => Ok(Value::Text(parse_utf8(payload)?.to_string())),
            COMPRESSED_TAG => {
                let raw = snap::raw::Decoder::new()
                    .decompress_vec(payload)
                    .map_err(|e| Error::codec(format!("could not decompress text: {e}")))?;
                text_from_vec(raw)
            }
            COMPRESSED_TAG_LEGACY => {
                let raw = zstd::decode_all(payload)
                    .map_err(|e| Error::codec(format!("could not decompress legacy text: {e}")))?;
                text_from_vec(raw)
            }
            BINARY_TAG => Ok(Value::Binary(Bytes::copy_from_slice(payload))),
            TIMESTAMP_TAG => parse_utf8(payload)?
                .parse::<i64>()
                .map(|secs| Value::Timestamp(Timestamp(secs)))
                .map_err(|e| Error::codec(format!("bad timestamp payload: {e}"))),
            SET_TAG => {
                let items: Vec<Value> = decode_document(payload)?;
                Ok(Value::Set(BTreeSet::from_iter(items)))
            }
            LIST_TAG => Ok(Value::List(decode_document(payload)?)),
            MAP_TAG => {
                let entries: BTreeMap<String, Value> = decode_document(payload)?;
                Ok(Value::Map(entries))
            }
            b'0'..=b'9' | b'-' => decode_number(data),
            other => Err(Error::codec(format!(
                "unknown type tag: {}",
                other as char
            ))),
        }
    }
}

fn decode_document<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(|e| Error::codec(format!("bad document payload: {e}")))
}

fn decode_bool(payload: &[u8]) -> Result<Value> {
    match payload {
        b"1" | b"true" => Ok(Value::Bool(true)),
        b"0" | b"false" => Ok(Value::Bool(false)),
        other => Err(Error::codec(format!(
            "invalid boolean payload: {}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn text_from_vec(raw: Vec<u8>) -> Result<Value> {
    String::from_utf8(raw)
        .map(Value::Text)
        .map_err(|e| Error::codec(format!("decompressed text is not UTF-8: {e}")))
}

fn parse_utf8(payload: &[u8]) -> Result<&str> {
    std::str::from_utf8(payload).map_err(|e| Error::codec(format!("payload is not UTF-8: {e}")))
}

/// Untagged numbers: tried as int, then uint, then float. Floats are always
/// stored with a decimal marker, so the integer parses cannot swallow them.
fn decode_number(data: &[u8]) -> Result<Value> {
    let text = parse_utf8(data)?;
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Value::Int(i));
    }
    if let Ok(u) = text.parse::<u64>() {
        return Ok(Value::Uint(u));
    }
    if let Ok(f) = text.parse::<f64>() {
        return Ok(Value::Float(f));
    }
    Err(Error::codec(format!("invalid number format: {text}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let enc = Encoder::new(0);
        let dec = Decoder::new();
        let encoded = enc.encode(&value).unwrap();
        assert_eq!(dec.decode(&encoded).unwrap(), value, "value {value:?}");
    }

    #[test]
    fn scalar_roundtrips() {
        roundtrip(Value::Nil);
        roundtrip(Value::Int(-42));
        roundtrip(Value::Int(i64::MIN));
        roundtrip(Value::Uint(u64::MAX));
        roundtrip(Value::Float(0.00005));
        roundtrip(Value::Float(-300.5));
        roundtrip(Value::Float(1.0));
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Text("héllo wörld".into()));
        roundtrip(Value::Binary(Bytes::from_static(b"\x00\x01\xff")));
        roundtrip(Value::Timestamp(Timestamp(1404000000)));
    }

    #[test]
    fn container_roundtrips() {
        roundtrip(Value::Set(BTreeSet::from_iter([
            Value::Text("a".into()),
            Value::Text("b".into()),
            Value::Int(7),
        ])));
        roundtrip(Value::List(vec![
            Value::Int(1),
            Value::Float(2.5),
            Value::Text("three".into()),
        ]));
        roundtrip(Value::Map(BTreeMap::from_iter([
            ("k".to_string(), Value::Int(1)),
            ("v".to_string(), Value::Text("x".into())),
        ])));
    }

    #[test]
    fn floats_never_decode_as_ints() {
        let enc = Encoder::new(0);
        let encoded = enc.encode(&Value::Float(4.0)).unwrap();
        assert_eq!(encoded.as_ref(), b"f4.0");
        assert_eq!(Decoder::new().decode(&encoded).unwrap(), Value::Float(4.0));
    }

    #[test]
    fn compression_fires_above_threshold() {
        let text: String = "abcdefgh".repeat(64);
        let enc = Encoder::new(64);
        let encoded = enc.encode(&Value::Text(text.clone())).unwrap();
        assert_eq!(encoded[0], b'Z');
        assert!(encoded.len() < text.len());
        assert_eq!(
            Decoder::new().decode(&encoded).unwrap(),
            Value::Text(text)
        );
    }

    #[test]
    fn legacy_compressed_rows_decode() {
        let text = "legacy row payload ".repeat(32);
        let compressed = zstd::encode_all(text.as_bytes(), 3).unwrap();
        let mut data = vec![b'z'];
        data.extend_from_slice(&compressed);
        assert_eq!(
            Decoder::new().decode(&data).unwrap(),
            Value::Text(text)
        );
    }

    #[test]
    fn bare_numbers_decode() {
        let dec = Decoder::new();
        assert_eq!(dec.decode(b"1404").unwrap(), Value::Int(1404));
        assert_eq!(dec.decode(b"-3").unwrap(), Value::Int(-3));
        assert_eq!(
            dec.decode(b"18446744073709551615").unwrap(),
            Value::Uint(u64::MAX)
        );
        assert_eq!(dec.decode(b"3.25").unwrap(), Value::Float(3.25));
    }

    #[test]
    fn zero_timestamp_encodes_empty() {
        let enc = Encoder::new(0);
        assert!(enc.encode(&Value::Timestamp(Timestamp(0))).unwrap().is_empty());
    }

    #[test]
    fn unknown_tag_is_a_codec_error() {
        assert!(Decoder::new().decode(b"Qxyz").is_err());
    }
}

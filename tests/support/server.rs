//! An in-process Redis subset for integration tests.
//!
//! Implements just the commands the engine emits, with real semantics for
//! hashes, lexicographic sorted sets, key expiry and MULTI/EXEC. One task
//! per connection; the store is a mutex-protected map, which is plenty for
//! tests.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct MiniRedis {
    addr: String,
    store: Arc<Mutex<Store>>,
}

impl MiniRedis {
    pub async fn start() -> anyhow::Result<MiniRedis> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        let store = Arc::new(Mutex::new(Store::default()));

        let accept_store = store.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let store = accept_store.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, store).await;
                });
            }
        });

        Ok(MiniRedis { addr, store })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Live keys currently in the store (expired entries are purged first).
    pub fn keys(&self) -> Vec<String> {
        let mut store = self.store.lock().unwrap();
        store.purge_expired();
        store
            .data
            .keys()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .collect()
    }
}

#[derive(Default)]
struct Store {
    data: HashMap<Vec<u8>, Entry>,
    cursor: usize,
}

struct Entry {
    value: Val,
    expires_at: Option<Instant>,
}

enum Val {
    Str(Vec<u8>),
    Hash(HashMap<Vec<u8>, Vec<u8>>),
    ZSet(BTreeSet<Vec<u8>>),
}

#[derive(Debug, Clone)]
enum Out {
    Simple(&'static str),
    Err(String),
    Int(i64),
    Bulk(Vec<u8>),
    Nil,
    Array(Vec<Out>),
}

impl Out {
    fn write(&self, buf: &mut Vec<u8>) {
        match self {
            Out::Simple(s) => {
                buf.push(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Out::Err(msg) => {
                buf.push(b'-');
                buf.extend_from_slice(msg.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Out::Int(i) => {
                buf.push(b':');
                buf.extend_from_slice(i.to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Out::Bulk(payload) => {
                buf.push(b'$');
                buf.extend_from_slice(payload.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(payload);
                buf.extend_from_slice(b"\r\n");
            }
            Out::Nil => buf.extend_from_slice(b"$-1\r\n"),
            Out::Array(items) => {
                buf.push(b'*');
                buf.extend_from_slice(items.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                for item in items {
                    item.write(buf);
                }
            }
        }
    }
}

async fn serve(mut socket: TcpStream, store: Arc<Mutex<Store>>) -> anyhow::Result<()> {
    let mut rbuf: Vec<u8> = Vec::with_capacity(4096);
    let mut queued: Option<Vec<Vec<Vec<u8>>>> = None;

    loop {
        let command = loop {
            if let Some((args, used)) = parse_command(&rbuf)? {
                rbuf.drain(..used);
                break args;
            }
            let mut chunk = [0u8; 4096];
            let n = socket.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            rbuf.extend_from_slice(&chunk[..n]);
        };

        let name = String::from_utf8_lossy(&command[0]).to_uppercase();
        let reply = match name.as_str() {
            "MULTI" => {
                queued = Some(Vec::new());
                Out::Simple("OK")
            }
            "EXEC" => match queued.take() {
                Some(commands) => {
                    let mut store = store.lock().unwrap();
                    let replies = commands
                        .iter()
                        .map(|args| dispatch(&mut store, args))
                        .collect();
                    Out::Array(replies)
                }
                None => Out::Err("ERR EXEC without MULTI".into()),
            },
            "DISCARD" => {
                queued = None;
                Out::Simple("OK")
            }
            _ => match &mut queued {
                Some(commands) => {
                    commands.push(command);
                    Out::Simple("QUEUED")
                }
                None => dispatch(&mut store.lock().unwrap(), &command),
            },
        };

        let mut wbuf = Vec::with_capacity(256);
        reply.write(&mut wbuf);
        socket.write_all(&wbuf).await?;
    }
}

/// Parses one `*N` array of bulk strings from the front of the buffer.
fn parse_command(buf: &[u8]) -> anyhow::Result<Option<(Vec<Vec<u8>>, usize)>> {
    let Some((line, mut offset)) = read_line(buf) else {
        return Ok(None);
    };
    if line.first() != Some(&b'*') {
        anyhow::bail!("expected array frame");
    }
    let count: usize = std::str::from_utf8(&line[1..])?.parse()?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let Some((line, used)) = read_line(&buf[offset..]) else {
            return Ok(None);
        };
        if line.first() != Some(&b'$') {
            anyhow::bail!("expected bulk string");
        }
        let len: usize = std::str::from_utf8(&line[1..])?.parse()?;
        let start = offset + used;
        if buf.len() < start + len + 2 {
            return Ok(None);
        }
        args.push(buf[start..start + len].to_vec());
        offset = start + len + 2;
    }
    Ok(Some((args, offset)))
}

fn read_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    Some((&buf[..pos], pos + 2))
}

impl Store {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.data
            .retain(|_, entry| entry.expires_at.map(|at| at > now).unwrap_or(true));
    }

    fn live(&mut self, key: &[u8]) -> Option<&mut Entry> {
        let expired = match self.data.get(key) {
            Some(entry) => entry
                .expires_at
                .map(|at| at <= Instant::now())
                .unwrap_or(false),
            None => return None,
        };
        if expired {
            self.data.remove(key);
            return None;
        }
        self.data.get_mut(key)
    }

    fn hash(&mut self, key: &[u8]) -> &mut HashMap<Vec<u8>, Vec<u8>> {
        if self.live(key).is_none() {
            self.data.insert(
                key.to_vec(),
                Entry {
                    value: Val::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match &mut self.data.get_mut(key).unwrap().value {
            Val::Hash(h) => h,
            _ => panic!("WRONGTYPE"),
        }
    }

    fn zset(&mut self, key: &[u8]) -> &mut BTreeSet<Vec<u8>> {
        if self.live(key).is_none() {
            self.data.insert(
                key.to_vec(),
                Entry {
                    value: Val::ZSet(BTreeSet::new()),
                    expires_at: None,
                },
            );
        }
        match &mut self.data.get_mut(key).unwrap().value {
            Val::ZSet(z) => z,
            _ => panic!("WRONGTYPE"),
        }
    }
}

fn dispatch(store: &mut Store, args: &[Vec<u8>]) -> Out {
    let name = String::from_utf8_lossy(&args[0]).to_uppercase();
    match name.as_str() {
        "PING" => Out::Simple("PONG"),
        "ECHO" => Out::Bulk(args[1].clone()),
        "EXISTS" => Out::Int(store.live(&args[1]).is_some() as i64),
        "DEL" => {
            let mut removed = 0;
            for key in &args[1..] {
                if store.live(key).is_some() {
                    store.data.remove(key);
                    removed += 1;
                }
            }
            Out::Int(removed)
        }
        "PEXPIRE" => {
            let ms: u64 = parse_num(&args[2]);
            match store.live(&args[1]) {
                Some(entry) => {
                    entry.expires_at = Some(Instant::now() + Duration::from_millis(ms));
                    Out::Int(1)
                }
                None => Out::Int(0),
            }
        }
        "RANDOMKEY" => {
            store.purge_expired();
            if store.data.is_empty() {
                return Out::Nil;
            }
            // deterministic rotation; good enough randomness for repair
            let mut keys: Vec<&Vec<u8>> = store.data.keys().collect();
            keys.sort();
            let key = keys[store.cursor % keys.len()].clone();
            store.cursor = store.cursor.wrapping_add(1);
            Out::Bulk(key)
        }
        "HMSET" | "HSET" => {
            let hash = store.hash(&args[1]);
            for pair in args[2..].chunks_exact(2) {
                hash.insert(pair[0].clone(), pair[1].clone());
            }
            if name == "HSET" {
                Out::Int(0)
            } else {
                Out::Simple("OK")
            }
        }
        "HMGET" => match store.live(&args[1]) {
            Some(Entry {
                value: Val::Hash(hash),
                ..
            }) => Out::Array(
                args[2..]
                    .iter()
                    .map(|f| hash.get(f).map(|v| Out::Bulk(v.clone())).unwrap_or(Out::Nil))
                    .collect(),
            ),
            _ => Out::Array(args[2..].iter().map(|_| Out::Nil).collect()),
        },
        "HGETALL" => match store.live(&args[1]) {
            Some(Entry {
                value: Val::Hash(hash),
                ..
            }) => {
                let mut items = Vec::with_capacity(hash.len() * 2);
                for (field, value) in hash {
                    items.push(Out::Bulk(field.clone()));
                    items.push(Out::Bulk(value.clone()));
                }
                Out::Array(items)
            }
            _ => Out::Array(Vec::new()),
        },
        "HDEL" => match store.live(&args[1]) {
            Some(Entry {
                value: Val::Hash(hash),
                ..
            }) => {
                let mut removed = 0;
                for field in &args[2..] {
                    if hash.remove(field).is_some() {
                        removed += 1;
                    }
                }
                Out::Int(removed)
            }
            _ => Out::Int(0),
        },
        "HINCRBY" => {
            let delta: i64 = parse_num(&args[3]);
            let hash = store.hash(&args[1]);
            let current = match hash.get(&args[2]) {
                Some(raw) => match std::str::from_utf8(raw).ok().and_then(|s| s.parse().ok()) {
                    Some(i) => i,
                    None => {
                        return Out::Err("ERR hash value is not an integer".into());
                    }
                },
                None => 0i64,
            };
            let next = current + delta;
            hash.insert(args[2].clone(), next.to_string().into_bytes());
            Out::Int(next)
        }
        "ZADD" => {
            let zset = store.zset(&args[1]);
            let mut added = 0;
            // score/member pairs; scores are ignored (all zero)
            for pair in args[2..].chunks_exact(2) {
                if zset.insert(pair[1].clone()) {
                    added += 1;
                }
            }
            Out::Int(added)
        }
        "ZREM" => match store.live(&args[1]) {
            Some(Entry {
                value: Val::ZSet(zset),
                ..
            }) => {
                let mut removed = 0;
                for member in &args[2..] {
                    if zset.remove(member) {
                        removed += 1;
                    }
                }
                Out::Int(removed)
            }
            _ => Out::Int(0),
        },
        "ZCARD" => match store.live(&args[1]) {
            Some(Entry {
                value: Val::ZSet(zset),
                ..
            }) => Out::Int(zset.len() as i64),
            _ => Out::Int(0),
        },
        "ZRANGE" | "ZREVRANGE" => {
            let members: Vec<Vec<u8>> = match store.live(&args[1]) {
                Some(Entry {
                    value: Val::ZSet(zset),
                    ..
                }) => {
                    let mut m: Vec<Vec<u8>> = zset.iter().cloned().collect();
                    if name == "ZREVRANGE" {
                        m.reverse();
                    }
                    m
                }
                _ => Vec::new(),
            };
            let start: i64 = parse_num(&args[2]);
            let stop: i64 = parse_num(&args[3]);
            let len = members.len() as i64;
            let start = clamp_rank(start, len);
            let stop = clamp_rank(stop, len);
            if start > stop || start >= len {
                return Out::Array(Vec::new());
            }
            Out::Array(
                members[start as usize..=(stop.min(len - 1)) as usize]
                    .iter()
                    .map(|m| Out::Bulk(m.clone()))
                    .collect(),
            )
        }
        "ZRANGEBYLEX" | "ZREVRANGEBYLEX" => {
            let reverse = name == "ZREVRANGEBYLEX";
            let (min, max) = if reverse {
                (&args[3], &args[2])
            } else {
                (&args[2], &args[3])
            };
            let mut members = lex_range(store, &args[1], min, max);
            if reverse {
                members.reverse();
            }
            if let Some(limit_pos) = args
                .iter()
                .position(|a| a.eq_ignore_ascii_case(b"LIMIT"))
            {
                let offset: usize = parse_num(&args[limit_pos + 1]);
                let count: usize = parse_num(&args[limit_pos + 2]);
                members = members.into_iter().skip(offset).take(count).collect();
            }
            Out::Array(members.into_iter().map(Out::Bulk).collect())
        }
        "ZLEXCOUNT" => Out::Int(lex_range(store, &args[1], &args[2], &args[3]).len() as i64),
        "DEBUG" => {
            // DEBUG OBJECT <key>
            match store.live(&args[2]) {
                Some(entry) => {
                    let size = match &entry.value {
                        Val::Str(s) => s.len(),
                        Val::Hash(h) => h.iter().map(|(k, v)| k.len() + v.len()).sum(),
                        Val::ZSet(z) => z.iter().map(|m| m.len()).sum(),
                    };
                    Out::Bulk(
                        format!("Value at:0x0 refcount:1 serializedlength:{size} lru:0")
                            .into_bytes(),
                    )
                }
                None => Out::Err("ERR no such key".into()),
            }
        }
        "SET" => {
            store.data.insert(
                args[1].clone(),
                Entry {
                    value: Val::Str(args[2].clone()),
                    expires_at: None,
                },
            );
            Out::Simple("OK")
        }
        other => Out::Err(format!("ERR unknown command '{other}'")),
    }
}

fn clamp_rank(rank: i64, len: i64) -> i64 {
    if rank < 0 {
        (len + rank).max(0)
    } else {
        rank
    }
}

fn lex_range(store: &mut Store, key: &[u8], min: &[u8], max: &[u8]) -> Vec<Vec<u8>> {
    let Some(Entry {
        value: Val::ZSet(zset),
        ..
    }) = store.live(key)
    else {
        return Vec::new();
    };

    let lower: Bound<Vec<u8>> = match min.split_first() {
        Some((b'[', rest)) => Bound::Included(rest.to_vec()),
        Some((b'(', rest)) => Bound::Excluded(rest.to_vec()),
        Some((b'-', _)) | None => Bound::Unbounded,
        Some((b'+', _)) => return Vec::new(),
        _ => return Vec::new(),
    };
    let upper: Bound<Vec<u8>> = match max.split_first() {
        Some((b'[', rest)) => Bound::Included(rest.to_vec()),
        Some((b'(', rest)) => Bound::Excluded(rest.to_vec()),
        Some((b'+', _)) | None => Bound::Unbounded,
        Some((b'-', _)) => return Vec::new(),
        _ => return Vec::new(),
    };

    // BTreeSet::range panics on inverted bounds; redis returns empty
    if let (
        Bound::Included(lo) | Bound::Excluded(lo),
        Bound::Included(hi) | Bound::Excluded(hi),
    ) = (&lower, &upper)
    {
        if lo > hi {
            return Vec::new();
        }
    }

    zset.range((lower, upper)).cloned().collect()
}

fn parse_num<T: std::str::FromStr + Default>(raw: &[u8]) -> T {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}

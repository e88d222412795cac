//! Command pipelining with promises.
//!
//! A [`Batch`] queues commands and returns a [`Promise`] per command. One
//! `execute` call writes every frame in a single flush, reads every reply,
//! and fills the promises in order. [`Transaction`] is the MULTI/EXEC
//! variant: the whole queue runs atomically on the backend, and the same
//! handle can be reused for a second round of commands after `execute`.
//!
//! Both handles are cheaply cloneable so index pipelines can enqueue onto
//! the transaction from their own tasks.

use std::sync::Arc;
use std::sync::OnceLock;

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::pool::PooledConn;
use crate::resp::{Command, Reply};

/// The future reply of a queued command, filled by `execute`.
#[derive(Clone, Debug, Default)]
pub struct Promise {
    slot: Arc<OnceLock<Reply>>,
}

impl Promise {
    pub fn reply(&self) -> Option<&Reply> {
        self.slot.get()
    }

    fn fill(&self, reply: Reply) {
        let _ = self.slot.set(reply);
    }
}

struct BatchState {
    conn: PooledConn,
    commands: Vec<Command>,
    promises: Vec<Promise>,
}

impl BatchState {
    fn reset(&mut self) {
        self.commands.clear();
        self.promises.clear();
    }

    fn push(&mut self, cmd: Command) -> Promise {
        let promise = Promise::default();
        self.commands.push(cmd);
        self.promises.push(promise.clone());
        promise
    }
}

/// A pipelined (non-transactional) command batch over one pooled connection.
#[derive(Clone)]
pub struct Batch {
    state: Arc<Mutex<BatchState>>,
}

impl Batch {
    pub fn new(conn: PooledConn) -> Self {
        Self {
            state: Arc::new(Mutex::new(BatchState {
                conn,
                commands: Vec::new(),
                promises: Vec::new(),
            })),
        }
    }

    /// Queues a command. Nothing touches the wire until `execute`.
    pub async fn send(&self, cmd: Command) -> Promise {
        self.state.lock().await.push(cmd)
    }

    /// Flushes the queue and fills every promise with its reply, in order.
    pub async fn execute(&self) -> Result<Vec<Reply>> {
        let mut state = self.state.lock().await;
        if state.commands.is_empty() {
            return Ok(Vec::new());
        }

        let commands = std::mem::take(&mut state.commands);
        let promises = std::mem::take(&mut state.promises);

        for cmd in &commands {
            state.conn.enqueue(cmd);
        }
        if let Err(err) = state.conn.flush().await {
            state.conn.poison();
            return Err(err);
        }

        let mut replies = Vec::with_capacity(commands.len());
        for promise in &promises {
            let reply = match state.conn.receive().await {
                Ok(reply) => reply,
                Err(err) => {
                    state.conn.poison();
                    return Err(err);
                }
            };
            if let Reply::Error(msg) = &reply {
                // drain remaining replies so the connection stays usable
                for _ in replies.len() + 1..commands.len() {
                    if state.conn.receive().await.is_err() {
                        state.conn.poison();
                        break;
                    }
                }
                return Err(Error::backend(msg.clone()));
            }
            promise.fill(reply.clone());
            replies.push(reply);
        }
        Ok(replies)
    }

    /// Discards queued commands, leaving their promises empty.
    pub async fn abort(&self) {
        self.state.lock().await.reset();
    }
}

/// A batch wrapped in MULTI/EXEC so the backend applies it atomically.
#[derive(Clone)]
pub struct Transaction {
    batch: Batch,
}

impl Transaction {
    pub fn new(conn: PooledConn) -> Self {
        Self {
            batch: Batch::new(conn),
        }
    }

    pub async fn send(&self, cmd: Command) -> Promise {
        self.batch.send(cmd).await
    }

    /// Runs the queue inside MULTI/EXEC and fills the promises from the EXEC
    /// reply. The handle resets afterwards, so a second round of `send`s and
    /// another `execute` run as a fresh transaction on the same connection.
    pub async fn execute(&self) -> Result<Vec<Reply>> {
        let mut state = self.batch.state.lock().await;
        if state.commands.is_empty() {
            return Ok(Vec::new());
        }

        let commands = std::mem::take(&mut state.commands);
        let promises = std::mem::take(&mut state.promises);

        state.conn.enqueue(&Command::new("MULTI"));
        for cmd in &commands {
            state.conn.enqueue(cmd);
        }
        state.conn.enqueue(&Command::new("EXEC"));
        if let Err(err) = state.conn.flush().await {
            state.conn.poison();
            return Err(err);
        }

        // +OK for MULTI, one +QUEUED per command, then the EXEC array
        let result: Result<Vec<Reply>> = async {
            self::expect_ok(state.conn.receive().await?)?;
            for _ in 0..commands.len() {
                state.conn.receive().await?.ok()?;
            }
            let exec = state.conn.receive().await?.ok()?;
            if exec.is_nil() {
                return Err(Error::backend("transaction aborted by backend"));
            }
            exec.into_array()
        }
        .await;

        let replies = match result {
            Ok(replies) => replies,
            Err(err) => {
                state.conn.poison();
                return Err(err);
            }
        };

        if replies.len() != promises.len() {
            state.conn.poison();
            return Err(Error::backend(format!(
                "EXEC returned {} replies for {} commands",
                replies.len(),
                promises.len()
            )));
        }
        for (promise, reply) in promises.iter().zip(&replies) {
            if let Reply::Error(msg) = reply {
                return Err(Error::backend(msg.clone()));
            }
            promise.fill(reply.clone());
        }
        Ok(replies)
    }

    /// Drops the queued commands; promises stay empty. Since frames are
    /// buffered client-side, nothing needs to be sent to the backend.
    pub async fn abort(&self) {
        self.batch.abort().await;
    }
}

fn expect_ok(reply: Reply) -> Result<()> {
    match reply.ok()? {
        Reply::Simple(_) => Ok(()),
        other => Err(Error::backend(format!("expected +OK, got {other:?}"))),
    }
}

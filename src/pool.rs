//! Bounded connection pool.
//!
//! One control task owns every piece of pool state (free list, active
//! count, FIFO waiter queue, response-time totals) and acquire/release/
//! stats/destroy are messages to it, so counter updates are inherently
//! serialized with the transitions they describe and `active` can never
//! exceed `max_connections`.
//!
//! Admission: a free connection is handed out immediately; below the cap a
//! new one is created; otherwise the requester queues FIFO. On release, a
//! queued waiter receives the connection directly instead of it touching the
//! free list, so a connection is never briefly "free" while someone waits.

use chrono::Utc;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::models::{PoolStats, PooledConnection};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was destroyed while this acquire was queued.
    #[error("connection pool destroyed while waiting for a connection")]
    Destroyed,
    /// The pool's control task is gone.
    #[error("connection pool is closed")]
    Closed,
}

enum PoolCommand {
    Acquire {
        reply: oneshot::Sender<Result<PooledConnection, PoolError>>,
    },
    Release {
        conn: PooledConnection,
        response_time: Duration,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Destroy,
}

/// Cloneable handle to the pool's control task.
#[derive(Clone)]
pub struct ConnectionPool {
    tx: mpsc::UnboundedSender<PoolCommand>,
}

impl ConnectionPool {
    pub fn new(max_connections: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(control_loop(rx, max_connections.max(1)));
        Self { tx }
    }

    /// Take a connection, suspending while the pool is saturated.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Acquire { reply })
            .map_err(|_| PoolError::Closed)?;
        rx.await.map_err(|_| PoolError::Closed)?
    }

    /// Return a connection, recording how long the request it served took.
    pub fn release(&self, conn: PooledConnection, response_time: Duration) {
        let _ = self.tx.send(PoolCommand::Release {
            conn,
            response_time,
        });
    }

    pub async fn stats(&self) -> PoolStats {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PoolCommand::Stats { reply }).is_err() {
            return PoolStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Tear the pool down. Every queued acquire fails with
    /// [`PoolError::Destroyed`]; none are silently dropped.
    pub fn destroy(&self) {
        let _ = self.tx.send(PoolCommand::Destroy);
    }
}

struct PoolState {
    max: usize,
    free: Vec<PooledConnection>,
    active: usize,
    waiters: VecDeque<oneshot::Sender<Result<PooledConnection, PoolError>>>,
    response_time_total: Duration,
    response_count: u64,
}

impl PoolState {
    fn total(&self) -> usize {
        self.free.len() + self.active
    }

    fn stats(&self) -> PoolStats {
        let avg = if self.response_count > 0 {
            self.response_time_total.as_secs_f64() * 1000.0 / self.response_count as f64
        } else {
            0.0
        };
        PoolStats {
            active: self.active,
            queued: self.waiters.len(),
            total: self.total(),
            avg_response_time_ms: avg,
        }
    }
}

async fn control_loop(mut rx: mpsc::UnboundedReceiver<PoolCommand>, max: usize) {
    let mut state = PoolState {
        max,
        free: Vec::new(),
        active: 0,
        waiters: VecDeque::new(),
        response_time_total: Duration::ZERO,
        response_count: 0,
    };

    while let Some(cmd) = rx.recv().await {
        match cmd {
            PoolCommand::Acquire { reply } => {
                if let Some(mut conn) = state.free.pop() {
                    conn.last_used_at = Utc::now();
                    state.active += 1;
                    if let Err(rejected) = reply.send(Ok(conn)) {
                        // Caller gave up; the connection goes straight back.
                        state.active -= 1;
                        if let Ok(conn) = rejected {
                            state.free.push(conn);
                        }
                    }
                } else if state.total() < state.max {
                    state.active += 1;
                    if let Err(rejected) = reply.send(Ok(new_connection())) {
                        state.active -= 1;
                        if let Ok(conn) = rejected {
                            state.free.push(conn);
                        }
                    }
                } else {
                    state.waiters.push_back(reply);
                }
            }
            PoolCommand::Release {
                mut conn,
                response_time,
            } => {
                state.response_time_total += response_time;
                state.response_count += 1;
                conn.last_used_at = Utc::now();

                // Hand off directly to the oldest waiter still listening.
                let mut handed_off = false;
                while let Some(waiter) = state.waiters.pop_front() {
                    match waiter.send(Ok(conn.clone())) {
                        Ok(()) => {
                            handed_off = true;
                            break;
                        }
                        Err(_) => continue, // waiter went away, try the next
                    }
                }
                if !handed_off {
                    state.active = state.active.saturating_sub(1);
                    state.free.push(conn);
                }
            }
            PoolCommand::Stats { reply } => {
                let _ = reply.send(state.stats());
            }
            PoolCommand::Destroy => {
                debug!(
                    queued = state.waiters.len(),
                    "destroying pool, rejecting waiters"
                );
                while let Some(waiter) = state.waiters.pop_front() {
                    let _ = waiter.send(Err(PoolError::Destroyed));
                }
                state.free.clear();
                return;
            }
        }
    }
}

fn new_connection() -> PooledConnection {
    let now = Utc::now();
    PooledConnection {
        id: Uuid::new_v4().to_string(),
        created_at: now,
        last_used_at: now,
    }
}

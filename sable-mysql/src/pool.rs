//! A bounded pool of connections
//!
//! Example:
//! --------
//! ```no_run
//! use sable_mysql::{ConnectionOptions, Pool, PoolOptions};
//!
//! async fn test() -> sable_mysql::Result<()> {
//!     let pool = Pool::connect(
//!         ConnectionOptions::new()
//!             .host("127.0.0.1")
//!             .user("user")
//!             .password("pw")
//!             .db("test"),
//!         PoolOptions {
//!             maxsize: 10,
//!             ..Default::default()
//!         },
//!     )
//!     .await?;
//!
//!     let mut conn = pool.acquire().await?;
//!     let mut cursor = conn.cursor();
//!     cursor
//!         .execute("SELECT `number` FROM `table` WHERE `id`=%s", (42,))
//!         .await?;
//!     if let Some(row) = cursor.fetchone().await? {
//!         println!("found {:?}", row);
//!     }
//!     Ok(())
//! }
//! ```
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Notify};
use tracing::debug;

use crate::connection::{Connection, KillSwitch};
use crate::error::{Error, Result};
use crate::opts::ConnectionOptions;

/// Options used for a connection pool
#[derive(Clone)]
pub struct PoolOptions {
    /// Connections opened up front when the pool is created
    pub minsize: usize,
    /// Upper bound on the total number of connections
    pub maxsize: usize,
    /// Log every statement sent on pooled connections
    pub echo: bool,
    /// Maximum idle age of a pooled connection before it is closed on the
    /// next acquire; None disables recycling
    ///
    /// The age is measured from the moment the connection entered the free
    /// list and only checked at acquire time, so an idle connection may
    /// exceed it while nobody asks for one.
    pub recycle: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            minsize: 1,
            maxsize: 10,
            echo: false,
            recycle: None,
        }
    }
}

/// A connection sitting in the free list
struct Idle {
    /// The pooled connection
    conn: Connection,
    /// When it entered the free list
    since: Instant,
}

/// Part of the pool state protected by a mutex
struct Protected {
    /// Idle connections, oldest first
    free: VecDeque<Idle>,
    /// Number of connections currently handed out
    acquired: usize,
    /// Number of connections currently being opened
    acquiring: usize,
    /// Pending acquirers in arrival order, each resumed at most once
    waiters: VecDeque<oneshot::Sender<()>>,
    /// Kill handles of handed-out connections, for terminate
    kills: Vec<Weak<KillSwitch>>,
    /// No new acquires are admitted
    closing: bool,
    /// Every connection is gone
    closed: bool,
}

/// Inner state of a pool
struct PoolInner {
    /// Part of the state protected by a mutex
    protected: Mutex<Protected>,
    /// Template used to open new connections
    connection_options: ConnectionOptions,
    /// The pool options given at creation time
    pool_options: PoolOptions,
    /// Notified whenever the pool may have finished closing
    released: Notify,
}

/// A pool of connections that can be acquired and released concurrently
#[derive(Clone)]
pub struct Pool(Arc<PoolInner>);

/// What an acquire attempt decided to do while holding the lock
enum Step {
    /// An idle connection was taken; liveness-check it
    Check(Connection),
    /// Capacity is available; open a new connection
    Open,
    /// The pool is saturated; wait for a slot
    Wait(oneshot::Receiver<()>),
}

/// Accounting for one pool slot, released on drop unless the acquire
/// completes and disarms it
struct SlotGuard {
    pool: Pool,
    slot: Slot,
    armed: bool,
}

#[derive(Clone, Copy)]
enum Slot {
    Acquired,
    Acquiring,
}

impl SlotGuard {
    fn new(pool: Pool, slot: Slot) -> Self {
        Self {
            pool,
            slot,
            armed: true,
        }
    }

    /// The slot stays taken; nothing happens on drop
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut p = self.pool.0.protected.lock().unwrap();
        match self.slot {
            Slot::Acquired => p.acquired = p.acquired.saturating_sub(1),
            Slot::Acquiring => p.acquiring = p.acquiring.saturating_sub(1),
        }
        Pool::wake_one(&mut p);
        self.pool.check_closed(&mut p);
    }
}

impl Pool {
    /// Create a pool and open `minsize` connections up front
    pub async fn connect(
        connection_options: ConnectionOptions,
        pool_options: PoolOptions,
    ) -> Result<Pool> {
        if pool_options.maxsize == 0 {
            return Err(Error::programming("maxsize must be at least 1".to_string()));
        }
        if pool_options.minsize > pool_options.maxsize {
            return Err(Error::programming(
                "minsize must not exceed maxsize".to_string(),
            ));
        }
        let mut connection_options = connection_options;
        connection_options.echo = connection_options.echo || pool_options.echo;
        let pool = Pool(Arc::new(PoolInner {
            protected: Mutex::new(Protected {
                free: VecDeque::new(),
                acquired: 0,
                acquiring: 0,
                waiters: VecDeque::new(),
                kills: Vec::new(),
                closing: false,
                closed: false,
            }),
            connection_options,
            pool_options,
            released: Notify::new(),
        }));
        for _ in 0..pool.0.pool_options.minsize {
            let conn = Connection::connect(pool.0.connection_options.clone()).await?;
            let mut p = pool.0.protected.lock().unwrap();
            p.free.push_back(Idle {
                conn,
                since: Instant::now(),
            });
        }
        Ok(pool)
    }

    /// Number of connections the pool accounts for
    pub fn size(&self) -> usize {
        let p = self.0.protected.lock().unwrap();
        p.free.len() + p.acquired + p.acquiring
    }

    /// Number of idle connections
    pub fn freesize(&self) -> usize {
        self.0.protected.lock().unwrap().free.len()
    }

    /// The configured lower bound
    pub fn minsize(&self) -> usize {
        self.0.pool_options.minsize
    }

    /// The configured upper bound
    pub fn maxsize(&self) -> usize {
        self.0.pool_options.maxsize
    }

    /// True when pooled connections log their statements
    pub fn echo(&self) -> bool {
        self.0.pool_options.echo
    }

    /// True once close or terminate has been requested
    pub fn is_closing(&self) -> bool {
        self.0.protected.lock().unwrap().closing
    }

    /// True once every connection is gone
    pub fn closed(&self) -> bool {
        self.0.protected.lock().unwrap().closed
    }

    /// Resume the oldest waiter still listening
    fn wake_one(p: &mut Protected) {
        while let Some(w) = p.waiters.pop_front() {
            if w.send(()).is_ok() {
                break;
            }
        }
    }

    fn check_closed(&self, p: &mut Protected) {
        if p.closing && !p.closed && p.free.is_empty() && p.acquired == 0 && p.acquiring == 0 {
            p.closed = true;
            self.0.released.notify_waiters();
        }
    }

    /// Acquire a connection, waiting in FIFO order when the pool is
    /// saturated
    ///
    /// Idle connections past their recycle age are closed and replaced, and
    /// the survivor is liveness-checked before being handed out, so stale
    /// connections the server closed while they idled are silently replaced.
    ///
    /// The returned future is drop safe.
    pub async fn acquire(&self) -> Result<PoolConnection> {
        loop {
            let step = {
                let mut p = self.0.protected.lock().unwrap();
                if p.closing {
                    return Err(Error::Interface(
                        "cannot acquire from a closed pool".to_string(),
                    ));
                }
                loop {
                    match p.free.pop_front() {
                        Some(mut idle) => {
                            if let Some(limit) = self.0.pool_options.recycle {
                                if idle.since.elapsed() > limit {
                                    debug!("closing idle connection past its recycle age");
                                    idle.conn.close();
                                    continue;
                                }
                            }
                            p.acquired += 1;
                            break Step::Check(idle.conn);
                        }
                        None => {
                            if p.free.len() + p.acquired + p.acquiring
                                < self.0.pool_options.maxsize
                            {
                                p.acquiring += 1;
                                break Step::Open;
                            }
                            let (tx, rx) = oneshot::channel();
                            p.waiters.push_back(tx);
                            break Step::Wait(rx);
                        }
                    }
                }
            };
            match step {
                Step::Check(mut conn) => {
                    let guard = SlotGuard::new(self.clone(), Slot::Acquired);
                    match conn.ping(false).await {
                        Ok(()) => {
                            guard.disarm();
                            return Ok(self.wrap(conn));
                        }
                        Err(e) => {
                            debug!(error = %e, "dropping stale pooled connection");
                            conn.close();
                            // the guard frees the slot and wakes a waiter
                        }
                    }
                }
                Step::Open => {
                    let guard = SlotGuard::new(self.clone(), Slot::Acquiring);
                    match Connection::connect(self.0.connection_options.clone()).await {
                        Ok(conn) => {
                            guard.disarm();
                            let mut p = self.0.protected.lock().unwrap();
                            p.acquiring -= 1;
                            p.acquired += 1;
                            drop(p);
                            return Ok(self.wrap(conn));
                        }
                        Err(e) => return Err(e),
                    }
                }
                Step::Wait(rx) => {
                    // resumed by a freed slot or by the pool closing
                    let _ = rx.await;
                }
            }
        }
    }

    fn wrap(&self, conn: Connection) -> PoolConnection {
        let mut p = self.0.protected.lock().unwrap();
        p.kills.retain(|k| k.strong_count() > 0);
        p.kills.push(Arc::downgrade(&conn.kill_handle()));
        drop(p);
        PoolConnection {
            pool: self.clone(),
            conn: Some(conn),
        }
    }

    /// Hand a connection back to the pool; never blocks
    ///
    /// Dropping the [PoolConnection] does the same thing.
    pub fn release(conn: PoolConnection) {
        drop(conn);
    }

    fn release_owned(&self, mut conn: Connection) {
        let mut p = self.0.protected.lock().unwrap();
        debug_assert!(p.acquired > 0);
        p.acquired = p.acquired.saturating_sub(1);
        if !p.closing && conn.is_reusable() {
            p.free.push_back(Idle {
                conn,
                since: Instant::now(),
            });
        } else {
            // unread data or an open transaction means the connection is not
            // in a known-clean state; close it instead of pooling it
            if !conn.closed() {
                debug!("closing connection instead of returning it to the pool");
            }
            conn.close();
        }
        Self::wake_one(&mut p);
        self.check_closed(&mut p);
    }

    /// Close every idle connection, keeping acquired ones
    pub async fn clear(&self) {
        let mut drained = Vec::new();
        {
            let mut p = self.0.protected.lock().unwrap();
            while let Some(idle) = p.free.pop_front() {
                drained.push(idle.conn);
            }
        }
        for mut conn in drained {
            conn.ensure_closed().await.ok();
        }
        let mut p = self.0.protected.lock().unwrap();
        Self::wake_one(&mut p);
        self.check_closed(&mut p);
    }

    /// Close the pool
    ///
    /// Idle connections are closed immediately, acquired ones when they are
    /// released, and new acquires fail. Idempotent.
    pub fn close(&self) {
        let mut p = self.0.protected.lock().unwrap();
        p.closing = true;
        while let Some(mut idle) = p.free.pop_front() {
            idle.conn.close();
        }
        // resume every waiter so it observes the closing flag
        for w in p.waiters.drain(..) {
            let _ = w.send(());
        }
        self.check_closed(&mut p);
    }

    /// Close like [Pool::close] and additionally kill acquired connections,
    /// failing their owners' in-flight operations
    pub fn terminate(&self) {
        self.close();
        let kills: Vec<_> = {
            let mut p = self.0.protected.lock().unwrap();
            p.kills.drain(..).filter_map(|k| k.upgrade()).collect()
        };
        for k in kills {
            k.kill();
        }
    }

    /// Wait until every connection is gone; requires [Pool::close] first
    pub async fn wait_closed(&self) -> Result<()> {
        {
            let p = self.0.protected.lock().unwrap();
            if p.closed {
                return Ok(());
            }
            if !p.closing {
                return Err(Error::programming(
                    "wait_closed() requires close() first".to_string(),
                ));
            }
        }
        loop {
            let notified = self.0.released.notified();
            {
                let p = self.0.protected.lock().unwrap();
                if p.closed {
                    return Ok(());
                }
            }
            notified.await;
        }
    }
}

/// A connection borrowed from the pool
///
/// Dereferences to [Connection] and goes back to the pool on drop. A
/// connection that is closed, mid-transaction or has unread results is
/// closed instead of being pooled again.
pub struct PoolConnection {
    /// The pool the connection came from
    pool: Pool,
    /// The borrowed connection, taken out on drop
    conn: Option<Connection>,
}

impl std::fmt::Debug for PoolConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConnection").finish_non_exhaustive()
    }
}

impl PoolConnection {
    /// Take the connection out of the pool for good
    pub fn detach(mut self) -> Connection {
        let conn = self.conn.take().expect("connection present");
        let pool = self.pool.clone();
        let mut p = pool.0.protected.lock().unwrap();
        p.acquired = p.acquired.saturating_sub(1);
        Pool::wake_one(&mut p);
        pool.check_closed(&mut p);
        conn
    }
}

impl Deref for PoolConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present")
    }
}

impl DerefMut for PoolConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present")
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release_owned(conn);
        }
    }
}

//! Pooled outbound connections, partitioned by [`ConnKey`].
//!
//! A pool tracks idle connections by value and busy connections by
//! id only: while busy, the [`SenderConn`] itself is owned by the
//! caller that checked it out, which guarantees that at most one
//! delivery uses a connection at a time.
use crate::keys::{ConnId, ConnKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// An established SMTP session. The protocol itself is implemented
/// by the [`crate::dispatcher::MessageSender`]; the pool only needs
/// to be able to end a session politely.
#[async_trait]
pub trait Transport: Send {
    async fn quit(&mut self);
}

pub struct SenderConn {
    pub id: ConnId,
    /// Local address the connection is bound to
    pub ip: String,
    /// The exchange host this connection talks to
    pub mx_host: String,
    /// Messages attempted over the current session
    pub attempts: u32,
    pub last_used: DateTime<Utc>,
    pub session: Option<Box<dyn Transport>>,
}

impl std::fmt::Debug for SenderConn {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("SenderConn")
            .field("id", &self.id)
            .field("ip", &self.ip)
            .field("mx_host", &self.mx_host)
            .field("attempts", &self.attempts)
            .field("last_used", &self.last_used)
            .field("open", &self.is_open())
            .finish()
    }
}

impl SenderConn {
    pub fn new(id: ConnId, ip: &str, mx_host: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            ip: ip.to_string(),
            mx_host: mx_host.to_string(),
            attempts: 0,
            last_used: now,
            session: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// True once the session has carried `sendsperconn` messages and
    /// must be re-established before the next one. Zero means no cap.
    pub fn needs_reset(&self, sendsperconn: u32) -> bool {
        self.is_open() && sendsperconn > 0 && self.attempts >= sendsperconn
    }

    /// Ends the session, if any; the next delivery reconnects
    pub async fn reset(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.quit().await;
        }
        self.attempts = 0;
    }
}

/// Closes connections without holding up the caller, which is
/// typically under the sender lock.
pub fn close_in_background(conns: Vec<SenderConn>) {
    let mut conns: Vec<SenderConn> = conns.into_iter().filter(SenderConn::is_open).collect();
    if conns.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for conn in &mut conns {
            tracing::trace!("closing connection {} to {}", conn.id, conn.mx_host);
            conn.reset().await;
        }
    });
}

/// The connections of one [`ConnKey`]
#[derive(Debug)]
pub struct SenderConns {
    idle: BTreeMap<ConnId, SenderConn>,
    busy: BTreeSet<ConnId>,
    dynamic_limit: usize,
}

impl Default for SenderConns {
    fn default() -> Self {
        Self {
            idle: BTreeMap::new(),
            busy: BTreeSet::new(),
            dynamic_limit: 1,
        }
    }
}

impl SenderConns {
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn busy_count(&self) -> usize {
        self.busy.len()
    }

    pub fn occupancy(&self) -> usize {
        self.idle.len() + self.busy.len()
    }

    pub fn dynamic_limit(&self) -> usize {
        self.dynamic_limit
    }

    pub fn is_busy(&self, id: ConnId) -> bool {
        self.busy.contains(&id)
    }

    pub fn can_grow(&self) -> bool {
        self.occupancy() < self.dynamic_limit
    }

    /// Moves an idle connection to `mx_host` into the busy set and
    /// hands it to the caller.
    pub fn checkout_idle(&mut self, mx_host: &str, now: DateTime<Utc>) -> Option<SenderConn> {
        let id = self
            .idle
            .iter()
            .find(|(_, conn)| conn.mx_host == mx_host)
            .map(|(id, _)| *id)?;
        let mut conn = self.idle.remove(&id)?;
        conn.last_used = now;
        self.busy.insert(id);
        Some(conn)
    }

    /// Registers a newly created connection as busy
    pub fn checkout_new(&mut self, conn: &SenderConn) {
        self.busy.insert(conn.id);
    }

    /// Returns a busy connection to the pool. A connection whose
    /// session is closed is not worth keeping and is dropped.
    pub fn checkin(&mut self, id: ConnId, conn: Option<SenderConn>) {
        if !self.busy.remove(&id) {
            tracing::warn!("connection {id} checked in but was not busy");
        }
        if let Some(conn) = conn.filter(SenderConn::is_open) {
            self.idle.insert(id, conn);
        }
    }

    /// Removes every idle connection
    pub fn drain_idle(&mut self) -> Vec<SenderConn> {
        std::mem::take(&mut self.idle).into_values().collect()
    }

    /// Allows one more connection, up to `static_cap`.
    /// Returns true if the limit changed.
    pub fn grow(&mut self, static_cap: usize) -> bool {
        let cap = static_cap.max(1);
        if self.dynamic_limit < cap {
            self.dynamic_limit += 1;
            true
        } else if self.dynamic_limit > cap {
            self.dynamic_limit = cap;
            true
        } else {
            false
        }
    }

    /// Collapses back to a single connection. Returns true if the
    /// limit changed.
    pub fn reset_limit(&mut self) -> bool {
        if self.dynamic_limit > 1 {
            self.dynamic_limit = 1;
            true
        } else {
            false
        }
    }

    /// Removes idle connections that exceed the dynamic limit, least
    /// recently used first, and those unused since `idle_cutoff`.
    pub fn trim(&mut self, idle_cutoff: DateTime<Utc>) -> Vec<SenderConn> {
        let mut excess = self.occupancy().saturating_sub(self.dynamic_limit);
        let mut by_age: Vec<(DateTime<Utc>, ConnId)> = self
            .idle
            .iter()
            .map(|(id, conn)| (conn.last_used, *id))
            .collect();
        by_age.sort();

        let mut closed = vec![];
        for (last_used, id) in by_age {
            if excess == 0 && last_used >= idle_cutoff {
                continue;
            }
            if let Some(conn) = self.idle.remove(&id) {
                excess = excess.saturating_sub(1);
                closed.push(conn);
            }
        }
        closed
    }
}

/// All pools of one profile
pub type ConnPools = BTreeMap<ConnKey, SenderConns>;

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    pub struct NullTransport {
        pub quits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for NullTransport {
        async fn quit(&mut self) {
            self.quits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn open_conn(id: u64, mx: &str, now: DateTime<Utc>) -> SenderConn {
        let mut conn = SenderConn::new(ConnId(id), "10.0.0.1", mx, now);
        conn.session = Some(Box::new(NullTransport::default()));
        conn
    }

    #[test]
    fn checkout_moves_between_sets() {
        let mut pool = SenderConns::default();
        assert!(pool.can_grow());
        let conn = open_conn(1, "mx1.example.com", t0());
        pool.checkout_new(&conn);
        assert_eq!(pool.busy_count(), 1);
        assert!(!pool.can_grow());

        pool.checkin(conn.id, Some(conn));
        assert_eq!((pool.idle_count(), pool.busy_count()), (1, 0));

        assert!(pool.checkout_idle("mx2.example.com", t0()).is_none());
        let again = pool.checkout_idle("mx1.example.com", t0()).unwrap();
        assert_eq!(again.id, ConnId(1));
        assert_eq!((pool.idle_count(), pool.busy_count()), (0, 1));

        // a closed session is dropped on return
        let closed = SenderConn::new(ConnId(1), "10.0.0.1", "mx1.example.com", t0());
        pool.checkin(ConnId(1), Some(closed));
        assert_eq!(pool.occupancy(), 0);
    }

    #[test]
    fn dynamic_limit_bounds() {
        let mut pool = SenderConns::default();
        assert!(pool.grow(3));
        assert!(pool.grow(3));
        assert!(!pool.grow(3));
        assert_eq!(pool.dynamic_limit(), 3);

        // a lowered cap pulls the limit down
        assert!(pool.grow(2));
        assert_eq!(pool.dynamic_limit(), 2);

        assert!(pool.reset_limit());
        assert!(!pool.reset_limit());
        assert_eq!(pool.dynamic_limit(), 1);

        // never below one, even with a zero cap
        assert!(!pool.grow(0));
        assert_eq!(pool.dynamic_limit(), 1);
    }

    #[test]
    fn trim_excess_and_stale() {
        let mut pool = SenderConns::default();
        pool.grow(3);
        pool.grow(3);
        for id in 1..=3 {
            let conn = open_conn(id, "mx.example.com", t0() + Duration::seconds(id as i64));
            pool.checkout_new(&conn);
            pool.checkin(conn.id, Some(conn));
        }
        assert_eq!(pool.idle_count(), 3);

        pool.reset_limit();
        let closed = pool.trim(t0());
        // the two least recently used go
        let ids: Vec<ConnId> = closed.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![ConnId(1), ConnId(2)]);

        let closed = pool.trim(t0() + Duration::seconds(60));
        assert_eq!(closed.len(), 1);
        assert_eq!(pool.occupancy(), 0);
    }

    #[tokio::test]
    async fn reset_quits_session() {
        let quits = Arc::new(AtomicUsize::new(0));
        let mut conn = SenderConn::new(ConnId(7), "10.0.0.1", "mx.example.com", t0());
        conn.session = Some(Box::new(NullTransport {
            quits: quits.clone(),
        }));
        conn.attempts = 5;
        assert!(conn.needs_reset(5));
        assert!(!conn.needs_reset(0));
        assert!(!conn.needs_reset(6));

        conn.reset().await;
        assert!(!conn.is_open());
        assert_eq!(conn.attempts, 0);
        assert_eq!(quits.load(Ordering::SeqCst), 1);
    }
}

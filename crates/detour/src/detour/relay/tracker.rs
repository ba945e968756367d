use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::Serialize;
use tokio::{task::JoinHandle, time::Instant};

use crate::detour::relay::{outbound::Outbound, protocol::SessionId, socket::OutboundSocket};

/// Default idle threshold; matches the outbound I/O deadline.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Default housekeeping period.
pub const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(10);

/// Remote-side state of one relayed connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub network: String,
    pub address: String,
    pub last_activity: Instant,
    pub socket: OutboundSocket,
    pub reply: Outbound,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub network: String,
    pub address: String,
    pub idle_ms: u64,
}

/// Registry of live sessions keyed by [`SessionId`].
///
/// At most one socket is indexed per id; replacing an entry closes the socket
/// it held. Sockets are always closed after the lock is released.
#[derive(Debug)]
pub struct Tracker {
    sessions: Mutex<HashMap<SessionId, Session>>,
    idle_timeout: Duration,
}

impl Tracker {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Session>> {
        // Critical sections never panic midway; recover the map if a caller did.
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn upsert(&self, session: Session) {
        let new_socket = session.socket.clone();
        let old = self.lock().insert(session.id.clone(), session);
        match old {
            Some(old) => {
                if !old.socket.same(&new_socket) {
                    tracing::debug!(session = %old.id, address = %old.address, "tracker: replacing session; closing previous socket");
                    old.socket.close();
                }
            }
            None => metrics::gauge!("detour_active_sessions").increment(1.0),
        }
    }

    pub fn find(&self, id: &SessionId) -> Option<Session> {
        self.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        let old = self.lock().remove(id);
        if old.is_some() {
            metrics::gauge!("detour_active_sessions").decrement(1.0);
        }
        old
    }

    /// Removes the entry only while it still indexes `socket`.
    pub fn remove_if_current(&self, id: &SessionId, socket: &OutboundSocket) -> bool {
        let mut st = self.lock();
        if !st.get(id).is_some_and(|s| s.socket.same(socket)) {
            return false;
        }
        st.remove(id);
        drop(st);
        metrics::gauge!("detour_active_sessions").decrement(1.0);
        true
    }

    pub fn mark_alive(&self, id: &SessionId) {
        if let Some(s) = self.lock().get_mut(id) {
            s.last_activity = Instant::now();
        }
    }

    pub fn run_housekeeping(&self) -> usize {
        self.evict_idle(Instant::now())
    }

    /// Evicts every session idle for longer than the threshold as of `now`.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let evicted: Vec<Session> = {
            let mut st = self.lock();
            let stale: Vec<SessionId> = st
                .values()
                .filter(|s| now.saturating_duration_since(s.last_activity) > self.idle_timeout)
                .map(|s| s.id.clone())
                .collect();
            stale.iter().filter_map(|id| st.remove(id)).collect()
        };

        for s in &evicted {
            tracing::info!(
                session = %s.id,
                address = %s.address,
                idle = %humantime::format_duration(now.saturating_duration_since(s.last_activity)),
                "tracker: evicting idle session"
            );
            s.socket.close();
        }
        if !evicted.is_empty() {
            metrics::gauge!("detour_active_sessions").decrement(evicted.len() as f64);
            metrics::counter!("detour_sessions_evicted_total").increment(evicted.len() as u64);
        }
        evicted.len()
    }

    /// Drains the registry, closing every socket.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Session> = self.lock().drain().map(|(_, s)| s).collect();
        for s in &drained {
            s.socket.close();
        }
        if !drained.is_empty() {
            metrics::gauge!("detour_active_sessions").decrement(drained.len() as f64);
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let now = Instant::now();
        let mut out: Vec<SessionSnapshot> = self
            .lock()
            .values()
            .map(|s| SessionSnapshot {
                id: s.id.to_string(),
                network: s.network.clone(),
                address: s.address.clone(),
                idle_ms: now.saturating_duration_since(s.last_activity).as_millis() as u64,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Runs [`Tracker::run_housekeeping`] every `every` until the task is aborted.
    pub fn spawn_housekeeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            tick.tick().await;
            loop {
                tick.tick().await;
                let n = tracker.run_housekeeping();
                if n > 0 {
                    tracing::debug!(evicted = n, remaining = tracker.len(), "tracker: housekeeping pass");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detour::relay::socket::SocketReader;

    fn session(id: &str, reply: &Outbound) -> (Session, SocketReader, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(64);
        let (socket, rd) = OutboundSocket::new(Box::new(a));
        (
            Session {
                id: id.into(),
                network: "tcp".into(),
                address: "example.com:80".into(),
                last_activity: Instant::now(),
                socket,
                reply: reply.clone(),
            },
            rd,
            b,
        )
    }

    #[tokio::test]
    async fn upsert_replaces_and_closes_previous_socket() {
        let (reply, _rx) = Outbound::detached(4);
        let tracker = Tracker::new(DEFAULT_IDLE_TIMEOUT);

        let (s1, _r1, _p1) = session("S1", &reply);
        let first = s1.socket.clone();
        tracker.upsert(s1);

        let (s2, _r2, _p2) = session("S1", &reply);
        let second = s2.socket.clone();
        tracker.upsert(s2);

        assert!(first.is_closed());
        assert!(!second.is_closed());
        let found = tracker.find(&"S1".into()).unwrap();
        assert!(found.socket.same(&second));
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn upsert_same_socket_keeps_it_open() {
        let (reply, _rx) = Outbound::detached(4);
        let tracker = Tracker::new(DEFAULT_IDLE_TIMEOUT);
        let (s1, _r1, _p1) = session("S1", &reply);
        let again = s1.clone();
        tracker.upsert(s1);
        tracker.upsert(again);
        assert!(!tracker.find(&"S1".into()).unwrap().socket.is_closed());
    }

    #[tokio::test]
    async fn remove_returns_entry_and_find_misses_afterwards() {
        let (reply, _rx) = Outbound::detached(4);
        let tracker = Tracker::new(DEFAULT_IDLE_TIMEOUT);
        let (s1, _r1, _p1) = session("S1", &reply);
        tracker.upsert(s1);

        let removed = tracker.remove(&"S1".into()).unwrap();
        assert_eq!(removed.address, "example.com:80");
        assert!(tracker.find(&"S1".into()).is_none());
        assert!(tracker.remove(&"S1".into()).is_none());
        // Caller owns closing.
        assert!(!removed.socket.is_closed());
    }

    #[tokio::test]
    async fn remove_if_current_ignores_replaced_socket() {
        let (reply, _rx) = Outbound::detached(4);
        let tracker = Tracker::new(DEFAULT_IDLE_TIMEOUT);
        let (s1, _r1, _p1) = session("S1", &reply);
        let stale = s1.socket.clone();
        tracker.upsert(s1);
        let (s2, _r2, _p2) = session("S1", &reply);
        tracker.upsert(s2);

        assert!(!tracker.remove_if_current(&"S1".into(), &stale));
        assert_eq!(tracker.len(), 1);
        let current = tracker.find(&"S1".into()).unwrap().socket;
        assert!(tracker.remove_if_current(&"S1".into(), &current));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn housekeeping_evicts_idle_and_keeps_refreshed() {
        let (reply, _rx) = Outbound::detached(4);
        let tracker = Tracker::new(Duration::from_secs(60));

        let (idle, _r1, _p1) = session("idle", &reply);
        let (busy, _r2, _p2) = session("busy", &reply);
        let idle_sock = idle.socket.clone();
        let busy_sock = busy.socket.clone();
        tracker.upsert(idle);
        tracker.upsert(busy);

        let start = Instant::now();
        // Refresh "busy" just before the threshold.
        if let Some(s) = tracker.lock().get_mut(&"busy".into()) {
            s.last_activity = start + Duration::from_secs(59);
        }

        assert_eq!(tracker.evict_idle(start + Duration::from_secs(30)), 0);
        assert_eq!(tracker.evict_idle(start + Duration::from_secs(61)), 1);

        assert!(tracker.find(&"idle".into()).is_none());
        assert!(idle_sock.is_closed());
        assert!(tracker.find(&"busy".into()).is_some());
        assert!(!busy_sock.is_closed());
    }

    #[tokio::test]
    async fn mark_alive_refreshes_and_ignores_unknown() {
        let (reply, _rx) = Outbound::detached(4);
        let tracker = Tracker::new(Duration::from_secs(60));
        let (s, _r, _p) = session("S1", &reply);
        let old = s.last_activity;
        tracker.upsert(s);

        tokio::time::sleep(Duration::from_millis(5)).await;
        tracker.mark_alive(&"S1".into());
        tracker.mark_alive(&"missing".into());
        assert!(tracker.find(&"S1".into()).unwrap().last_activity > old);
    }

    #[tokio::test]
    async fn close_all_drains_everything() {
        let (reply, _rx) = Outbound::detached(4);
        let tracker = Tracker::new(DEFAULT_IDLE_TIMEOUT);
        let mut socks = Vec::new();
        let mut keep = Vec::new();
        for id in ["a", "b", "c"] {
            let (s, r, p) = session(id, &reply);
            socks.push(s.socket.clone());
            keep.push((r, p));
            tracker.upsert(s);
        }
        assert_eq!(tracker.close_all(), 3);
        assert!(tracker.is_empty());
        assert!(socks.iter().all(|s| s.is_closed()));
    }

    #[tokio::test]
    async fn concurrent_upserts_leave_one_open_socket_per_id() {
        let (reply, _rx) = Outbound::detached(4);
        let tracker = Arc::new(Tracker::new(DEFAULT_IDLE_TIMEOUT));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let tracker = tracker.clone();
            let reply = reply.clone();
            tasks.push(tokio::spawn(async move {
                let mut all = Vec::new();
                for _ in 0..10 {
                    let (s, r, p) = session("shared", &reply);
                    all.push((s.socket.clone(), r, p));
                    tracker.upsert(s);
                    tokio::task::yield_now().await;
                }
                all
            }));
        }
        let mut sockets = Vec::new();
        for t in tasks {
            sockets.extend(t.await.unwrap());
        }

        let open: Vec<_> = sockets.iter().filter(|(s, _, _)| !s.is_closed()).collect();
        assert_eq!(open.len(), 1);
        let current = tracker.find(&"shared".into()).unwrap().socket;
        assert!(open[0].0.same(&current));
    }
}

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::id::ConnectionId;

fn now_unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Server-side bookkeeping for one virtual connection: the write half of
/// the upstream TCP socket (the read half lives with the pump task that
/// streams the response body) plus enough state for the reaper to
/// decide when the connection has gone idle.
pub struct ConnEntry {
    write_half: AsyncMutex<OwnedWriteHalf>,
    last_activity: AtomicI64,
    cancel: CancellationToken,
}

impl ConnEntry {
    pub fn new(write_half: OwnedWriteHalf) -> Self {
        Self {
            write_half: AsyncMutex::new(write_half),
            last_activity: AtomicI64::new(now_unix_nanos()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn touch(&self) {
        self.last_activity.store(now_unix_nanos(), Ordering::SeqCst);
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signals the pump loop owning this connection's upstream read half
    /// to stop. Does not itself close the socket: both halves must be
    /// dropped for that, which happens once the pump task observes the
    /// cancellation and returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn write_all(&self, body: &[u8]) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut guard = self.write_half.lock().await;
        guard.write_all(body).await
    }

    fn is_idle(&self, idle_timeout: Duration, now_nanos: i64) -> bool {
        let idle_nanos = idle_timeout.as_nanos() as i64;
        now_nanos - self.last_activity.load(Ordering::SeqCst) > idle_nanos
    }
}

/// Maps connection ids to their upstream state. Backed by a `DashMap` so
/// lookups from concurrent handler invocations (one per in-flight POST)
/// never contend on a single lock the way a `RwLock<HashMap>` would.
#[derive(Clone)]
pub struct Registry {
    entries: Arc<DashMap<ConnectionId, Arc<ConnEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnEntry>> {
        self.entries.get(id).map(|e| e.clone())
    }

    pub fn insert(&self, id: ConnectionId, entry: Arc<ConnEntry>) {
        self.entries.insert(id, entry);
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ConnEntry>> {
        self.entries.remove(id).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and cancels every entry that has been idle longer than
    /// `idle_timeout`. Returns how many were reaped.
    pub fn sweep_idle(&self, idle_timeout: Duration) -> usize {
        let now = now_unix_nanos();
        let stale: Vec<ConnectionId> = self
            .entries
            .iter()
            .filter(|e| e.value().is_idle(idle_timeout, now))
            .map(|e| *e.key())
            .collect();

        for id in &stale {
            if let Some((_, entry)) = self.entries.remove(id) {
                entry.cancel();
            }
        }
        stale.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_entry() -> (ConnectionId, Arc<ConnEntry>) {
        // A registry entry needs a real OwnedWriteHalf; build one from a
        // loopback socket pair rather than faking the type.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let connect = tokio::net::TcpStream::connect(addr);
            let (accepted, _client) = tokio::join!(
                async { listener.accept().await.unwrap().0 },
                async { connect.await.unwrap() }
            );
            let (_, write_half) = accepted.into_split();
            (ConnectionId::new(), Arc::new(ConnEntry::new(write_half)))
        })
    }

    #[test]
    fn insert_then_get_round_trips() {
        let registry = Registry::new();
        let (id, entry) = new_entry();
        registry.insert(id, entry);
        assert!(registry.get(&id).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_drops_the_entry() {
        let registry = Registry::new();
        let (id, entry) = new_entry();
        registry.insert(id, entry);
        assert!(registry.remove(&id).is_some());
        assert!(registry.get(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn sweep_idle_reaps_only_stale_entries() {
        let registry = Registry::new();
        let (stale_id, stale_entry) = new_entry();
        stale_entry
            .last_activity
            .store(now_unix_nanos() - Duration::from_secs(999).as_nanos() as i64, Ordering::SeqCst);
        registry.insert(stale_id, stale_entry);

        let (fresh_id, fresh_entry) = new_entry();
        registry.insert(fresh_id, fresh_entry);

        let reaped = registry.sweep_idle(Duration::from_secs(1));
        assert_eq!(reaped, 1);
        assert!(registry.get(&stale_id).is_none());
        assert!(registry.get(&fresh_id).is_some());
    }
}

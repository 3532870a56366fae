//! Registry of live connections, for diagnostics and server stop.
//!
//! Entries are weak: the registry never keeps a connection alive, and each
//! connection removes its own entry when it is destroyed. The lock here
//! covers membership only and is never held across a transport close.

use crate::runtime::connection::ConnectionShared;
use slab::Slab;
use std::fmt::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Header row of the connection report.
pub const REPORT_HEADER: &str = "DATE             THREAD STATE";

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert and remove operations.
pub struct ConnectionRegistry {
    connections: Mutex<Slab<Weak<ConnectionShared>>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(Slab::with_capacity(max_connections.min(1024))),
            max_connections,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slab<Weak<ConnectionShared>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection. Returns its key, or `None` at capacity.
    pub fn register(&self, conn: &Arc<ConnectionShared>) -> Option<usize> {
        let mut connections = self.lock();
        if connections.len() >= self.max_connections {
            return None;
        }
        Some(connections.insert(Arc::downgrade(conn)))
    }

    /// Remove a connection by key. Removing twice is harmless.
    pub fn deregister(&self, key: usize) {
        self.lock().try_remove(key);
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Strong references to every live connection.
    pub fn live(&self) -> Vec<Arc<ConnectionShared>> {
        self.lock().iter().filter_map(|(_, w)| w.upgrade()).collect()
    }

    /// Ask every live connection to shut down.
    ///
    /// Returns how many were asked.
    pub fn close_all(&self) -> usize {
        // Collect first so no transport is closed under the registry lock.
        let live = self.live();
        for conn in &live {
            conn.shutdown();
        }
        live.len()
    }

    /// Render the connection report: a header row and one row per
    /// connection with its start date, worker thread id and state.
    pub fn snapshot(&self) -> String {
        let connections = self.lock();
        let mut report = String::with_capacity(32 * (connections.len() + 1));
        report.push_str(REPORT_HEADER);
        report.push('\n');
        for (_, weak) in connections.iter() {
            let Some(conn) = weak.upgrade() else {
                continue;
            };
            let _ = writeln!(
                report,
                "{} {:>8} {}",
                conn.started().format("%d %b %H:%M:%S"),
                conn.thread_id(),
                conn.status().label()
            );
        }
        report
    }
}

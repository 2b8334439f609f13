// Copyright 2020 Joyent, Inc.

//! Registered controller connections.
//!
//! A controller connection is added once it has a known controller port,
//! either from `RegisterCtld` or from the store's record of a previous
//! registration. The list is used to contact controllers when accounting
//! data changes. Callers never hold the list lock across I/O; they take a
//! snapshot instead.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// The parts of a persistent connection shared with the registry.
#[derive(Debug)]
pub struct ConnHandle {
    id: u64,
    host: String,
    port: AtomicU16,
    cluster_name: Option<String>,
    version: u16,
    tres_str: Mutex<Option<String>>,
}

impl ConnHandle {
    pub fn new(id: u64, host: &str, cluster_name: Option<&str>, version: u16) -> ConnHandle {
        ConnHandle {
            id,
            host: host.to_string(),
            port: AtomicU16::new(0),
            cluster_name: cluster_name.map(|c| c.to_string()),
            version,
            tres_str: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Controller listen port, or 0 when the peer is not a registered
    /// controller.
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::SeqCst)
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.cluster_name.as_deref()
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn tres_str(&self) -> Option<String> {
        lock(&self.tres_str).clone()
    }

    pub fn set_tres_str(&self, tres: Option<&str>) {
        *lock(&self.tres_str) = tres.map(|t| t.to_string());
    }

    /// `host:port` of the controller, if it has registered a port.
    pub fn address(&self) -> Option<String> {
        match self.port() {
            0 => None,
            port => Some(format!("{}:{}", self.host, port)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct RegisteredClusters {
    conns: Mutex<Vec<Arc<ConnHandle>>>,
}

impl RegisteredClusters {
    pub fn new() -> RegisteredClusters {
        RegisteredClusters::default()
    }

    /// Append `conn` unless it is already present. An entry for the same
    /// cluster from an older connection is replaced. Returns true when the
    /// list changed.
    pub fn add(&self, conn: &Arc<ConnHandle>) -> bool {
        let mut conns = lock(&self.conns);
        if conns.iter().any(|c| Arc::ptr_eq(c, conn)) {
            return false;
        }
        let same_cluster = conns.iter().position(|c| {
            c.cluster_name.is_some() && c.cluster_name == conn.cluster_name
        });
        match same_cluster {
            Some(i) => conns[i] = Arc::clone(conn),
            None => conns.push(Arc::clone(conn)),
        }
        true
    }

    /// Remove `conn` by identity. Returns true when it was present.
    pub fn remove(&self, conn: &Arc<ConnHandle>) -> bool {
        let mut conns = lock(&self.conns);
        let before = conns.len();
        conns.retain(|c| !Arc::ptr_eq(c, conn));
        conns.len() != before
    }

    pub fn snapshot(&self) -> Vec<Arc<ConnHandle>> {
        lock(&self.conns).clone()
    }

    pub fn find(&self, cluster: &str) -> Option<Arc<ConnHandle>> {
        lock(&self.conns)
            .iter()
            .find(|c| c.cluster_name() == Some(cluster))
            .cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.conns).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

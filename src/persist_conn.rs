// Copyright 2020 Joyent, Inc.

//! Server-side state of one persistent connection.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::auth::Identity;
use crate::protocol::{PROTOCOL_VERSION_CURRENT, PROTOCOL_VERSION_MIN};
use crate::registry::ConnHandle;
use crate::storage::StorageSession;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Uninitialized,
    Initialized,
    Closed,
}

/// The version to speak with a caller advertising `caller`, or `None` when
/// the caller is too old.
pub fn negotiate_version(caller: u16, local: u16) -> Option<u16> {
    if caller < PROTOCOL_VERSION_MIN {
        None
    } else {
        Some(caller.min(local))
    }
}

pub struct PersistConn {
    pub id: u64,
    pub peer_host: String,
    pub state: ConnState,
    pub identity: Option<Identity>,
    /// Negotiated version. Replies before init use the caller's frame
    /// version.
    pub version: u16,
    pub flags: u16,
    /// Forces every privilege check to fail for this connection.
    pub drop_priv: bool,
    pub session: Option<Box<dyn StorageSession>>,
    /// Set by init. Shared with the registry.
    pub handle: Option<Arc<ConnHandle>>,
    /// Kinds of accounting objects written since the last commit.
    pub changed: BTreeSet<&'static str>,
    /// Controller writes waiting for the periodic commit.
    pub delayed: bool,
}

impl fmt::Debug for PersistConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistConn")
            .field("id", &self.id)
            .field("peer_host", &self.peer_host)
            .field("state", &self.state)
            .field("identity", &self.identity)
            .field("version", &self.version)
            .field("cluster", &self.cluster_name())
            .field("peer_port", &self.peer_port())
            .finish()
    }
}

impl PersistConn {
    pub fn new(id: u64, peer_host: &str) -> PersistConn {
        PersistConn {
            id,
            peer_host: peer_host.to_string(),
            state: ConnState::Uninitialized,
            identity: None,
            version: PROTOCOL_VERSION_CURRENT,
            flags: 0,
            drop_priv: false,
            session: None,
            handle: None,
            changed: BTreeSet::new(),
            delayed: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state == ConnState::Initialized
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    pub fn uid(&self) -> Option<u32> {
        self.identity.map(|id| id.uid)
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.handle.as_ref().and_then(|h| h.cluster_name())
    }

    /// Controller port of the peer, or 0 for a plain client.
    pub fn peer_port(&self) -> u16 {
        self.handle.as_ref().map(|h| h.port()).unwrap_or(0)
    }

    pub fn set_peer_port(&self, port: u16) {
        if let Some(handle) = &self.handle {
            handle.set_port(port);
        }
    }

    pub fn is_controller(&self) -> bool {
        self.peer_port() != 0
    }

    /// Close the storage session and mark the connection closed.
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = session.close();
        }
        self.state = ConnState::Closed;
    }
}

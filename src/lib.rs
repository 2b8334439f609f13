// Copyright 2020 Joyent, Inc.

//! Persistent RPC dispatcher for a cluster accounting daemon.
//!
//! Controllers, command-line tools and peer daemons hold long-lived TCP
//! connections to the accounting daemon. Each connection is initialized
//! once, then carries a stream of request/reply messages. Requests are
//! checked against the caller's privilege, run against a transactional
//! accounting store, and answered with a typed reply or a return code.
//!
//! Protocol definition
//!
//! Every message travels in a frame:
//!
//! * VERSION   2-byte big-endian protocol version. Before init this is the
//!             caller's version; afterwards it is the negotiated version.
//!
//! * LENGTH    4-byte big-endian count of body bytes that follow.
//!
//! * BODY      2-byte big-endian message type, then the type's payload.
//!
//! Payload fields are packed big-endian. Strings are a 4-byte length that
//! counts a trailing NUL, then the bytes and the NUL; length 0 is an absent
//! string. Lists are a 4-byte count, then the elements.
//!
//! Connection lifecycle
//!
//! The first message on a connection must be `PersistInit`. It names the
//! caller's version, uid, cluster and flags. A caller older than
//! `PROTOCOL_VERSION_MIN` is refused. A caller that fails authentication is
//! disconnected without a reply. Every later message is answered at the
//! negotiated version until `Fini` or disconnect.
//!
//! Writes from a registered controller are committed by the dispatcher
//! right after the reply is sent. Writes from other callers stay pending
//! until the caller sends `Fini` with `commit` set.

#![allow(missing_docs)]

pub mod auth;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod handlers;
pub mod msg;
pub mod pack;
pub mod persist_conn;
pub mod privilege;
pub mod protocol;
pub mod rc;
pub mod records;
pub mod registry;
pub mod server;
pub mod stats;
pub mod storage;
pub mod update;

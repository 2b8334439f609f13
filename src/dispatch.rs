// Copyright 2020 Joyent, Inc.

//! Request dispatch for persistent connections.
//!
//! `Dispatcher::process` turns one inbound frame into at most one reply
//! frame. It does no I/O, so it can be driven directly by tests. The caller
//! sends the reply and then calls `Dispatcher::after_send`, which applies
//! the commit policy and records statistics. A reply is therefore always on
//! the wire before its effects are committed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use slog::{debug, error, info, o, warn, Drain, Logger};
use tokio::sync::watch;

use crate::auth::{AuthCred, Authenticator};
use crate::config::{AuthMode, DbdConfig};
use crate::handlers::{self, Route};
use crate::msg::{AccountingUpdateMsg, Message, MsgBody, MsgType, PersistInitMsg, ReturnCodeMsg};
use crate::persist_conn::{negotiate_version, ConnState, PersistConn};
use crate::privilege::Privileges;
use crate::protocol::{
    decode_message, encode_message, DecodeError, Frame, PERSIST_FLAG_DBD,
    PERSIST_FLAG_DROP_PRIV, PROTOCOL_VERSION_CURRENT, PROTOCOL_VERSION_MIN,
};
use crate::rc::{
    rc_str, EEXIST, EINVAL, ESLURM_ACCESS_DENIED, ESLURM_DB_CONNECTION,
    ESLURM_QOS_PREEMPTION_LOOP, SLURM_ERROR, SLURM_NO_CHANGE_IN_DATA,
    SLURM_PROTOCOL_VERSION_ERROR, SLURM_SUCCESS,
};
use crate::registry::{ConnHandle, RegisteredClusters};
use crate::stats::RpcStats;
use crate::storage::{AcctStorage, StorageError, StorageResult};
use crate::update::UpdateNotice;

/// Build a generic reply body.
pub fn rc_body(rc: i32, comment: &str) -> MsgBody {
    MsgBody::PersistRc(ReturnCodeMsg::new(rc, Some(comment)))
}

pub fn success_body() -> MsgBody {
    MsgBody::PersistRc(ReturnCodeMsg::new(SLURM_SUCCESS, None))
}

/// The return code a reply body reports. Typed responses are successes.
pub fn reply_rc(body: &MsgBody) -> i32 {
    match body {
        MsgBody::PersistRc(rc) => rc.rc,
        MsgBody::IdRc(id) => id.rc,
        _ => SLURM_SUCCESS,
    }
}

/// Render a store error as the reply a caller sees.
pub fn error_reply(err: &StorageError) -> ReturnCodeMsg {
    let fallback = || {
        err.comment
            .clone()
            .unwrap_or_else(|| rc_str(err.rc).to_string())
    };
    let (rc, comment) = match err.rc {
        ESLURM_ACCESS_DENIED => (
            ESLURM_ACCESS_DENIED,
            "Your user doesn't have privilege to perform this action".to_string(),
        ),
        SLURM_ERROR => (
            SLURM_ERROR,
            "Something was wrong with your query".to_string(),
        ),
        SLURM_NO_CHANGE_IN_DATA => {
            (SLURM_SUCCESS, "Request didn't affect anything".to_string())
        }
        ESLURM_DB_CONNECTION => (err.rc, fallback()),
        ESLURM_QOS_PREEMPTION_LOOP => (
            ESLURM_QOS_PREEMPTION_LOOP,
            "QOS Preemption loop detected".to_string(),
        ),
        rc => (rc, fallback()),
    };
    ReturnCodeMsg::new(rc, Some(&comment))
}

pub fn error_body(err: &StorageError) -> MsgBody {
    MsgBody::PersistRc(error_reply(err))
}

/// Per-message handler context.
pub struct Ctx<'a> {
    pub dispatcher: &'a Dispatcher,
    pub conn: &'a mut PersistConn,
    pub uid: u32,
    /// Close the connection once the reply is sent.
    pub close: bool,
    /// Controllers to tell about a commit made by the handler.
    pub notice: Option<UpdateNotice>,
}

impl<'a> Ctx<'a> {
    pub fn log(&self) -> &Logger {
        &self.dispatcher.log
    }
}

struct AfterSend {
    msg_type: MsgType,
    uid: u32,
    started: Instant,
    route: Option<Route>,
    rc: i32,
    notice: Option<UpdateNotice>,
}

/// The result of processing one frame.
pub struct Outcome {
    /// Frame to send, if any.
    pub reply: Option<Frame>,
    /// Close the connection after sending the reply.
    pub close: bool,
    after: Option<AfterSend>,
}

impl Outcome {
    fn close_silently() -> Outcome {
        Outcome {
            reply: None,
            close: true,
            after: None,
        }
    }

    fn refuse(body: MsgBody, version: u16) -> Outcome {
        Outcome {
            reply: Some(encode_message(&body, version)),
            close: true,
            after: None,
        }
    }
}

pub struct Dispatcher {
    config: DbdConfig,
    storage: Arc<dyn AcctStorage>,
    auth: Arc<dyn Authenticator>,
    registry: Arc<RegisteredClusters>,
    stats: RpcStats,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    next_conn_id: AtomicU64,
    log: Logger,
}

impl Dispatcher {
    pub fn new(
        config: DbdConfig,
        storage: Arc<dyn AcctStorage>,
        auth: Arc<dyn Authenticator>,
        log: Option<&Logger>,
    ) -> Dispatcher {
        let log = log.cloned().unwrap_or_else(|| {
            Logger::root(slog_stdlog::StdLog.fuse(), o!("build-id" => "0.1.0"))
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Dispatcher {
            config,
            storage,
            auth,
            registry: Arc::new(RegisteredClusters::new()),
            stats: RpcStats::new(),
            shutdown_tx,
            shutdown_rx,
            next_conn_id: AtomicU64::new(1),
            log,
        }
    }

    pub fn config(&self) -> &DbdConfig {
        &self.config
    }

    pub fn storage(&self) -> &dyn AcctStorage {
        &*self.storage
    }

    pub fn registry(&self) -> &Arc<RegisteredClusters> {
        &self.registry
    }

    pub fn stats(&self) -> &RpcStats {
        &self.stats
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Ask the server to stop accepting connections and wind down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// A receiver that observes `true` once shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// State for a connection accepted from `peer_host`.
    pub fn new_conn(&self, peer_host: &str) -> PersistConn {
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        PersistConn::new(id, peer_host)
    }

    /// Handle one inbound frame.
    pub fn process(&self, conn: &mut PersistConn, frame: &Frame) -> Outcome {
        let started = Instant::now();
        if conn.is_closed() {
            return Outcome::close_silently();
        }

        let version = if conn.is_initialized() {
            conn.version
        } else {
            frame.version
        };
        let msg = match decode_message(frame, version) {
            Ok(msg) => msg,
            Err(DecodeError::Body(msg_type, e)) => {
                warn!(self.log, "failed to unpack message";
                    "conn_id" => conn.id,
                    "msg_type" => msg_type.as_str(),
                    "err" => %e);
                let body = rc_body(SLURM_ERROR, &format!("Failed to unpack {}", msg_type.as_str()));
                let close = !conn.is_initialized();
                return Outcome {
                    reply: Some(encode_message(&body, reply_version(version))),
                    close,
                    after: None,
                };
            }
            Err(e) => {
                warn!(self.log, "dropping connection"; "conn_id" => conn.id, "err" => %e);
                return Outcome::close_silently();
            }
        };

        if !conn.is_initialized() {
            return self.init(conn, msg, frame.version, started);
        }

        let uid = match conn.uid() {
            Some(uid) => uid,
            None => return Outcome::close_silently(),
        };

        if matches!(msg.body, MsgBody::PersistInit(_) | MsgBody::Init(_)) {
            warn!(self.log, "second init on connection"; "conn_id" => conn.id, "uid" => uid);
            let body = rc_body(EEXIST, "Connection is already initialized");
            return self.respond(conn, msg.msg_type(), uid, started, None, body, false, None);
        }

        debug!(self.log, "handling message";
            "conn_id" => conn.id,
            "msg_type" => msg.msg_type().as_str(),
            "uid" => uid);

        let msg_type = msg.msg_type();
        let mut ctx = Ctx {
            dispatcher: self,
            conn: &mut *conn,
            uid,
            close: false,
            notice: None,
        };
        let (body, route) = self.dispatch(&mut ctx, msg.body);
        let Ctx { close, notice, .. } = ctx;
        self.respond(conn, msg_type, uid, started, route, body, close, notice)
    }

    #[allow(clippy::too_many_arguments)]
    fn respond(
        &self,
        conn: &PersistConn,
        msg_type: MsgType,
        uid: u32,
        started: Instant,
        route: Option<Route>,
        body: MsgBody,
        close: bool,
        notice: Option<UpdateNotice>,
    ) -> Outcome {
        let rc = reply_rc(&body);
        Outcome {
            reply: Some(encode_message(&body, conn.version)),
            close,
            after: Some(AfterSend {
                msg_type,
                uid,
                started,
                route,
                rc,
                notice,
            }),
        }
    }

    fn init(
        &self,
        conn: &mut PersistConn,
        msg: Message,
        frame_version: u16,
        started: Instant,
    ) -> Outcome {
        let init = match &msg.body {
            MsgBody::PersistInit(init) => init.clone(),
            MsgBody::Init(_) => {
                warn!(self.log, "refusing legacy init"; "conn_id" => conn.id);
                conn.close();
                return Outcome::refuse(
                    rc_body(
                        SLURM_PROTOCOL_VERSION_ERROR,
                        "Legacy init is not supported, use a persistent connection",
                    ),
                    reply_version(frame_version),
                );
            }
            other => {
                warn!(self.log, "message before init";
                    "conn_id" => conn.id,
                    "msg_type" => other.msg_type().as_str());
                conn.close();
                return Outcome::refuse(
                    rc_body(SLURM_PROTOCOL_VERSION_ERROR, "Connection is not initialized"),
                    reply_version(frame_version),
                );
            }
        };

        let version = match negotiate_version(init.version, PROTOCOL_VERSION_CURRENT) {
            Some(version) => version,
            None => {
                warn!(self.log, "unsupported protocol version";
                    "conn_id" => conn.id,
                    "version" => init.version);
                conn.close();
                return Outcome::refuse(
                    rc_body(
                        SLURM_PROTOCOL_VERSION_ERROR,
                        &format!("Unsupported protocol version {}", init.version),
                    ),
                    reply_version(frame_version),
                );
            }
        };

        let identity = match self.auth.verify(&AuthCred::from_init(&init)) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(self.log, "authentication failed"; "conn_id" => conn.id, "err" => %e);
                conn.close();
                return Outcome::close_silently();
            }
        };

        let session = match self
            .storage
            .open_session(init.cluster_name.as_deref(), identity.uid)
        {
            Ok(session) => session,
            Err(e) => {
                error!(self.log, "unable to open storage session";
                    "conn_id" => conn.id,
                    "err" => %e);
                conn.close();
                return Outcome::refuse(error_body(&e), version);
            }
        };

        conn.version = version;
        conn.flags = init.flags;
        conn.identity = Some(identity);
        conn.drop_priv = init.flags & PERSIST_FLAG_DROP_PRIV != 0;
        conn.session = Some(session);
        conn.handle = Some(Arc::new(ConnHandle::new(
            conn.id,
            &conn.peer_host,
            init.cluster_name.as_deref(),
            version,
        )));
        conn.state = ConnState::Initialized;

        info!(self.log, "connection initialized";
            "conn_id" => conn.id,
            "peer" => &conn.peer_host,
            "cluster" => init.cluster_name.as_deref().unwrap_or(""),
            "uid" => identity.uid,
            "version" => version);

        let uid = identity.uid;
        self.respond(conn, msg.msg_type(), uid, started, None, success_body(), false, None)
    }

    /// Route, check privilege and run a handler. Used for top-level
    /// messages and for each message inside a `SendMultMsg`.
    pub fn dispatch(&self, ctx: &mut Ctx<'_>, body: MsgBody) -> (MsgBody, Option<Route>) {
        let msg_type = body.msg_type();
        let route = match handlers::route(msg_type) {
            Some(route) => route,
            None => {
                warn!(self.log, "no handler for message";
                    "conn_id" => ctx.conn.id,
                    "msg_type" => msg_type.as_str());
                return (rc_body(EINVAL, "Invalid RPC"), None);
            }
        };

        let privs = Privileges::new(
            self.config.accounting.slurm_user_id,
            &*self.storage,
            ctx.conn.drop_priv,
        );
        if !privs.check(route.class, ctx.uid) {
            error!(self.log, "access denied";
                "conn_id" => ctx.conn.id,
                "msg_type" => msg_type.as_str(),
                "uid" => ctx.uid,
                "required" => %route.class);
            let comment = format!(
                "Your user doesn't have privilege to perform this action ({} privilege required)",
                route.class
            );
            return (rc_body(ESLURM_ACCESS_DENIED, &comment), Some(route));
        }

        if route.cluster_update && ctx.conn.peer_port() == 0 {
            self.register_disconnected(ctx.conn);
        }

        (handlers::run(ctx, body), Some(route))
    }

    /// A controller that reports cluster state without registering first
    /// may have registered on an earlier connection.
    fn register_disconnected(&self, conn: &mut PersistConn) {
        if conn.cluster_name().is_none() {
            return;
        }
        let host = conn.peer_host.clone();
        let port = match conn.session.as_mut() {
            Some(session) => session.register_disconnected_controller(&host),
            None => return,
        };
        match port {
            Ok(0) => (),
            Ok(port) => {
                conn.set_peer_port(port);
                if let Some(handle) = &conn.handle {
                    if self.registry.add(handle) {
                        info!(self.log, "registered controller from stored address";
                            "conn_id" => conn.id,
                            "cluster" => handle.cluster_name().unwrap_or(""),
                            "port" => port);
                    }
                }
            }
            Err(e) => {
                warn!(self.log, "unable to look up controller"; "conn_id" => conn.id, "err" => %e);
            }
        }
    }

    /// Commit or roll back the connection's storage session. After a
    /// commit that changed accounting objects, returns the controllers to
    /// notify.
    pub fn commit(
        &self,
        conn: &mut PersistConn,
        commit: bool,
    ) -> StorageResult<Option<UpdateNotice>> {
        let session = conn
            .session
            .as_mut()
            .ok_or_else(StorageError::db_connection)?;
        let result = session.commit(commit);
        let kinds = std::mem::take(&mut conn.changed);
        conn.delayed = false;
        result?;

        if !commit || kinds.is_empty() || !self.config.accounting.push_updates {
            return Ok(None);
        }
        let own = conn.handle.as_ref();
        let targets: Vec<Arc<ConnHandle>> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|h| h.port() != 0)
            .filter(|h| own.map(|o| !Arc::ptr_eq(o, h)).unwrap_or(true))
            .collect();
        if targets.is_empty() {
            return Ok(None);
        }
        Ok(Some(UpdateNotice {
            msg: AccountingUpdateMsg {
                rpc_version: PROTOCOL_VERSION_CURRENT,
                kinds: kinds.into_iter().map(|k| k.to_string()).collect(),
            },
            init: self.update_init(),
            targets,
        }))
    }

    /// Init message this daemon uses when it contacts a controller.
    fn update_init(&self) -> PersistInitMsg {
        let uid = self.config.accounting.slurm_user_id;
        PersistInitMsg {
            version: PROTOCOL_VERSION_CURRENT,
            flags: PERSIST_FLAG_DBD,
            uid,
            cluster_name: None,
            gid: uid,
            auth_token: match self.config.auth.mode {
                AuthMode::Token => self.config.auth.token.clone(),
                AuthMode::Trusted => None,
            },
        }
    }

    /// Apply the commit policy and record statistics for a reply that has
    /// been sent.
    pub fn after_send(&self, conn: &mut PersistConn, outcome: Outcome) -> Option<UpdateNotice> {
        let after = outcome.after?;
        let mut notice = after.notice;

        let write = after.route.map(|r| r.write).unwrap_or(false);
        if write && conn.is_controller() {
            if self.config.accounting.commit_delay {
                conn.delayed = true;
            } else {
                match self.commit(conn, after.rc == SLURM_SUCCESS) {
                    Ok(pushed) => notice = notice.or(pushed),
                    Err(e) => {
                        error!(self.log, "commit failed";
                            "conn_id" => conn.id,
                            "msg_type" => after.msg_type.as_str(),
                            "err" => %e);
                    }
                }
            }
        }

        self.stats
            .record(after.msg_type, after.uid, after.started.elapsed());
        notice
    }

    /// Commit controller writes held back by `commit_delay`. Called on the
    /// commit interval and when the controller disconnects.
    pub fn flush_delayed(&self, conn: &mut PersistConn) -> Option<UpdateNotice> {
        if !conn.delayed || conn.session.is_none() {
            return None;
        }
        match self.commit(conn, true) {
            Ok(notice) => {
                debug!(self.log, "committed delayed writes"; "conn_id" => conn.id);
                notice
            }
            Err(e) => {
                error!(self.log, "delayed commit failed"; "conn_id" => conn.id, "err" => %e);
                None
            }
        }
    }

    /// Forget a connection that is going away. Delayed controller writes
    /// are committed first; anything else still pending is discarded.
    pub fn disconnect(&self, conn: &mut PersistConn) -> Option<UpdateNotice> {
        let notice = self.flush_delayed(conn);
        if let Some(handle) = &conn.handle {
            if self.registry.remove(handle) {
                info!(self.log, "controller unregistered";
                    "conn_id" => conn.id,
                    "cluster" => handle.cluster_name().unwrap_or(""));
            }
        }
        conn.close();
        notice
    }
}

/// Version for replies sent before a version has been negotiated.
fn reply_version(frame_version: u16) -> u16 {
    frame_version
        .max(PROTOCOL_VERSION_MIN)
        .min(PROTOCOL_VERSION_CURRENT)
}

// Copyright 2020 Joyent, Inc.

//! This module provides the interface for accepting and serving persistent
//! connections.
//!
//! Each accepted connection gets its own task that reads one frame at a
//! time, hands it to the `Dispatcher`, writes the reply, and only then lets
//! the dispatcher commit. A connection that stays silent for longer than
//! the configured message timeout is closed.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use slog::{o, Drain, Logger};
//! use tokio::net::TcpListener;
//!
//! use slurmdbd_rpc::auth::TrustedAuth;
//! use slurmdbd_rpc::config::DbdConfig;
//! use slurmdbd_rpc::dispatch::Dispatcher;
//! use slurmdbd_rpc::server;
//! use slurmdbd_rpc::storage::memory::MemStorage;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let log = Logger::root(slog_stdlog::StdLog.fuse(), o!());
//!     let dispatcher = Arc::new(Dispatcher::new(
//!         DbdConfig::default(),
//!         Arc::new(MemStorage::new(0)),
//!         Arc::new(TrustedAuth),
//!         Some(&log),
//!     ));
//!     let listener = TcpListener::bind("127.0.0.1:6819").await?;
//!     server::run(listener, dispatcher, &log).await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use slog::{debug, info, o, warn, Drain, Logger};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;

use crate::dispatch::Dispatcher;
use crate::protocol::PersistCodec;
use crate::update;

/// Serve one connection until the peer leaves, the connection is closed by
/// a handler, a read times out, or the daemon shuts down.
pub async fn make_task(socket: TcpStream, dispatcher: Arc<Dispatcher>, log: Option<&Logger>) {
    let peer = socket
        .peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let mut conn = dispatcher.new_conn(&peer);
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
        .new(o!("peer" => peer, "conn_id" => conn.id));

    let config = dispatcher.config();
    let mut framed = Framed::new(socket, PersistCodec::new(config.server.max_msg_size));
    let read_timeout = config.message_timeout();
    let delay_commits = config.accounting.commit_delay;
    let mut flush = interval(config.commit_interval());
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut shutdown = dispatcher.shutdown_signal();

    debug!(log, "connection accepted");
    let mut deadline = Instant::now() + read_timeout;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            next = timeout_at(deadline, framed.next()) => next,
            _ = flush.tick(), if delay_commits => {
                if let Some(notice) = dispatcher.flush_delayed(&mut conn) {
                    tokio::spawn(update::push(notice, log.clone()));
                }
                continue;
            }
            _ = shutdown.changed() => break,
        };
        deadline = Instant::now() + read_timeout;
        let frame = match next {
            Err(_) => {
                warn!(log, "no message within timeout, closing");
                break;
            }
            Ok(None) => {
                debug!(log, "peer closed connection");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(log, "framing error, closing"; "err" => %e);
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let mut outcome = dispatcher.process(&mut conn, &frame);
        if let Some(reply) = outcome.reply.take() {
            if let Err(e) = framed.send(reply).await {
                warn!(log, "failed to send reply"; "err" => %e);
                break;
            }
        }
        let close = outcome.close;
        if let Some(notice) = dispatcher.after_send(&mut conn, outcome) {
            tokio::spawn(update::push(notice, log.clone()));
        }
        if close || conn.is_closed() {
            break;
        }
    }

    if let Some(notice) = dispatcher.disconnect(&mut conn) {
        tokio::spawn(update::push(notice, log.clone()));
    }
    debug!(log, "connection closed");
}

/// Accept connections on `listener` until shutdown is requested, then wait
/// for the open connections to wind down.
pub async fn run(listener: TcpListener, dispatcher: Arc<Dispatcher>, log: &Logger) {
    let mut shutdown = dispatcher.shutdown_signal();
    let mut tasks = JoinSet::new();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,
            _ = shutdown.changed() => break,
        };
        match accepted {
            Ok((stream, _)) => {
                let task_log = log.clone();
                let task_dispatcher = Arc::clone(&dispatcher);
                tasks.spawn(async move {
                    make_task(stream, task_dispatcher, Some(&task_log)).await;
                });
            }
            Err(e) => {
                warn!(log, "failed to accept connection"; "err" => %e);
            }
        }
    }
    info!(log, "no longer accepting connections"; "open" => tasks.len());
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            warn!(log, "connection task failed"; "err" => %e);
        }
    }
    debug!(log, "all connections closed");
}

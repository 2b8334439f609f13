// Copyright 2020 Joyent, Inc.

//! Accounting update push to registered controllers.
//!
//! After a commit that changed accounting objects, each registered
//! controller other than the writer is sent an `AccountingUpdate` over a
//! fresh connection to its registered address. Failures are logged and
//! otherwise ignored; a controller that misses an update picks the change
//! up on its next full read.

use std::io::{Error, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

use slog::{debug, warn, Logger};
use tokio::time::timeout;

use crate::client::PersistClient;
use crate::msg::{AccountingUpdateMsg, MsgBody, PersistInitMsg, ReturnCodeMsg};
use crate::rc::SLURM_SUCCESS;
use crate::registry::ConnHandle;

/// Limit on one controller's whole exchange: connect, update and fini.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Who to tell and what to say.
#[derive(Debug)]
pub struct UpdateNotice {
    pub msg: AccountingUpdateMsg,
    /// Template for the init sent to each controller.
    pub init: PersistInitMsg,
    pub targets: Vec<Arc<ConnHandle>>,
}

async fn push_one(
    address: &str,
    target: &ConnHandle,
    notice: &UpdateNotice,
) -> Result<ReturnCodeMsg, Error> {
    let mut init = notice.init.clone();
    init.version = target.version();
    init.cluster_name = target.cluster_name().map(|c| c.to_string());

    let (mut client, rc) = PersistClient::connect(address, init).await?;
    if rc.rc != SLURM_SUCCESS {
        return Ok(rc);
    }
    let mut msg = notice.msg.clone();
    msg.rpc_version = client.version();
    let reply = client.call_rc(&MsgBody::AccountingUpdate(msg)).await?;
    // The controller may drop the connection without answering the fini.
    let _ = client.fini(false).await;
    Ok(reply)
}

async fn push_bounded(
    address: &str,
    target: &ConnHandle,
    notice: &UpdateNotice,
    limit: Duration,
) -> Result<ReturnCodeMsg, Error> {
    timeout(limit, push_one(address, target, notice))
        .await
        .map_err(|_| Error::new(ErrorKind::TimedOut, "controller did not answer in time"))?
}

/// Deliver `notice` to every target in turn.
pub async fn push(notice: UpdateNotice, log: Logger) {
    push_within(notice, log, PUSH_TIMEOUT).await
}

/// `push` with an explicit per-controller time limit.
pub async fn push_within(notice: UpdateNotice, log: Logger, limit: Duration) {
    for target in &notice.targets {
        let address = match target.address() {
            Some(address) => address,
            None => continue,
        };
        let cluster = target.cluster_name().unwrap_or("");
        match push_bounded(&address, target, &notice, limit).await {
            Ok(rc) if rc.rc == SLURM_SUCCESS => {
                debug!(log, "pushed accounting update";
                    "cluster" => cluster,
                    "address" => &address,
                    "kinds" => notice.msg.kinds.join(","));
            }
            Ok(rc) => {
                warn!(log, "controller refused accounting update";
                    "cluster" => cluster,
                    "address" => &address,
                    "rc" => rc.rc,
                    "comment" => rc.comment.unwrap_or_default());
            }
            Err(e) => {
                warn!(log, "unable to push accounting update";
                    "cluster" => cluster,
                    "address" => &address,
                    "err" => %e);
            }
        }
    }
}

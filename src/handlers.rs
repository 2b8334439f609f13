// Copyright 2020 Joyent, Inc.

//! Message handlers.
//!
//! `route` is the static table the dispatcher consults before running a
//! handler: the privilege class a caller needs, whether the handler writes
//! to the store, and whether it reports cluster state. `run` invokes the
//! handler for a decoded body and returns the reply body.

use slog::{debug, info, warn};

use crate::dispatch::{error_body, error_reply, rc_body, reply_rc, success_body, Ctx};
use crate::msg::{
    FiniMsg, IdRcMsg, JobStartMsg, ListMsg, MsgBody, MsgType, MultMsg, RegisterCtldMsg,
};
use crate::privilege::PrivClass;
use crate::protocol::{decode_body, encode_body};
use crate::rc::{EINVAL, SLURM_ERROR, SLURM_SUCCESS};
use crate::storage::{StorageError, StorageResult, StorageSession, UsageKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub class: PrivClass,
    /// Changes the store. Controller writes are committed after the reply.
    pub write: bool,
    /// Reports cluster state. May register the controller from its stored
    /// address.
    pub cluster_update: bool,
}

impl Route {
    const fn new(class: PrivClass, write: bool, cluster_update: bool) -> Route {
        Route {
            class,
            write,
            cluster_update,
        }
    }
}

/// How the dispatcher treats `msg_type`, or `None` when nothing handles it.
pub fn route(msg_type: MsgType) -> Option<Route> {
    use MsgType::*;
    use PrivClass::*;

    let route = match msg_type {
        AddAccounts | AddAccountCoords | AddAssocs | AddClusters | AddFederations | AddQos
        | AddResources | AddTres | AddUsers | AddWckeys | ModifyAccounts | ModifyAssocs
        | ModifyClusters | ModifyFederations | ModifyJob | ModifyQos | ModifyResources
        | ModifyUsers | ModifyWckeys | RemoveAccounts | RemoveAccountCoords | RemoveAssocs
        | RemoveClusters | RemoveFederations | RemoveQos | RemoveResources | RemoveUsers
        | RemoveWckeys => Route::new(Open, true, false),

        GetAccounts | GetAssocs | GetClusters | GetFederations | GetQos | GetResources
        | GetResvs | GetTres | GetUsers | GetJobsCond | GetEvents | GetTxn | GetProblems
        | GetAssocUsage | GetClusterUsage | GetWckeyUsage | GetConfig | Fini => {
            Route::new(Open, false, false)
        }

        GetWckeys => Route::new(Operator, false, false),
        RollUsage => Route::new(Operator, true, false),

        NodeState | JobStart | JobComplete | JobSuspend | StepStart | StepComplete
        | TaskCheckpointComplete | ClusterTres | FlushJobs | SendMultJobStart => {
            Route::new(SlurmUser, true, true)
        }
        AddReservation | ModifyReservation | RemoveReservation | SendMultMsg
        | RegisterCtld => Route::new(SlurmUser, true, false),

        ArchiveDump | ArchiveLoad => Route::new(Super, true, false),
        Reconfig | GetStats | ClearStats | Shutdown => Route::new(Super, false, false),

        _ => return None,
    };
    Some(route)
}

fn with_session<T, F>(ctx: &mut Ctx<'_>, f: F) -> StorageResult<T>
where
    F: FnOnce(&mut dyn StorageSession, u32) -> StorageResult<T>,
{
    let uid = ctx.uid;
    match ctx.conn.session.as_mut() {
        Some(session) => f(&mut **session, uid),
        None => Err(StorageError::db_connection()),
    }
}

/// Run a write that replies with a bare return code. `kind` names the
/// accounting objects it changes, if controllers should hear about them.
fn write<F>(ctx: &mut Ctx<'_>, kind: Option<&'static str>, f: F) -> MsgBody
where
    F: FnOnce(&mut dyn StorageSession, u32) -> StorageResult<()>,
{
    match with_session(ctx, f) {
        Ok(()) => {
            if let Some(kind) = kind {
                ctx.conn.changed.insert(kind);
            }
            success_body()
        }
        Err(e) => error_body(&e),
    }
}

/// Run a modify or remove and reply with the affected names.
fn names<F>(ctx: &mut Ctx<'_>, kind: Option<&'static str>, f: F) -> MsgBody
where
    F: FnOnce(&mut dyn StorageSession, u32) -> StorageResult<Vec<String>>,
{
    match with_session(ctx, f) {
        Ok(list) => {
            if let Some(kind) = kind {
                ctx.conn.changed.insert(kind);
            }
            MsgBody::ResponseList(ListMsg::new(list))
        }
        Err(e) => error_body(&e),
    }
}

fn get<T, F, W>(ctx: &mut Ctx<'_>, f: F, wrap: W) -> MsgBody
where
    F: FnOnce(&mut dyn StorageSession, u32) -> StorageResult<Vec<T>>,
    W: FnOnce(ListMsg<T>) -> MsgBody,
{
    match with_session(ctx, f) {
        Ok(list) => wrap(ListMsg::new(list)),
        Err(e) => error_body(&e),
    }
}

/// Run a job or step write. Controllers replay these after reconnecting,
/// so a row that is already stored counts as success.
fn replayable<F>(ctx: &mut Ctx<'_>, what: &'static str, f: F) -> MsgBody
where
    F: FnOnce(&mut dyn StorageSession) -> StorageResult<()>,
{
    match with_session(ctx, |session, _| f(session)) {
        Ok(()) => success_body(),
        Err(e) if e.is_already_present() => {
            debug!(ctx.log(), "replayed record already stored";
                "conn_id" => ctx.conn.id,
                "record" => what);
            success_body()
        }
        Err(e) => error_body(&e),
    }
}

fn job_start(ctx: &mut Ctx<'_>, msg: &JobStartMsg) -> IdRcMsg {
    let result = with_session(ctx, |session, _| session.job_start(msg));
    let (db_index, rc) = match result {
        Ok(db_index) => (db_index, SLURM_SUCCESS),
        Err(e) if e.is_already_present() => (msg.db_index, SLURM_SUCCESS),
        Err(e) => {
            warn!(ctx.log(), "job start failed";
                "conn_id" => ctx.conn.id,
                "job_id" => msg.job_id,
                "err" => %e);
            (0, error_reply(&e).rc)
        }
    };
    IdRcMsg {
        job_id: msg.job_id,
        db_index,
        rc,
    }
}

fn fini(ctx: &mut Ctx<'_>, msg: &FiniMsg) -> MsgBody {
    let dispatcher = ctx.dispatcher;
    // A plain close discards uncommitted writes.
    if msg.close_conn && !msg.commit {
        ctx.conn.delayed = false;
        ctx.close = true;
        return success_body();
    }
    let reply = match dispatcher.commit(ctx.conn, msg.commit) {
        Ok(notice) => {
            ctx.notice = notice;
            success_body()
        }
        Err(e) => error_body(&e),
    };
    ctx.close = msg.close_conn;
    reply
}

fn register_ctld(ctx: &mut Ctx<'_>, msg: &RegisterCtldMsg) -> MsgBody {
    if ctx.conn.cluster_name().is_none() {
        return rc_body(SLURM_ERROR, "Registering a controller needs a cluster name");
    }
    let host = ctx.conn.peer_host.clone();
    if let Err(e) = with_session(ctx, |session, _| session.register_ctld(&host, msg.port)) {
        return error_body(&e);
    }
    ctx.conn.set_peer_port(msg.port);
    if let Some(handle) = ctx.conn.handle.clone() {
        if ctx.dispatcher.registry().add(&handle) {
            info!(ctx.log(), "controller registered";
                "conn_id" => ctx.conn.id,
                "cluster" => handle.cluster_name().unwrap_or(""),
                "address" => handle.address().unwrap_or_default());
        }
    }
    success_body()
}

/// Each inner message is dispatched as if it had arrived on its own. The
/// first failure ends the batch.
fn mult_msg(ctx: &mut Ctx<'_>, msg: &MultMsg) -> MsgBody {
    let dispatcher = ctx.dispatcher;
    let version = ctx.conn.version;
    let mut replies = Vec::with_capacity(msg.inner.len());
    for raw in &msg.inner {
        let reply = match decode_body(raw, version) {
            Ok(inner) => match inner.msg_type() {
                MsgType::SendMultMsg | MsgType::Fini => {
                    rc_body(EINVAL, "Invalid RPC inside a multi-message")
                }
                _ => dispatcher.dispatch(ctx, inner.body).0,
            },
            Err(e) => {
                warn!(ctx.log(), "bad message inside multi-message";
                    "conn_id" => ctx.conn.id,
                    "err" => %e);
                rc_body(SLURM_ERROR, &e.to_string())
            }
        };
        let rc = reply_rc(&reply);
        replies.push(encode_body(&reply, version));
        if rc != SLURM_SUCCESS {
            break;
        }
    }
    MsgBody::ResponseMultMsg(MultMsg { inner: replies })
}

/// Run the handler for `body`.
pub fn run(ctx: &mut Ctx<'_>, body: MsgBody) -> MsgBody {
    let dispatcher = ctx.dispatcher;
    match body {
        MsgBody::Fini(m) => fini(ctx, &m),

        MsgBody::AddAccounts(m) => write(ctx, Some("account"), |s, uid| s.add_accounts(uid, &m.list)),
        MsgBody::AddAccountCoords(m) => {
            write(ctx, Some("user"), |s, uid| s.add_account_coords(uid, &m))
        }
        MsgBody::AddAssocs(m) => write(ctx, Some("association"), |s, uid| s.add_assocs(uid, &m.list)),
        MsgBody::AddClusters(m) => write(ctx, Some("cluster"), |s, uid| s.add_clusters(uid, &m.list)),
        MsgBody::AddFederations(m) => {
            write(ctx, Some("federation"), |s, uid| s.add_federations(uid, &m.list))
        }
        MsgBody::AddQos(m) => write(ctx, Some("qos"), |s, uid| s.add_qos(uid, &m.list)),
        MsgBody::AddResources(m) => {
            write(ctx, Some("resource"), |s, uid| s.add_resources(uid, &m.list))
        }
        MsgBody::AddTres(m) => write(ctx, Some("tres"), |s, uid| s.add_tres(uid, &m.list)),
        MsgBody::AddUsers(m) => write(ctx, Some("user"), |s, uid| s.add_users(uid, &m.list)),
        MsgBody::AddWckeys(m) => write(ctx, Some("wckey"), |s, uid| s.add_wckeys(uid, &m.list)),
        MsgBody::AddReservation(m) => write(ctx, None, |s, _| s.add_reservation(&m)),
        MsgBody::ModifyReservation(m) => write(ctx, None, |s, _| s.modify_reservation(&m)),
        MsgBody::RemoveReservation(m) => write(ctx, None, |s, _| s.remove_reservation(&m)),

        MsgBody::GetAccounts(c) => get(ctx, |s, uid| s.get_accounts(uid, &c), MsgBody::ResponseAccounts),
        MsgBody::GetAssocs(c) => get(ctx, |s, uid| s.get_assocs(uid, &c), MsgBody::ResponseAssocs),
        MsgBody::GetClusters(c) => get(ctx, |s, uid| s.get_clusters(uid, &c), MsgBody::ResponseClusters),
        MsgBody::GetFederations(c) => get(
            ctx,
            |s, uid| s.get_federations(uid, &c),
            MsgBody::ResponseFederations,
        ),
        MsgBody::GetQos(c) => get(ctx, |s, uid| s.get_qos(uid, &c), MsgBody::ResponseQos),
        MsgBody::GetResources(c) => get(
            ctx,
            |s, uid| s.get_resources(uid, &c),
            MsgBody::ResponseResources,
        ),
        MsgBody::GetResvs(c) => get(ctx, |s, uid| s.get_reservations(uid, &c), MsgBody::ResponseResvs),
        MsgBody::GetTres(c) => get(ctx, |s, uid| s.get_tres(uid, &c), MsgBody::ResponseTres),
        MsgBody::GetUsers(c) => get(ctx, |s, uid| s.get_users(uid, &c), MsgBody::ResponseUsers),
        MsgBody::GetWckeys(c) => get(ctx, |s, uid| s.get_wckeys(uid, &c), MsgBody::ResponseWckeys),
        MsgBody::GetJobsCond(c) => get(ctx, |s, uid| s.get_jobs(uid, &c), MsgBody::ResponseJobs),
        MsgBody::GetEvents(c) => get(ctx, |s, uid| s.get_events(uid, &c), MsgBody::ResponseEvents),
        MsgBody::GetTxn(c) => get(ctx, |s, uid| s.get_txn(uid, &c), MsgBody::ResponseTxn),
        MsgBody::GetProblems(c) => get(ctx, |s, uid| s.get_problems(uid, &c), MsgBody::ResponseProblems),
        MsgBody::GetAssocUsage(m) => get(
            ctx,
            |s, uid| s.get_usage(uid, UsageKind::Assoc, &m),
            MsgBody::ResponseUsage,
        ),
        MsgBody::GetClusterUsage(m) => get(
            ctx,
            |s, uid| s.get_usage(uid, UsageKind::Cluster, &m),
            MsgBody::ResponseUsage,
        ),
        MsgBody::GetWckeyUsage(m) => get(
            ctx,
            |s, uid| s.get_usage(uid, UsageKind::Wckey, &m),
            MsgBody::ResponseUsage,
        ),

        MsgBody::ModifyAccounts(m) => names(ctx, Some("account"), |s, uid| s.modify_accounts(uid, &m)),
        MsgBody::ModifyAssocs(m) => names(ctx, Some("association"), |s, uid| s.modify_assocs(uid, &m)),
        MsgBody::ModifyClusters(m) => names(ctx, Some("cluster"), |s, uid| s.modify_clusters(uid, &m)),
        MsgBody::ModifyFederations(m) => {
            names(ctx, Some("federation"), |s, uid| s.modify_federations(uid, &m))
        }
        MsgBody::ModifyQos(m) => names(ctx, Some("qos"), |s, uid| s.modify_qos(uid, &m)),
        MsgBody::ModifyResources(m) => {
            names(ctx, Some("resource"), |s, uid| s.modify_resources(uid, &m))
        }
        MsgBody::ModifyUsers(m) => names(ctx, Some("user"), |s, uid| s.modify_users(uid, &m)),
        MsgBody::ModifyWckeys(m) => names(ctx, Some("wckey"), |s, uid| s.modify_wckeys(uid, &m)),
        MsgBody::ModifyJob(m) => names(ctx, None, |s, uid| s.modify_job(uid, &m)),

        MsgBody::RemoveAccounts(c) => names(ctx, Some("account"), |s, uid| s.remove_accounts(uid, &c)),
        MsgBody::RemoveAccountCoords(m) => {
            names(ctx, Some("user"), |s, uid| s.remove_account_coords(uid, &m))
        }
        MsgBody::RemoveAssocs(c) => names(ctx, Some("association"), |s, uid| s.remove_assocs(uid, &c)),
        MsgBody::RemoveClusters(c) => names(ctx, Some("cluster"), |s, uid| s.remove_clusters(uid, &c)),
        MsgBody::RemoveFederations(c) => {
            names(ctx, Some("federation"), |s, uid| s.remove_federations(uid, &c))
        }
        MsgBody::RemoveQos(c) => names(ctx, Some("qos"), |s, uid| s.remove_qos(uid, &c)),
        MsgBody::RemoveResources(c) => {
            names(ctx, Some("resource"), |s, uid| s.remove_resources(uid, &c))
        }
        MsgBody::RemoveUsers(c) => names(ctx, Some("user"), |s, uid| s.remove_users(uid, &c)),
        MsgBody::RemoveWckeys(c) => names(ctx, Some("wckey"), |s, uid| s.remove_wckeys(uid, &c)),

        MsgBody::JobStart(m) => MsgBody::IdRc(job_start(ctx, &m)),
        MsgBody::JobComplete(m) => replayable(ctx, "job complete", |s| s.job_complete(&m)),
        MsgBody::JobSuspend(m) => replayable(ctx, "job suspend", |s| s.job_suspend(&m)),
        MsgBody::StepStart(m) => replayable(ctx, "step start", |s| s.step_start(&m)),
        MsgBody::StepComplete(m) => replayable(ctx, "step complete", |s| s.step_complete(&m)),
        MsgBody::TaskCheckpointComplete(m) => {
            write(ctx, None, |s, _| s.task_checkpoint_complete(&m))
        }
        MsgBody::NodeState(m) => write(ctx, None, |s, _| s.node_state(&m)),
        MsgBody::ClusterTres(m) => {
            let reply = write(ctx, None, |s, _| s.cluster_tres(&m));
            if reply_rc(&reply) == SLURM_SUCCESS {
                if let Some(handle) = &ctx.conn.handle {
                    handle.set_tres_str(m.tres_str.as_deref());
                }
            }
            reply
        }
        MsgBody::FlushJobs(m) => write(ctx, None, |s, _| s.flush_jobs(m.event_time)),
        MsgBody::SendMultJobStart(m) => {
            let list: Vec<IdRcMsg> = m.list.iter().map(|job| job_start(ctx, job)).collect();
            MsgBody::ResponseMultJobStart(ListMsg::new(list))
        }
        MsgBody::SendMultMsg(m) => mult_msg(ctx, &m),
        MsgBody::RegisterCtld(m) => register_ctld(ctx, &m),

        MsgBody::RollUsage(m) => match with_session(ctx, |s, uid| s.roll_usage(uid, &m)) {
            Ok(timers) => {
                dispatcher.stats().record_rollup(&timers);
                success_body()
            }
            Err(e) => error_body(&e),
        },
        MsgBody::ArchiveDump(m) => write(ctx, None, |s, uid| s.archive_dump(uid, &m)),
        MsgBody::ArchiveLoad(m) => write(ctx, None, |s, uid| s.archive_load(uid, &m)),

        MsgBody::Reconfig(_) => match dispatcher.storage().reconfig() {
            Ok(()) => {
                info!(ctx.log(), "reconfigured"; "uid" => ctx.uid);
                success_body()
            }
            Err(e) => error_body(&e),
        },
        MsgBody::GetStats(_) => MsgBody::ResponseStats(dispatcher.stats().snapshot()),
        MsgBody::ClearStats(_) => {
            info!(ctx.log(), "statistics cleared"; "uid" => ctx.uid);
            dispatcher.stats().reset();
            success_body()
        }
        MsgBody::Shutdown(_) => {
            info!(ctx.log(), "shutdown requested"; "uid" => ctx.uid);
            dispatcher.shutdown();
            success_body()
        }
        MsgBody::GetConfig(_) => {
            MsgBody::ResponseConfig(ListMsg::new(dispatcher.config().to_key_values()))
        }

        other => rc_body(
            EINVAL,
            &format!("Invalid RPC {}", other.msg_type().as_str()),
        ),
    }
}

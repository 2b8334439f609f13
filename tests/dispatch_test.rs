// Copyright 2020 Joyent, Inc.

use std::sync::Arc;

use bytes::Bytes;

use slurmdbd_rpc::auth::{Authenticator, TokenAuth, TrustedAuth};
use slurmdbd_rpc::config::DbdConfig;
use slurmdbd_rpc::dispatch::Dispatcher;
use slurmdbd_rpc::msg::{
    ClusterTresMsg, EmptyMsg, FiniMsg, IdRcMsg, JobCompleteMsg, JobStartMsg, LegacyInitMsg,
    ListMsg, MsgBody, MultMsg, PersistInitMsg, RegisterCtldMsg, ReturnCodeMsg, RollUsageMsg,
};
use slurmdbd_rpc::persist_conn::PersistConn;
use slurmdbd_rpc::privilege::AdminLevel;
use slurmdbd_rpc::protocol::{
    decode_body, decode_message, encode_body, encode_message, Frame, PERSIST_FLAG_DBD,
    PERSIST_FLAG_DROP_PRIV, PROTOCOL_VERSION_CURRENT, PROTOCOL_VERSION_MIN,
    PROTOCOL_VERSION_PREV,
};
use slurmdbd_rpc::rc::{
    EEXIST, EINVAL, ESLURM_ACCESS_DENIED, ESLURM_BAD_NAME, SLURM_ERROR,
    SLURM_PROTOCOL_VERSION_ERROR, SLURM_SUCCESS,
};
use slurmdbd_rpc::records::{AccountRec, ObjectCond, UserRec};
use slurmdbd_rpc::storage::memory::{MemStorage, JOB_COMPLETE, JOB_RUNNING};
use slurmdbd_rpc::update::UpdateNotice;

const SLURM_USER: u32 = 500;
const PLAIN_USER: u32 = 1000;
const OPERATOR: u32 = 1001;

struct Harness {
    dispatcher: Dispatcher,
    storage: MemStorage,
}

struct Reply {
    frame: Option<Frame>,
    body: Option<MsgBody>,
    close: bool,
    notice: Option<UpdateNotice>,
}

impl Reply {
    fn rc(&self) -> ReturnCodeMsg {
        match &self.body {
            Some(MsgBody::PersistRc(rc)) => rc.clone(),
            other => panic!("expected a return code, got {:?}", other),
        }
    }
}

fn harness_with(config: DbdConfig, auth: Arc<dyn Authenticator>) -> Harness {
    let storage = MemStorage::new(config.accounting.slurm_user_id);
    storage.seed_users(vec![
        UserRec::new("plain", PLAIN_USER, AdminLevel::None),
        UserRec::new("oper", OPERATOR, AdminLevel::Operator),
    ]);
    let dispatcher = Dispatcher::new(config, Arc::new(storage.clone()), auth, None);
    Harness {
        dispatcher,
        storage,
    }
}

fn harness() -> Harness {
    let mut config = DbdConfig::default();
    config.accounting.slurm_user_id = SLURM_USER;
    harness_with(config, Arc::new(TrustedAuth))
}

fn init_msg(uid: u32, cluster: Option<&str>, flags: u16) -> MsgBody {
    MsgBody::PersistInit(PersistInitMsg {
        version: PROTOCOL_VERSION_CURRENT,
        flags: PERSIST_FLAG_DBD | flags,
        uid,
        cluster_name: cluster.map(|c| c.to_string()),
        gid: uid,
        auth_token: None,
    })
}

fn account(name: &str) -> AccountRec {
    AccountRec {
        name: name.to_string(),
        ..Default::default()
    }
}

fn job_start(job_id: u32, db_index: u64) -> JobStartMsg {
    JobStartMsg {
        job_id,
        db_index,
        account: Some("physics".to_string()),
        submit_time: 1_600_000_000,
        start_time: 1_600_000_100,
        state: JOB_RUNNING,
        ..Default::default()
    }
}

impl Harness {
    fn send_frame(&self, conn: &mut PersistConn, frame: &Frame) -> Reply {
        let mut outcome = self.dispatcher.process(conn, frame);
        let frame = outcome.reply.take();
        let body = frame
            .as_ref()
            .map(|f| decode_message(f, f.version).unwrap().body);
        let close = outcome.close;
        let notice = self.dispatcher.after_send(conn, outcome);
        Reply {
            frame,
            body,
            close,
            notice,
        }
    }

    fn send(&self, conn: &mut PersistConn, body: MsgBody) -> Reply {
        let frame = encode_message(&body, conn.version);
        self.send_frame(conn, &frame)
    }

    fn connect(&self, uid: u32, cluster: Option<&str>) -> PersistConn {
        self.connect_with_flags(uid, cluster, 0)
    }

    fn connect_with_flags(&self, uid: u32, cluster: Option<&str>, flags: u16) -> PersistConn {
        let mut conn = self.dispatcher.new_conn("ctl.example.com");
        let reply = self.send(&mut conn, init_msg(uid, cluster, flags));
        assert_eq!(reply.rc().rc, SLURM_SUCCESS);
        assert!(conn.is_initialized());
        conn
    }

    /// A controller connection that has registered `port`.
    fn controller(&self, cluster: &str, port: u16) -> PersistConn {
        let mut conn = self.connect(SLURM_USER, Some(cluster));
        let reply = self.send(&mut conn, MsgBody::RegisterCtld(RegisterCtldMsg { port, flags: 0 }));
        assert_eq!(reply.rc().rc, SLURM_SUCCESS);
        conn
    }

    fn accounts(&self) -> Vec<AccountRec> {
        let mut conn = self.connect(0, None);
        match self
            .send(&mut conn, MsgBody::GetAccounts(ObjectCond::default()))
            .body
        {
            Some(MsgBody::ResponseAccounts(list)) => list.list,
            other => panic!("unexpected reply {:?}", other),
        }
    }
}

#[test]
fn init_then_query() {
    let h = harness();
    let mut conn = h.dispatcher.new_conn("client");
    let reply = h.send(&mut conn, init_msg(0, None, 0));
    assert_eq!(reply.rc().rc, SLURM_SUCCESS);
    assert_eq!(reply.frame.unwrap().version, PROTOCOL_VERSION_CURRENT);
    assert!(!reply.close);

    let reply = h.send(&mut conn, MsgBody::GetAccounts(ObjectCond::default()));
    assert_eq!(
        reply.body,
        Some(MsgBody::ResponseAccounts(ListMsg::new(vec![])))
    );
}

#[test]
fn older_caller_gets_its_own_version() {
    let h = harness();
    let mut conn = h.dispatcher.new_conn("client");
    let mut init = init_msg(0, None, 0);
    if let MsgBody::PersistInit(msg) = &mut init {
        msg.version = PROTOCOL_VERSION_PREV;
    }
    let frame = encode_message(&init, PROTOCOL_VERSION_PREV);
    let reply = h.send_frame(&mut conn, &frame);
    assert_eq!(reply.rc().rc, SLURM_SUCCESS);
    assert_eq!(reply.frame.unwrap().version, PROTOCOL_VERSION_PREV);
    assert_eq!(conn.version, PROTOCOL_VERSION_PREV);
}

#[test]
fn too_old_caller_is_refused() {
    let h = harness();
    let mut conn = h.dispatcher.new_conn("client");
    let mut init = init_msg(0, None, 0);
    if let MsgBody::PersistInit(msg) = &mut init {
        msg.version = PROTOCOL_VERSION_MIN - 1;
    }
    let reply = h.send(&mut conn, init);
    assert_eq!(reply.rc().rc, SLURM_PROTOCOL_VERSION_ERROR);
    assert!(reply.close);
    assert!(conn.is_closed());
}

#[test]
fn message_before_init_is_refused() {
    let h = harness();
    let mut conn = h.dispatcher.new_conn("client");
    let reply = h.send(&mut conn, MsgBody::GetAccounts(ObjectCond::default()));
    assert_eq!(reply.rc().rc, SLURM_PROTOCOL_VERSION_ERROR);
    assert!(reply.close);
    assert!(h.storage.jobs().is_empty());
}

#[test]
fn legacy_init_is_refused() {
    let h = harness();
    let mut conn = h.dispatcher.new_conn("client");
    let reply = h.send(
        &mut conn,
        MsgBody::Init(LegacyInitMsg {
            version: PROTOCOL_VERSION_CURRENT,
            uid: 0,
            cluster_name: None,
        }),
    );
    assert_eq!(reply.rc().rc, SLURM_PROTOCOL_VERSION_ERROR);
    assert!(reply.close);
}

#[test]
fn second_init_is_rejected_but_connection_stays() {
    let h = harness();
    let mut conn = h.connect(0, None);
    let reply = h.send(&mut conn, init_msg(0, None, 0));
    assert_eq!(reply.rc().rc, EEXIST);
    assert!(!reply.close);
    assert!(conn.is_initialized());
}

#[test]
fn failed_authentication_closes_silently() {
    let h = harness_with(DbdConfig::default(), Arc::new(TokenAuth::new("secret")));
    let mut conn = h.dispatcher.new_conn("client");
    let mut init = init_msg(0, None, 0);
    if let MsgBody::PersistInit(msg) = &mut init {
        msg.auth_token = Some("guess".to_string());
    }
    let reply = h.send(&mut conn, init);
    assert!(reply.frame.is_none());
    assert!(reply.close);
    assert!(!conn.is_initialized());
}

#[test]
fn unknown_type_closes_silently() {
    let h = harness();
    let mut conn = h.connect(0, None);
    let frame = Frame {
        version: PROTOCOL_VERSION_CURRENT,
        body: Bytes::from_static(&[0xff, 0xff, 0, 0]),
    };
    let reply = h.send_frame(&mut conn, &frame);
    assert!(reply.frame.is_none());
    assert!(reply.close);
}

#[test]
fn malformed_payload_gets_an_error_reply() {
    let h = harness();
    let mut conn = h.connect(0, None);
    let mut body = encode_body(
        &MsgBody::GetAccounts(ObjectCond::default()),
        PROTOCOL_VERSION_CURRENT,
    );
    body.truncate(3);
    let frame = Frame {
        version: PROTOCOL_VERSION_CURRENT,
        body: Bytes::from(body),
    };
    let reply = h.send_frame(&mut conn, &frame);
    assert_eq!(reply.rc().rc, SLURM_ERROR);
    assert!(!reply.close);
}

#[test]
fn reply_types_have_no_handler() {
    let h = harness();
    let mut conn = h.connect(0, None);
    let reply = h.send(
        &mut conn,
        MsgBody::PersistRc(ReturnCodeMsg::new(SLURM_SUCCESS, None)),
    );
    let rc = reply.rc();
    assert_eq!(rc.rc, EINVAL);
    assert_eq!(rc.comment.as_deref(), Some("Invalid RPC"));
    assert!(!reply.close);
}

#[test]
fn plain_user_cannot_start_jobs() {
    let h = harness();
    let mut conn = h.connect(PLAIN_USER, Some("c1"));
    let reply = h.send(&mut conn, MsgBody::JobStart(job_start(7, 0)));
    let rc = reply.rc();
    assert_eq!(rc.rc, ESLURM_ACCESS_DENIED);
    assert!(rc.comment.unwrap().contains("SlurmUser"));
    assert!(h.storage.jobs().is_empty());
}

#[test]
fn operator_classes() {
    let h = harness();
    let mut conn = h.connect(OPERATOR, None);
    let reply = h.send(&mut conn, MsgBody::GetWckeys(ObjectCond::default()));
    assert_eq!(
        reply.body,
        Some(MsgBody::ResponseWckeys(ListMsg::new(vec![])))
    );
    let reply = h.send(&mut conn, MsgBody::GetStats(EmptyMsg));
    assert_eq!(reply.rc().rc, ESLURM_ACCESS_DENIED);

    let mut plain = h.connect(PLAIN_USER, None);
    let reply = h.send(&mut plain, MsgBody::GetWckeys(ObjectCond::default()));
    assert_eq!(reply.rc().rc, ESLURM_ACCESS_DENIED);
}

#[cfg(feature = "drop-priv")]
#[test]
fn drop_priv_denies_every_class() {
    let h = harness();
    let mut conn = h.connect_with_flags(0, Some("c1"), PERSIST_FLAG_DROP_PRIV);
    for body in vec![
        MsgBody::JobStart(job_start(1, 0)),
        MsgBody::GetStats(EmptyMsg),
        MsgBody::RollUsage(RollUsageMsg::default()),
        MsgBody::GetWckeys(ObjectCond::default()),
        MsgBody::Shutdown(EmptyMsg),
    ] {
        let reply = h.send(&mut conn, body);
        assert_eq!(reply.rc().rc, ESLURM_ACCESS_DENIED);
    }
    assert!(!h.dispatcher.is_shutting_down());

    // Open handlers still run.
    let reply = h.send(&mut conn, MsgBody::GetAccounts(ObjectCond::default()));
    assert!(matches!(reply.body, Some(MsgBody::ResponseAccounts(_))));
}

#[test]
fn controller_writes_commit_after_reply() {
    let h = harness();
    let mut conn = h.controller("c1", 6817);
    assert_eq!(h.dispatcher.registry().len(), 1);
    assert_eq!(h.storage.commit_count(), 1);

    let reply = h.send(&mut conn, MsgBody::JobStart(job_start(7, 0)));
    let id = match reply.body {
        Some(MsgBody::IdRc(id)) => id,
        other => panic!("unexpected reply {:?}", other),
    };
    assert_eq!(id.rc, SLURM_SUCCESS);
    assert_ne!(id.db_index, 0);
    assert_eq!(h.storage.commit_count(), 2);

    let jobs = h.storage.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].cluster, "c1");
    assert_eq!(jobs[0].db_index, id.db_index);
}

#[test]
fn commit_delay_leaves_controller_writes_pending() {
    let h = delayed_harness();
    let mut conn = h.controller("c1", 6817);
    h.send(&mut conn, MsgBody::JobStart(job_start(7, 0)));
    assert_eq!(h.storage.commit_count(), 0);
    assert!(h.storage.jobs().is_empty());

    let reply = h.send(
        &mut conn,
        MsgBody::Fini(FiniMsg {
            close_conn: false,
            commit: true,
        }),
    );
    assert_eq!(reply.rc().rc, SLURM_SUCCESS);
    assert_eq!(h.storage.jobs().len(), 1);
}

fn delayed_harness() -> Harness {
    let mut config = DbdConfig::default();
    config.accounting.slurm_user_id = SLURM_USER;
    config.accounting.commit_delay = true;
    harness_with(config, Arc::new(TrustedAuth))
}

#[test]
fn controller_disconnect_commits_delayed_writes() {
    let h = delayed_harness();
    let mut conn = h.controller("c1", 6817);
    h.send(&mut conn, MsgBody::JobStart(job_start(7, 0)));
    h.send(&mut conn, MsgBody::JobStart(job_start(8, 0)));
    assert!(conn.delayed);
    assert!(h.storage.jobs().is_empty());

    // The controller goes away without a Fini.
    h.dispatcher.disconnect(&mut conn);
    assert_eq!(h.storage.jobs().len(), 2);
    assert_eq!(h.storage.commit_count(), 1);
    assert_eq!(h.storage.rollback_count(), 0);
}

#[test]
fn periodic_flush_commits_while_connected() {
    let h = delayed_harness();
    let mut conn = h.controller("c1", 6817);
    h.send(&mut conn, MsgBody::JobStart(job_start(7, 0)));

    h.dispatcher.flush_delayed(&mut conn);
    assert!(!conn.delayed);
    assert_eq!(h.storage.jobs().len(), 1);
    assert_eq!(h.storage.commit_count(), 1);

    // Nothing new to write.
    assert!(h.dispatcher.flush_delayed(&mut conn).is_none());
    assert_eq!(h.storage.commit_count(), 1);

    h.send(&mut conn, MsgBody::JobStart(job_start(8, 0)));
    h.dispatcher.flush_delayed(&mut conn);
    assert_eq!(h.storage.jobs().len(), 2);
    assert_eq!(h.storage.commit_count(), 2);
}

#[test]
fn client_disconnect_discards_pending_writes() {
    let h = delayed_harness();
    let mut conn = h.connect(0, None);
    h.send(
        &mut conn,
        MsgBody::AddAccounts(ListMsg::new(vec![account("physics")])),
    );
    assert!(!conn.delayed);
    h.dispatcher.disconnect(&mut conn);
    assert!(h.accounts().is_empty());
    assert_eq!(h.storage.commit_count(), 0);
}

#[test]
fn controller_jobs_keep_their_cluster_indexes() {
    let h = harness();
    let mut c1 = h.controller("c1", 6817);
    let mut c2 = h.controller("c2", 6818);
    let first = match h.send(&mut c1, MsgBody::JobStart(job_start(10, 0))).body {
        Some(MsgBody::IdRc(id)) => id.db_index,
        other => panic!("unexpected reply {:?}", other),
    };

    for (job_id, db_index) in &[(20, first), (21, 0)] {
        match h.send(&mut c2, MsgBody::JobStart(job_start(*job_id, *db_index))).body {
            Some(MsgBody::IdRc(id)) => assert_ne!(id.db_index, first),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    let jobs = h.storage.jobs();
    assert_eq!(jobs.len(), 3);
    let kept = jobs.iter().find(|j| j.db_index == first).unwrap();
    assert_eq!((kept.cluster.as_str(), kept.job_id), ("c1", 10));
}

#[test]
fn replayed_job_records_succeed() {
    let h = harness();
    let mut conn = h.controller("c1", 6817);
    let first = match h.send(&mut conn, MsgBody::JobStart(job_start(7, 0))).body {
        Some(MsgBody::IdRc(id)) => id,
        other => panic!("unexpected reply {:?}", other),
    };

    let replay = h.send(&mut conn, MsgBody::JobStart(job_start(7, first.db_index)));
    assert_eq!(
        replay.body,
        Some(MsgBody::IdRc(IdRcMsg {
            job_id: 7,
            db_index: first.db_index,
            rc: SLURM_SUCCESS,
        }))
    );

    let complete = JobCompleteMsg {
        job_id: 7,
        db_index: first.db_index,
        submit_time: 1_600_000_000,
        end_time: 1_600_000_500,
        state: JOB_COMPLETE,
        exit_code: 0,
    };
    for _ in 0..2 {
        let reply = h.send(&mut conn, MsgBody::JobComplete(complete.clone()));
        assert_eq!(reply.rc().rc, SLURM_SUCCESS);
    }

    let jobs = h.storage.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].end_time, 1_600_000_500);
}

#[test]
fn client_writes_wait_for_fini() {
    let h = harness();
    let mut conn = h.connect(0, None);
    let reply = h.send(
        &mut conn,
        MsgBody::AddAccounts(ListMsg::new(vec![account("physics")])),
    );
    assert_eq!(reply.rc().rc, SLURM_SUCCESS);
    assert!(h.accounts().is_empty());
    assert_eq!(h.storage.commit_count(), 0);

    let reply = h.send(
        &mut conn,
        MsgBody::Fini(FiniMsg {
            close_conn: false,
            commit: true,
        }),
    );
    assert_eq!(reply.rc().rc, SLURM_SUCCESS);
    assert!(!reply.close);
    assert_eq!(h.accounts().len(), 1);
    assert_eq!(h.storage.commit_count(), 1);
}

#[test]
fn fini_close_discards_pending_writes() {
    let h = harness();
    let mut conn = h.connect(0, None);
    h.send(
        &mut conn,
        MsgBody::AddAccounts(ListMsg::new(vec![account("physics")])),
    );
    let reply = h.send(
        &mut conn,
        MsgBody::Fini(FiniMsg {
            close_conn: true,
            commit: false,
        }),
    );
    assert_eq!(reply.rc().rc, SLURM_SUCCESS);
    assert!(reply.close);
    h.dispatcher.disconnect(&mut conn);
    assert!(h.accounts().is_empty());
}

#[test]
fn no_change_reads_as_success() {
    let h = harness();
    let mut conn = h.connect(0, None);
    let reply = h.send(&mut conn, MsgBody::RemoveAccounts(ObjectCond::names(&["nobody"])));
    let rc = reply.rc();
    assert_eq!(rc.rc, SLURM_SUCCESS);
    assert_eq!(rc.comment.as_deref(), Some("Request didn't affect anything"));
}

#[test]
fn multi_message_runs_each_part() {
    let h = harness();
    let mut conn = h.connect(0, None);
    let inner = vec![
        encode_body(&MsgBody::GetAccounts(ObjectCond::default()), conn.version),
        encode_body(&MsgBody::GetQos(ObjectCond::default()), conn.version),
    ];
    let reply = h.send(&mut conn, MsgBody::SendMultMsg(MultMsg { inner }));
    let parts = match reply.body {
        Some(MsgBody::ResponseMultMsg(m)) => m.inner,
        other => panic!("unexpected reply {:?}", other),
    };
    assert_eq!(parts.len(), 2);
    let first = decode_body(&parts[0], conn.version).unwrap();
    let second = decode_body(&parts[1], conn.version).unwrap();
    assert!(matches!(first.body, MsgBody::ResponseAccounts(_)));
    assert!(matches!(second.body, MsgBody::ResponseQos(_)));
}

#[test]
fn multi_message_stops_at_first_failure() {
    let h = harness();
    let mut conn = h.connect(0, None);
    let inner = vec![
        encode_body(
            &MsgBody::AddAccounts(ListMsg::new(vec![account("bad name")])),
            conn.version,
        ),
        encode_body(&MsgBody::GetQos(ObjectCond::default()), conn.version),
    ];
    let reply = h.send(&mut conn, MsgBody::SendMultMsg(MultMsg { inner }));
    let parts = match reply.body {
        Some(MsgBody::ResponseMultMsg(m)) => m.inner,
        other => panic!("unexpected reply {:?}", other),
    };
    assert_eq!(parts.len(), 1);
    match decode_body(&parts[0], conn.version).unwrap().body {
        MsgBody::PersistRc(rc) => assert_eq!(rc.rc, ESLURM_BAD_NAME),
        other => panic!("unexpected part {:?}", other),
    }
}

#[test]
fn stats_count_every_message() {
    let h = harness();
    let mut conn = h.connect(0, None);
    for _ in 0..3 {
        h.send(&mut conn, MsgBody::GetAccounts(ObjectCond::default()));
    }
    let stats = match h.send(&mut conn, MsgBody::GetStats(EmptyMsg)).body {
        Some(MsgBody::ResponseStats(stats)) => stats,
        other => panic!("unexpected reply {:?}", other),
    };
    // The init and three queries. The stats request is recorded after its
    // reply is built.
    assert_eq!(stats.type_count_sum(), 4);
    assert_eq!(stats.user_count_sum(), 4);

    let after = h.dispatcher.stats().snapshot();
    assert_eq!(after.type_count_sum(), 5);

    let reply = h.send(&mut conn, MsgBody::ClearStats(EmptyMsg));
    assert_eq!(reply.rc().rc, SLURM_SUCCESS);
    assert_eq!(h.dispatcher.stats().snapshot().type_count_sum(), 1);
}

#[test]
fn roll_usage_feeds_rollup_stats() {
    let h = harness();
    let mut conn = h.connect(OPERATOR, None);
    let reply = h.send(&mut conn, MsgBody::RollUsage(RollUsageMsg::default()));
    assert_eq!(reply.rc().rc, SLURM_SUCCESS);
    let stats = h.dispatcher.stats().snapshot();
    assert!(stats.rollups.iter().all(|r| r.count == 1));
}

#[test]
fn super_user_admin_messages() {
    let h = harness();
    let mut conn = h.connect(0, None);

    let reply = h.send(&mut conn, MsgBody::Reconfig(EmptyMsg));
    assert_eq!(reply.rc().rc, SLURM_SUCCESS);
    assert_eq!(h.storage.reconfig_count(), 1);

    let config = match h.send(&mut conn, MsgBody::GetConfig(EmptyMsg)).body {
        Some(MsgBody::ResponseConfig(list)) => list.list,
        other => panic!("unexpected reply {:?}", other),
    };
    assert!(config.iter().any(|kv| kv.key == "server.listen"));

    assert!(!h.dispatcher.is_shutting_down());
    let reply = h.send(&mut conn, MsgBody::Shutdown(EmptyMsg));
    assert_eq!(reply.rc().rc, SLURM_SUCCESS);
    assert!(h.dispatcher.is_shutting_down());
}

#[test]
fn controller_registers_from_stored_address() {
    let h = harness();
    let mut first = h.controller("c1", 6817);
    h.dispatcher.disconnect(&mut first);
    assert!(h.dispatcher.registry().is_empty());

    let mut conn = h.connect(SLURM_USER, Some("c1"));
    assert_eq!(conn.peer_port(), 0);
    let reply = h.send(
        &mut conn,
        MsgBody::ClusterTres(ClusterTresMsg {
            cluster_nodes: Some("n[1-4]".to_string()),
            event_time: 1_600_000_000,
            tres_str: Some("1=16".to_string()),
        }),
    );
    assert_eq!(reply.rc().rc, SLURM_SUCCESS);
    assert_eq!(conn.peer_port(), 6817);
    assert_eq!(h.dispatcher.registry().len(), 1);
    let handle = h.dispatcher.registry().find("c1").unwrap();
    assert_eq!(handle.tres_str(), Some("1=16".to_string()));
}

#[test]
fn registry_entry_leaves_with_connection() {
    let h = harness();
    let mut c1 = h.controller("c1", 6817);
    let _c2 = h.controller("c2", 6818);
    assert_eq!(h.dispatcher.registry().len(), 2);
    h.dispatcher.disconnect(&mut c1);
    assert_eq!(h.dispatcher.registry().len(), 1);
    assert!(h.dispatcher.registry().find("c1").is_none());
}

#[test]
fn committed_account_changes_notify_controllers() {
    let h = harness();
    let ctl = h.controller("c1", 6817);
    let mut conn = h.connect(0, None);
    h.send(
        &mut conn,
        MsgBody::AddAccounts(ListMsg::new(vec![account("physics")])),
    );
    let reply = h.send(
        &mut conn,
        MsgBody::Fini(FiniMsg {
            close_conn: false,
            commit: true,
        }),
    );
    let notice = reply.notice.expect("controllers should be notified");
    assert_eq!(notice.msg.kinds, vec!["account".to_string()]);
    assert_eq!(notice.targets.len(), 1);
    assert_eq!(notice.targets[0].id(), ctl.id);

    // Nothing changed since, so a second commit is quiet.
    let reply = h.send(
        &mut conn,
        MsgBody::Fini(FiniMsg {
            close_conn: false,
            commit: true,
        }),
    );
    assert!(reply.notice.is_none());
}

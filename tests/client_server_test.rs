// Copyright 2020 Joyent, Inc.

use std::error::Error as StdError;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use slog::{debug, info, o, Drain, Level, LevelFilter, Logger};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::block_on;
use tokio_util::codec::Framed;

use slurmdbd_rpc::auth::TrustedAuth;
use slurmdbd_rpc::client::PersistClient;
use slurmdbd_rpc::config::DbdConfig;
use slurmdbd_rpc::dispatch::Dispatcher;
use slurmdbd_rpc::msg::{
    AccountingUpdateMsg, EmptyMsg, JobStartMsg, ListMsg, MsgBody, PersistInitMsg,
    RegisterCtldMsg, ReturnCodeMsg,
};
use slurmdbd_rpc::protocol::{
    decode_message, encode_message, PersistCodec, PERSIST_FLAG_DBD, PROTOCOL_VERSION_CURRENT,
};
use slurmdbd_rpc::rc::SLURM_SUCCESS;
use slurmdbd_rpc::records::{AccountRec, ObjectCond};
use slurmdbd_rpc::server;
use slurmdbd_rpc::storage::memory::MemStorage;

const SERVER_ADDR: &str = "127.0.0.1:56819";
const CONTROLLER_PORT: u16 = 56820;

fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

#[tokio::main]
async fn run_server(barrier: Arc<Barrier>) {
    let root_log = test_log();
    let mut config = DbdConfig::default();
    config.server.listen = SERVER_ADDR.to_string();
    let dispatcher = Arc::new(Dispatcher::new(
        config,
        Arc::new(MemStorage::new(0)),
        Arc::new(TrustedAuth),
        Some(&root_log),
    ));

    let listener = TcpListener::bind(SERVER_ADDR)
        .await
        .expect("failed to bind");
    info!(root_log, "listening for accounting requests"; "address" => SERVER_ADDR);

    barrier.wait();
    server::run(listener, dispatcher, &root_log).await;
}

/// Stands in for a controller: accepts update pushes and forwards what
/// it receives.
async fn fake_controller(listener: TcpListener, updates: mpsc::UnboundedSender<AccountingUpdateMsg>) {
    let log = test_log();
    while let Ok((stream, _)) = listener.accept().await {
        let mut framed = Framed::new(stream, PersistCodec::default());
        while let Some(Ok(frame)) = framed.next().await {
            let msg = decode_message(&frame, frame.version).unwrap();
            debug!(log, "controller received"; "msg_type" => msg.msg_type().as_str());
            if let MsgBody::AccountingUpdate(update) = msg.body {
                let _ = updates.send(update);
            }
            let reply = MsgBody::PersistRc(ReturnCodeMsg::new(SLURM_SUCCESS, None));
            if framed
                .send(encode_message(&reply, frame.version))
                .await
                .is_err()
            {
                break;
            }
        }
    }
}

fn init(uid: u32, cluster: Option<&str>) -> PersistInitMsg {
    PersistInitMsg {
        version: PROTOCOL_VERSION_CURRENT,
        flags: PERSIST_FLAG_DBD,
        uid,
        cluster_name: cluster.map(|c| c.to_string()),
        gid: uid,
        auth_token: None,
    }
}

async fn run_client() -> Result<(), Box<dyn StdError>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctl_listener = TcpListener::bind(("127.0.0.1", CONTROLLER_PORT)).await?;
    tokio::spawn(fake_controller(ctl_listener, tx));

    let (mut ctl, rc) = PersistClient::connect(SERVER_ADDR, init(0, Some("c1"))).await?;
    assert_eq!(rc.rc, SLURM_SUCCESS);
    assert_eq!(ctl.version(), PROTOCOL_VERSION_CURRENT);
    let rc = ctl
        .call_rc(&MsgBody::RegisterCtld(RegisterCtldMsg {
            port: CONTROLLER_PORT,
            flags: 0,
        }))
        .await?;
    assert_eq!(rc.rc, SLURM_SUCCESS);

    let (mut admin, _) = PersistClient::connect(SERVER_ADDR, init(0, None)).await?;
    let rc = admin
        .call_rc(&MsgBody::AddAccounts(ListMsg::new(vec![AccountRec {
            name: "physics".to_string(),
            ..Default::default()
        }])))
        .await?;
    assert_eq!(rc.rc, SLURM_SUCCESS);
    let rc = admin.fini(true).await?;
    assert_eq!(rc.rc, SLURM_SUCCESS);

    let update = timeout(Duration::from_secs(10), rx.recv())
        .await?
        .expect("update channel closed");
    assert_eq!(update.kinds, vec!["account".to_string()]);

    let (mut reader, _) = PersistClient::connect(SERVER_ADDR, init(1000, None)).await?;
    match reader
        .call(&MsgBody::GetAccounts(ObjectCond::default()))
        .await?
    {
        MsgBody::ResponseAccounts(list) => assert_eq!(list.list.len(), 1),
        other => panic!("unexpected reply {:?}", other),
    }

    let reply = ctl
        .call(&MsgBody::JobStart(JobStartMsg {
            job_id: 42,
            submit_time: 1_600_000_000,
            start_time: 1_600_000_010,
            ..Default::default()
        }))
        .await?;
    match reply {
        MsgBody::IdRc(id) => {
            assert_eq!(id.rc, SLURM_SUCCESS);
            assert_eq!(id.job_id, 42);
            assert_ne!(id.db_index, 0);
        }
        other => panic!("unexpected reply {:?}", other),
    }

    let rc = ctl.call_rc(&MsgBody::Shutdown(EmptyMsg)).await?;
    assert_eq!(rc.rc, SLURM_SUCCESS);

    // Open connections are closed once shutdown is requested.
    assert!(reader.receive().await.is_err());

    Ok(())
}

#[test]
fn client_server_comms() {
    let barrier = Arc::new(Barrier::new(2));
    let barrier_clone = barrier.clone();
    let _h_server = thread::spawn(move || run_server(barrier_clone));

    barrier.clone().wait();
    assert!(block_on(run_client()).is_ok());
}

/// Shutdown waits for open connections, and a controller's delayed writes
/// are committed as its connection winds down.
#[tokio::test]
async fn shutdown_drains_delayed_controller_writes() {
    let log = test_log();
    let mut config = DbdConfig::default();
    config.accounting.commit_delay = true;
    config.accounting.commit_interval_secs = 3600;
    config.accounting.push_updates = false;
    let storage = MemStorage::new(0);
    let dispatcher = Arc::new(Dispatcher::new(
        config,
        Arc::new(storage.clone()),
        Arc::new(TrustedAuth),
        Some(&log),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_dispatcher = Arc::clone(&dispatcher);
    let server_log = log.clone();
    let server = tokio::spawn(async move {
        server::run(listener, server_dispatcher, &server_log).await;
    });

    let (mut ctl, rc) = PersistClient::connect(addr, init(0, Some("c2")))
        .await
        .unwrap();
    assert_eq!(rc.rc, SLURM_SUCCESS);
    let rc = ctl
        .call_rc(&MsgBody::RegisterCtld(RegisterCtldMsg {
            port: 6817,
            flags: 0,
        }))
        .await
        .unwrap();
    assert_eq!(rc.rc, SLURM_SUCCESS);
    match ctl
        .call(&MsgBody::JobStart(JobStartMsg {
            job_id: 7,
            submit_time: 1_600_000_000,
            start_time: 1_600_000_010,
            ..Default::default()
        }))
        .await
        .unwrap()
    {
        MsgBody::IdRc(id) => assert_eq!(id.rc, SLURM_SUCCESS),
        other => panic!("unexpected reply {:?}", other),
    }
    assert!(storage.jobs().is_empty());

    dispatcher.shutdown();
    timeout(Duration::from_secs(10), server)
        .await
        .expect("server did not stop")
        .unwrap();
    let jobs = storage.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].cluster, "c2");
}

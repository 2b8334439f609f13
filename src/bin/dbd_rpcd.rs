// Copyright 2020 Joyent, Inc.

use std::path::Path;
use std::process;
use std::sync::{Arc, Mutex};

use clap::{crate_version, App, Arg, ArgMatches};
use slog::{error, info, o, Drain, LevelFilter, Logger};
use tokio::net::TcpListener;

use slurmdbd_rpc::auth;
use slurmdbd_rpc::config::{parse_level, DbdConfig};
use slurmdbd_rpc::dispatch::Dispatcher;
use slurmdbd_rpc::server;
use slurmdbd_rpc::storage::memory::MemStorage;

static APP: &str = "dbd-rpcd";

pub fn parse_opts<'a>(app: &str) -> ArgMatches<'a> {
    App::new(app)
        .about("Accounting daemon RPC server")
        .version(crate_version!())
        .arg(
            Arg::with_name("config")
                .help("Path to the TOML configuration file")
                .long("config")
                .short("f")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("listen")
                .help("Address to listen on, overriding server.listen")
                .long("listen")
                .short("l")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("log_level")
                .help("Log level, overriding logging.level")
                .long("log-level")
                .takes_value(true),
        )
        .get_matches()
}

fn load_config(matches: &ArgMatches) -> DbdConfig {
    let mut config = DbdConfig::load(matches.value_of("config").map(Path::new))
        .unwrap_or_else(|e| {
            eprintln!("{}: {}", APP, e);
            process::exit(1)
        });
    if let Some(listen) = matches.value_of("listen") {
        config.server.listen = listen.to_string();
    }
    if let Some(level) = matches.value_of("log_level") {
        if parse_level(level).is_none() {
            eprintln!("{}: unknown log level '{}'", APP, level);
            process::exit(1)
        }
        config.logging.level = level.to_string();
    }
    config
}

async fn wait_for_signal(log: Logger) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => (),
                    _ = term.recv() => (),
                }
            }
            Err(e) => {
                error!(log, "unable to watch for SIGTERM"; "err" => %e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!(log, "signal received, shutting down");
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP);
    let config = load_config(&matches);

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            config.log_level(),
        ))
        .fuse(),
        o!("build-id" => crate_version!()),
    );

    let storage = Arc::new(MemStorage::new(config.accounting.slurm_user_id));
    let authenticator = auth::from_config(&config.auth);
    let listen = config.server.listen.clone();
    let dispatcher = Arc::new(Dispatcher::new(
        config,
        storage,
        authenticator,
        Some(&root_log),
    ));

    let listener = match TcpListener::bind(listen.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(root_log, "failed to bind"; "address" => &listen, "err" => %e);
            process::exit(1)
        }
    };
    info!(root_log, "listening for accounting requests"; "address" => &listen);

    let signal_dispatcher = Arc::clone(&dispatcher);
    let signal_log = root_log.clone();
    tokio::spawn(async move {
        wait_for_signal(signal_log).await;
        signal_dispatcher.shutdown();
    });

    server::run(listener, dispatcher, &root_log).await;
}

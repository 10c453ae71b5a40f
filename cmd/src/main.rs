// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use clap::{App, Arg, SubCommand};
use regionserver::master::NullMasterClient;
use regionserver::{Config, RegionServer};

fn main() {
    let matches = App::new("regionserver")
        .about("Region server for a range-partitioned, log-structured table store")
        .subcommand(
            SubCommand::with_name("start")
                .about("Starts the region server in the foreground")
                .arg(
                    Arg::with_name("config")
                        .long("config")
                        .value_name("FILE")
                        .help("Path to a TOML configuration file")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("bind")
                        .long("bind")
                        .value_name("HOST:PORT")
                        .help("Address this server reports to the master as its own")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("stop")
                .about("Refused: a running server is stopped by its supervisor, not by this command"),
        )
        .get_matches();

    match matches.subcommand() {
        ("start", Some(sub)) => run_start(sub),
        ("stop", Some(_)) => {
            eprintln!("stop is not supported: terminate the supervised process instead");
            std::process::exit(1);
        }
        _ => {
            eprintln!("{}", matches.usage());
            std::process::exit(1);
        }
    }
}

fn run_start(sub: &clap::ArgMatches) {
    regionserver::init_logger(slog::Level::Info);

    let config = match sub.value_of("config") {
        Some(path) => Config::from_file(path).unwrap_or_else(|e| {
            slog_global::error!("failed to load configuration"; "path" => path, "err" => format!("{}", e));
            std::process::exit(1);
        }),
        None => Config::default(),
    };

    let server_name = sub.value_of("bind").unwrap_or("0.0.0.0:0").to_owned();
    let start_code = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();

    let server = RegionServer::new(config, server_name, start_code).unwrap_or_else(|e| {
        slog_global::error!("failed to create region server"; "err" => format!("{}", e));
        std::process::exit(1);
    });

    let running = server.init(Arc::new(NullMasterClient)).unwrap_or_else(|e| {
        slog_global::error!("failed to start region server"; "err" => format!("{}", e));
        std::process::exit(1);
    });

    slog_global::info!("region server started");
    // No signal-handling crate is otherwise needed by this workspace, so
    // shutdown is left to the process supervisor (SIGKILL/SIGTERM); this
    // just keeps the foreground thread alive while the background threads
    // in `running` do the work.
    loop {
        if server.is_aborted() {
            slog_global::error!("region server aborted, exiting");
            running.stop();
            std::process::exit(1);
        }
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
}

//! CLI entry point (spec §6, ambient §10): parses arguments, sets up
//! logging per the config file's `<log>` section, writes the pidfile,
//! applies `io.max_fds` if configured, then hands off to the connector's
//! main loop.
//!
//! The stream engine itself (XML framing, TLS, the I/O reactor) is an
//! external collaborator: this binary constructs its event/command channel
//! pair and passes the handles to [`s2s::mainloop::run`], but does not spawn
//! the task that actually owns sockets. Whatever embeds this crate as a
//! full server wires that task in; this binary is the reference seam, not a
//! complete listener.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use s2s::config::{Config, LogSink};
use s2s::engine::EngineHandle;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "s2s", about = "XMPP server-to-server connector")]
struct Args {
    /// Path to the config file.
    #[arg(short = 'c', long, default_value = "s2s.xml")]
    config: std::path::PathBuf,

    /// Accepted for compatibility with historical invocations; this build
    /// never forks, it logs a notice and stays in the foreground.
    #[arg(short = 'D', long)]
    daemonize: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config {}: {}", args.config.display(), err);
            return ExitCode::from(2);
        }
    };

    init_logging(&config.log_sink);

    if args.daemonize {
        info!("-D/--daemonize requested; this build stays in the foreground");
    }

    if let Some(pidfile) = &config.pidfile {
        if let Err(err) = std::fs::write(pidfile, format!("{}\n", std::process::id())) {
            error!("failed to write pidfile {}: {}", pidfile.display(), err);
            return ExitCode::from(2);
        }
    }

    if let Some(max_fds) = config.io.max_fds {
        if let Err(err) = rlimit::setrlimit(rlimit::Resource::NOFILE, max_fds, max_fds) {
            error!("failed to raise fd limit to {}: {} (continuing with the current limit)", max_fds, err);
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start async runtime: {}", err);
            return ExitCode::from(2);
        }
    };

    runtime.block_on(async_main(config))
}

async fn async_main(config: Config) -> ExitCode {
    let resolver = match hickory_resolver::TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => Arc::new(resolver),
        Err(err) => {
            error!("failed to read system resolver configuration: {}", err);
            return ExitCode::from(2);
        }
    };

    let (engine_commands_tx, _engine_commands_rx) = mpsc::unbounded_channel();
    let (_engine_events_tx, engine_events_rx) = mpsc::unbounded_channel();
    let engine = EngineHandle::new(engine_commands_tx);

    match s2s::mainloop::run(config, resolver, engine_events_rx, engine).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("fatal: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(sink: &LogSink) {
    match sink {
        LogSink::Stdout => {
            env_logger::Builder::from_default_env()
                .filter_level(log::LevelFilter::Info)
                .init();
        }
        LogSink::File(path) => {
            // env_logger writes to stderr only; a file sink is approximated
            // by redirecting there, matching what operators already expect
            // from `s2s >> file 2>&1` today.
            env_logger::Builder::from_default_env()
                .filter_level(log::LevelFilter::Info)
                .init();
            info!("log sink is configured as a file ({}), but this build logs to stderr", path.display());
        }
        LogSink::Syslog { facility, ident } => {
            let facility = facility.parse().unwrap_or(syslog::Facility::LOG_DAEMON);
            match syslog::init(facility, log::LevelFilter::Info, Some(ident.as_str())) {
                Ok(()) => {}
                Err(err) => {
                    eprintln!("failed to initialize syslog ({}), falling back to stderr", err);
                    env_logger::Builder::from_default_env()
                        .filter_level(log::LevelFilter::Info)
                        .init();
                }
            }
        }
    }
}

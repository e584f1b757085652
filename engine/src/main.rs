//! Judge engine process entry point: bootstraps logging and the shared
//! runtime/sandbox state, then serves the `/judge` WebSocket transport (C4)
//! until told to shut down.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config as LogConfig, Root};
use log4rs::encode::pattern::PatternEncoder;

use judge::RuntimeRegistry;
use sandbox::SandboxProvisioner;

mod config;
mod protocol;
mod server;
mod session;

use config::EngineConfig;
use server::AppState;

error_chain::error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links {
        Judge(judge::Error, judge::ErrorKind);
        Sandbox(sandbox::Error, sandbox::ErrorKind);
    }

    foreign_links {
        Io(::std::io::Error);
        Log(::log4rs::config::Errors);
    }

    errors {
        // `session`/`server` report these conditions through `Outcome::Close`
        // codes and log lines rather than by constructing this error type —
        // there is no caller above `main` to propagate a `Result` to — but
        // the kinds are named here to keep the engine's error taxonomy
        // complete.
        ProtocolError(reason: String) {
            description("inbound message violated the session protocol")
            display("protocol error: {}", reason)
        }

        TransportLost {
            description("the `/judge` transport disconnected mid-session")
        }
    }
}

/// Configure the `log` facade from `LOG_LEVEL`, falling back to `info` for
/// anything unrecognized. There's no file-based configuration surface here,
/// so the console appender is built programmatically instead of read from a
/// log4rs config file.
fn init_logging(level: &str) -> Result<()> {
    let level_filter = LevelFilter::from_str(level).unwrap_or_else(|_| {
        eprintln!("LOG_LEVEL={:?} is not a valid level, defaulting to info", level);
        LevelFilter::Info
    });

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S%.3f)} {h({l})} [{T}] {t} - {m}{n}",
        )))
        .build();

    let log_config = LogConfig::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level_filter))?;

    log4rs::init_config(log_config).chain_err(|| "failed to install log4rs configuration")?;
    Ok(())
}

/// Directory sandbox scratch roots are staged under. Not part of the
/// configured env surface (that names tunable limits, not storage paths); a
/// fixed subdirectory of the system temp dir is sufficient since the sandbox
/// provisioner owns everything underneath it and tears it down per-session.
fn scratch_base() -> std::path::PathBuf {
    std::env::temp_dir().join("judge-engine-sandboxes")
}

fn listen_addr() -> SocketAddr {
    let port = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080u16);
    SocketAddr::from(([0, 0, 0, 0], port))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    log::info!("shutdown signal received, draining connections");
}

#[tokio::main]
async fn main() {
    let config = EngineConfig::from_env();

    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    log::info!("starting judge engine");
    log::info!(
        "configured maxima: compile_timeout={}ms run_timeout={}ms compile_cpu_time={}ms \
         run_cpu_time={}ms compile_memory={}B run_memory={}B max_concurrent_jobs={} \
         max_process_count={} max_open_files={} max_file_size={}B output_max_size={}B \
         disable_networking={}",
        config.compile_timeout_ms,
        config.run_timeout_ms,
        config.compile_cpu_time_ms,
        config.run_cpu_time_ms,
        config.compile_memory_bytes,
        config.run_memory_bytes,
        config.max_concurrent_jobs,
        config.max_process_count,
        config.max_open_files,
        config.max_file_size_bytes,
        config.output_max_size,
        config.disable_networking,
    );

    let pool = config.identity_pool();
    let provisioner = SandboxProvisioner::new(pool, scratch_base());
    let registry = RuntimeRegistry::with_builtins();
    log::info!("runtime registry seeded with {} installed runtime(s)", registry.len());

    let state = Arc::new(AppState {
        registry,
        provisioner,
        config,
    });

    let addr = listen_addr();
    if let Err(e) = server::serve(addr, state, shutdown_signal()).await {
        log::error!("judge engine server exited with error: {}", e);
        std::process::exit(1);
    }
}

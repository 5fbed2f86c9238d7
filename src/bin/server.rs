//! Server entry point: loads config, ensures output directories exist,
//! opens the log sink, optionally loads the TLS context, starts the
//! scheduler, then runs a single-threaded accept loop that spawns one
//! detached thread per connection. `SIGTERM`/`SIGINT` close the listening
//! socket to interrupt `accept`; `SIGHUP` sets a reload flag observed
//! between accepts.

// Unless we are in release mode, allow dead code, unused imports and variables,
// it makes development more enjoyable.
#![cfg_attr(debug_assertions, allow(dead_code, unused_imports, unused_variables))]

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use structopt::clap::AppSettings;
use structopt::StructOpt;

use pixelgrade::config::ServerConfig;
use pixelgrade::connection;
use pixelgrade::daemon;
use pixelgrade::logging::Logger;
use pixelgrade::scheduler::Scheduler;
use pixelgrade::signals;
use pixelgrade::tls;
use pixelgrade::transport::Connection;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "pixelgrade-server",
    setting = AppSettings::DeriveDisplayOrder,
    setting = AppSettings::ColoredHelp,
)]
struct Opts {
    /// Path to the JSON configuration file. Built-in defaults apply when absent.
    #[structopt(long)]
    config: Option<PathBuf>,

    /// Run in the foreground (default).
    #[structopt(long, conflicts_with = "daemon")]
    foreground: bool,

    /// Double-fork into a background daemon.
    #[structopt(long)]
    daemon: bool,

    /// Path to write the process pidfile to.
    #[structopt(long)]
    pidfile: Option<PathBuf>,
}

fn main() {
    let opts = Opts::from_args();
    if let Err(e) = run(opts) {
        eprintln!("pixelgrade-server: {:#}", e);
        std::process::exit(1);
    }
}

fn run(opts: Opts) -> Result<()> {
    let config = ServerConfig::load(opts.config.as_deref()).context("Failed to load configuration")?;
    config.ensure_directories().context("Failed to prepare output directories")?;

    let tls_config = if config.tls_enabled {
        Some(tls::load_server_config(&config.tls_dir).context("Failed to load TLS certificate/key")?)
    } else {
        None
    };

    if opts.daemon {
        daemon::daemonize().context("Failed to daemonize")?;
    }
    if let Some(pidfile) = &opts.pidfile {
        daemon::write_pidfile(pidfile).context("Failed to write pidfile")?;
    }

    let logger = Logger::open(&config.log_file).context("Failed to open log file")?;
    signals::install().context("Failed to install signal handlers")?;

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .with_context(|| format!("Failed to bind to port {}", config.port))?;
    // Non-blocking so the accept loop can re-check the shutdown/reload
    // flags between attempts instead of blocking indefinitely in `accept`.
    listener.set_nonblocking(true).context("Failed to configure listening socket")?;

    logger.log(&format!("Listening on port {} (tls={})", config.port, config.tls_enabled));

    let scheduler = Arc::new(
        Scheduler::start(config.output_config(), logger.clone()).context("Failed to start scheduler")?,
    );

    serve(&listener, &config, tls_config, &scheduler, &logger);

    logger.log("Shutting down: draining scheduler");
    scheduler.shutdown();
    logger.log("Shutdown complete");
    Ok(())
}

/// The accept loop itself. Checks the shutdown flag before each `accept`
/// (and observes/clears the reload flag, which has no effect beyond being
/// logged). Relies on a short accept timeout so the shutdown flag is
/// re-checked promptly even with no incoming connections.
fn serve(
    listener: &TcpListener,
    config: &ServerConfig,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    scheduler: &Arc<Scheduler>,
    logger: &Logger,
) {
    loop {
        if signals::shutdown_requested() {
            return;
        }
        if signals::take_reload_requested() {
            logger.log("SIGHUP received: reload requested (no hot-reload implemented; restart to apply changes)");
        }

        match listener.accept() {
            Ok((socket, peer)) => {
                if let Err(e) = socket.set_nonblocking(false) {
                    logger.log(&format!("Failed to configure accepted socket from {}: {:#}", peer, e));
                    continue;
                }
                let config = config.clone();
                let scheduler = scheduler.clone();
                let logger = logger.clone();
                let tls_config = tls_config.clone();

                std::thread::spawn(move || {
                    let conn = match tls_config {
                        Some(tls_config) => match tls::accept(socket, tls_config) {
                            Ok(stream) => Connection::Tls(Box::new(stream)),
                            Err(e) => {
                                logger.log(&format!("TLS handshake failed for {}: {:#}", peer, e));
                                return;
                            }
                        },
                        None => Connection::Plain(socket),
                    };
                    connection::handle(conn, &config, &scheduler, &logger);
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                logger.log(&format!("Failed to accept connection: {:#}", e));
            }
        }
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn parses_defaults() {
        let opts = Opts::from_iter(&["pixelgrade-server"]);
        assert!(opts.config.is_none());
        assert!(!opts.daemon);
        assert!(opts.pidfile.is_none());
    }

    #[test]
    fn parses_config_and_daemon_flags() {
        let opts = Opts::from_iter(&[
            "pixelgrade-server",
            "--config",
            "/etc/pixelgrade/server.json",
            "--daemon",
            "--pidfile",
            "/run/pixelgrade.pid",
        ]);
        assert_eq!(opts.config, Some(PathBuf::from("/etc/pixelgrade/server.json")));
        assert!(opts.daemon);
        assert_eq!(opts.pidfile, Some(PathBuf::from("/run/pixelgrade.pid")));
    }

    #[test]
    fn daemon_and_foreground_conflict() {
        let result = Opts::from_iter_safe(&["pixelgrade-server", "--daemon", "--foreground"]);
        assert!(result.is_err());
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::info;

use taskmaster::control::ControlInterface;
use taskmaster::logger::logs_tracing;
use taskmaster::supervisor::Supervisor;
use taskmaster::{monitor, server, shell, signals};

const USAGE: &str = "usage: taskmaster <config.yml> [--server <addr:port>] [--log-dir <dir>]";

struct Args {
    config: PathBuf,
    server: Option<String>,
    log_dir: PathBuf,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config = None;
    let mut server = None;
    let mut log_dir = PathBuf::from("logs");

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--server" => server = Some(args.next().context(USAGE)?),
            "--log-dir" => log_dir = PathBuf::from(args.next().context(USAGE)?),
            flag if flag.starts_with('-') => bail!("unknown flag `{flag}`\n{USAGE}"),
            path => {
                if config.is_some() {
                    bail!("{USAGE}");
                }
                config = Some(PathBuf::from(path));
            }
        }
    }
    Ok(Args {
        config: config.context(USAGE)?,
        server,
        log_dir,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let (guard, logs) = logs_tracing(&args.log_dir);
    info!(pid = std::process::id(), config = %args.config.display(), "taskmaster starting");

    let supervisor = Arc::new(Supervisor::new(args.config.clone()));
    supervisor
        .load()
        .await
        .with_context(|| format!("cannot load {}", args.config.display()))?;

    tokio::spawn(monitor::run(supervisor.table()));

    let ctl = Arc::new(ControlInterface::new(supervisor, logs));
    let shutdown = Arc::new(Notify::new());
    let sigs = signals::install().context("cannot install signal handlers")?;
    tokio::spawn(signals::run(sigs, ctl.clone(), shutdown.clone()));

    match args.server {
        Some(addr) => {
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("cannot bind control socket on {addr}"))?;
            tokio::select! {
                _ = server::run_server(listener, ctl.clone(), shutdown.clone()) => {}
                _ = shutdown.notified() => info!("daemon exiting"),
            }
        }
        None => {
            tokio::select! {
                result = shell::run_shell(ctl, &args.log_dir) => {
                    result?;
                    info!("daemon exiting");
                }
                _ = shutdown.notified() => {
                    info!("daemon exiting");
                    // The readline worker is parked on stdin and cannot be
                    // joined; flush the log writer and leave directly.
                    drop(guard);
                    std::process::exit(0);
                }
            }
        }
    }
    Ok(())
}

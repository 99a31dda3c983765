use std::io;
use std::sync::Arc;

use futures::stream::StreamExt;
use nix::sys::signal::Signal;
use signal_hook::consts::signal::{SIGABRT, SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook_tokio::Signals;
use tokio::sync::Notify;
use tracing::info;

use crate::command::Command;
use crate::control::ControlInterface;

pub fn install() -> io::Result<Signals> {
    Signals::new([SIGHUP, SIGUSR1, SIGUSR2, SIGINT, SIGTERM, SIGQUIT, SIGABRT])
}

/*
    @@@
    @run();
    . Owns the signal stream for the daemon's life; one task installed at boot.
    . Each delivery translates into the same Command enum the text protocol uses and goes through the normal dispatch path, never straight at the table.
    . SIGHUP reloads, SIGUSR1 dumps status to the log, SIGUSR2 toggles verbosity; the four terminating signals stop every program and then wake the daemon's shutdown notify, so main unwinds and flushes the log worker.
*/
pub async fn run(mut signals: Signals, ctl: Arc<ControlInterface>, shutdown: Arc<Notify>) {
    while let Some(signal) = signals.next().await {
        match signal {
            SIGHUP => {
                info!(signal = "SIGHUP", "reload requested");
                ctl.dispatch(Command::Reload).await;
            }
            SIGUSR1 => {
                info!(signal = "SIGUSR1", "status dump requested");
                ctl.log_status().await;
            }
            SIGUSR2 => {
                ctl.dispatch(Command::ToggleVerbosity).await;
            }
            other => {
                let name = Signal::try_from(other).map(Signal::as_str).unwrap_or("unknown");
                info!(signal = name, "terminating signal, stopping everything");
                ctl.dispatch(Command::Shutdown).await;
                info!("shutdown complete");
                shutdown.notify_one();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LogControl;
    use crate::supervisor::Supervisor;
    use std::path::PathBuf;
    use tokio::time::{timeout, Duration};

    fn write_config(tag: &str) -> PathBuf {
        let path =
            std::env::temp_dir().join(format!("taskmaster-sig-{}-{}.yml", tag, std::process::id()));
        std::fs::write(&path, "programs:\n  demo:\n    cmd: \"sleep 30\"\n    autostart: false\n")
            .unwrap();
        path
    }

    // The stream task must end by waking the notify, never by taking the
    // whole process down with it.
    #[tokio::test]
    async fn terminating_signal_wakes_the_shutdown_notify() {
        let supervisor = Arc::new(Supervisor::new(write_config("term")));
        supervisor.load().await.unwrap();
        let ctl = Arc::new(ControlInterface::new(supervisor, LogControl::detached()));

        let shutdown = Arc::new(Notify::new());
        let signals = install().unwrap();
        let task = tokio::spawn(run(signals, ctl, shutdown.clone()));

        nix::sys::signal::raise(Signal::SIGTERM).unwrap();

        timeout(Duration::from_secs(5), shutdown.notified())
            .await
            .expect("shutdown notify never woke");
        timeout(Duration::from_secs(5), task)
            .await
            .expect("signal task never returned")
            .unwrap();
    }
}

use std::sync::Arc;

use tracing::{info, warn};

use crate::command::{parse_line, Command, Target, HELP};
use crate::error::{CommandParseError, ControlError};
use crate::logger::LogControl;
use crate::supervisor::Supervisor;

/// Outcome of one dispatched control line.
#[derive(Debug)]
pub enum Dispatch {
    /// Text to send back; the session continues.
    Reply(String),
    /// Text to send back, after which the daemon exits. Everything has
    /// already been stopped by the time this is returned.
    Shutdown(String),
}

impl Dispatch {
    pub fn text(&self) -> &str {
        match self {
            Dispatch::Reply(text) | Dispatch::Shutdown(text) => text,
        }
    }
}

/// Single dispatch path for every control source: shell lines, socket
/// lines and OS signals all funnel through here, so no caller ever
/// touches the table directly.
pub struct ControlInterface {
    supervisor: Arc<Supervisor>,
    logs: LogControl,
}

impl ControlInterface {
    pub fn new(supervisor: Arc<Supervisor>, logs: LogControl) -> ControlInterface {
        ControlInterface { supervisor, logs }
    }

    /// One line in, one reply out: the whole control protocol. Parse
    /// errors become the reply; the session always continues.
    pub async fn handle_line(&self, line: &str) -> Dispatch {
        match parse_line(line) {
            Ok(cmd) => self.dispatch(cmd).await,
            Err(CommandParseError::Empty) => Dispatch::Reply(String::new()),
            Err(e) => Dispatch::Reply(e.to_string()),
        }
    }

    /*
        @@@
        @dispatch();
        . Maps each command onto the matching Supervisor operation and renders the outcome as reply text.
        . Unknown program names come back as text, never as a failure of the session or the daemon.
        . Shutdown stops every program before returning, so the caller only has to exit.
    */
    pub async fn dispatch(&self, cmd: Command) -> Dispatch {
        match cmd {
            Command::Status => Dispatch::Reply(self.supervisor.status().await),
            Command::Start(Target::All) => Dispatch::Reply(self.supervisor.start_all().await),
            Command::Start(Target::One(name)) => {
                Dispatch::Reply(reply(self.supervisor.start_program(&name).await))
            }
            Command::Stop(Target::All) => Dispatch::Reply(self.supervisor.stop_all().await),
            Command::Stop(Target::One(name)) => {
                Dispatch::Reply(reply(self.supervisor.stop_program(&name).await))
            }
            Command::Restart(name) => {
                Dispatch::Reply(reply(self.supervisor.restart_program(&name).await))
            }
            Command::Reload => match self.supervisor.reload().await {
                Ok(report) => Dispatch::Reply(report),
                Err(e) => {
                    warn!(error = %e, "reload failed, keeping previous configuration");
                    Dispatch::Reply(format!("reload failed: {e}\nprevious configuration kept"))
                }
            },
            Command::Config(names) => Dispatch::Reply(self.supervisor.spec_dump(&names).await),
            Command::Attach { name, index } => {
                Dispatch::Reply(reply(self.supervisor.attach(&name, index).await))
            }
            Command::Help => Dispatch::Reply(HELP.to_string()),
            Command::Shutdown => {
                info!("shutdown requested, stopping all programs");
                let report = self.supervisor.stop_all().await;
                Dispatch::Shutdown(format!("{report}\nshutting down"))
            }
            Command::ToggleVerbosity => {
                let level = self.logs.toggle();
                info!(level, "log level toggled");
                Dispatch::Reply(format!("log level set to {level}"))
            }
        }
    }

    /// SIGUSR1: the status snapshot goes to the log instead of a
    /// session reply.
    pub async fn log_status(&self) {
        let status = self.supervisor.status().await;
        info!("status dump:\n{status}");
    }
}

fn reply(result: Result<String, ControlError>) -> String {
    match result {
        Ok(text) => text,
        Err(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_config(tag: &str, body: &str) -> PathBuf {
        let path =
            std::env::temp_dir().join(format!("taskmaster-ctl-{}-{}.yml", tag, std::process::id()));
        std::fs::write(&path, body).unwrap();
        path
    }

    async fn interface(tag: &str, body: &str) -> ControlInterface {
        let supervisor = Arc::new(Supervisor::new(write_config(tag, body)));
        supervisor.load().await.unwrap();
        ControlInterface::new(supervisor, LogControl::detached())
    }

    const IDLE: &str = "programs:\n  demo:\n    cmd: \"sleep 30\"\n    autostart: false\n";

    #[tokio::test]
    async fn status_lists_every_instance() {
        let ctl = interface("status", IDLE).await;
        match ctl.handle_line("status").await {
            Dispatch::Reply(text) => {
                assert!(text.contains("demo:0"));
                assert!(text.contains("stopped"));
            }
            other => panic!("unexpected dispatch: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_program_is_a_reply_not_a_failure() {
        let ctl = interface("unknown", IDLE).await;
        let text = ctl.handle_line("start ghost").await.text().to_string();
        assert_eq!(text, "no such program in config: `ghost`");
        // The session and the table survive.
        assert!(ctl.handle_line("status").await.text().contains("demo:0"));
    }

    #[tokio::test]
    async fn parse_errors_reply_usage_text() {
        let ctl = interface("parse", IDLE).await;
        assert_eq!(ctl.handle_line("frobnicate").await.text(), "Unknown command: frobnicate");
        assert_eq!(ctl.handle_line("start").await.text(), "usage: start <program>");
        assert_eq!(ctl.handle_line("   ").await.text(), "");
    }

    #[tokio::test]
    async fn help_and_config_render_text() {
        let ctl = interface("help", IDLE).await;
        assert!(ctl.handle_line("help").await.text().contains("start <program>"));
        let dump = ctl.handle_line("config demo").await.text().to_string();
        assert!(dump.contains("cmd: sleep 30"));
        assert!(dump.contains("autostart: false"));
    }

    #[tokio::test]
    async fn quit_stops_everything_and_asks_for_shutdown() {
        let ctl = interface("quit", IDLE).await;
        match ctl.handle_line("quit").await {
            Dispatch::Shutdown(text) => assert!(text.contains("shutting down")),
            other => panic!("unexpected dispatch: {other:?}"),
        }
    }

    #[tokio::test]
    async fn verbosity_toggle_flips_levels() {
        let ctl = interface("verbosity", IDLE).await;
        let first = ctl.dispatch(Command::ToggleVerbosity).await;
        assert_eq!(first.text(), "log level set to DEBUG");
        let second = ctl.dispatch(Command::ToggleVerbosity).await;
        assert_eq!(second.text(), "log level set to INFO");
    }
}

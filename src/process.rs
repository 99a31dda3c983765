use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use nix::libc;
use nix::sys::signal::{killpg, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{setsid, Pid};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::config::ProgramSpec;
use crate::error::ControlError;

// Shared handle to one supervised instance.
// All runtime mutation goes through this Mutex; the table lock only
// guards the map structure around it.
pub type SharedInstance = Arc<Mutex<ProcessInstance>>;

const ATTACH_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Fatal,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyActive,
    Started { pid: u32 },
    Fatal { attempts: u32 },
}

#[derive(Debug, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped { exit_code: i32 },
    Killed,
}

// One slot of a program: `<name>:<index>` with index < numprocs.
pub struct ProcessInstance {
    pub name: String,
    pub index: usize,
    pub spec: ProgramSpec,
    pub child: Option<Child>,
    pub state: ProcessState,
    pub exit_code: Option<i32>,
    pub attempts: u32,
    pub monitored: bool,
    pub started_at: Option<DateTime<Local>>,
}

impl ProcessInstance {
    pub fn new(name: &str, index: usize, spec: ProgramSpec) -> ProcessInstance {
        ProcessInstance {
            name: name.to_string(),
            index,
            spec,
            child: None,
            state: ProcessState::Stopped,
            exit_code: None,
            attempts: 0,
            monitored: false,
            started_at: None,
        }
    }

    pub fn shared(name: &str, index: usize, spec: ProgramSpec) -> SharedInstance {
        Arc::new(Mutex::new(ProcessInstance::new(name, index, spec)))
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, ProcessState::Running | ProcessState::Starting)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /*
        @@@
        @start();
        . No-op when the instance is already Running or Starting.
        . Spawns `sh -c <cmd>` with the configured workingdir, env overlay, umask and output targets, then sleeps the starttime window.
        . Still alive after the window (or exited with an accepted code) means the start succeeded; an early unexpected exit burns one attempt.
        . Retries up to startretries spawn attempts, then marks the instance Fatal.
    */
    pub async fn start(&mut self) -> StartOutcome {
        if self.is_active() {
            warn!(
                program = %self.name,
                index = self.index,
                state = %self.state,
                "already active, start ignored"
            );
            return StartOutcome::AlreadyActive;
        }

        self.attempts = 0;
        while self.attempts < self.spec.startretries {
            self.attempts += 1;

            let mut command = build_command(&self.name, self.index, &self.spec);
            let child = match command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    warn!(
                        program = %self.name,
                        index = self.index,
                        attempt = self.attempts,
                        error = %e,
                        "spawn failed"
                    );
                    continue;
                }
            };

            let pid = child.id().unwrap_or(0);
            self.child = Some(child);
            self.state = ProcessState::Starting;
            self.exit_code = None;
            self.started_at = Some(Local::now());
            info!(program = %self.name, index = self.index, pid, "Spawned new instance");

            if self.spec.starttime > 0 {
                sleep(Duration::from_secs(self.spec.starttime)).await;
            }

            // Peek without consuming: a finished child stays cached in the
            // handle so the monitor can observe the exit and apply policy.
            let early = self.child.as_mut().and_then(|c| c.try_wait().ok().flatten());
            match early {
                None => {
                    self.state = ProcessState::Running;
                    self.monitored = true;
                    info!(
                        program = %self.name,
                        index = self.index,
                        starttime = self.spec.starttime,
                        "Marked healthy after grace period"
                    );
                    return StartOutcome::Started { pid };
                }
                Some(status) if self.spec.accepts_exit(exit_code(&status)) => {
                    // A quick clean exit still counts as a successful start;
                    // the monitor records the completion on its next tick.
                    self.state = ProcessState::Running;
                    self.monitored = true;
                    info!(
                        program = %self.name,
                        index = self.index,
                        exit_code = exit_code(&status),
                        "Exited cleanly within grace period"
                    );
                    return StartOutcome::Started { pid };
                }
                Some(status) => {
                    let code = exit_code(&status);
                    self.exit_code = Some(code);
                    self.child = None;
                    warn!(
                        program = %self.name,
                        index = self.index,
                        attempt = self.attempts,
                        exit_code = code,
                        "Exited before grace period"
                    );
                }
            }
        }

        self.state = ProcessState::Fatal;
        self.monitored = false;
        error!(
            program = %self.name,
            index = self.index,
            attempts = self.attempts,
            "giving up after failed start attempts, marking fatal"
        );
        StartOutcome::Fatal { attempts: self.attempts }
    }

    /*
        @@@
        @stop();
        . No-op when the instance has no live child (stopping an already stopped instance changes nothing).
        . Sends the configured stop signal to the child's process group, then polls try_wait every 100ms for up to stoptime seconds.
        . Escalates to a group-wide SIGKILL when the grace period runs out, and reaps the child either way.
    */
    pub async fn stop(&mut self) -> StopOutcome {
        if !self.is_active() || self.child.is_none() {
            warn!(
                program = %self.name,
                index = self.index,
                state = %self.state,
                "not running, stop ignored"
            );
            return StopOutcome::NotRunning;
        }

        self.state = ProcessState::Stopping;
        self.monitored = false;
        let sig = self.spec.stop_signal();

        // 1) Graceful stop. The signal goes to the whole group so that
        // commands the shell forked instead of exec'ing get it too.
        if let Some(pid) = self.pid() {
            info!(program = %self.name, index = self.index, pid, signal = ?sig, "sending stop signal to process group");
            if let Err(e) = killpg(Pid::from_raw(pid as i32), sig) {
                warn!(
                    program = %self.name,
                    index = self.index,
                    error = %e,
                    "failed to deliver stop signal, treating as exited"
                );
            }
        }

        // 2) Wait up to stoptime
        let timeout = Duration::from_secs(self.spec.stoptime);
        let mut elapsed = Duration::ZERO;
        while elapsed < timeout {
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    let code = exit_code(&status);
                    self.exit_code = Some(code);
                    self.child = None;
                    self.state = ProcessState::Stopped;
                    info!(
                        program = %self.name,
                        index = self.index,
                        exit_code = code,
                        "exited after stop signal"
                    );
                    return StopOutcome::Stopped { exit_code: code };
                }
            }
            sleep(Duration::from_millis(100)).await;
            elapsed += Duration::from_millis(100);
        }

        // 3) Force-kill the group, then reap the shell. wait() must not
        // be reached without a SIGKILL actually delivered somewhere.
        if let Some(child) = self.child.as_mut() {
            match child.id() {
                Some(pid) => match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    Ok(()) => warn!(program = %self.name, index = self.index, "sent SIGKILL to process group after timeout"),
                    Err(e) => {
                        error!(program = %self.name, index = self.index, error = %e, "group SIGKILL failed, killing the child directly");
                        let _ = child.start_kill();
                    }
                },
                None => {
                    let _ = child.start_kill();
                }
            }
            if let Ok(status) = child.wait().await {
                self.exit_code = Some(exit_code(&status));
            }
        }
        self.child = None;
        self.state = ProcessState::Stopped;
        StopOutcome::Killed
    }

    /// Stop followed by start without releasing the instance lock, so no
    /// other operation (monitor included) can slip in between.
    pub async fn restart(&mut self) -> StartOutcome {
        self.stop().await;
        self.start().await
    }

    /// Consumes a finished child's exit status. None while it still runs.
    pub fn poll_exit(&mut self) -> Option<i32> {
        let status = self.child.as_mut().and_then(|c| c.try_wait().ok().flatten())?;
        let code = exit_code(&status);
        self.exit_code = Some(code);
        self.child = None;
        Some(code)
    }

    pub fn describe(&self) -> String {
        match self.state {
            ProcessState::Running => {
                let since = self
                    .started_at
                    .map(|t| t.format("%H:%M:%S").to_string())
                    .unwrap_or_default();
                match self.pid() {
                    Some(pid) => format!("running (pid {pid}, started {since})"),
                    None => format!("running (started {since})"),
                }
            }
            ProcessState::Starting => "starting".to_string(),
            ProcessState::Stopping => "stopping".to_string(),
            ProcessState::Fatal => format!("fatal ({} attempts)", self.attempts),
            ProcessState::Stopped => match self.exit_code {
                Some(code) if self.spec.accepts_exit(code) => "completed".to_string(),
                Some(code) => format!("stopped (exit code {code})"),
                None => "stopped".to_string(),
            },
        }
    }

    /// Read-only peek at the instance's output: the last lines of its
    /// stdout file. Never touches the process itself.
    pub fn tail_stdout(&self) -> Result<String, ControlError> {
        let slot = format!("{}:{}", self.name, self.index);
        if !self.is_active() {
            return Err(ControlError::NotAttachable {
                name: slot,
                reason: "instance is not running".to_string(),
            });
        }
        let path = self.spec.stdout.as_deref().ok_or_else(|| ControlError::NotAttachable {
            name: slot.clone(),
            reason: "stdout is discarded (no stdout file configured)".to_string(),
        })?;
        let text = std::fs::read_to_string(path).map_err(|e| ControlError::NotAttachable {
            name: slot,
            reason: format!("cannot read {path}: {e}"),
        })?;
        let lines: Vec<&str> = text.lines().collect();
        let skip = lines.len().saturating_sub(ATTACH_TAIL_LINES);
        Ok(lines[skip..].join("\n"))
    }
}

/*
    @@@
    @build_command();
    . Runs the program line through `sh -c` with stdin detached.
    . Redirects stdout/stderr to the configured files (append, parent dirs created) or to /dev/null when discarded.
    . Applies workingdir and the env overlay in the parent; pre_exec runs setsid and umask in the child.
    . setsid puts the child in its own session and process group, the unit stop() signals.
*/
fn build_command(name: &str, index: usize, spec: &ProgramSpec) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&spec.cmd);
    cmd.stdin(Stdio::null());
    cmd.stdout(open_output(spec.stdout.as_deref(), name, index, "stdout"));
    cmd.stderr(open_output(spec.stderr.as_deref(), name, index, "stderr"));

    if let Some(dir) = &spec.workingdir {
        cmd.current_dir(dir);
    }
    if let Some(envs) = &spec.env {
        cmd.envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }

    let mask = spec.umask_bits();
    unsafe {
        cmd.pre_exec(move || {
            setsid().map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            if let Some(bits) = mask {
                umask(Mode::from_bits_truncate(bits as libc::mode_t));
            }
            Ok(())
        });
    }

    cmd.kill_on_drop(true);
    cmd
}

fn open_output(target: Option<&str>, name: &str, index: usize, stream: &str) -> Stdio {
    let Some(path) = target else {
        return Stdio::null();
    };
    if let Some(dir) = Path::new(path).parent() {
        std::fs::create_dir_all(dir).ok();
    }
    match std::fs::OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Stdio::from(file),
        Err(e) => {
            warn!(
                program = %name,
                index,
                stream,
                path,
                error = %e,
                "cannot open output file, discarding"
            );
            Stdio::null()
        }
    }
}

// Signal deaths map to 128 + signo, the shell convention.
fn exit_code(status: &ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

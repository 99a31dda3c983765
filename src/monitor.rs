use std::sync::Arc;

use tokio::time::{interval, Duration};
use tracing::info;

use crate::config::RestartPolicy;
use crate::process::ProcessState;
use crate::table::ProcessTable;

pub const TICK: Duration = Duration::from_secs(1);

/*
    @@@
    @run();
    . One background task ticking every second for the life of the daemon.
    . Each tick sweeps a snapshot of the table for unsolicited child exits.
*/
pub async fn run(table: Arc<ProcessTable>) {
    let mut tick = interval(TICK);
    loop {
        tick.tick().await;
        sweep(&table).await;
    }
}

/*
    @@@
    @sweep();
    . try_lock per instance: a held lock means an operation is mid-flight on it and settles the state itself, so the tick skips it and stays bounded.
    . Consumes the exit of any monitored Running instance whose child finished, then applies the restart policy.
    . A restart goes through the controller's normal retrying start in a detached task, indistinguishable from an operator restart.
*/
pub async fn sweep(table: &ProcessTable) {
    for (_, instances) in table.snapshot().await {
        for inst in instances {
            let Ok(mut guard) = inst.try_lock() else {
                continue;
            };
            if !guard.monitored || guard.state != ProcessState::Running {
                continue;
            }
            let Some(code) = guard.poll_exit() else {
                continue;
            };

            let policy = guard.spec.autorestart;
            let accepted = guard.spec.accepts_exit(code);
            // The exit is consumed and the flags are cleared under the
            // lock, so a later tick cannot act on this exit again.
            guard.state = ProcessState::Stopped;
            guard.monitored = false;

            if should_restart(code, policy, guard.spec.exitcodes.as_slice()) {
                info!(
                    program = %guard.name,
                    index = guard.index,
                    exit_code = code,
                    policy = ?policy,
                    "restarting after exit"
                );
                drop(guard);
                let handle = inst.clone();
                tokio::spawn(async move {
                    handle.lock().await.start().await;
                });
            } else if accepted {
                info!(program = %guard.name, index = guard.index, exit_code = code, "completed");
            } else {
                info!(
                    program = %guard.name,
                    index = guard.index,
                    exit_code = code,
                    policy = ?policy,
                    "exited, not restarting"
                );
            }
        }
    }
}

pub fn should_restart(code: i32, policy: RestartPolicy, accepted: &[i32]) -> bool {
    match policy {
        RestartPolicy::Always => true,
        RestartPolicy::Never => false,
        RestartPolicy::Unexpected => !accepted.contains(&code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OneOrMany, ProgramSpec};
    use crate::process::ProcessInstance;
    use tokio::time::sleep;

    #[test]
    fn test_should_restart_unexpected() {
        let accepted = &[0];
        assert!(should_restart(1, RestartPolicy::Unexpected, accepted));
        assert!(!should_restart(0, RestartPolicy::Unexpected, accepted));
    }

    #[test]
    fn test_should_restart_always() {
        assert!(should_restart(123, RestartPolicy::Always, &[]));
        assert!(should_restart(0, RestartPolicy::Always, &[0]));
    }

    #[test]
    fn test_should_restart_never() {
        assert!(!should_restart(0, RestartPolicy::Never, &[]));
        assert!(!should_restart(1, RestartPolicy::Never, &[]));
    }

    fn spec(cmd: &str) -> ProgramSpec {
        ProgramSpec {
            cmd: cmd.to_string(),
            numprocs: 1,
            autostart: true,
            autorestart: RestartPolicy::Never,
            exitcodes: OneOrMany::One(0),
            startretries: 3,
            starttime: 0,
            stopsignal: "TERM".to_string(),
            stoptime: 1,
            workingdir: None,
            umask: None,
            stdout: None,
            stderr: None,
            env: None,
        }
    }

    #[tokio::test]
    async fn sweep_settles_a_completed_instance() {
        let table = ProcessTable::new();
        let inst = ProcessInstance::shared("demo", 0, spec("true"));
        table.insert("demo", vec![inst.clone()]).await;

        inst.lock().await.start().await;
        sleep(Duration::from_millis(300)).await;
        sweep(&table).await;

        let guard = inst.lock().await;
        assert_eq!(guard.state, ProcessState::Stopped);
        assert_eq!(guard.exit_code, Some(0));
        assert!(!guard.monitored);
    }

    #[tokio::test]
    async fn sweep_never_blocks_on_a_busy_instance() {
        let table = ProcessTable::new();
        let inst = ProcessInstance::shared("demo", 0, spec("sleep 3"));
        table.insert("demo", vec![inst.clone()]).await;

        let held = inst.lock().await;
        // Held lock means mid-operation: the sweep must skip and return.
        sweep(&table).await;
        assert_eq!(held.state, ProcessState::Stopped);
    }
}

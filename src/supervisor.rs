use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::{Config, ProgramSpec};
use crate::error::{ConfigError, ControlError};
use crate::process::{ProcessInstance, SharedInstance, StartOutcome, StopOutcome};
use crate::table::ProcessTable;

/// Names partitioned by the reconciler: a program appears in at most
/// one set, and in none of them when its spec is unchanged.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReloadDiff {
    pub removed: Vec<String>,
    pub added: Vec<String>,
    pub changed: Vec<String>,
}

pub fn diff_specs(
    old: &HashMap<String, ProgramSpec>,
    new: &HashMap<String, ProgramSpec>,
) -> ReloadDiff {
    let mut diff = ReloadDiff::default();
    for name in old.keys() {
        if !new.contains_key(name) {
            diff.removed.push(name.clone());
        }
    }
    for (name, spec) in new {
        match old.get(name) {
            None => diff.added.push(name.clone()),
            Some(prev) if prev != spec => diff.changed.push(name.clone()),
            Some(_) => {}
        }
    }
    diff.removed.sort();
    diff.added.sort();
    diff.changed.sort();
    diff
}

pub struct Supervisor {
    table: Arc<ProcessTable>,
    specs: RwLock<HashMap<String, ProgramSpec>>,
    config_path: PathBuf,
}

impl Supervisor {
    pub fn new(config_path: PathBuf) -> Supervisor {
        Supervisor {
            table: Arc::new(ProcessTable::new()),
            specs: RwLock::new(HashMap::new()),
            config_path,
        }
    }

    /// Handle for the monitor loop; the supervisor keeps ownership.
    pub fn table(&self) -> Arc<ProcessTable> {
        self.table.clone()
    }

    /*
        @@@
        @load();
        . Initial configuration load; any ConfigError here is fatal to startup.
        . Populates the table with numprocs Stopped instances per program, then starts the autostart programs concurrently.
        . Returns once every autostart instance is confirmed Running (or went Fatal).
    */
    pub async fn load(&self) -> Result<(), ConfigError> {
        let config = Config::load(&self.config_path)?;
        info!(
            path = %self.config_path.display(),
            programs = config.programs.len(),
            "configuration loaded"
        );

        let mut autostart = Vec::new();
        for (name, spec) in &config.programs {
            let instances = build_instances(name, spec);
            self.table.insert(name, instances.clone()).await;
            if spec.autostart {
                autostart.push((name.clone(), instances));
            }
        }
        *self.specs.write().await = config.programs;

        let starts = autostart
            .iter()
            .map(|(name, instances)| start_instances(name, instances));
        join_all(starts).await;
        Ok(())
    }

    pub async fn start_program(&self, name: &str) -> Result<String, ControlError> {
        let instances = self.named(name).await?;
        Ok(start_instances(name, &instances).await.join("\n"))
    }

    pub async fn stop_program(&self, name: &str) -> Result<String, ControlError> {
        let instances = self.named(name).await?;
        Ok(stop_instances(name, &instances).await.join("\n"))
    }

    /// Stop and start run under one lock acquisition per instance, so
    /// neither the monitor nor another command can slip in between.
    pub async fn restart_program(&self, name: &str) -> Result<String, ControlError> {
        let instances = self.named(name).await?;
        let restarts = instances.iter().map(|inst| {
            let inst = inst.clone();
            async move {
                let mut guard = inst.lock().await;
                let index = guard.index;
                let outcome = guard.restart().await;
                start_line(name, index, &outcome)
            }
        });
        Ok(join_all(restarts).await.join("\n"))
    }

    pub async fn start_all(&self) -> String {
        let snapshot = self.table.snapshot().await;
        if snapshot.is_empty() {
            return "no programs configured".to_string();
        }
        let starts = snapshot
            .iter()
            .map(|(name, instances)| start_instances(name, instances));
        let lines: Vec<String> = join_all(starts).await.into_iter().flatten().collect();
        lines.join("\n")
    }

    pub async fn stop_all(&self) -> String {
        let snapshot = self.table.snapshot().await;
        if snapshot.is_empty() {
            return "no programs configured".to_string();
        }
        let stops = snapshot
            .iter()
            .map(|(name, instances)| stop_instances(name, instances));
        let lines: Vec<String> = join_all(stops).await.into_iter().flatten().collect();
        lines.join("\n")
    }

    /// Point-in-time view of every instance. An instance whose lock is
    /// held is mid-operation; reported as busy rather than waited for.
    pub async fn status(&self) -> String {
        let snapshot = self.table.snapshot().await;
        if snapshot.is_empty() {
            return "no programs configured".to_string();
        }
        let mut lines = Vec::new();
        for (name, instances) in snapshot {
            for (index, inst) in instances.iter().enumerate() {
                let slot = format!("{name}:{index}");
                let line = match inst.try_lock() {
                    Ok(guard) => format!("{slot:<20} {}", guard.describe()),
                    Err(_) => format!("{slot:<20} busy (operation in progress)"),
                };
                lines.push(line);
            }
        }
        lines.join("\n")
    }

    /// The `config` command: effective specs rendered back as YAML.
    /// An empty name list dumps every program.
    pub async fn spec_dump(&self, names: &[String]) -> String {
        let specs = self.specs.read().await;
        if specs.is_empty() && names.is_empty() {
            return "no programs configured".to_string();
        }
        let wanted: Vec<String> = if names.is_empty() {
            specs.keys().cloned().collect()
        } else {
            names.to_vec()
        };

        let mut selection = BTreeMap::new();
        let mut missing = Vec::new();
        for name in &wanted {
            match specs.get(name) {
                Some(spec) => {
                    selection.insert(name.clone(), spec);
                }
                None => missing.push(format!("no such program in config: `{name}`")),
            }
        }

        let mut out = String::new();
        if !selection.is_empty() {
            match serde_yaml::to_string(&selection) {
                Ok(yaml) => out.push_str(yaml.trim_end()),
                Err(e) => out.push_str(&format!("cannot render configuration: {e}")),
            }
        }
        for line in missing {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&line);
        }
        out
    }

    pub async fn attach(&self, name: &str, index: usize) -> Result<String, ControlError> {
        if !self.table.contains(name).await {
            return Err(ControlError::UnknownProgram(name.to_string()));
        }
        let inst = self
            .table
            .instance(name, index)
            .await
            .ok_or_else(|| ControlError::NoSuchInstance { name: name.to_string(), index })?;
        let guard = inst.lock().await;
        guard.tail_stdout()
    }

    /*
        @@@
        @reload();
        . Re-parses the config file; a parse or validation error leaves the live table untouched and is only reported.
        . Diffs old vs new spec maps, then applies: removed programs are stopped and dropped, added ones created (started when autostart says so), changed ones resized and restarted under the new spec.
        . Programs within a category are reconciled concurrently; the reply summarizes the diff once everything settled.
    */
    pub async fn reload(&self) -> Result<String, ConfigError> {
        let candidate = Config::load(&self.config_path)?;
        let old = self.specs.read().await.clone();
        let diff = diff_specs(&old, &candidate.programs);
        info!(
            removed = diff.removed.len(),
            added = diff.added.len(),
            changed = diff.changed.len(),
            "configuration reloaded"
        );

        *self.specs.write().await = candidate.programs.clone();

        let mut report = Vec::new();

        let removals = diff.removed.iter().map(|name| async move {
            if let Some(instances) = self.table.remove(name).await {
                stop_instances(name, &instances).await;
                info!(program = %name, "removed from configuration, stopped");
            }
            format!("{name}: removed")
        });
        report.extend(join_all(removals).await);

        let additions = diff.added.iter().map(|name| {
            let spec = &candidate.programs[name];
            async move {
                let instances = build_instances(name, spec);
                self.table.insert(name, instances.clone()).await;
                info!(program = %name, instances = instances.len(), "added from configuration");
                if spec.autostart {
                    start_instances(name, &instances).await;
                }
                format!("{name}: added")
            }
        });
        report.extend(join_all(additions).await);

        let changes = diff.changed.iter().map(|name| {
            let spec = &candidate.programs[name];
            async move {
                self.apply_changed(name, spec).await;
                format!("{name}: updated")
            }
        });
        report.extend(join_all(changes).await);

        if report.is_empty() {
            report.push("nothing changed".to_string());
        }
        Ok(report.join("\n"))
    }

    /*
        @@@
        @apply_changed();
        . Scale down first: the excess trailing instances are detached from the table (unreachable from then on) and stopped.
        . Survivors get the new spec and a restart under it, whatever state they were in.
        . Scale up last: additional trailing indices are created and started unconditionally.
    */
    async fn apply_changed(&self, name: &str, spec: &ProgramSpec) {
        let excess = self.table.truncate(name, spec.numprocs).await;
        if !excess.is_empty() {
            info!(program = %name, dropped = excess.len(), "scaling down");
            stop_instances(name, &excess).await;
        }

        let survivors = self.table.program(name).await.unwrap_or_default();
        let restarts = survivors.iter().map(|inst| {
            let inst = inst.clone();
            let spec = spec.clone();
            async move {
                let mut guard = inst.lock().await;
                guard.spec = spec;
                guard.restart().await;
            }
        });
        join_all(restarts).await;

        if spec.numprocs > survivors.len() {
            let extra: Vec<SharedInstance> = (survivors.len()..spec.numprocs)
                .map(|index| ProcessInstance::shared(name, index, spec.clone()))
                .collect();
            self.table.extend(name, extra.clone()).await;
            info!(program = %name, added = extra.len(), "scaling up");
            start_instances(name, &extra).await;
        }
    }

    async fn named(&self, name: &str) -> Result<Vec<SharedInstance>, ControlError> {
        self.table
            .program(name)
            .await
            .ok_or_else(|| ControlError::UnknownProgram(name.to_string()))
    }
}

fn build_instances(name: &str, spec: &ProgramSpec) -> Vec<SharedInstance> {
    (0..spec.numprocs)
        .map(|index| ProcessInstance::shared(name, index, spec.clone()))
        .collect()
}

async fn start_instances(name: &str, instances: &[SharedInstance]) -> Vec<String> {
    let starts = instances.iter().map(|inst| {
        let inst = inst.clone();
        async move {
            let mut guard = inst.lock().await;
            let index = guard.index;
            let outcome = guard.start().await;
            start_line(name, index, &outcome)
        }
    });
    join_all(starts).await
}

async fn stop_instances(name: &str, instances: &[SharedInstance]) -> Vec<String> {
    let stops = instances.iter().map(|inst| {
        let inst = inst.clone();
        async move {
            let mut guard = inst.lock().await;
            let index = guard.index;
            let outcome = guard.stop().await;
            stop_line(name, index, &outcome)
        }
    });
    join_all(stops).await
}

fn start_line(name: &str, index: usize, outcome: &StartOutcome) -> String {
    match outcome {
        StartOutcome::Started { pid } => format!("{name}:{index} started (pid {pid})"),
        StartOutcome::AlreadyActive => format!("{name}:{index} already running"),
        StartOutcome::Fatal { attempts } => {
            format!("{name}:{index} failed to start after {attempts} attempts")
        }
    }
}

fn stop_line(name: &str, index: usize, outcome: &StopOutcome) -> String {
    match outcome {
        StopOutcome::Stopped { exit_code } => {
            format!("{name}:{index} stopped (exit code {exit_code})")
        }
        StopOutcome::Killed => format!("{name}:{index} killed after grace period"),
        StopOutcome::NotRunning => format!("{name}:{index} not running"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn specs(text: &str) -> HashMap<String, ProgramSpec> {
        Config::parse(text).unwrap().programs
    }

    #[test]
    fn diff_partitions_programs() {
        let old = specs(
            "programs:\n\
             \x20 kept:\n    cmd: \"sleep 1\"\n\
             \x20 gone:\n    cmd: \"sleep 1\"\n\
             \x20 tuned:\n    cmd: \"sleep 1\"\n",
        );
        let new = specs(
            "programs:\n\
             \x20 kept:\n    cmd: \"sleep 1\"\n\
             \x20 tuned:\n    cmd: \"sleep 1\"\n    stoptime: 5\n\
             \x20 fresh:\n    cmd: \"sleep 1\"\n",
        );

        let diff = diff_specs(&old, &new);
        assert_eq!(diff.removed, vec!["gone"]);
        assert_eq!(diff.added, vec!["fresh"]);
        assert_eq!(diff.changed, vec!["tuned"]);
    }

    #[test]
    fn identical_maps_diff_to_nothing() {
        let old = specs("programs:\n  a:\n    cmd: \"true\"\n");
        let diff = diff_specs(&old, &old.clone());
        assert_eq!(diff, ReloadDiff::default());
    }

    #[test]
    fn numprocs_change_counts_as_changed() {
        let old = specs("programs:\n  a:\n    cmd: \"true\"\n    numprocs: 2\n");
        let new = specs("programs:\n  a:\n    cmd: \"true\"\n    numprocs: 4\n");
        let diff = diff_specs(&old, &new);
        assert_eq!(diff.changed, vec!["a"]);
        assert!(diff.removed.is_empty() && diff.added.is_empty());
    }
}

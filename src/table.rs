use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::process::SharedInstance;

// Shared map of supervised programs.
// The lock guards only the map structure; instance runtime state lives
// behind each instance's own Mutex. Callers clone the Arcs out and
// release this lock before any blocking per-instance work, so the table
// is never held across a grace period or confirmation window.
pub struct ProcessTable {
    programs: RwLock<HashMap<String, Vec<SharedInstance>>>,
}

impl ProcessTable {
    pub fn new() -> ProcessTable {
        ProcessTable {
            programs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.programs.read().await.contains_key(name)
    }

    /// Snapshot of one program's instances.
    pub async fn program(&self, name: &str) -> Option<Vec<SharedInstance>> {
        self.programs.read().await.get(name).cloned()
    }

    pub async fn instance(&self, name: &str, index: usize) -> Option<SharedInstance> {
        self.programs
            .read()
            .await
            .get(name)
            .and_then(|instances| instances.get(index))
            .cloned()
    }

    /// Snapshot of the whole table, sorted by program name so status
    /// output and reload logs come out in a stable order.
    pub async fn snapshot(&self) -> Vec<(String, Vec<SharedInstance>)> {
        let map = self.programs.read().await;
        let mut entries: Vec<(String, Vec<SharedInstance>)> = map
            .iter()
            .map(|(name, instances)| (name.clone(), instances.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.programs.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn insert(&self, name: &str, instances: Vec<SharedInstance>) {
        self.programs.write().await.insert(name.to_string(), instances);
    }

    pub async fn remove(&self, name: &str) -> Option<Vec<SharedInstance>> {
        self.programs.write().await.remove(name)
    }

    /// Appends new trailing instances (numprocs scaled up).
    pub async fn extend(&self, name: &str, extra: Vec<SharedInstance>) {
        if let Some(instances) = self.programs.write().await.get_mut(name) {
            instances.extend(extra);
        }
    }

    /// Detaches the trailing instances beyond `keep` (numprocs scaled
    /// down) and hands them back for stopping. Once detached they are
    /// unreachable from commands and the monitor alike.
    pub async fn truncate(&self, name: &str, keep: usize) -> Vec<SharedInstance> {
        match self.programs.write().await.get_mut(name) {
            Some(instances) if instances.len() > keep => instances.split_off(keep),
            _ => Vec::new(),
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        ProcessTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OneOrMany, ProgramSpec, RestartPolicy};
    use crate::process::ProcessInstance;
    use std::sync::Arc;

    fn spec() -> ProgramSpec {
        ProgramSpec {
            cmd: "true".to_string(),
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

    fn instances(name: &str, n: usize) -> Vec<SharedInstance> {
        (0..n).map(|i| ProcessInstance::shared(name, i, spec())).collect()
    }

    #[tokio::test]
    async fn snapshot_is_sorted_by_name() {
        let table = ProcessTable::new();
        table.insert("zeta", instances("zeta", 1)).await;
        table.insert("alpha", instances("alpha", 2)).await;

        let snap = table.snapshot().await;
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].0, "alpha");
        assert_eq!(snap[0].1.len(), 2);
        assert_eq!(snap[1].0, "zeta");
        assert_eq!(table.names().await, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn truncate_detaches_the_tail() {
        let table = ProcessTable::new();
        table.insert("demo", instances("demo", 4)).await;

        let tail = table.truncate("demo", 2).await;
        assert_eq!(tail.len(), 2);
        let kept = table.program("demo").await.unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(tail[0].lock().await.index, 2);
        assert_eq!(tail[1].lock().await.index, 3);

        // Truncating to the current size or beyond detaches nothing.
        assert!(table.truncate("demo", 2).await.is_empty());
        assert!(table.truncate("demo", 5).await.is_empty());
    }

    #[tokio::test]
    async fn program_snapshot_shares_the_instances() {
        let table = ProcessTable::new();
        table.insert("demo", instances("demo", 1)).await;

        let a = table.program("demo").await.unwrap();
        let b = table.instance("demo", 0).await.unwrap();
        assert!(Arc::ptr_eq(&a[0], &b));
        assert!(table.instance("demo", 1).await.is_none());
        assert!(table.program("ghost").await.is_none());
    }
}

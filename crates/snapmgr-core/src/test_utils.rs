//! Scriptable in-memory management API for tests.
//!
//! `FakeApi` stands in for a real management server client: servers hold VMs,
//! VMs hold snapshot trees, and submitted operations become tasks that run
//! for a scripted number of polls before succeeding or failing. Connect,
//! submit, and poll failures are all injectable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use snapmgr_common::{
    CreateSpec, ManagementApi, Result, SessionRef, SnapError, SnapshotNode, SnapshotRef, TaskRef,
    TaskState, TaskStatus, VmRef, VmSummary,
};
use uuid::Uuid;

/// Builds an owned snapshot node with a generated ref.
pub fn node(name: &str, created: &str, children: Vec<SnapshotNode>) -> SnapshotNode {
    SnapshotNode {
        snapshot: SnapshotRef(Uuid::new_v4().to_string()),
        name: name.to_string(),
        created: created.to_string(),
        children,
    }
}

/// How a scripted task behaves once its running polls are exhausted.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Succeed,
    Fail(String),
    /// Reading the handle itself errors, as a transient monitoring failure
    /// would.
    PollError(String),
}

/// Per-key task behavior: `running` yields one progress sample per poll
/// before the outcome applies. Creates are keyed by VM name, deletes by
/// snapshot ref.
#[derive(Debug, Clone)]
pub struct TaskScript {
    pub running: Vec<u8>,
    pub outcome: TaskOutcome,
}

impl Default for TaskScript {
    fn default() -> Self {
        Self {
            running: Vec::new(),
            outcome: TaskOutcome::Succeed,
        }
    }
}

enum Effect {
    AddSnapshot { hostname: String, vm: VmRef, node: SnapshotNode },
    RemoveSnapshot { snapshot: SnapshotRef },
}

struct FakeTask {
    session: String,
    remaining: VecDeque<u8>,
    outcome: TaskOutcome,
    effect: Option<Effect>,
}

struct FakeVm {
    vm: VmRef,
    name: String,
    roots: Vec<SnapshotNode>,
}

struct FakeServer {
    hostname: String,
    vms: Vec<FakeVm>,
}

#[derive(Default)]
struct Inner {
    servers: Vec<FakeServer>,
    sessions: HashMap<String, String>,
    refused: HashSet<String>,
    dead_sessions: HashSet<String>,
    fail_submit: HashSet<String>,
    scripts: HashMap<String, TaskScript>,
    tasks: HashMap<String, FakeTask>,
    total_polls: u64,
}

#[derive(Default)]
pub struct FakeApi {
    inner: Mutex<Inner>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_server(&self, hostname: &str) {
        let mut inner = self.lock();
        if !inner.servers.iter().any(|s| s.hostname == hostname) {
            inner.servers.push(FakeServer {
                hostname: hostname.to_string(),
                vms: Vec::new(),
            });
        }
    }

    pub fn add_vm(&self, hostname: &str, name: &str) -> VmRef {
        let vm = VmRef(Uuid::new_v4().to_string());
        let mut inner = self.lock();
        let server = inner
            .servers
            .iter_mut()
            .find(|s| s.hostname == hostname)
            .expect("unknown fake server");
        server.vms.push(FakeVm {
            vm: vm.clone(),
            name: name.to_string(),
            roots: Vec::new(),
        });
        vm
    }

    pub fn set_tree(&self, hostname: &str, vm: &VmRef, roots: Vec<SnapshotNode>) {
        let mut inner = self.lock();
        let server = inner
            .servers
            .iter_mut()
            .find(|s| s.hostname == hostname)
            .expect("unknown fake server");
        let entry = server
            .vms
            .iter_mut()
            .find(|v| v.vm == *vm)
            .expect("unknown fake vm");
        entry.roots = roots;
    }

    /// Subsequent connects to this hostname fail with an auth error.
    pub fn refuse_connect(&self, hostname: &str) {
        self.lock().refused.insert(hostname.to_string());
    }

    pub fn allow_connect(&self, hostname: &str) {
        self.lock().refused.remove(hostname);
    }

    /// The session stops answering health checks and API calls.
    pub fn kill_session(&self, session: &SessionRef) {
        self.lock().dead_sessions.insert(session.0.clone());
    }

    /// Submissions keyed by this VM name (creates) or snapshot ref (deletes)
    /// fail immediately.
    pub fn fail_submit(&self, key: &str) {
        self.lock().fail_submit.insert(key.to_string());
    }

    /// Scripts the task spawned for this key. Unscripted tasks succeed on
    /// their first poll.
    pub fn script_task(&self, key: &str, script: TaskScript) {
        self.lock().scripts.insert(key.to_string(), script);
    }

    pub fn total_polls(&self) -> u64 {
        self.lock().total_polls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("FakeApi lock poisoned")
    }
}

fn prune(nodes: &mut Vec<SnapshotNode>, target: &SnapshotRef) -> bool {
    if let Some(index) = nodes.iter().position(|n| n.snapshot == *target) {
        nodes.remove(index);
        return true;
    }
    for child in nodes.iter_mut() {
        if prune(&mut child.children, target) {
            return true;
        }
    }
    false
}

impl Inner {
    fn hostname_for(&self, session: &SessionRef) -> Result<String> {
        if self.dead_sessions.contains(&session.0) {
            return Err(SnapError::Connection("session is not authenticated".to_string()));
        }
        self.sessions
            .get(&session.0)
            .cloned()
            .ok_or_else(|| SnapError::Connection("unknown session".to_string()))
    }

    fn spawn_task(&mut self, session: &SessionRef, key: &str, effect: Option<Effect>) -> TaskRef {
        let script = self.scripts.get(key).cloned().unwrap_or_default();
        let task = TaskRef(Uuid::new_v4().to_string());
        self.tasks.insert(
            task.0.clone(),
            FakeTask {
                session: session.0.clone(),
                remaining: script.running.into(),
                outcome: script.outcome,
                effect,
            },
        );
        task
    }

    fn apply_effect(&mut self, effect: Effect) {
        match effect {
            Effect::AddSnapshot { hostname, vm, node } => {
                if let Some(server) = self.servers.iter_mut().find(|s| s.hostname == hostname) {
                    if let Some(entry) = server.vms.iter_mut().find(|v| v.vm == vm) {
                        entry.roots.push(node);
                    }
                }
            }
            Effect::RemoveSnapshot { snapshot } => {
                for server in self.servers.iter_mut() {
                    for entry in server.vms.iter_mut() {
                        if prune(&mut entry.roots, &snapshot) {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ManagementApi for FakeApi {
    async fn connect(&self, hostname: &str, _username: &str, _password: &str)
        -> Result<SessionRef>
    {
        let mut inner = self.lock();
        if inner.refused.contains(hostname) {
            return Err(SnapError::Connection(format!(
                "authentication failed for {hostname}"
            )));
        }
        if !inner.servers.iter().any(|s| s.hostname == hostname) {
            inner.servers.push(FakeServer {
                hostname: hostname.to_string(),
                vms: Vec::new(),
            });
        }
        let session = SessionRef(Uuid::new_v4().to_string());
        inner.sessions.insert(session.0.clone(), hostname.to_string());
        Ok(session)
    }

    async fn disconnect(&self, session: &SessionRef) -> Result<()> {
        self.lock().sessions.remove(&session.0);
        Ok(())
    }

    async fn health_check(&self, session: &SessionRef) -> bool {
        let inner = self.lock();
        inner.sessions.contains_key(&session.0) && !inner.dead_sessions.contains(&session.0)
    }

    async fn enumerate_vms(&self, session: &SessionRef) -> Result<Vec<VmSummary>> {
        let inner = self.lock();
        let hostname = inner.hostname_for(session)?;
        let server = inner
            .servers
            .iter()
            .find(|s| s.hostname == hostname)
            .ok_or_else(|| SnapError::Connection(format!("no such server: {hostname}")))?;
        Ok(server
            .vms
            .iter()
            .map(|v| VmSummary {
                vm: v.vm.clone(),
                name: v.name.clone(),
            })
            .collect())
    }

    async fn snapshot_roots(&self, session: &SessionRef, vm: &VmRef)
        -> Result<Vec<SnapshotNode>>
    {
        let inner = self.lock();
        let hostname = inner.hostname_for(session)?;
        let server = inner
            .servers
            .iter()
            .find(|s| s.hostname == hostname)
            .ok_or_else(|| SnapError::Connection(format!("no such server: {hostname}")))?;
        let entry = server
            .vms
            .iter()
            .find(|v| v.vm == *vm)
            .ok_or_else(|| SnapError::NotFound(format!("vm {vm}")))?;
        Ok(entry.roots.clone())
    }

    async fn submit_create_snapshot(
        &self,
        session: &SessionRef,
        vm: &VmRef,
        spec: &CreateSpec,
    ) -> Result<TaskRef> {
        let mut inner = self.lock();
        let hostname = inner.hostname_for(session)?;
        let name = {
            let server = inner
                .servers
                .iter()
                .find(|s| s.hostname == hostname)
                .ok_or_else(|| SnapError::Connection(format!("no such server: {hostname}")))?;
            server
                .vms
                .iter()
                .find(|v| v.vm == *vm)
                .map(|v| v.name.clone())
                .ok_or_else(|| SnapError::NotFound(format!("vm {vm}")))?
        };
        if inner.fail_submit.contains(&name) {
            return Err(SnapError::Submission {
                target: name,
                reason: "vm is in an invalid state".to_string(),
            });
        }
        let effect = Effect::AddSnapshot {
            hostname,
            vm: vm.clone(),
            node: node(
                &spec.name,
                &Utc::now().format("%Y-%m-%d %H:%M").to_string(),
                Vec::new(),
            ),
        };
        Ok(inner.spawn_task(session, &name, Some(effect)))
    }

    async fn submit_delete_snapshot(
        &self,
        session: &SessionRef,
        snapshot: &SnapshotRef,
    ) -> Result<TaskRef> {
        let mut inner = self.lock();
        inner.hostname_for(session)?;
        if inner.fail_submit.contains(&snapshot.0) {
            return Err(SnapError::Submission {
                target: snapshot.0.clone(),
                reason: "snapshot is busy".to_string(),
            });
        }
        let effect = Effect::RemoveSnapshot {
            snapshot: snapshot.clone(),
        };
        let key = snapshot.0.clone();
        Ok(inner.spawn_task(session, &key, Some(effect)))
    }

    async fn poll_task(&self, session: &SessionRef, task: &TaskRef) -> Result<TaskStatus> {
        let mut inner = self.lock();
        inner.total_polls += 1;
        if inner.dead_sessions.contains(&session.0) {
            return Err(SnapError::Connection("session is not authenticated".to_string()));
        }
        let entry = inner
            .tasks
            .get_mut(&task.0)
            .ok_or_else(|| SnapError::NotFound(format!("task {task}")))?;
        debug_assert_eq!(entry.session, session.0);

        if let Some(progress) = entry.remaining.pop_front() {
            return Ok(TaskStatus {
                state: TaskState::Running,
                progress: Some(progress),
                error: None,
            });
        }

        let outcome = entry.outcome.clone();
        match outcome {
            TaskOutcome::Succeed => {
                let effect = inner
                    .tasks
                    .get_mut(&task.0)
                    .and_then(|t| t.effect.take());
                if let Some(effect) = effect {
                    inner.apply_effect(effect);
                }
                Ok(TaskStatus {
                    state: TaskState::Succeeded,
                    progress: Some(100),
                    error: None,
                })
            }
            TaskOutcome::Fail(message) => Ok(TaskStatus {
                state: TaskState::Failed,
                progress: None,
                error: Some(message),
            }),
            TaskOutcome::PollError(message) => Err(SnapError::Connection(message)),
        }
    }
}

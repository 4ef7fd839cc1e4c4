//! Background workflows: fetch, create, and delete snapshots.
//!
//! One workflow runs at a time per session controller. Workers communicate
//! with the interactive surface exclusively through one-way `WorkflowEvent`
//! emission, always terminated by `Done`; the controller is the single owner
//! of the connection registry and the snapshot index and applies events on
//! its own update cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use snapmgr_common::{
    CreateSpec, ManagementApi, Result, SessionRef, SnapError, SnapshotIdentity, SnapshotRecord,
    WorkflowEvent,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::classify::{chain_status, parse_created};
use crate::connection::ConnectionRegistry;
use crate::dispatch::{Dispatcher, ResolvedVm, DEFAULT_BATCH_SIZE};
use crate::poller::{PollItem, PollerEvent, TaskPoller, POLL_INTERVAL};
use crate::walker::flatten_tree;

/// Tuning knobs for background workflows. Tests shrink the poll interval.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Case-insensitive substring filter on snapshot names; `None` fetches
    /// every snapshot. Defaults to the patch-cycle naming convention.
    pub name_filter: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            name_filter: Some("patch".to_string()),
        }
    }
}

/// Receiver side of one running workflow. Dropping it stops observation but
/// does not cancel operations already submitted to the remote side.
pub struct WorkflowHandle {
    pub events: UnboundedReceiver<WorkflowEvent>,
}

impl WorkflowHandle {
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        self.events.recv().await
    }
}

/// Releases the busy flag when the worker finishes, however it finishes.
struct BusyGuard {
    flag: Arc<AtomicBool>,
}

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(Self {
                flag: Arc::clone(flag),
            })
        } else {
            Err(SnapError::WorkflowBusy)
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Single owner of the connection registry and the in-memory snapshot index.
/// Background workers never touch either; they emit events and the embedding
/// surface feeds them back through [`SessionController::apply_event`].
pub struct SessionController {
    api: Arc<dyn ManagementApi>,
    registry: ConnectionRegistry,
    snapshots: HashMap<SnapshotIdentity, SnapshotRecord>,
    busy: Arc<AtomicBool>,
    config: WorkflowConfig,
}

impl SessionController {
    pub fn new(api: Arc<dyn ManagementApi>) -> Self {
        Self::with_config(api, WorkflowConfig::default())
    }

    pub fn with_config(api: Arc<dyn ManagementApi>, config: WorkflowConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(Arc::clone(&api)),
            api,
            snapshots: HashMap::new(),
            busy: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn snapshots(&self) -> &HashMap<SnapshotIdentity, SnapshotRecord> {
        &self.snapshots
    }

    pub fn get(&self, identity: &SnapshotIdentity) -> Option<&SnapshotRecord> {
        self.snapshots.get(identity)
    }

    pub async fn connect(&mut self, hostname: &str, username: &str, password: &str) -> Result<()> {
        self.registry.connect(hostname, username, password).await
    }

    /// Connects to every saved server in turn, returning per-host failures.
    /// One refused server never blocks the others.
    pub async fn connect_all<I>(&mut self, servers: I) -> Vec<(String, SnapError)>
    where
        I: IntoIterator<Item = (String, String, String)>,
    {
        let mut failures = Vec::new();
        for (hostname, username, password) in servers {
            if let Err(e) = self.registry.connect(&hostname, &username, &password).await {
                warn!(%hostname, error = %e, "auto-connect failed");
                failures.push((hostname, e));
            }
        }
        failures
    }

    pub async fn clear_connections(&mut self) {
        self.registry.disconnect_all().await;
        self.snapshots.clear();
    }

    /// Periodic health sweep, skipped while a workflow is outstanding so an
    /// in-flight operation never sees its session replaced mid-poll.
    pub async fn health_sweep(&mut self) {
        if self.is_busy() {
            debug!("workflow active, skipping health sweep");
            return;
        }
        self.registry.health_sweep().await;
    }

    /// Applies a worker event to the owned snapshot index.
    pub fn apply_event(&mut self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::SnapshotFound { record } => {
                self.snapshots.insert(record.identity(), record.clone());
            }
            WorkflowEvent::ItemCompleted { identity } => {
                self.snapshots.remove(identity);
            }
            _ => {}
        }
    }

    pub fn start_fetch(&mut self, options: FetchOptions) -> Result<WorkflowHandle> {
        if self.registry.is_empty() {
            return Err(SnapError::Connection("no active connections".to_string()));
        }
        let guard = BusyGuard::acquire(&self.busy)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let api = Arc::clone(&self.api);
        let sessions = self.registry.sessions();
        tokio::spawn(async move {
            {
                let _guard = guard;
                run_fetch(api, sessions, options, &tx).await;
            }
            // Busy flag released before Done so the observer can start the
            // next workflow as soon as it sees the terminal event.
            let _ = tx.send(WorkflowEvent::Done);
        });
        Ok(WorkflowHandle { events: rx })
    }

    pub fn start_create(&mut self, targets: Vec<String>, spec: CreateSpec)
        -> Result<WorkflowHandle>
    {
        if self.registry.is_empty() {
            return Err(SnapError::Connection("no active connections".to_string()));
        }
        if targets.is_empty() {
            return Err(SnapError::NotFound("no target names provided".to_string()));
        }
        let guard = BusyGuard::acquire(&self.busy)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let api = Arc::clone(&self.api);
        let sessions = self.registry.sessions();
        let config = self.config.clone();
        tokio::spawn(async move {
            {
                let _guard = guard;
                run_create(api, sessions, targets, spec, config, &tx).await;
            }
            // Busy flag released before Done so the observer can start the
            // next workflow as soon as it sees the terminal event.
            let _ = tx.send(WorkflowEvent::Done);
        });
        Ok(WorkflowHandle { events: rx })
    }

    pub fn start_delete(&mut self, selected: Vec<SnapshotRecord>) -> Result<WorkflowHandle> {
        if self.registry.is_empty() {
            return Err(SnapError::Connection("no active connections".to_string()));
        }
        if selected.is_empty() {
            return Err(SnapError::NotFound("no snapshots selected".to_string()));
        }
        let guard = BusyGuard::acquire(&self.busy)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let api = Arc::clone(&self.api);
        let sessions = self.registry.sessions();
        let interval = self.config.poll_interval;
        tokio::spawn(async move {
            {
                let _guard = guard;
                run_delete(api, sessions, selected, interval, &tx).await;
            }
            // Busy flag released before Done so the observer can start the
            // next workflow as soon as it sees the terminal event.
            let _ = tx.send(WorkflowEvent::Done);
        });
        Ok(WorkflowHandle { events: rx })
    }
}

fn send(tx: &UnboundedSender<WorkflowEvent>, event: WorkflowEvent) {
    // The observer may have gone away; the remote work continues regardless.
    let _ = tx.send(event);
}

async fn run_fetch(
    api: Arc<dyn ManagementApi>,
    sessions: Vec<(String, SessionRef)>,
    options: FetchOptions,
    tx: &UnboundedSender<WorkflowEvent>,
) {
    let filter = options.name_filter.map(|f| f.to_lowercase());

    for (hostname, session) in sessions {
        send(
            tx,
            WorkflowEvent::Progress {
                message: format!("Fetching from {hostname}..."),
            },
        );

        let vms = match api.enumerate_vms(&session).await {
            Ok(vms) => vms,
            Err(e) => {
                // Isolated per server; the other connections still get
                // fetched.
                send(
                    tx,
                    WorkflowEvent::Error {
                        message: format!("Failed to fetch from {hostname}: {e}"),
                    },
                );
                continue;
            }
        };

        for vm in vms {
            let roots = match api.snapshot_roots(&session, &vm.vm).await {
                Ok(roots) => roots,
                Err(e) => {
                    send(
                        tx,
                        WorkflowEvent::ItemFailed {
                            target: vm.name.clone(),
                            message: e.to_string(),
                        },
                    );
                    continue;
                }
            };

            let flat = match flatten_tree(&roots) {
                Ok(flat) => flat,
                Err(e) => {
                    // Fatal for this VM's fetch only.
                    send(
                        tx,
                        WorkflowEvent::ItemFailed {
                            target: vm.name.clone(),
                            message: e.to_string(),
                        },
                    );
                    continue;
                }
            };

            for snap in flat {
                if let Some(filter) = &filter {
                    if !snap.name.to_lowercase().contains(filter) {
                        continue;
                    }
                }
                let record = SnapshotRecord {
                    vm_name: vm.name.clone(),
                    server: hostname.clone(),
                    name: snap.name,
                    created_at: parse_created(&snap.created).map(|t| t.and_utc()),
                    created: snap.created,
                    snapshot: snap.snapshot,
                    vm: vm.vm.clone(),
                    has_children: snap.has_children,
                    is_child: snap.is_child,
                };
                send(tx, WorkflowEvent::SnapshotFound { record });
            }
        }
    }
}

async fn run_create(
    api: Arc<dyn ManagementApi>,
    sessions: Vec<(String, SessionRef)>,
    targets: Vec<String>,
    spec: CreateSpec,
    config: WorkflowConfig,
    tx: &UnboundedSender<WorkflowEvent>,
) {
    let total = targets.len();
    send(
        tx,
        WorkflowEvent::Progress {
            message: "Locating VMs across servers...".to_string(),
        },
    );

    let dispatcher = Dispatcher::with_batch_size(config.batch_size);
    let outcome = dispatcher.resolve(api.as_ref(), &sessions, &targets).await;

    let mut failures: Vec<String> = Vec::new();
    for name in &outcome.not_found {
        let message = format!("Server not found: {name}");
        send(
            tx,
            WorkflowEvent::ItemFailed {
                target: name.clone(),
                message: message.clone(),
            },
        );
        failures.push(message);
    }

    if outcome.groups.is_empty() {
        send(
            tx,
            WorkflowEvent::Error {
                message: "No VMs were found on any connected server".to_string(),
            },
        );
        return;
    }

    send(
        tx,
        WorkflowEvent::Progress {
            message: format!(
                "Found {} VMs. Starting snapshot creation...",
                outcome.resolved_count()
            ),
        },
    );

    let poller = TaskPoller::with_interval(api.as_ref(), config.poll_interval);
    let mut completed_total = 0usize;

    for group in &outcome.groups {
        send(
            tx,
            WorkflowEvent::Progress {
                message: format!("Creating snapshots on {}", group.server),
            },
        );

        for batch in dispatcher.batches(group) {
            let batch_names: Vec<&str> = batch.iter().map(|t| t.name.as_str()).collect();
            send(
                tx,
                WorkflowEvent::Progress {
                    message: format!("Starting batch: {}", batch_names.join(", ")),
                },
            );

            let items: Vec<PollItem<'_, ResolvedVm>> = batch
                .iter()
                .map(|target| PollItem {
                    context: target.clone(),
                    session: group.session.clone(),
                    submit: api.submit_create_snapshot(&group.session, &target.vm, &spec),
                })
                .collect();

            let completed_before = completed_total;
            let report = poller
                .drive(items, |event| match event {
                    PollerEvent::Completed { context } => {
                        send(
                            tx,
                            WorkflowEvent::ItemCompleted {
                                identity: SnapshotIdentity {
                                    server: group.server.clone(),
                                    vm_name: context.name.clone(),
                                    name: spec.name.clone(),
                                },
                            },
                        );
                    }
                    PollerEvent::Failed { context, message } => {
                        failures.push(format!("Failed: {}: {}", context.name, message));
                        send(
                            tx,
                            WorkflowEvent::ItemFailed {
                                target: context.name,
                                message,
                            },
                        );
                    }
                    PollerEvent::Progress {
                        completed,
                        running_progress,
                        ..
                    } => {
                        let overall = completed_before + completed;
                        let percent =
                            (overall as f64 * 100.0 + running_progress as f64) / total as f64;
                        send(
                            tx,
                            WorkflowEvent::AggregateProgress {
                                completed: overall,
                                total,
                                percent,
                                message: format!(
                                    "Progress: {overall}/{total} ({percent:.1}%)"
                                ),
                            },
                        );
                    }
                    PollerEvent::Drained => {}
                })
                .await;

            // Re-read each VM's tree to surface the snapshot that was just
            // created, the same way a fetch would.
            for target in &report.completed {
                match locate_created(api.as_ref(), &group.server, &group.session, target, &spec)
                    .await
                {
                    Some(record) => send(tx, WorkflowEvent::SnapshotFound { record }),
                    None => {
                        debug!(vm = %target.name, "created snapshot not found on re-read")
                    }
                }
            }
            completed_total += report.completed.len();
        }
    }

    if !failures.is_empty() {
        send(
            tx,
            WorkflowEvent::Error {
                message: failures.join("\n"),
            },
        );
    }
    let failed_suffix = if failures.is_empty() {
        String::new()
    } else {
        format!(" ({} failed)", failures.len())
    };
    send(
        tx,
        WorkflowEvent::AggregateProgress {
            completed: completed_total,
            total,
            percent: completed_total as f64 * 100.0 / total as f64,
            message: format!("Completed: {completed_total}/{total} successful{failed_suffix}"),
        },
    );
}

/// Finds the snapshot a successful create task produced: same name, created
/// today on the server's clock.
async fn locate_created(
    api: &dyn ManagementApi,
    server: &str,
    session: &SessionRef,
    target: &ResolvedVm,
    spec: &CreateSpec,
) -> Option<SnapshotRecord> {
    let roots = api.snapshot_roots(session, &target.vm).await.ok()?;
    let flat = flatten_tree(&roots).ok()?;
    let today = Utc::now().date_naive();
    flat.into_iter()
        .find(|s| {
            s.name == spec.name
                && parse_created(&s.created)
                    .map(|t| t.date() == today)
                    .unwrap_or(false)
        })
        .map(|s| SnapshotRecord {
            vm_name: target.name.clone(),
            server: server.to_string(),
            name: s.name,
            created_at: parse_created(&s.created).map(|t| t.and_utc()),
            created: s.created,
            snapshot: s.snapshot,
            vm: target.vm.clone(),
            has_children: s.has_children,
            is_child: s.is_child,
        })
}

async fn run_delete(
    api: Arc<dyn ManagementApi>,
    sessions: Vec<(String, SessionRef)>,
    selected: Vec<SnapshotRecord>,
    interval: Duration,
    tx: &UnboundedSender<WorkflowEvent>,
) {
    let total = selected.len();
    let mut eligible: Vec<(SnapshotRecord, SessionRef)> = Vec::new();

    for record in selected {
        let status = chain_status(record.has_children, record.is_child);
        if !status.eligible_for_deletion() {
            send(
                tx,
                WorkflowEvent::ItemFailed {
                    target: record.identity().to_string(),
                    message: format!("cannot delete: {}", status.label()),
                },
            );
            continue;
        }
        match sessions.iter().find(|(hostname, _)| *hostname == record.server) {
            Some((_, session)) => eligible.push((record, session.clone())),
            None => send(
                tx,
                WorkflowEvent::ItemFailed {
                    target: record.identity().to_string(),
                    message: format!("no active connection to {}", record.server),
                },
            ),
        }
    }

    if eligible.is_empty() {
        send(
            tx,
            WorkflowEvent::Error {
                message: "No snapshots eligible for deletion".to_string(),
            },
        );
        return;
    }

    for (record, _) in &eligible {
        send(
            tx,
            WorkflowEvent::Progress {
                message: format!(
                    "Starting deletion of {} from {}",
                    record.name, record.vm_name
                ),
            },
        );
    }

    let poller = TaskPoller::with_interval(api.as_ref(), interval);
    let items: Vec<PollItem<'_, SnapshotIdentity>> = eligible
        .iter()
        .map(|(record, session)| PollItem {
            context: record.identity(),
            session: session.clone(),
            submit: api.submit_delete_snapshot(session, &record.snapshot),
        })
        .collect();

    poller
        .drive(items, |event| match event {
            PollerEvent::Completed { context } => {
                send(tx, WorkflowEvent::ItemCompleted { identity: context });
            }
            PollerEvent::Failed { context, message } => {
                send(
                    tx,
                    WorkflowEvent::ItemFailed {
                        target: context.to_string(),
                        message: format!("Failed to delete {}: {}", context.name, message),
                    },
                );
            }
            PollerEvent::Progress {
                completed,
                running_progress,
                ..
            } => {
                let percent =
                    (completed as f64 * 100.0 + running_progress as f64) / total as f64;
                send(
                    tx,
                    WorkflowEvent::AggregateProgress {
                        completed,
                        total,
                        percent,
                        message: format!("Deleting snapshots... {percent:.0}%"),
                    },
                );
            }
            PollerEvent::Drained => {}
        })
        .await;

    send(
        tx,
        WorkflowEvent::Progress {
            message: "Deletion complete".to_string(),
        },
    );
}

//! Resolution of target VM names to owning servers, and batch planning.

use snapmgr_common::{ManagementApi, SessionRef, VmRef, VmSummary};
use tracing::warn;

/// Bounds concurrent remote operations against a single management endpoint.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// A target name resolved to exactly one VM on one server.
#[derive(Debug, Clone)]
pub struct ResolvedVm {
    /// Name as requested by the operator.
    pub requested: String,
    /// Canonical name as reported by the owning server.
    pub name: String,
    pub vm: VmRef,
}

/// All targets owned by one server, in resolution order.
#[derive(Debug)]
pub struct ServerGroup {
    pub server: String,
    pub session: SessionRef,
    pub targets: Vec<ResolvedVm>,
}

#[derive(Debug)]
pub struct ResolutionOutcome {
    /// Groups in insertion order of first discovery.
    pub groups: Vec<ServerGroup>,
    /// Names that matched no VM on any connected server.
    pub not_found: Vec<String>,
}

impl ResolutionOutcome {
    pub fn resolved_count(&self) -> usize {
        self.groups.iter().map(|g| g.targets.len()).sum()
    }
}

pub struct Dispatcher {
    batch_size: usize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Resolves each name to at most one VM, scanning connections in the
    /// given order and taking the first case-insensitive match. A server
    /// whose enumeration fails contributes no matches; the failure is
    /// isolated to that server.
    pub async fn resolve(
        &self,
        api: &dyn ManagementApi,
        connections: &[(String, SessionRef)],
        targets: &[String],
    ) -> ResolutionOutcome {
        // One enumeration per server, reused for every target.
        let mut inventories: Vec<(&str, &SessionRef, Vec<VmSummary>)> = Vec::new();
        for (hostname, session) in connections {
            match api.enumerate_vms(session).await {
                Ok(vms) => inventories.push((hostname, session, vms)),
                Err(e) => {
                    warn!(%hostname, error = %e, "could not enumerate VMs, skipping server");
                }
            }
        }

        let mut outcome = ResolutionOutcome {
            groups: Vec::new(),
            not_found: Vec::new(),
        };

        'targets: for target in targets {
            let wanted = target.to_lowercase();
            for (hostname, session, vms) in &inventories {
                if let Some(vm) = vms.iter().find(|v| v.name.to_lowercase() == wanted) {
                    let resolved = ResolvedVm {
                        requested: target.clone(),
                        name: vm.name.clone(),
                        vm: vm.vm.clone(),
                    };
                    match outcome.groups.iter_mut().find(|g| g.server == *hostname) {
                        Some(group) => group.targets.push(resolved),
                        None => outcome.groups.push(ServerGroup {
                            server: hostname.to_string(),
                            session: (*session).clone(),
                            targets: vec![resolved],
                        }),
                    }
                    continue 'targets;
                }
            }
            outcome.not_found.push(target.clone());
        }

        outcome
    }

    /// Fixed-size batches over one server's group, submitted sequentially:
    /// a batch fully resolves before the next one for the same server starts.
    pub fn batches<'g>(&self, group: &'g ServerGroup) -> impl Iterator<Item = &'g [ResolvedVm]> {
        group.targets.chunks(self.batch_size)
    }
}

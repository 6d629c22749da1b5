//! Reconciliation loop
//!
//! Periodically compares desired state with what the supervisor observes and
//! asks the supervisor to close the gap. Faulted instances are left alone
//! until an operator starts them again.

use crate::supervisor::{StopMode, Supervisor};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tenantmux_common::{types::*, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What the reconciler would do for one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    None,
}

/// Decide the action for one instance.
///
/// `tracked` says whether the supervisor holds a process or a pending
/// restart for it; a pending restart is left to its timer.
pub fn plan(instance: &Instance, tracked: bool) -> Action {
    match instance.desired_state {
        DesiredState::Running => {
            if tracked || instance.fault.is_some() {
                Action::None
            } else {
                Action::Start
            }
        }
        DesiredState::Stopped => {
            if tracked || instance.observed_state != ObservedState::Stopped {
                Action::Stop
            } else {
                Action::None
            }
        }
    }
}

/// Reconciler that drives observed state toward desired state
pub struct Reconciler {
    supervisor: Supervisor,
    interval: Duration,
}

impl Reconciler {
    pub fn new(supervisor: Supervisor) -> Self {
        let interval = supervisor.policy().reconcile_interval();
        Self {
            supervisor,
            interval,
        }
    }

    /// Run the reconciliation loop until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Reconciler started (every {}s)", self.interval.as_secs());

        // A pass in progress finishes; cancellation is seen between passes
        while !cancel.is_cancelled() {
            if let Err(e) = self.reconcile_all().await {
                error!("Reconciliation error: {}", e);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Reconciler stopped");
    }

    /// One pass over every instance
    pub async fn reconcile_all(&self) -> Result<()> {
        let instances = self.supervisor.store().list()?;

        for instance in instances {
            let tenant_id = instance.tenant_id.as_str();
            match plan(&instance, self.supervisor.is_tracking(tenant_id)) {
                Action::Start => {
                    debug!(tenant_id, observed = %instance.observed_state, "Reconciling toward running");
                    self.start(tenant_id);
                }
                Action::Stop => {
                    warn!(tenant_id, "Instance should be stopped but is {}", instance.observed_state);
                    if let Err(e) = self.supervisor.stop(tenant_id, StopMode::Graceful).await {
                        warn!(tenant_id, "Failed to stop instance: {}", e);
                    }
                }
                Action::None => {}
            }
        }

        Ok(())
    }

    /// Starts run in the background so one slow health probe does not hold
    /// up the rest of the pass. The supervisor re-checks desired state once
    /// the tenant lock is held.
    fn start(&self, tenant_id: &str) {
        let supervisor = self.supervisor.clone();
        let tenant_id = tenant_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = supervisor.start_if_desired(&tenant_id).await {
                supervisor.record_start_error(&tenant_id, &e);
            }
        });
    }
}

/// Instance whose observed state differs from its desired state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    pub tenant_id: String,
    pub desired: DesiredState,
    pub observed: ObservedState,
    pub fault: Option<String>,
}

/// Detects instances that have not converged
pub struct DriftDetector {
    supervisor: Supervisor,
}

impl DriftDetector {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    pub fn detect_drift(&self) -> Result<Vec<DriftReport>> {
        Ok(self
            .supervisor
            .store()
            .list()?
            .into_iter()
            .filter(|i| {
                let converged = match i.desired_state {
                    DesiredState::Running => i.observed_state == ObservedState::Running,
                    DesiredState::Stopped => i.observed_state == ObservedState::Stopped,
                };
                !converged
            })
            .map(|i| DriftReport {
                tenant_id: i.tenant_id,
                desired: i.desired_state,
                observed: i.observed_state,
                fault: i.fault,
            })
            .collect())
    }
}

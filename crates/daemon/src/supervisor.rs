//! Process supervisor
//!
//! Owns every child process of every tenant instance and is the only writer
//! of observed state. Each child is owned by one run task; operator calls and
//! the reconciler talk to that task through the slot map.
//!
//! Lifecycle of one instance:
//!
//! ```text
//! stopped -> starting -> running -> crashed -> restart_backoff -> starting
//!               |                                    |
//!               +-- health timeout -> crashed        +-- ceiling -> stopped (faulted)
//! ```

use crate::config::{AppConfig, SupervisorConfig};
use crate::launcher::{is_process_alive, kill_pid, ChildProcess, LaunchSpec, Launcher};
use crate::probe;
use crate::state::InstanceStore;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tenantmux_common::{types::*, Error, ErrorKind, Result};
use tokio::sync::{oneshot, watch, Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capability required for observed-state writes to the instance store.
///
/// Only the supervisor constructs one.
pub struct SupervisorToken {
    _private: (),
}

#[cfg(test)]
impl SupervisorToken {
    pub(crate) fn for_tests() -> Self {
        Self { _private: () }
    }
}

/// How a running child should be brought down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM, then SIGKILL after the grace period
    Graceful,
    /// SIGKILL immediately
    Kill,
}

/// Per-tenant runtime handle
enum Slot {
    Process(ProcessSlot),
    Backoff(BackoffSlot),
}

struct ProcessSlot {
    generation: u64,
    stop_tx: Option<oneshot::Sender<StopMode>>,
    state: watch::Receiver<ObservedState>,
    task: Option<JoinHandle<()>>,
}

struct BackoffSlot {
    generation: u64,
    cancel: CancellationToken,
}

enum StartPhase {
    Stop(StopMode),
    Exited(String),
    Healthy,
    TimedOut,
}

/// Supervises tenant application processes
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    store: InstanceStore,
    launcher: Arc<dyn Launcher>,
    app: AppConfig,
    policy: SupervisorConfig,
    token: SupervisorToken,
    locks: DashMap<String, Arc<Mutex<()>>>,
    slots: DashMap<String, Slot>,
    crashes: DashMap<String, VecDeque<Instant>>,
    start_permits: Arc<Semaphore>,
    generation: AtomicU64,
    route_changes: Arc<Notify>,
    closing: CancellationToken,
}

impl Supervisor {
    pub fn new(
        store: InstanceStore,
        launcher: Arc<dyn Launcher>,
        app: AppConfig,
        policy: SupervisorConfig,
    ) -> Self {
        let permits = policy.max_concurrent_starts.max(1);
        Self {
            inner: Arc::new(Inner {
                store,
                launcher,
                app,
                policy,
                token: SupervisorToken { _private: () },
                locks: DashMap::new(),
                slots: DashMap::new(),
                crashes: DashMap::new(),
                start_permits: Arc::new(Semaphore::new(permits)),
                generation: AtomicU64::new(0),
                route_changes: Arc::new(Notify::new()),
                closing: CancellationToken::new(),
            }),
        }
    }

    pub fn store(&self) -> &InstanceStore {
        &self.inner.store
    }

    pub fn policy(&self) -> &SupervisorConfig {
        &self.inner.policy
    }

    /// Notified whenever an instance enters or leaves `running`
    pub fn route_changes(&self) -> Arc<Notify> {
        self.inner.route_changes.clone()
    }

    /// Whether the supervisor holds a process or a pending restart
    pub fn is_tracking(&self, tenant_id: &str) -> bool {
        self.inner.slots.contains_key(tenant_id)
    }

    /// Pids of children this supervisor currently owns
    pub fn supervised_pids(&self) -> Result<Vec<(String, u32)>> {
        Ok(self
            .inner
            .store
            .list()?
            .into_iter()
            .filter(|i| self.is_tracking(&i.tenant_id))
            .filter_map(|i| i.pid.map(|pid| (i.tenant_id, pid)))
            .collect())
    }

    // ========================================================================
    // Operator entry points
    // ========================================================================

    /// Mark the instance desired-running and start it.
    ///
    /// Clears any fault left by an exhausted restart budget.
    pub async fn request_start(&self, tenant_id: &str) -> Result<ObservedState> {
        let store = &self.inner.store;
        store.get(tenant_id)?;
        store.clear_fault(tenant_id)?;
        store.set_desired_state(tenant_id, DesiredState::Running)?;
        self.inner.crashes.remove(tenant_id);
        self.start(tenant_id).await
    }

    /// Like [`request_start`](Self::request_start) but waits until the start
    /// attempt settles (running, or back in backoff / stopped)
    pub async fn request_start_and_wait(&self, tenant_id: &str) -> Result<ObservedState> {
        let state = self.request_start(tenant_id).await?;
        if state != ObservedState::Starting {
            return Ok(state);
        }

        let rx = match self.inner.slots.get(tenant_id).as_deref() {
            Some(Slot::Process(p)) => Some(p.state.clone()),
            _ => None,
        };
        if let Some(mut rx) = rx {
            while *rx.borrow_and_update() == ObservedState::Starting {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
        Ok(self.inner.store.get(tenant_id)?.observed_state)
    }

    /// Mark the instance desired-stopped and stop it
    pub async fn request_stop(&self, tenant_id: &str) -> Result<()> {
        self.inner
            .store
            .set_desired_state(tenant_id, DesiredState::Stopped)?;
        self.stop(tenant_id, StopMode::Graceful).await
    }

    /// Stop and start again; desired state becomes running
    pub async fn restart(&self, tenant_id: &str) -> Result<ObservedState> {
        let store = &self.inner.store;
        store.get(tenant_id)?;
        store.clear_fault(tenant_id)?;
        store.set_desired_state(tenant_id, DesiredState::Running)?;
        self.inner.crashes.remove(tenant_id);

        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;
        self.stop_locked(tenant_id, StopMode::Graceful).await?;
        self.start_locked(tenant_id).await
    }

    /// SIGKILL the child; desired state becomes stopped
    pub async fn force_kill(&self, tenant_id: &str) -> Result<()> {
        self.inner
            .store
            .set_desired_state(tenant_id, DesiredState::Stopped)?;
        self.stop(tenant_id, StopMode::Kill).await
    }

    // ========================================================================
    // Start / stop
    // ========================================================================

    /// Start the instance if it is not already supervised.
    ///
    /// Returns once the child is spawned; health is confirmed by the run
    /// task. Precondition failures are returned without spawning anything.
    pub async fn start(&self, tenant_id: &str) -> Result<ObservedState> {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;
        self.start_locked(tenant_id).await
    }

    /// Start on behalf of the reconciler.
    ///
    /// The plan it acted on may be stale by the time the tenant lock is held,
    /// so desired state and fault are re-read under the lock. Returns `None`
    /// when the instance no longer wants to run.
    pub async fn start_if_desired(&self, tenant_id: &str) -> Result<Option<ObservedState>> {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;
        if self.inner.closing.is_cancelled() {
            return Ok(None);
        }
        let instance = self.inner.store.get(tenant_id)?;
        if instance.desired_state != DesiredState::Running || instance.fault.is_some() {
            debug!(tenant_id, "Skipping start, instance no longer desired running");
            return Ok(None);
        }
        self.start_locked(tenant_id).await.map(Some)
    }

    /// Stop the instance and remove its record under one tenant lock
    pub async fn delete(&self, tenant_id: &str) -> Result<()> {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;
        self.inner
            .store
            .set_desired_state(tenant_id, DesiredState::Stopped)?;
        self.stop_locked(tenant_id, StopMode::Graceful).await?;
        self.inner.store.delete(tenant_id)?;
        self.inner.crashes.remove(tenant_id);
        Ok(())
    }

    /// Stop the child (or cancel a pending restart) and converge to stopped
    pub async fn stop(&self, tenant_id: &str, mode: StopMode) -> Result<()> {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;
        self.stop_locked(tenant_id, mode).await
    }

    async fn start_locked(&self, tenant_id: &str) -> Result<ObservedState> {
        if self.inner.closing.is_cancelled() {
            return Err(Error::Internal("supervisor is shutting down".to_string()));
        }
        let instance = self.inner.store.get(tenant_id)?;

        let pending = match self.inner.slots.get(tenant_id).as_deref() {
            Some(Slot::Process(p)) => return Ok(*p.state.borrow()),
            Some(Slot::Backoff(_)) => true,
            None => false,
        };
        if pending {
            // Explicit start supersedes the restart timer
            if let Some((_, Slot::Backoff(b))) = self.inner.slots.remove(tenant_id) {
                b.cancel.cancel();
            }
        }

        if let Err(e) = self.check_preconditions(&instance) {
            if pending {
                self.transition(tenant_id, ObservedState::Stopped)?;
            }
            return Err(e);
        }

        let permit = self
            .inner
            .start_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        let spec = self.launch_spec(&instance);
        info!(tenant_id, port = instance.port, "Starting instance");
        let child = match self.inner.launcher.spawn(&spec).await {
            Ok(child) => child,
            Err(e) => {
                drop(permit);
                warn!(tenant_id, "Spawn failed: {}", e);
                self.handle_failure(tenant_id, &e.to_string())?;
                return Err(e);
            }
        };

        let pid = child.pid();
        self.inner.store.set_pid(&self.inner.token, tenant_id, pid)?;
        self.transition(tenant_id, ObservedState::Starting)?;

        let generation = self.next_generation();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(ObservedState::Starting);
        self.inner.slots.insert(
            tenant_id.to_string(),
            Slot::Process(ProcessSlot {
                generation,
                stop_tx: Some(stop_tx),
                state: state_rx,
                task: None,
            }),
        );

        let task = tokio::spawn(self.clone().run_child(
            tenant_id.to_string(),
            generation,
            instance.port,
            child,
            stop_rx,
            state_tx,
            permit,
        ));
        if let Some(mut slot) = self.inner.slots.get_mut(tenant_id) {
            if let Slot::Process(p) = slot.value_mut() {
                if p.generation == generation {
                    p.task = Some(task);
                }
            }
        }

        debug!(tenant_id, ?pid, generation, "Instance spawned");
        Ok(ObservedState::Starting)
    }

    async fn stop_locked(&self, tenant_id: &str, mode: StopMode) -> Result<()> {
        self.inner.store.get(tenant_id)?;

        match self.inner.slots.remove(tenant_id) {
            Some((_, Slot::Process(mut p))) => {
                if let Some(tx) = p.stop_tx.take() {
                    let _ = tx.send(mode);
                }
                if let Some(task) = p.task.take() {
                    if let Err(e) = task.await {
                        error!(tenant_id, "Run task failed: {}", e);
                    }
                }
            }
            Some((_, Slot::Backoff(b))) => {
                b.cancel.cancel();
                info!(tenant_id, "Cancelled pending restart");
            }
            None => {}
        }

        // A crash racing this stop may have parked a restart timer
        if let Some((_, Slot::Backoff(b))) = self
            .inner
            .slots
            .remove_if(tenant_id, |_, s| matches!(s, Slot::Backoff(_)))
        {
            b.cancel.cancel();
        }

        self.inner.store.set_pid(&self.inner.token, tenant_id, None)?;
        self.transition(tenant_id, ObservedState::Stopped)?;
        Ok(())
    }

    fn check_preconditions(&self, instance: &Instance) -> Result<()> {
        if instance.install_status != InstallStatus::Installed {
            return Err(Error::AppNotInstalled(instance.tenant_id.clone()));
        }
        let entry = instance.app_dir.join(&self.inner.app.entry_file);
        if !entry.is_file() {
            return Err(Error::BinaryMissing(entry.display().to_string()));
        }
        let deps = instance.app_dir.join(&self.inner.app.dependency_dir);
        if !deps.is_dir() {
            return Err(Error::DependenciesMissing(deps.display().to_string()));
        }
        if probe::port_is_bound(instance.port) {
            return Err(Error::PortConflict {
                port: instance.port,
            });
        }
        Ok(())
    }

    fn launch_spec(&self, instance: &Instance) -> LaunchSpec {
        LaunchSpec {
            tenant_id: instance.tenant_id.clone(),
            program: self.inner.app.runtime.clone(),
            args: vec![
                self.inner.app.entry_file.clone(),
                format!("--port={}", instance.port),
                format!("--dataRoot={}", instance.app_data_dir().display()),
                "--listen".to_string(),
            ],
            cwd: instance.app_dir.clone(),
            log_path: instance.log_path(),
            port: instance.port,
        }
    }

    // ========================================================================
    // Run task
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    async fn run_child(
        self,
        tenant_id: String,
        generation: u64,
        port: u16,
        mut child: Box<dyn ChildProcess>,
        mut stop_rx: oneshot::Receiver<StopMode>,
        state_tx: watch::Sender<ObservedState>,
        permit: OwnedSemaphorePermit,
    ) {
        let phase = tokio::select! {
            mode = &mut stop_rx => StartPhase::Stop(mode.unwrap_or(StopMode::Graceful)),
            exit = child.wait() => StartPhase::Exited(describe_exit(exit)),
            healthy = self.wait_healthy(port) => {
                if healthy { StartPhase::Healthy } else { StartPhase::TimedOut }
            }
        };
        drop(permit);

        let reason = match phase {
            StartPhase::Stop(_) => {
                // Never leave a half-started child behind
                info!(tenant_id = %tenant_id, "Start cancelled; killing child");
                if let Err(e) = child.kill().await {
                    warn!(tenant_id = %tenant_id, "Failed to kill child: {}", e);
                }
                let _ = state_tx.send(ObservedState::Stopped);
                return;
            }
            StartPhase::Exited(how) => format!("exited during startup ({})", how),
            StartPhase::TimedOut => {
                if let Err(e) = child.kill().await {
                    warn!(tenant_id = %tenant_id, "Failed to kill unhealthy child: {}", e);
                }
                Error::HealthTimeout {
                    port,
                    seconds: self.inner.policy.health_timeout_secs,
                }
                .to_string()
            }
            StartPhase::Healthy => {
                if let Err(e) = self.transition(&tenant_id, ObservedState::Running) {
                    error!(tenant_id = %tenant_id, "Failed to record running state: {}", e);
                }
                let _ = state_tx.send(ObservedState::Running);
                self.supervise_running(&tenant_id, child.as_mut(), &mut stop_rx, &state_tx)
                    .await
                    .map(|how| format!("exited ({})", how))
                    .unwrap_or_default()
            }
        };

        if reason.is_empty() {
            return;
        }

        warn!(tenant_id = %tenant_id, "Instance {}", reason);
        self.inner
            .slots
            .remove_if(&tenant_id, |_, s| matches!(s, Slot::Process(p) if p.generation == generation));
        match self.handle_failure(&tenant_id, &reason) {
            Ok(state) => {
                let _ = state_tx.send(state);
            }
            Err(e) => {
                error!(tenant_id = %tenant_id, "Failed to record crash: {}", e);
                let _ = state_tx.send(ObservedState::Crashed);
            }
        }
    }

    /// Watch a healthy child. Returns how it exited, or None if it was
    /// stopped on request.
    async fn supervise_running(
        &self,
        tenant_id: &str,
        child: &mut dyn ChildProcess,
        stop_rx: &mut oneshot::Receiver<StopMode>,
        state_tx: &watch::Sender<ObservedState>,
    ) -> Option<String> {
        let stable = sleep(self.inner.policy.stable_after());
        tokio::pin!(stable);
        let mut stable_reached = false;

        loop {
            tokio::select! {
                mode = &mut *stop_rx => {
                    self.shutdown_child(tenant_id, child, mode.unwrap_or(StopMode::Graceful)).await;
                    let _ = state_tx.send(ObservedState::Stopped);
                    return None;
                }
                exit = child.wait() => return Some(describe_exit(exit)),
                _ = &mut stable, if !stable_reached => {
                    stable_reached = true;
                    self.mark_stable(tenant_id);
                }
            }
        }
    }

    async fn shutdown_child(&self, tenant_id: &str, child: &mut dyn ChildProcess, mode: StopMode) {
        if mode == StopMode::Graceful {
            match child.terminate() {
                Ok(()) => {
                    let grace = self.inner.policy.stop_grace();
                    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                        info!(tenant_id, "Instance stopped");
                        return;
                    }
                    warn!(
                        tenant_id,
                        "Instance ignored SIGTERM for {}s; killing",
                        grace.as_secs()
                    );
                }
                Err(e) => warn!(tenant_id, "SIGTERM failed: {}", e),
            }
        }
        if let Err(e) = child.kill().await {
            error!(tenant_id, "Failed to kill instance: {}", e);
        } else {
            info!(tenant_id, "Instance killed");
        }
    }

    async fn wait_healthy(&self, port: u16) -> bool {
        let interval = self.inner.policy.health_probe_interval();
        let probe = async {
            loop {
                if self.inner.launcher.probe(port, interval).await {
                    return;
                }
                sleep(interval).await;
            }
        };
        tokio::time::timeout(self.inner.policy.health_timeout(), probe)
            .await
            .is_ok()
    }

    fn mark_stable(&self, tenant_id: &str) {
        self.inner.crashes.remove(tenant_id);
        match self
            .inner
            .store
            .reset_restart_count(&self.inner.token, tenant_id)
        {
            Ok(()) => debug!(tenant_id, "Instance stable; restart count reset"),
            Err(e) => warn!(tenant_id, "Failed to reset restart count: {}", e),
        }
    }

    // ========================================================================
    // Crash handling
    // ========================================================================

    /// Account for a crash or failed start and decide what happens next
    fn handle_failure(&self, tenant_id: &str, reason: &str) -> Result<ObservedState> {
        let store = &self.inner.store;
        let token = &self.inner.token;
        store.set_pid(token, tenant_id, None)?;

        let instance = store.get(tenant_id)?;
        if instance.desired_state != DesiredState::Running || instance.fault.is_some() {
            self.transition(tenant_id, ObservedState::Stopped)?;
            return Ok(ObservedState::Stopped);
        }

        self.transition(tenant_id, ObservedState::Crashed)?;
        let restart_count = store.record_restart(token, tenant_id)?;

        let policy = &self.inner.policy;
        let window = policy.restart_window();
        let now = Instant::now();
        let crashes = {
            let mut history = self.inner.crashes.entry(tenant_id.to_string()).or_default();
            history.push_back(now);
            while history
                .front()
                .is_some_and(|t| now.duration_since(*t) >= window)
            {
                history.pop_front();
            }
            history.len() as u32
        };

        if crashes >= policy.restart_ceiling {
            let fault = Error::RestartCeiling {
                crashes,
                window_secs: policy.restart_window_secs,
            };
            error!(
                tenant_id,
                crashes,
                window_secs = policy.restart_window_secs,
                last_reason = reason,
                "ALERT: restart ceiling reached; instance disabled"
            );
            store.set_desired_state(tenant_id, DesiredState::Stopped)?;
            store.set_fault(tenant_id, &fault.to_string())?;
            self.inner.crashes.remove(tenant_id);
            self.transition(tenant_id, ObservedState::Stopped)?;
            return Ok(ObservedState::Stopped);
        }

        let delay = policy.backoff_delay(restart_count);
        self.transition(tenant_id, ObservedState::RestartBackoff)?;
        info!(
            tenant_id,
            restart_count,
            delay_secs = delay.as_secs(),
            "Scheduling restart"
        );
        self.schedule_restart(tenant_id, delay);
        Ok(ObservedState::RestartBackoff)
    }

    fn schedule_restart(&self, tenant_id: &str, delay: std::time::Duration) {
        let generation = self.next_generation();
        let cancel = CancellationToken::new();
        self.inner.slots.insert(
            tenant_id.to_string(),
            Slot::Backoff(BackoffSlot {
                generation,
                cancel: cancel.clone(),
            }),
        );

        let this = self.clone();
        let tenant_id = tenant_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(delay) => {}
            }

            let ours = this
                .inner
                .slots
                .remove_if(&tenant_id, |_, s| {
                    matches!(s, Slot::Backoff(b) if b.generation == generation)
                })
                .is_some();
            if !ours {
                return;
            }

            let lock = this.tenant_lock(&tenant_id);
            let _guard = lock.lock().await;
            let instance = match this.inner.store.get(&tenant_id) {
                Ok(instance) => instance,
                Err(e) => {
                    debug!(tenant_id = %tenant_id, "Dropping restart: {}", e);
                    return;
                }
            };
            if instance.desired_state != DesiredState::Running || instance.fault.is_some() {
                let _ = this.transition(&tenant_id, ObservedState::Stopped);
                return;
            }
            if let Err(e) = this.start_locked(&tenant_id).await {
                this.record_start_error(&tenant_id, &e);
            }
        });
    }

    /// Park an instance whose start failed for a reason retrying cannot fix.
    ///
    /// Transient failures were already routed through the backoff path.
    pub fn record_start_error(&self, tenant_id: &str, err: &Error) {
        if err.is_transient() || err.kind() == ErrorKind::NotFound || self.inner.closing.is_cancelled()
        {
            return;
        }
        warn!(tenant_id, kind = %err.kind(), "Instance cannot start: {}", err);
        if let Err(e) = self.inner.store.set_fault(tenant_id, &err.to_string()) {
            error!(tenant_id, "Failed to record fault: {}", e);
        }
        if !self.is_tracking(tenant_id) {
            let _ = self.transition(tenant_id, ObservedState::Stopped);
        }
    }

    // ========================================================================
    // Daemon lifecycle
    // ========================================================================

    /// Forget observed state left by a previous daemon and kill its orphans.
    ///
    /// A recorded pid is only killed if the process is alive and the
    /// instance port is still bound, so a recycled pid is left alone.
    pub fn adopt_startup(&self) -> Result<()> {
        let store = &self.inner.store;
        for instance in store.list()? {
            let Some(pid) = instance.pid else { continue };
            if is_process_alive(pid) && probe::port_is_bound(instance.port) {
                warn!(
                    tenant_id = %instance.tenant_id,
                    pid,
                    "Killing orphaned instance from previous run"
                );
                if let Err(e) = kill_pid(pid) {
                    warn!(tenant_id = %instance.tenant_id, "Orphan kill failed: {}", e);
                }
            }
            store.set_pid(&self.inner.token, &instance.tenant_id, None)?;
        }
        let reset = store.reset_observed_states(&self.inner.token)?;
        let interrupted = store.fail_interrupted_installs()?;
        if interrupted > 0 {
            warn!("{} interrupted installs marked failed", interrupted);
        }
        info!("Supervisor adopted store ({} instance states reset)", reset);
        Ok(())
    }

    /// Stop every supervised child without touching desired state.
    ///
    /// No start is accepted afterwards.
    pub async fn shutdown(&self) {
        self.inner.closing.cancel();
        let tenants: Vec<String> = self.inner.slots.iter().map(|e| e.key().clone()).collect();
        info!("Stopping {} supervised instances", tenants.len());
        let stops = tenants.iter().map(|t| self.stop(t, StopMode::Graceful));
        for (tenant_id, result) in tenants.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                warn!(tenant_id = %tenant_id, "Stop during shutdown failed: {}", e);
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn tenant_lock(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .entry(tenant_id.to_string())
            .or_default()
            .clone()
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Persist and log an observed-state transition
    fn transition(&self, tenant_id: &str, to: ObservedState) -> Result<()> {
        let store = &self.inner.store;
        let from = store.get(tenant_id)?.observed_state;
        store.set_observed_state(&self.inner.token, tenant_id, to)?;
        if from != to {
            info!(
                tenant_id,
                from = %from,
                to = %to,
                at = %chrono::Utc::now().to_rfc3339(),
                "Instance state transition"
            );
        }
        if (from == ObservedState::Running) != (to == ObservedState::Running) {
            self.inner.route_changes.notify_one();
        }
        Ok(())
    }
}

fn describe_exit(exit: Result<crate::launcher::ExitInfo>) -> String {
    match exit {
        Ok(info) => info.to_string(),
        Err(e) => format!("wait failed: {}", e),
    }
}

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use coach_bootable::{Bootable, HealthStatus};
use parking_lot::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::descriptor::{DependencyKind, SafetyClass, ServiceDescriptor};
use crate::error::{Error, Result};
use crate::health::HealthReport;
use crate::lifecycle::{AuditRecord, LifecycleState};
use crate::report::{
    RecoveryOutcome, RecoveryReport, ServiceInfo, ServiceRecoveryReport, ServiceShutdownReport,
    ServiceStartReport, ShutdownOutcome, ShutdownReport, StartOutcome, StartupReport,
};
use crate::resolver::{self, Resolution, ReverseEdge, StagePlan};

/// Options for configuring a [`Supervisor`].
pub struct SupervisorOptions {
    /// How long a startup factory may run before it is treated as failed.
    pub startup_timeout: Duration,

    /// Global deadline for a full shutdown sequence; shutdowns still pending
    /// when it passes are abandoned and logged.
    pub shutdown_deadline: Duration,

    /// Interval between background health polling passes.
    pub health_check_interval: Duration,

    /// How long a single health probe may run.
    pub health_check_timeout: Duration,

    /// Interval between watchdog sweeps.
    pub watchdog_sweep_interval: Duration,

    /// Number of heartbeat intervals a supervised service may miss before it
    /// is forced into safe shutdown.
    pub watchdog_missed_allowance: u32,

    /// Maximum startup attempts per service during recovery.
    pub recovery_max_attempts: u32,

    /// Base recovery backoff; doubled after every failed attempt.
    pub recovery_backoff: Duration,

    /// Audit records retained per service; older records are dropped.
    pub audit_capacity: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            shutdown_deadline: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(15),
            health_check_timeout: Duration::from_secs(5),
            watchdog_sweep_interval: Duration::from_secs(1),
            watchdog_missed_allowance: 3,
            recovery_max_attempts: 5,
            recovery_backoff: Duration::from_millis(500),
            audit_capacity: 64,
        }
    }
}

struct ServiceEntry {
    descriptor: ServiceDescriptor,
    state: LifecycleState,
    audit: VecDeque<AuditRecord>,
    last_heartbeat: Option<Instant>,
    /// Serializes startup, shutdown and health probes for one service.
    op_lock: Arc<tokio::sync::Mutex<()>>,
}

struct Inner {
    options: SupervisorOptions,
    services: RwLock<HashMap<String, ServiceEntry>>,
    resolution: RwLock<Option<Resolution>>,
    realized_start_order: RwLock<Vec<String>>,
    active_fallbacks: RwLock<BTreeMap<String, String>>,
    started: AtomicBool,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

/// Owns the lifecycle of every registered service: stage-planned startup,
/// health polling and propagation, watchdog supervision, recovery, and
/// reverse-order shutdown.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Creates a new `Supervisor`.
    #[must_use]
    pub fn new(options: SupervisorOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                services: RwLock::new(HashMap::new()),
                resolution: RwLock::new(None),
                realized_start_order: RwLock::new(Vec::new()),
                active_fallbacks: RwLock::new(BTreeMap::new()),
                started: AtomicBool::new(false),
                shutdown_token: CancellationToken::new(),
                task_tracker: TaskTracker::new(),
            }),
        }
    }

    /// Register a service descriptor.
    ///
    /// # Errors
    ///
    /// Rejects duplicate names, required dependencies on names not yet
    /// registered, and registration after startup has begun.
    pub fn register(&self, descriptor: ServiceDescriptor) -> Result<()> {
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        let mut services = self.inner.services.write();
        let name = descriptor.name().to_string();
        if services.contains_key(&name) {
            return Err(Error::DuplicateService(name));
        }
        for dep in descriptor.dependencies() {
            if dep.kind == DependencyKind::Required && !services.contains_key(&dep.target) {
                return Err(Error::UnknownDependency {
                    service: name,
                    dependency: dep.target.clone(),
                });
            }
        }
        debug!("registered service {name}");
        services.insert(
            name,
            ServiceEntry {
                descriptor,
                state: LifecycleState::Stopped,
                audit: VecDeque::new(),
                last_heartbeat: None,
                op_lock: Arc::new(tokio::sync::Mutex::new(())),
            },
        );
        Ok(())
    }

    /// Compute the stage plan for the currently registered services.
    ///
    /// # Errors
    ///
    /// Fails on required-dependency cycles, unregistered required targets and
    /// unacknowledged classification inversions.
    pub fn resolve(&self) -> Result<StagePlan> {
        let descriptors: HashMap<String, ServiceDescriptor> = {
            let services = self.inner.services.read();
            services
                .iter()
                .map(|(name, entry)| (name.clone(), entry.descriptor.clone()))
                .collect()
        };
        let resolution = resolver::resolve(&descriptors)?;
        let plan = resolution.plan.clone();
        *self.inner.resolution.write() = Some(resolution);
        Ok(plan)
    }

    /// Start every registered service, stage by stage.
    ///
    /// Services within a stage start concurrently; the next stage begins only
    /// once every service in the current one reached a terminal startup
    /// outcome. A startup failure of a service whose classification is fatal
    /// aborts the sequence and unwinds everything already started, in reverse
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second call, resolver errors,
    /// and [`Error::StartupFailure`] on a fatal startup failure.
    #[allow(clippy::too_many_lines)]
    pub async fn startup_all(&self) -> Result<StartupReport> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let plan = match self.resolve() {
            Ok(plan) => plan,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let started_at = Utc::now();
        let begin = Instant::now();
        let total: usize = plan.stages.iter().map(Vec::len).sum();
        info!(
            "starting {total} services across {} stages",
            plan.stages.len()
        );

        let mut services_report: Vec<ServiceStartReport> = Vec::new();

        for (stage_index, stage) in plan.stages.iter().enumerate() {
            debug!("starting stage {stage_index}: {}", stage.join(", "));

            let mut set = JoinSet::new();
            for name in stage {
                let supervisor = self.clone();
                let name = name.clone();
                let cause = format!("startup stage {stage_index}");
                set.spawn(async move {
                    let attempt_begin = Instant::now();
                    let outcome = supervisor.start_service_inner(&name, &cause).await;
                    (name, outcome, attempt_begin.elapsed())
                });
            }

            let mut fatal: Option<(String, String)> = None;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((name, outcome, duration)) => {
                        if let Some(reason) = startup_failure_reason(&outcome) {
                            if self
                                .safety_class_of(&name)
                                .is_some_and(SafetyClass::startup_failure_is_fatal)
                            {
                                fatal.get_or_insert((name.clone(), reason.to_string()));
                            } else {
                                warn!("non-fatal startup failure of {name}: {reason}");
                            }
                        }
                        services_report.push(ServiceStartReport {
                            service: name,
                            stage: stage_index,
                            outcome,
                            duration,
                        });
                    }
                    Err(e) => error!("stage {stage_index} start task failed: {e}"),
                }
            }

            // A start task that died without reporting leaves its service
            // stuck in Initializing.
            for name in stage {
                if self.state_of(name) == Some(LifecycleState::Initializing) {
                    let reason = "start task aborted".to_string();
                    let _ = self.transition(name, LifecycleState::Failed, &reason, None);
                    if fatal.is_none()
                        && self
                            .safety_class_of(name)
                            .is_some_and(SafetyClass::startup_failure_is_fatal)
                    {
                        fatal = Some((name.clone(), reason));
                    }
                }
            }

            if let Some((service, reason)) = fatal {
                error!("fatal startup failure of {service}; unwinding started services");
                self.unwind_started().await;
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(Error::StartupFailure { service, reason });
            }
        }

        for (service, missing) in &plan.missing_runtime {
            warn!(
                "{service} is missing runtime dependencies: {}",
                missing.join(", ")
            );
        }

        self.spawn_background_tasks();

        info!("startup complete");
        Ok(StartupReport {
            started_at,
            duration: begin.elapsed(),
            services: services_report,
            missing_runtime: plan.missing_runtime,
        })
    }

    /// Shut down every started service in the reverse of the realized start
    /// order. Best-effort: a failing shutdown routine never prevents the
    /// remaining ones, and the whole sequence is bounded by the configured
    /// deadline. Calling this twice is harmless.
    pub async fn shutdown_all(&self) -> ShutdownReport {
        let started_at = Utc::now();
        let begin = Instant::now();
        let deadline = begin + self.inner.options.shutdown_deadline;

        info!("shutting down services...");
        self.inner.shutdown_token.cancel();
        self.inner.task_tracker.close();
        let remaining = deadline.saturating_duration_since(Instant::now());
        if tokio::time::timeout(remaining, self.inner.task_tracker.wait())
            .await
            .is_err()
        {
            warn!("background tasks did not stop before the shutdown deadline");
        }

        let order: Vec<String> = {
            let realized = self.inner.realized_start_order.read();
            realized.iter().rev().cloned().collect()
        };
        let plan: Option<StagePlan> = self
            .inner
            .resolution
            .read()
            .as_ref()
            .map(|resolution| resolution.plan.clone());

        let mut services = Vec::new();
        let mut deadline_exceeded = false;
        for name in order {
            let attempt_begin = Instant::now();
            let outcome = self.shutdown_one(&name, deadline).await;
            if matches!(outcome, ShutdownOutcome::Abandoned) {
                deadline_exceeded = true;
            }
            services.push(ServiceShutdownReport {
                stage: plan.as_ref().and_then(|plan| plan.stage_of(&name)),
                service: name,
                outcome,
                duration: attempt_begin.elapsed(),
            });
        }

        info!("shutdown complete");
        ShutdownReport {
            started_at,
            duration: begin.elapsed(),
            services,
            deadline_exceeded,
        }
    }

    /// Run one health polling pass over every operational service.
    ///
    /// Runs on the configured interval once startup completes; exposed so
    /// callers can force a pass. Services with a startup or shutdown in
    /// flight are skipped, never raced.
    pub async fn run_health_checks(&self) {
        let candidates: Vec<String> = {
            let services = self.inner.services.read();
            services
                .iter()
                .filter(|(_, entry)| entry.state.is_operational())
                .map(|(name, _)| name.clone())
                .collect()
        };

        for name in candidates {
            let Some((body, op_lock)) = self.body_and_lock(&name) else {
                continue;
            };
            let Ok(guard) = op_lock.try_lock() else {
                continue;
            };
            let state = match self.state_of(&name) {
                Some(state) if state.is_operational() => state,
                _ => continue,
            };
            let probe = match tokio::time::timeout(
                self.inner.options.health_check_timeout,
                body.check_health(),
            )
            .await
            {
                Ok(status) => status,
                Err(_) => HealthStatus::Failed("health check timed out".to_string()),
            };
            drop(guard);

            match probe {
                HealthStatus::Healthy => {
                    self.record_heartbeat(&name);
                    if state == LifecycleState::Degraded
                        && self.missing_required_deps(&name).is_empty()
                        && !self.optional_degradation_pending(&name)
                        && self
                            .transition(
                                &name,
                                LifecycleState::Healthy,
                                "health check recovered",
                                None,
                            )
                            .is_ok()
                    {
                        self.heal_dependents(&name).await;
                    }
                }
                HealthStatus::Degraded(reason) => {
                    self.record_heartbeat(&name);
                    if state == LifecycleState::Healthy
                        && self
                            .transition(
                                &name,
                                LifecycleState::Degraded,
                                &format!("health check degraded: {reason}"),
                                None,
                            )
                            .is_ok()
                    {
                        self.propagate_degradation(&name);
                    }
                }
                HealthStatus::Failed(reason) => {
                    if self
                        .transition(
                            &name,
                            LifecycleState::Failed,
                            &format!("health check failed: {reason}"),
                            None,
                        )
                        .is_ok()
                    {
                        self.propagate_degradation(&name);
                    }
                }
            }
        }
    }

    /// Run one watchdog sweep: any supervised service whose heartbeat is
    /// overdue past the missed allowance is forced into safe shutdown.
    pub async fn check_watchdogs(&self) {
        let allowance = self.inner.options.watchdog_missed_allowance;
        let now = Instant::now();
        let expired: Vec<String> = {
            let services = self.inner.services.read();
            services
                .iter()
                .filter_map(|(name, entry)| {
                    let heartbeat_interval = entry.descriptor.heartbeat()?;
                    if !matches!(
                        entry.descriptor.safety_class(),
                        SafetyClass::Critical | SafetyClass::SafetyRelated
                    ) || !entry.state.is_operational()
                    {
                        return None;
                    }
                    let last = entry.last_heartbeat?;
                    (now.duration_since(last) > heartbeat_interval * allowance)
                        .then(|| name.clone())
                })
                .collect()
        };

        for name in expired {
            error!("watchdog timeout for {name}; forcing safe shutdown");
            if self
                .transition(&name, LifecycleState::SafeShutdown, "watchdog timeout", None)
                .is_ok()
            {
                self.propagate_degradation(&name);
                self.spawn_body_shutdown(&name, "watchdog");
            }
        }
    }

    /// Retry every failed service in dependency order, with exponential
    /// backoff up to the configured attempt limit.
    pub async fn recover_failed(&self) -> RecoveryReport {
        let mut failed: Vec<String> = {
            let services = self.inner.services.read();
            services
                .iter()
                .filter(|(_, entry)| entry.state == LifecycleState::Failed)
                .map(|(name, _)| name.clone())
                .collect()
        };
        let depths = self
            .inner
            .resolution
            .read()
            .as_ref()
            .map(|r| r.depths.clone())
            .unwrap_or_default();
        failed.sort_by(|a, b| {
            let da = depths.get(a).copied().unwrap_or(0);
            let db = depths.get(b).copied().unwrap_or(0);
            da.cmp(&db).then_with(|| a.cmp(b))
        });

        let max_attempts = self.inner.options.recovery_max_attempts.max(1);
        let mut reports = Vec::new();
        for name in failed {
            info!("recovering {name}");
            let mut attempts: u32 = 0;
            let outcome = loop {
                attempts += 1;
                let cause = format!("recovery attempt {attempts}");
                match self.start_service_inner(&name, &cause).await {
                    StartOutcome::Failed { reason } | StartOutcome::Skipped { reason } => {
                        if attempts >= max_attempts {
                            warn!("giving up on {name} after {attempts} attempts");
                            break RecoveryOutcome::ExhaustedRetries { attempts, reason };
                        }
                        let backoff =
                            self.inner.options.recovery_backoff * 2u32.pow(attempts - 1);
                        tokio::time::sleep(backoff).await;
                    }
                    _ => {
                        info!("{name} recovered after {attempts} attempt(s)");
                        self.heal_dependents(&name).await;
                        break RecoveryOutcome::Recovered { attempts };
                    }
                }
            };
            reports.push(ServiceRecoveryReport {
                service: name,
                outcome,
            });
        }
        RecoveryReport { services: reports }
    }

    /// Force every emergency-stop-relevant service into safe shutdown.
    /// Returns the affected service names.
    pub fn force_safe_shutdown(&self, cause: &str) -> Vec<String> {
        let targets: Vec<String> = {
            let services = self.inner.services.read();
            services
                .iter()
                .filter(|(_, entry)| {
                    entry.descriptor.safety_class().forced_on_emergency_stop()
                        && !entry.state.is_terminal()
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        let mut forced = Vec::new();
        for name in targets {
            let was_operational = self
                .state_of(&name)
                .is_some_and(LifecycleState::is_operational);
            if self
                .transition(&name, LifecycleState::SafeShutdown, cause, None)
                .is_ok()
            {
                if was_operational {
                    self.spawn_body_shutdown(&name, "emergency stop");
                }
                forced.push(name);
            }
        }
        forced.sort();
        forced
    }

    /// Release every service held in safe shutdown back to stopped so it can
    /// be re-initialized. Returns the affected service names.
    pub fn release_safe_shutdown(&self, cause: &str, actor: Option<&str>) -> Vec<String> {
        let targets: Vec<String> = {
            let services = self.inner.services.read();
            services
                .iter()
                .filter(|(_, entry)| entry.state == LifecycleState::SafeShutdown)
                .map(|(name, _)| name.clone())
                .collect()
        };

        let mut released = Vec::new();
        for name in targets {
            if self
                .transition(&name, LifecycleState::Stopped, cause, actor)
                .is_ok()
            {
                released.push(name);
            }
        }
        released.sort();
        released
    }

    /// Start a single stopped or failed service outside a full startup
    /// sequence, e.g. after an emergency stop was cleared.
    pub async fn start_service(&self, name: &str, cause: &str) -> StartOutcome {
        self.start_service_inner(name, cause).await
    }

    /// Take a service offline for maintenance.
    ///
    /// # Errors
    ///
    /// Refused while required dependents still rely on the service, or when
    /// the service is not currently operational.
    pub fn enter_maintenance(&self, name: &str, actor: &str) -> Result<()> {
        let dependents: Vec<String> = self
            .reverse_edges(name)
            .into_iter()
            .filter(|edge| edge.kind == DependencyKind::Required)
            .filter(|edge| {
                self.state_of(&edge.dependent).is_some_and(|state| {
                    state.is_operational() || state == LifecycleState::Initializing
                })
            })
            .map(|edge| edge.dependent)
            .collect();
        if !dependents.is_empty() {
            return Err(Error::ActiveDependents {
                service: name.to_string(),
                dependents,
            });
        }
        self.transition(
            name,
            LifecycleState::Maintenance,
            "operator requested maintenance",
            Some(actor),
        )?;
        Ok(())
    }

    /// Current lifecycle state of a service.
    ///
    /// # Errors
    ///
    /// Fails when no service is registered under `name`.
    pub fn get_state(&self, name: &str) -> Result<LifecycleState> {
        self.state_of(name)
            .ok_or_else(|| Error::UnknownService(name.to_string()))
    }

    /// Safety classification of a service.
    ///
    /// # Errors
    ///
    /// Fails when no service is registered under `name`.
    pub fn safety_class(&self, name: &str) -> Result<SafetyClass> {
        self.safety_class_of(name)
            .ok_or_else(|| Error::UnknownService(name.to_string()))
    }

    /// List registered services, optionally restricted to one tag.
    #[must_use]
    pub fn list_services(&self, tag: Option<&str>) -> Vec<ServiceInfo> {
        let services = self.inner.services.read();
        let mut infos: Vec<ServiceInfo> = services
            .values()
            .filter(|entry| tag.is_none_or(|t| entry.descriptor.tags().contains(t)))
            .map(|entry| ServiceInfo {
                name: entry.descriptor.name().to_string(),
                description: entry.descriptor.description().to_string(),
                safety_class: entry.descriptor.safety_class(),
                state: entry.state,
                tags: entry.descriptor.tags().clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// The audit trail recorded for a service, oldest first.
    ///
    /// # Errors
    ///
    /// Fails when no service is registered under `name`.
    pub fn audit_log(&self, name: &str) -> Result<Vec<AuditRecord>> {
        let services = self.inner.services.read();
        services
            .get(name)
            .map(|entry| entry.audit.iter().cloned().collect())
            .ok_or_else(|| Error::UnknownService(name.to_string()))
    }

    /// Point-in-time health view of the whole fleet. Reads only committed
    /// lifecycle states; never touches the services themselves.
    #[must_use]
    pub fn check_all(&self) -> HealthReport {
        let services = self.inner.services.read();
        HealthReport::new(
            services
                .iter()
                .map(|(name, entry)| (name.clone(), entry.state))
                .collect(),
        )
    }

    /// Transitive required dependents of a service: everything impacted if it
    /// goes away.
    ///
    /// # Errors
    ///
    /// Fails when no service is registered under `name`.
    pub fn impacted_services(&self, name: &str) -> Result<Vec<String>> {
        let services = self.inner.services.read();
        if !services.contains_key(name) {
            return Err(Error::UnknownService(name.to_string()));
        }
        let mut dependents_of: HashMap<&str, Vec<&str>> = HashMap::new();
        for (service, entry) in services.iter() {
            for dep in entry.descriptor.dependencies() {
                if dep.kind == DependencyKind::Required {
                    dependents_of
                        .entry(dep.target.as_str())
                        .or_default()
                        .push(service.as_str());
                }
            }
        }
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([name]);
        while let Some(current) = queue.pop_front() {
            for dependent in dependents_of.get(current).into_iter().flatten() {
                if seen.insert((*dependent).to_string()) {
                    queue.push_back(*dependent);
                }
            }
        }
        Ok(seen.into_iter().collect())
    }

    /// Human-readable summary of every service and its dependency edges.
    #[must_use]
    pub fn dependency_report(&self) -> String {
        let services = self.inner.services.read();
        let mut names: Vec<&String> = services.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            let Some(entry) = services.get(name.as_str()) else {
                continue;
            };
            let _ = writeln!(
                out,
                "{name} [{:?}] {:?}",
                entry.descriptor.safety_class(),
                entry.state
            );
            for dep in entry.descriptor.dependencies() {
                let status = if services.contains_key(&dep.target) {
                    "registered"
                } else {
                    "unregistered"
                };
                let _ = write!(out, "  {:?} -> {} ({status})", dep.kind, dep.target);
                if let Some(fallback) = &dep.fallback {
                    let _ = write!(out, " fallback={fallback}");
                }
                let _ = writeln!(out);
            }
        }
        out
    }

    /// Graphviz description of the dependency graph, for visualization.
    #[must_use]
    pub fn export_dependency_diagram(&self) -> String {
        let services = self.inner.services.read();
        let mut names: Vec<&String> = services.keys().collect();
        names.sort();
        let mut out = String::from("digraph services {\n");
        for name in &names {
            if let Some(entry) = services.get(name.as_str()) {
                let _ = writeln!(
                    out,
                    "    \"{name}\" [label=\"{name}\\n{:?}\"];",
                    entry.descriptor.safety_class()
                );
            }
        }
        for name in &names {
            let Some(entry) = services.get(name.as_str()) else {
                continue;
            };
            for dep in entry.descriptor.dependencies() {
                let style = match dep.kind {
                    DependencyKind::Required => "solid",
                    DependencyKind::Optional => "dashed",
                    DependencyKind::Runtime => "dotted",
                };
                let _ = writeln!(out, "    \"{name}\" -> \"{}\" [style={style}];", dep.target);
            }
        }
        out.push_str("}\n");
        out
    }

    /// Fallback substitutions currently in effect, dependent to fallback.
    #[must_use]
    pub fn active_fallbacks(&self) -> BTreeMap<String, String> {
        self.inner.active_fallbacks.read().clone()
    }

    /// The order in which services actually reached a running state.
    #[must_use]
    pub fn realized_start_order(&self) -> Vec<String> {
        self.inner.realized_start_order.read().clone()
    }

    async fn start_service_inner(&self, name: &str, cause: &str) -> StartOutcome {
        let missing = self.missing_required_deps(name);
        if !missing.is_empty() {
            let reason = format!(
                "required dependencies not operational: {}",
                missing.join(", ")
            );
            warn!("skipping startup of {name}: {reason}");
            return StartOutcome::Skipped { reason };
        }

        let Some((body, op_lock)) = self.body_and_lock(name) else {
            return StartOutcome::Skipped {
                reason: format!("service `{name}` is not registered"),
            };
        };

        if let Err(e) = self.transition(name, LifecycleState::Initializing, cause, None) {
            return StartOutcome::Skipped {
                reason: e.to_string(),
            };
        }

        let _guard = op_lock.lock().await;
        let startup_timeout = self.inner.options.startup_timeout;
        match tokio::time::timeout(startup_timeout, body.start()).await {
            Err(_) => {
                // The factory future is dropped here, freeing the stage
                // barrier even when it never completes on its own.
                let reason = format!("startup timed out after {startup_timeout:?}");
                error!("startup of {name} timed out");
                let _ = self.transition(name, LifecycleState::Failed, &reason, None);
                StartOutcome::Failed { reason }
            }
            Ok(Err(e)) => {
                let reason = e.to_string();
                error!("startup of {name} failed: {reason}");
                let _ = self.transition(name, LifecycleState::Failed, &reason, None);
                StartOutcome::Failed { reason }
            }
            Ok(Ok(())) => {
                let probe = match tokio::time::timeout(
                    self.inner.options.health_check_timeout,
                    body.check_health(),
                )
                .await
                {
                    Ok(status) => status,
                    Err(_) => HealthStatus::Failed("health check timed out".to_string()),
                };
                match probe {
                    HealthStatus::Failed(reason) => {
                        error!("startup probe of {name} failed: {reason}");
                        let _ = self.transition(
                            name,
                            LifecycleState::Failed,
                            &format!("startup health check failed: {reason}"),
                            None,
                        );
                        if let Err(e) = body.shutdown().await {
                            warn!("cleanup shutdown of {name} failed: {e}");
                        }
                        StartOutcome::Failed { reason }
                    }
                    status => {
                        let _ =
                            self.transition(name, LifecycleState::Healthy, "startup complete", None);
                        self.record_heartbeat(name);
                        self.push_realized(name);
                        if let HealthStatus::Degraded(reason) = status {
                            let _ = self.transition(
                                name,
                                LifecycleState::Degraded,
                                &format!("health check degraded: {reason}"),
                                None,
                            );
                            return StartOutcome::Degraded { reason };
                        }
                        let (fallback, degraded_start) = self.optional_start_flags(name);
                        if let Some(fallback) = fallback {
                            info!("{name} starting against fallback {fallback}");
                            self.inner
                                .active_fallbacks
                                .write()
                                .insert(name.to_string(), fallback.clone());
                            StartOutcome::HealthyViaFallback { fallback }
                        } else if degraded_start {
                            let reason = "optional dependency unavailable".to_string();
                            let _ = self.transition(
                                name,
                                LifecycleState::Degraded,
                                &reason,
                                None,
                            );
                            StartOutcome::Degraded { reason }
                        } else {
                            StartOutcome::Healthy
                        }
                    }
                }
            }
        }
    }

    async fn unwind_started(&self) {
        let order: Vec<String> = {
            let mut realized = self.inner.realized_start_order.write();
            let order = realized.iter().rev().cloned().collect();
            realized.clear();
            order
        };
        let deadline = Instant::now() + self.inner.options.shutdown_deadline;
        for name in order {
            let _ = self.shutdown_one(&name, deadline).await;
        }
    }

    async fn shutdown_one(&self, name: &str, deadline: Instant) -> ShutdownOutcome {
        let Some((body, op_lock)) = self.body_and_lock(name) else {
            return ShutdownOutcome::AlreadyStopped;
        };
        if self.state_of(name) == Some(LifecycleState::Stopped) {
            debug!("{name} already stopped");
            return ShutdownOutcome::AlreadyStopped;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            error!("shutdown deadline exceeded; abandoning shutdown of {name}");
            return ShutdownOutcome::Abandoned;
        }
        let attempt = async {
            let _guard = op_lock.lock().await;
            body.shutdown().await
        };
        match tokio::time::timeout(remaining, attempt).await {
            Ok(Ok(())) => {
                let _ = self.transition(name, LifecycleState::Stopped, "shutdown", None);
                ShutdownOutcome::Stopped
            }
            Ok(Err(e)) => {
                error!("shutdown of {name} failed: {e}");
                let _ = self.transition(
                    name,
                    LifecycleState::Stopped,
                    &format!("shutdown routine failed: {e}"),
                    None,
                );
                ShutdownOutcome::Failed {
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                error!("shutdown deadline exceeded while stopping {name}");
                ShutdownOutcome::Abandoned
            }
        }
    }

    /// The single place lifecycle state changes. Rejected moves are logged as
    /// invariant violations; accepted moves are recorded in the audit trail.
    fn transition(
        &self,
        name: &str,
        to: LifecycleState,
        cause: &str,
        actor: Option<&str>,
    ) -> Result<LifecycleState> {
        let mut services = self.inner.services.write();
        let entry = services
            .get_mut(name)
            .ok_or_else(|| Error::UnknownService(name.to_string()))?;
        let from = entry.state;
        if from == to {
            return Ok(from);
        }
        if !from.can_transition_to(to) {
            drop(services);
            warn!("invariant violation: rejected transition of {name}: {from:?} -> {to:?} ({cause})");
            return Err(Error::InvalidTransition {
                service: name.to_string(),
                from,
                to,
            });
        }
        entry.state = to;
        if entry.audit.len() >= self.inner.options.audit_capacity {
            entry.audit.pop_front();
        }
        entry.audit.push_back(AuditRecord {
            previous: from,
            next: to,
            cause: cause.to_string(),
            actor: actor.map(str::to_string),
            at: Utc::now(),
        });
        drop(services);
        info!("{name}: {from:?} -> {to:?} ({cause})");
        Ok(from)
    }

    /// Walk the reverse-dependency index from a degraded or failed service
    /// and pull its dependents along: required edges degrade (or fail, when
    /// load-bearing), optional edges try the declared fallback first, runtime
    /// edges are only logged. Dependents whose state does not change are not
    /// walked further.
    fn propagate_degradation(&self, origin: &str) {
        let mut queue = VecDeque::from([origin.to_string()]);
        while let Some(current) = queue.pop_front() {
            let Some(current_state) = self.state_of(&current) else {
                continue;
            };
            for edge in self.reverse_edges(&current) {
                let Some(dependent_state) = self.state_of(&edge.dependent) else {
                    continue;
                };
                if !dependent_state.is_operational() {
                    continue;
                }
                match edge.kind {
                    DependencyKind::Runtime => {
                        debug!(
                            "runtime dependency {current} of {} is {current_state:?}",
                            edge.dependent
                        );
                    }
                    DependencyKind::Optional => {
                        if let Some(fallback) = self.fallback_of(&edge.dependent, &current) {
                            if self
                                .state_of(&fallback)
                                .is_some_and(LifecycleState::is_operational)
                            {
                                info!(
                                    "{} switching to fallback {fallback} for {current}",
                                    edge.dependent
                                );
                                self.inner
                                    .active_fallbacks
                                    .write()
                                    .insert(edge.dependent.clone(), fallback);
                                continue;
                            }
                        }
                        if dependent_state != LifecycleState::Degraded
                            && self
                                .transition(
                                    &edge.dependent,
                                    LifecycleState::Degraded,
                                    &format!("optional dependency {current} is unavailable"),
                                    None,
                                )
                                .is_ok()
                        {
                            queue.push_back(edge.dependent.clone());
                        }
                    }
                    DependencyKind::Required => {
                        let target = if edge.load_bearing
                            && matches!(
                                current_state,
                                LifecycleState::Failed | LifecycleState::SafeShutdown
                            ) {
                            LifecycleState::Failed
                        } else {
                            LifecycleState::Degraded
                        };
                        if dependent_state == target {
                            continue;
                        }
                        if self
                            .transition(
                                &edge.dependent,
                                target,
                                &format!("required dependency {current} is {current_state:?}"),
                                None,
                            )
                            .is_ok()
                        {
                            queue.push_back(edge.dependent.clone());
                        }
                    }
                }
            }
        }
    }

    /// Inverse of [`Self::propagate_degradation`]: when a service recovers,
    /// dependents that were only degraded by it return to healthy, provided
    /// their own probe passes.
    async fn heal_dependents(&self, origin: &str) {
        let mut queue = VecDeque::from([origin.to_string()]);
        while let Some(current) = queue.pop_front() {
            for edge in self.reverse_edges(&current) {
                if edge.kind != DependencyKind::Required {
                    continue;
                }
                if self.state_of(&edge.dependent) != Some(LifecycleState::Degraded) {
                    continue;
                }
                if !self.missing_required_deps(&edge.dependent).is_empty()
                    || self.optional_degradation_pending(&edge.dependent)
                {
                    continue;
                }
                let Some((body, op_lock)) = self.body_and_lock(&edge.dependent) else {
                    continue;
                };
                let Ok(guard) = op_lock.try_lock() else {
                    continue;
                };
                let probe = tokio::time::timeout(
                    self.inner.options.health_check_timeout,
                    body.check_health(),
                )
                .await;
                drop(guard);
                if matches!(probe, Ok(HealthStatus::Healthy))
                    && self
                        .transition(
                            &edge.dependent,
                            LifecycleState::Healthy,
                            &format!("required dependency {current} recovered"),
                            None,
                        )
                        .is_ok()
                {
                    self.record_heartbeat(&edge.dependent);
                    queue.push_back(edge.dependent.clone());
                }
            }
        }
    }

    fn spawn_background_tasks(&self) {
        let supervisor = self.clone();
        let token = self.inner.shutdown_token.clone();
        let interval = self.inner.options.health_check_interval;
        self.inner.task_tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => supervisor.run_health_checks().await,
                }
            }
        });

        let supervisor = self.clone();
        let token = self.inner.shutdown_token.clone();
        let sweep = self.inner.options.watchdog_sweep_interval;
        self.inner.task_tracker.spawn(async move {
            let mut ticker = tokio::time::interval(sweep);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => supervisor.check_watchdogs().await,
                }
            }
        });
    }

    fn spawn_body_shutdown(&self, name: &str, context: &str) {
        let Some((body, op_lock)) = self.body_and_lock(name) else {
            return;
        };
        let name = name.to_string();
        let context = context.to_string();
        self.inner.task_tracker.spawn(async move {
            let _guard = op_lock.lock().await;
            if let Err(e) = body.shutdown().await {
                warn!("{context} shutdown of {name} failed: {e}");
            }
        });
    }

    fn state_of(&self, name: &str) -> Option<LifecycleState> {
        self.inner.services.read().get(name).map(|entry| entry.state)
    }

    fn safety_class_of(&self, name: &str) -> Option<SafetyClass> {
        self.inner
            .services
            .read()
            .get(name)
            .map(|entry| entry.descriptor.safety_class())
    }

    fn body_and_lock(
        &self,
        name: &str,
    ) -> Option<(Arc<dyn Bootable>, Arc<tokio::sync::Mutex<()>>)> {
        self.inner
            .services
            .read()
            .get(name)
            .map(|entry| (entry.descriptor.body().clone(), entry.op_lock.clone()))
    }

    fn missing_required_deps(&self, name: &str) -> Vec<String> {
        let services = self.inner.services.read();
        let Some(entry) = services.get(name) else {
            return Vec::new();
        };
        entry
            .descriptor
            .dependencies()
            .iter()
            .filter(|dep| dep.kind == DependencyKind::Required)
            .filter(|dep| {
                services
                    .get(&dep.target)
                    .is_none_or(|target| !target.state.is_operational())
            })
            .map(|dep| dep.target.clone())
            .collect()
    }

    fn reverse_edges(&self, name: &str) -> Vec<ReverseEdge> {
        self.inner
            .resolution
            .read()
            .as_ref()
            .and_then(|resolution| resolution.reverse.get(name).cloned())
            .unwrap_or_default()
    }

    fn fallback_of(&self, dependent: &str, target: &str) -> Option<String> {
        self.inner
            .services
            .read()
            .get(dependent)
            .and_then(|entry| entry.descriptor.fallback_for(target).map(str::to_string))
    }

    /// Whether a service is degraded by an absent optional dependency that
    /// has no usable fallback. Such a service must not be polled back to
    /// healthy; the missing target cannot appear after startup.
    fn optional_degradation_pending(&self, name: &str) -> bool {
        let resolution = self.inner.resolution.read();
        let Some(resolution) = resolution.as_ref() else {
            return false;
        };
        resolution.plan.degraded_starts.iter().any(|s| s == name)
            && !self.inner.active_fallbacks.read().contains_key(name)
    }

    fn optional_start_flags(&self, name: &str) -> (Option<String>, bool) {
        let resolution = self.inner.resolution.read();
        let Some(resolution) = resolution.as_ref() else {
            return (None, false);
        };
        (
            resolution.plan.fallback_activations.get(name).cloned(),
            resolution.plan.degraded_starts.iter().any(|s| s == name),
        )
    }

    fn record_heartbeat(&self, name: &str) {
        if let Some(entry) = self.inner.services.write().get_mut(name) {
            entry.last_heartbeat = Some(Instant::now());
        }
    }

    fn push_realized(&self, name: &str) {
        let mut order = self.inner.realized_start_order.write();
        if !order.iter().any(|n| n == name) {
            order.push(name.to_string());
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(SupervisorOptions::default())
    }
}

fn startup_failure_reason(outcome: &StartOutcome) -> Option<&str> {
    match outcome {
        StartOutcome::Failed { reason } | StartOutcome::Skipped { reason } => Some(reason),
        _ => None,
    }
}

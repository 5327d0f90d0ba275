//! Component health tracking and the periodic health monitor
//!
//! `HealthRegistry` is the shared store every component reports into (either
//! by self-report or by being polled). `HealthMonitor` polls registered
//! components on a fixed interval, flags missed heartbeats and keeps the
//! latest aggregated `HealthSnapshot` for external consumers.

use super::lifecycle::{Component, CoreContext};
use crate::error::CoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ComponentType {
    Bus,
    Connector,
    Processor,
    Storage,
    Streaming,
    Scheduler,
    Monitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Stopped,
}

impl HealthStatus {
    fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
            HealthStatus::Stopped => 0,
        }
    }

    /// Worst of two statuses (Unhealthy > Degraded > Healthy)
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

/// Overall status: worst running component; Stopped only if nothing runs
pub fn aggregate_status<I: IntoIterator<Item = HealthStatus>>(statuses: I) -> HealthStatus {
    let mut any = false;
    let mut running = false;
    let mut overall = HealthStatus::Healthy;
    for status in statuses {
        any = true;
        if status == HealthStatus::Stopped {
            continue;
        }
        running = true;
        overall = overall.worst(status);
    }
    if any && !running {
        HealthStatus::Stopped
    } else {
        overall
    }
}

/// What a component says about itself when polled
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub detail: Option<String>,
    pub last_error: Option<String>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            detail: None,
            last_error: None,
        }
    }

    pub fn with_status(status: HealthStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: Some(detail.into()),
            last_error: None,
        }
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.last_error = error;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub component_type: ComponentType,
    pub status: HealthStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub detail: Option<String>,
    #[serde(skip)]
    heartbeat_at: Option<Instant>,
}

impl ComponentHealth {
    fn new(name: &str, component_type: ComponentType) -> Self {
        Self {
            name: name.to_string(),
            component_type,
            status: HealthStatus::Stopped,
            last_heartbeat: None,
            consecutive_failures: 0,
            last_error: None,
            detail: None,
            heartbeat_at: None,
        }
    }

    fn beat(&mut self) {
        self.last_heartbeat = Some(Utc::now());
        self.heartbeat_at = Some(Instant::now());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub overall: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct HealthRegistry {
    entries: RwLock<HashMap<String, ComponentHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component (status Stopped until it reports); re-registering keeps the entry
    pub fn register(&self, name: &str, component_type: ComponentType) {
        self.entries
            .write()
            .entry(name.to_string())
            .or_insert_with(|| ComponentHealth::new(name, component_type));
    }

    pub fn remove(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    pub fn heartbeat(&self, name: &str) -> bool {
        self.update(name, |entry| entry.beat())
    }

    pub fn report_success(&self, name: &str) -> bool {
        self.update(name, |entry| {
            entry.beat();
            entry.status = HealthStatus::Healthy;
            entry.consecutive_failures = 0;
        })
    }

    /// Record a failure; the component still counts as alive
    pub fn report_failure(&self, name: &str, error: &str, status: HealthStatus) -> bool {
        self.update(name, |entry| {
            entry.beat();
            entry.status = status;
            entry.consecutive_failures += 1;
            entry.last_error = Some(error.to_string());
        })
    }

    pub fn set_status(&self, name: &str, status: HealthStatus, detail: Option<String>) -> bool {
        self.update(name, |entry| {
            entry.status = status;
            entry.detail = detail;
        })
    }

    /// Apply a polled report: counts as a heartbeat
    pub fn apply_report(&self, name: &str, report: HealthReport) -> bool {
        self.update(name, |entry| {
            entry.beat();
            if report.status == HealthStatus::Healthy {
                entry.consecutive_failures = 0;
            }
            entry.status = report.status;
            entry.detail = report.detail;
            if report.last_error.is_some() {
                entry.last_error = report.last_error;
            }
        })
    }

    pub fn get(&self, name: &str) -> Option<ComponentHealth> {
        self.entries.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let mut components: Vec<ComponentHealth> = self.entries.read().values().cloned().collect();
        components.sort_by(|a, b| a.name.cmp(&b.name));
        HealthSnapshot {
            overall: aggregate_status(components.iter().map(|c| c.status)),
            components,
            taken_at: Utc::now(),
        }
    }

    /// Mark entries in `names` whose last heartbeat is older than `max_age` Unhealthy
    fn expire_stale(&self, names: &[String], max_age: Duration, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        let mut entries = self.entries.write();
        for name in names {
            let Some(entry) = entries.get_mut(name) else { continue };
            if entry.status == HealthStatus::Stopped {
                continue;
            }
            let stale = match entry.heartbeat_at {
                Some(at) => now.saturating_duration_since(at) > max_age,
                None => true,
            };
            if stale && entry.status != HealthStatus::Unhealthy {
                entry.status = HealthStatus::Unhealthy;
                entry.detail = Some("missed heartbeat".to_string());
                expired.push(name.clone());
            }
        }
        expired
    }

    fn update<F: FnOnce(&mut ComponentHealth)>(&self, name: &str, f: F) -> bool {
        match self.entries.write().get_mut(name) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub poll_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Missed heartbeat windows tolerated before a component is Unhealthy
    pub missed_threshold: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(10),
            missed_threshold: 3,
        }
    }
}

struct MonitorState {
    registry: Arc<HealthRegistry>,
    config: HealthMonitorConfig,
    probes: RwLock<Vec<Arc<dyn Component>>>,
    latest: RwLock<HealthSnapshot>,
}

pub struct HealthMonitor {
    state: Arc<MonitorState>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<HealthRegistry>, config: HealthMonitorConfig) -> Self {
        let latest = registry.snapshot();
        Self {
            state: Arc::new(MonitorState {
                registry,
                config,
                probes: RwLock::new(Vec::new()),
                latest: RwLock::new(latest),
            }),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn add_probe(&self, component: Arc<dyn Component>) {
        self.state.registry.register(component.name(), component.component_type());
        self.state.probes.write().push(component);
    }

    pub fn registry(&self) -> &Arc<HealthRegistry> {
        &self.state.registry
    }

    /// Latest aggregated snapshot (what a status endpoint would serve)
    pub fn latest(&self) -> HealthSnapshot {
        self.state.latest.read().clone()
    }

    pub async fn poll_once(&self) -> HealthSnapshot {
        self.state.poll_once().await
    }
}

impl MonitorState {
    /// Poll every probe once, expire missed heartbeats, publish the snapshot
    async fn poll_once(&self) -> HealthSnapshot {
        let probes: Vec<Arc<dyn Component>> = self.probes.read().clone();
        let mut names = Vec::with_capacity(probes.len());

        for probe in probes {
            let name = probe.name().to_string();
            match tokio::time::timeout(self.config.heartbeat_timeout, probe.health()).await {
                Ok(report) => {
                    self.registry.apply_report(&name, report);
                }
                Err(_) => {
                    log::warn!("⚠️  Health probe for '{}' timed out", name);
                }
            }
            names.push(name);
        }

        let max_age = self.config.heartbeat_timeout * self.config.missed_threshold.max(1);
        for name in self.registry.expire_stale(&names, max_age, Instant::now()) {
            log::warn!("💔 '{}' missed its heartbeat window, marked Unhealthy", name);
        }

        let snapshot = self.registry.snapshot();
        if snapshot.overall != self.latest.read().overall {
            log::info!("🩺 Overall health: {:?}", snapshot.overall);
        }
        *self.latest.write() = snapshot.clone();
        snapshot
    }
}

#[async_trait]
impl Component for HealthMonitor {
    fn name(&self) -> &str {
        "health_monitor"
    }

    fn component_type(&self) -> ComponentType {
        ComponentType::Monitor
    }

    async fn start(&self, _ctx: &CoreContext) -> Result<(), CoreError> {
        let (tx, mut rx) = watch::channel(false);
        let monitor = Arc::clone(&self.state);
        let interval = self.state.config.poll_interval;

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        monitor.poll_once().await;
                    }
                    _ = rx.changed() => break,
                }
            }
        });

        *self.shutdown.lock() = Some(tx);
        *self.task.lock() = Some(handle);
        log::info!("🩺 Health monitor polling every {}ms", interval.as_millis());
        Ok(())
    }

    async fn stop(&self) -> Result<(), CoreError> {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn health(&self) -> HealthReport {
        if self.task.lock().is_some() {
            HealthReport::healthy()
        } else {
            HealthReport::with_status(HealthStatus::Stopped, "not running")
        }
    }
}

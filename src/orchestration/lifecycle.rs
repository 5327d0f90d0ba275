//! Staged startup and reverse-order shutdown of every long-running component

use super::health::{ComponentType, HealthRegistry, HealthReport, HealthStatus};
use crate::bus::EventBus;
use crate::config::CoreConfig;
use crate::connector::ConnectorRegistry;
use crate::error::CoreError;
use crate::storage::EventRepository;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Anything the lifecycle manager starts and stops
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    fn component_type(&self) -> ComponentType;

    async fn start(&self, ctx: &CoreContext) -> Result<(), CoreError>;

    async fn stop(&self) -> Result<(), CoreError>;

    async fn health(&self) -> HealthReport;
}

/// Startup order; shutdown runs the reverse
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Bus,
    Storage,
    Processors,
    Connectors,
    Streaming,
    Scheduler,
    Monitor,
}

/// Shared collaborators handed to every component at start
#[derive(Clone)]
pub struct CoreContext {
    pub bus: Arc<dyn EventBus>,
    pub health: Arc<HealthRegistry>,
    pub repository: Arc<dyn EventRepository>,
    pub connectors: Arc<ConnectorRegistry>,
    pub config: Arc<CoreConfig>,
}

struct Managed {
    stage: Stage,
    component: Arc<dyn Component>,
}

pub struct LifecycleManager {
    ctx: CoreContext,
    components: Vec<Managed>,
    started: Vec<Arc<dyn Component>>,
    grace: Duration,
    stopped: AtomicBool,
}

impl LifecycleManager {
    pub fn new(ctx: CoreContext) -> Self {
        let grace = ctx.config.lifecycle.shutdown_grace;
        Self {
            ctx,
            components: Vec::new(),
            started: Vec::new(),
            grace,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn context(&self) -> &CoreContext {
        &self.ctx
    }

    /// Register a component; ordering inside a stage follows insertion
    pub fn add(&mut self, stage: Stage, component: Arc<dyn Component>) {
        self.ctx.health.register(component.name(), component.component_type());
        self.components.push(Managed { stage, component });
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Start everything in stage order
    ///
    /// On the first failure the components already started are stopped in
    /// reverse and the failure is returned as `CoreError::Startup`.
    pub async fn startup(&mut self) -> Result<(), CoreError> {
        let mut order: Vec<&Managed> = self.components.iter().collect();
        order.sort_by_key(|m| m.stage);

        log::info!("🚀 Starting {} components", order.len());
        let mut started: Vec<Arc<dyn Component>> = Vec::with_capacity(order.len());

        for managed in order {
            let component = managed.component.clone();
            let name = component.name().to_string();
            match component.start(&self.ctx).await {
                Ok(()) => {
                    log::info!("   ├─ {:?}: {} started", managed.stage, name);
                    let report = component.health().await;
                    self.ctx.health.apply_report(&name, report);
                    started.push(component);
                }
                Err(e) => {
                    log::error!("❌ {} failed to start: {}", name, e);
                    self.ctx
                        .health
                        .report_failure(&name, &e.to_string(), HealthStatus::Unhealthy);
                    stop_all(&started, self.grace, &self.ctx.health).await;
                    return Err(CoreError::Startup {
                        component: name,
                        source: Box::new(e),
                    });
                }
            }
        }

        log::info!("   └─ All components running");
        self.started = started;
        self.stopped.store(false, Ordering::Release);
        Ok(())
    }

    /// Stop started components in reverse order; safe to call twice
    pub async fn shutdown(&mut self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let started = std::mem::take(&mut self.started);
        if started.is_empty() {
            return;
        }
        log::info!("🛑 Shutting down {} components", started.len());
        stop_all(&started, self.grace, &self.ctx.health).await;
        log::info!("✅ Shutdown complete");
    }
}

async fn stop_all(started: &[Arc<dyn Component>], grace: Duration, health: &HealthRegistry) {
    for component in started.iter().rev() {
        let name = component.name().to_string();
        match tokio::time::timeout(grace, component.stop()).await {
            Ok(Ok(())) => log::info!("   ├─ {} stopped", name),
            Ok(Err(e)) => log::warn!("⚠️  {} failed to stop cleanly: {}", name, e),
            Err(_) => log::warn!("⚠️  {} did not stop within {}ms", name, grace.as_millis()),
        }
        health.remove(&name);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use crate::storage::MemoryRepository;
    use parking_lot::Mutex;

    pub(crate) fn test_context() -> CoreContext {
        CoreContext {
            bus: Arc::new(InProcessBus::new()),
            health: Arc::new(HealthRegistry::new()),
            repository: Arc::new(MemoryRepository::new()),
            connectors: Arc::new(ConnectorRegistry::new()),
            config: Arc::new(CoreConfig::default()),
        }
    }

    struct Step {
        name: String,
        fail_start: bool,
        hang_stop: bool,
        journal: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Component for Step {
        fn name(&self) -> &str {
            &self.name
        }

        fn component_type(&self) -> ComponentType {
            ComponentType::Processor
        }

        async fn start(&self, _ctx: &CoreContext) -> Result<(), CoreError> {
            if self.fail_start {
                return Err(CoreError::other("boom"));
            }
            self.journal.lock().push(format!("start:{}", self.name));
            Ok(())
        }

        async fn stop(&self) -> Result<(), CoreError> {
            if self.hang_stop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.journal.lock().push(format!("stop:{}", self.name));
            Ok(())
        }

        async fn health(&self) -> HealthReport {
            HealthReport::healthy()
        }
    }

    fn step(name: &str, journal: &Arc<Mutex<Vec<String>>>) -> Step {
        Step {
            name: name.to_string(),
            fail_start: false,
            hang_stop: false,
            journal: journal.clone(),
        }
    }

    #[tokio::test]
    async fn test_startup_follows_stages_and_shutdown_reverses() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut manager = LifecycleManager::new(test_context());
        manager.add(Stage::Streaming, Arc::new(step("ws", &journal)));
        manager.add(Stage::Bus, Arc::new(step("bus", &journal)));
        manager.add(Stage::Connectors, Arc::new(step("binance", &journal)));
        manager.add(Stage::Connectors, Arc::new(step("okx", &journal)));

        manager.startup().await.unwrap();
        assert_eq!(
            manager.context().health.get("okx").unwrap().status,
            HealthStatus::Healthy
        );

        manager.shutdown().await;
        manager.shutdown().await;

        assert_eq!(
            *journal.lock(),
            vec![
                "start:bus",
                "start:binance",
                "start:okx",
                "start:ws",
                "stop:ws",
                "stop:okx",
                "stop:binance",
                "stop:bus",
            ]
        );
        assert!(manager.context().health.is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut manager = LifecycleManager::new(test_context());
        manager.add(Stage::Bus, Arc::new(step("bus", &journal)));
        manager.add(Stage::Storage, Arc::new(step("store", &journal)));
        let mut broken = step("broken", &journal);
        broken.fail_start = true;
        manager.add(Stage::Processors, Arc::new(broken));
        manager.add(Stage::Streaming, Arc::new(step("ws", &journal)));

        match manager.startup().await.unwrap_err() {
            CoreError::Startup { component, .. } => assert_eq!(component, "broken"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            *journal.lock(),
            vec!["start:bus", "start:store", "stop:store", "stop:bus"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_continues_past_hung_component() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut manager = LifecycleManager::new(test_context()).with_grace(Duration::from_millis(50));
        manager.add(Stage::Bus, Arc::new(step("bus", &journal)));
        let mut hung = step("hung", &journal);
        hung.hang_stop = true;
        manager.add(Stage::Streaming, Arc::new(hung));

        manager.startup().await.unwrap();
        manager.shutdown().await;

        assert_eq!(*journal.lock(), vec!["start:bus", "start:hung", "stop:bus"]);
    }
}

//! Wires every subsystem into one lifecycle
//!
//! Stage order on startup: bus, storage, processors, connectors, streaming,
//! scheduler, health monitor. Shutdown runs the same list backwards.
//!
//! Scheduler jobs created here:
//! - `poll:{connector}` for every poll-mode connector, at its poll interval
//! - `processor_tick` closes expired processor windows
//! - `storage_flush` retries the storage sink's backlog

use crate::bus::{BusComponent, CrossProcessBus, EventBus, InProcessBus, RedisBroker};
use crate::config::{BusBackend, CoreConfig, StorageBackend};
use crate::connector::{ConnectorDriver, ConnectorMode, ConnectorRegistry};
use crate::error::CoreError;
use crate::event::new_event_id;
use crate::orchestration::{
    Component, CoreContext, HealthMonitor, HealthRegistry, HealthSnapshot, Job, LifecycleManager, RetryPolicy,
    Schedule, Scheduler, Stage,
};
use crate::processor::{PositionInference, ProcessorHost, SignalGeneration, TraderScoring};
use crate::storage::{EventRepository, MemoryRepository, SqliteEventRepository, StorageSink};
use crate::streaming::StreamingServer;
use chrono::Utc;
use std::sync::Arc;

pub struct Runtime {
    lifecycle: LifecycleManager,
    scheduler: Arc<Scheduler>,
    monitor: Arc<HealthMonitor>,
    sink: Arc<StorageSink>,
    streaming: Option<Arc<StreamingServer>>,
    drivers: Vec<Arc<ConnectorDriver>>,
    processors: Vec<Arc<ProcessorHost>>,
}

fn build_bus(config: &CoreConfig) -> Result<Arc<dyn EventBus>, CoreError> {
    let local = Arc::new(InProcessBus::with_handler_timeout(config.bus.handler_timeout));
    match config.bus.backend {
        BusBackend::Memory => Ok(local),
        BusBackend::Redis => {
            let url = config
                .bus
                .redis_url
                .as_deref()
                .ok_or_else(|| CoreError::other("redis backend selected without MARKETFLOW_REDIS_URL"))?;
            let broker = Arc::new(RedisBroker::new(url)?);
            let instance_id = config.bus.instance_id.clone().unwrap_or_else(new_event_id);
            Ok(Arc::new(CrossProcessBus::with_instance_id(local, broker, instance_id)))
        }
    }
}

fn build_repository(config: &CoreConfig) -> Result<Arc<dyn EventRepository>, CoreError> {
    match config.storage.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryRepository::new())),
        StorageBackend::Sqlite => Ok(Arc::new(SqliteEventRepository::open(&config.storage.db_path)?)),
    }
}

impl Runtime {
    /// Build the full runtime from configuration
    pub fn build(config: CoreConfig, registry: ConnectorRegistry) -> Result<Self, CoreError> {
        config.validate()?;
        let bus = build_bus(&config)?;
        let repository = build_repository(&config)?;
        Self::assemble(config, registry, bus, repository)
    }

    /// Build around an existing bus and repository
    pub fn assemble(
        config: CoreConfig,
        registry: ConnectorRegistry,
        bus: Arc<dyn EventBus>,
        repository: Arc<dyn EventRepository>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let health = Arc::new(HealthRegistry::new());
        let config = Arc::new(config);
        let registry = Arc::new(registry);

        let ctx = CoreContext {
            bus: bus.clone(),
            health: health.clone(),
            repository: repository.clone(),
            connectors: registry.clone(),
            config: config.clone(),
        };
        let mut lifecycle = LifecycleManager::new(ctx);
        let scheduler = Arc::new(Scheduler::new(health.clone(), config.lifecycle.shutdown_grace));
        let monitor = Arc::new(HealthMonitor::new(health.clone(), config.health.clone()));

        let mut probes: Vec<Arc<dyn Component>> = Vec::new();
        let mut add = |lifecycle: &mut LifecycleManager, stage: Stage, component: Arc<dyn Component>| {
            probes.push(component.clone());
            lifecycle.add(stage, component);
        };

        add(&mut lifecycle, Stage::Bus, Arc::new(BusComponent::new(bus.clone())));

        let sink = Arc::new(StorageSink::new(repository, config.storage.sink.clone()));
        add(&mut lifecycle, Stage::Storage, sink.clone());

        // a bad weight set fails here, before anything starts
        let scoring = TraderScoring::new(config.processors.weights)?;
        let processors = vec![
            Arc::new(ProcessorHost::new(Box::new(PositionInference::new()))),
            Arc::new(ProcessorHost::new(Box::new(scoring))),
            Arc::new(ProcessorHost::new(Box::new(SignalGeneration::new(
                config.processors.signal.clone(),
            )))),
        ];
        for host in &processors {
            add(&mut lifecycle, Stage::Processors, host.clone());
        }

        let mut drivers = Vec::new();
        for settings in &config.connectors.instances {
            let connector = registry.build(settings)?;
            let driver = Arc::new(ConnectorDriver::new(
                connector,
                bus.clone(),
                config.connectors.tracker.clone(),
            ));
            add(&mut lifecycle, Stage::Connectors, driver.clone());

            if driver.mode() == ConnectorMode::Poll {
                let polled = driver.clone();
                let schedule = Schedule::every(settings.poll_interval());
                let job = Job::new(format!("poll:{}", settings.name), schedule, move || {
                    let driver = polled.clone();
                    async move {
                        driver.poll_once().await;
                        Ok(())
                    }
                })
                .with_retry(RetryPolicy::none());
                scheduler.register(job)?;
            }
            drivers.push(driver);
        }

        let streaming = if config.streaming.enabled {
            let server = Arc::new(StreamingServer::new(config.streaming.clone()));
            add(&mut lifecycle, Stage::Streaming, server.clone());
            Some(server)
        } else {
            None
        };

        let ticked = processors.clone();
        scheduler.register(
            Job::new("processor_tick", Schedule::every(config.scheduler.tick_interval), move || {
                let hosts = ticked.clone();
                async move {
                    let now = Utc::now();
                    for host in &hosts {
                        host.tick(now);
                    }
                    Ok(())
                }
            })
            .with_retry(RetryPolicy::none()),
        )?;

        let flushed = sink.clone();
        scheduler.register(
            Job::new("storage_flush", Schedule::every(config.scheduler.flush_interval), move || {
                let sink = flushed.clone();
                async move { sink.flush_buffer().await.map(|_| ()).map_err(CoreError::from) }
            })
            .with_retry(config.scheduler.retry.clone()),
        )?;

        add(&mut lifecycle, Stage::Scheduler, scheduler.clone());

        for probe in probes {
            monitor.add_probe(probe);
        }
        lifecycle.add(Stage::Monitor, monitor.clone());

        Ok(Self {
            lifecycle,
            scheduler,
            monitor,
            sink,
            streaming,
            drivers,
            processors,
        })
    }

    pub async fn start(&mut self) -> Result<(), CoreError> {
        let ctx = self.lifecycle.context();
        log::info!("⚙️  marketflow runtime");
        log::info!("   ├─ Bus: {} backend", ctx.bus.backend());
        log::info!("   ├─ Storage: {}", ctx.repository.name());
        log::info!("   ├─ Connectors: {}", self.drivers.len());
        log::info!("   ├─ Processors: {}", self.processors.len());
        log::info!("   └─ Jobs: {}", self.scheduler.job_names().join(", "));
        self.lifecycle.startup().await?;
        log::info!("✅ marketflow running ({} components)", self.lifecycle.len());
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        log::info!("⚠️  Shutting down marketflow...");
        self.lifecycle.shutdown().await;
        log::info!("✅ marketflow stopped");
    }

    pub fn context(&self) -> &CoreContext {
        self.lifecycle.context()
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.lifecycle.context().bus
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn sink(&self) -> &Arc<StorageSink> {
        &self.sink
    }

    pub fn streaming(&self) -> Option<&Arc<StreamingServer>> {
        self.streaming.as_ref()
    }

    pub fn drivers(&self) -> &[Arc<ConnectorDriver>] {
        &self.drivers
    }

    pub fn processors(&self) -> &[Arc<ProcessorHost>] {
        &self.processors
    }

    /// Poll every component now and return the aggregated snapshot
    pub async fn health(&self) -> HealthSnapshot {
        self.monitor.poll_once().await
    }

    pub fn latest_health(&self) -> HealthSnapshot {
        self.monitor.latest()
    }
}

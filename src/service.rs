//! EMS gateway service
//!
//! Wires the configuration to the transports and the controller and drives
//! [`BusController::run_loop`] from a tokio interval. One service runs one
//! primary bus and, optionally, one forwarded segment.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::boiler_state::{BoilerParamsSnapshot, BoilerStateSnapshot};
use crate::config::EmsConfig;
use crate::controller::{BusController, ControllerStats};
use crate::error::{EmsError, EmsResult};
use crate::forwarder::Forwarder;
use crate::logging::CallbackLogger;
use crate::metrics::EnergyMetrics;
use crate::transport::{BusPort, BusTransport, SerialBusPort, TransportHandle, TransportStats};

/// Lifecycle of a bus service
#[async_trait]
pub trait BusService: Send + Sync {
    /// Open the ports and start all tasks
    async fn start(&mut self) -> EmsResult<()>;

    /// Stop all tasks and wait for them to finish
    async fn stop(&mut self) -> EmsResult<()>;

    fn is_running(&self) -> bool;

    fn get_stats(&self) -> ServiceStats;
}

/// Service statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceStats {
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
    pub loop_iterations: u64,
    pub forwarder_enabled: bool,
}

/// Everything an application exports about the bus, ready for JSON
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub boiler: BoilerStateSnapshot,
    pub params: BoilerParamsSnapshot,
    pub controller: ControllerStats,
    pub transport: TransportStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarder: Option<TransportStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarder_queued: Option<usize>,
    pub service: ServiceStats,
}

/// Gateway service: primary transport, optional forwarder, controller and loop task
pub struct EmsService {
    config: EmsConfig,
    logger: CallbackLogger,
    metrics: Arc<EnergyMetrics>,
    controller: Option<Arc<BusController>>,
    transport: Option<TransportHandle>,
    forwarder: Option<Forwarder>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    running: Arc<AtomicBool>,
    loop_iterations: Arc<AtomicU64>,
    started: Option<(Instant, DateTime<Utc>)>,
}

impl EmsService {
    pub fn new(config: EmsConfig) -> EmsResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            logger: CallbackLogger::disabled(),
            metrics: Arc::new(EnergyMetrics::new()),
            controller: None,
            transport: None,
            forwarder: None,
            tasks: Vec::new(),
            shutdown_tx: None,
            running: Arc::new(AtomicBool::new(false)),
            loop_iterations: Arc::new(AtomicU64::new(0)),
            started: None,
        })
    }

    /// Telegram logger handed to the controller on start
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &EmsConfig {
        &self.config
    }

    /// Available once the service has been started
    pub fn controller(&self) -> Option<&Arc<BusController>> {
        self.controller.as_ref()
    }

    pub fn metrics(&self) -> &Arc<EnergyMetrics> {
        &self.metrics
    }

    /// Start on already opened ports
    ///
    /// `secondary` is used only when the forwarder is enabled in the
    /// configuration.
    pub async fn start_with_ports<P, S>(&mut self, primary: P, secondary: Option<S>) -> EmsResult<()>
    where
        P: BusPort + 'static,
        S: BusPort + 'static,
    {
        if self.running.load(Ordering::SeqCst) {
            return Err(EmsError::internal("EMS service is already running"));
        }

        let forwarder = match (self.config.forwarder.enabled, secondary) {
            (true, Some(port)) => Some(Forwarder::start(
                port,
                self.config.forwarder_transport_config(),
                self.config.forwarder.queue_capacity,
            )),
            (true, None) => {
                return Err(EmsError::configuration("forwarder enabled but no secondary port given"));
            }
            (false, _) => None,
        };

        let (mut transport, handle) = BusTransport::new(primary, self.config.transport_config());
        if let Some(forwarder) = &forwarder {
            transport = transport.with_forwarder(forwarder.hook());
        }

        let controller = Arc::new(
            BusController::new(self.config.controller_config(), Arc::new(handle.clone()))
                .with_logger(self.logger.clone()),
        );
        self.metrics.subscribe(&controller);

        let (shutdown_tx, _) = broadcast::channel(1);
        let loop_task = self.spawn_loop(controller.clone(), shutdown_tx.subscribe());
        self.tasks.push(transport.spawn(controller.clone()));
        self.tasks.push(loop_task);

        info!("EMS service started on {}", self.config.bus.port);
        info!("   - device id: 0x{:02X}", self.config.controller.device_id);
        info!("   - loop interval: {:?}", self.config.loop_interval());
        if forwarder.is_some() {
            info!("   - forwarding to {}", self.config.forwarder.port);
        }

        self.controller = Some(controller);
        self.transport = Some(handle);
        self.forwarder = forwarder;
        self.shutdown_tx = Some(shutdown_tx);
        self.started = Some((Instant::now(), Utc::now()));
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_loop(&self, controller: Arc<BusController>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let period = self.config.loop_interval();
        let iterations = self.loop_iterations.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        controller.run_loop();
                        iterations.fetch_add(1, Ordering::Relaxed);
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("controller loop received shutdown");
                        break;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        })
    }

    /// Snapshot of the aggregates and all statistics
    pub fn status(&self) -> Option<ServiceStatus> {
        let controller = self.controller.as_ref()?;
        let transport = self.transport.as_ref()?;
        Some(ServiceStatus {
            boiler: controller.boiler_state().snapshot(),
            params: controller.boiler_params().snapshot(),
            controller: controller.get_stats(),
            transport: transport.get_stats(),
            forwarder: self.forwarder.as_ref().map(|f| f.handle().get_stats()),
            forwarder_queued: self.forwarder.as_ref().map(|f| f.queues().total_len()),
            service: self.get_stats(),
        })
    }

    pub fn status_json(&self) -> EmsResult<String> {
        let status = self
            .status()
            .ok_or_else(|| EmsError::internal("EMS service has not been started"))?;
        Ok(serde_json::to_string(&status)?)
    }
}

#[async_trait]
impl BusService for EmsService {
    async fn start(&mut self) -> EmsResult<()> {
        let primary = SerialBusPort::open(&self.config.transport_config())?;
        let secondary = if self.config.forwarder.enabled {
            Some(SerialBusPort::open(&self.config.forwarder_transport_config())?)
        } else {
            None
        };
        self.start_with_ports(primary, secondary).await
    }

    async fn stop(&mut self) -> EmsResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = &self.transport {
            handle.shutdown();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.stop().await;
        }

        for result in futures::future::join_all(self.tasks.drain(..)).await {
            if let Err(e) = result {
                error!("EMS service task failed: {}", e);
            }
        }

        self.running.store(false, Ordering::SeqCst);
        if self.controller.is_some() {
            info!("EMS service stopped");
        } else {
            warn!("EMS service stopped before it was started");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn get_stats(&self) -> ServiceStats {
        ServiceStats {
            started_at: self.started.map(|(_, at)| at),
            uptime_seconds: self.started.map_or(0, |(since, _)| since.elapsed().as_secs()),
            loop_iterations: self.loop_iterations.load(Ordering::Relaxed),
            forwarder_enabled: self.config.forwarder.enabled,
        }
    }
}

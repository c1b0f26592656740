//! # EMS Bus Controller
//!
//! The protocol state machine sitting between the transport and the
//! application.
//!
//! ## Threads of control
//!
//! - **Transport task**: calls [`FrameHandler::process_frame`] for every frame.
//!   Polls are answered right there (a queued telegram or a bare pong), other
//!   frames are decoded and pushed onto the process queue. Nothing in this path
//!   blocks for longer than a short lock.
//! - **Application**: calls [`BusController::run_loop`] periodically. It drains
//!   the process queue, answers read requests, dispatches telegrams to the
//!   registered handlers and issues the periodic requests.
//!
//! ## Recovery
//!
//! A send queue overflow or too many transmissions without an echo trigger a
//! full [`BusController::reset`]: the transport resynchronises, the send queue
//! and the boiler aggregates are cleared, and the startup requests go out again.
//!
//! ```rust
//! use std::sync::Arc;
//! use ems_bus::{BusController, BusLink, ControllerConfig};
//!
//! struct Null;
//!
//! impl BusLink for Null {
//!     fn transmit(&self, _frame: &[u8]) -> bool { true }
//!     fn reset(&self) {}
//! }
//!
//! let controller = BusController::new(ControllerConfig::default(), Arc::new(Null));
//! controller.register_handler(0x00D1, |telegram| println!("outdoor: {}", telegram));
//! controller.change_state(true, 55);
//! assert!(controller.send_queue_len() > 0);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::boiler_state::{BoilerParams, BoilerState};
use crate::logging::{CallbackLogger, Direction};
use crate::protocol::{
    classify_frame, DeviceId, FrameKind, Telegram, TypeId, ADDRESS_MASK, BROADCAST_ID, MAX_DATA_LENGTH,
};
use crate::transport::{BusLink, FrameHandler};
use crate::utils::format::format_duration;
use crate::utils::PeriodicTimer;
use crate::views::{
    external_controller_request, heating_state_request, types, DeviceVersion, Factory,
    InternalWeatherCompensatedMode, MonitorFastPlus, MonitorSlowPlus, MonitorSlowPlus2, MonitorWWPlus,
    OutdoorTemp, Parameters, ParametersPlus, ParametersWWPlus, ProtocolVersion,
};

/// Telegram consumer registered per type id
pub type TelegramHandler = Box<dyn Fn(&Telegram) + Send + Sync>;

pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 59;
pub const DEFAULT_MAX_UNCONFIRMED: usize = 15;

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Our bus address
    pub device_id: DeviceId,
    /// Address of the boiler
    pub boiler_id: DeviceId,
    /// Or-ed into our id for the poll acknowledgment
    pub address_mask: u8,
    pub send_queue_capacity: usize,
    /// Unconfirmed transmissions tolerated before a reset
    pub max_unconfirmed: usize,
    /// Interval of the external-controller announcement
    pub parameters_interval: Duration,
    /// Interval of the parameter and sensor reads
    pub details_interval: Duration,
    /// Issue the startup batch on construction and after every reset
    pub startup_requests: bool,
    /// Master switch; when off the loop and the commands do nothing
    pub enabled: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            device_id: 0x19,
            boiler_id: 0x08,
            address_mask: ADDRESS_MASK,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            max_unconfirmed: DEFAULT_MAX_UNCONFIRMED,
            parameters_interval: Duration::from_secs(119),
            details_interval: Duration::from_secs(179),
            startup_requests: true,
            enabled: true,
        }
    }
}

/// Controller statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerStats {
    pub polls_received: u64,
    pub pongs_sent: u64,
    pub telegrams_sent: u64,
    pub echoes_confirmed: u64,
    pub frames_not_for_us: u64,
    pub runt_frames: u64,
    pub telegrams_decoded: u64,
    pub decode_errors: u64,
    pub telegrams_dispatched: u64,
    pub read_requests_answered: u64,
    pub unknown_types: u64,
    pub resets: u64,
    pub telegrams_dropped: u64,
}

/// Outbound queue with a priority lane
///
/// Priority entries always leave before normal ones; each lane is FIFO.
#[derive(Debug)]
pub struct SendQueue {
    priority: VecDeque<Telegram>,
    normal: VecDeque<Telegram>,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            priority: VecDeque::new(),
            normal: VecDeque::new(),
            capacity,
        }
    }

    /// Hands the telegram back when the queue is full
    pub fn push(&mut self, telegram: Telegram, priority: bool) -> Result<(), Telegram> {
        if self.is_full() {
            return Err(telegram);
        }
        if priority {
            self.priority.push_back(telegram);
        } else {
            self.normal.push_back(telegram);
        }
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Telegram> {
        self.priority.pop_front().or_else(|| self.normal.pop_front())
    }

    pub fn len(&self) -> usize {
        self.priority.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Drop everything, returning how many telegrams were lost
    pub fn clear(&mut self) -> usize {
        let dropped = self.len();
        self.priority.clear();
        self.normal.clear();
        dropped
    }
}

struct PeriodicRequests {
    parameters: PeriodicTimer,
    details: PeriodicTimer,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Poll-driven protocol state machine for one bus
pub struct BusController {
    config: ControllerConfig,
    link: Arc<dyn BusLink>,
    send_queue: Mutex<SendQueue>,
    process_queue: Mutex<VecDeque<Telegram>>,
    handlers: RwLock<HashMap<TypeId, Vec<TelegramHandler>>>,
    tx_not_confirmed: AtomicUsize,
    last_poll: Mutex<Option<Instant>>,
    periodic: Mutex<PeriodicRequests>,
    boiler_state: Arc<BoilerState>,
    boiler_params: Arc<BoilerParams>,
    stats: Mutex<ControllerStats>,
    logger: CallbackLogger,
}

impl BusController {
    /// Create the controller, register the built-in handlers and queue the startup requests
    pub fn new(config: ControllerConfig, link: Arc<dyn BusLink>) -> Self {
        info!(
            target: "ems::controller",
            "controller 0x{:02X} for boiler 0x{:02X}, enabled: {}",
            config.device_id,
            config.boiler_id,
            config.enabled
        );

        let controller = Self {
            send_queue: Mutex::new(SendQueue::new(config.send_queue_capacity)),
            process_queue: Mutex::new(VecDeque::new()),
            handlers: RwLock::new(HashMap::new()),
            tx_not_confirmed: AtomicUsize::new(0),
            last_poll: Mutex::new(None),
            periodic: Mutex::new(PeriodicRequests {
                parameters: PeriodicTimer::new(config.parameters_interval),
                details: PeriodicTimer::new(config.details_interval),
            }),
            boiler_state: Arc::new(BoilerState::new()),
            boiler_params: Arc::new(BoilerParams::new()),
            stats: Mutex::new(ControllerStats::default()),
            logger: CallbackLogger::disabled(),
            link,
            config,
        };

        controller.register_builtin_handlers();
        if controller.config.enabled && controller.config.startup_requests {
            controller.request_startup_data();
        }
        controller
    }

    /// Mirror every received and sent telegram into `logger`
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Subscribe to decoded telegrams of `type_id`
    ///
    /// Handlers for one type run in registration order on the thread calling
    /// [`BusController::run_loop`]. A handler must not register further handlers.
    pub fn register_handler<F>(&self, type_id: TypeId, handler: F)
    where
        F: Fn(&Telegram) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.entry(type_id).or_default().push(Box::new(handler));
    }

    fn register_builtin_handlers(&self) {
        let state = self.boiler_state.clone();
        self.register_handler(types::MONITOR_FAST_PLUS, move |t| {
            let view = MonitorFastPlus::new(t);
            view.log_data();
            state.apply_monitor_fast_plus(&view);
        });

        let state = self.boiler_state.clone();
        self.register_handler(types::MONITOR_SLOW_PLUS, move |t| {
            let view = MonitorSlowPlus::new(t);
            view.log_data();
            state.apply_monitor_slow_plus(&view);
        });

        let state = self.boiler_state.clone();
        self.register_handler(types::MONITOR_SLOW_PLUS_2, move |t| {
            let view = MonitorSlowPlus2::new(t);
            view.log_data();
            state.apply_monitor_slow_plus_2(&view);
        });

        let state = self.boiler_state.clone();
        self.register_handler(types::PARAMETERS_WW_PLUS, move |t| {
            let view = ParametersWWPlus::new(t);
            view.log_data();
            state.apply_parameters_ww_plus(&view);
        });

        let state = self.boiler_state.clone();
        let params = self.boiler_params.clone();
        self.register_handler(types::PARAMETERS_PLUS, move |t| {
            let view = ParametersPlus::new(t);
            view.log_data();
            state.apply_parameters_plus(&view);
            params.apply_parameters_plus(&view);
        });

        let state = self.boiler_state.clone();
        self.register_handler(types::OUTDOOR_TEMP, move |t| {
            let view = OutdoorTemp::new(t);
            view.log_data();
            state.apply_outdoor_temp(&view);
        });

        let state = self.boiler_state.clone();
        self.register_handler(types::MONITOR_WW_PLUS, move |t| {
            let view = MonitorWWPlus::new(t);
            view.log_data();
            state.apply_monitor_ww_plus(&view);
        });

        let state = self.boiler_state.clone();
        self.register_handler(types::PROTOCOL_VERSION, move |t| {
            let view = ProtocolVersion::new(t);
            view.log_data();
            state.apply_protocol_version(&view);
        });

        self.register_handler(types::INTERNAL_WEATHER_COMPENSATED, |t| {
            InternalWeatherCompensatedMode::new(t).log_data()
        });
        self.register_handler(types::DEVICE_VERSION, |t| DeviceVersion::new(t).log_data());
        self.register_handler(types::FACTORY, |t| Factory::new(t).log_data());
        self.register_handler(types::PARAMETERS, |t| Parameters::new(t).log_data());
    }

    /// Answer a poll; returns `false` when the poll is for another device
    pub fn process_poll(&self, device_id: DeviceId) -> bool {
        let unconfirmed = self.tx_not_confirmed.load(Ordering::SeqCst);
        if unconfirmed > self.config.max_unconfirmed {
            let since_poll = self.last_poll().map_or_else(|| "never".to_string(), format_duration);
            error!(
                target: "ems::controller",
                "{} transmissions not confirmed, last poll: {}",
                unconfirmed,
                since_poll
            );
            self.reset_with("unconfirmed transmissions");
        }

        if device_id != self.config.device_id {
            return false;
        }

        *lock(&self.last_poll) = Some(Instant::now());
        self.update_stats(|s| s.polls_received += 1);

        let next = {
            let mut queue = lock(&self.send_queue);
            let next = queue.pop();
            if next.is_some() {
                trace!(target: "ems::controller", "poll, telegrams left in queue: {}", queue.len());
            }
            next
        };

        if let Some(telegram) = next {
            if self.link.transmit(&telegram.encode()) {
                self.logger.log_telegram(Direction::Sent, &telegram);
                self.tx_not_confirmed.fetch_add(1, Ordering::SeqCst);
                self.update_stats(|s| s.telegrams_sent += 1);
                return true;
            }
            error!(target: "ems::controller", "transport refused {}, answering with a pong", telegram);
            self.update_stats(|s| s.telegrams_dropped += 1);
        }

        self.link.transmit(&[self.config.device_id | self.config.address_mask]);
        self.update_stats(|s| s.pongs_sent += 1);
        true
    }

    fn process_telegram(&self, frame: &[u8]) {
        let own_id = self.config.device_id;
        let destination = frame[1];

        if destination != BROADCAST_ID && destination & !ADDRESS_MASK != own_id {
            if frame[0] & !ADDRESS_MASK == own_id {
                let _ = self
                    .tx_not_confirmed
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
                self.update_stats(|s| s.echoes_confirmed += 1);
                trace!(target: "ems::controller", "telegram sent from us");
            } else {
                self.update_stats(|s| s.frames_not_for_us += 1);
                trace!(
                    target: "ems::controller",
                    "telegram not for us, src: 0x{:02X} dst: 0x{:02X}",
                    frame[0] & !ADDRESS_MASK,
                    destination & !ADDRESS_MASK
                );
            }
            match Telegram::decode(frame) {
                Ok(telegram) => trace!(target: "ems::controller", "{}", telegram),
                Err(e) => trace!(target: "ems::controller", "error decoding foreign telegram: {}", e),
            }
            return;
        }

        match Telegram::decode(frame) {
            Ok(telegram) => {
                self.logger.log_telegram(Direction::Received, &telegram);
                lock(&self.process_queue).push_back(telegram);
                self.update_stats(|s| s.telegrams_decoded += 1);
            }
            Err(e) => {
                self.update_stats(|s| s.decode_errors += 1);
                trace!(target: "ems::controller", "error decoding telegram: {}", e);
            }
        }
    }

    /// Drain received telegrams and issue due periodic requests
    pub fn run_loop(&self) {
        if !self.config.enabled {
            return;
        }
        self.process_telegrams();
        self.request_periodic_data();
    }

    fn process_telegrams(&self) {
        loop {
            let Some(telegram) = lock(&self.process_queue).pop_front() else {
                break;
            };

            if telegram.operation().is_read() {
                self.process_read_request(&telegram);
                continue;
            }

            let handlers = self.handlers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            match handlers.get(&telegram.type_id()) {
                Some(registered) => {
                    for handler in registered {
                        handler(&telegram);
                    }
                    self.update_stats(|s| s.telegrams_dispatched += 1);
                }
                None => {
                    self.update_stats(|s| s.unknown_types += 1);
                    debug!(target: "ems::controller", "unknown telegram ID: 0x{:04X}", telegram.type_id());
                }
            }
        }
    }

    /// Every read addressed to us gets a write back, empty unless we know the type
    fn process_read_request(&self, request: &Telegram) {
        debug!(
            target: "ems::controller",
            "read request for 0x{:04X} from 0x{:02X}",
            request.type_id(),
            request.source()
        );

        let reply = if request.type_id() == types::DEVICE_VERSION {
            DeviceVersion::reply(self.config.device_id, request.source(), request.offset(), request.requested_len())
        } else {
            debug!(target: "ems::controller", "replying to 0x{:02X} with an empty write", request.source());
            Telegram::write(self.config.device_id, request.source(), 0, request.type_id(), Vec::new())
        };
        self.update_stats(|s| s.read_requests_answered += 1);
        self.enqueue(reply, false);
    }

    fn request_periodic_data(&self) {
        let (parameters_due, details_due) = {
            let mut periodic = lock(&self.periodic);
            (periodic.parameters.duration_passed(), periodic.details.duration_passed())
        };
        let (own, boiler) = (self.config.device_id, self.config.boiler_id);

        if parameters_due {
            debug!(target: "ems::controller", "periodic: external controller announcement");
            self.enqueue(external_controller_request(own, boiler), true);
        }
        if details_due {
            debug!(target: "ems::controller", "periodic: heating and warm water parameters");
            self.enqueue(ParametersWWPlus::request(own, boiler), false);
            self.enqueue(ParametersPlus::request(own, boiler), false);
            self.enqueue(OutdoorTemp::request(own, boiler), false);
            self.enqueue(Factory::request(own, boiler), false);
        }
    }

    fn startup_batch(&self) -> Vec<(Telegram, bool)> {
        let (own, boiler) = (self.config.device_id, self.config.boiler_id);
        vec![
            (external_controller_request(own, boiler), true),
            (ParametersWWPlus::request(own, boiler), false),
            (ParametersPlus::request(own, boiler), false),
            (DeviceVersion::request(own, boiler), false),
            (ProtocolVersion::request(own, boiler), false),
            (Factory::request(own, boiler), false),
            (Telegram::read(own, boiler, types::FACTORY, MAX_DATA_LENGTH as u8), false),
        ]
    }

    /// Queue the "ask for everything" batch
    pub fn request_startup_data(&self) {
        let mut queue = lock(&self.send_queue);
        for (telegram, priority) in self.startup_batch() {
            if queue.push(telegram, priority).is_err() {
                warn!(target: "ems::controller", "send queue full, startup request dropped");
                self.update_stats(|s| s.telegrams_dropped += 1);
            }
        }
    }

    /// Queue a telegram for the next poll; a full queue resets the controller
    pub fn enqueue(&self, telegram: Telegram, priority: bool) {
        let rejected = lock(&self.send_queue).push(telegram, priority);
        if let Err(telegram) = rejected {
            error!(target: "ems::controller", "send queue full, dropping {}", telegram);
            self.update_stats(|s| s.telegrams_dropped += 1);
            self.reset_with("send queue full");
        }
    }

    /// Start heating at `heating_temperature` or stop it
    pub fn change_state(&self, enabled: bool, heating_temperature: u8) {
        debug!(
            target: "ems::controller",
            "change state heating: {} temperature: {}",
            enabled,
            heating_temperature
        );
        if !self.config.enabled {
            debug!(target: "ems::controller", "bus disabled");
            return;
        }
        let temperature = enabled.then_some(heating_temperature);
        self.enqueue(
            heating_state_request(self.config.device_id, self.config.boiler_id, temperature),
            true,
        );
    }

    /// Write the heating temperature unless the boiler already reported it
    pub fn set_heating_temperature(&self, temperature: u8) {
        if !self.config.enabled {
            return;
        }
        let current = self.boiler_params.heating_temperature();
        debug!(
            target: "ems::controller",
            "set heating temperature {}, current {:?}",
            temperature,
            current
        );
        if current == Some(temperature) {
            debug!(target: "ems::controller", "heating temperature already set, skipping");
            return;
        }
        self.enqueue(
            ParametersPlus::set_heating_temperature(self.config.device_id, self.config.boiler_id, temperature),
            false,
        );
    }

    /// Full protocol reset
    pub fn reset(&self) {
        self.reset_with("requested");
    }

    fn reset_with(&self, reason: &str) {
        error!(target: "ems::controller", "reset: {}", reason);
        self.link.reset();
        self.tx_not_confirmed.store(0, Ordering::SeqCst);
        let dropped = lock(&self.send_queue).clear();
        self.boiler_state.clear();
        self.boiler_params.clear();
        self.update_stats(|s| {
            s.resets += 1;
            s.telegrams_dropped += dropped as u64;
        });

        if self.config.enabled && self.config.startup_requests {
            self.request_startup_data();
        }
    }

    pub fn boiler_state(&self) -> &Arc<BoilerState> {
        &self.boiler_state
    }

    pub fn boiler_params(&self) -> &Arc<BoilerParams> {
        &self.boiler_params
    }

    pub fn send_queue_len(&self) -> usize {
        lock(&self.send_queue).len()
    }

    pub fn process_queue_len(&self) -> usize {
        lock(&self.process_queue).len()
    }

    pub fn tx_not_confirmed(&self) -> usize {
        self.tx_not_confirmed.load(Ordering::SeqCst)
    }

    /// Time since we were last polled
    pub fn last_poll(&self) -> Option<Duration> {
        lock(&self.last_poll).map(|at| at.elapsed())
    }

    pub fn get_stats(&self) -> ControllerStats {
        lock(&self.stats).clone()
    }

    fn update_stats(&self, update: impl FnOnce(&mut ControllerStats)) {
        update(&mut lock(&self.stats));
    }
}

impl FrameHandler for BusController {
    fn process_frame(&self, frame: &[u8]) {
        match classify_frame(frame) {
            FrameKind::Poll(device_id) => {
                self.process_poll(device_id);
            }
            FrameKind::Telegram => self.process_telegram(frame),
            FrameKind::Runt => {
                self.update_stats(|s| s.runt_frames += 1);
            }
        }
    }
}

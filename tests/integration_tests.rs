//! End-to-end tests: scripted in-memory ports driven through the real
//! transport task, forwarder and controller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_test::{assert_err, assert_ok};

use ems_bus::protocol::calculate_crc;
use ems_bus::views::{types, DeviceVersion};
use ems_bus::utils::logging::init_test_logger;
use ems_bus::{
    BusController, BusLink, BusPort, BusService, BusTransport, ControllerConfig, EmsConfig, EmsResult, EmsService,
    Forwarder, Operation, PortEvent, Telegram, TransportConfig, TransportHandle,
};

/// What the test feeds into a [`MockPort`]
enum Input {
    /// Bytes as they appear on the wire, break marker included
    Frame(Vec<u8>),
    Event(PortEvent),
}

#[derive(Default)]
struct Counters {
    flushes: AtomicUsize,
    event_resets: AtomicUsize,
    breaks: AtomicUsize,
}

/// In-memory UART: input comes from a channel, every transmitted frame goes out on another
struct MockPort {
    input: mpsc::UnboundedReceiver<Input>,
    events: VecDeque<PortEvent>,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    sent: mpsc::UnboundedSender<Vec<u8>>,
    counters: Arc<Counters>,
}

/// Test side of a [`MockPort`]
struct Wire {
    input: mpsc::UnboundedSender<Input>,
    sent: mpsc::UnboundedReceiver<Vec<u8>>,
    counters: Arc<Counters>,
}

fn mock_port() -> (MockPort, Wire) {
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let counters = Arc::new(Counters::default());
    let port = MockPort {
        input: input_rx,
        events: VecDeque::new(),
        rx: VecDeque::new(),
        tx: Vec::new(),
        sent: sent_tx,
        counters: counters.clone(),
    };
    let wire = Wire {
        input: input_tx,
        sent: sent_rx,
        counters,
    };
    (port, wire)
}

#[async_trait]
impl BusPort for MockPort {
    async fn next_event(&mut self) -> EmsResult<PortEvent> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        match self.input.recv().await {
            Some(Input::Frame(bytes)) => {
                for chunk in bytes.chunks(16) {
                    self.events.push_back(PortEvent::Data(chunk.len()));
                }
                self.events.push_back(PortEvent::Break);
                self.rx.extend(bytes);
                Ok(self.events.pop_front().unwrap_or(PortEvent::Break))
            }
            Some(Input::Event(event)) => Ok(event),
            None => std::future::pending().await,
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> EmsResult<()> {
        for slot in buf.iter_mut() {
            *slot = self.rx.pop_front().unwrap_or(0);
        }
        Ok(())
    }

    async fn write_byte(&mut self, byte: u8) -> EmsResult<()> {
        self.tx.push(byte);
        Ok(())
    }

    async fn set_tx_inverted(&mut self, inverted: bool) -> EmsResult<()> {
        if inverted {
            if self.tx.is_empty() {
                self.counters.breaks.fetch_add(1, Ordering::SeqCst);
            } else {
                let _ = self.sent.send(std::mem::take(&mut self.tx));
            }
        }
        Ok(())
    }

    async fn wait_tx_done(&mut self) -> EmsResult<()> {
        Ok(())
    }

    fn flush_input(&mut self) -> EmsResult<()> {
        self.rx.clear();
        self.counters.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reset_events(&mut self) {
        self.events.clear();
        self.counters.event_resets.fetch_add(1, Ordering::SeqCst);
    }
}

impl Wire {
    fn frame(&self, frame: &[u8]) {
        let mut bytes = frame.to_vec();
        bytes.push(0x00);
        assert!(self.input.send(Input::Frame(bytes)).is_ok());
    }

    fn poll(&self, device_id: u8) {
        self.frame(&[device_id]);
    }

    fn event(&self, event: PortEvent) {
        assert!(self.input.send(Input::Event(event)).is_ok());
    }

    async fn next_sent(&mut self) -> Vec<u8> {
        timeout(Duration::from_secs(2), self.sent.recv())
            .await
            .expect("nothing transmitted")
            .expect("port dropped")
    }

    async fn nothing_sent(&mut self) {
        assert!(timeout(Duration::from_millis(100), self.sent.recv()).await.is_err());
    }
}

/// Link that records what the controller asks for without a transport
#[derive(Default)]
struct RecordingLink {
    sent: Mutex<Vec<Vec<u8>>>,
    resets: AtomicUsize,
}

impl BusLink for RecordingLink {
    fn transmit(&self, frame: &[u8]) -> bool {
        self.sent.lock().unwrap().push(frame.to_vec());
        true
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

fn quiet_controller_config() -> ControllerConfig {
    ControllerConfig {
        startup_requests: false,
        ..ControllerConfig::default()
    }
}

fn test_transport_config(name: &str) -> TransportConfig {
    TransportConfig {
        name: name.to_string(),
        rx_timeout: None,
        ..TransportConfig::new("mock").without_delays()
    }
}

struct Harness {
    controller: Arc<BusController>,
    handle: TransportHandle,
    task: JoinHandle<()>,
    wire: Wire,
}

fn start_bus(config: ControllerConfig, transport_config: TransportConfig) -> Harness {
    init_test_logger();
    let (port, wire) = mock_port();
    let (transport, handle) = BusTransport::new(port, transport_config);
    let controller = Arc::new(BusController::new(config, Arc::new(handle.clone())));
    let task = transport.spawn(controller.clone());
    Harness {
        controller,
        handle,
        task,
        wire,
    }
}

impl Harness {
    async fn stop(self) {
        self.handle.shutdown();
        assert_ok!(timeout(Duration::from_secs(2), self.task).await.expect("transport did not stop"));
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
    frame.push(calculate_crc(&frame));
    frame
}

const FAST_PLUS_DATA: [u8; 27] = [
    0x00, 0x2D, 0x2D, 0x00, 0x00, 0xC8, 0x3D, 0x02, 0x6C, 0x64, 0x29, 0x03, 0x00, 0x02, 0x48, 0x00, 0x00, 0x00,
    0x00, 0x01, 0xED, 0x11, 0x00, 0x02, 0x6C, 0x00, 0x00,
];

#[tokio::test]
async fn test_polls_drain_queue_priority_first() {
    let mut bus = start_bus(quiet_controller_config(), test_transport_config("ems"));
    let a = Telegram::read(0x19, 0x08, 0x00A0, 1);
    let b = Telegram::read(0x19, 0x08, 0x00B0, 1);
    let c = Telegram::read(0x19, 0x08, 0x00C0, 1);
    bus.controller.enqueue(a.clone(), false);
    bus.controller.enqueue(b.clone(), true);
    bus.controller.enqueue(c.clone(), false);

    for expected in [&b, &a, &c] {
        bus.wire.poll(0x19);
        assert_eq!(bus.wire.next_sent().await, expected.encode());
    }

    // queue empty: bare acknowledgment
    bus.wire.poll(0x19);
    assert_eq!(bus.wire.next_sent().await, vec![0x99]);

    // polls for other devices are not answered
    bus.wire.poll(0x0B);
    bus.wire.nothing_sent().await;

    assert_eq!(bus.controller.tx_not_confirmed(), 3);
    assert_eq!(bus.handle.get_stats().frames_sent, 4);
    bus.stop().await;
}

#[tokio::test]
async fn test_echo_reduces_unconfirmed_counter() {
    let mut bus = start_bus(quiet_controller_config(), test_transport_config("ems"));
    let request = Telegram::read(0x19, 0x08, 0x00E6, 27);
    bus.controller.enqueue(request.clone(), false);

    bus.wire.poll(0x19);
    let sent = bus.wire.next_sent().await;
    assert_eq!(bus.controller.tx_not_confirmed(), 1);

    // the bus echoes our own telegram back to us
    bus.wire.frame(&sent);
    let controller = bus.controller.clone();
    wait_until(|| controller.tx_not_confirmed() == 0).await;
    assert_eq!(controller.process_queue_len(), 0);
    bus.stop().await;
}

#[test]
fn test_send_queue_overflow_resets_once() {
    let link = Arc::new(RecordingLink::default());
    let config = quiet_controller_config();
    let capacity = config.send_queue_capacity;
    let controller = BusController::new(config, link.clone());

    for n in 0..=capacity {
        controller.enqueue(Telegram::read(0x19, 0x08, 0x0100 + n as u16, 1), false);
    }

    assert_eq!(link.resets.load(Ordering::SeqCst), 1);
    assert_eq!(controller.send_queue_len(), 0);
    assert_eq!(controller.get_stats().resets, 1);
}

#[test]
fn test_unconfirmed_transmissions_trigger_reset_before_sending() {
    let link = Arc::new(RecordingLink::default());
    let config = quiet_controller_config();
    let threshold = config.max_unconfirmed;
    let controller = BusController::new(config, link.clone());

    for n in 0..=threshold {
        controller.enqueue(Telegram::read(0x19, 0x08, 0x0010 + n as u16, 1), false);
    }
    for _ in 0..=threshold {
        assert!(controller.process_poll(0x19));
    }
    assert_eq!(controller.tx_not_confirmed(), threshold + 1);
    assert_eq!(link.resets.load(Ordering::SeqCst), 0);

    assert!(controller.process_poll(0x19));
    assert_eq!(link.resets.load(Ordering::SeqCst), 1);
    assert_eq!(controller.tx_not_confirmed(), 0);
    // queue was cleared by the reset, so the poll is acknowledged
    assert_eq!(link.sent.lock().unwrap().last(), Some(&vec![0x99]));
}

#[tokio::test]
async fn test_extended_monitor_frame_dispatch() {
    let bus = start_bus(quiet_controller_config(), test_transport_config("ems"));
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    bus.controller.register_handler(0x01E4, move |t| {
        sink.lock().unwrap().push((t.operation(), t.offset(), t.data().len()));
    });

    let mut frame = vec![0x88, 0x19, 0xFF, 0x00, 0x00, 0xE4];
    frame.extend_from_slice(&FAST_PLUS_DATA);
    bus.wire.frame(&with_crc(frame));

    let controller = bus.controller.clone();
    wait_until(|| controller.process_queue_len() == 1).await;
    controller.run_loop();

    assert_eq!(calls.lock().unwrap().as_slice(), &[(Operation::Write, 0, 27)]);
    assert_eq!(controller.get_stats().unknown_types, 0);
    // the built-in handler sits on the legacy id and never sees the extended form
    assert_eq!(controller.boiler_state().snapshot().selected_flow_temperature, None);
    bus.stop().await;
}

#[tokio::test]
async fn test_legacy_monitor_frame_updates_boiler_state() {
    let bus = start_bus(quiet_controller_config(), test_transport_config("ems"));
    let mut frame = vec![0x88, 0x19, 0xE4, 0x00];
    frame.extend_from_slice(&FAST_PLUS_DATA);
    bus.wire.frame(&with_crc(frame));

    let controller = bus.controller.clone();
    wait_until(|| controller.process_queue_len() == 1).await;
    controller.run_loop();

    let state = controller.boiler_state().snapshot();
    assert_eq!(state.selected_flow_temperature, Some(0x3D));
    assert_eq!(state.current_flow_temperature, Some(0x026C));
    assert_eq!(state.pressure, Some(0x11));
    assert_eq!(state.display_code.as_deref(), Some("--"));
    assert!(controller.boiler_state().to_json().unwrap().contains("\"selectedFlowTemperature\":61"));
    bus.stop().await;
}

#[tokio::test]
async fn test_unknown_read_request_gets_empty_write() {
    let mut bus = start_bus(quiet_controller_config(), test_transport_config("ems"));
    // first loop issues the periodic batch
    bus.controller.run_loop();
    let periodic = bus.controller.send_queue_len();

    let request = Telegram::read(0x10, 0x19, 0x1234, 27).encode();
    assert_eq!(&request[..7], &[0x90, 0x99, 0xFF, 0x00, 0x1B, 0x11, 0x34]);
    bus.wire.frame(&request);

    let controller = bus.controller.clone();
    wait_until(|| controller.process_queue_len() == 1).await;
    controller.run_loop();
    assert_eq!(controller.send_queue_len(), periodic + 1);

    let mut last = Vec::new();
    for _ in 0..=periodic {
        bus.wire.poll(0x19);
        last = bus.wire.next_sent().await;
    }
    let reply = assert_ok!(Telegram::decode(&last));
    assert_eq!(reply.operation(), Operation::Write);
    assert_eq!(reply.type_id(), 0x1234);
    assert_eq!(reply.destination(), 0x10);
    assert_eq!(reply.source(), 0x19);
    assert_eq!(reply.offset(), 0);
    assert!(reply.data().is_empty());
    bus.stop().await;
}

#[tokio::test]
async fn test_device_version_read_gets_requested_window() {
    let mut bus = start_bus(quiet_controller_config(), test_transport_config("ems"));
    bus.controller.run_loop();
    let periodic = bus.controller.send_queue_len();

    let tail = Telegram::new(Operation::Read, 0x10, 0x19, 9, types::DEVICE_VERSION, vec![1]);
    bus.wire.frame(&tail.encode());
    let beyond = Telegram::new(Operation::Read, 0x10, 0x19, 12, types::DEVICE_VERSION, vec![4]);
    bus.wire.frame(&beyond.encode());

    let controller = bus.controller.clone();
    wait_until(|| controller.process_queue_len() == 2).await;
    controller.run_loop();
    assert_eq!(controller.send_queue_len(), periodic + 2);

    let mut sent = Vec::new();
    for _ in 0..periodic + 2 {
        bus.wire.poll(0x19);
        sent.push(bus.wire.next_sent().await);
    }

    let reply = assert_ok!(Telegram::decode(&sent[periodic]));
    assert_eq!(reply.operation(), Operation::Write);
    assert_eq!(reply.type_id(), types::DEVICE_VERSION);
    assert_eq!(reply.destination(), 0x10);
    assert_eq!(reply.offset(), 9);
    assert_eq!(reply.data(), &[99]);
    assert_eq!(DeviceVersion::new(&reply).vendor_id(), Some(99));

    let empty = assert_ok!(Telegram::decode(&sent[periodic + 1]));
    assert_eq!(empty.offset(), 12);
    assert!(empty.data().is_empty());
    bus.stop().await;
}

#[tokio::test]
async fn test_bad_crc_and_runts_never_reach_handlers() {
    let bus = start_bus(quiet_controller_config(), test_transport_config("ems"));
    let mut frame = with_crc(vec![0x88, 0x19, 0xD1, 0x00, 0x00, 0x39]);
    frame[4] ^= 0x01;
    bus.wire.frame(&frame);
    bus.wire.frame(&[0x88, 0x19, 0xD1]);

    let controller = bus.controller.clone();
    wait_until(|| {
        let stats = controller.get_stats();
        stats.decode_errors == 1 && stats.runt_frames == 1
    })
    .await;
    assert_eq!(controller.process_queue_len(), 0);
    assert_err!(Telegram::decode(&frame));
    bus.stop().await;
}

#[tokio::test]
async fn test_overflow_and_oversized_frames_recover() {
    let mut bus = start_bus(quiet_controller_config(), test_transport_config("ems"));

    bus.wire.event(PortEvent::FifoOverflow);
    bus.wire.event(PortEvent::ParityError);
    bus.wire.frame(&[0x55; 70]);
    bus.wire.poll(0x19);
    assert_eq!(bus.wire.next_sent().await, vec![0x99]);

    let stats = bus.handle.get_stats();
    assert_eq!(stats.overflows, 1);
    assert_eq!(stats.line_errors, 1);
    assert_eq!(stats.oversized_frames, 1);
    assert_eq!(bus.wire.counters.flushes.load(Ordering::SeqCst), 1);
    assert_eq!(bus.controller.get_stats().runt_frames, 0);
    bus.stop().await;
}

#[tokio::test]
async fn test_quiet_line_resynchronises() {
    let config = TransportConfig {
        rx_timeout: Some(Duration::from_millis(50)),
        ..test_transport_config("ems")
    };
    let bus = start_bus(quiet_controller_config(), config);

    let counters = bus.wire.counters.clone();
    wait_until(|| counters.breaks.load(Ordering::SeqCst) >= 2).await;
    assert!(bus.handle.get_stats().resyncs >= 2);
    assert!(counters.flushes.load(Ordering::SeqCst) >= 2);
    assert_eq!(bus.controller.get_stats().resets, 0);
    bus.stop().await;
}

#[tokio::test]
async fn test_controller_reset_reaches_transport() {
    let bus = start_bus(ControllerConfig::default(), test_transport_config("ems"));
    bus.controller.reset();

    let counters = bus.wire.counters.clone();
    wait_until(|| counters.breaks.load(Ordering::SeqCst) == 1).await;
    assert_eq!(bus.handle.get_stats().resyncs, 1);
    // startup batch queued again
    assert_eq!(bus.controller.send_queue_len(), 7);
    bus.stop().await;
}

#[tokio::test]
async fn test_forwarder_answers_polls_and_relays() {
    init_test_logger();
    let (secondary_port, mut secondary) = mock_port();
    let forwarder = Forwarder::start(secondary_port, test_transport_config("forwarder"), 10);

    let (primary_port, mut primary) = mock_port();
    let (transport, handle) = BusTransport::new(primary_port, test_transport_config("ems"));
    let transport = transport.with_forwarder(forwarder.hook());
    let controller = Arc::new(BusController::new(quiet_controller_config(), Arc::new(handle.clone())));
    let task = transport.spawn(controller.clone());

    // a device on the secondary segment queues a request
    let request = with_crc(vec![0x8B, 0x88, 0x02, 0x00, 0x1B]);
    secondary.frame(&request);
    let queues = forwarder.queues().clone();
    wait_until(|| queues.len_for(0x0B) == 1).await;

    // the boiler polls that device on the primary bus
    primary.poll(0x0B);
    assert_eq!(primary.next_sent().await, request);
    assert_eq!(secondary.next_sent().await, vec![0x0B]);
    assert_eq!(queues.len_for(0x0B), 0);

    // nothing left: the poll goes to the controller, which ignores it
    primary.poll(0x0B);
    primary.nothing_sent().await;
    assert_eq!(secondary.next_sent().await, vec![0x0B]);

    // boiler traffic is copied to the secondary segment unchanged
    let broadcast = with_crc(vec![0x88, 0x00, 0xD1, 0x00, 0x00, 0x39]);
    primary.frame(&broadcast);
    assert_eq!(secondary.next_sent().await, broadcast);

    assert_eq!(handle.get_stats().forwarded_polls, 1);
    handle.shutdown();
    assert_ok!(task.await);
    forwarder.stop().await;
}

#[tokio::test]
async fn test_service_lifecycle_on_mock_ports() {
    init_test_logger();
    let yaml = "
controller:
  loop_interval_ms: 10
";
    let config = assert_ok!(EmsConfig::from_yaml_str(yaml));
    let mut service = assert_ok!(EmsService::new(config));
    assert_err!(service.status_json());

    let (port, mut wire) = mock_port();
    assert_ok!(service.start_with_ports(port, None::<MockPort>).await);
    assert!(service.is_running());

    // first answer is the external-controller announcement
    wire.poll(0x19);
    let first = wire.next_sent().await;
    assert_eq!(&first[..3], &[0x99, 0x08, 0xE7]);

    let json = assert_ok!(service.status_json());
    assert!(json.contains("\"controller\""));
    assert!(json.contains("\"pongs_sent\":0"));
    assert!(!json.contains("forwarder_queued"));

    assert_ok!(service.stop().await);
    assert!(!service.is_running());
}

#[test]
fn test_config_rejects_invalid_documents() {
    assert_err!(EmsConfig::from_yaml_str("controller:\n  device_id: 0\n"));
    assert_err!(EmsConfig::from_yaml_str("forwarder:\n  enabled: true\n  port: /dev/ttyUSB0\n"));
    let config = assert_ok!(EmsConfig::from_yaml_str("bus:\n  port: /dev/ttyAMA0\n"));
    assert_eq!(config.transport_config().port, "/dev/ttyAMA0");
}

//! # EMS Bus Transport Layer
//!
//! This module owns the half-duplex serial line of one bus segment. It turns
//! the stream of receive events into break-delimited frames, hands every
//! frame to a [`FrameHandler`] and puts outgoing frames on the wire with the
//! inter-byte delay and trailing break the bus requires.
//!
//! ## Architecture
//!
//! - [`BusPort`]: the hardware seam. [`SerialBusPort`] implements it on top of
//!   `tokio-serial`; tests script it in memory.
//! - [`BusTransport`]: a tokio task that exclusively owns the port. It waits on
//!   port events and on commands at the same time, so receive events are
//!   always drained promptly.
//! - [`TransportHandle`]: cheap, cloneable command sender implementing
//!   [`BusLink`]. The controller transmits and resets through it without ever
//!   touching the port.
//!
//! ## Receive path
//!
//! ```text
//! Data(n) ... Data(m) -> Break -> read n+..+m bytes -> strip marker -> FrameHandler
//! ```
//!
//! Bursts larger than [`RX_BUFFER_SIZE`] are drained and discarded. Overflow
//! events flush the input and continue. When no event arrives within the
//! receive timeout the line is resynchronised with a break.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ems_bus::transport::{BusTransport, FrameHandler, SerialBusPort, TransportConfig};
//!
//! struct Printer;
//!
//! impl FrameHandler for Printer {
//!     fn process_frame(&self, frame: &[u8]) {
//!         println!("{:02X?}", frame);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TransportConfig::new("/dev/ttyUSB0");
//!     let port = SerialBusPort::open(&config)?;
//!     let (transport, handle) = BusTransport::new(port, config);
//!     let task = transport.spawn(Arc::new(Printer));
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     handle.shutdown();
//!     task.await?;
//!     Ok(())
//! }
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_serial::{ClearBuffer, SerialPort, SerialStream};
use tracing::{debug, info, trace, warn};

use crate::error::{EmsError, EmsResult};
use crate::forwarder::ForwardHook;
use crate::protocol::{classify_frame, FrameKind};
use crate::utils::format::bytes_to_hex;
use crate::utils::validation::validate_frame_len;

/// Bus line speed, fixed by the bus
pub const EMS_BAUD_RATE: u32 = 9600;

/// Duration of one bit at 9600 baud, in microseconds
pub const BIT_TIME_US: u64 = 104;

/// Local receive buffer; larger bursts are discarded
pub const RX_BUFFER_SIZE: usize = 64;

/// Bytes the serial port buffers before reporting BufferFull
const RING_BUFFER_SIZE: usize = 129;

const DEFAULT_RX_TIMEOUT: Duration = Duration::from_millis(5000);

/// Pause before retrying after a port error
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Delays up to this long are busy-waited in [`bus_delay`]
const SPIN_THRESHOLD: Duration = Duration::from_millis(2);

/// Receive events reported by a [`BusPort`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    /// `n` more bytes are waiting to be read
    Data(usize),
    /// Line break: end of the current frame
    Break,
    /// Hardware FIFO overflowed
    FifoOverflow,
    /// Driver ring buffer is full
    BufferFull,
    ParityError,
    FrameError,
}

/// Hardware seam of the transport
///
/// Implementations must make [`BusPort::next_event`] cancel safe: the
/// transport drops a pending call whenever a command arrives.
#[async_trait]
pub trait BusPort: Send {
    /// Wait for the next receive event
    async fn next_event(&mut self) -> EmsResult<PortEvent>;

    /// Fill `buf` with bytes already announced through [`PortEvent::Data`]
    async fn read_exact(&mut self, buf: &mut [u8]) -> EmsResult<()>;

    async fn write_byte(&mut self, byte: u8) -> EmsResult<()>;

    /// Invert the TX line, holding it low while `true`
    async fn set_tx_inverted(&mut self, inverted: bool) -> EmsResult<()>;

    /// Wait until every written byte left the port
    async fn wait_tx_done(&mut self) -> EmsResult<()>;

    /// Discard received bytes not read yet
    fn flush_input(&mut self) -> EmsResult<()>;

    /// Forget queued receive events
    fn reset_events(&mut self);

    /// Hold the line in break condition for `duration`
    async fn send_break(&mut self, duration: Duration) -> EmsResult<()> {
        self.set_tx_inverted(true).await?;
        sleep(duration).await;
        self.set_tx_inverted(false).await
    }
}

/// Receiver of complete frames, called on the transport task
///
/// Implementations must return quickly: the transport cannot drain receive
/// events while the call is in progress.
pub trait FrameHandler: Send + Sync {
    /// `frame` has the break marker already stripped
    fn process_frame(&self, frame: &[u8]);
}

/// What the controller needs from a transport
pub trait BusLink: Send + Sync {
    /// Queue `frame` for transmission; `false` if empty, oversized or the transport is gone
    fn transmit(&self, frame: &[u8]) -> bool;

    /// Flush the line and resynchronise with a break
    fn reset(&self);
}

/// Commands accepted by the transport task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Transmit(Vec<u8>),
    Reset,
    Shutdown,
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Serial device path
    pub port: String,
    /// Name used in log lines
    pub name: String,
    /// Resynchronise when the line stays quiet this long; `None` waits forever
    pub rx_timeout: Option<Duration>,
    /// Delay after every transmitted byte
    pub byte_gap: Duration,
    /// How long the trailing break is held
    pub break_duration: Duration,
    /// Line idle time the serial port reports as a break
    pub break_detect_gap: Duration,
    /// The driver delivers the break as a trailing byte that must be stripped
    pub break_marker: bool,
    /// Log every frame in hex
    pub packet_logging: bool,
}

impl TransportConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    /// Zero delays, for in-memory ports
    pub fn without_delays(mut self) -> Self {
        self.byte_gap = Duration::ZERO;
        self.break_duration = Duration::ZERO;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            name: "ems".to_string(),
            rx_timeout: Some(DEFAULT_RX_TIMEOUT),
            byte_gap: Duration::from_micros(BIT_TIME_US * 17),
            break_duration: Duration::from_micros(BIT_TIME_US * 11),
            break_detect_gap: Duration::from_micros(BIT_TIME_US * 30),
            break_marker: true,
            packet_logging: false,
        }
    }
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TransportStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub oversized_frames: u64,
    pub overflows: u64,
    pub line_errors: u64,
    pub resyncs: u64,
    pub rejected_transmits: u64,
    pub port_errors: u64,
    /// Polls answered with data queued by the forwarder
    pub forwarded_polls: u64,
}

/// Cloneable command side of a running [`BusTransport`]
#[derive(Debug, Clone)]
pub struct TransportHandle {
    name: String,
    commands: mpsc::UnboundedSender<TransportCommand>,
    stats: Arc<Mutex<TransportStats>>,
}

impl TransportHandle {
    pub fn send(&self, command: TransportCommand) -> EmsResult<()> {
        self.commands
            .send(command)
            .map_err(|_| EmsError::transmit(format!("{} transport stopped", self.name)))
    }

    /// Stop the transport task after pending commands
    pub fn shutdown(&self) {
        let _ = self.send(TransportCommand::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    pub fn get_stats(&self) -> TransportStats {
        self.stats.lock().map(|stats| stats.clone()).unwrap_or_default()
    }
}

impl BusLink for TransportHandle {
    fn transmit(&self, frame: &[u8]) -> bool {
        if let Err(e) = validate_frame_len(frame.len()) {
            warn!(target: "ems::transport", "[{}] {}", self.name, e);
            if let Ok(mut stats) = self.stats.lock() {
                stats.rejected_transmits += 1;
            }
            return false;
        }
        self.send(TransportCommand::Transmit(frame.to_vec())).is_ok()
    }

    fn reset(&self) {
        if let Err(e) = self.send(TransportCommand::Reset) {
            warn!(target: "ems::transport", "reset not delivered: {}", e);
        }
    }
}

enum Step {
    Command(Option<TransportCommand>),
    Event(EmsResult<PortEvent>),
    Quiet,
}

/// Transport task for one bus segment
pub struct BusTransport<P: BusPort> {
    port: P,
    config: TransportConfig,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
    stats: Arc<Mutex<TransportStats>>,
    forward: Option<ForwardHook>,
    buffer: [u8; RX_BUFFER_SIZE],
    pending: usize,
}

impl<P: BusPort + 'static> BusTransport<P> {
    pub fn new(port: P, config: TransportConfig) -> (Self, TransportHandle) {
        let (sender, commands) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(TransportStats::default()));
        let handle = TransportHandle {
            name: config.name.clone(),
            commands: sender,
            stats: stats.clone(),
        };
        let transport = Self {
            port,
            config,
            commands,
            stats,
            forward: None,
            buffer: [0; RX_BUFFER_SIZE],
            pending: 0,
        };
        (transport, handle)
    }

    /// Answer polls with forwarded data and relay every frame to the secondary segment
    pub fn with_forwarder(mut self, hook: ForwardHook) -> Self {
        self.forward = Some(hook);
        self
    }

    pub fn spawn(self, handler: Arc<dyn FrameHandler>) -> JoinHandle<()> {
        tokio::spawn(self.run(handler))
    }

    /// Event loop; returns on [`TransportCommand::Shutdown`] or when every handle is dropped
    pub async fn run(mut self, handler: Arc<dyn FrameHandler>) {
        info!(target: "ems::transport", "[{}] transport started on '{}'", self.config.name, self.config.port);
        let mut deadline = self.config.rx_timeout.map(|t| Instant::now() + t);

        loop {
            let step = tokio::select! {
                biased;
                command = self.commands.recv() => Step::Command(command),
                step = Self::wait_event(&mut self.port, deadline) => step,
            };

            match step {
                Step::Command(Some(TransportCommand::Transmit(frame))) => {
                    self.transmit_frame(&frame).await;
                }
                Step::Command(Some(TransportCommand::Reset)) => {
                    info!(target: "ems::transport", "[{}] reset requested", self.config.name);
                    self.resync().await;
                    deadline = self.config.rx_timeout.map(|t| Instant::now() + t);
                }
                Step::Command(Some(TransportCommand::Shutdown)) | Step::Command(None) => break,
                Step::Event(Ok(event)) => {
                    self.handle_event(event, handler.as_ref()).await;
                    deadline = self.config.rx_timeout.map(|t| Instant::now() + t);
                }
                Step::Event(Err(e)) => {
                    warn!(target: "ems::transport", "[{}] port error: {}", self.config.name, e);
                    self.update_stats(|s| s.port_errors += 1);
                    if !e.is_recoverable() {
                        break;
                    }
                    sleep(ERROR_BACKOFF).await;
                }
                Step::Quiet => {
                    debug!(target: "ems::transport", "[{}] read queue timeout", self.config.name);
                    self.resync().await;
                    deadline = self.config.rx_timeout.map(|t| Instant::now() + t);
                }
            }
        }

        info!(target: "ems::transport", "[{}] transport stopped", self.config.name);
    }

    async fn wait_event(port: &mut P, deadline: Option<Instant>) -> Step {
        match deadline {
            Some(deadline) => match timeout_at(deadline, port.next_event()).await {
                Ok(event) => Step::Event(event),
                Err(_) => Step::Quiet,
            },
            None => Step::Event(port.next_event().await),
        }
    }

    async fn handle_event(&mut self, event: PortEvent, handler: &dyn FrameHandler) {
        match event {
            PortEvent::Data(n) => self.pending += n,
            PortEvent::Break => {
                let length = std::mem::take(&mut self.pending);
                if length > RX_BUFFER_SIZE {
                    self.discard(length).await;
                } else if length > 0 {
                    match self.port.read_exact(&mut self.buffer[..length]).await {
                        Ok(()) => self.deliver(length, handler).await,
                        Err(e) => warn!(target: "ems::transport", "[{}] read failed: {}", self.config.name, e),
                    }
                }
            }
            PortEvent::FifoOverflow | PortEvent::BufferFull => {
                warn!(target: "ems::transport", "[{}] receive {:?}, flushing input", self.config.name, event);
                self.update_stats(|s| s.overflows += 1);
                if let Err(e) = self.port.flush_input() {
                    warn!(target: "ems::transport", "[{}] flush failed: {}", self.config.name, e);
                }
                self.port.reset_events();
                self.pending = 0;
            }
            PortEvent::ParityError | PortEvent::FrameError => {
                debug!(target: "ems::transport", "[{}] line error: {:?}", self.config.name, event);
                self.update_stats(|s| s.line_errors += 1);
            }
        }
    }

    async fn discard(&mut self, mut length: usize) {
        self.update_stats(|s| s.oversized_frames += 1);
        while length > 0 {
            let chunk = length.min(RX_BUFFER_SIZE);
            debug!(target: "ems::transport", "[{}] message too long, reading {}/{}", self.config.name, chunk, length);
            if let Err(e) = self.port.read_exact(&mut self.buffer[..chunk]).await {
                warn!(target: "ems::transport", "[{}] drain failed: {}", self.config.name, e);
                return;
            }
            length -= chunk;
        }
    }

    async fn deliver(&mut self, length: usize, handler: &dyn FrameHandler) {
        let frame_len = if self.config.break_marker { length - 1 } else { length };
        let frame = self.buffer[..frame_len].to_vec();

        self.update_stats(|s| {
            s.frames_received += 1;
            s.bytes_received += length as u64;
        });
        if self.config.packet_logging {
            info!(target: "ems::transport", "[EMS-RX] {} {}", self.config.name, bytes_to_hex(&frame));
        }
        if frame.is_empty() {
            return;
        }

        let forwarded = match (&self.forward, classify_frame(&frame)) {
            (Some(hook), FrameKind::Poll(id)) => hook.take_next_for(id),
            _ => None,
        };
        match forwarded {
            Some(data) => {
                debug!(
                    target: "ems::transport",
                    "[{}] poll for 0x{:02X} answered with {} forwarded bytes",
                    self.config.name,
                    frame[0],
                    data.len()
                );
                self.update_stats(|s| s.forwarded_polls += 1);
                self.transmit_frame(&data).await;
            }
            None => handler.process_frame(&frame),
        }

        if let Some(hook) = &self.forward {
            hook.relay(&frame);
        }
    }

    /// Put one frame on the wire, byte by byte, followed by a break
    async fn transmit_frame(&mut self, frame: &[u8]) -> bool {
        if let Err(e) = validate_frame_len(frame.len()) {
            warn!(target: "ems::transport", "[{}] {}", self.config.name, e);
            self.update_stats(|s| s.rejected_transmits += 1);
            return false;
        }
        if self.config.packet_logging {
            info!(target: "ems::transport", "[EMS-TX] {} {}", self.config.name, bytes_to_hex(frame));
        }

        if let Err(e) = self.write_frame(frame).await {
            warn!(target: "ems::transport", "[{}] transmit failed: {}", self.config.name, e);
            self.update_stats(|s| s.port_errors += 1);
            return false;
        }

        self.update_stats(|s| {
            s.frames_sent += 1;
            s.bytes_sent += frame.len() as u64;
        });
        true
    }

    async fn write_frame(&mut self, frame: &[u8]) -> EmsResult<()> {
        for &byte in frame {
            self.port.write_byte(byte).await?;
            bus_delay(self.config.byte_gap).await;
        }
        self.port.set_tx_inverted(true).await?;
        bus_delay(self.config.break_duration).await;
        self.port.set_tx_inverted(false).await
    }

    /// Flush everything and send a break so the bus master resynchronises
    async fn resync(&mut self) {
        self.update_stats(|s| s.resyncs += 1);
        self.pending = 0;
        if let Err(e) = self.port.wait_tx_done().await {
            trace!(target: "ems::transport", "[{}] wait tx done: {}", self.config.name, e);
        }
        if let Err(e) = self.port.flush_input() {
            warn!(target: "ems::transport", "[{}] flush failed: {}", self.config.name, e);
        }
        self.port.reset_events();
        if let Err(e) = self.port.send_break(self.config.break_duration).await {
            warn!(target: "ems::transport", "[{}] break failed: {}", self.config.name, e);
        }
    }

    fn update_stats(&self, update: impl FnOnce(&mut TransportStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }
}

/// Wait out a bus timing with microsecond precision
///
/// The tokio timer has millisecond resolution and may fire up to one tick
/// late, which would stretch the 1768 µs byte gap past 2 ms. Only the part
/// beyond [`SPIN_THRESHOLD`] is slept; the rest is spun on the worker.
async fn bus_delay(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    let deadline = std::time::Instant::now() + duration;
    if duration > SPIN_THRESHOLD {
        sleep(duration - SPIN_THRESHOLD).await;
    }
    while std::time::Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

/// [`BusPort`] over a real serial device
///
/// Serial drivers do not report break events, so a break is inferred when
/// the line stays idle for `break_detect_gap` after data was received.
pub struct SerialBusPort {
    stream: SerialStream,
    port_name: String,
    break_detect_gap: Duration,
    rx: VecDeque<u8>,
    awaiting_break: bool,
}

impl SerialBusPort {
    /// Open the port with the bus settings: 9600 8N1, no flow control
    pub fn open(config: &TransportConfig) -> EmsResult<Self> {
        let builder = tokio_serial::new(&config.port, EMS_BAUD_RATE)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .flow_control(tokio_serial::FlowControl::None);

        let stream = SerialStream::open(&builder)
            .map_err(|e| EmsError::connection(format!("Failed to open serial port {}: {}", config.port, e)))?;

        info!(target: "ems::transport", "opened {} at {} baud", config.port, EMS_BAUD_RATE);
        Ok(Self {
            stream,
            port_name: config.port.clone(),
            break_detect_gap: config.break_detect_gap,
            rx: VecDeque::with_capacity(RING_BUFFER_SIZE),
            awaiting_break: false,
        })
    }

    fn push(&mut self, chunk: &[u8]) -> PortEvent {
        if self.rx.len() + chunk.len() > RING_BUFFER_SIZE {
            self.rx.clear();
            self.awaiting_break = false;
            return PortEvent::BufferFull;
        }
        self.rx.extend(chunk);
        self.awaiting_break = true;
        PortEvent::Data(chunk.len())
    }
}

#[async_trait]
impl BusPort for SerialBusPort {
    async fn next_event(&mut self) -> EmsResult<PortEvent> {
        let mut chunk = [0u8; 32];
        let read = if self.awaiting_break {
            match timeout(self.break_detect_gap, self.stream.read(&mut chunk)).await {
                Err(_) => {
                    self.awaiting_break = false;
                    return Ok(PortEvent::Break);
                }
                Ok(read) => read?,
            }
        } else {
            self.stream.read(&mut chunk).await?
        };

        if read == 0 {
            return Err(EmsError::connection(format!("serial port {} closed", self.port_name)));
        }
        Ok(self.push(&chunk[..read]))
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> EmsResult<()> {
        if self.rx.len() < buf.len() {
            return Err(EmsError::io(format!(
                "short read: {} bytes buffered, {} requested",
                self.rx.len(),
                buf.len()
            )));
        }
        let len = buf.len();
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..len)) {
            *slot = byte;
        }
        Ok(())
    }

    async fn write_byte(&mut self, byte: u8) -> EmsResult<()> {
        self.stream.write_all(&[byte]).await?;
        Ok(())
    }

    async fn set_tx_inverted(&mut self, inverted: bool) -> EmsResult<()> {
        if inverted {
            self.stream.set_break()?;
        } else {
            self.stream.clear_break()?;
        }
        Ok(())
    }

    async fn wait_tx_done(&mut self) -> EmsResult<()> {
        timeout(Duration::from_secs(1), self.stream.flush()).await??;
        Ok(())
    }

    fn flush_input(&mut self) -> EmsResult<()> {
        self.rx.clear();
        self.stream.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn reset_events(&mut self) {
        self.awaiting_break = false;
    }
}

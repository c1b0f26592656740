//! Pass-through bridge to a second bus segment
//!
//! A secondary controller (for example a diagnostic gateway) sits on its own
//! physical pair. Everything the boiler sends on the primary segment is
//! relayed to it unchanged. What it sends back is queued per originating
//! device id and put on the primary bus only when the boiler polls that id.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::protocol::{DeviceId, ADDRESS_MASK};
use crate::transport::{BusLink, BusPort, BusTransport, FrameHandler, TransportConfig, TransportHandle};

/// Default number of frames held per device
pub const FORWARD_QUEUE_CAPACITY: usize = 10;

/// Bounded outbound queues, one per source device id
///
/// A full queue drops the newest frame; producers never block.
#[derive(Debug)]
pub struct ForwardQueues {
    capacity: usize,
    queues: Mutex<HashMap<DeviceId, VecDeque<Bytes>>>,
    dropped: AtomicU64,
}

impl ForwardQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queues: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue `frame` under its source id (`frame[0]` without the role bit)
    ///
    /// Returns `false` when the frame is empty or the queue is full.
    pub fn enqueue(&self, frame: &[u8]) -> bool {
        let Some(&first) = frame.first() else {
            return false;
        };
        let id = first & !ADDRESS_MASK;

        let Ok(mut queues) = self.queues.lock() else {
            warn!(target: "ems::forwarder", "queue lock poisoned, frame from 0x{:02X} lost", id);
            return false;
        };
        let queue = queues.entry(id).or_default();
        if queue.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "ems::forwarder",
                "can't enqueue frame from 0x{:02X} ({} bytes), queue full ({})",
                id,
                frame.len(),
                queue.len()
            );
            return false;
        }
        queue.push_back(Bytes::copy_from_slice(frame));
        debug!(target: "ems::forwarder", "enqueued frame from 0x{:02X}, {} queued", id, queue.len());
        true
    }

    /// Pop the oldest frame queued for `id`
    pub fn take_next_for(&self, id: DeviceId) -> Option<Bytes> {
        let mut queues = self.queues.lock().ok()?;
        let queue = queues.get_mut(&id)?;
        let frame = queue.pop_front()?;
        debug!(target: "ems::forwarder", "found frame in 0x{:02X} queue, {} left", id, queue.len());
        Some(frame)
    }

    pub fn len_for(&self, id: DeviceId) -> usize {
        self.queues
            .lock()
            .map(|queues| queues.get(&id).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    pub fn total_len(&self) -> usize {
        self.queues
            .lock()
            .map(|queues| queues.values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    /// Frames dropped because their queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ForwardQueues {
    fn default() -> Self {
        Self::new(FORWARD_QUEUE_CAPACITY)
    }
}

impl FrameHandler for ForwardQueues {
    fn process_frame(&self, frame: &[u8]) {
        self.enqueue(frame);
    }
}

/// What the primary transport needs from the forwarder
#[derive(Clone)]
pub struct ForwardHook {
    queues: Arc<ForwardQueues>,
    relay: Arc<dyn BusLink>,
}

impl ForwardHook {
    pub fn new(queues: Arc<ForwardQueues>, relay: Arc<dyn BusLink>) -> Self {
        Self { queues, relay }
    }

    pub(crate) fn take_next_for(&self, id: DeviceId) -> Option<Bytes> {
        self.queues.take_next_for(id)
    }

    /// Copy a primary-bus frame onto the secondary segment
    pub(crate) fn relay(&self, frame: &[u8]) {
        if !self.relay.transmit(frame) {
            trace!(target: "ems::forwarder", "relay of {} bytes refused", frame.len());
        }
    }
}

/// Running forwarder: a transport on the secondary segment feeding [`ForwardQueues`]
pub struct Forwarder {
    queues: Arc<ForwardQueues>,
    handle: TransportHandle,
    task: JoinHandle<()>,
}

impl Forwarder {
    pub fn start<P: BusPort + 'static>(port: P, config: TransportConfig, capacity: usize) -> Self {
        let queues = Arc::new(ForwardQueues::new(capacity));
        let (transport, handle) = BusTransport::new(port, config);
        let task = transport.spawn(queues.clone());
        debug!(target: "ems::forwarder", "started, queue capacity {}", capacity);
        Self { queues, handle, task }
    }

    /// Hook to install on the primary transport with [`BusTransport::with_forwarder`]
    pub fn hook(&self) -> ForwardHook {
        ForwardHook::new(self.queues.clone(), Arc::new(self.handle.clone()))
    }

    pub fn queues(&self) -> &Arc<ForwardQueues> {
        &self.queues
    }

    pub fn handle(&self) -> &TransportHandle {
        &self.handle
    }

    pub async fn stop(self) {
        self.handle.shutdown();
        if let Err(e) = self.task.await {
            warn!(target: "ems::forwarder", "forwarder task ended abnormally: {}", e);
        }
    }
}

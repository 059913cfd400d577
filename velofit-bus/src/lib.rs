//! Cross-component message fabric: four typed channels plus per-worker
//! command inboxes.
//!
//! | channel   | direction              | capacity | on full            |
//! |-----------|------------------------|----------|--------------------|
//! | upstream  | worker → orchestrator  | 1000     | drop               |
//! | broadcast | orchestrator → endpoint| 1000     | drop               |
//! | stream    | worker → endpoint      | 10       | drop oldest        |
//! | critical  | worker → endpoint      | unbounded| never drop         |
//! | command   | endpoint/orch → worker | 100      | drop with warning  |
//!
//! Every channel is FIFO on its own; there is no cross-channel ordering.
//! The bus is cheaply cloneable and is the process-wide coordinator for
//! queue allocation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use tracing::{debug, warn};

use velofit_types::{
    BroadcastEvent, CamId, CommandEnvelope, CommandTarget, CriticalEvent, StreamPayload,
    UpstreamEvent,
};

pub const UPSTREAM_CAPACITY: usize = 1000;
pub const BROADCAST_CAPACITY: usize = 1000;
pub const STREAM_CAPACITY: usize = 10;
pub const COMMAND_CAPACITY: usize = 100;

/// Bounded send patience for the non-critical channels.
const PUBLISH_TIMEOUT: Duration = Duration::from_millis(100);

type Inbox = (Sender<CommandEnvelope>, Receiver<CommandEnvelope>);

/// The process-wide event bus. Clones share the underlying queues.
#[derive(Clone)]
pub struct EventBus {
    upstream_tx: Sender<UpstreamEvent>,
    upstream_rx: Receiver<UpstreamEvent>,
    broadcast_tx: Sender<BroadcastEvent>,
    broadcast_rx: Receiver<BroadcastEvent>,
    stream_tx: Sender<StreamPayload>,
    stream_rx: Receiver<StreamPayload>,
    critical_tx: Sender<CriticalEvent>,
    critical_rx: Receiver<CriticalEvent>,
    inboxes: Arc<RwLock<BTreeMap<CamId, Inbox>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (upstream_tx, upstream_rx) = bounded(UPSTREAM_CAPACITY);
        let (broadcast_tx, broadcast_rx) = bounded(BROADCAST_CAPACITY);
        let (stream_tx, stream_rx) = bounded(STREAM_CAPACITY);
        let (critical_tx, critical_rx) = unbounded();
        EventBus {
            upstream_tx,
            upstream_rx,
            broadcast_tx,
            broadcast_rx,
            stream_tx,
            stream_rx,
            critical_tx,
            critical_rx,
            inboxes: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    // --- worker side -------------------------------------------------

    /// Latest-frame-wins publication: when the queue is full the oldest
    /// sample is popped and the send retried once. A second failure is
    /// tolerated silently.
    pub fn publish_stream(&self, payload: StreamPayload) {
        if let Err(TrySendError::Full(payload)) = self.stream_tx.try_send(payload) {
            let _ = self.stream_rx.try_recv();
            let _ = self.stream_tx.try_send(payload);
        }
    }

    /// Must succeed; the channel is unbounded and the bus itself keeps a
    /// receiver alive, so the send cannot fail while the bus exists.
    pub fn publish_critical(&self, event: CriticalEvent) {
        if self.critical_tx.send(event).is_err() {
            warn!("critical channel disconnected");
        }
    }

    pub fn publish_upstream(&self, event: UpstreamEvent) {
        if self
            .upstream_tx
            .send_timeout(event, PUBLISH_TIMEOUT)
            .is_err()
        {
            debug!("upstream channel full, event dropped");
        }
    }

    // --- orchestrator side -------------------------------------------

    pub fn publish_broadcast(&self, event: BroadcastEvent) {
        if self
            .broadcast_tx
            .send_timeout(event, PUBLISH_TIMEOUT)
            .is_err()
        {
            debug!("broadcast channel full, event dropped");
        }
    }

    /// Allocate (or return the existing) command inbox for a worker.
    /// Idempotent per camera id: a second call hands back the same queue.
    pub fn register_worker(&self, camera_id: CamId) -> Receiver<CommandEnvelope> {
        let mut inboxes = self.inboxes.write();
        let (_, rx) = inboxes.entry(camera_id).or_insert_with(|| {
            debug!("registered command inbox for camera {camera_id}");
            bounded(COMMAND_CAPACITY)
        });
        rx.clone()
    }

    pub fn registered_workers(&self) -> Vec<CamId> {
        self.inboxes.read().keys().copied().collect()
    }

    /// Route a command. Camera targets go to that camera's inbox; any other
    /// target fans out to every registered worker, whose engine then decides
    /// whether a stage by that name exists.
    pub fn send_command(
        &self,
        target: CommandTarget,
        cmd: &str,
        args: serde_json::Value,
    ) {
        self.send_envelope(CommandEnvelope::new(target, cmd, args));
    }

    pub fn send_envelope(&self, envelope: CommandEnvelope) {
        match envelope.target.camera_id() {
            Some(camera_id) => self.deliver(camera_id, envelope),
            None => {
                let targets = self.registered_workers();
                debug!(
                    "fanning out command \"{}\" (target {}) to {} workers",
                    envelope.cmd,
                    envelope.target,
                    targets.len()
                );
                for camera_id in targets {
                    self.deliver(camera_id, envelope.clone());
                }
            }
        }
    }

    fn deliver(&self, camera_id: CamId, envelope: CommandEnvelope) {
        let tx = {
            let inboxes = self.inboxes.read();
            match inboxes.get(&camera_id) {
                Some((tx, _)) => tx.clone(),
                None => {
                    warn!("no command inbox for camera {camera_id}, dropping \"{}\"", envelope.cmd);
                    return;
                }
            }
        };
        if tx.send_timeout(envelope, PUBLISH_TIMEOUT).is_err() {
            warn!("command inbox full for camera {camera_id}");
        }
    }

    // --- endpoint / consumer side ------------------------------------

    pub fn poll_upstream(&self) -> Option<UpstreamEvent> {
        self.upstream_rx.try_recv().ok()
    }

    pub fn poll_broadcast(&self) -> Option<BroadcastEvent> {
        self.broadcast_rx.try_recv().ok()
    }

    pub fn poll_stream(&self) -> Option<StreamPayload> {
        self.stream_rx.try_recv().ok()
    }

    pub fn poll_critical(&self) -> Option<CriticalEvent> {
        self.critical_rx.try_recv().ok()
    }
}

//! Shared types for the velofit runtime: wire messages, camera
//! configuration, tracked points, and command addressing.
//!
//! Everything that crosses a bus channel or the JSON event stream is
//! defined here so that the worker, orchestrator and endpoint agree on
//! one schema.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

mod camera_config;
mod command;
mod point;

pub use camera_config::{CalibrationData, CameraConfig, ConfigMergeError};
pub use command::{CommandEnvelope, CommandTarget};
pub use point::Point;

/// Logical camera number, assigned by the studio profile (`role_id`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CamId(pub u8);

impl std::fmt::Display for CamId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for CamId {
    fn from(orig: u8) -> Self {
        CamId(orig)
    }
}

/// The studio role a camera fills (e.g. "side", "front").
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RoleName(String);

impl RoleName {
    pub fn new<S: Into<String>>(s: S) -> Self {
        RoleName(s.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoleName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags::bitflags! {
    /// Per-frame status bits carried in the slot header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        const SYNC_FLASH = 0b0000_0001;
        const LOW_LIGHT = 0b0000_0010;
        const MOVEMENT = 0b0000_0100;
        const SECURITY_ALERT = 0b1000_0000;
    }
}

/// Frame geometry as `[height, width, channels]`.
///
/// Serialized as a 3-element array to match the handshake wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameShape {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
}

impl FrameShape {
    pub fn new(height: u32, width: u32, channels: u32) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Number of payload bytes for one `uint8` frame of this shape.
    pub fn num_bytes(&self) -> usize {
        self.height as usize * self.width as usize * self.channels as usize
    }
}

impl Serialize for FrameShape {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.height, self.width, self.channels].serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FrameShape {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let [height, width, channels] = <[u32; 3]>::deserialize(deserializer)?;
        Ok(FrameShape {
            height,
            width,
            channels,
        })
    }
}

// ---------------------------------------------------------------------
// UI side channel

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub level: NotificationLevel,
    pub duration: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WidgetKind {
    #[default]
    Text,
    ChartLine,
    ChartBar,
    StatusIndicator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetUpdate {
    pub widget_id: String,
    #[serde(rename = "type")]
    pub kind: WidgetKind,
    pub title: String,
    pub data: serde_json::Value,
}

// ---------------------------------------------------------------------
// Engine output

/// Error captured inside a pipeline stage, surfaced to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleError {
    pub source: String,
    pub message: String,
    pub timestamp: f64,
    pub severity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginStatus {
    pub id: String,
    pub is_active: bool,
    pub performance_ms: f64,
}

/// Per-frame payload the engine publishes on the stream channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamPayload {
    pub frame_id: i64,
    pub fps: f64,
    pub errors: Vec<ModuleError>,
    pub active_plugins: Vec<PluginStatus>,
    /// Full configuration echo, present only on throttle frames
    /// (`frame_id % 60 == 0`).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub camera_config: Option<CameraConfig>,
    pub notifications: Vec<Notification>,
    pub widgets: Vec<WidgetUpdate>,
    pub results: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
    pub camera_id: CamId,
}

// ---------------------------------------------------------------------
// Bus messages

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub camera_id: CamId,
    pub role: RoleName,
    pub sn: Option<String>,
    pub config: CameraConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerErrorReport {
    pub camera_id: CamId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatusReport {
    pub camera_id: CamId,
    pub status: String,
    #[serde(default)]
    pub fps: f64,
}

/// Worker → orchestrator events (upstream channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum UpstreamEvent {
    Heartbeat(Heartbeat),
    Error(WorkerErrorReport),
    WorkerStatus(WorkerStatusReport),
}

/// Declares a freshly created ring; the only authoritative source of the
/// ring name. Consumers must re-attach when one arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShmHandshake {
    pub camera_id: CamId,
    pub role: RoleName,
    pub shm_name: String,
    pub shape: FrameShape,
    pub dtype: String,
}

/// Messages that must never be dropped (critical channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CriticalEvent {
    ShmHandshake(ShmHandshake),
}

/// Worker liveness as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPhase {
    Spawned,
    Attached,
    Frozen,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraState {
    pub role: RoleName,
    pub last_heartbeat: f64,
    pub config: CameraConfig,
    pub fps: f64,
    pub status: WorkerPhase,
}

/// 1 Hz view of every worker, published on the broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SystemMonitor {
    pub cameras: BTreeMap<String, CameraState>,
    pub global_fps: f64,
    pub security: String,
}

impl Default for CameraState {
    fn default() -> Self {
        CameraState {
            role: RoleName::new("unknown"),
            last_heartbeat: 0.0,
            config: CameraConfig::default(),
            fps: 0.0,
            status: WorkerPhase::Spawned,
        }
    }
}

/// Orchestrator → endpoint events (broadcast channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BroadcastEvent {
    SystemMonitor(SystemMonitor),
    SecurityLock { reason: String },
}

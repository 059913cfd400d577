//! Per-frame pipeline engine.
//!
//! The engine owns an ordered sequence of [`Stage`]s: the fixed core
//! (detection → tracking → undistort → perspective) followed by registry
//! plugins in discovery order. Stages are failure-isolated: a stage that
//! errors repeatedly is disabled and skipped, the frame continues. After
//! the last stage the engine assembles one stream payload and publishes it
//! on the bus.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use velofit_bus::EventBus;
use velofit_types::{
    CamId, CameraConfig, CommandEnvelope, CommandTarget, FrameShape, PluginStatus,
    StreamPayload,
};

mod context;
pub mod filters;
pub mod plugins;
pub mod stages;

pub use context::{FrameContext, FrameView, UiContext};

/// Consecutive failures before a stage is taken out of rotation.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 20;

/// Full configuration is embedded in the stream payload once per this many
/// frames.
const CONFIG_ECHO_INTERVAL: i64 = 60;

#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub struct StageError(pub String);

impl From<String> for StageError {
    fn from(msg: String) -> Self {
        StageError(msg)
    }
}

impl From<&str> for StageError {
    fn from(msg: &str) -> Self {
        StageError(msg.to_string())
    }
}

/// One unit of per-frame processing.
///
/// `name` is the stable routing key for commands. `handle_command` returns
/// `false` for commands it does not recognise so the engine can apply its
/// `set_params` fallback, which writes each argument through `set_param`.
pub trait Stage: Send {
    fn name(&self) -> &str;

    fn process(&mut self, ctx: &mut FrameContext) -> Result<(), StageError>;

    fn handle_command(&mut self, _cmd: &str, _args: &serde_json::Value) -> bool {
        false
    }

    fn set_param(&mut self, _name: &str, _value: &serde_json::Value) -> bool {
        false
    }
}

/// Constructor entry in the static plugin registry.
///
/// The original system discovered plugins by scanning a directory tree and
/// skipping dot-prefixed entries; the compiled-in registry keeps the same
/// contract, including the leading-dot disable convention.
#[derive(Clone, Copy)]
pub struct StageFactory {
    pub name: &'static str,
    pub build: fn() -> Box<dyn Stage>,
}

/// The plugins shipped with the engine, in discovery order.
pub fn default_plugin_registry() -> Vec<StageFactory> {
    vec![
        StageFactory {
            name: "fps_meter",
            build: || Box::new(plugins::FpsMeterPlugin::new()),
        },
        StageFactory {
            name: "counter",
            build: || Box::new(plugins::CounterPlugin::new()),
        },
        StageFactory {
            name: "smoother",
            build: || Box::new(plugins::SmootherPlugin::new()),
        },
    ]
}

fn core_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(stages::BlobDetectorStage::new()),
        Box::new(stages::CentroidTrackerStage::new()),
        Box::new(stages::UndistortStage::new()),
        Box::new(stages::PerspectiveStage::new()),
    ]
}

/// Health record kept per stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageHealth {
    pub active: bool,
    pub error_count: u32,
    pub last_perf_ms: f64,
    pub is_core: bool,
}

struct StageSlot {
    stage: Box<dyn Stage>,
    health: StageHealth,
}

struct FpsTracker {
    last: Option<Instant>,
    fps: f64,
}

impl FpsTracker {
    fn new() -> Self {
        FpsTracker {
            last: None,
            fps: 0.0,
        }
    }

    fn tick(&mut self) -> f64 {
        let now = Instant::now();
        if let Some(last) = self.last {
            let delta = now.duration_since(last).as_secs_f64();
            if delta > 0.0 {
                self.fps = 0.9 * self.fps + 0.1 * (1.0 / delta);
            }
        }
        self.last = Some(now);
        self.fps
    }
}

/// Executes the stage sequence for one camera worker.
pub struct PipelineEngine {
    camera_id: CamId,
    bus: EventBus,
    slots: Vec<StageSlot>,
    fps: FpsTracker,
}

impl PipelineEngine {
    /// Engine with the core sequence and the default plugin registry.
    pub fn new(bus: EventBus, camera_id: CamId) -> Self {
        Self::with_stages(bus, camera_id, core_stages(), &default_plugin_registry())
    }

    /// Engine with explicit core stages and plugin registry; the test
    /// entry point, and the hook for studios that register extra stages.
    pub fn with_stages(
        bus: EventBus,
        camera_id: CamId,
        core: Vec<Box<dyn Stage>>,
        registry: &[StageFactory],
    ) -> Self {
        let mut engine = PipelineEngine {
            camera_id,
            bus,
            slots: Vec::new(),
            fps: FpsTracker::new(),
        };
        for stage in core {
            engine.register(stage, true);
        }
        for factory in registry {
            if factory.name.starts_with('.') {
                debug!("skipping disabled plugin entry {}", factory.name);
                continue;
            }
            engine.register((factory.build)(), false);
        }
        info!(
            "pipeline for camera {camera_id} initialized with {} stages",
            engine.slots.len()
        );
        engine
    }

    fn register(&mut self, stage: Box<dyn Stage>, is_core: bool) {
        let name = stage.name().to_string();
        if self.slots.iter().any(|s| s.stage.name() == name) {
            warn!("duplicate stage name \"{name}\" ignored");
            return;
        }
        self.slots.push(StageSlot {
            stage,
            health: StageHealth {
                active: true,
                error_count: 0,
                last_perf_ms: 0.0,
                is_core,
            },
        });
    }

    pub fn camera_id(&self) -> CamId {
        self.camera_id
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.stage.name()).collect()
    }

    pub fn stage_health(&self, name: &str) -> Option<&StageHealth> {
        self.slots
            .iter()
            .find(|s| s.stage.name() == name)
            .map(|s| &s.health)
    }

    /// Smoothed rate of `process_frame` calls.
    pub fn current_fps(&self) -> f64 {
        self.fps.fps
    }

    /// Route a command into the stage sequence.
    ///
    /// `all`/`broadcast` reach every stage; a stage-name target reaches that
    /// stage (with the `set_params` attribute-write fallback and the
    /// engine-level `reset_errors` health reset); anything else is dropped.
    pub fn dispatch_command(&mut self, envelope: &CommandEnvelope) {
        let name = match &envelope.target {
            CommandTarget::Named(name) => name,
            CommandTarget::Camera(_) => {
                debug!(
                    "camera-addressed command \"{}\" reached the engine, dropping",
                    envelope.cmd
                );
                return;
            }
        };

        if envelope.target.is_broadcast_keyword() {
            for slot in &mut self.slots {
                slot.stage.handle_command(&envelope.cmd, &envelope.args);
            }
            return;
        }

        let Some(slot) = self.slots.iter_mut().find(|s| s.stage.name() == name.as_str())
        else {
            debug!(
                "command target \"{name}\" matches no stage on camera {}, dropping",
                self.camera_id
            );
            return;
        };

        if envelope.cmd == "reset_errors" {
            slot.health.active = true;
            slot.health.error_count = 0;
            info!("stage \"{name}\" re-enabled by command");
        }

        let handled = slot.stage.handle_command(&envelope.cmd, &envelope.args);
        if !handled && envelope.cmd == "set_params" {
            if let Some(args) = envelope.args.as_object() {
                for (key, value) in args {
                    if !slot.stage.set_param(key, value) {
                        debug!("stage \"{name}\" has no parameter \"{key}\"");
                    }
                }
            }
        }
    }

    /// Run every active stage over one frame, then assemble and publish the
    /// stream payload. Stage failures are contained here: they increment
    /// the stage's error count (disabling it at the threshold) and surface
    /// in the payload's error list.
    pub fn process_frame(
        &mut self,
        pixels: &[u8],
        shape: FrameShape,
        frame_id: i64,
        timestamp: f64,
        config: &CameraConfig,
    ) -> StreamPayload {
        let fps = self.fps.tick();
        let mut ctx = FrameContext::new(
            FrameView { pixels, shape },
            frame_id,
            timestamp,
            config,
            self.camera_id,
        );

        let mut active_plugins = Vec::with_capacity(self.slots.len());
        for slot in &mut self.slots {
            let name = slot.stage.name().to_string();
            if !slot.health.active {
                active_plugins.push(PluginStatus {
                    id: name,
                    is_active: false,
                    performance_ms: 0.0,
                });
                continue;
            }

            let t0 = Instant::now();
            match slot.stage.process(&mut ctx) {
                Ok(()) => {
                    if slot.health.error_count > 0 {
                        slot.health.error_count = 0;
                    }
                }
                Err(e) => {
                    slot.health.error_count += 1;
                    ctx.add_error(name.clone(), e.to_string());
                    error!("stage \"{name}\" failed: {e}");
                    if slot.health.error_count >= MAX_CONSECUTIVE_ERRORS {
                        slot.health.active = false;
                        error!("stage \"{name}\" disabled after {MAX_CONSECUTIVE_ERRORS} consecutive errors");
                    }
                }
            }
            let perf_ms = t0.elapsed().as_secs_f64() * 1000.0;
            slot.health.last_perf_ms = perf_ms;
            active_plugins.push(PluginStatus {
                id: name,
                is_active: slot.health.active,
                performance_ms: perf_ms,
            });
        }

        let payload = self.assemble_payload(ctx, frame_id, fps, active_plugins, config);
        self.bus.publish_stream(payload.clone());
        payload
    }

    fn assemble_payload(
        &self,
        ctx: FrameContext,
        frame_id: i64,
        fps: f64,
        active_plugins: Vec<PluginStatus>,
        config: &CameraConfig,
    ) -> StreamPayload {
        let FrameContext {
            points,
            ui,
            mut store,
            errors,
            ..
        } = ctx;

        // The typed keypoint hand-off surfaces in the namespaced results
        // exactly like any other stage output.
        let keypoints = serde_json::to_value(&points)
            .unwrap_or(serde_json::Value::Array(Vec::new()));
        store
            .entry("vision".to_string())
            .or_default()
            .insert("keypoints".to_string(), keypoints);

        let camera_config = if frame_id % CONFIG_ECHO_INTERVAL == 0 {
            Some(config.clone())
        } else {
            None
        };

        StreamPayload {
            frame_id,
            fps,
            errors,
            active_plugins,
            camera_config,
            notifications: ui.notifications,
            widgets: ui.widgets,
            results: store,
            camera_id: self.camera_id,
        }
    }
}

//! The per-camera worker: owns one device, one frame ring and one pipeline
//! engine.
//!
//! Lifecycle: resolve the device, open it, allocate a ring sized for the
//! geometry the device actually reports, announce the ring with a
//! `shm_handshake` on the critical channel, then capture → ring write →
//! pipeline until stopped. Heartbeats go upstream at least once a second.
//! If the device geometry changes mid-run, a new ring is created and
//! announced before the old one is abandoned (hot-swap).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::Receiver;
use tracing::{debug, error, info, warn};

use frame_ring::{FrameRing, SlotHeader, DTYPE_U8};
use velofit_bus::EventBus;
use velofit_cam::{index_for_serial, Camera, CameraFactory, DeviceScanner};
use velofit_config_data::{load_calibration_file, CameraProfile, Settings};
use velofit_engine::PipelineEngine;
use velofit_types::{
    CamId, CameraConfig, CommandEnvelope, CriticalEvent, FrameShape, Heartbeat, RoleName,
    ShmHandshake, UpstreamEvent, WorkerErrorReport, WorkerStatusReport,
};

/// Reserved command consumed by the worker itself: updates the anti-tamper
/// scalar written into every frame header.
pub const CMD_SET_SALT: &str = "SET_SALT";
/// Reserved command consumed by the worker itself: merges into the camera
/// configuration and applies it to the device.
pub const CMD_SET_CONFIG: &str = "SET_CONFIG";

/// Pause when the device had no frame ready.
const NO_FRAME_SLEEP: Duration = Duration::from_millis(5);

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("camera error: {source}")]
    Camera {
        #[from]
        source: velofit_cam::Error,
    },
    #[error("ring error: {source}")]
    Ring {
        #[from]
        source: frame_ring::RingError,
    },
    #[error("device reported zero geometry")]
    ZeroGeometry,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Everything the orchestrator decides for a worker before spawning it.
pub struct WorkerSpec {
    pub camera_id: CamId,
    pub profile: CameraProfile,
    pub settings: Settings,
    /// Device index assigned by the orchestrator. `None` makes the worker
    /// scan and bind by serial itself (fallback path).
    pub os_index: Option<usize>,
}

pub struct CameraWorker {
    spec: WorkerSpec,
    bus: EventBus,
    factory: Arc<CameraFactory>,
    scanner: Box<dyn DeviceScanner>,
    stop: Arc<AtomicBool>,
}

impl CameraWorker {
    pub fn new(
        spec: WorkerSpec,
        bus: EventBus,
        factory: Arc<CameraFactory>,
        scanner: Box<dyn DeviceScanner>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        CameraWorker {
            spec,
            bus,
            factory,
            scanner,
            stop,
        }
    }

    pub fn spawn(self) -> std::thread::JoinHandle<Result<()>> {
        let camera_id = self.spec.camera_id;
        std::thread::Builder::new()
            .name(format!("velofit-worker-{camera_id}"))
            .spawn(move || {
                let result = self.run();
                if let Err(e) = &result {
                    error!("worker {camera_id} exited with error: {e}");
                }
                result
            })
            .expect("failed to spawn worker thread")
    }

    fn resolve_device_index(&mut self) -> usize {
        let camera_id = self.spec.camera_id;
        if let Some(index) = self.spec.os_index {
            debug!("worker {camera_id} using orchestrator-assigned device index {index}");
            return index;
        }
        warn!("worker {camera_id} started without an explicit index, scanning devices");
        let Some(serial) = self.spec.profile.serial_number.clone() else {
            return camera_id.0 as usize;
        };
        match self.scanner.scan() {
            Ok(devices) => match index_for_serial(&devices, &serial) {
                Some(index) => {
                    info!("worker {camera_id} bound {serial} -> device index {index}");
                    index
                }
                None => {
                    error!("device {serial} not found, using fallback index 0");
                    0
                }
            },
            Err(e) => {
                error!("device scan failed ({e}), using fallback index 0");
                0
            }
        }
    }

    fn report_error(&self, message: String) {
        self.bus
            .publish_upstream(UpstreamEvent::Error(WorkerErrorReport {
                camera_id: self.spec.camera_id,
                message,
            }));
    }

    /// Allocate a ring for `shape` under a session-unique name and announce
    /// it. The handshake is published strictly before any frame is written,
    /// making it the authoritative re-attach trigger for consumers.
    fn allocate_ring(&self, shape: FrameShape, role: &RoleName) -> Result<FrameRing> {
        let session_id = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let name = format!("shm_cam_{}_{session_id}", self.spec.camera_id);
        let ring = FrameRing::create(&name, shape, DTYPE_U8, self.spec.settings.shm_buffers)?;
        self.bus
            .publish_critical(CriticalEvent::ShmHandshake(ShmHandshake {
                camera_id: self.spec.camera_id,
                role: role.clone(),
                shm_name: name,
                shape,
                dtype: DTYPE_U8.to_string(),
            }));
        Ok(ring)
    }

    /// The worker body. Returns when stop is requested or on a fatal
    /// device/ring error; the orchestrator decides about restarts.
    pub fn run(mut self) -> Result<()> {
        let camera_id = self.spec.camera_id;
        let role = RoleName::new(self.spec.profile.role_name.clone());
        let serial = self.spec.profile.serial_number.clone();
        info!("worker {camera_id} starting (role {role})");

        let os_index = self.resolve_device_index();
        let [req_w, req_h] = self.spec.profile.resolution;
        let fps = self.spec.settings.frame_fps;

        let mut camera = match (self.factory)(os_index, req_w, req_h, fps) {
            Ok(camera) => camera,
            Err(e) => {
                self.report_error(format!("cannot open device {os_index}: {e}"));
                return Err(e.into());
            }
        };
        if let Err(e) = camera.connect() {
            self.report_error(format!("device {os_index} connect failed: {e}"));
            return Err(e.into());
        }

        let result = self.run_with_camera(camera.as_mut(), camera_id, role, serial);
        camera.release();
        info!("worker {camera_id} finished");
        result
    }

    fn run_with_camera(
        &mut self,
        camera: &mut dyn Camera,
        camera_id: CamId,
        role: RoleName,
        serial: Option<String>,
    ) -> Result<()> {
        let (actual_w, actual_h) = camera.resolution();
        if actual_w == 0 || actual_h == 0 {
            self.report_error("device reported zero geometry".to_string());
            return Err(Error::ZeroGeometry);
        }
        let mut shape = FrameShape::new(actual_h, actual_w, 3);
        if (actual_w, actual_h) != (self.spec.profile.resolution[0], self.spec.profile.resolution[1])
        {
            info!(
                "worker {camera_id}: device geometry {actual_w}x{actual_h} differs from \
                 requested {}x{}, ring sized for the device",
                self.spec.profile.resolution[0], self.spec.profile.resolution[1]
            );
        }

        let mut ring = self.allocate_ring(shape, &role)?;
        let mut frame_buf = vec![0u8; shape.num_bytes()];

        let mut config = CameraConfig::for_camera(camera_id);
        if let Some(path) = &self.spec.profile.calibration_file {
            match load_calibration_file(path) {
                Ok(calibration) => {
                    info!("worker {camera_id}: calibration loaded from {}", path.display());
                    config.calibration_data = Some(calibration);
                }
                Err(e) => warn!(
                    "worker {camera_id}: calibration {} unusable: {e}",
                    path.display()
                ),
            }
        }
        camera.apply_config(&config)?;

        let mut engine = PipelineEngine::new(self.bus.clone(), camera_id);
        let inbox = self.bus.register_worker(camera_id);

        let mut math_salt: f32 = 1.0;
        let mut frame_id = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let mut last_heartbeat: Option<Instant> = None;

        info!(
            "worker {camera_id} running at {actual_w}x{actual_h}, ring {}",
            ring.name()
        );

        while !self.stop.load(Ordering::Relaxed) {
            let force_heartbeat = self.drain_commands(
                &inbox,
                &mut math_salt,
                &mut config,
                camera,
                &mut engine,
            );

            // Hot-swap: the device changed geometry under us. Announce a
            // new ring before a single frame lands in it, then drop (and
            // unlink) the old one.
            let (now_w, now_h) = camera.resolution();
            if (now_w, now_h) != (shape.width, shape.height) {
                warn!(
                    "worker {camera_id}: geometry changed to {now_w}x{now_h}, hot-swapping ring"
                );
                shape = FrameShape::new(now_h, now_w, 3);
                ring = self.allocate_ring(shape, &role)?;
                frame_buf = vec![0u8; shape.num_bytes()];
            }

            let flags = match camera.capture(&mut frame_buf) {
                Ok(Some(flags)) => flags,
                Ok(None) => {
                    std::thread::sleep(NO_FRAME_SLEEP);
                    continue;
                }
                Err(e) => {
                    self.report_error(format!("capture failed: {e}"));
                    return Err(e.into());
                }
            };

            let timestamp = now_secs();
            ring.write(
                SlotHeader::new(frame_id, timestamp, math_salt, flags),
                &frame_buf,
            )?;

            engine.process_frame(&frame_buf, shape, frame_id, timestamp, &config);

            let due = last_heartbeat
                .map(|t| t.elapsed() >= HEARTBEAT_INTERVAL)
                .unwrap_or(true);
            if due || force_heartbeat {
                self.bus.publish_upstream(UpstreamEvent::Heartbeat(Heartbeat {
                    camera_id,
                    role: role.clone(),
                    sn: serial.clone(),
                    config: config.clone(),
                }));
                self.bus
                    .publish_upstream(UpstreamEvent::WorkerStatus(WorkerStatusReport {
                        camera_id,
                        status: "running".to_string(),
                        fps: engine.current_fps(),
                    }));
                last_heartbeat = Some(Instant::now());
            }

            frame_id += 1;
        }

        debug!("worker {camera_id} stop requested");
        Ok(())
    }

    /// Drain the command inbox. `SET_SALT` and `SET_CONFIG` are consumed
    /// here; everything else goes to the engine for stage dispatch.
    /// Returns true when a config change should be acknowledged by an
    /// immediate heartbeat.
    fn drain_commands(
        &self,
        inbox: &Receiver<CommandEnvelope>,
        math_salt: &mut f32,
        config: &mut CameraConfig,
        camera: &mut dyn Camera,
        engine: &mut PipelineEngine,
    ) -> bool {
        let mut force_heartbeat = false;
        while let Ok(envelope) = inbox.try_recv() {
            match envelope.cmd.as_str() {
                CMD_SET_SALT => {
                    *math_salt = envelope
                        .args
                        .get("salt")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(1.0) as f32;
                    debug!("worker {}: salt updated", self.spec.camera_id);
                }
                CMD_SET_CONFIG => match config.merged_with(&envelope.args) {
                    Ok(merged) => {
                        *config = merged;
                        if let Err(e) = camera.apply_config(config) {
                            warn!("config apply failed: {e}");
                        }
                        info!("worker {}: config updated", self.spec.camera_id);
                        force_heartbeat = true;
                    }
                    Err(e) => {
                        warn!("worker {}: bad SET_CONFIG: {e}", self.spec.camera_id);
                        self.report_error(format!("bad SET_CONFIG: {e}"));
                    }
                },
                _ => engine.dispatch_command(&envelope),
            }
        }
        force_heartbeat
    }
}

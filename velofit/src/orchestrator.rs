//! The singleton supervisor: binds physical devices to camera roles,
//! spawns one worker per role, watches their heartbeats, restarts the dead
//! and the frozen (rescanning devices first, since USB re-plugs move
//! indices), and publishes the 1 Hz `system_monitor` view.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, error, info, warn};

use velofit_bus::EventBus;
use velofit_cam::{index_for_serial, CameraFactory, DeviceScanner, DiscoveredDevice};
use velofit_config_data::{CameraProfile, Settings, StudioProfile};
use velofit_types::{
    BroadcastEvent, CamId, CameraState, RoleName, SystemMonitor, UpstreamEvent, WorkerPhase,
};
use velofit_worker::{CameraWorker, WorkerSpec};

use crate::security::SecurityStatus;

/// A worker missing heartbeats for this long is considered frozen.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

const MONITOR_TICK: Duration = Duration::from_millis(100);
const SYSTEM_MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// How long a stopped worker gets to wind down before its thread is
/// abandoned.
const JOIN_GRACE: Duration = Duration::from_secs(1);

pub type ScannerFactory = dyn Fn() -> Box<dyn DeviceScanner> + Send + Sync;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Bind scanned devices to enabled camera roles, `role_id` ascending.
///
/// A serial that resolves to an unused index binds there. Role 0 may fall
/// back to index 0 when unused (development mode); any other unresolvable
/// role is skipped. No index is ever bound twice.
pub fn allocate_devices(
    profile: &StudioProfile,
    devices: &[DiscoveredDevice],
) -> BTreeMap<CamId, usize> {
    let mut bound = BTreeMap::new();
    let mut used: BTreeSet<usize> = BTreeSet::new();

    for camera in profile.enabled_cameras() {
        let camera_id = CamId(camera.role_id);
        let resolved = camera
            .serial_number
            .as_deref()
            .and_then(|serial| index_for_serial(devices, serial));
        match resolved {
            Some(index) if !used.contains(&index) => {
                info!("role {camera_id} ({}) bound to device index {index}", camera.role_name);
                used.insert(index);
                bound.insert(camera_id, index);
            }
            Some(index) => {
                warn!("role {camera_id}: device index {index} already bound, skipping role");
            }
            None if camera.role_id == 0 && !used.contains(&0) => {
                warn!("role 0: serial not found, falling back to device index 0");
                used.insert(0);
                bound.insert(camera_id, 0);
            }
            None => {
                warn!(
                    "role {camera_id} ({}): no device for serial {:?}, skipping",
                    camera.role_name, camera.serial_number
                );
            }
        }
    }
    bound
}

/// Unlink every ring region a camera may have left behind. Regions are
/// named `shm_cam_<id>_<session>`, so a prefix sweep catches them all;
/// failures are tolerated (the region may already be gone).
fn cleanup_rings(camera_id: CamId) {
    let prefix = format!("shm_cam_{camera_id}_");
    let Ok(entries) = std::fs::read_dir(frame_ring::region_dir()) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) {
            match frame_ring::unlink_by_name(&name) {
                Ok(()) => info!("unlinked stale ring {name}"),
                Err(e) => debug!("stale ring {name} not removed: {e}"),
            }
        }
    }
}

struct WorkerRecord {
    profile: CameraProfile,
    handle: std::thread::JoinHandle<velofit_worker::Result<()>>,
    stop: Arc<AtomicBool>,
    last_heartbeat: Instant,
    restart_count: u32,
    os_index: usize,
    state: CameraState,
}

pub struct Orchestrator {
    bus: EventBus,
    profile: StudioProfile,
    settings: Settings,
    camera_factory: Arc<CameraFactory>,
    scanner_factory: Arc<ScannerFactory>,
    security_status: SecurityStatus,
}

pub struct OrchestratorHandle {
    stop: Arc<AtomicBool>,
    handle: std::thread::JoinHandle<()>,
}

impl OrchestratorHandle {
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn stop_and_join(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.handle.join().is_err() {
            error!("orchestrator thread panicked");
        }
    }
}

impl Orchestrator {
    pub fn new(
        bus: EventBus,
        profile: StudioProfile,
        settings: Settings,
        camera_factory: Arc<CameraFactory>,
        scanner_factory: Arc<ScannerFactory>,
        security_status: SecurityStatus,
    ) -> Self {
        Orchestrator {
            bus,
            profile,
            settings,
            camera_factory,
            scanner_factory,
            security_status,
        }
    }

    /// Run the supervisor on its own thread until the stop flag is raised.
    pub fn start(self) -> OrchestratorHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_inner = stop.clone();
        let handle = std::thread::Builder::new()
            .name("velofit-orchestrator".to_string())
            .spawn(move || self.run(stop_inner))
            .expect("failed to spawn orchestrator thread");
        OrchestratorHandle { stop, handle }
    }

    fn spawn_worker(
        &self,
        camera_id: CamId,
        profile: &CameraProfile,
        os_index: usize,
        restart_count: u32,
    ) -> WorkerRecord {
        self.bus.register_worker(camera_id);
        let stop = Arc::new(AtomicBool::new(false));
        let spec = WorkerSpec {
            camera_id,
            profile: profile.clone(),
            settings: self.settings.clone(),
            os_index: Some(os_index),
        };
        let worker = CameraWorker::new(
            spec,
            self.bus.clone(),
            self.camera_factory.clone(),
            (self.scanner_factory)(),
            stop.clone(),
        );
        info!(
            "spawning worker {camera_id} on device index {os_index} (restart {restart_count})"
        );
        WorkerRecord {
            profile: profile.clone(),
            handle: worker.spawn(),
            stop,
            last_heartbeat: Instant::now(),
            restart_count,
            os_index,
            state: CameraState {
                role: RoleName::new(profile.role_name.clone()),
                last_heartbeat: 0.0,
                config: Default::default(),
                fps: 0.0,
                status: WorkerPhase::Spawned,
            },
        }
    }

    /// Stop a worker, reap its thread within the grace period, clean its
    /// rings, rescan devices and spawn the replacement.
    fn restart_worker(&self, camera_id: CamId, record: WorkerRecord) -> WorkerRecord {
        record.stop.store(true, Ordering::Relaxed);
        let deadline = Instant::now() + JOIN_GRACE;
        while !record.handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if record.handle.is_finished() {
            let _ = record.handle.join();
        } else {
            // A thread cannot be killed; leave it to die on its stop flag.
            warn!("worker {camera_id} did not stop within grace, abandoning thread");
        }

        cleanup_rings(camera_id);

        // Rediscovery: the device may live on a new index after a re-plug.
        let os_index = {
            let mut scanner = (self.scanner_factory)();
            let devices = scanner.scan().unwrap_or_default();
            record
                .profile
                .serial_number
                .as_deref()
                .and_then(|serial| index_for_serial(&devices, serial))
                .unwrap_or(record.os_index)
        };
        if os_index != record.os_index {
            info!(
                "worker {camera_id}: device moved from index {} to {os_index}",
                record.os_index
            );
        }
        self.spawn_worker(camera_id, &record.profile, os_index, record.restart_count + 1)
    }

    fn publish_system_monitor(&self, workers: &BTreeMap<CamId, WorkerRecord>) {
        let cameras: BTreeMap<String, CameraState> = workers
            .iter()
            .map(|(camera_id, rec)| (camera_id.to_string(), rec.state.clone()))
            .collect();
        let attached: Vec<f64> = workers
            .values()
            .filter(|rec| rec.state.status == WorkerPhase::Attached)
            .map(|rec| rec.state.fps)
            .collect();
        let global_fps = if attached.is_empty() {
            0.0
        } else {
            attached.iter().sum::<f64>() / attached.len() as f64
        };
        self.bus
            .publish_broadcast(BroadcastEvent::SystemMonitor(SystemMonitor {
                cameras,
                global_fps,
                security: self.security_status.lock().clone(),
            }));
    }

    fn run(self, stop: Arc<AtomicBool>) {
        let mut workers: BTreeMap<CamId, WorkerRecord> = BTreeMap::new();

        let devices = {
            let mut scanner = (self.scanner_factory)();
            scanner.scan().unwrap_or_else(|e| {
                error!("initial device scan failed: {e}");
                Vec::new()
            })
        };
        info!("device scan found {} devices", devices.len());

        for (camera_id, os_index) in allocate_devices(&self.profile, &devices) {
            let profile = self
                .profile
                .camera_for_role(camera_id.0)
                .expect("allocation only yields profiled roles")
                .clone();
            workers.insert(
                camera_id,
                self.spawn_worker(camera_id, &profile, os_index, 0),
            );
        }

        let mut last_monitor = Instant::now();
        while !stop.load(Ordering::Relaxed) {
            while let Some(event) = self.bus.poll_upstream() {
                match event {
                    UpstreamEvent::Heartbeat(hb) => {
                        if let Some(rec) = workers.get_mut(&hb.camera_id) {
                            rec.last_heartbeat = Instant::now();
                            rec.state.role = hb.role;
                            rec.state.config = hb.config;
                            rec.state.last_heartbeat = now_secs();
                            rec.state.status = WorkerPhase::Attached;
                        }
                    }
                    UpstreamEvent::WorkerStatus(ws) => {
                        if let Some(rec) = workers.get_mut(&ws.camera_id) {
                            rec.state.fps = ws.fps;
                        }
                    }
                    UpstreamEvent::Error(report) => {
                        warn!("worker {} error: {}", report.camera_id, report.message);
                    }
                }
            }

            let mut to_restart = Vec::new();
            for (camera_id, rec) in workers.iter_mut() {
                if rec.handle.is_finished() {
                    error!("worker {camera_id} exited, scheduling restart");
                    rec.state.status = WorkerPhase::Dead;
                    to_restart.push(*camera_id);
                } else if rec.last_heartbeat.elapsed() > HEARTBEAT_TIMEOUT {
                    error!(
                        "worker {camera_id} frozen ({}s without heartbeat), scheduling restart",
                        rec.last_heartbeat.elapsed().as_secs()
                    );
                    rec.state.status = WorkerPhase::Frozen;
                    to_restart.push(*camera_id);
                }
            }
            for camera_id in to_restart {
                let record = workers.remove(&camera_id).expect("record exists");
                workers.insert(camera_id, self.restart_worker(camera_id, record));
            }

            if last_monitor.elapsed() >= SYSTEM_MONITOR_INTERVAL {
                self.publish_system_monitor(&workers);
                last_monitor = Instant::now();
            }

            std::thread::sleep(MONITOR_TICK);
        }

        info!("orchestrator stopping {} workers", workers.len());
        for rec in workers.values() {
            rec.stop.store(true, Ordering::Relaxed);
        }
        for (camera_id, rec) in workers {
            let deadline = Instant::now() + JOIN_GRACE;
            while !rec.handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if rec.handle.is_finished() {
                let _ = rec.handle.join();
            } else {
                warn!("worker {camera_id} abandoned at shutdown");
            }
        }
    }
}

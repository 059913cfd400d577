//! End-to-end worker behaviour against the mock camera backend: handshake
//! geometry, reserved commands, plugin command fan-out, and shutdown
//! cleanup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use frame_ring::{region_path, FrameRing};
use velofit_bus::EventBus;
use velofit_cam::{Camera, CameraFactory, MockCamera, MockScanner};
use velofit_config_data::{CameraProfile, Settings};
use velofit_types::{
    CamId, CommandTarget, CriticalEvent, ShmHandshake, UpstreamEvent,
};
use velofit_worker::{CameraWorker, WorkerSpec};

const DEADLINE: Duration = Duration::from_secs(10);

fn wait_for<T>(mut probe: impl FnMut() -> Option<T>, what: &str) -> T {
    let deadline = Instant::now() + DEADLINE;
    loop {
        if let Some(value) = probe() {
            return value;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn test_settings() -> Settings {
    Settings {
        shm_buffers: 3,
        frame_fps: 500,
        ..Default::default()
    }
}

/// Factory producing mocks with a fixed native geometry, regardless of the
/// requested one.
fn native_factory(native_w: u32, native_h: u32) -> Arc<CameraFactory> {
    Arc::new(move |os_index, _w, _h, fps| {
        Ok(Box::new(MockCamera::with_native_resolution(
            os_index, native_w, native_h, fps,
        )) as Box<dyn Camera>)
    })
}

struct Running {
    bus: EventBus,
    stop: Arc<AtomicBool>,
    handle: std::thread::JoinHandle<velofit_worker::Result<()>>,
}

impl Running {
    fn start(camera_id: CamId, native: (u32, u32)) -> Running {
        let bus = EventBus::new();
        let stop = Arc::new(AtomicBool::new(false));
        let profile = CameraProfile {
            role_id: camera_id.0,
            role_name: "side".to_string(),
            serial_number: Some(format!("MOCK{:04}", camera_id.0)),
            resolution: [64, 48],
            calibration_file: None,
            enabled: true,
        };
        let spec = WorkerSpec {
            camera_id,
            profile,
            settings: test_settings(),
            os_index: Some(camera_id.0 as usize),
        };
        let worker = CameraWorker::new(
            spec,
            bus.clone(),
            native_factory(native.0, native.1),
            Box::new(MockScanner::with_mock_devices(8)),
            stop.clone(),
        );
        let handle = worker.spawn();
        Running { bus, stop, handle }
    }

    fn handshake(&self) -> ShmHandshake {
        wait_for(
            || match self.bus.poll_critical() {
                Some(CriticalEvent::ShmHandshake(hs)) => Some(hs),
                None => None,
            },
            "shm handshake",
        )
    }

    fn finish(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.join().unwrap().unwrap();
    }
}

#[test]
fn handshake_reports_device_geometry_not_requested() {
    // Requested 64x48 in the profile, device is natively 32x24.
    let running = Running::start(CamId(0), (32, 24));
    let hs = running.handshake();
    assert_eq!(hs.camera_id, CamId(0));
    assert_eq!((hs.shape.width, hs.shape.height), (32, 24));
    assert_eq!(hs.dtype, "uint8");

    // The announced ring exists and carries frames of that geometry.
    let reader = FrameRing::attach(&hs.shm_name, hs.shape).unwrap();
    let mut buf = Vec::new();
    wait_for(
        || {
            let header = reader.read_latest_copy(&mut buf).ok()?;
            (header.frame_id > 0).then_some(())
        },
        "first frame in the ring",
    );
    assert_eq!(buf.len(), hs.shape.num_bytes());
    running.finish();
}

#[test]
fn set_salt_lands_in_frame_headers() {
    let running = Running::start(CamId(1), (32, 24));
    let hs = running.handshake();
    let reader = FrameRing::attach(&hs.shm_name, hs.shape).unwrap();

    running.bus.send_command(
        CommandTarget::Camera(CamId(1)),
        velofit_worker::CMD_SET_SALT,
        serde_json::json!({"salt": 2.5}),
    );

    let mut buf = Vec::new();
    wait_for(
        || {
            let header = reader.read_latest_copy(&mut buf).ok()?;
            (header.math_salt == 2.5).then_some(())
        },
        "salted frame header",
    );
    running.finish();
}

#[test]
fn set_config_is_acknowledged_by_heartbeat() {
    let running = Running::start(CamId(2), (32, 24));
    let _hs = running.handshake();

    running.bus.send_command(
        CommandTarget::Camera(CamId(2)),
        velofit_worker::CMD_SET_CONFIG,
        serde_json::json!({"threshold": 123, "exposure": 77}),
    );

    wait_for(
        || match running.bus.poll_upstream() {
            Some(UpstreamEvent::Heartbeat(hb))
                if hb.config.threshold == Some(123) && hb.config.exposure == Some(77) =>
            {
                Some(())
            }
            _ => None,
        },
        "heartbeat reflecting the merged config",
    );
    running.finish();
}

#[test]
fn stage_command_fans_out_into_stream_results() {
    let running = Running::start(CamId(3), (32, 24));
    let _hs = running.handshake();

    // "counter" is no camera, so the bus fans it out; the engine routes it
    // to the counter plugin by stage name.
    running.bus.send_command(
        CommandTarget::parse("counter"),
        "increment",
        serde_json::json!({}),
    );

    wait_for(
        || {
            let payload = running.bus.poll_stream()?;
            (payload.results.get("counter")?.get("value")? == &serde_json::json!(2))
                .then_some(())
        },
        "stream payload with incremented counter",
    );
    running.finish();
}

#[test]
fn worker_heartbeats_at_least_once_per_second() {
    let running = Running::start(CamId(4), (32, 24));
    let _hs = running.handshake();

    let mut beats = 0;
    let started = Instant::now();
    while started.elapsed() < Duration::from_millis(2500) {
        if let Some(UpstreamEvent::Heartbeat(_)) = running.bus.poll_upstream() {
            beats += 1;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(beats >= 2, "only {beats} heartbeats in 2.5 s");
    running.finish();
}

#[test]
fn stopping_the_worker_unlinks_its_ring() {
    let running = Running::start(CamId(5), (32, 24));
    let hs = running.handshake();
    assert!(region_path(&hs.shm_name).exists());
    running.finish();
    assert!(
        !region_path(&hs.shm_name).exists(),
        "ring region should be unlinked by the owner on shutdown"
    );
}

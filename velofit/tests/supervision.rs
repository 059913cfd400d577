//! Supervision behaviour: heartbeat-timeout restarts, dead-worker restarts
//! with device rediscovery, and the 1 Hz system monitor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use velofit::orchestrator::{Orchestrator, ScannerFactory};
use velofit::security::new_security_status;
use velofit_bus::EventBus;
use velofit_cam::{
    Camera, CameraFactory, DeviceScanner, DiscoveredDevice, MockCamera, MockScanner,
};
use velofit_config_data::{CameraProfile, Settings, StudioProfile};
use velofit_types::{BroadcastEvent, CameraConfig, FrameFlags, SystemMonitor, WorkerPhase};

const DEADLINE: Duration = Duration::from_secs(20);

fn wait_for<T>(mut probe: impl FnMut() -> Option<T>, what: &str) -> T {
    let deadline = Instant::now() + DEADLINE;
    loop {
        if let Some(value) = probe() {
            return value;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn test_settings() -> Settings {
    Settings {
        shm_buffers: 3,
        frame_fps: 300,
        ..Default::default()
    }
}

fn one_camera_profile(role_id: u8) -> StudioProfile {
    StudioProfile {
        cameras: vec![CameraProfile {
            role_id,
            role_name: "side".to_string(),
            serial_number: Some(format!("MOCK{role_id:04}")),
            resolution: [32, 24],
            calibration_file: None,
            enabled: true,
        }],
    }
}

fn next_monitor(bus: &EventBus) -> Option<SystemMonitor> {
    match bus.poll_broadcast() {
        Some(BroadcastEvent::SystemMonitor(monitor)) => Some(monitor),
        _ => None,
    }
}

/// Device that never has a frame ready: the worker stays alive but cannot
/// heartbeat, which is the sanctioned freeze simulation.
struct SilentCamera;

impl Camera for SilentCamera {
    fn connect(&mut self) -> velofit_cam::Result<()> {
        Ok(())
    }
    fn release(&mut self) {}
    fn resolution(&self) -> (u32, u32) {
        (32, 24)
    }
    fn fps(&self) -> u32 {
        300
    }
    fn capture(&mut self, _buf: &mut [u8]) -> velofit_cam::Result<Option<FrameFlags>> {
        Ok(None)
    }
    fn apply_config(&mut self, _config: &CameraConfig) -> velofit_cam::Result<()> {
        Ok(())
    }
}

/// Device that idles until told to die, then takes its worker down with a
/// capture error. The trigger lets a test order events deterministically.
struct DyingCamera {
    die: Arc<std::sync::atomic::AtomicBool>,
}

impl Camera for DyingCamera {
    fn connect(&mut self) -> velofit_cam::Result<()> {
        Ok(())
    }
    fn release(&mut self) {}
    fn resolution(&self) -> (u32, u32) {
        (32, 24)
    }
    fn fps(&self) -> u32 {
        300
    }
    fn capture(&mut self, _buf: &mut [u8]) -> velofit_cam::Result<Option<FrameFlags>> {
        if self.die.load(Ordering::SeqCst) {
            Err(velofit_cam::Error::NotConnected)
        } else {
            Ok(None)
        }
    }
    fn apply_config(&mut self, _config: &CameraConfig) -> velofit_cam::Result<()> {
        Ok(())
    }
}

#[test]
fn cold_start_publishes_empty_system_monitor() {
    let bus = EventBus::new();
    let scanner = MockScanner::new(vec![]);
    let orchestrator = Orchestrator::new(
        bus.clone(),
        StudioProfile { cameras: vec![] },
        test_settings(),
        Arc::from(velofit_cam::mock_camera_factory()),
        {
            let scanner = scanner.clone();
            Arc::new(move || Box::new(scanner.clone()) as Box<dyn DeviceScanner>)
                as Arc<ScannerFactory>
        },
        new_security_status(),
    );
    let handle = orchestrator.start();

    let monitor = wait_for(|| next_monitor(&bus), "system monitor broadcast");
    assert!(monitor.cameras.is_empty());
    assert_eq!(monitor.global_fps, 0.0);
    assert_eq!(monitor.security, "ok");
    handle.stop_and_join();
}

#[test]
fn frozen_worker_is_restarted_once_heartbeats_stop() {
    let bus = EventBus::new();
    let attempts = Arc::new(AtomicUsize::new(0));

    // First spawn gets a camera that never yields frames (no heartbeats);
    // the replacement gets a working mock.
    let factory: Arc<CameraFactory> = {
        let attempts = attempts.clone();
        Arc::new(move |os_index, _w, _h, fps| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt == 0 {
                Ok(Box::new(SilentCamera) as Box<dyn Camera>)
            } else {
                Ok(Box::new(MockCamera::with_native_resolution(
                    os_index, 32, 24, fps,
                )) as Box<dyn Camera>)
            }
        })
    };

    let scanner = MockScanner::new(vec![DiscoveredDevice {
        unique_id: "MOCK0010".to_string(),
        os_index: 0,
    }]);
    let orchestrator = Orchestrator::new(
        bus.clone(),
        one_camera_profile(10),
        test_settings(),
        factory,
        {
            let scanner = scanner.clone();
            Arc::new(move || Box::new(scanner.clone()) as Box<dyn DeviceScanner>)
                as Arc<ScannerFactory>
        },
        new_security_status(),
    );
    let handle = orchestrator.start();

    wait_for(
        || {
            let monitor = next_monitor(&bus)?;
            (monitor.cameras.get("10")?.status == WorkerPhase::Attached).then_some(())
        },
        "replacement worker to attach",
    );
    assert!(
        attempts.load(Ordering::SeqCst) >= 2,
        "worker was not respawned"
    );
    handle.stop_and_join();
}

#[test]
fn dead_worker_restarts_on_the_devices_new_index() {
    let bus = EventBus::new();
    let opened_indices: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let attempts = Arc::new(AtomicUsize::new(0));
    let die = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let factory: Arc<CameraFactory> = {
        let opened = opened_indices.clone();
        let attempts = attempts.clone();
        let die = die.clone();
        Arc::new(move |os_index, _w, _h, fps| {
            opened.lock().push(os_index);
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt == 0 {
                Ok(Box::new(DyingCamera { die: die.clone() }) as Box<dyn Camera>)
            } else {
                Ok(Box::new(MockCamera::with_native_resolution(
                    os_index, 32, 24, fps,
                )) as Box<dyn Camera>)
            }
        })
    };

    let scanner = MockScanner::new(vec![DiscoveredDevice {
        unique_id: "MOCK0011".to_string(),
        os_index: 0,
    }]);
    let orchestrator = Orchestrator::new(
        bus.clone(),
        one_camera_profile(11),
        test_settings(),
        factory,
        {
            let scanner = scanner.clone();
            Arc::new(move || Box::new(scanner.clone()) as Box<dyn DeviceScanner>)
                as Arc<ScannerFactory>
        },
        new_security_status(),
    );
    let handle = orchestrator.start();

    // Wait until the first (doomed) worker has opened index 0, re-plug the
    // camera onto index 1, and only then let the worker die so the restart
    // rescan sees the new index.
    wait_for(
        || (!opened_indices.lock().is_empty()).then_some(()),
        "first device open",
    );
    scanner.set_devices(vec![DiscoveredDevice {
        unique_id: "MOCK0011".to_string(),
        os_index: 1,
    }]);
    die.store(true, Ordering::SeqCst);

    wait_for(
        || {
            let monitor = next_monitor(&bus)?;
            (monitor.cameras.get("11")?.status == WorkerPhase::Attached).then_some(())
        },
        "restarted worker to attach",
    );
    let opened = opened_indices.lock().clone();
    assert_eq!(opened[0], 0);
    assert!(
        opened[1..].contains(&1),
        "restart did not follow the device to index 1: {opened:?}"
    );
    handle.stop_and_join();
}

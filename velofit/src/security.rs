//! License checking and the anti-tamper salt rotation.
//!
//! The provider is pluggable; the shipped development provider always
//! succeeds and hands out the neutral salt. A production dongle-backed
//! provider implements the same two calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use velofit_bus::EventBus;
use velofit_types::{BroadcastEvent, CommandTarget};

pub trait LicenseProvider: Send {
    fn verify_license(&self) -> bool;

    /// Scalar mixed into every frame header. Downstream biomechanics may
    /// multiply results by it; an invalid license yields a poisoned value.
    fn math_salt(&self) -> f32;
}

/// DEVELOPMENT ONLY: emulates a present, valid dongle.
pub struct DevLicenseProvider {
    valid: bool,
}

impl DevLicenseProvider {
    pub fn new() -> Self {
        warn!("running with the development license provider");
        DevLicenseProvider { valid: true }
    }

    pub fn invalid() -> Self {
        DevLicenseProvider { valid: false }
    }
}

impl Default for DevLicenseProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LicenseProvider for DevLicenseProvider {
    fn verify_license(&self) -> bool {
        self.valid
    }

    fn math_salt(&self) -> f32 {
        if self.valid {
            1.0
        } else {
            // Breaks downstream triangulation without crashing anything.
            0.0001
        }
    }
}

/// Shared security verdict shown in `system_monitor` payloads.
pub type SecurityStatus = Arc<Mutex<String>>;

pub fn new_security_status() -> SecurityStatus {
    Arc::new(Mutex::new("ok".to_string()))
}

/// Periodic license check + salt broadcast. On a failed check the task
/// publishes `SECURITY_LOCK` once and exits.
pub fn spawn_security_task(
    bus: EventBus,
    provider: Box<dyn LicenseProvider>,
    interval: Duration,
    status: SecurityStatus,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("velofit-security".to_string())
        .spawn(move || {
            let mut next_check = Instant::now();
            while !stop.load(Ordering::Relaxed) {
                if Instant::now() >= next_check {
                    if !provider.verify_license() {
                        *status.lock() = "locked".to_string();
                        error!("license verification failed, issuing SECURITY_LOCK");
                        bus.publish_broadcast(BroadcastEvent::SecurityLock {
                            reason: "license verification failed".to_string(),
                        });
                        return;
                    }
                    *status.lock() = "ok".to_string();
                    bus.send_command(
                        CommandTarget::Named("all".to_string()),
                        velofit_worker::CMD_SET_SALT,
                        serde_json::json!({"salt": provider.math_salt()}),
                    );
                    next_check = Instant::now() + interval;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            info!("security task stopped");
        })
        .expect("failed to spawn security thread")
}

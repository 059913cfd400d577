use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use velofit::orchestrator::{Orchestrator, ScannerFactory};
use velofit::security::{
    new_security_status, spawn_security_task, DevLicenseProvider,
};
use velofit::{endpoint, logging, velofit_start};
use velofit_bus::EventBus;
use velofit_cam::{
    mock_camera_factory, CameraFactory, DeviceScanner, MockScanner, SysfsScanner,
};
use velofit_config_data::{parse_profile_file, Settings, StudioProfile};

#[derive(Debug, Parser)]
#[command(author, version, about = "Multi-camera vision backend for bicycle fitting")]
struct CliArgs {
    /// Studio profile (JSON). Without one, a two-camera mock profile is
    /// used.
    #[arg(env = "VELOFIT_PROFILE")]
    profile: Option<std::path::PathBuf>,

    /// Print the built-in default profile and exit.
    #[arg(long)]
    default_profile: bool,
}

/// Pick device backends for this profile. Only the mock camera backend is
/// compiled in; hardware drivers plug in through [`CameraFactory`]. The
/// scanner is real sysfs enumeration unless every camera is a mock.
fn select_backends(profile: &StudioProfile) -> (Arc<CameraFactory>, Arc<ScannerFactory>) {
    let all_mock = profile.enabled_cameras().iter().all(|c| {
        c.serial_number
            .as_deref()
            .map(|s| s.starts_with("MOCK"))
            .unwrap_or(false)
    });
    let camera_factory: Arc<CameraFactory> = Arc::from(mock_camera_factory());
    let scanner_factory: Arc<ScannerFactory> = if all_mock {
        let count = profile.cameras.len().max(1);
        Arc::new(move || {
            Box::new(MockScanner::with_mock_devices(count)) as Box<dyn DeviceScanner>
        })
    } else {
        warn!("non-mock serials in profile; no hardware capture backend is compiled in, devices will open as mocks");
        Arc::new(|| Box::new(SysfsScanner::default()) as Box<dyn DeviceScanner>)
    };
    (camera_factory, scanner_factory)
}

fn main() -> Result<()> {
    velofit_start()?;
    logging::init()?;

    let args = CliArgs::parse();

    if args.default_profile {
        println!(
            "{}",
            serde_json::to_string_pretty(&StudioProfile::default())?
        );
        return Ok(());
    }

    let profile = match &args.profile {
        Some(path) => parse_profile_file(path)
            .with_context(|| format!("loading profile {}", path.display()))?,
        None => {
            info!("no profile given, using the built-in mock profile");
            StudioProfile::default()
        }
    };
    let settings = Settings::from_env();
    info!(
        "starting velofit: {} cameras enabled, endpoint {}",
        profile.enabled_cameras().len(),
        settings.api_addr
    );

    let bus = EventBus::new();
    let security_status = new_security_status();
    let (camera_factory, scanner_factory) = select_backends(&profile);

    let orchestrator = Orchestrator::new(
        bus.clone(),
        profile,
        settings.clone(),
        camera_factory,
        scanner_factory,
        security_status.clone(),
    );
    let orchestrator_handle = orchestrator.start();

    let security_stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let security_handle = spawn_security_task(
        bus.clone(),
        Box::new(DevLicenseProvider::new()),
        std::time::Duration::from_secs(settings.math_salt_interval_secs),
        security_status,
        security_stop.clone(),
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("velofit-endpoint")
        .build()?;
    let result = runtime.block_on(endpoint::serve(&settings.api_addr, bus, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    }));

    info!("shutting down workers");
    security_stop.store(true, std::sync::atomic::Ordering::Relaxed);
    orchestrator_handle.stop_and_join();
    let _ = security_handle.join();

    result.context("endpoint failed")?;
    info!("velofit stopped cleanly");
    Ok(())
}

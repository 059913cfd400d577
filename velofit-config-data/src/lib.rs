//! Studio configuration: the JSON profile describing cameras and roles,
//! per-camera calibration files, and environment overrides for the
//! infrastructure knobs.

use serde::{Deserialize, Serialize};

use velofit_types::CalibrationData;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("JSON deserialization error: {source}")]
    JsonDe {
        #[from]
        source: serde_json::Error,
    },
    #[error("role_id {0} appears more than once in the profile")]
    DuplicateRole(u8),
}

type Result<T> = std::result::Result<T, Error>;

fn default_resolution() -> [u32; 2] {
    [1920, 1200]
}

fn default_true() -> bool {
    true
}

/// One camera entry in the studio profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraProfile {
    pub role_id: u8,
    pub role_name: String,
    /// Stable hardware identifier used to bind the role to a device. A
    /// `MOCK`-prefixed serial selects the simulated camera backend.
    pub serial_number: Option<String>,
    /// Requested `[width, height]`; the device may report something else.
    #[serde(default = "default_resolution")]
    pub resolution: [u32; 2],
    /// Lens/world calibration for this camera, relative to the profile
    /// file unless absolute.
    pub calibration_file: Option<std::path::PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl CameraProfile {
    pub fn mock(role_id: u8, role_name: &str) -> Self {
        CameraProfile {
            role_id,
            role_name: role_name.to_string(),
            serial_number: Some(format!("MOCK{role_id:04}")),
            resolution: default_resolution(),
            calibration_file: None,
            enabled: true,
        }
    }
}

/// The studio profile: every camera the installation knows about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudioProfile {
    pub cameras: Vec<CameraProfile>,
}

impl Default for StudioProfile {
    fn default() -> Self {
        StudioProfile {
            cameras: vec![
                CameraProfile::mock(0, "side"),
                CameraProfile::mock(1, "front"),
            ],
        }
    }
}

impl StudioProfile {
    /// Cameras that should be running, in `role_id` ascending order.
    pub fn enabled_cameras(&self) -> Vec<&CameraProfile> {
        let mut cameras: Vec<&CameraProfile> =
            self.cameras.iter().filter(|c| c.enabled).collect();
        cameras.sort_by_key(|c| c.role_id);
        cameras
    }

    pub fn camera_for_role(&self, role_id: u8) -> Option<&CameraProfile> {
        self.cameras.iter().find(|c| c.role_id == role_id)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.role_id) {
                return Err(Error::DuplicateRole(camera.role_id));
            }
        }
        Ok(())
    }

    /// Make every relative calibration path relative to the profile file
    /// location.
    fn fixup_relative_paths(&mut self, profile_path: &std::path::Path) {
        let dirname = profile_path.parent().unwrap_or(std::path::Path::new("."));
        for camera in &mut self.cameras {
            if let Some(path) = camera.calibration_file.as_mut() {
                if path.is_relative() {
                    *path = dirname.join(&path);
                }
            }
        }
    }
}

pub fn parse_profile_file<P: AsRef<std::path::Path>>(fname: P) -> Result<StudioProfile> {
    let contents = std::fs::read_to_string(fname.as_ref())?;
    let mut profile: StudioProfile = serde_json::from_str(&contents)?;
    profile.validate()?;
    profile.fixup_relative_paths(fname.as_ref());
    Ok(profile)
}

/// Read a per-camera calibration file (lens intrinsics and/or world
/// homography).
pub fn load_calibration_file<P: AsRef<std::path::Path>>(
    fname: P,
) -> Result<CalibrationData> {
    let contents = std::fs::read_to_string(fname.as_ref())?;
    Ok(serde_json::from_str(&contents)?)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(text) => text.parse().unwrap_or_else(|_| {
            tracing::warn!("ignoring unparseable {key}");
            default
        }),
        Err(_) => default,
    }
}

/// Infrastructure knobs, sourced from the environment with studio-grade
/// defaults. The profile describes cameras; these describe the host.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// HTTP endpoint bind address.
    pub api_addr: String,
    /// Ring capacity in slots.
    pub shm_buffers: u32,
    /// Fallback capture geometry when a profile omits the resolution.
    pub frame_width: u32,
    pub frame_height: u32,
    pub frame_fps: u32,
    /// Seconds between `SET_SALT` broadcasts from the security task.
    pub math_salt_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            api_addr: "127.0.0.1:8089".to_string(),
            shm_buffers: 10,
            frame_width: 1920,
            frame_height: 1200,
            frame_fps: 90,
            math_salt_interval_secs: 30,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Settings {
            api_addr: std::env::var("VELOFIT_API_ADDR").unwrap_or(defaults.api_addr),
            shm_buffers: env_parsed("VELOFIT_SHM_BUFFERS", defaults.shm_buffers),
            frame_width: env_parsed("VELOFIT_FRAME_WIDTH", defaults.frame_width),
            frame_height: env_parsed("VELOFIT_FRAME_HEIGHT", defaults.frame_height),
            frame_fps: env_parsed("VELOFIT_FRAME_FPS", defaults.frame_fps),
            math_salt_interval_secs: env_parsed(
                "VELOFIT_SALT_INTERVAL",
                defaults.math_salt_interval_secs,
            ),
        }
    }
}

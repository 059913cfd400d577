use serde::{Deserialize, Serialize};

use crate::CamId;

/// Lens and world calibration loaded from the per-camera calibration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CalibrationData {
    /// 3x3 pinhole intrinsics, row-major.
    #[serde(skip_serializing_if = "Option::is_none", default, alias = "mtx")]
    pub camera_matrix: Option<[[f64; 3]; 3]>,
    /// Brown-Conrady coefficients `[k1, k2, p1, p2, k3]`.
    #[serde(skip_serializing_if = "Option::is_none", default, alias = "dist")]
    pub dist_coeffs: Option<Vec<f64>>,
    /// 3x3 homography mapping undistorted pixels to world meters.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub perspective_matrix: Option<[[f64; 3]; 3]>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub px_per_cm: Option<f64>,
}

fn default_min_area() -> u32 {
    15
}

fn default_max_blobs() -> usize {
    50
}

fn default_true() -> bool {
    true
}

/// Union of hardware (UVC) and software (CV) camera parameters.
///
/// Mutations are command-driven (`SET_CONFIG`); the worker echoes the
/// current value in every heartbeat and embeds it in stream payloads on
/// throttle frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub camera_id: Option<CamId>,

    // Hardware (UVC)
    pub exposure: Option<i32>,
    pub gain: Option<i32>,
    pub auto_exposure: Option<bool>,
    pub auto_focus: Option<bool>,
    pub focus: Option<i32>,
    pub white_balance: Option<i32>,

    // Software (CV)
    pub threshold: Option<u8>,
    #[serde(default = "default_min_area")]
    pub min_area: u32,
    #[serde(default = "default_max_blobs")]
    pub max_blobs: usize,
    #[serde(default)]
    pub calib_threshold: u8,
    #[serde(default)]
    pub is_calibration_mode: bool,
    #[serde(default = "default_true")]
    pub enable_undistort: bool,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub calibration_data: Option<CalibrationData>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig {
            camera_id: None,
            exposure: None,
            gain: None,
            auto_exposure: None,
            auto_focus: None,
            focus: None,
            white_balance: None,
            threshold: None,
            min_area: default_min_area(),
            max_blobs: default_max_blobs(),
            calib_threshold: 0,
            is_calibration_mode: false,
            enable_undistort: true,
            calibration_data: None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigMergeError {
    #[error("SET_CONFIG args must be a JSON object")]
    NotAnObject,
    #[error("merged config failed validation: {source}")]
    Invalid {
        #[from]
        source: serde_json::Error,
    },
}

impl CameraConfig {
    pub fn for_camera(camera_id: CamId) -> Self {
        CameraConfig {
            camera_id: Some(camera_id),
            ..Default::default()
        }
    }

    /// Overlay `args` field-by-field onto this config, returning the merged
    /// value. Unknown keys are ignored, matching the permissive wire schema.
    pub fn merged_with(
        &self,
        args: &serde_json::Value,
    ) -> Result<CameraConfig, ConfigMergeError> {
        let overlay = args.as_object().ok_or(ConfigMergeError::NotAnObject)?;
        let mut base = match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => map,
            _ => unreachable!("CameraConfig serializes to an object"),
        };
        for (key, value) in overlay {
            base.insert(key.clone(), value.clone());
        }
        Ok(serde_json::from_value(serde_json::Value::Object(base))?)
    }
}

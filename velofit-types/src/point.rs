use serde::{Deserialize, Serialize};

/// One tracked keypoint, carried through the pipeline in three coordinate
/// systems: raw screen pixels `(x, y)`, lens-corrected pixels `(ux, uy)`
/// and metric world centimetres `(wx, wy)`.
///
/// The detector creates points with raw coordinates only; the tracker
/// assigns `id`/velocity, undistort fills `(ux, uy)` and perspective fills
/// `(wx, wy)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ux: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub uy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub wx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub wy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub label: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub vx: f64,
    #[serde(default)]
    pub vy: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub age: u32,
    #[serde(default)]
    pub is_stable: bool,
}

impl Point {
    pub fn detected(x: f64, y: f64, confidence: f64) -> Self {
        Point {
            x,
            y,
            ux: None,
            uy: None,
            wx: None,
            wy: None,
            id: None,
            label: None,
            confidence,
            vx: 0.0,
            vy: 0.0,
            speed: 0.0,
            age: 0,
            is_stable: false,
        }
    }

    /// Best available pixel coordinates: undistorted when present, raw
    /// otherwise.
    pub fn pixel(&self) -> (f64, f64) {
        (self.ux.unwrap_or(self.x), self.uy.unwrap_or(self.y))
    }
}

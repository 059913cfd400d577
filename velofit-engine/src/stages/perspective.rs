use nalgebra::{Matrix3, Vector3};
use tracing::{debug, info};

use crate::{FrameContext, Stage, StageError};

/// Projects points from (undistorted) pixels into world centimetres.
///
/// With a world calibration the homography maps pixels to metres on the
/// measurement plane; without one a linear pixels-per-centimetre scale
/// keeps world coordinates usable for rough work.
pub struct PerspectiveStage {
    homography: Option<Matrix3<f64>>,
    px_per_cm: f64,
    loaded: bool,
    is_paused: bool,
}

impl PerspectiveStage {
    pub fn new() -> Self {
        PerspectiveStage {
            homography: None,
            px_per_cm: 1.0,
            loaded: false,
            is_paused: false,
        }
    }

    fn load_from_config(&mut self, ctx: &FrameContext) {
        self.loaded = true;
        self.homography = None;
        self.px_per_cm = 1.0;
        let Some(calibration) = &ctx.config.calibration_data else {
            debug!("perspective: no calibration in config");
            return;
        };
        if let Some(scale) = calibration.px_per_cm {
            self.px_per_cm = scale;
        }
        if let Some(matrix) = &calibration.perspective_matrix {
            self.homography = Some(Matrix3::from_fn(|r, c| matrix[r][c]));
            info!("perspective: world calibration loaded");
        }
    }
}

impl Default for PerspectiveStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for PerspectiveStage {
    fn name(&self) -> &str {
        "perspective"
    }

    fn process(&mut self, ctx: &mut FrameContext) -> Result<(), StageError> {
        if !self.loaded {
            self.load_from_config(ctx);
        }
        if ctx.points.is_empty() {
            return Ok(());
        }

        let homography = match self.homography {
            Some(h) if !self.is_paused => h,
            _ => {
                let scale = if self.px_per_cm > 0.0 {
                    self.px_per_cm
                } else {
                    1.0
                };
                for p in &mut ctx.points {
                    let (px, py) = p.pixel();
                    p.wx = Some(px / scale);
                    p.wy = Some(py / scale);
                }
                return Ok(());
            }
        };

        for p in &mut ctx.points {
            let (px, py) = p.pixel();
            let mapped = homography * Vector3::new(px, py, 1.0);
            let w = mapped[2];
            if w.abs() < f64::EPSILON || !mapped[0].is_finite() || !mapped[1].is_finite()
            {
                p.wx = Some(0.0);
                p.wy = Some(0.0);
                continue;
            }
            // The calibration board is laid out in metres; world output is
            // centimetres.
            p.wx = Some(mapped[0] / w * 100.0);
            p.wy = Some(mapped[1] / w * 100.0);
        }
        Ok(())
    }

    fn handle_command(&mut self, cmd: &str, _args: &serde_json::Value) -> bool {
        match cmd {
            "toggle_pause" => {
                self.is_paused = !self.is_paused;
                info!(
                    "perspective {}",
                    if self.is_paused { "paused" } else { "resumed" }
                );
                true
            }
            "reload_config" => {
                self.loaded = false;
                info!("perspective: calibration reload scheduled");
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameContext, FrameView};
    use velofit_types::{CalibrationData, CamId, CameraConfig, FrameShape, Point};

    fn run(stage: &mut PerspectiveStage, config: &CameraConfig, x: f64, y: f64) -> Point {
        let mut ctx = FrameContext::new(
            FrameView {
                pixels: &[],
                shape: FrameShape::new(0, 0, 3),
            },
            1,
            0.0,
            config,
            CamId(0),
        );
        ctx.points.push(Point::detected(x, y, 1.0));
        stage.process(&mut ctx).unwrap();
        ctx.points.remove(0)
    }

    #[test]
    fn fallback_scale_divides_pixels() {
        let mut stage = PerspectiveStage::new();
        let mut config = CameraConfig::default();
        config.calibration_data = Some(CalibrationData {
            px_per_cm: Some(10.0),
            ..Default::default()
        });
        let p = run(&mut stage, &config, 100.0, 50.0);
        assert_eq!(p.wx, Some(10.0));
        assert_eq!(p.wy, Some(5.0));
    }

    #[test]
    fn no_calibration_defaults_to_unit_scale() {
        let mut stage = PerspectiveStage::new();
        let config = CameraConfig::default();
        let p = run(&mut stage, &config, 100.0, 50.0);
        assert_eq!(p.wx, Some(100.0));
        assert_eq!(p.wy, Some(50.0));
    }

    #[test]
    fn homography_maps_pixels_to_centimetres() {
        let mut stage = PerspectiveStage::new();
        let mut config = CameraConfig::default();
        // Pure scaling homography: 100 px = 1 m.
        config.calibration_data = Some(CalibrationData {
            perspective_matrix: Some([
                [0.01, 0.0, 0.0],
                [0.0, 0.01, 0.0],
                [0.0, 0.0, 1.0],
            ]),
            ..Default::default()
        });
        let p = run(&mut stage, &config, 250.0, 100.0);
        // 250 px -> 2.5 m -> 250 cm.
        assert_eq!(p.wx, Some(250.0));
        assert_eq!(p.wy, Some(100.0));
    }

    #[test]
    fn undistorted_coordinates_take_priority() {
        let mut stage = PerspectiveStage::new();
        let mut config = CameraConfig::default();
        config.calibration_data = Some(CalibrationData {
            px_per_cm: Some(1.0),
            ..Default::default()
        });
        let mut ctx = FrameContext::new(
            FrameView {
                pixels: &[],
                shape: FrameShape::new(0, 0, 3),
            },
            1,
            0.0,
            &config,
            CamId(0),
        );
        let mut point = Point::detected(100.0, 50.0, 1.0);
        point.ux = Some(90.0);
        point.uy = Some(45.0);
        ctx.points.push(point);
        stage.process(&mut ctx).unwrap();
        assert_eq!(ctx.points[0].wx, Some(90.0));
        assert_eq!(ctx.points[0].wy, Some(45.0));
    }

    #[test]
    fn degenerate_projection_yields_origin() {
        let mut stage = PerspectiveStage::new();
        let mut config = CameraConfig::default();
        // Bottom row maps everything to w = 0.
        config.calibration_data = Some(CalibrationData {
            perspective_matrix: Some([
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0],
            ]),
            ..Default::default()
        });
        let p = run(&mut stage, &config, 10.0, 10.0);
        assert_eq!(p.wx, Some(0.0));
        assert_eq!(p.wy, Some(0.0));
    }
}

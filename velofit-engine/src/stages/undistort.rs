use nalgebra::Matrix3;
use tracing::{debug, info, warn};

use crate::{FrameContext, Stage, StageError};

/// Newton iterations for inverting the distortion model; enough for
/// sub-millipixel accuracy at typical lens distortions.
const INVERT_ITERATIONS: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Intrinsics {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    /// Brown-Conrady `[k1, k2, p1, p2, k3]`.
    dist: [f64; 5],
}

impl Intrinsics {
    fn from_calibration(
        matrix: &[[f64; 3]; 3],
        coeffs: &[f64],
    ) -> Option<Intrinsics> {
        let m = Matrix3::from_fn(|r, c| matrix[r][c]);
        let (fx, fy) = (m[(0, 0)], m[(1, 1)]);
        if fx == 0.0 || fy == 0.0 {
            return None;
        }
        let mut dist = [0.0; 5];
        for (slot, value) in dist.iter_mut().zip(coeffs.iter()) {
            *slot = *value;
        }
        Some(Intrinsics {
            fx,
            fy,
            cx: m[(0, 2)],
            cy: m[(1, 2)],
            dist,
        })
    }

    /// Map a distorted pixel to its undistorted position, keeping the
    /// original pixel scale (the equivalent of projecting back through the
    /// same intrinsics).
    fn undistort_pixel(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let [k1, k2, p1, p2, k3] = self.dist;
        let xd = (x - self.cx) / self.fx;
        let yd = (y - self.cy) / self.fy;

        let mut xu = xd;
        let mut yu = yd;
        for _ in 0..INVERT_ITERATIONS {
            let r2 = xu * xu + yu * yu;
            let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
            let dx = 2.0 * p1 * xu * yu + p2 * (r2 + 2.0 * xu * xu);
            let dy = p1 * (r2 + 2.0 * yu * yu) + 2.0 * p2 * xu * yu;
            if radial == 0.0 {
                return None;
            }
            xu = (xd - dx) / radial;
            yu = (yd - dy) / radial;
        }
        let ux = self.fx * xu + self.cx;
        let uy = self.fy * yu + self.cy;
        (ux.is_finite() && uy.is_finite()).then_some((ux, uy))
    }
}

/// Applies the lens model to tracked points: `(x, y)` in, `(ux, uy)` out.
/// Without calibration data (or while paused) coordinates pass through
/// unchanged so downstream stages always have something to work with.
pub struct UndistortStage {
    intrinsics: Option<Intrinsics>,
    loaded: bool,
    is_paused: bool,
}

impl UndistortStage {
    pub fn new() -> Self {
        UndistortStage {
            intrinsics: None,
            loaded: false,
            is_paused: false,
        }
    }

    fn load_from_config(&mut self, ctx: &FrameContext) {
        self.loaded = true;
        self.intrinsics = None;
        let Some(calibration) = &ctx.config.calibration_data else {
            return;
        };
        match (&calibration.camera_matrix, &calibration.dist_coeffs) {
            (Some(matrix), Some(coeffs)) => {
                self.intrinsics = Intrinsics::from_calibration(matrix, coeffs);
                if self.intrinsics.is_some() {
                    info!("undistort: lens calibration loaded");
                } else {
                    warn!("undistort: calibration has degenerate intrinsics");
                }
            }
            _ => debug!("undistort: no lens calibration in config"),
        }
    }
}

impl Default for UndistortStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for UndistortStage {
    fn name(&self) -> &str {
        "undistort"
    }

    fn process(&mut self, ctx: &mut FrameContext) -> Result<(), StageError> {
        if !self.loaded {
            self.load_from_config(ctx);
        }
        if ctx.points.is_empty() {
            return Ok(());
        }

        let intrinsics = match self.intrinsics {
            Some(i) if ctx.config.enable_undistort && !self.is_paused => i,
            _ => {
                for p in &mut ctx.points {
                    p.ux = Some(p.x);
                    p.uy = Some(p.y);
                }
                return Ok(());
            }
        };

        for p in &mut ctx.points {
            match intrinsics.undistort_pixel(p.x, p.y) {
                Some((ux, uy)) => {
                    p.ux = Some(ux);
                    p.uy = Some(uy);
                }
                None => {
                    p.ux = Some(p.x);
                    p.uy = Some(p.y);
                }
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, cmd: &str, _args: &serde_json::Value) -> bool {
        match cmd {
            "toggle_pause" => {
                self.is_paused = !self.is_paused;
                info!(
                    "undistort {}",
                    if self.is_paused { "paused" } else { "resumed" }
                );
                true
            }
            "reload_config" => {
                self.loaded = false;
                info!("undistort: calibration reload scheduled");
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

    fn calibrated_config(k1: f64) -> CameraConfig {
        let mut config = CameraConfig::default();
        config.calibration_data = Some(CalibrationData {
            camera_matrix: Some([
                [800.0, 0.0, 320.0],
                [0.0, 800.0, 240.0],
                [0.0, 0.0, 1.0],
            ]),
            dist_coeffs: Some(vec![k1, 0.0, 0.0, 0.0, 0.0]),
            perspective_matrix: None,
            px_per_cm: None,
        });
        config
    }

    fn run(stage: &mut UndistortStage, config: &CameraConfig, x: f64, y: f64) -> Point {
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

    /// Forward-distort a normalized point with the radial model.
    fn distort(config: &CameraConfig, xu: f64, yu: f64) -> (f64, f64) {
        let cal = config.calibration_data.as_ref().unwrap();
        let m = cal.camera_matrix.unwrap();
        let k1 = cal.dist_coeffs.as_ref().unwrap()[0];
        let (fx, fy, cx, cy) = (m[0][0], m[1][1], m[0][2], m[1][2]);
        let xn = (xu - cx) / fx;
        let yn = (yu - cy) / fy;
        let r2 = xn * xn + yn * yn;
        let radial = 1.0 + k1 * r2;
        (fx * xn * radial + cx, fy * yn * radial + cy)
    }

    #[test]
    fn passthrough_without_calibration() {
        let mut stage = UndistortStage::new();
        let config = CameraConfig::default();
        let p = run(&mut stage, &config, 100.0, 50.0);
        assert_eq!(p.ux, Some(100.0));
        assert_eq!(p.uy, Some(50.0));
    }

    #[test]
    fn undistort_inverts_the_forward_model() {
        let mut stage = UndistortStage::new();
        let config = calibrated_config(-0.2);
        let (true_ux, true_uy) = (500.0, 400.0);
        let (dx, dy) = distort(&config, true_ux, true_uy);
        let p = run(&mut stage, &config, dx, dy);
        assert!((p.ux.unwrap() - true_ux).abs() < 1e-3, "ux={:?}", p.ux);
        assert!((p.uy.unwrap() - true_uy).abs() < 1e-3, "uy={:?}", p.uy);
    }

    #[test]
    fn principal_point_is_a_fixed_point() {
        let mut stage = UndistortStage::new();
        let config = calibrated_config(-0.2);
        let p = run(&mut stage, &config, 320.0, 240.0);
        assert!((p.ux.unwrap() - 320.0).abs() < 1e-9);
        assert!((p.uy.unwrap() - 240.0).abs() < 1e-9);
    }

    #[test]
    fn disabled_by_config_flag() {
        let mut stage = UndistortStage::new();
        let mut config = calibrated_config(-0.2);
        config.enable_undistort = false;
        let p = run(&mut stage, &config, 100.0, 60.0);
        assert_eq!(p.ux, Some(100.0));
        assert_eq!(p.uy, Some(60.0));
    }

    #[test]
    fn toggle_pause_switches_to_passthrough() {
        let mut stage = UndistortStage::new();
        let config = calibrated_config(-0.2);
        assert!(stage.handle_command("toggle_pause", &serde_json::Value::Null));
        let p = run(&mut stage, &config, 100.0, 60.0);
        assert_eq!(p.ux, Some(100.0));
        assert!(stage.handle_command("toggle_pause", &serde_json::Value::Null));
        let p = run(&mut stage, &config, 100.0, 60.0);
        assert_ne!(p.ux, Some(100.0));
    }

    #[test]
    fn reload_picks_up_new_calibration() {
        let mut stage = UndistortStage::new();
        let plain = CameraConfig::default();
        run(&mut stage, &plain, 100.0, 60.0);
        // Calibration appears via SET_CONFIG; a reload command re-reads it.
        let calibrated = calibrated_config(-0.2);
        let p = run(&mut stage, &calibrated, 100.0, 60.0);
        assert_eq!(p.ux, Some(100.0), "stale cache should still pass through");
        assert!(stage.handle_command("reload_config", &serde_json::Value::Null));
        let p = run(&mut stage, &calibrated, 100.0, 60.0);
        assert_ne!(p.ux, Some(100.0));
    }
}

use tracing::debug;

use velofit_types::{Point, WidgetKind};

use crate::{FrameContext, FrameView, Stage, StageError};

const DEFAULT_THRESHOLD: u8 = 200;

struct Blob {
    cx: f64,
    cy: f64,
    area: f64,
}

/// Finds bright markers: threshold, connected components, centroid by
/// moments, then a spatial non-maximum suppression so two reflective
/// markers closer than the physical minimum distance collapse into one.
pub struct BlobDetectorStage {
    min_area: u32,
    max_blobs: usize,
    /// Physical minimum distance between markers.
    min_dist_cm: f64,
    /// Pixels per centimetre assumed when no world calibration published a
    /// scale.
    default_scale: f64,
}

impl BlobDetectorStage {
    pub fn new() -> Self {
        BlobDetectorStage {
            min_area: 15,
            max_blobs: 50,
            min_dist_cm: 5.0,
            default_scale: 10.0,
        }
    }
}

impl Default for BlobDetectorStage {
    fn default() -> Self {
        Self::new()
    }
}

fn luminance(px: &[u8]) -> u8 {
    ((px[0] as u32 * 299 + px[1] as u32 * 587 + px[2] as u32 * 114) / 1000) as u8
}

/// 8-connected component labelling over the thresholded image, centroids
/// from first-order moments.
fn find_blobs(frame: FrameView, threshold: u8, min_area: u32) -> Vec<Blob> {
    let w = frame.shape.width as usize;
    let h = frame.shape.height as usize;
    let c = frame.shape.channels as usize;
    if w == 0 || h == 0 || frame.pixels.len() < w * h * c {
        return Vec::new();
    }

    let bright = |x: usize, y: usize| -> bool {
        let at = (y * w + x) * c;
        let value = if c >= 3 {
            luminance(&frame.pixels[at..at + 3])
        } else {
            frame.pixels[at]
        };
        value > threshold
    };

    let mut visited = vec![false; w * h];
    let mut blobs = Vec::new();
    let mut stack = Vec::new();

    for start_y in 0..h {
        for start_x in 0..w {
            if visited[start_y * w + start_x] || !bright(start_x, start_y) {
                continue;
            }
            let mut count = 0u64;
            let mut sum_x = 0u64;
            let mut sum_y = 0u64;
            visited[start_y * w + start_x] = true;
            stack.push((start_x, start_y));
            while let Some((x, y)) = stack.pop() {
                count += 1;
                sum_x += x as u64;
                sum_y += y as u64;
                let x0 = x.saturating_sub(1);
                let y0 = y.saturating_sub(1);
                for ny in y0..=(y + 1).min(h - 1) {
                    for nx in x0..=(x + 1).min(w - 1) {
                        let at = ny * w + nx;
                        if !visited[at] && bright(nx, ny) {
                            visited[at] = true;
                            stack.push((nx, ny));
                        }
                    }
                }
            }
            if count >= min_area as u64 {
                blobs.push(Blob {
                    cx: sum_x as f64 / count as f64,
                    cy: sum_y as f64 / count as f64,
                    area: count as f64,
                });
            }
        }
    }
    blobs
}

impl Stage for BlobDetectorStage {
    fn name(&self) -> &str {
        "blob_detector"
    }

    fn process(&mut self, ctx: &mut FrameContext) -> Result<(), StageError> {
        let threshold = ctx.config.threshold.unwrap_or(DEFAULT_THRESHOLD);
        let px_per_cm = ctx
            .get_data("calibration", "world_data")
            .and_then(|v| v.get("scale"))
            .and_then(|v| v.as_f64())
            .unwrap_or(self.default_scale);
        let min_dist_px = self.min_dist_cm * px_per_cm;

        let mut candidates = find_blobs(ctx.frame, threshold, self.min_area);
        // Largest markers take precedence in the suppression pass.
        candidates.sort_by(|a, b| b.area.total_cmp(&a.area));

        let mut accepted: Vec<Point> = Vec::new();
        for cand in &candidates {
            let too_close = accepted.iter().any(|p| {
                let d = ((cand.cx - p.x).powi(2) + (cand.cy - p.y).powi(2)).sqrt();
                d < min_dist_px
            });
            if too_close {
                continue;
            }
            let mut point = Point::detected(cand.cx, cand.cy, 1.0);
            point.label = Some("blob".to_string());
            accepted.push(point);
            if accepted.len() >= self.max_blobs {
                break;
            }
        }

        let found = accepted.len();
        ctx.points = accepted;

        if ctx.frame_id % 15 == 0 {
            let status = if found == 0 {
                "neutral"
            } else if found < self.max_blobs {
                "success"
            } else {
                "warning"
            };
            ctx.ui.update_widget(
                "blobs_found",
                "Markers",
                serde_json::json!({"value": found, "status": status}),
                WidgetKind::StatusIndicator,
            );
        }
        Ok(())
    }

    fn handle_command(&mut self, cmd: &str, args: &serde_json::Value) -> bool {
        match cmd {
            "set_min_area" => {
                if let Some(value) = args.get("value").and_then(|v| v.as_u64()) {
                    self.min_area = value as u32;
                    debug!("blob_detector: min_area set to {}", self.min_area);
                }
                true
            }
            "set_min_dist_cm" => {
                if let Some(value) = args.get("value").and_then(|v| v.as_f64()) {
                    self.min_dist_cm = value;
                    debug!("blob_detector: min_dist_cm set to {}", self.min_dist_cm);
                }
                true
            }
            _ => false,
        }
    }

    fn set_param(&mut self, name: &str, value: &serde_json::Value) -> bool {
        match name {
            "min_area" => {
                if let Some(v) = value.as_u64() {
                    self.min_area = v as u32;
                    return true;
                }
                false
            }
            "max_blobs" => {
                if let Some(v) = value.as_u64() {
                    self.max_blobs = v as usize;
                    return true;
                }
                false
            }
            "min_dist_cm" => {
                if let Some(v) = value.as_f64() {
                    self.min_dist_cm = v;
                    return true;
                }
                false
            }
            _ => false,
        }
    }
}

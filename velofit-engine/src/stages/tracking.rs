use std::collections::BTreeMap;

use tracing::info;

use velofit_types::{Point, WidgetKind};

use crate::{FrameContext, Stage, StageError};

/// Nominal inter-frame interval used for velocity estimation.
const FRAME_DT: f64 = 1.0 / 90.0;

/// Velocity smoothing factor (exponential moving average).
const VELOCITY_ALPHA: f64 = 0.5;

/// Assigns stable ids to detections across frames.
///
/// Matching is done against linearly extrapolated positions
/// (`x + vx * dt`), which keeps ids attached through fast pedal strokes
/// where plain nearest-centroid association would swap markers.
pub struct CentroidTrackerStage {
    next_id: u32,
    objects: BTreeMap<u32, Point>,
    disappeared: BTreeMap<u32, u32>,
    /// Frames a point may stay unseen before its id is retired
    /// (half a second at 90 fps).
    max_disappeared: u32,
    /// Maximum plausible displacement between prediction and observation.
    max_distance: f64,
}

impl CentroidTrackerStage {
    pub fn new() -> Self {
        CentroidTrackerStage {
            next_id: 1,
            objects: BTreeMap::new(),
            disappeared: BTreeMap::new(),
            max_disappeared: 45,
            max_distance: 150.0,
        }
    }

    fn register(&mut self, mut point: Point) {
        point.id = Some(self.next_id);
        point.label = Some(format!("ID {}", self.next_id));
        point.age = 0;
        point.is_stable = false;
        self.objects.insert(self.next_id, point);
        self.disappeared.insert(self.next_id, 0);
        self.next_id += 1;
    }

    fn deregister(&mut self, object_id: u32) {
        self.objects.remove(&object_id);
        self.disappeared.remove(&object_id);
    }

    fn bump_disappeared(&mut self) {
        let expired: Vec<u32> = self
            .disappeared
            .iter_mut()
            .filter_map(|(id, count)| {
                *count += 1;
                (*count > self.max_disappeared).then_some(*id)
            })
            .collect();
        for id in expired {
            self.deregister(id);
        }
    }

    fn finalize(&mut self, ctx: &mut FrameContext) {
        ctx.points = self
            .objects
            .iter()
            .filter(|(id, _)| self.disappeared.get(id) == Some(&0))
            .map(|(_, p)| p.clone())
            .collect();

        if ctx.frame_id % 15 == 0 {
            ctx.ui.update_widget(
                "tracker_stat",
                "Tracking",
                serde_json::json!({
                    "active": ctx.points.len(),
                    "total": self.next_id - 1,
                }),
                WidgetKind::Text,
            );
        }
    }
}

impl Default for CentroidTrackerStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for CentroidTrackerStage {
    fn name(&self) -> &str {
        "tracker"
    }

    fn process(&mut self, ctx: &mut FrameContext) -> Result<(), StageError> {
        let input = std::mem::take(&mut ctx.points);

        if self.objects.is_empty() {
            for p in input {
                self.register(p);
            }
            self.finalize(ctx);
            return Ok(());
        }

        if input.is_empty() {
            self.bump_disappeared();
            self.finalize(ctx);
            return Ok(());
        }

        let object_ids: Vec<u32> = self.objects.keys().copied().collect();
        let predicted: Vec<(f64, f64)> = object_ids
            .iter()
            .map(|id| {
                let obj = &self.objects[id];
                (obj.x + obj.vx * FRAME_DT, obj.y + obj.vy * FRAME_DT)
            })
            .collect();

        // Distance matrix between predictions and observations.
        let dist: Vec<Vec<f64>> = predicted
            .iter()
            .map(|(px, py)| {
                input
                    .iter()
                    .map(|p| ((px - p.x).powi(2) + (py - p.y).powi(2)).sqrt())
                    .collect()
            })
            .collect();

        // Greedy assignment: rows in order of their best match quality.
        let mut rows: Vec<usize> = (0..dist.len()).collect();
        let row_min = |row: usize| -> f64 {
            dist[row].iter().copied().fold(f64::INFINITY, f64::min)
        };
        rows.sort_by(|a, b| row_min(*a).total_cmp(&row_min(*b)));

        let mut used_rows = vec![false; dist.len()];
        let mut used_cols = vec![false; input.len()];
        for row in rows {
            let col = (0..input.len())
                .min_by(|a, b| dist[row][*a].total_cmp(&dist[row][*b]))
                .unwrap_or(0);
            if used_rows[row] || used_cols[col] {
                continue;
            }
            if dist[row][col] > self.max_distance {
                continue;
            }

            let object_id = object_ids[row];
            let observation = &input[col];
            let existing = self.objects.get_mut(&object_id).unwrap();

            let inst_vx = (observation.x - existing.x) / FRAME_DT;
            let inst_vy = (observation.y - existing.y) / FRAME_DT;
            existing.vx = existing.vx * VELOCITY_ALPHA + inst_vx * (1.0 - VELOCITY_ALPHA);
            existing.vy = existing.vy * VELOCITY_ALPHA + inst_vy * (1.0 - VELOCITY_ALPHA);
            existing.speed = existing.vx.hypot(existing.vy);

            existing.x = observation.x;
            existing.y = observation.y;
            existing.confidence = observation.confidence;
            existing.age += 1;
            existing.is_stable = existing.age >= self.max_disappeared;
            // Downstream stages must recompute the corrected coordinates.
            existing.ux = None;
            existing.uy = None;
            self.disappeared.insert(object_id, 0);

            used_rows[row] = true;
            used_cols[col] = true;
        }

        let unmatched_ids: Vec<u32> = object_ids
            .iter()
            .enumerate()
            .filter(|(row, _)| !used_rows[*row])
            .map(|(_, id)| *id)
            .collect();
        for id in unmatched_ids {
            let count = self.disappeared.entry(id).or_insert(0);
            *count += 1;
            if *count > self.max_disappeared {
                self.deregister(id);
            }
        }

        for (col, observation) in input.into_iter().enumerate() {
            if !used_cols[col] {
                self.register(observation);
            }
        }

        self.finalize(ctx);
        Ok(())
    }

    fn handle_command(&mut self, cmd: &str, _args: &serde_json::Value) -> bool {
        if cmd == "reset_tracker" {
            self.objects.clear();
            self.disappeared.clear();
            self.next_id = 1;
            info!("tracker reset");
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use velofit_types::{CamId, CameraConfig, FrameShape};

    fn run_frame(
        stage: &mut CentroidTrackerStage,
        frame_id: i64,
        detections: Vec<(f64, f64)>,
    ) -> Vec<Point> {
        let config = CameraConfig::default();
        let mut ctx = FrameContext::new(
            crate::FrameView {
                pixels: &[],
                shape: FrameShape::new(0, 0, 3),
            },
            frame_id,
            frame_id as f64 * FRAME_DT,
            &config,
            CamId(0),
        );
        ctx.points = detections
            .into_iter()
            .map(|(x, y)| Point::detected(x, y, 1.0))
            .collect();
        stage.process(&mut ctx).unwrap();
        ctx.points
    }

    #[test]
    fn ids_assigned_on_first_frame() {
        let mut stage = CentroidTrackerStage::new();
        let points = run_frame(&mut stage, 1, vec![(10.0, 10.0), (100.0, 100.0)]);
        let ids: Vec<u32> = points.iter().map(|p| p.id.unwrap()).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn id_follows_a_moving_point() {
        let mut stage = CentroidTrackerStage::new();
        run_frame(&mut stage, 1, vec![(10.0, 10.0)]);
        for step in 1..10 {
            let points = run_frame(
                &mut stage,
                1 + step,
                vec![(10.0 + step as f64 * 5.0, 10.0)],
            );
            assert_eq!(points.len(), 1);
            assert_eq!(points[0].id, Some(1));
        }
        let points = run_frame(&mut stage, 11, vec![(60.0, 10.0)]);
        assert!(points[0].vx > 0.0);
        assert!(points[0].speed > 0.0);
    }

    #[test]
    fn far_jump_registers_a_new_id() {
        let mut stage = CentroidTrackerStage::new();
        run_frame(&mut stage, 1, vec![(10.0, 10.0)]);
        let points = run_frame(&mut stage, 2, vec![(500.0, 500.0)]);
        // The jump exceeds max_distance: the old id starts disappearing
        // and a fresh one is issued.
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].id, Some(2));
    }

    #[test]
    fn id_retired_after_retention_window() {
        let mut stage = CentroidTrackerStage::new();
        run_frame(&mut stage, 1, vec![(10.0, 10.0)]);
        for frame in 0..=stage.max_disappeared as i64 {
            let points = run_frame(&mut stage, 2 + frame, vec![]);
            assert!(points.is_empty());
        }
        // The id is gone; a new detection at the same spot gets id 2.
        let points = run_frame(&mut stage, 60, vec![(10.0, 10.0)]);
        assert_eq!(points[0].id, Some(2));
    }

    #[test]
    fn brief_dropout_keeps_the_id() {
        let mut stage = CentroidTrackerStage::new();
        run_frame(&mut stage, 1, vec![(10.0, 10.0)]);
        run_frame(&mut stage, 2, vec![]);
        run_frame(&mut stage, 3, vec![]);
        let points = run_frame(&mut stage, 4, vec![(12.0, 10.0)]);
        assert_eq!(points[0].id, Some(1));
    }

    #[test]
    fn corrected_coordinates_cleared_on_update() {
        let mut stage = CentroidTrackerStage::new();
        run_frame(&mut stage, 1, vec![(10.0, 10.0)]);
        stage.objects.get_mut(&1).unwrap().ux = Some(9.5);
        let points = run_frame(&mut stage, 2, vec![(11.0, 10.0)]);
        assert_eq!(points[0].ux, None);
    }

    #[test]
    fn reset_command_clears_state() {
        let mut stage = CentroidTrackerStage::new();
        run_frame(&mut stage, 1, vec![(10.0, 10.0)]);
        assert!(stage.handle_command("reset_tracker", &serde_json::Value::Null));
        let points = run_frame(&mut stage, 2, vec![(10.0, 10.0)]);
        assert_eq!(points[0].id, Some(1));
    }
}

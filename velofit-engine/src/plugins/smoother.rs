use std::collections::HashMap;

use tracing::info;

use crate::filters::PointSmoother;
use crate::{FrameContext, Stage, StageError};

/// Filter state is dropped once this many ids accumulate, protecting
/// against unbounded growth over a long session.
const MAX_TRACKED_IDS: usize = 256;

/// One-Euro smoothing of world coordinates, one filter pair per track id.
/// Runs after the core sequence, so it sees fully projected points.
pub struct SmootherPlugin {
    filters: HashMap<u32, PointSmoother>,
    min_cutoff: f64,
    beta: f64,
}

impl SmootherPlugin {
    pub fn new() -> Self {
        SmootherPlugin {
            filters: HashMap::new(),
            min_cutoff: 0.5,
            beta: 0.01,
        }
    }
}

impl Default for SmootherPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for SmootherPlugin {
    fn name(&self) -> &str {
        "smoother"
    }

    fn process(&mut self, ctx: &mut FrameContext) -> Result<(), StageError> {
        let timestamp = ctx.timestamp;
        for p in &mut ctx.points {
            let (Some(id), Some(wx), Some(wy)) = (p.id, p.wx, p.wy) else {
                continue;
            };
            let filter = self
                .filters
                .entry(id)
                .or_insert_with(|| PointSmoother::new(self.min_cutoff, self.beta));
            let (sx, sy) = filter.filter(wx, wy, timestamp);
            p.wx = Some(sx);
            p.wy = Some(sy);
        }

        if self.filters.len() > MAX_TRACKED_IDS {
            let live: std::collections::HashSet<u32> =
                ctx.points.iter().filter_map(|p| p.id).collect();
            self.filters.retain(|id, _| live.contains(id));
        }
        Ok(())
    }

    fn handle_command(&mut self, cmd: &str, _args: &serde_json::Value) -> bool {
        if cmd == "reset" {
            self.filters.clear();
            info!("smoother filters cleared");
            return true;
        }
        false
    }

    fn set_param(&mut self, name: &str, value: &serde_json::Value) -> bool {
        let Some(v) = value.as_f64() else {
            return false;
        };
        match name {
            "min_cutoff" => {
                self.min_cutoff = v;
                self.filters.clear();
                true
            }
            "beta" => {
                self.beta = v;
                self.filters.clear();
                true
            }
            _ => false,
        }
    }
}

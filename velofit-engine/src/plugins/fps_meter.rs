use std::time::Instant;

use velofit_types::WidgetKind;

use crate::{FrameContext, Stage, StageError};

/// Measures the true processed frame rate and reports it once a second.
pub struct FpsMeterPlugin {
    last_report: Instant,
    frames: u32,
    fps: f64,
}

impl FpsMeterPlugin {
    pub fn new() -> Self {
        FpsMeterPlugin {
            last_report: Instant::now(),
            frames: 0,
            fps: 0.0,
        }
    }
}

impl Default for FpsMeterPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for FpsMeterPlugin {
    fn name(&self) -> &str {
        "fps_meter"
    }

    fn process(&mut self, ctx: &mut FrameContext) -> Result<(), StageError> {
        self.frames += 1;
        let delta = self.last_report.elapsed().as_secs_f64();
        if delta >= 1.0 {
            self.fps = self.frames as f64 / delta;
            self.frames = 0;
            self.last_report = Instant::now();
            ctx.ui.update_widget(
                "fps_real",
                "Real FPS",
                serde_json::json!(format!("{:.1}", self.fps)),
                WidgetKind::Text,
            );
        }
        ctx.set_data("fps_meter", "fps", serde_json::json!(self.fps));
        Ok(())
    }
}

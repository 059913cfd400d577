use tracing::{info, warn};

use crate::{FrameContext, Stage, StageError};

/// Minimal command-driven plugin: keeps a counter, publishes it every
/// frame. Useful as a liveness probe for the command path end to end.
pub struct CounterPlugin {
    count: i64,
    commands_received: u64,
}

impl CounterPlugin {
    pub fn new() -> Self {
        CounterPlugin {
            count: 1,
            commands_received: 0,
        }
    }

    pub fn count(&self) -> i64 {
        self.count
    }
}

impl Default for CounterPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for CounterPlugin {
    fn name(&self) -> &str {
        "counter"
    }

    fn process(&mut self, ctx: &mut FrameContext) -> Result<(), StageError> {
        ctx.set_data("counter", "value", serde_json::json!(self.count));
        Ok(())
    }

    fn handle_command(&mut self, cmd: &str, args: &serde_json::Value) -> bool {
        self.commands_received += 1;
        match cmd {
            "increment" => {
                self.count += 1;
                true
            }
            "reset" => {
                self.count = 0;
                info!("counter reset");
                true
            }
            "set_value" => {
                match args.get("value").and_then(|v| v.as_i64()) {
                    Some(value) => self.count = value,
                    None => warn!("counter: set_value without a numeric value"),
                }
                true
            }
            _ => false,
        }
    }
}

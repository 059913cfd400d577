//! Plugins shipped with the engine. Each one is also a worked example of
//! the stage contract: a stable name, per-frame processing, and optional
//! command handling.

mod counter;
mod fps_meter;
mod smoother;

pub use counter::CounterPlugin;
pub use fps_meter::FpsMeterPlugin;
pub use smoother::SmootherPlugin;

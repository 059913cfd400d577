//! The fixed core stage sequence: detection → tracking → undistort →
//! perspective.

mod detection;
mod perspective;
mod tracking;
mod undistort;

pub use detection::BlobDetectorStage;
pub use perspective::PerspectiveStage;
pub use tracking::CentroidTrackerStage;
pub use undistort::UndistortStage;

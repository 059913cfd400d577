//! Camera abstraction for the velofit workers.
//!
//! Driver specifics (UVC parameter control, MJPEG decoding) live behind the
//! [`Camera`] trait; the core only relies on this contract. [`MockCamera`]
//! is a full software implementation used by tests and `MOCK*` profiles.

use velofit_types::{CameraConfig, FrameFlags};

mod mock;
mod scan;

pub use mock::MockCamera;
pub use scan::{index_for_serial, DeviceScanner, DiscoveredDevice, MockScanner, SysfsScanner};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cannot open device at index {0}")]
    OpenFailed(usize),
    #[error("camera is not connected")]
    NotConnected,
    #[error("capture buffer is {got} bytes but one frame needs {want}")]
    BufferSize { got: usize, want: usize },
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

fn _test_error_is_send() {
    fn implements<T: Send>() {}
    implements::<Error>();
}

/// One physical (or simulated) video device.
///
/// `capture` fills the caller's buffer with one row-major RGB frame and
/// reports per-frame status flags; `Ok(None)` means no frame was available
/// yet, which callers treat as a transient condition.
pub trait Camera: Send {
    fn connect(&mut self) -> Result<()>;

    fn release(&mut self);

    /// Actual `(width, height)` as reported by the device after `connect`.
    /// This may differ from the requested geometry.
    fn resolution(&self) -> (u32, u32);

    fn fps(&self) -> u32;

    fn capture(&mut self, buf: &mut [u8]) -> Result<Option<FrameFlags>>;

    /// Push the hardware-relevant part of a [`CameraConfig`] to the device.
    fn apply_config(&mut self, config: &CameraConfig) -> Result<()>;

    fn serial(&self) -> Option<&str> {
        None
    }
}

/// How a worker obtains its device. The orchestrator hands one of these to
/// every worker so tests can substitute mock hardware.
pub type CameraFactory =
    dyn Fn(usize, u32, u32, u32) -> Result<Box<dyn Camera>> + Send + Sync;

/// A factory producing [`MockCamera`]s that honour the requested geometry.
pub fn mock_camera_factory() -> Box<CameraFactory> {
    Box::new(|os_index, width, height, fps| {
        Ok(Box::new(MockCamera::new(os_index, width, height, fps)) as Box<dyn Camera>)
    })
}

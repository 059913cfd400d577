use std::time::{Duration, Instant};

use tracing::{debug, info};

use velofit_types::{CameraConfig, FrameFlags};

use crate::{Camera, Error, Result};

/// Frames within this range of the capture counter render as a full-white
/// sync flash.
const FLASH_FRAMES: std::ops::RangeInclusive<u64> = 28..=32;

/// Simulated device: a bright square marker orbiting the frame centre on a
/// black background, with a sync-flash burst shortly after start. Marker
/// brightness follows the configured exposure, so exposure commands have a
/// visible effect.
pub struct MockCamera {
    os_index: usize,
    width: u32,
    height: u32,
    fps: u32,
    serial: String,
    connected: bool,
    started: Instant,
    frame_counter: u64,
    exposure: i32,
}

impl MockCamera {
    pub fn new(os_index: usize, width: u32, height: u32, fps: u32) -> Self {
        MockCamera {
            os_index,
            width,
            height,
            fps: fps.max(1),
            serial: format!("MOCK{os_index:04}"),
            connected: false,
            started: Instant::now(),
            frame_counter: 0,
            exposure: 100,
        }
    }

    /// A mock whose native geometry differs from whatever was requested,
    /// for exercising the ring hot-swap path.
    pub fn with_native_resolution(
        os_index: usize,
        native_width: u32,
        native_height: u32,
        fps: u32,
    ) -> Self {
        Self::new(os_index, native_width, native_height, fps)
    }

    fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    fn marker_position(&self) -> (i64, i64) {
        let elapsed = self.frame_counter as f64 / self.fps as f64;
        let angle = elapsed * 2.0;
        let cx = self.width as f64 / 2.0;
        let cy = self.height as f64 / 2.0;
        let radius = (self.width.min(self.height) as f64 / 3.0).max(2.0);
        let offset_x = match self.os_index {
            1 => 50.0_f64.min(cx / 2.0),
            2 => -(50.0_f64.min(cx / 2.0)),
            _ => 0.0,
        };
        (
            (cx + angle.cos() * radius + offset_x) as i64,
            (cy + angle.sin() * radius) as i64,
        )
    }
}

impl Camera for MockCamera {
    fn connect(&mut self) -> Result<()> {
        info!("connecting mock camera #{} ({})", self.os_index, self.serial);
        self.connected = true;
        self.started = Instant::now();
        self.frame_counter = 0;
        Ok(())
    }

    fn release(&mut self) {
        self.connected = false;
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn fps(&self) -> u32 {
        self.fps
    }

    fn capture(&mut self, buf: &mut [u8]) -> Result<Option<FrameFlags>> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        let want = self.frame_bytes();
        if buf.len() != want {
            return Err(Error::BufferSize {
                got: buf.len(),
                want,
            });
        }

        // Pace the synthetic stream to the configured rate.
        let due = self.started + Duration::from_secs_f64(
            self.frame_counter as f64 / self.fps as f64,
        );
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }

        let flags = if FLASH_FRAMES.contains(&self.frame_counter) {
            buf.fill(255);
            FrameFlags::SYNC_FLASH
        } else {
            buf.fill(0);
            let (px, py) = self.marker_position();
            let brightness = self.exposure.clamp(50, 255) as u8;
            let w = self.width as i64;
            let h = self.height as i64;
            for y in (py - 5).max(0)..(py + 5).min(h) {
                for x in (px - 5).max(0)..(px + 5).min(w) {
                    let at = ((y * w + x) * 3) as usize;
                    buf[at..at + 3].fill(brightness);
                }
            }
            FrameFlags::empty()
        };

        self.frame_counter += 1;
        Ok(Some(flags))
    }

    fn apply_config(&mut self, config: &CameraConfig) -> Result<()> {
        if let Some(exposure) = config.exposure {
            self.exposure = exposure;
            debug!("mock camera #{}: exposure set to {exposure}", self.os_index);
        }
        Ok(())
    }

    fn serial(&self) -> Option<&str> {
        Some(&self.serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_mock(width: u32, height: u32) -> MockCamera {
        let mut cam = MockCamera::new(0, width, height, 1000);
        cam.connect().unwrap();
        cam
    }

    #[test]
    fn capture_requires_connection() {
        let mut cam = MockCamera::new(0, 8, 8, 1000);
        let mut buf = vec![0u8; 8 * 8 * 3];
        assert!(matches!(cam.capture(&mut buf), Err(Error::NotConnected)));
    }

    #[test]
    fn marker_is_drawn_and_moves() {
        let mut cam = fast_mock(64, 48);
        let mut buf = vec![0u8; 64 * 48 * 3];
        cam.capture(&mut buf).unwrap();
        let lit_first: Vec<usize> = buf
            .iter()
            .enumerate()
            .filter(|(_, v)| **v > 0)
            .map(|(i, _)| i)
            .collect();
        assert!(!lit_first.is_empty());

        // Skip ahead past the flash window, then compare positions.
        for _ in 0..40 {
            cam.capture(&mut buf).unwrap();
        }
        let lit_later: Vec<usize> = buf
            .iter()
            .enumerate()
            .filter(|(_, v)| **v > 0)
            .map(|(i, _)| i)
            .collect();
        assert!(!lit_later.is_empty());
        assert_ne!(lit_first, lit_later);
    }

    #[test]
    fn flash_frames_are_flagged_and_white() {
        let mut cam = fast_mock(16, 16);
        let mut buf = vec![0u8; 16 * 16 * 3];
        let mut saw_flash = false;
        for _ in 0..=40 {
            let flags = cam.capture(&mut buf).unwrap().unwrap();
            if flags.contains(FrameFlags::SYNC_FLASH) {
                saw_flash = true;
                assert!(buf.iter().all(|v| *v == 255));
            }
        }
        assert!(saw_flash);
    }

    #[test]
    fn exposure_drives_marker_brightness() {
        let mut cam = fast_mock(32, 32);
        let mut config = CameraConfig::default();
        config.exposure = Some(60);
        cam.apply_config(&config).unwrap();
        let mut buf = vec![0u8; 32 * 32 * 3];
        cam.capture(&mut buf).unwrap();
        let max = *buf.iter().max().unwrap();
        assert_eq!(max, 60);
    }

    #[test]
    fn wrong_buffer_size_rejected() {
        let mut cam = fast_mock(16, 16);
        let mut buf = vec![0u8; 10];
        assert!(matches!(
            cam.capture(&mut buf),
            Err(Error::BufferSize { got: 10, .. })
        ));
    }
}

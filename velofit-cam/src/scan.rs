use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::Result;

/// One attached video device found during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Serial number or other stable hardware identifier.
    pub unique_id: String,
    /// OS capture index, valid until the next hotplug.
    pub os_index: usize,
}

/// Enumerates attached video devices. Rescans are cheap and may be called
/// after every worker death, since hotplug can move a serial to a new index.
pub trait DeviceScanner: Send {
    fn scan(&mut self) -> Result<Vec<DiscoveredDevice>>;
}

/// Resolve a profile serial against a scan result: exact match first, then
/// partial (either string containing the other), matching how vendor tools
/// report truncated identifiers.
pub fn index_for_serial(devices: &[DiscoveredDevice], serial: &str) -> Option<usize> {
    if let Some(dev) = devices.iter().find(|d| d.unique_id == serial) {
        return Some(dev.os_index);
    }
    for dev in devices {
        if dev.unique_id.contains(serial) || serial.contains(dev.unique_id.as_str()) {
            warn!(
                "serial {serial}: no exact match, using partial match {}",
                dev.unique_id
            );
            return Some(dev.os_index);
        }
    }
    None
}

/// Scanner over a shared, mutable device table. Cloned handles let a test
/// (or a dev harness) re-plug devices between scans.
#[derive(Clone, Default)]
pub struct MockScanner {
    devices: Arc<Mutex<Vec<DiscoveredDevice>>>,
}

impl MockScanner {
    pub fn new(devices: Vec<DiscoveredDevice>) -> Self {
        MockScanner {
            devices: Arc::new(Mutex::new(devices)),
        }
    }

    pub fn with_mock_devices(count: usize) -> Self {
        Self::new(
            (0..count)
                .map(|i| DiscoveredDevice {
                    unique_id: format!("MOCK{i:04}"),
                    os_index: i,
                })
                .collect(),
        )
    }

    /// Replace the device table, simulating a hotplug event.
    pub fn set_devices(&self, devices: Vec<DiscoveredDevice>) {
        *self.devices.lock() = devices;
    }
}

impl DeviceScanner for MockScanner {
    fn scan(&mut self) -> Result<Vec<DiscoveredDevice>> {
        Ok(self.devices.lock().clone())
    }
}

/// Linux scanner reading `/sys/class/video4linux`. On other platforms the
/// scan comes back empty and roles fall back to their default indices.
#[derive(Debug, Default, Clone)]
pub struct SysfsScanner {}

impl DeviceScanner for SysfsScanner {
    fn scan(&mut self) -> Result<Vec<DiscoveredDevice>> {
        let mut devices = Vec::new();
        let base = std::path::Path::new("/sys/class/video4linux");
        if !base.is_dir() {
            warn!("no video4linux sysfs tree on this platform, scan is empty");
            return Ok(devices);
        }
        for entry in std::fs::read_dir(base)? {
            let entry = entry?;
            let dir_name = entry.file_name();
            let dir_name = dir_name.to_string_lossy();
            let Some(index) = dir_name
                .strip_prefix("video")
                .and_then(|tail| tail.parse::<usize>().ok())
            else {
                continue;
            };
            let name = std::fs::read_to_string(entry.path().join("name"))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| dir_name.to_string());
            devices.push(DiscoveredDevice {
                unique_id: format!("{name}:{index}"),
                os_index: index,
            });
        }
        devices.sort_by_key(|d| d.os_index);
        info!("device scan found {} capture devices", devices.len());
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_serial_match_wins() {
        let devices = vec![
            DiscoveredDevice {
                unique_id: "ABC123".into(),
                os_index: 0,
            },
            DiscoveredDevice {
                unique_id: "ABC1234".into(),
                os_index: 1,
            },
        ];
        assert_eq!(index_for_serial(&devices, "ABC1234"), Some(1));
    }

    #[test]
    fn partial_serial_match_falls_back() {
        let devices = vec![DiscoveredDevice {
            unique_id: "USB\\VID_046D&PID_0825\\6F7F2D2F".into(),
            os_index: 2,
        }];
        assert_eq!(index_for_serial(&devices, "6F7F2D2F"), Some(2));
        assert_eq!(index_for_serial(&devices, "NOPE"), None);
    }

    #[test]
    fn mock_scanner_reflects_hotplug() {
        let scanner = MockScanner::with_mock_devices(1);
        let mut handle = scanner.clone();
        assert_eq!(handle.scan().unwrap()[0].os_index, 0);
        scanner.set_devices(vec![DiscoveredDevice {
            unique_id: "MOCK0000".into(),
            os_index: 1,
        }]);
        assert_eq!(handle.scan().unwrap()[0].os_index, 1);
    }
}

//! Single-producer / multi-consumer frame ring over a named shared-memory
//! region.
//!
//! Region layout:
//!
//! ```text
//! [ global header (8 bytes) | slot 0 | slot 1 | ... | slot N-1 ]
//!
//! global header:  offset 0  u32 LE  write_index (last fully written slot)
//!                 offset 4  u32 LE  capacity
//!
//! slot:           offset 0  i64 LE  frame_id
//!                 offset 8  f64 LE  timestamp (seconds)
//!                 offset 16 f32 LE  math_salt
//!                 offset 20 u8      flags
//!                 offset 21 u16 LE  reserved
//!                 offset 23 u8      pad
//!                 offset 24 ..      H*W*C payload bytes, row-major
//! ```
//!
//! The writer fills the payload first, then the slot header, then publishes
//! the slot with a release store of `write_index`. Readers sample the index
//! with an acquire load, copy the slot, and re-read the header afterwards:
//! a header that changed under the copy marks a torn read to be retried.
//! Readers never block the writer.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::{Mmap, MmapMut};
use tracing::{debug, warn};

use velofit_types::{FrameFlags, FrameShape};

pub const GLOBAL_HEADER_SIZE: usize = 8;
pub const SLOT_HEADER_SIZE: usize = 24;

/// The only payload element type the ring carries.
pub const DTYPE_U8: &str = "uint8";

/// How many times a torn read is retried before giving up.
const TEAR_RETRIES: u32 = 4;

#[derive(thiserror::Error, Debug)]
pub enum RingError {
    #[error("failed to allocate ring \"{name}\": {source}")]
    Alloc {
        name: String,
        source: std::io::Error,
    },
    #[error("ring \"{0}\" not found")]
    NotFound(String),
    #[error("ring \"{0}\" is incompatible with the requested geometry")]
    Incompatible(String),
    #[error("unsupported dtype \"{0}\" (only {DTYPE_U8})")]
    UnsupportedDtype(String),
    #[error("payload is {got} bytes but the slot body holds {want}")]
    PayloadSize { got: usize, want: usize },
    #[error("ring \"{0}\" is attached read-only")]
    ReadOnly(String),
    #[error("read of ring \"{0}\" torn {TEAR_RETRIES} times in a row")]
    Torn(String),
}

pub type Result<T> = std::result::Result<T, RingError>;

/// Fixed-size metadata written in front of every frame payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotHeader {
    pub frame_id: i64,
    pub timestamp: f64,
    pub math_salt: f32,
    pub flags: FrameFlags,
}

impl SlotHeader {
    pub fn new(frame_id: i64, timestamp: f64, math_salt: f32, flags: FrameFlags) -> Self {
        SlotHeader {
            frame_id,
            timestamp,
            math_salt,
            flags,
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i64(&mut buf[0..8], self.frame_id);
        LittleEndian::write_f64(&mut buf[8..16], self.timestamp);
        LittleEndian::write_f32(&mut buf[16..20], self.math_salt);
        buf[20] = self.flags.bits();
        LittleEndian::write_u16(&mut buf[21..23], 0);
        buf[23] = 0;
    }

    fn decode(buf: &[u8]) -> SlotHeader {
        SlotHeader {
            frame_id: LittleEndian::read_i64(&buf[0..8]),
            timestamp: LittleEndian::read_f64(&buf[8..16]),
            math_salt: LittleEndian::read_f32(&buf[16..20]),
            flags: FrameFlags::from_bits_retain(buf[20]),
        }
    }

    /// Bit-exact equality, usable for tear detection (NaN-safe).
    fn same_bits(&self, other: &SlotHeader) -> bool {
        self.frame_id == other.frame_id
            && self.timestamp.to_bits() == other.timestamp.to_bits()
            && self.math_salt.to_bits() == other.math_salt.to_bits()
            && self.flags == other.flags
    }
}

enum Map {
    Writer(MmapMut),
    Reader(Mmap),
}

impl Map {
    fn as_slice(&self) -> &[u8] {
        match self {
            Map::Writer(m) => &m[..],
            Map::Reader(m) => &m[..],
        }
    }
}

/// One named ring. Created by the owning camera worker, attached read-only
/// by any number of consumers.
pub struct FrameRing {
    name: String,
    path: PathBuf,
    shape: FrameShape,
    capacity: u32,
    slot_size: usize,
    map: Map,
    is_owner: bool,
}

/// The directory that holds named regions on this host.
pub fn region_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("VELOFIT_SHM_DIR") {
        return PathBuf::from(dir);
    }
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Where a region called `name` lives on this host.
pub fn region_path(name: &str) -> PathBuf {
    region_dir().join(name)
}

/// Remove a named region without attaching to it. Used by the orchestrator
/// to clean up after a dead worker; a missing region is not an error.
pub fn unlink_by_name(name: &str) -> std::io::Result<()> {
    match std::fs::remove_file(region_path(name)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn slot_size_for(shape: FrameShape) -> usize {
    SLOT_HEADER_SIZE + shape.num_bytes()
}

pub fn region_size_for(shape: FrameShape, capacity: u32) -> usize {
    GLOBAL_HEADER_SIZE + slot_size_for(shape) * capacity as usize
}

impl FrameRing {
    /// Allocate a fresh region. A stale region with the same name is
    /// unlinked first.
    pub fn create(name: &str, shape: FrameShape, dtype: &str, capacity: u32) -> Result<Self> {
        if dtype != DTYPE_U8 {
            return Err(RingError::UnsupportedDtype(dtype.to_string()));
        }
        if capacity == 0 {
            return Err(RingError::Incompatible(name.to_string()));
        }
        let path = region_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => warn!("cleaned up stale ring region {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(RingError::Alloc {
                    name: name.to_string(),
                    source: e,
                })
            }
        }

        let total = region_size_for(shape, capacity);
        let alloc_err = |source| RingError::Alloc {
            name: name.to_string(),
            source,
        };
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(alloc_err)?;
        file.set_len(total as u64).map_err(alloc_err)?;
        // Safety: the region is a plain file we just created; all access
        // below stays within `total` bytes.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(alloc_err)?;

        LittleEndian::write_u32(&mut mmap[0..4], 0);
        LittleEndian::write_u32(&mut mmap[4..8], capacity);

        debug!(
            "ring {name} created: {}x{}x{}, {capacity} slots, {} bytes",
            shape.height, shape.width, shape.channels, total
        );
        Ok(FrameRing {
            name: name.to_string(),
            path,
            shape,
            capacity,
            slot_size: slot_size_for(shape),
            map: Map::Writer(mmap),
            is_owner: true,
        })
    }

    /// Open an existing region read-only. Capacity is discovered from the
    /// global header; the caller supplies the expected frame geometry.
    pub fn attach(name: &str, shape: FrameShape) -> Result<Self> {
        let path = region_path(name);
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RingError::NotFound(name.to_string()))
            }
            Err(source) => {
                return Err(RingError::Alloc {
                    name: name.to_string(),
                    source,
                })
            }
        };
        // Safety: read-only map of the backing file; the writer only ever
        // changes bytes, never the file length.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|source| RingError::Alloc {
            name: name.to_string(),
            source,
        })?;
        if mmap.len() < GLOBAL_HEADER_SIZE {
            return Err(RingError::Incompatible(name.to_string()));
        }
        let capacity = LittleEndian::read_u32(&mmap[4..8]);
        let slot_size = slot_size_for(shape);
        if capacity == 0
            || mmap.len() < GLOBAL_HEADER_SIZE + slot_size * capacity as usize
        {
            return Err(RingError::Incompatible(name.to_string()));
        }
        debug!("attached to ring {name} ({capacity} slots)");
        Ok(FrameRing {
            name: name.to_string(),
            path,
            shape,
            capacity,
            slot_size,
            map: Map::Reader(mmap),
            is_owner: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    fn index_atomic(&self) -> &AtomicU32 {
        // Safety: offset 0 of a page-aligned mapping is u32-aligned, lives
        // as long as `self`, and is only accessed atomically.
        unsafe { &*(self.map.as_slice().as_ptr() as *const AtomicU32) }
    }

    /// Index of the most recently published slot.
    pub fn write_index(&self) -> u32 {
        self.index_atomic().load(Ordering::Acquire)
    }

    fn slot_range(&self, index: u32) -> std::ops::Range<usize> {
        let start = GLOBAL_HEADER_SIZE + index as usize * self.slot_size;
        start..start + self.slot_size
    }

    /// Publish one frame into the next slot. Payload first, header second,
    /// index last; that order is what makes torn reads detectable.
    pub fn write(&mut self, header: SlotHeader, pixels: &[u8]) -> Result<()> {
        let want = self.shape.num_bytes();
        if pixels.len() != want {
            return Err(RingError::PayloadSize {
                got: pixels.len(),
                want,
            });
        }
        let next = (self.write_index() + 1) % self.capacity;
        let range = self.slot_range(next);
        let mmap = match &mut self.map {
            Map::Writer(m) => m,
            Map::Reader(_) => return Err(RingError::ReadOnly(self.name.clone())),
        };
        let slot = &mut mmap[range];
        slot[SLOT_HEADER_SIZE..].copy_from_slice(pixels);
        header.encode(&mut slot[..SLOT_HEADER_SIZE]);
        self.index_atomic().store(next, Ordering::Release);
        Ok(())
    }

    /// Borrow the most recently published slot.
    ///
    /// The view is advisory: the writer may overwrite it at any time.
    /// Callers that need a stable frame must use [`FrameRing::read_latest_copy`].
    pub fn read_latest(&self) -> (SlotHeader, &[u8]) {
        let idx = self.write_index();
        let slot = &self.map.as_slice()[self.slot_range(idx)];
        (
            SlotHeader::decode(&slot[..SLOT_HEADER_SIZE]),
            &slot[SLOT_HEADER_SIZE..],
        )
    }

    /// Copy the most recently published frame into `buf`, retrying when the
    /// writer lapped the reader mid-copy.
    pub fn read_latest_copy(&self, buf: &mut Vec<u8>) -> Result<SlotHeader> {
        for _ in 0..TEAR_RETRIES {
            let idx = self.write_index();
            let slot = &self.map.as_slice()[self.slot_range(idx)];
            let before = SlotHeader::decode(&slot[..SLOT_HEADER_SIZE]);
            buf.clear();
            buf.extend_from_slice(&slot[SLOT_HEADER_SIZE..]);
            let after = SlotHeader::decode(&slot[..SLOT_HEADER_SIZE]);
            if before.same_bits(&after) {
                return Ok(before);
            }
        }
        Err(RingError::Torn(self.name.clone()))
    }

    /// Remove the named region. Owner-only; attached readers keep their
    /// mapping until they drop it.
    pub fn unlink(&mut self) {
        if !self.is_owner {
            return;
        }
        self.is_owner = false;
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("ring {} unlinked", self.name),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to unlink ring {}: {e}", self.name),
        }
    }
}

impl Drop for FrameRing {
    fn drop(&mut self) {
        self.unlink();
    }
}

impl std::fmt::Debug for FrameRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRing")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("capacity", &self.capacity)
            .field("is_owner", &self.is_owner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_name(tag: &str) -> String {
        format!("velofit-test-{}-{}", std::process::id(), tag)
    }

    fn small_shape() -> FrameShape {
        FrameShape::new(4, 6, 3)
    }

    fn fill(shape: FrameShape, seed: u8) -> Vec<u8> {
        (0..shape.num_bytes())
            .map(|i| (i as u8).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn write_then_read_roundtrips_byte_for_byte() {
        let name = test_name("roundtrip");
        let mut ring = FrameRing::create(&name, small_shape(), DTYPE_U8, 3).unwrap();
        let pixels = fill(small_shape(), 7);
        let header = SlotHeader::new(42, 1.25, 0.5, FrameFlags::SYNC_FLASH);
        ring.write(header, &pixels).unwrap();

        let reader = FrameRing::attach(&name, small_shape()).unwrap();
        let (got, body) = reader.read_latest();
        assert_eq!(got, header);
        assert_eq!(body, &pixels[..]);

        let mut buf = Vec::new();
        let got2 = reader.read_latest_copy(&mut buf).unwrap();
        assert_eq!(got2, header);
        assert_eq!(buf, pixels);
    }

    #[test]
    fn capacity_one_still_functions() {
        let name = test_name("cap1");
        let mut ring = FrameRing::create(&name, small_shape(), DTYPE_U8, 1).unwrap();
        for fid in 0..5i64 {
            let header = SlotHeader::new(fid, fid as f64, 1.0, FrameFlags::empty());
            ring.write(header, &fill(small_shape(), fid as u8)).unwrap();
            let (got, body) = ring.read_latest();
            assert_eq!(got.frame_id, fid);
            assert_eq!(body, &fill(small_shape(), fid as u8)[..]);
        }
    }

    #[test]
    fn reader_discovers_capacity_from_global_header() {
        let name = test_name("capdiscover");
        let _ring = FrameRing::create(&name, small_shape(), DTYPE_U8, 7).unwrap();
        let reader = FrameRing::attach(&name, small_shape()).unwrap();
        assert_eq!(reader.capacity(), 7);
    }

    #[test]
    fn attach_missing_is_not_found() {
        match FrameRing::attach(&test_name("missing"), small_shape()) {
            Err(RingError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn attach_oversized_shape_is_incompatible() {
        let name = test_name("oversize");
        let _ring = FrameRing::create(&name, small_shape(), DTYPE_U8, 2).unwrap();
        match FrameRing::attach(&name, FrameShape::new(1200, 1920, 3)) {
            Err(RingError::Incompatible(_)) => {}
            other => panic!("expected Incompatible, got {other:?}"),
        }
    }

    #[test]
    fn create_over_stale_region_succeeds() {
        let name = test_name("stale");
        {
            let mut stale =
                FrameRing::create(&name, small_shape(), DTYPE_U8, 2).unwrap();
            // Simulate a crashed owner: forget to unlink.
            stale.is_owner = false;
        }
        let ring = FrameRing::create(&name, small_shape(), DTYPE_U8, 4).unwrap();
        assert_eq!(ring.capacity(), 4);
    }

    #[test]
    fn unsupported_dtype_rejected() {
        match FrameRing::create(&test_name("dtype"), small_shape(), "f32", 2) {
            Err(RingError::UnsupportedDtype(_)) => {}
            other => panic!("expected UnsupportedDtype, got {other:?}"),
        }
    }

    #[test]
    fn payload_size_mismatch_rejected() {
        let name = test_name("paysize");
        let mut ring = FrameRing::create(&name, small_shape(), DTYPE_U8, 2).unwrap();
        let short = vec![0u8; 3];
        match ring.write(
            SlotHeader::new(1, 0.0, 1.0, FrameFlags::empty()),
            &short,
        ) {
            Err(RingError::PayloadSize { got: 3, .. }) => {}
            other => panic!("expected PayloadSize, got {other:?}"),
        }
    }

    #[test]
    fn unlink_removes_the_region() {
        let name = test_name("unlink");
        let path = region_path(&name);
        let mut ring = FrameRing::create(&name, small_shape(), DTYPE_U8, 2).unwrap();
        assert!(path.exists());
        ring.unlink();
        assert!(!path.exists());
        // Second unlink is a no-op.
        ring.unlink();
    }

    #[test]
    fn reader_observes_nondecreasing_frame_ids() {
        let name = test_name("ordering");
        let shape = small_shape();
        let mut ring = FrameRing::create(&name, shape, DTYPE_U8, 3).unwrap();
        let reader = FrameRing::attach(&name, shape).unwrap();

        let writer = std::thread::spawn(move || {
            let pixels = fill(shape, 0);
            for fid in 1..=2000i64 {
                let header = SlotHeader::new(
                    fid,
                    fid as f64 * 0.01,
                    fid as f32,
                    FrameFlags::empty(),
                );
                ring.write(header, &pixels).unwrap();
            }
            ring
        });

        let mut last = 0i64;
        let mut buf = Vec::new();
        while last < 2000 {
            if let Ok(header) = reader.read_latest_copy(&mut buf) {
                assert!(
                    header.frame_id >= last,
                    "frame id regressed: {} after {}",
                    header.frame_id,
                    last
                );
                // salt mirrors the frame id, so a consistent pair proves
                // the header was not torn.
                if header.frame_id > 0 {
                    assert_eq!(header.math_salt, header.frame_id as f32);
                }
                last = header.frame_id;
            }
        }
        let _ring = writer.join().unwrap();
    }
}

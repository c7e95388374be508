//! Ring fan-out transport
//!
//! One writer, up to 16 readers, each with its own ring buffer preserving a
//! short history. A small control-channel region acts as a directory:
//! readers create their own ring region, register its name there, and the
//! writer discovers registrations at the start of every publish and pushes
//! each frame into every active reader's ring.
//!
//! Each ring has exactly one writer (the fan-out producer) and one reader
//! (its owner), so slot sequences are strictly monotonic and gap-free per
//! ring; across rings there is no ordering guarantee.

use crate::double_buffer::Frame;
use crate::error::{FramelinkError, Result};
use crate::platform::{self, CACHE_LINE_SIZE};
use crate::shm::{MapOptions, ShmRegion};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicI64, Ordering};
use std::time::Duration;

/// Control channel magic
pub const FANOUT_MAGIC: u32 = 0xD1EC7002;
/// Control channel version
pub const FANOUT_VERSION: u32 = 2;
/// Directory capacity
pub const MAX_READERS: usize = 16;
/// Ring size used when a registration leaves it unset
pub const DEFAULT_RING_SIZE: u32 = 30;

/// Fixed length of a registered ring-region name (NUL-terminated)
const NAME_LEN: usize = 64;

// Directory entry states. FREE -> CLAIMING is the serialized test-and-set;
// the entry's name and ring size are published strictly before the
// release store to ACTIVE, so a writer that observes ACTIVE can open the
// named region.
const ENTRY_FREE: u32 = 0;
const ENTRY_CLAIMING: u32 = 1;
const ENTRY_ACTIVE: u32 = 2;

/// Disambiguates several readers inside one process; the first keeps the
/// plain `<channel>_reader_<pid>` form.
static READER_SEQ: AtomicU32 = AtomicU32::new(0);

/// One directory entry in the control channel
#[repr(C)]
struct ReaderEntry {
    state: AtomicU32,
    ring_size: u32,
    name: [u8; NAME_LEN],
}

/// Control channel directory
#[repr(C, align(64))]
struct ControlHeader {
    magic: u32,
    version: u32,
    max_slot_size: u64,
    num_readers: AtomicU32,
    _pad: u32,
    writer_heartbeat_ns: AtomicI64,
    entries: [ReaderEntry; MAX_READERS],
}

const CONTROL_SIZE: usize = std::mem::size_of::<ControlHeader>();

/// Header of a per-reader ring region
#[repr(C, align(64))]
struct RingHeader {
    magic: u32,
    ring_size: u32,
    slot_data_size: u64,
    slot_total_size: u64,
    write_idx: AtomicU32,
    _pad: u32,
    total_writes: AtomicU64,
}

/// Per-slot metadata; the payload area follows immediately after
#[repr(C, align(64))]
struct RingSlot {
    sequence: AtomicU64,
    timestamp_ns: AtomicI64,
    data_size: AtomicU64,
    _pad: [u8; CACHE_LINE_SIZE - 24],
}

const RING_HEADER_SIZE: usize = std::mem::size_of::<RingHeader>();
const SLOT_HEADER_SIZE: usize = std::mem::size_of::<RingSlot>();
const _: () = assert!(RING_HEADER_SIZE == CACHE_LINE_SIZE);
const _: () = assert!(SLOT_HEADER_SIZE == CACHE_LINE_SIZE);

/// Slot stride: metadata line plus the payload area, kept cache-line
/// aligned so every slot's atomics stay aligned
fn slot_stride(capacity: usize) -> usize {
    SLOT_HEADER_SIZE + platform::align_to_cache_line(capacity)
}

/// A writer-side mapping of one reader's ring
struct RingMapping {
    region: ShmRegion,
    ring_size: u32,
    stride: usize,
}

impl RingMapping {
    #[inline(always)]
    fn header(&self) -> &RingHeader {
        // SAFETY: validated against RingHeader at attach time
        unsafe { &*(self.region.as_ptr() as *const RingHeader) }
    }

    #[inline(always)]
    fn slot_base(&self, idx: u32) -> *mut u8 {
        // SAFETY: idx < ring_size and the region size was validated to
        // cover ring_size slots at attach time
        unsafe {
            self.region
                .as_ptr()
                .add(RING_HEADER_SIZE + idx as usize * self.stride)
        }
    }

    /// Publish metadata for the slot at the current write index and
    /// advance the ring.
    ///
    /// `total_writes` is advanced with a load-then-store: correct only
    /// because exactly one writer ever touches a ring.
    fn publish_meta(&self, len: usize, timestamp_ns: i64) {
        let header = self.header();
        let idx = header.write_idx.load(Ordering::Relaxed);

        // SAFETY: slot_base(idx) points at a RingSlot within the mapping
        let slot = unsafe { &*(self.slot_base(idx) as *const RingSlot) };
        let seq = header.total_writes.load(Ordering::Relaxed) + 1;

        slot.data_size.store(len as u64, Ordering::Relaxed);
        slot.timestamp_ns.store(timestamp_ns, Ordering::Relaxed);
        slot.sequence.store(seq, Ordering::Release);

        header
            .write_idx
            .store((idx + 1) % self.ring_size, Ordering::Relaxed);
        header.total_writes.store(seq, Ordering::Release);
    }

    fn publish_copy(&self, data: &[u8], timestamp_ns: i64) {
        let idx = self.header().write_idx.load(Ordering::Relaxed);
        // SAFETY: the payload area of slot idx holds at least
        // slot_data_size bytes and data.len() was bounds-checked upstream
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.slot_base(idx).add(SLOT_HEADER_SIZE),
                data.len(),
            );
        }
        self.publish_meta(data.len(), timestamp_ns);
    }
}

enum DiscoverAction {
    Attach { name: [u8; NAME_LEN], ring_size: u32 },
    Detach,
    Keep,
}

/// Fan-out writer: owns the control channel and pushes every frame into
/// every registered reader's ring.
pub struct Writer {
    // Rings are declared first so they unmap before the control channel
    // is unlinked on drop.
    rings: [Option<RingMapping>; MAX_READERS],
    control: ShmRegion,
    capacity: usize,
}

impl Writer {
    /// Create the control channel for `channel_name` with the given
    /// per-slot payload capacity.
    pub fn new(channel_name: &str, capacity: usize) -> Result<Self> {
        let control = ShmRegion::create(channel_name, CONTROL_SIZE, MapOptions::default())?;

        let header = control.as_ptr() as *mut ControlHeader;
        // Region is zeroed: entries start FREE, reader count at 0
        unsafe {
            (*header).magic = FANOUT_MAGIC;
            (*header).version = FANOUT_VERSION;
            (*header).max_slot_size = capacity as u64;
            (*header)
                .writer_heartbeat_ns
                .store(platform::now_ns(), Ordering::Relaxed);
        }

        log::info!(
            "fan-out writer '{}' ready (capacity {})",
            channel_name,
            capacity
        );

        Ok(Self {
            rings: std::array::from_fn(|_| None),
            control,
            capacity,
        })
    }

    #[inline(always)]
    fn control_header(&self) -> &ControlHeader {
        // SAFETY: region holds the ControlHeader we initialized
        unsafe { &*(self.control.as_ptr() as *const ControlHeader) }
    }

    /// Reconcile local ring mappings with the directory.
    ///
    /// Newly active entries are opened and mapped; entries gone inactive
    /// are unmapped. Open or map failures skip the entry without error.
    fn discover(&mut self) {
        for i in 0..MAX_READERS {
            let action = {
                let entry = &self.control_header().entries[i];
                let active = entry.state.load(Ordering::Acquire) == ENTRY_ACTIVE;
                match (active, self.rings[i].is_some()) {
                    (true, false) => DiscoverAction::Attach {
                        name: entry.name,
                        ring_size: entry.ring_size,
                    },
                    (false, true) => DiscoverAction::Detach,
                    _ => DiscoverAction::Keep,
                }
            };

            match action {
                DiscoverAction::Attach { name, ring_size } => {
                    self.rings[i] = self.attach(&name, ring_size);
                }
                DiscoverAction::Detach => {
                    self.rings[i] = None;
                }
                DiscoverAction::Keep => {}
            }
        }
    }

    fn attach(&self, raw_name: &[u8; NAME_LEN], ring_size: u32) -> Option<RingMapping> {
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        if end == 0 {
            return None;
        }
        let name = std::str::from_utf8(&raw_name[..end]).ok()?;

        let region = ShmRegion::open(name).ok()?;
        let ring_size = if ring_size == 0 {
            DEFAULT_RING_SIZE
        } else {
            ring_size
        };

        if region.size() < RING_HEADER_SIZE {
            return None;
        }
        // SAFETY: region holds at least a RingHeader (checked above)
        let header = unsafe { &*(region.as_ptr() as *const RingHeader) };
        if header.magic != FANOUT_MAGIC || header.ring_size != ring_size {
            return None;
        }
        // The ring's slots must hold this channel's payloads
        if (header.slot_data_size as usize) < self.capacity {
            return None;
        }
        let stride = header.slot_total_size as usize;
        if stride < SLOT_HEADER_SIZE
            || region.size() < RING_HEADER_SIZE + ring_size as usize * stride
        {
            return None;
        }

        log::debug!("fan-out writer attached ring '{}' ({} slots)", name, ring_size);
        Some(RingMapping {
            region,
            ring_size,
            stride,
        })
    }

    /// Push one frame into every registered reader's ring.
    ///
    /// Returns the number of readers written to. Never blocks; readers
    /// that fall behind are simply overwritten.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if data.len() > self.capacity {
            return Err(FramelinkError::PayloadTooLarge {
                max: self.capacity,
                got: data.len(),
            });
        }

        self.discover();

        let timestamp_ns = platform::now_ns();
        let mut written = 0;
        for ring in self.rings.iter().flatten() {
            ring.publish_copy(data, timestamp_ns);
            written += 1;
        }

        self.control_header()
            .writer_heartbeat_ns
            .store(timestamp_ns, Ordering::Release);
        Ok(written)
    }

    /// Direct access to the current write slot of every registered ring,
    /// for in-place preparation. Call [`Writer::commit_slots`] afterwards.
    ///
    /// The returned slices are ordered by directory entry.
    pub fn write_slots(&mut self) -> Vec<&mut [u8]> {
        self.discover();

        let capacity = self.capacity;
        self.rings
            .iter()
            .flatten()
            .map(|ring| {
                let idx = ring.header().write_idx.load(Ordering::Relaxed);
                // SAFETY: slot payload areas of distinct rings are disjoint
                // and hold at least capacity bytes each
                unsafe {
                    std::slice::from_raw_parts_mut(
                        ring.slot_base(idx).add(SLOT_HEADER_SIZE),
                        capacity,
                    )
                }
            })
            .collect()
    }

    /// Publish `len` bytes previously written into every slot returned by
    /// [`Writer::write_slots`]. Returns the number of readers committed.
    pub fn commit_slots(&mut self, len: usize) -> Result<usize> {
        if len > self.capacity {
            return Err(FramelinkError::PayloadTooLarge {
                max: self.capacity,
                got: len,
            });
        }

        let timestamp_ns = platform::now_ns();
        let mut committed = 0;
        for ring in self.rings.iter().flatten() {
            ring.publish_meta(len, timestamp_ns);
            committed += 1;
        }

        self.control_header()
            .writer_heartbeat_ns
            .store(timestamp_ns, Ordering::Release);
        Ok(committed)
    }

    /// Number of currently registered readers
    pub fn reader_count(&self) -> u32 {
        self.control_header().num_readers.load(Ordering::Relaxed)
    }

    /// Declared per-slot payload capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Control channel name
    pub fn channel_name(&self) -> &str {
        self.control.name()
    }
}

/// Fan-out reader: owns one ring region and registers it with the
/// channel's directory so the writer pushes frames into it.
pub struct Reader {
    ring: ShmRegion,
    control: ShmRegion,
    entry_idx: usize,
    ring_size: u32,
    capacity: usize,
    stride: usize,
}

impl Reader {
    /// Register with `channel_name` using the default ring size (30 slots)
    pub fn new(channel_name: &str, capacity: usize) -> Result<Self> {
        Self::with_ring_size(channel_name, capacity, DEFAULT_RING_SIZE)
    }

    /// Register with `channel_name`, keeping a history of `ring_size`
    /// frames.
    pub fn with_ring_size(channel_name: &str, capacity: usize, ring_size: u32) -> Result<Self> {
        let control = ShmRegion::open(channel_name)?;
        if control.size() < CONTROL_SIZE {
            return Err(FramelinkError::ShmOpen {
                name: channel_name.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidData, "control channel too small"),
            });
        }

        // SAFETY: region holds at least a ControlHeader (checked above)
        let header = unsafe { &*(control.as_ptr() as *const ControlHeader) };
        if header.magic != FANOUT_MAGIC {
            return Err(FramelinkError::InvalidMagic {
                expected: FANOUT_MAGIC,
                got: header.magic,
            });
        }
        if header.version != FANOUT_VERSION {
            return Err(FramelinkError::UnsupportedVersion {
                expected: FANOUT_VERSION,
                got: header.version,
            });
        }

        let declared = header.max_slot_size as usize;
        if declared != capacity {
            return Err(FramelinkError::CapacityMismatch {
                expected: declared,
                got: capacity,
            });
        }

        // Deterministic ring name; a process-local counter keeps several
        // readers in one process from colliding
        let pid = std::process::id();
        let n = READER_SEQ.fetch_add(1, Ordering::Relaxed);
        let ring_name = if n == 0 {
            format!("{}_reader_{}", channel_name, pid)
        } else {
            format!("{}_reader_{}_{}", channel_name, pid, n)
        };
        if ring_name.len() >= NAME_LEN {
            return Err(FramelinkError::NameTooLong {
                max: NAME_LEN - 1,
                got: ring_name.len(),
            });
        }

        let stride = slot_stride(capacity);
        let ring_bytes = RING_HEADER_SIZE + ring_size as usize * stride;
        let ring = ShmRegion::create(
            &ring_name,
            ring_bytes,
            MapOptions {
                huge_pages: false,
                populate: true,
                lock: true,
            },
        )?;

        // Region is zeroed: write_idx, total_writes and every slot
        // sequence start at 0
        let ring_header = ring.as_ptr() as *mut RingHeader;
        unsafe {
            (*ring_header).magic = FANOUT_MAGIC;
            (*ring_header).ring_size = ring_size;
            (*ring_header).slot_data_size = capacity as u64;
            (*ring_header).slot_total_size = stride as u64;
        }

        // Claim a directory entry: the CAS serializes claims, the entry is
        // filled while in CLAIMING, and the release store to ACTIVE is the
        // commit point the writer synchronizes with
        let mut entry_idx = None;
        for i in 0..MAX_READERS {
            if header.entries[i]
                .state
                .compare_exchange(
                    ENTRY_FREE,
                    ENTRY_CLAIMING,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                entry_idx = Some(i);
                break;
            }
        }
        let Some(entry_idx) = entry_idx else {
            // ring and control drop here, unlinking the ring region
            return Err(FramelinkError::DirectoryFull);
        };

        let control_ptr = control.as_ptr() as *mut ControlHeader;
        // SAFETY: the entry is ours while in CLAIMING; the writer reads
        // name and ring_size only after observing ACTIVE
        unsafe {
            let entry = std::ptr::addr_of_mut!((*control_ptr).entries[entry_idx]);
            (*entry).name = [0; NAME_LEN];
            (&mut (*entry).name)[..ring_name.len()].copy_from_slice(ring_name.as_bytes());
            (*entry).ring_size = ring_size;
            (*entry).state.store(ENTRY_ACTIVE, Ordering::Release);
        }
        header.num_readers.fetch_add(1, Ordering::Relaxed);

        log::info!(
            "fan-out reader '{}' registered on '{}' (entry {}, ring {} x {})",
            ring_name,
            channel_name,
            entry_idx,
            ring_size,
            capacity
        );

        Ok(Self {
            ring,
            control,
            entry_idx,
            ring_size,
            capacity,
            stride,
        })
    }

    #[inline(always)]
    fn control_header(&self) -> &ControlHeader {
        // SAFETY: validated during construction
        unsafe { &*(self.control.as_ptr() as *const ControlHeader) }
    }

    #[inline(always)]
    fn ring_header(&self) -> &RingHeader {
        // SAFETY: we created and initialized this region
        unsafe { &*(self.ring.as_ptr() as *const RingHeader) }
    }

    #[inline(always)]
    fn slot_meta(&self, idx: u32) -> &RingSlot {
        // SAFETY: callers check idx < ring_size; region covers all slots
        unsafe {
            &*(self
                .ring
                .as_ptr()
                .add(RING_HEADER_SIZE + idx as usize * self.stride) as *const RingSlot)
        }
    }

    #[inline(always)]
    fn payload_ptr(&self, idx: u32) -> *const u8 {
        // SAFETY: as in slot_meta
        unsafe {
            self.ring
                .as_ptr()
                .add(RING_HEADER_SIZE + idx as usize * self.stride + SLOT_HEADER_SIZE)
                .cast_const()
        }
    }

    /// Zero-copy view of the most recently written slot.
    ///
    /// Returns `None` before the first write. Repeated calls without an
    /// intervening publish return the same slot.
    pub fn latest(&self) -> Option<Frame<'_>> {
        let header = self.ring_header();
        let total = header.total_writes.load(Ordering::Acquire);
        if total == 0 {
            return None;
        }

        let write_idx = header.write_idx.load(Ordering::Relaxed);
        let latest_idx = (write_idx + self.ring_size - 1) % self.ring_size;

        let slot = self.slot_meta(latest_idx);
        let len = slot.data_size.load(Ordering::Relaxed) as usize;
        let sequence = slot.sequence.load(Ordering::Relaxed);
        let timestamp_ns = slot.timestamp_ns.load(Ordering::Relaxed);

        // SAFETY: len <= capacity was enforced by the writer
        let payload = unsafe { std::slice::from_raw_parts(self.payload_ptr(latest_idx), len) };
        Some(Frame {
            payload,
            sequence,
            timestamp_ns,
        })
    }

    /// Zero-copy view of a specific slot.
    ///
    /// Returns `None` for out-of-range indices and slots never written
    /// (sequence 0).
    pub fn slot(&self, idx: u32) -> Option<Frame<'_>> {
        if idx >= self.ring_size {
            return None;
        }

        let slot = self.slot_meta(idx);
        let sequence = slot.sequence.load(Ordering::Acquire);
        if sequence == 0 {
            return None;
        }

        let len = slot.data_size.load(Ordering::Relaxed) as usize;
        let timestamp_ns = slot.timestamp_ns.load(Ordering::Relaxed);
        // SAFETY: len <= capacity was enforced by the writer
        let payload = unsafe { std::slice::from_raw_parts(self.payload_ptr(idx), len) };
        Some(Frame {
            payload,
            sequence,
            timestamp_ns,
        })
    }

    /// Total frames the writer has pushed into this ring
    pub fn total_writes(&self) -> u64 {
        self.ring_header().total_writes.load(Ordering::Acquire)
    }

    /// Next slot the writer will fill
    pub fn write_index(&self) -> u32 {
        self.ring_header().write_idx.load(Ordering::Relaxed)
    }

    /// Sequence number of a slot (0 when out of range or never written)
    pub fn slot_sequence(&self, idx: u32) -> u64 {
        if idx >= self.ring_size {
            return 0;
        }
        self.slot_meta(idx).sequence.load(Ordering::Acquire)
    }

    /// Timestamp of a slot (0 when out of range or never written)
    pub fn slot_timestamp_ns(&self, idx: u32) -> i64 {
        if idx >= self.ring_size {
            return 0;
        }
        self.slot_meta(idx).timestamp_ns.load(Ordering::Relaxed)
    }

    /// Timestamp of the most recently written slot
    pub fn latest_timestamp_ns(&self) -> i64 {
        let write_idx = self.ring_header().write_idx.load(Ordering::Relaxed);
        let latest_idx = (write_idx + self.ring_size - 1) % self.ring_size;
        self.slot_timestamp_ns(latest_idx)
    }

    /// Whether the writer's heartbeat is younger than `timeout`
    pub fn is_writer_alive(&self, timeout: Duration) -> bool {
        let heartbeat = self
            .control_header()
            .writer_heartbeat_ns
            .load(Ordering::Relaxed);
        let age_ms = (platform::now_ns() - heartbeat) / 1_000_000;
        age_ms < timeout.as_millis() as i64
    }

    /// Number of slots in this reader's ring
    pub fn ring_size(&self) -> u32 {
        self.ring_size
    }

    /// Per-slot payload capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Name of this reader's ring region
    pub fn ring_name(&self) -> &str {
        self.ring.name()
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        // Clear the directory entry before the ring region goes away so
        // the writer stops publishing into it
        let header = self.control_header();
        header.entries[self.entry_idx]
            .state
            .store(ENTRY_FREE, Ordering::Release);
        header.num_readers.fetch_sub(1, Ordering::Relaxed);
        // Field drops then unmap and unlink the ring, and unmap the
        // control channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(prefix: &str) -> String {
        format!(
            "/{}_{}_{}",
            prefix,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        )
    }

    fn payload_with_seq(seq: u64, size: usize) -> Vec<u8> {
        let mut data = vec![0u8; size];
        data[..8].copy_from_slice(&seq.to_le_bytes());
        data
    }

    #[test]
    fn writer_starts_with_no_readers() {
        let channel = unique_name("fl_fo_empty");
        let mut writer = Writer::new(&channel, 1024).unwrap();
        assert_eq!(writer.reader_count(), 0);
        // Publishing into the void succeeds and reaches nobody
        assert_eq!(writer.write(b"frame").unwrap(), 0);
    }

    #[test]
    fn fan_out_to_three_readers() {
        let channel = unique_name("fl_fo_three");
        let mut writer = Writer::new(&channel, 1024).unwrap();

        let readers: Vec<Reader> = (0..3).map(|_| Reader::new(&channel, 1024).unwrap()).collect();
        assert_eq!(writer.reader_count(), 3);

        for app_seq in 0u64..100 {
            let written = writer.write(&payload_with_seq(app_seq, 1024)).unwrap();
            assert_eq!(written, 3);
        }

        for reader in &readers {
            assert_eq!(reader.total_writes(), 100);
            let frame = reader.latest().unwrap();
            assert_eq!(&frame.payload[..8], &99u64.to_le_bytes());
            assert_eq!(frame.sequence, 100);
            // 100 writes into a 30-slot ring: write index wrapped to 10,
            // the latest slot is 9 and carries sequence 100
            assert_eq!(reader.write_index(), 100 % 30);
            assert_eq!(reader.slot_sequence(9), 100);
        }
    }

    #[test]
    fn ring_wrap_layout() {
        let channel = unique_name("fl_fo_wrap");
        let mut writer = Writer::new(&channel, 64).unwrap();
        let reader = Reader::with_ring_size(&channel, 64, 5).unwrap();

        // N + k publishes with N = 5, k = 2
        for app_seq in 0u64..7 {
            writer.write(&payload_with_seq(app_seq, 64)).unwrap();
        }

        // Slots 0..k hold sequences N+1..N+k, slots k..N hold k+1..N
        assert_eq!(reader.slot_sequence(0), 6);
        assert_eq!(reader.slot_sequence(1), 7);
        assert_eq!(reader.slot_sequence(2), 3);
        assert_eq!(reader.slot_sequence(3), 4);
        assert_eq!(reader.slot_sequence(4), 5);
        assert_eq!(reader.total_writes(), 7);
        assert_eq!(reader.write_index(), 2);
        assert_eq!(reader.latest().unwrap().sequence, 7);
    }

    #[test]
    fn latest_and_slots_before_first_write() {
        let channel = unique_name("fl_fo_fresh");
        let _writer = Writer::new(&channel, 128).unwrap();
        let reader = Reader::new(&channel, 128).unwrap();

        assert!(reader.latest().is_none());
        assert_eq!(reader.total_writes(), 0);
        for idx in 0..reader.ring_size() {
            assert!(reader.slot(idx).is_none());
            assert_eq!(reader.slot_sequence(idx), 0);
        }
        assert!(reader.slot(reader.ring_size()).is_none());
    }

    #[test]
    fn repeated_latest_returns_same_slot() {
        let channel = unique_name("fl_fo_same");
        let mut writer = Writer::new(&channel, 64).unwrap();
        let reader = Reader::new(&channel, 64).unwrap();

        writer.write(b"only frame").unwrap();

        let first = reader.latest().unwrap();
        let second = reader.latest().unwrap();
        assert_eq!(first.sequence, second.sequence);
        assert_eq!(first.payload.as_ptr(), second.payload.as_ptr());
    }

    #[test]
    fn departed_reader_is_detached_without_error() {
        let channel = unique_name("fl_fo_depart");
        let mut writer = Writer::new(&channel, 256).unwrap();

        let keeper = Reader::new(&channel, 256).unwrap();
        let departer = Reader::new(&channel, 256).unwrap();
        assert_eq!(writer.write(b"both").unwrap(), 2);

        drop(departer);
        assert_eq!(writer.reader_count(), 1);
        assert_eq!(writer.write(b"one left").unwrap(), 1);
        assert_eq!(keeper.total_writes(), 2);
    }

    #[test]
    fn directory_fills_and_reclaims() {
        let channel = unique_name("fl_fo_full");
        let _writer = Writer::new(&channel, 64).unwrap();

        let mut readers: Vec<Reader> = (0..MAX_READERS)
            .map(|_| Reader::with_ring_size(&channel, 64, 4).unwrap())
            .collect();

        assert!(matches!(
            Reader::with_ring_size(&channel, 64, 4),
            Err(FramelinkError::DirectoryFull)
        ));

        readers.pop();
        let replacement = Reader::with_ring_size(&channel, 64, 4).unwrap();
        drop(replacement);
        drop(readers);
    }

    #[test]
    fn write_slots_and_commit() {
        let channel = unique_name("fl_fo_slots");
        let mut writer = Writer::new(&channel, 128).unwrap();
        let reader_a = Reader::new(&channel, 128).unwrap();
        let reader_b = Reader::new(&channel, 128).unwrap();

        {
            let slots = writer.write_slots();
            assert_eq!(slots.len(), 2);
            for slot in slots {
                slot[..9].copy_from_slice(b"in place!");
            }
        }
        assert_eq!(writer.commit_slots(9).unwrap(), 2);

        for reader in [&reader_a, &reader_b] {
            let frame = reader.latest().unwrap();
            assert_eq!(frame.payload, b"in place!");
            assert_eq!(frame.sequence, 1);
        }
    }

    #[test]
    fn payload_bounds() {
        let channel = unique_name("fl_fo_bounds");
        let mut writer = Writer::new(&channel, 100).unwrap();
        let reader = Reader::new(&channel, 100).unwrap();

        // Zero-length frames still publish a fresh sequence
        writer.write(&[]).unwrap();
        let frame = reader.latest().unwrap();
        assert_eq!(frame.payload.len(), 0);
        assert_eq!(frame.sequence, 1);

        assert!(writer.write(&[1u8; 100]).is_ok());
        assert!(matches!(
            writer.write(&[1u8; 101]),
            Err(FramelinkError::PayloadTooLarge { max: 100, got: 101 })
        ));
        assert!(matches!(
            writer.commit_slots(101),
            Err(FramelinkError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn capacity_mismatch_rejected() {
        let channel = unique_name("fl_fo_capmis");
        let _writer = Writer::new(&channel, 512).unwrap();

        assert!(matches!(
            Reader::new(&channel, 1024),
            Err(FramelinkError::CapacityMismatch {
                expected: 512,
                got: 1024,
            })
        ));
    }

    #[test]
    fn magic_validated() {
        let channel = unique_name("fl_fo_magic");
        // A region that is not a fan-out control channel
        let _other = crate::double_buffer::Writer::basic(&channel, 4096, false).unwrap();

        assert!(matches!(
            Reader::new(&channel, 4096),
            Err(FramelinkError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn reader_fails_without_channel() {
        let channel = unique_name("fl_fo_orphan");
        assert!(matches!(
            Reader::new(&channel, 64),
            Err(FramelinkError::ShmOpen { .. })
        ));
    }

    #[test]
    fn heartbeat_liveness() {
        let channel = unique_name("fl_fo_alive");
        let mut writer = Writer::new(&channel, 64).unwrap();
        let reader = Reader::new(&channel, 64).unwrap();

        writer.write(b"hb").unwrap();
        assert!(reader.is_writer_alive(Duration::from_secs(10)));
        assert!(!reader.is_writer_alive(Duration::ZERO));
    }

    #[test]
    fn timestamps_recorded_per_slot() {
        let channel = unique_name("fl_fo_ts");
        let mut writer = Writer::new(&channel, 64).unwrap();
        let reader = Reader::with_ring_size(&channel, 64, 4).unwrap();

        writer.write(b"a").unwrap();
        writer.write(b"b").unwrap();

        assert!(reader.slot_timestamp_ns(0) > 0);
        assert!(reader.slot_timestamp_ns(1) >= reader.slot_timestamp_ns(0));
        assert_eq!(reader.slot_timestamp_ns(2), 0);
        assert_eq!(reader.latest_timestamp_ns(), reader.slot_timestamp_ns(1));
    }
}

//! Double-buffered latest-value transport
//!
//! A fixed two-slot channel in one shared-memory region: a header plus two
//! equally sized payload slots. The writer always fills the slot that is
//! not currently published (the back slot) and flips an atomic front index
//! with release semantics; a reader that observes the new index with an
//! acquire load sees the complete payload and metadata. The writer never
//! waits, the reader always sees the most recent publish, and anything in
//! between is dropped.
//!
//! Two performance tiers share this contract:
//! - [`Tier::Basic`] - portable mapping, ordinary copies
//! - [`Tier::CacheTuned`] - huge-page backing, page locking, software
//!   prefetch and non-temporal streaming stores for large payloads
//!
//! The tier is fixed at construction; the hot path branches on it inline.

use crate::error::{FramelinkError, Result};
use crate::platform::{self, CacheInfo, TuningConfig, CACHE_LINE_SIZE, HUGE_PAGE_SIZE};
use crate::shm::{MapOptions, ShmRegion};
use std::io;
use std::sync::atomic::{fence, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Magic for the basic tier ("SHM2")
pub const BASIC_MAGIC: u32 = 0x53484D32;
/// Version for the basic tier
pub const BASIC_VERSION: u32 = 0x0002_0000;
/// Magic for the cache-tuned tier ("CASR")
pub const CACHE_TUNED_MAGIC: u32 = 0x43415352;
/// Version for the cache-tuned tier
pub const CACHE_TUNED_VERSION: u32 = 0x0001_0000;

/// Header flag bit: region is huge-page backed
const FLAG_HUGE_PAGES: u32 = 0x1;

/// Payloads at or above this size use non-temporal stores in the
/// cache-tuned tier
const NON_TEMPORAL_THRESHOLD: usize = 4096;

/// Default writer-liveness threshold
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(1);

/// Performance tier of a double-buffer channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    /// Portable mapping, ordinary copies
    Basic,
    /// Huge pages, page locking, prefetch, non-temporal stores
    CacheTuned,
}

impl Tier {
    fn magic(self) -> u32 {
        match self {
            Tier::Basic => BASIC_MAGIC,
            Tier::CacheTuned => CACHE_TUNED_MAGIC,
        }
    }

    fn version(self) -> u32 {
        match self {
            Tier::Basic => BASIC_VERSION,
            Tier::CacheTuned => CACHE_TUNED_VERSION,
        }
    }
}

/// Per-slot metadata, one cache line each.
///
/// The writer publishes these with relaxed stores; visibility is provided
/// by the release store of the front index.
#[repr(C, align(64))]
struct SlotMeta {
    seq: AtomicU64,
    timestamp_ns: AtomicI64,
    len: AtomicU64,
    _pad: [u8; CACHE_LINE_SIZE - 24],
}

/// Region header: five independent 64-byte cache lines so the hot front
/// index, the per-slot metadata and the heartbeat never false-share.
#[repr(C, align(64))]
struct Header {
    // Cache line 0: static metadata, written once at initialize
    magic: u32,
    version: u32,
    capacity: u64,
    slot_offset: u64,
    flags: u32,
    _reserved: u32,
    _pad0: [u8; CACHE_LINE_SIZE - 32],

    // Cache line 1: front index, written by the writer on every publish
    front_idx: AtomicU32,
    _pad1: [u8; CACHE_LINE_SIZE - 4],

    // Cache lines 2-3: slot metadata
    slots: [SlotMeta; 2],

    // Cache line 4: writer state
    heartbeat_ns: AtomicI64,
    total_writes: AtomicU64,
    total_bytes: AtomicU64,
    _pad4: [u8; CACHE_LINE_SIZE - 24],
}

const HEADER_SIZE: usize = std::mem::size_of::<Header>();
const _: () = assert!(HEADER_SIZE == 5 * CACHE_LINE_SIZE);
const _: () = assert!(std::mem::size_of::<SlotMeta>() == CACHE_LINE_SIZE);

/// Runtime statistics for a double-buffer endpoint
#[derive(Clone, Debug)]
pub struct TransportStats {
    /// Region is huge-page backed
    pub huge_pages_active: bool,
    /// Software prefetching enabled
    pub prefetch_active: bool,
    /// Core the endpoint pinned itself to, if any
    pub pinned_cpu: Option<usize>,
    /// Cache hierarchy detected at construction
    pub cache_info: CacheInfo,
    /// Total successful publishes
    pub total_writes: u64,
    /// Total payload bytes published
    pub total_bytes: u64,
}

/// A frame observed in the shared region.
///
/// The payload borrows the reader (or ring) exclusively, so it is valid
/// only until the next call on that endpoint.
#[derive(Debug)]
pub struct Frame<'a> {
    /// Payload bytes, directly in shared memory
    pub payload: &'a [u8],
    /// Monotonic sequence number assigned by the writer (first publish = 1)
    pub sequence: u64,
    /// Writer-side timestamp in nanoseconds
    pub timestamp_ns: i64,
}

/// Metadata of a frame copied out by [`Reader::read_into`]
#[derive(Clone, Copy, Debug)]
pub struct FrameInfo {
    /// Payload length in bytes
    pub len: usize,
    /// Monotonic sequence number
    pub sequence: u64,
    /// Writer-side timestamp in nanoseconds
    pub timestamp_ns: i64,
}

fn resolve_prefetch_distance(config: &mut TuningConfig, cache: &CacheInfo) {
    if config.prefetch_distance == 0 {
        config.prefetch_distance = cache.optimal_prefetch_distance();
    }
}

/// Copy bypassing the cache with SSE2 streaming stores.
///
/// `dst` must be 16-byte aligned (slots are cache-line aligned). The
/// trailing `sfence` makes the streamed stores visible before the front
/// index is flipped.
#[cfg(target_arch = "x86_64")]
unsafe fn non_temporal_copy(dst: *mut u8, src: *const u8, len: usize) {
    use std::arch::x86_64::{__m128i, _mm_loadu_si128, _mm_sfence, _mm_stream_si128};

    let chunks = len / 16;
    let d = dst as *mut __m128i;
    let s = src as *const __m128i;
    for i in 0..chunks {
        _mm_stream_si128(d.add(i), _mm_loadu_si128(s.add(i)));
    }

    let remainder = len % 16;
    if remainder > 0 {
        std::ptr::copy_nonoverlapping(src.add(chunks * 16), dst.add(chunks * 16), remainder);
    }

    _mm_sfence();
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn non_temporal_copy(dst: *mut u8, src: *const u8, len: usize) {
    std::ptr::copy_nonoverlapping(src, dst, len);
}

/// Writer (producer) side of a double-buffer channel.
///
/// Creates and owns the shared region; the region is unlinked on drop.
pub struct Writer {
    region: ShmRegion,
    tier: Tier,
    config: TuningConfig,
    capacity: usize,
    slot_stride: usize,
    frame_count: u64,
    cache_info: CacheInfo,
}

impl Writer {
    /// Create a basic-tier channel.
    ///
    /// `use_huge_pages` requests a 2 MiB huge-page backing when the region
    /// is at least one huge page; the attempt falls back transparently.
    pub fn basic(name: &str, max_size: usize, use_huge_pages: bool) -> Result<Self> {
        let mut config = TuningConfig::portable();
        config.use_huge_pages = use_huge_pages;
        config.enable_prefetch = false;
        Self::with_tier(name, max_size, Tier::Basic, config)
    }

    /// Create a cache-tuned channel with the given tuning configuration
    pub fn cache_tuned(name: &str, max_size: usize, config: TuningConfig) -> Result<Self> {
        Self::with_tier(name, max_size, Tier::CacheTuned, config)
    }

    fn with_tier(name: &str, max_size: usize, tier: Tier, mut config: TuningConfig) -> Result<Self> {
        let cache_info = platform::detect_cache_info();
        resolve_prefetch_distance(&mut config, &cache_info);

        if let Some(cpu) = config.cpu_affinity {
            platform::set_cpu_affinity(cpu);
        }

        let slot_stride = platform::align_to_cache_line(max_size);
        let mut total_size = HEADER_SIZE + 2 * slot_stride;

        let attempt_huge = match tier {
            Tier::Basic => config.use_huge_pages && total_size >= HUGE_PAGE_SIZE,
            Tier::CacheTuned => config.use_huge_pages && platform::should_use_huge_pages(total_size),
        };
        if attempt_huge {
            total_size = platform::align_to_huge_page(total_size);
        }

        let region = ShmRegion::create(
            name,
            total_size,
            MapOptions {
                huge_pages: attempt_huge,
                populate: true,
                lock: true,
            },
        )?;

        let header = region.as_ptr() as *mut Header;
        // Region is freshly created and zeroed; fill in the static line,
        // then publish everything with a release fence.
        unsafe {
            (*header).magic = tier.magic();
            (*header).version = tier.version();
            (*header).capacity = max_size as u64;
            (*header).slot_offset = HEADER_SIZE as u64;
            (*header).flags = if region.is_huge_page_backed() {
                FLAG_HUGE_PAGES
            } else {
                0
            };
            (*header)
                .heartbeat_ns
                .store(platform::now_ns(), Ordering::Relaxed);
        }

        let writer = Self {
            region,
            tier,
            config,
            capacity: max_size,
            slot_stride,
            frame_count: 0,
            cache_info,
        };

        if tier == Tier::CacheTuned && writer.config.enable_prefetch {
            let span = writer.capacity.min(writer.config.prefetch_distance);
            platform::prefetch_range(writer.slot_ptr(0), span);
            platform::prefetch_range(writer.slot_ptr(1), span);
        }

        fence(Ordering::Release);

        log::info!(
            "double-buffer writer '{}' ready (capacity {}, tier {:?}, huge_pages={})",
            name,
            max_size,
            tier,
            writer.region.is_huge_page_backed()
        );

        Ok(writer)
    }

    #[inline(always)]
    fn header(&self) -> &Header {
        // SAFETY: the region starts with a Header we initialized; the
        // mapping is page-aligned, which satisfies the 64-byte alignment.
        unsafe { &*(self.region.as_ptr() as *const Header) }
    }

    #[inline(always)]
    fn slot_ptr(&self, idx: u32) -> *mut u8 {
        // SAFETY: idx is 0 or 1 and the region was sized for two slots
        unsafe {
            self.region
                .as_ptr()
                .add(HEADER_SIZE + idx as usize * self.slot_stride)
        }
    }

    /// Publish a payload ("shoot and forget").
    ///
    /// Copies into the back slot, stamps the slot metadata and flips the
    /// front index with release semantics. Never blocks. In the
    /// cache-tuned tier payloads of 4 KiB and above stream past the cache.
    #[inline]
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.capacity {
            return Err(FramelinkError::PayloadTooLarge {
                max: self.capacity,
                got: data.len(),
            });
        }

        let front = self.header().front_idx.load(Ordering::Acquire);
        let back = 1 - front;

        let dst = self.slot_ptr(back);
        // SAFETY: back slot is never the published slot, so no reader
        // dereferences it while we copy; dst has capacity bytes
        unsafe {
            if self.tier == Tier::CacheTuned && data.len() >= NON_TEMPORAL_THRESHOLD {
                non_temporal_copy(dst, data.as_ptr(), data.len());
            } else {
                std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
            }
        }

        self.publish(back, data.len());
        Ok(())
    }

    /// Fill the back slot in place through a closure, then publish.
    ///
    /// The closure receives the full back slot; `len` bytes of it are
    /// published.
    pub fn write_with<F>(&mut self, len: usize, fill: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        if len > self.capacity {
            return Err(FramelinkError::PayloadTooLarge {
                max: self.capacity,
                got: len,
            });
        }

        let front = self.header().front_idx.load(Ordering::Acquire);
        let back = 1 - front;

        // SAFETY: exclusive access to the back slot, capacity bytes long
        let slot = unsafe { std::slice::from_raw_parts_mut(self.slot_ptr(back), self.capacity) };
        fill(slot);

        self.publish(back, len);
        Ok(())
    }

    /// Direct access to the back slot for in-place preparation.
    ///
    /// Call [`Writer::commit`] afterwards to publish.
    pub fn write_buffer(&mut self) -> &mut [u8] {
        let front = self.header().front_idx.load(Ordering::Acquire);
        let back = 1 - front;
        // SAFETY: exclusive access to the back slot, capacity bytes long
        unsafe { std::slice::from_raw_parts_mut(self.slot_ptr(back), self.capacity) }
    }

    /// Publish `len` bytes previously written via [`Writer::write_buffer`]
    pub fn commit(&mut self, len: usize) -> Result<()> {
        if len > self.capacity {
            return Err(FramelinkError::PayloadTooLarge {
                max: self.capacity,
                got: len,
            });
        }

        let front = self.header().front_idx.load(Ordering::Acquire);
        let back = 1 - front;
        self.publish(back, len);
        Ok(())
    }

    /// Stamp the back slot's metadata and flip the front index.
    ///
    /// The release store of `front_idx` is the single publish point: all
    /// payload bytes and metadata stored before it are visible to a reader
    /// that observes the new index.
    fn publish(&mut self, back: u32, len: usize) {
        let now = platform::now_ns();
        self.frame_count += 1;
        let seq = self.frame_count;

        let header = self.header();
        let meta = &header.slots[back as usize];
        meta.len.store(len as u64, Ordering::Relaxed);
        meta.timestamp_ns.store(now, Ordering::Relaxed);
        meta.seq.store(seq, Ordering::Relaxed);

        header.heartbeat_ns.store(now, Ordering::Relaxed);
        header.total_writes.fetch_add(1, Ordering::Relaxed);
        header.total_bytes.fetch_add(len as u64, Ordering::Relaxed);

        header.front_idx.store(back, Ordering::Release);
    }

    /// Number of frames published by this writer
    #[inline]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Declared payload capacity
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Region name
    pub fn name(&self) -> &str {
        self.region.name()
    }

    /// Whether the region ended up huge-page backed
    pub fn is_huge_page_backed(&self) -> bool {
        self.region.is_huge_page_backed()
    }

    /// Performance tier of this channel
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Runtime statistics
    pub fn stats(&self) -> TransportStats {
        let header = self.header();
        TransportStats {
            huge_pages_active: self.region.is_huge_page_backed(),
            prefetch_active: self.config.enable_prefetch,
            pinned_cpu: self.config.cpu_affinity,
            cache_info: self.cache_info,
            total_writes: header.total_writes.load(Ordering::Relaxed),
            total_bytes: header.total_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Reader (consumer) side of a double-buffer channel.
///
/// Maps the writer's region read-only. Each reader tracks its own
/// last-observed sequence, so multiple readers can poll one channel
/// independently.
pub struct Reader {
    region: ShmRegion,
    config: TuningConfig,
    capacity: usize,
    slot_stride: usize,
    slot_offset: usize,
    last_seq: u64,
    last_timestamp_ns: i64,
    dropped: u64,
    lease_active: bool,
    cache_info: CacheInfo,
}

impl Reader {
    /// Connect to a basic-tier channel
    pub fn basic(name: &str, max_size: usize) -> Result<Self> {
        Self::with_tier(name, max_size, Tier::Basic, TuningConfig::portable())
    }

    /// Connect to a cache-tuned channel
    pub fn cache_tuned(name: &str, max_size: usize, config: TuningConfig) -> Result<Self> {
        Self::with_tier(name, max_size, Tier::CacheTuned, config)
    }

    fn with_tier(name: &str, max_size: usize, tier: Tier, mut config: TuningConfig) -> Result<Self> {
        let cache_info = platform::detect_cache_info();
        resolve_prefetch_distance(&mut config, &cache_info);

        if let Some(cpu) = config.cpu_affinity {
            platform::set_cpu_affinity(cpu);
        }

        let try_huge = tier == Tier::CacheTuned && config.use_huge_pages;
        let region = ShmRegion::open_read_only(name, try_huge)?;

        if region.size() < HEADER_SIZE {
            return Err(FramelinkError::ShmOpen {
                name: name.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidData, "region smaller than header"),
            });
        }

        // SAFETY: region holds at least a Header (checked above)
        let header = unsafe { &*(region.as_ptr() as *const Header) };
        if header.magic != tier.magic() {
            return Err(FramelinkError::InvalidMagic {
                expected: tier.magic(),
                got: header.magic,
            });
        }
        if header.version != tier.version() {
            return Err(FramelinkError::UnsupportedVersion {
                expected: tier.version(),
                got: header.version,
            });
        }

        let capacity = header.capacity as usize;
        if capacity != max_size {
            return Err(FramelinkError::CapacityMismatch {
                expected: capacity,
                got: max_size,
            });
        }

        // Same size computation as the writer, anchored on the recorded
        // slot offset
        let slot_offset = header.slot_offset as usize;
        let slot_stride = platform::align_to_cache_line(capacity);
        if region.size() < slot_offset + 2 * slot_stride {
            return Err(FramelinkError::ShmOpen {
                name: name.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidData, "region smaller than two slots"),
            });
        }

        Ok(Self {
            region,
            config,
            capacity,
            slot_stride,
            slot_offset,
            last_seq: 0,
            last_timestamp_ns: 0,
            dropped: 0,
            lease_active: false,
            cache_info,
        })
    }

    #[inline(always)]
    fn header(&self) -> &Header {
        // SAFETY: validated during construction
        unsafe { &*(self.region.as_ptr() as *const Header) }
    }

    #[inline(always)]
    fn slot_ptr(&self, idx: u32) -> *const u8 {
        // SAFETY: idx is 0 or 1, region size was validated against both slots
        unsafe {
            self.region
                .as_ptr()
                .add(self.slot_offset + idx as usize * self.slot_stride)
                .cast_const()
        }
    }

    /// Load the front slot's metadata and update drop accounting.
    ///
    /// Returns `(front, seq, len, timestamp)` for a new frame, `None` when
    /// the sequence has not advanced.
    fn observe(&mut self) -> Option<(u32, u64, usize, i64)> {
        let header = self.header();
        let front = header.front_idx.load(Ordering::Acquire);
        let meta = &header.slots[front as usize];
        let seq = meta.seq.load(Ordering::Relaxed);
        let len = meta.len.load(Ordering::Relaxed) as usize;
        let timestamp_ns = meta.timestamp_ns.load(Ordering::Relaxed);

        if seq == self.last_seq {
            return None;
        }

        // A gap means the writer cycled past us; first observation starts
        // the accounting without counting history as drops
        if self.last_seq > 0 && seq > self.last_seq + 1 {
            self.dropped += seq - self.last_seq - 1;
        }

        self.last_seq = seq;
        self.last_timestamp_ns = timestamp_ns;

        Some((front, seq, len, timestamp_ns))
    }

    /// Zero-copy view of the latest frame.
    ///
    /// Returns `None` when nothing new was published since the last call.
    /// The returned payload points into shared memory and is valid only
    /// until the next call on this reader.
    #[inline]
    pub fn latest(&mut self) -> Option<Frame<'_>> {
        let (front, seq, len, timestamp_ns) = self.observe()?;

        // SAFETY: len <= capacity was enforced by the writer; the slot
        // stays mapped for the lifetime of self
        let payload = unsafe { std::slice::from_raw_parts(self.slot_ptr(front), len) };
        Some(Frame {
            payload,
            sequence: seq,
            timestamp_ns,
        })
    }

    /// Copy the latest frame into `buf`.
    ///
    /// Returns `Ok(None)` when nothing new was published. Fails without
    /// touching reader state when `buf` cannot hold the frame.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<Option<FrameInfo>> {
        let header = self.header();
        let front = header.front_idx.load(Ordering::Acquire);
        let meta = &header.slots[front as usize];
        let seq = meta.seq.load(Ordering::Relaxed);
        let len = meta.len.load(Ordering::Relaxed) as usize;

        if seq == self.last_seq {
            return Ok(None);
        }
        if len > buf.len() {
            return Err(FramelinkError::BufferTooSmall {
                need: len,
                got: buf.len(),
            });
        }

        let timestamp_ns = meta.timestamp_ns.load(Ordering::Relaxed);
        if self.last_seq > 0 && seq > self.last_seq + 1 {
            self.dropped += seq - self.last_seq - 1;
        }
        self.last_seq = seq;
        self.last_timestamp_ns = timestamp_ns;

        if self.config.enable_prefetch {
            platform::prefetch_range(self.slot_ptr(front), len.min(self.config.prefetch_distance));
        }
        // SAFETY: len <= capacity and buf holds at least len bytes
        unsafe {
            std::ptr::copy_nonoverlapping(self.slot_ptr(front), buf.as_mut_ptr(), len);
        }

        Ok(Some(FrameInfo {
            len,
            sequence: seq,
            timestamp_ns,
        }))
    }

    /// Zero-copy lease on the latest frame.
    ///
    /// Like [`Reader::latest`] but guarded: a second lease before
    /// [`Reader::release_lease`] fails with [`FramelinkError::LeaseHeld`].
    pub fn lease_latest(&mut self) -> Result<Option<Frame<'_>>> {
        if self.lease_active {
            return Err(FramelinkError::LeaseHeld);
        }

        match self.observe() {
            None => Ok(None),
            Some((front, seq, len, timestamp_ns)) => {
                self.lease_active = true;
                // SAFETY: as in latest()
                let payload = unsafe { std::slice::from_raw_parts(self.slot_ptr(front), len) };
                Ok(Some(Frame {
                    payload,
                    sequence: seq,
                    timestamp_ns,
                }))
            }
        }
    }

    /// Release a lease taken with [`Reader::lease_latest`]
    pub fn release_lease(&mut self) {
        self.lease_active = false;
    }

    /// Whether the writer's heartbeat is younger than `timeout`
    pub fn is_writer_alive(&self, timeout: Duration) -> bool {
        let heartbeat = self.header().heartbeat_ns.load(Ordering::Relaxed);
        let age_ms = (platform::now_ns() - heartbeat) / 1_000_000;
        age_ms < timeout.as_millis() as i64
    }

    /// Frames the writer published that this reader never observed
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Sequence number of the last observed frame (0 before the first)
    #[inline]
    pub fn last_sequence(&self) -> u64 {
        self.last_seq
    }

    /// Timestamp of the last observed frame
    #[inline]
    pub fn last_timestamp_ns(&self) -> i64 {
        self.last_timestamp_ns
    }

    /// Declared payload capacity of the channel
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether this reader's mapping is huge-page backed
    pub fn is_huge_page_backed(&self) -> bool {
        self.region.is_huge_page_backed()
    }

    /// Whether the writer's region is huge-page backed (header flags bit 0)
    pub fn writer_huge_page_backed(&self) -> bool {
        self.header().flags & FLAG_HUGE_PAGES != 0
    }

    /// Runtime statistics
    pub fn stats(&self) -> TransportStats {
        let header = self.header();
        TransportStats {
            huge_pages_active: self.region.is_huge_page_backed(),
            prefetch_active: self.config.enable_prefetch,
            pinned_cpu: self.config.cpu_affinity,
            cache_info: self.cache_info,
            total_writes: header.total_writes.load(Ordering::Relaxed),
            total_bytes: header.total_bytes.load(Ordering::Relaxed),
        }
    }
}

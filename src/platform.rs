//! CPU cache, huge-page and NUMA probing
//!
//! Everything here is a query: detection reads the kernel's exported
//! topology and substitutes conservative defaults on any failure. No
//! operation errors or panics, so the transports can always initialize.

use std::fs;
use std::path::Path;

/// Cache line size for modern x86_64 CPUs
pub const CACHE_LINE_SIZE: usize = 64;

/// Huge page size (2MB on x86_64)
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

// Defaults when sysfs detection fails
const DEFAULT_L1_SIZE: usize = 32 * 1024;
const DEFAULT_L2_SIZE: usize = 256 * 1024;
const DEFAULT_L3_SIZE: usize = 8 * 1024 * 1024;

/// CPU cache hierarchy information
#[derive(Clone, Copy, Debug)]
pub struct CacheInfo {
    /// L1 data cache size (bytes)
    pub l1d_size: usize,
    /// L1 instruction cache size (bytes)
    pub l1i_size: usize,
    /// L2 cache size (bytes)
    pub l2_size: usize,
    /// L3 cache size (bytes)
    pub l3_size: usize,
    /// Cache line size (bytes)
    pub line_size: usize,
    /// Number of online CPU cores
    pub num_cores: usize,
}

impl CacheInfo {
    /// Prefetch distance suited to this cache hierarchy (L2/4, 64 KiB floor)
    pub fn optimal_prefetch_distance(&self) -> usize {
        if self.l2_size > 0 {
            self.l2_size / 4
        } else {
            64 * 1024
        }
    }

    /// Bulk-copy chunk size suited to this cache hierarchy (L3/2, 1 MiB floor)
    pub fn optimal_chunk_size(&self) -> usize {
        if self.l3_size > 0 {
            self.l3_size / 2
        } else {
            1024 * 1024
        }
    }
}

/// Huge pages availability
#[derive(Clone, Copy, Debug)]
pub struct HugePagesInfo {
    /// Huge pages configured on this system
    pub available: bool,
    /// Enough free huge pages to map from
    pub usable: bool,
    /// Total huge pages
    pub total: usize,
    /// Free huge pages
    pub free: usize,
    /// Huge page size in bytes (usually 2 MiB)
    pub page_size: usize,
}

/// NUMA topology
#[derive(Clone, Copy, Debug)]
pub struct NumaInfo {
    /// More than one NUMA node present
    pub available: bool,
    /// Number of NUMA nodes
    pub num_nodes: usize,
    /// Current CPU's node (0 when unknown)
    pub current_node: usize,
}

/// Detect the CPU cache hierarchy from sysfs.
///
/// Reads `/sys/devices/system/cpu/cpu0/cache/index*`; any field that cannot
/// be read keeps its default.
pub fn detect_cache_info() -> CacheInfo {
    let mut info = CacheInfo {
        l1d_size: DEFAULT_L1_SIZE,
        l1i_size: DEFAULT_L1_SIZE,
        l2_size: DEFAULT_L2_SIZE,
        l3_size: DEFAULT_L3_SIZE,
        line_size: CACHE_LINE_SIZE,
        num_cores: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    };

    let cache_base = Path::new("/sys/devices/system/cpu/cpu0/cache");
    let entries = match fs::read_dir(cache_base) {
        Ok(entries) => entries,
        Err(_) => return info,
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        if !file_name.to_string_lossy().starts_with("index") {
            continue;
        }
        let index_path = entry.path();

        let cache_type = read_trimmed(&index_path.join("type"));
        let level: u32 = read_trimmed(&index_path.join("level"))
            .parse()
            .unwrap_or(0);
        let size = parse_size(&read_trimmed(&index_path.join("size")));

        if let Ok(line) = read_trimmed(&index_path.join("coherency_line_size")).parse::<usize>() {
            if line > 0 {
                info.line_size = line;
            }
        }

        match (level, cache_type.as_str()) {
            (1, "Data") => info.l1d_size = size,
            (1, "Instruction") => info.l1i_size = size,
            (2, _) => info.l2_size = size,
            (3, _) => info.l3_size = size,
            _ => {}
        }
    }

    info
}

fn read_trimmed(path: &Path) -> String {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Parse a sysfs size string like `32K` or `8192K` or `12M`
fn parse_size(s: &str) -> usize {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    let value: usize = digits.parse().unwrap_or(0);
    let multiplier = match s[digits.len()..].chars().next() {
        Some('K') | Some('k') => 1024,
        Some('M') | Some('m') => 1024 * 1024,
        Some('G') | Some('g') => 1024 * 1024 * 1024,
        _ => 1,
    };
    value * multiplier
}

/// Detect huge pages availability from `/proc/meminfo`
pub fn detect_huge_pages() -> HugePagesInfo {
    let mut info = HugePagesInfo {
        available: false,
        usable: false,
        total: 0,
        free: 0,
        page_size: HUGE_PAGE_SIZE,
    };

    let meminfo = match fs::read_to_string("/proc/meminfo") {
        Ok(contents) => contents,
        Err(_) => return info,
    };

    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("HugePages_Total:") {
            info.total = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("HugePages_Free:") {
            info.free = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("Hugepagesize:") {
            let kb: usize = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            if kb > 0 {
                info.page_size = kb * 1024;
            }
        }
    }

    info.available = info.total > 0;
    info.usable = info.free > 0;
    info
}

/// Detect NUMA topology from `/sys/devices/system/node`
pub fn detect_numa() -> NumaInfo {
    let mut info = NumaInfo {
        available: false,
        num_nodes: 1,
        current_node: 0,
    };

    if let Ok(entries) = fs::read_dir("/sys/devices/system/node") {
        let node_count = entries
            .flatten()
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with("node") && name[4..].chars().all(|c| c.is_ascii_digit())
            })
            .count();
        if node_count > 1 {
            info.available = true;
            info.num_nodes = node_count;
        }
    }

    info
}

/// Whether a payload of this size fits in half the L3 cache
pub fn fits_in_l3(size: usize) -> bool {
    size <= detect_cache_info().l3_size / 2
}

/// Whether a huge-page mapping is worth attempting for this size.
///
/// Requires the allocation to be at least 1 MiB and enough free huge pages
/// to cover it.
pub fn should_use_huge_pages(size: usize) -> bool {
    if size < 1024 * 1024 {
        return false;
    }

    let hp = detect_huge_pages();
    if !hp.usable {
        return false;
    }

    let pages_needed = size.div_ceil(hp.page_size);
    pages_needed <= hp.free
}

/// Round a size up to the next cache-line boundary
#[inline]
pub const fn align_to_cache_line(size: usize) -> usize {
    (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
}

/// Round a size up to the next huge-page boundary
#[inline]
pub const fn align_to_huge_page(size: usize) -> usize {
    (size + HUGE_PAGE_SIZE - 1) & !(HUGE_PAGE_SIZE - 1)
}

/// Prefetch one cache line for reading (high locality)
#[inline(always)]
pub fn prefetch_read(addr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch(addr as *const i8, _MM_HINT_T0);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = addr;
}

/// Prefetch one cache line for writing (high locality)
#[inline(always)]
pub fn prefetch_write(addr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch(addr as *const i8, _MM_HINT_T0);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = addr;
}

/// Prefetch a range in cache-line strides (lower locality than single-line
/// hints; the whole range is not expected to stay resident)
pub fn prefetch_range(addr: *const u8, size: usize) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T2};
        let mut offset = 0;
        while offset < size {
            _mm_prefetch(addr.add(offset) as *const i8, _MM_HINT_T2);
            offset += CACHE_LINE_SIZE;
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (addr, size);
    }
}

/// Pin the current thread to a CPU core. Returns whether it took effect.
pub fn set_cpu_affinity(cpu: usize) -> bool {
    use rustix::process::{sched_setaffinity, CpuSet};

    let mut set = CpuSet::new();
    set.set(cpu);
    sched_setaffinity(None, &set).is_ok()
}

/// CPU core the current thread is running on
pub fn current_cpu() -> usize {
    rustix::process::sched_getcpu()
}

/// Monotonic clock in nanoseconds.
///
/// The epoch is unspecified; values are only meaningful as same-host
/// differences (heartbeat ages, latency measurements).
#[inline]
pub fn now_ns() -> i64 {
    let ts = rustix::time::clock_gettime(rustix::time::ClockId::Monotonic);
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

/// Tuning knobs for the cache-tuned transport tier
#[derive(Clone, Debug)]
pub struct TuningConfig {
    /// Try to back the region with 2 MiB huge pages
    pub use_huge_pages: bool,
    /// Enable software prefetching
    pub enable_prefetch: bool,
    /// Pin the calling thread to this core during initialize
    pub cpu_affinity: Option<usize>,
    /// Prefetch distance in bytes (0 = derive from detected cache sizes)
    pub prefetch_distance: usize,
}

impl TuningConfig {
    /// Detect optimal settings for this machine
    pub fn auto_detect() -> Self {
        let cache = detect_cache_info();
        let hp = detect_huge_pages();
        Self {
            use_huge_pages: hp.usable,
            enable_prefetch: true,
            cpu_affinity: None,
            prefetch_distance: cache.optimal_prefetch_distance(),
        }
    }

    /// Maximum portability: no special mapping features
    pub fn portable() -> Self {
        Self {
            use_huge_pages: false,
            enable_prefetch: true,
            cpu_affinity: None,
            prefetch_distance: 64 * 1024,
        }
    }

    /// Maximum performance: huge pages, prefetch, pinned to core 0
    pub fn max_performance() -> Self {
        Self {
            use_huge_pages: true,
            enable_prefetch: true,
            cpu_affinity: Some(0),
            prefetch_distance: 0,
        }
    }
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self::auto_detect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_info_has_sane_values() {
        let info = detect_cache_info();
        assert!(info.l1d_size > 0);
        assert!(info.l2_size > 0);
        assert!(info.l3_size > 0);
        assert!(info.line_size >= 32 && info.line_size <= 256);
        assert!(info.num_cores >= 1);
        assert!(info.optimal_prefetch_distance() > 0);
        assert!(info.optimal_chunk_size() > 0);
    }

    #[test]
    fn parse_size_suffixes() {
        assert_eq!(parse_size("32K"), 32 * 1024);
        assert_eq!(parse_size("8192K"), 8192 * 1024);
        assert_eq!(parse_size("12M"), 12 * 1024 * 1024);
        assert_eq!(parse_size("512"), 512);
        assert_eq!(parse_size(""), 0);
    }

    #[test]
    fn huge_pages_info_consistent() {
        let hp = detect_huge_pages();
        assert!(hp.page_size >= 4096);
        assert_eq!(hp.available, hp.total > 0);
        assert_eq!(hp.usable, hp.free > 0);
    }

    #[test]
    fn numa_info_consistent() {
        let numa = detect_numa();
        assert!(numa.num_nodes >= 1);
        assert_eq!(numa.available, numa.num_nodes > 1);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_to_cache_line(0), 0);
        assert_eq!(align_to_cache_line(1), 64);
        assert_eq!(align_to_cache_line(64), 64);
        assert_eq!(align_to_cache_line(65), 128);
        assert_eq!(align_to_huge_page(1), HUGE_PAGE_SIZE);
        assert_eq!(align_to_huge_page(HUGE_PAGE_SIZE), HUGE_PAGE_SIZE);
        assert_eq!(align_to_huge_page(HUGE_PAGE_SIZE + 1), 2 * HUGE_PAGE_SIZE);
    }

    #[test]
    fn clock_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn prefetch_is_harmless() {
        let data = [0u8; 4096];
        prefetch_read(data.as_ptr());
        prefetch_write(data.as_ptr());
        prefetch_range(data.as_ptr(), data.len());
    }

    #[test]
    fn affinity_round_trip() {
        let cpu = current_cpu();
        // Pinning to the core we are already on must not move us
        if set_cpu_affinity(cpu) {
            assert_eq!(current_cpu(), cpu);
        }
    }

    #[test]
    fn tuning_presets() {
        let portable = TuningConfig::portable();
        assert!(!portable.use_huge_pages);
        assert_eq!(portable.prefetch_distance, 64 * 1024);

        let max = TuningConfig::max_performance();
        assert!(max.use_huge_pages);
        assert_eq!(max.cpu_affinity, Some(0));

        let auto = TuningConfig::auto_detect();
        assert!(auto.enable_prefetch);
    }
}

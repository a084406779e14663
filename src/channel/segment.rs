//! Shared memory segment layout.
//!
//! The segment is an array of 32-bit atomic words so that every access, payload
//! bytes included, goes through an atomic load or store. Neither side can ever
//! observe a torn value; consistency across multiple words is provided by the
//! generation counters in the control region.
//!
//! Memory Layout (word indices):
//!
//! ```text
//!   0       turn flag            IDLE / SIGNALED / DISPOSED
//!   1       instruction gen      busy bit + publish counter, guards the batch region
//!   2       input gen            busy bit + publish counter, guards the input slot
//!   3       timing gen           busy bit + publish counter, guards the timing slot
//!   4..24   input payload        fixed width (see INPUT_WORDS)
//!   24..30  timing payload       fixed width (see TIMING_WORDS)
//!   30      frames completed     producer frames finished and not yet taken
//!   31      reserved
//!   32      batch length         bytes currently pending in the batch region
//!   33..    batch data           encoded instruction records, remaining capacity
//! ```
//!
//! Segment geometry is a tunable constant, not a wire guarantee: both halves of a
//! pair always come from the same [`SharedSegment`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::ChannelError;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Default segment size (64 KiB).
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024;

// --- Control region ---
pub const W_TURN: usize = 0;
pub const W_INSTRUCTION_GEN: usize = 1;
pub const W_INPUT_GEN: usize = 2;
pub const W_TIMING_GEN: usize = 3;

// --- Turn flag values ---
pub const TURN_IDLE: u32 = 0;
pub const TURN_SIGNALED: u32 = 1;
pub const TURN_DISPOSED: u32 = u32::MAX;

/// Set on a generation word while its region is being written or drained.
///
/// Published generations never carry this bit and increase by one per publish.
pub const GENERATION_BUSY_BIT: u32 = 1 << 31;

// --- Input payload: keys_down(8) keys_pressed(8) x y buttons_down buttons_pressed ---
pub const INPUT_OFFSET: usize = 4;
pub const INPUT_WORDS: usize = 20;

// --- Timing payload: delta(2) elapsed(2) frame(2) ---
pub const TIMING_OFFSET: usize = INPUT_OFFSET + INPUT_WORDS;
pub const TIMING_WORDS: usize = 6;

/// Counts frames the producer has finished since the consumer last took them.
pub const W_FRAMES_COMPLETED: usize = TIMING_OFFSET + TIMING_WORDS;

// --- Instruction batch region ---
pub const W_BATCH_LEN: usize = 32;
pub const BATCH_DATA_OFFSET: usize = W_BATCH_LEN + 1;

/// Smallest usable segment: control + payloads + length word + one data word.
pub const MIN_SEGMENT_SIZE: usize = (BATCH_DATA_OFFSET + 1) * 4;

// =============================================================================
// SHARED SEGMENT
// =============================================================================

/// Fixed-size shared memory segment.
///
/// Cloning shares the same memory; the segment is freed when the last clone drops.
#[derive(Clone)]
pub struct SharedSegment {
    words: Arc<[AtomicU32]>,
}

impl SharedSegment {
    /// Allocate a zeroed segment of `size_bytes`.
    pub fn new(size_bytes: usize) -> Result<Self, ChannelError> {
        if size_bytes % 4 != 0 || size_bytes < MIN_SEGMENT_SIZE {
            return Err(ChannelError::SegmentTooSmall {
                size: size_bytes,
                min: MIN_SEGMENT_SIZE,
            });
        }
        let words: Arc<[AtomicU32]> = (0..size_bytes / 4).map(|_| AtomicU32::new(0)).collect();
        Ok(Self { words })
    }

    /// Segment size in bytes.
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.words.len() * 4
    }

    /// Bytes available to the instruction batch region.
    #[inline]
    pub fn batch_capacity(&self) -> usize {
        (self.words.len() - BATCH_DATA_OFFSET) * 4
    }

    /// Whether two handles refer to the same memory.
    pub fn same_segment(&self, other: &SharedSegment) -> bool {
        Arc::ptr_eq(&self.words, &other.words)
    }

    // =========================================================================
    // LOW-LEVEL WORD ACCESS
    // =========================================================================

    #[inline]
    pub(crate) fn word(&self, index: usize) -> &AtomicU32 {
        &self.words[index]
    }

    #[inline]
    pub(crate) fn load_word(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn store_word(&self, index: usize, value: u32) {
        self.words[index].store(value, Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn load_f32(&self, index: usize) -> f32 {
        f32::from_bits(self.load_word(index))
    }

    #[inline]
    pub(crate) fn store_f32(&self, index: usize, value: f32) {
        self.store_word(index, value.to_bits())
    }

    pub(crate) fn load_u64(&self, index: usize) -> u64 {
        (self.load_word(index) as u64) | ((self.load_word(index + 1) as u64) << 32)
    }

    pub(crate) fn store_u64(&self, index: usize, value: u64) {
        self.store_word(index, value as u32);
        self.store_word(index + 1, (value >> 32) as u32);
    }

    pub(crate) fn load_f64(&self, index: usize) -> f64 {
        f64::from_bits(self.load_u64(index))
    }

    pub(crate) fn store_f64(&self, index: usize, value: f64) {
        self.store_u64(index, value.to_bits())
    }

    /// Copy word-aligned bytes into the segment starting at `start_word`.
    pub(crate) fn write_bytes(&self, start_word: usize, bytes: &[u8]) {
        debug_assert_eq!(bytes.len() % 4, 0, "segment writes must be word aligned");
        for (i, chunk) in bytes.chunks_exact(4).enumerate() {
            let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.store_word(start_word + i, value);
        }
    }

    /// Copy `len` bytes (a multiple of 4) out of the segment.
    pub(crate) fn read_bytes(&self, start_word: usize, len: usize) -> Vec<u8> {
        debug_assert_eq!(len % 4, 0, "segment reads must be word aligned");
        let mut out = Vec::with_capacity(len);
        for i in 0..len / 4 {
            out.extend_from_slice(&self.load_word(start_word + i).to_le_bytes());
        }
        out
    }

    // =========================================================================
    // GENERATION LOCKS
    // =========================================================================

    /// Take exclusive access to the region guarded by generation word `index`.
    ///
    /// Spins while another writer holds the busy bit. Returns the generation
    /// observed before locking, to be passed to [`release_generation`].
    ///
    /// [`release_generation`]: SharedSegment::release_generation
    pub(crate) fn acquire_generation(&self, index: usize) -> u32 {
        let word = &self.words[index];
        let mut start = word.load(Ordering::Acquire);
        loop {
            if start & GENERATION_BUSY_BIT != 0 {
                std::hint::spin_loop();
                start = word.load(Ordering::Acquire);
                continue;
            }
            match word.compare_exchange_weak(
                start,
                start | GENERATION_BUSY_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return start,
                Err(actual) => start = actual,
            }
        }
    }

    /// Release the busy bit, bumping the generation when the region changed.
    pub(crate) fn release_generation(&self, index: usize, start: u32, bumped: bool) -> u32 {
        let next = if bumped {
            start.wrapping_add(1) & !GENERATION_BUSY_BIT
        } else {
            start
        };
        self.words[index].store(next, Ordering::Release);
        next
    }

    /// Read a multi-word value consistently against writers of generation `index`.
    pub(crate) fn read_consistent<T>(&self, index: usize, read: impl Fn(&SharedSegment) -> T) -> T {
        let word = &self.words[index];
        loop {
            let gen0 = word.load(Ordering::Acquire);
            if gen0 & GENERATION_BUSY_BIT != 0 {
                std::hint::spin_loop();
                continue;
            }
            let value = read(self);
            std::sync::atomic::fence(Ordering::Acquire);
            let gen1 = word.load(Ordering::Relaxed);
            if gen0 == gen1 {
                return value;
            }
        }
    }

    /// Current published generation of word `index` (busy bit masked).
    pub fn generation(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::Acquire) & !GENERATION_BUSY_BIT
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("size_bytes", &self.size_bytes())
            .field("turn", &self.load_word(W_TURN))
            .field("batch_len", &self.load_word(W_BATCH_LEN))
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_constants() {
        assert_eq!(TIMING_OFFSET, 24);
        assert!(TIMING_OFFSET + TIMING_WORDS <= W_BATCH_LEN);
        assert_eq!(MIN_SEGMENT_SIZE, 136);
        assert_eq!(GENERATION_BUSY_BIT & TURN_SIGNALED, 0);
    }

    #[test]
    fn test_new_rejects_bad_sizes() {
        assert!(matches!(
            SharedSegment::new(100),
            Err(ChannelError::SegmentTooSmall { size: 100, .. })
        ));
        assert!(SharedSegment::new(MIN_SEGMENT_SIZE + 2).is_err());
        let seg = SharedSegment::new(MIN_SEGMENT_SIZE).unwrap();
        assert_eq!(seg.batch_capacity(), 4);
    }

    #[test]
    fn test_default_geometry() {
        let seg = SharedSegment::new(DEFAULT_SEGMENT_SIZE).unwrap();
        assert_eq!(seg.size_bytes(), 65536);
        assert_eq!(seg.batch_capacity(), 65536 - BATCH_DATA_OFFSET * 4);
    }

    #[test]
    fn test_bytes_round_trip_through_words() {
        let seg = SharedSegment::new(1024).unwrap();
        let bytes: Vec<u8> = (0u8..16).collect();
        seg.write_bytes(BATCH_DATA_OFFSET, &bytes);
        assert_eq!(seg.read_bytes(BATCH_DATA_OFFSET, 16), bytes);
        assert_eq!(seg.load_word(BATCH_DATA_OFFSET), u32::from_le_bytes([0, 1, 2, 3]));
    }

    #[test]
    fn test_generation_lock_bumps() {
        let seg = SharedSegment::new(1024).unwrap();
        let start = seg.acquire_generation(W_INPUT_GEN);
        assert_eq!(start, 0);
        assert_ne!(seg.load_word(W_INPUT_GEN) & GENERATION_BUSY_BIT, 0);
        seg.release_generation(W_INPUT_GEN, start, true);
        assert_eq!(seg.generation(W_INPUT_GEN), 1);

        let start = seg.acquire_generation(W_INPUT_GEN);
        seg.release_generation(W_INPUT_GEN, start, false);
        assert_eq!(seg.generation(W_INPUT_GEN), 1);
    }

    #[test]
    fn test_clones_share_memory() {
        let a = SharedSegment::new(1024).unwrap();
        let b = a.clone();
        a.store_f64(TIMING_OFFSET, 1.5);
        assert_eq!(b.load_f64(TIMING_OFFSET), 1.5);
        assert!(a.same_segment(&b));
        assert!(!a.same_segment(&SharedSegment::new(1024).unwrap()));
    }
}

//! Shared-memory transport.
//!
//! Both halves of a pair hold a clone of the same [`SharedSegment`]. Payloads are
//! serialized into the segment (never pointed to) and guarded by generation words;
//! the frame handshake is a single turn word driven by `atomic_wait`.
//!
//! Turn protocol:
//!
//! 1. Waiter CASes `SIGNALED → IDLE`. Success consumes the turn.
//! 2. Otherwise it blocks on the word while it reads `IDLE`.
//! 3. Signaler CASes `IDLE → SIGNALED` and wakes one waiter.
//! 4. Dispose stores `DISPOSED` and wakes everyone; waiters then fail.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use super::codec;
use super::segment::*;
use super::{FrameChannel, TransportKind, TurnGuard};
use crate::config::WaitStrategy;
use crate::error::ChannelError;
use crate::types::{
    DrawInstruction, InputSnapshot, KeySet, PointerButtons, Role, TimingSnapshot,
};

/// One half of a shared-memory channel pair.
pub struct SharedMemoryChannel {
    role: Role,
    segment: SharedSegment,
    wait: WaitStrategy,
    turn_guard: TurnGuard,
    disposed: AtomicBool,
}

impl SharedMemoryChannel {
    /// Bind one role to a segment. The counterpart binds the other role to a clone.
    pub fn bind(segment: SharedSegment, role: Role, wait: WaitStrategy) -> Self {
        Self {
            role,
            segment,
            wait,
            turn_guard: TurnGuard::default(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }

    #[inline]
    fn turn(&self) -> &AtomicU32 {
        self.segment.word(W_TURN)
    }

    fn check_live(&self) -> Result<(), ChannelError> {
        if self.is_disposed() {
            Err(ChannelError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Block while the turn word still reads `IDLE`.
    fn wait_while_idle(&self, spins: &mut u32) {
        match self.wait {
            WaitStrategy::Futex => atomic_wait::wait(self.turn(), TURN_IDLE),
            WaitStrategy::Backoff => {
                *spins = spins.saturating_add(1);
                if *spins < 64 {
                    std::hint::spin_loop();
                } else if *spins < 256 {
                    thread::yield_now();
                } else {
                    thread::sleep(Duration::from_micros(50));
                }
            }
        }
    }

    // =========================================================================
    // PAYLOAD LAYOUT
    // =========================================================================

    fn write_input(&self, snapshot: &InputSnapshot) {
        let seg = &self.segment;
        let mut w = INPUT_OFFSET;
        for word in snapshot.keys_down.to_words() {
            seg.store_word(w, word);
            w += 1;
        }
        for word in snapshot.keys_pressed.to_words() {
            seg.store_word(w, word);
            w += 1;
        }
        seg.store_f32(w, snapshot.pointer_x);
        seg.store_f32(w + 1, snapshot.pointer_y);
        seg.store_word(w + 2, snapshot.buttons_down.bits());
        seg.store_word(w + 3, snapshot.buttons_pressed.bits());
    }

    fn load_input(seg: &SharedSegment) -> InputSnapshot {
        let mut down = [0u32; KeySet::WORDS];
        let mut pressed = [0u32; KeySet::WORDS];
        for i in 0..KeySet::WORDS {
            down[i] = seg.load_word(INPUT_OFFSET + i);
            pressed[i] = seg.load_word(INPUT_OFFSET + KeySet::WORDS + i);
        }
        let w = INPUT_OFFSET + 2 * KeySet::WORDS;
        InputSnapshot {
            keys_down: KeySet::from_words(&down),
            keys_pressed: KeySet::from_words(&pressed),
            pointer_x: seg.load_f32(w),
            pointer_y: seg.load_f32(w + 1),
            buttons_down: PointerButtons::from_bits_truncate(seg.load_word(w + 2)),
            buttons_pressed: PointerButtons::from_bits_truncate(seg.load_word(w + 3)),
        }
    }

    fn load_timing(seg: &SharedSegment) -> TimingSnapshot {
        TimingSnapshot {
            delta: seg.load_f64(TIMING_OFFSET),
            elapsed: seg.load_f64(TIMING_OFFSET + 2),
            frame: seg.load_u64(TIMING_OFFSET + 4),
        }
    }
}

impl FrameChannel for SharedMemoryChannel {
    fn role(&self) -> Role {
        self.role
    }

    fn kind(&self) -> TransportKind {
        TransportKind::SharedMemory
    }

    fn publish_instructions(&self, batch: Vec<DrawInstruction>) -> Result<(), ChannelError> {
        self.check_live()?;
        if batch.is_empty() {
            return Ok(());
        }
        let bytes = codec::encode_batch(&batch);

        let seg = &self.segment;
        let start = seg.acquire_generation(W_INSTRUCTION_GEN);
        let pending = seg.load_word(W_BATCH_LEN) as usize;
        let available = seg.batch_capacity() - pending;
        if bytes.len() > available {
            seg.release_generation(W_INSTRUCTION_GEN, start, false);
            tracing::warn!(
                role = %self.role,
                needed = bytes.len(),
                available,
                "instruction batch dropped: segment overflow"
            );
            return Err(ChannelError::Overflow {
                needed: bytes.len(),
                available,
            });
        }

        seg.write_bytes(BATCH_DATA_OFFSET + pending / 4, &bytes);
        seg.store_word(W_BATCH_LEN, (pending + bytes.len()) as u32);
        seg.release_generation(W_INSTRUCTION_GEN, start, true);
        Ok(())
    }

    fn drain_instructions(&self) -> Result<Vec<DrawInstruction>, ChannelError> {
        if self.is_disposed() {
            return Ok(Vec::new());
        }
        let seg = &self.segment;
        let start = seg.acquire_generation(W_INSTRUCTION_GEN);
        let pending = seg.load_word(W_BATCH_LEN) as usize;
        if pending == 0 {
            seg.release_generation(W_INSTRUCTION_GEN, start, false);
            return Ok(Vec::new());
        }
        let bytes = seg.read_bytes(BATCH_DATA_OFFSET, pending.min(seg.batch_capacity()));
        seg.store_word(W_BATCH_LEN, 0);
        seg.release_generation(W_INSTRUCTION_GEN, start, true);

        Ok(codec::decode_batch(&bytes)?)
    }

    fn complete_frame(&self) -> Result<(), ChannelError> {
        self.check_live()?;
        self.segment.word(W_FRAMES_COMPLETED).fetch_add(1, Ordering::Release);
        Ok(())
    }

    fn take_completed_frames(&self) -> u64 {
        if self.disposed.load(Ordering::Acquire) {
            return 0;
        }
        self.segment.word(W_FRAMES_COMPLETED).swap(0, Ordering::AcqRel) as u64
    }

    fn publish_input(&self, snapshot: &InputSnapshot) -> Result<(), ChannelError> {
        self.check_live()?;
        let start = self.segment.acquire_generation(W_INPUT_GEN);
        self.write_input(snapshot);
        self.segment.release_generation(W_INPUT_GEN, start, true);
        Ok(())
    }

    fn read_input(&self) -> InputSnapshot {
        self.segment.read_consistent(W_INPUT_GEN, Self::load_input)
    }

    fn publish_timing(&self, snapshot: &TimingSnapshot) -> Result<(), ChannelError> {
        self.check_live()?;
        let seg = &self.segment;
        let start = seg.acquire_generation(W_TIMING_GEN);
        seg.store_f64(TIMING_OFFSET, snapshot.delta);
        seg.store_f64(TIMING_OFFSET + 2, snapshot.elapsed);
        seg.store_u64(TIMING_OFFSET + 4, snapshot.frame);
        seg.release_generation(W_TIMING_GEN, start, true);
        Ok(())
    }

    fn read_timing(&self) -> TimingSnapshot {
        self.segment.read_consistent(W_TIMING_GEN, Self::load_timing)
    }

    fn await_turn(&self) -> Result<(), ChannelError> {
        let _waiter = self.turn_guard.enter()?;
        let mut spins = 0u32;
        loop {
            if self.disposed.load(Ordering::Acquire) {
                return Err(ChannelError::Disposed);
            }
            match self.turn().compare_exchange(
                TURN_SIGNALED,
                TURN_IDLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(TURN_DISPOSED) => return Err(ChannelError::Disposed),
                Err(_) => self.wait_while_idle(&mut spins),
            }
        }
    }

    fn signal_turn(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        // Only IDLE moves to SIGNALED: a pending signal stays single, DISPOSED stays put.
        let _ = self.turn().compare_exchange(
            TURN_IDLE,
            TURN_SIGNALED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        atomic_wait::wake_one(self.turn());
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.turn().store(TURN_DISPOSED, Ordering::SeqCst);
        atomic_wait::wake_all(self.turn());
        tracing::debug!(role = %self.role, "shared-memory channel disposed");
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire) || self.turn().load(Ordering::Acquire) == TURN_DISPOSED
    }
}

impl std::fmt::Debug for SharedMemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryChannel")
            .field("role", &self.role)
            .field("wait", &self.wait)
            .field("segment", &self.segment)
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::types::Key;
    use std::sync::Arc;

    fn pair(size: usize) -> (SharedMemoryChannel, SharedMemoryChannel) {
        let seg = SharedSegment::new(size).unwrap();
        (
            SharedMemoryChannel::bind(seg.clone(), Role::Host, WaitStrategy::Futex),
            SharedMemoryChannel::bind(seg, Role::Isolated, WaitStrategy::Futex),
        )
    }

    fn rect(x: f32) -> DrawInstruction {
        DrawInstruction::FillRect { x, y: 0.0, width: 1.0, height: 1.0 }
    }

    #[test]
    fn test_batches_concatenate_until_drained() {
        let (host, isolated) = pair(DEFAULT_SEGMENT_SIZE);
        isolated.publish_instructions(vec![rect(1.0), rect(2.0)]).unwrap();
        isolated.publish_instructions(vec![rect(3.0)]).unwrap();

        assert_eq!(host.drain_instructions().unwrap(), vec![rect(1.0), rect(2.0), rect(3.0)]);
        assert!(host.drain_instructions().unwrap().is_empty());
        assert_eq!(host.segment().generation(W_INSTRUCTION_GEN), 3);
    }

    #[test]
    fn test_overflow_drops_whole_batch() {
        // One FillRect record is 20 bytes; leave room for exactly two.
        let (host, isolated) = pair(MIN_SEGMENT_SIZE + 36);
        assert_eq!(isolated.segment().batch_capacity(), 40);

        isolated.publish_instructions(vec![rect(1.0)]).unwrap();
        let err = isolated.publish_instructions(vec![rect(2.0), rect(3.0)]).unwrap_err();
        assert_eq!(err, ChannelError::Overflow { needed: 40, available: 20 });

        assert_eq!(host.drain_instructions().unwrap(), vec![rect(1.0)]);
        isolated.publish_instructions(vec![rect(2.0), rect(3.0)]).unwrap();
        assert_eq!(host.drain_instructions().unwrap().len(), 2);
    }

    #[test]
    fn test_input_and_timing_slots() {
        let (host, isolated) = pair(DEFAULT_SEGMENT_SIZE);
        assert_eq!(isolated.read_input(), InputSnapshot::default());
        assert_eq!(isolated.read_timing(), TimingSnapshot::default());

        let mut input = InputSnapshot::default();
        input.keys_down.insert(Key::UP);
        input.keys_pressed.insert(Key(b'W'));
        input.pointer_x = 12.5;
        input.pointer_y = -3.0;
        input.buttons_down = PointerButtons::PRIMARY | PointerButtons::SECONDARY;
        input.buttons_pressed = PointerButtons::SECONDARY;
        host.publish_input(&input).unwrap();

        let timing = TimingSnapshot { delta: 0.016, elapsed: 1.25, frame: 77 };
        host.publish_timing(&TimingSnapshot::default()).unwrap();
        host.publish_timing(&timing).unwrap();

        assert_eq!(isolated.read_input(), input);
        assert_eq!(isolated.read_timing(), timing);
    }

    #[test]
    fn test_completed_frames_are_taken_once() {
        let (host, isolated) = pair(DEFAULT_SEGMENT_SIZE);
        assert_eq!(host.take_completed_frames(), 0);

        isolated.publish_instructions(vec![rect(1.0)]).unwrap();
        isolated.complete_frame().unwrap();
        isolated.complete_frame().unwrap();
        assert_eq!(host.take_completed_frames(), 2);
        assert_eq!(host.take_completed_frames(), 0);
        assert_eq!(host.drain_instructions().unwrap(), vec![rect(1.0)]);

        host.dispose();
        assert_eq!(isolated.complete_frame(), Err(ChannelError::Disposed));
        assert_eq!(host.take_completed_frames(), 0);
    }

    #[test]
    fn test_signal_before_wait_is_kept() {
        let (host, isolated) = pair(DEFAULT_SEGMENT_SIZE);
        host.signal_turn();
        host.signal_turn();
        isolated.await_turn().unwrap();
        assert_eq!(isolated.segment().load_word(W_TURN), TURN_IDLE);
    }

    #[test]
    fn test_await_wakes_on_signal() {
        let seg = SharedSegment::new(DEFAULT_SEGMENT_SIZE).unwrap();
        let isolated = Arc::new(SharedMemoryChannel::bind(seg.clone(), Role::Isolated, WaitStrategy::Futex));
        let host = SharedMemoryChannel::bind(seg, Role::Host, WaitStrategy::Futex);

        let waiter = {
            let isolated = isolated.clone();
            thread::spawn(move || isolated.await_turn())
        };
        thread::sleep(Duration::from_millis(20));
        host.signal_turn();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_second_waiter_rejected() {
        let seg = SharedSegment::new(DEFAULT_SEGMENT_SIZE).unwrap();
        let isolated = Arc::new(SharedMemoryChannel::bind(seg.clone(), Role::Isolated, WaitStrategy::Backoff));
        let host = SharedMemoryChannel::bind(seg, Role::Host, WaitStrategy::Backoff);

        let waiter = {
            let isolated = isolated.clone();
            thread::spawn(move || isolated.await_turn())
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(
            isolated.await_turn(),
            Err(ChannelError::Protocol(ProtocolError::TurnAlreadyAwaited))
        );
        host.signal_turn();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_dispose_from_host_aborts_wait() {
        let seg = SharedSegment::new(DEFAULT_SEGMENT_SIZE).unwrap();
        let isolated = Arc::new(SharedMemoryChannel::bind(seg.clone(), Role::Isolated, WaitStrategy::Futex));
        let host = SharedMemoryChannel::bind(seg, Role::Host, WaitStrategy::Futex);

        let waiter = {
            let isolated = isolated.clone();
            thread::spawn(move || isolated.await_turn())
        };
        thread::sleep(Duration::from_millis(20));
        host.dispose();
        host.dispose();
        assert_eq!(waiter.join().unwrap(), Err(ChannelError::Disposed));

        assert!(isolated.is_disposed());
        assert_eq!(isolated.publish_instructions(vec![rect(1.0)]), Err(ChannelError::Disposed));
        assert!(host.drain_instructions().unwrap().is_empty());
        host.signal_turn();
        assert_eq!(isolated.segment().load_word(W_TURN), TURN_DISPOSED);
    }
}

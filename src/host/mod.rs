//! Host-side frame cycle.
//!
//! Per-frame state is an explicit [`HostFrameState`] owned by the caller, so any
//! number of channel pairs can be driven side by side. One host frame:
//!
//! ```text
//!   take_completed_frames ─► drain_instructions ─► sink.present
//!        │
//!        └─ script frame finished? ─► publish_input ─► end_frame
//!                                   ─► publish_timing ─► signal_turn
//! ```
//!
//! The turn goes back only for a script frame the host has seen complete, so a
//! slow script never has a spare token to run ahead with. Host frames that land
//! while the script is still busy present nothing new and keep the pressed-key
//! sets for the next hand-over.
//!
//! Publishing before the signal is what makes this frame's input and timing
//! visible to the script run the signal releases.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::FrameChannel;
use crate::error::ChannelError;
use crate::types::{DrawInstruction, InputSnapshot, Key, KeySet, PointerButtons, TimingSnapshot};

// =============================================================================
// INPUT STATE
// =============================================================================

/// Host-owned input accumulator fed by platform events.
#[derive(Debug, Clone, Default)]
pub struct InputState {
    keys_down: KeySet,
    keys_pressed: KeySet,
    pointer_x: f32,
    pointer_y: f32,
    buttons_down: PointerButtons,
    buttons_pressed: PointerButtons,
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key went down. Auto-repeat of a held key does not count as a new press.
    pub fn key_down(&mut self, key: Key) {
        if self.keys_down.insert(key) {
            self.keys_pressed.insert(key);
        }
    }

    pub fn key_up(&mut self, key: Key) {
        self.keys_down.remove(key);
    }

    pub fn pointer_move(&mut self, x: f32, y: f32) {
        self.pointer_x = x;
        self.pointer_y = y;
    }

    pub fn button_down(&mut self, buttons: PointerButtons) {
        let newly = buttons.difference(self.buttons_down);
        self.buttons_down.insert(buttons);
        self.buttons_pressed.insert(newly);
    }

    pub fn button_up(&mut self, buttons: PointerButtons) {
        self.buttons_down.remove(buttons);
    }

    /// Focus loss: everything is released.
    pub fn release_all(&mut self) {
        self.keys_down.clear();
        self.buttons_down = PointerButtons::empty();
    }

    pub fn snapshot(&self) -> InputSnapshot {
        InputSnapshot {
            keys_down: self.keys_down,
            keys_pressed: self.keys_pressed,
            pointer_x: self.pointer_x,
            pointer_y: self.pointer_y,
            buttons_down: self.buttons_down,
            buttons_pressed: self.buttons_pressed,
        }
    }

    /// Clear the pressed-this-frame sets.
    pub fn end_frame(&mut self) {
        self.keys_pressed.clear();
        self.buttons_pressed = PointerButtons::empty();
    }
}

// =============================================================================
// FRAME STATE
// =============================================================================

/// Everything the host carries from one frame to the next for one channel pair.
#[derive(Debug, Clone, Default)]
pub struct HostFrameState {
    pub input: InputState,
    /// Host frames run so far.
    pub frames: u64,
    /// Host frames that handed the turn back to the script.
    pub turns_handed: u64,
    /// Non-empty instruction batches handed to the sink.
    pub batches_presented: u64,
    pub instructions_presented: u64,
    pub last_timing: TimingSnapshot,
}

impl HostFrameState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Receives each drained batch, e.g. a renderer.
pub trait InstructionSink {
    /// `frame` is the host frame the batch was drained in.
    fn present(&mut self, frame: u64, batch: Vec<DrawInstruction>);
}

impl<F> InstructionSink for F
where
    F: FnMut(u64, Vec<DrawInstruction>),
{
    fn present(&mut self, frame: u64, batch: Vec<DrawInstruction>) {
        self(frame, batch)
    }
}

/// Run one host frame against `channel`.
///
/// Drains and presents whatever the script has published; empty drains are not
/// presented. Input and timing are published and the turn signaled only when the
/// script has completed a frame since the last hand-over. Returns whether the
/// turn was handed back.
///
/// Fails with the first channel error; the turn is not signaled in that case.
pub fn run_host_frame<C, S>(
    channel: &C,
    state: &mut HostFrameState,
    timing: TimingSnapshot,
    sink: &mut S,
) -> Result<bool, ChannelError>
where
    C: FrameChannel + ?Sized,
    S: InstructionSink + ?Sized,
{
    // Completions first: everything a counted frame published is then drainable.
    let completed = channel.take_completed_frames();
    let batch = channel.drain_instructions()?;
    if !batch.is_empty() {
        state.batches_presented += 1;
        state.instructions_presented += batch.len() as u64;
        sink.present(timing.frame, batch);
    }
    state.frames += 1;

    if completed == 0 {
        return Ok(false);
    }
    if completed > 1 {
        tracing::warn!(completed, frame = timing.frame, "script completed frames without a turn");
    }

    channel.publish_input(&state.input.snapshot())?;
    state.input.end_frame();
    channel.publish_timing(&timing)?;
    channel.signal_turn();

    state.turns_handed += 1;
    state.last_timing = timing;
    Ok(true)
}

/// Wrap [`run_host_frame`] into a [`FramePacer`](crate::pacer::FramePacer) callback.
///
/// The state is shared so platform event handlers can feed `state.input`
/// between frames. Channel errors are logged; once the channel is disposed the
/// callback does nothing.
pub fn host_frame_callback<C, S>(
    channel: Arc<C>,
    state: Arc<Mutex<HostFrameState>>,
    mut sink: S,
) -> impl FnMut(TimingSnapshot) + Send + 'static
where
    C: FrameChannel + ?Sized + 'static,
    S: InstructionSink + Send + 'static,
{
    move |timing| {
        if channel.is_disposed() {
            return;
        }
        let mut state = state.lock();
        match run_host_frame(channel.as_ref(), &mut state, timing, &mut sink) {
            Ok(_) => {}
            Err(ChannelError::Disposed) => {
                tracing::debug!(frame = timing.frame, "host frame skipped: channel disposed");
            }
            Err(err) => {
                tracing::warn!(frame = timing.frame, error = %err, "host frame failed");
            }
        }
    }
}

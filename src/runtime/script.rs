//! Script engine seam.
//!
//! The supervisor only needs two things from a sandboxed language: load a
//! source once, then run its per-frame entry point and collect the instructions
//! it produced. Engines are built by an [`EngineFactory`] on the isolated thread,
//! so they do not need to be `Send`.

use crate::error::ScriptError;
use crate::types::{DrawInstruction, InputSnapshot, TimingSnapshot};

/// What a script sees for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameInputs {
    pub input: InputSnapshot,
    pub timing: TimingSnapshot,
}

pub trait ScriptEngine {
    /// Parse and bind `source`. Called once per initialize.
    fn load(&mut self, source: &str) -> Result<(), ScriptError>;

    /// Run the per-frame entry point, appending produced instructions to `out`.
    ///
    /// On error, anything already appended is discarded by the caller.
    fn run_frame(&mut self, inputs: &FrameInputs, out: &mut Vec<DrawInstruction>) -> Result<(), ScriptError>;
}

/// Builds a fresh engine for every initialize.
pub type EngineFactory = Box<dyn Fn() -> Box<dyn ScriptEngine> + Send>;

/// An engine whose "script" is a Rust closure. The source text is ignored.
///
/// Useful for hosts that embed native content and for tests.
pub struct NativeScript<F> {
    frame_fn: F,
}

impl<F> NativeScript<F>
where
    F: FnMut(&FrameInputs, &mut Vec<DrawInstruction>) -> Result<(), ScriptError>,
{
    pub fn new(frame_fn: F) -> Self {
        Self { frame_fn }
    }
}

impl<F> ScriptEngine for NativeScript<F>
where
    F: FnMut(&FrameInputs, &mut Vec<DrawInstruction>) -> Result<(), ScriptError>,
{
    fn load(&mut self, _source: &str) -> Result<(), ScriptError> {
        Ok(())
    }

    fn run_frame(&mut self, inputs: &FrameInputs, out: &mut Vec<DrawInstruction>) -> Result<(), ScriptError> {
        (self.frame_fn)(inputs, out)
    }
}

/// Factory for the Rhai engine with the given sandbox limits.
#[cfg(feature = "rhai")]
pub fn rhai_factory(limits: crate::config::ScriptLimits) -> EngineFactory {
    Box::new(move || Box::new(super::rhai_engine::RhaiEngine::new(&limits)))
}

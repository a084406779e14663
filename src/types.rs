//! Shared data model for frameport.
//!
//! Plain value types that cross the boundary between the host context and the
//! isolated script context. Nothing in here knows about transports or threads.
//!
//! - [`DrawInstruction`] flows isolated → host, one ordered batch per frame.
//! - [`InputSnapshot`] and [`TimingSnapshot`] flow host → isolated as
//!   last-write-wins slots.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

// =============================================================================
// Color
// =============================================================================

/// RGBA color with 8-bit channels (0-255).
///
/// Alpha 255 = fully opaque, 0 = fully transparent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    /// Create a new RGBA color.
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Create an opaque RGB color.
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self::new(r, g, b, 255)
    }

    pub const TRANSPARENT: Self = Self::new(0, 0, 0, 0);
    pub const BLACK: Self = Self::rgb(0, 0, 0);
    pub const WHITE: Self = Self::rgb(255, 255, 255);
    pub const RED: Self = Self::rgb(255, 0, 0);
    pub const GREEN: Self = Self::rgb(0, 255, 0);
    pub const BLUE: Self = Self::rgb(0, 0, 255);

    /// Create from packed ARGB u32
    #[inline]
    pub const fn from_packed(packed: u32) -> Self {
        Self {
            r: ((packed >> 16) & 0xFF) as u8,
            g: ((packed >> 8) & 0xFF) as u8,
            b: (packed & 0xFF) as u8,
            a: ((packed >> 24) & 0xFF) as u8,
        }
    }

    /// Pack to ARGB u32
    #[inline]
    pub const fn to_packed(self) -> u32 {
        ((self.a as u32) << 24) | ((self.r as u32) << 16) | ((self.g as u32) << 8) | (self.b as u32)
    }
}

// =============================================================================
// Draw Instructions
// =============================================================================

/// A single drawing command produced by the script.
///
/// The channel never looks inside these; it only moves ordered batches of them.
/// Once sent, the batch belongs to the host for the frame it was received in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DrawInstruction {
    /// Clear the whole surface.
    Clear,
    /// Set the current paint color for subsequent shapes and text.
    SetColor { color: Rgba },
    /// Set the stroke width for subsequent outlines and lines.
    SetLineWidth { width: f32 },
    StrokeRect { x: f32, y: f32, width: f32, height: f32 },
    FillRect { x: f32, y: f32, width: f32, height: f32 },
    StrokeCircle { x: f32, y: f32, radius: f32 },
    FillCircle { x: f32, y: f32, radius: f32 },
    Line { x1: f32, y1: f32, x2: f32, y2: f32 },
    Text { x: f32, y: f32, text: String },
    /// Draw a named image asset. Decoding and caching live with the host.
    DrawImage { image: String, x: f32, y: f32, width: f32, height: f32 },
}

impl DrawInstruction {
    /// Short name of the instruction, as used on the wire and in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Clear => "clear",
            Self::SetColor { .. } => "set_color",
            Self::SetLineWidth { .. } => "set_line_width",
            Self::StrokeRect { .. } => "stroke_rect",
            Self::FillRect { .. } => "fill_rect",
            Self::StrokeCircle { .. } => "stroke_circle",
            Self::FillCircle { .. } => "fill_circle",
            Self::Line { .. } => "line",
            Self::Text { .. } => "text",
            Self::DrawImage { .. } => "draw_image",
        }
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Key identifier.
///
/// Letters and digits use their upper-case ASCII code; named keys use the
/// legacy DOM key codes so hosts can map browser-style input directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(pub u8);

impl Key {
    pub const BACKSPACE: Key = Key(8);
    pub const TAB: Key = Key(9);
    pub const ENTER: Key = Key(13);
    pub const SHIFT: Key = Key(16);
    pub const CONTROL: Key = Key(17);
    pub const ALT: Key = Key(18);
    pub const ESCAPE: Key = Key(27);
    pub const SPACE: Key = Key(32);
    pub const LEFT: Key = Key(37);
    pub const UP: Key = Key(38);
    pub const RIGHT: Key = Key(39);
    pub const DOWN: Key = Key(40);

    /// Key for an ASCII letter, digit or space. Returns `None` for anything else.
    pub fn from_char(c: char) -> Option<Key> {
        match c {
            'a'..='z' => Some(Key(c.to_ascii_uppercase() as u8)),
            'A'..='Z' | '0'..='9' | ' ' => Some(Key(c as u8)),
            _ => None,
        }
    }
}

/// Fixed-width set of [`Key`]s (256 bits).
///
/// Fixed width keeps the input snapshot's shared-memory layout constant.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct KeySet {
    bits: [u64; 4],
}

impl KeySet {
    /// Number of u32 words the set occupies in a shared segment.
    pub const WORDS: usize = 8;

    pub const fn new() -> Self {
        Self { bits: [0; 4] }
    }

    #[inline]
    pub fn insert(&mut self, key: Key) -> bool {
        let (word, bit) = Self::slot(key);
        let was_set = self.bits[word] & bit != 0;
        self.bits[word] |= bit;
        !was_set
    }

    #[inline]
    pub fn remove(&mut self, key: Key) -> bool {
        let (word, bit) = Self::slot(key);
        let was_set = self.bits[word] & bit != 0;
        self.bits[word] &= !bit;
        was_set
    }

    #[inline]
    pub fn contains(&self, key: Key) -> bool {
        let (word, bit) = Self::slot(key);
        self.bits[word] & bit != 0
    }

    pub fn clear(&mut self) {
        self.bits = [0; 4];
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    pub fn len(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterate keys in ascending code order.
    pub fn iter(&self) -> impl Iterator<Item = Key> + '_ {
        (0..=u8::MAX).map(Key).filter(|k| self.contains(*k))
    }

    /// Split into little-endian u32 words for the shared segment.
    pub fn to_words(&self) -> [u32; Self::WORDS] {
        let mut out = [0u32; Self::WORDS];
        for (i, w) in self.bits.iter().enumerate() {
            out[i * 2] = *w as u32;
            out[i * 2 + 1] = (*w >> 32) as u32;
        }
        out
    }

    pub fn from_words(words: &[u32; Self::WORDS]) -> Self {
        let mut bits = [0u64; 4];
        for (i, b) in bits.iter_mut().enumerate() {
            *b = (words[i * 2] as u64) | ((words[i * 2 + 1] as u64) << 32);
        }
        Self { bits }
    }

    #[inline]
    fn slot(key: Key) -> (usize, u64) {
        ((key.0 >> 6) as usize, 1u64 << (key.0 & 63))
    }
}

impl FromIterator<Key> for KeySet {
    fn from_iter<I: IntoIterator<Item = Key>>(iter: I) -> Self {
        let mut set = KeySet::new();
        for key in iter {
            set.insert(key);
        }
        set
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|k| k.0)).finish()
    }
}

// =============================================================================
// Pointer Buttons
// =============================================================================

bitflags! {
    /// Pointer buttons, using the DOM `buttons` bit layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PointerButtons: u32 {
        const PRIMARY = 1 << 0;
        const SECONDARY = 1 << 1;
        const AUXILIARY = 1 << 2;
        const BACK = 1 << 3;
        const FORWARD = 1 << 4;
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Host input state as seen by one script frame.
///
/// The default value is the zero snapshot: empty sets and the pointer at (0, 0).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputSnapshot {
    pub keys_down: KeySet,
    /// Keys that went down since the previous frame.
    pub keys_pressed: KeySet,
    pub pointer_x: f32,
    pub pointer_y: f32,
    pub buttons_down: PointerButtons,
    /// Buttons that went down since the previous frame.
    pub buttons_pressed: PointerButtons,
}

/// Frame timing produced by the pacer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimingSnapshot {
    /// Seconds since the previous frame, clamped to the pacer's ceiling.
    pub delta: f64,
    /// Accumulated delta in seconds.
    pub elapsed: f64,
    pub frame: u64,
}

// =============================================================================
// Roles & States
// =============================================================================

/// Which half of a channel pair an instance represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Host,
    Isolated,
}

impl Role {
    pub fn counterpart(self) -> Role {
        match self {
            Role::Host => Role::Isolated,
            Role::Isolated => Role::Host,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => f.write_str("host"),
            Role::Isolated => f.write_str("isolated"),
        }
    }
}

/// Lifecycle state of the isolated runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Uninitialized,
    Initializing,
    Idle,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeState::Uninitialized => "uninitialized",
            RuntimeState::Initializing => "initializing",
            RuntimeState::Idle => "idle",
            RuntimeState::Running => "running",
            RuntimeState::Stopped => "stopped",
            RuntimeState::Error => "error",
        };
        f.write_str(name)
    }
}

// =============================================================================
// TESTS
// =============================================================================

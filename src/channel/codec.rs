//! Binary encoding for instruction batches in the shared segment.
//!
//! Little-endian records: a u16 tag, a u16 of padding, then the variant's fields.
//! Strings are a u32 byte length followed by UTF-8. Every record is padded to a
//! 4-byte boundary, so batches can be appended to the segment word by word and
//! two encoded batches concatenate into a valid batch.

use crate::error::DecodeError;
use crate::types::{DrawInstruction, Rgba};

/// Record alignment in bytes.
pub const RECORD_ALIGN: usize = 4;

const TAG_CLEAR: u16 = 0x0001;
const TAG_SET_COLOR: u16 = 0x0002;
const TAG_SET_LINE_WIDTH: u16 = 0x0003;
const TAG_STROKE_RECT: u16 = 0x0010;
const TAG_FILL_RECT: u16 = 0x0011;
const TAG_STROKE_CIRCLE: u16 = 0x0012;
const TAG_FILL_CIRCLE: u16 = 0x0013;
const TAG_LINE: u16 = 0x0014;
const TAG_TEXT: u16 = 0x0020;
const TAG_DRAW_IMAGE: u16 = 0x0030;

#[inline]
pub fn align_up(len: usize, align: usize) -> usize {
    len.div_ceil(align) * align
}

pub fn encode_batch(batch: &[DrawInstruction]) -> Vec<u8> {
    let mut out = Vec::with_capacity(batch.len() * 20);
    for instruction in batch {
        encode_instruction_into(instruction, &mut out);
    }
    out
}

pub fn encode_instruction_into(instruction: &DrawInstruction, out: &mut Vec<u8>) {
    match instruction {
        DrawInstruction::Clear => {
            push_tag(out, TAG_CLEAR);
        }
        DrawInstruction::SetColor { color } => {
            push_tag(out, TAG_SET_COLOR);
            push_u32(out, color.to_packed());
        }
        DrawInstruction::SetLineWidth { width } => {
            push_tag(out, TAG_SET_LINE_WIDTH);
            push_f32(out, *width);
        }
        DrawInstruction::StrokeRect { x, y, width, height } => {
            push_tag(out, TAG_STROKE_RECT);
            push_f32s(out, &[*x, *y, *width, *height]);
        }
        DrawInstruction::FillRect { x, y, width, height } => {
            push_tag(out, TAG_FILL_RECT);
            push_f32s(out, &[*x, *y, *width, *height]);
        }
        DrawInstruction::StrokeCircle { x, y, radius } => {
            push_tag(out, TAG_STROKE_CIRCLE);
            push_f32s(out, &[*x, *y, *radius]);
        }
        DrawInstruction::FillCircle { x, y, radius } => {
            push_tag(out, TAG_FILL_CIRCLE);
            push_f32s(out, &[*x, *y, *radius]);
        }
        DrawInstruction::Line { x1, y1, x2, y2 } => {
            push_tag(out, TAG_LINE);
            push_f32s(out, &[*x1, *y1, *x2, *y2]);
        }
        DrawInstruction::Text { x, y, text } => {
            push_tag(out, TAG_TEXT);
            push_f32s(out, &[*x, *y]);
            push_str(out, text);
        }
        DrawInstruction::DrawImage { image, x, y, width, height } => {
            push_tag(out, TAG_DRAW_IMAGE);
            push_f32s(out, &[*x, *y, *width, *height]);
            push_str(out, image);
        }
    }
    out.resize(align_up(out.len(), RECORD_ALIGN), 0);
}

/// Decode a whole batch. Trailing zero padding after the last record is not allowed.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<DrawInstruction>, DecodeError> {
    let mut r = Reader::new(bytes);
    let mut out = Vec::new();
    while r.remaining() > 0 {
        out.push(decode_instruction(&mut r)?);
        r.align(RECORD_ALIGN)?;
    }
    Ok(out)
}

fn decode_instruction(r: &mut Reader<'_>) -> Result<DrawInstruction, DecodeError> {
    let tag = r.read_u16()?;
    r.read_u16()?;
    let instruction = match tag {
        TAG_CLEAR => DrawInstruction::Clear,
        TAG_SET_COLOR => DrawInstruction::SetColor {
            color: Rgba::from_packed(r.read_u32()?),
        },
        TAG_SET_LINE_WIDTH => DrawInstruction::SetLineWidth { width: r.read_f32()? },
        TAG_STROKE_RECT => DrawInstruction::StrokeRect {
            x: r.read_f32()?,
            y: r.read_f32()?,
            width: r.read_f32()?,
            height: r.read_f32()?,
        },
        TAG_FILL_RECT => DrawInstruction::FillRect {
            x: r.read_f32()?,
            y: r.read_f32()?,
            width: r.read_f32()?,
            height: r.read_f32()?,
        },
        TAG_STROKE_CIRCLE => DrawInstruction::StrokeCircle {
            x: r.read_f32()?,
            y: r.read_f32()?,
            radius: r.read_f32()?,
        },
        TAG_FILL_CIRCLE => DrawInstruction::FillCircle {
            x: r.read_f32()?,
            y: r.read_f32()?,
            radius: r.read_f32()?,
        },
        TAG_LINE => DrawInstruction::Line {
            x1: r.read_f32()?,
            y1: r.read_f32()?,
            x2: r.read_f32()?,
            y2: r.read_f32()?,
        },
        TAG_TEXT => {
            let x = r.read_f32()?;
            let y = r.read_f32()?;
            let text = r.read_str()?;
            DrawInstruction::Text { x, y, text }
        }
        TAG_DRAW_IMAGE => {
            let x = r.read_f32()?;
            let y = r.read_f32()?;
            let width = r.read_f32()?;
            let height = r.read_f32()?;
            let image = r.read_str()?;
            DrawInstruction::DrawImage { image, x, y, width, height }
        }
        other => return Err(DecodeError::UnknownTag(other)),
    };
    Ok(instruction)
}

fn push_tag(out: &mut Vec<u8>, tag: u16) {
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&[0, 0]);
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_f32s(out: &mut Vec<u8>, values: &[f32]) {
    for v in values {
        push_f32(out, *v);
    }
}

fn push_str(out: &mut Vec<u8>, s: &str) {
    push_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn align(&mut self, align: usize) -> Result<(), DecodeError> {
        let next = align_up(self.pos, align);
        if next > self.bytes.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        self.pos = next;
        Ok(())
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_f32(&mut self) -> Result<f32, DecodeError> {
        self.read_u32().map(f32::from_bits)
    }

    fn read_str(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        core::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }
}

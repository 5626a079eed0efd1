//! Typed frame readers built on top of `protocol::frame`.
//!
//! `FrameCursor` plays the role a `Cursor<&[u8]>`-based `decode_u8`/
//! `decode_u32`/... helper set plays for a single fixed-size PDU, but over
//! a *sequence* of independently-sized frames —
//! the shape spec.md section 4.1 describes ("receive-next-frame",
//! "expect-more", "parse-u32/u64 with optional default", "parse-range",
//! "parse-key-value pairs", "parse-string-map").

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::protocol::frame::Frame;

/// Consumes frames of an already-received message in order.
pub struct FrameCursor {
    frames: VecDeque<Frame>,
}

impl FrameCursor {
    pub fn new(frames: Vec<Frame>) -> Self {
        FrameCursor {
            frames: frames.into(),
        }
    }

    /// Pops the next frame, if any remain.
    pub fn next_frame(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    /// Like `next_frame`, but errors if the message ended early.
    pub fn require_frame(&mut self, context: &'static str) -> Result<Frame, ProtocolError> {
        self.next_frame()
            .ok_or(ProtocolError::ExpectedMoreFrames(context))
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Parses a little-endian u32 frame. An empty frame yields `default`
    /// ("use default" per section 6).
    pub fn parse_u32(&mut self, context: &'static str, default: u32) -> Result<u32, ProtocolError> {
        let frame = self.require_frame(context)?;
        if frame.is_empty() {
            return Ok(default);
        }
        if frame.data.len() != 4 {
            return Err(ProtocolError::UnexpectedFrameSize {
                context,
                expected: 4,
                actual: frame.data.len(),
            });
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&frame.data);
        Ok(u32::from_le_bytes(buf))
    }

    /// Parses a little-endian u64 frame. An empty frame yields `default`.
    pub fn parse_u64(&mut self, context: &'static str, default: u64) -> Result<u64, ProtocolError> {
        let frame = self.require_frame(context)?;
        if frame.is_empty() {
            return Ok(default);
        }
        if frame.data.len() != 8 {
            return Err(ProtocolError::UnexpectedFrameSize {
                context,
                expected: 8,
                actual: frame.data.len(),
            });
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&frame.data);
        Ok(u64::from_le_bytes(buf))
    }

    /// Parses a single raw byte-string frame (e.g. a key or table-id-less
    /// opaque value).
    pub fn parse_bytes(&mut self, context: &'static str) -> Result<Bytes, ProtocolError> {
        Ok(self.require_frame(context)?.data)
    }

    /// Parses a range: two consecutive frames, either possibly empty (=
    /// unbounded on that side).
    pub fn parse_range(&mut self) -> Result<(Bytes, Bytes), ProtocolError> {
        let start = self.require_frame("range start")?.data;
        let end = self.require_frame("range end")?.data;
        Ok((start, end))
    }

    /// Drains all remaining frames as `(key, value)` pairs. Errors if an odd
    /// number of frames remains (an unpaired key).
    pub fn parse_key_value_pairs(&mut self) -> Result<Vec<(Bytes, Bytes)>, ProtocolError> {
        let mut pairs = Vec::new();
        while let Some(key) = self.next_frame() {
            let value = self
                .next_frame()
                .ok_or(ProtocolError::UnpairedKeyValue)?;
            pairs.push((key.data, value.data));
        }
        Ok(pairs)
    }

    /// Drains all remaining frames as a flat list (e.g. a list of keys for
    /// Read/Exists/Delete).
    pub fn parse_remaining(&mut self) -> Vec<Bytes> {
        self.frames.drain(..).map(|f| f.data).collect()
    }

    /// Drains all remaining frames as alternating UTF-8 key/value strings —
    /// the table-open options map.
    pub fn parse_string_map(&mut self) -> Result<HashMap<String, String>, ProtocolError> {
        let mut map = HashMap::new();
        while let Some(key) = self.next_frame() {
            let value = self
                .next_frame()
                .ok_or(ProtocolError::UnpairedKeyValue)?;
            let key = String::from_utf8(key.data.to_vec())?;
            let value = String::from_utf8(value.data.to_vec())?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Wire framing: a fixed 42-byte header followed by an exact-length payload.
//! Stateless encode/decode, no I/O performed here (see `transport`).

use anyhow::{bail, Result};

pub const HEADER_LEN: usize = 42;
pub const IMAGE_ID_LEN: usize = 37; // 36 chars + nul
pub const FILENAME_LEN: usize = 256;
pub const FORMAT_LEN: usize = 10;

pub const DEFAULT_PORT: u16 = 1717;
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Hello = 1,
    ImageIdRequest = 2, // reserved, never emitted
    ImageIdResponse = 3,
    ImageInfo = 4,
    ImageChunk = 5,
    ImageComplete = 6,
    Ack = 7,
    Error = 8,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        use MessageType::*;
        Some(match b {
            1 => Hello,
            2 => ImageIdRequest,
            3 => ImageIdResponse,
            4 => ImageInfo,
            5 => ImageChunk,
            6 => ImageComplete,
            7 => Ack,
            8 => Error,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingType {
    Histogram = 1,
    Color = 2,
    Both = 3,
}

impl ProcessingType {
    /// Out-of-range values coerce to `Both`, per the connection handler's validation duties.
    pub fn from_u8(b: u8) -> Self {
        match b {
            1 => ProcessingType::Histogram,
            2 => ProcessingType::Color,
            _ => ProcessingType::Both,
        }
    }

    pub fn wants_histogram(self) -> bool {
        matches!(self, ProcessingType::Histogram | ProcessingType::Both)
    }

    pub fn wants_color(self) -> bool {
        matches!(self, ProcessingType::Color | ProcessingType::Both)
    }
}

/// A 42-byte framing header. `image_id` is always a fixed 37-byte array on
/// the wire, zero-padded, with a forced terminating zero at index 36.
#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    pub msg_type: u8,
    pub length: u32,
    pub image_id: [u8; IMAGE_ID_LEN],
}

impl MessageHeader {
    pub fn new(msg_type: MessageType, length: u32, image_id: &str) -> Self {
        let mut id = [0u8; IMAGE_ID_LEN];
        let bytes = image_id.as_bytes();
        let n = bytes.len().min(IMAGE_ID_LEN - 1);
        id[..n].copy_from_slice(&bytes[..n]);
        MessageHeader { msg_type: msg_type as u8, length, image_id: id }
    }

    pub fn without_id(msg_type: MessageType, length: u32) -> Self {
        MessageHeader { msg_type: msg_type as u8, length, image_id: [0u8; IMAGE_ID_LEN] }
    }

    pub fn image_id_str(&self) -> String {
        let end = self.image_id.iter().position(|&b| b == 0).unwrap_or(IMAGE_ID_LEN - 1);
        String::from_utf8_lossy(&self.image_id[..end]).into_owned()
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.msg_type;
        buf[1..5].copy_from_slice(&self.length.to_be_bytes());
        buf[5..5 + IMAGE_ID_LEN].copy_from_slice(&self.image_id);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        let msg_type = buf[0];
        let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let mut image_id = [0u8; IMAGE_ID_LEN];
        image_id.copy_from_slice(&buf[5..5 + IMAGE_ID_LEN]);
        image_id[IMAGE_ID_LEN - 1] = 0;
        MessageHeader { msg_type, length, image_id }
    }
}

/// Payload of the `IMAGE_INFO` frame.
pub struct ImageInfo {
    pub filename: String,
    pub total_size: u32,
    pub total_chunks: u32,
    pub processing_type: u8,
    pub format: String,
}

pub const IMAGE_INFO_LEN: usize = FILENAME_LEN + 4 + 4 + 1 + FORMAT_LEN;

impl ImageInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(IMAGE_INFO_LEN);
        let mut filename = [0u8; FILENAME_LEN];
        copy_truncated(&mut filename, self.filename.as_bytes());
        buf.extend_from_slice(&filename);
        buf.extend_from_slice(&self.total_size.to_be_bytes());
        buf.extend_from_slice(&self.total_chunks.to_be_bytes());
        buf.push(self.processing_type);
        let mut format = [0u8; FORMAT_LEN];
        copy_truncated(&mut format, self.format.as_bytes());
        buf.extend_from_slice(&format);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != IMAGE_INFO_LEN {
            bail!("ImageInfo payload has wrong length: {} (expected {})", buf.len(), IMAGE_INFO_LEN);
        }
        let filename = nul_terminated_string(&buf[0..FILENAME_LEN]);
        let total_size = u32::from_be_bytes(buf[256..260].try_into().unwrap());
        let total_chunks = u32::from_be_bytes(buf[260..264].try_into().unwrap());
        let processing_type = buf[264];
        let format = nul_terminated_string(&buf[265..265 + FORMAT_LEN]);
        Ok(ImageInfo { filename, total_size, total_chunks, processing_type, format })
    }
}

fn copy_truncated(dst: &mut [u8], src: &[u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
}

fn nul_terminated_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Strips any path separators so a client-supplied filename cannot escape
/// the configured output directories.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .to_string()
}

// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! TCP framing codec for worker requests and replies.
//!
//! Wire format (11 bytes overhead):
//! ```text
//! [u16 BE: schema_version][u8: frame_type][u32 BE: header_len][u32 BE: payload_len][header bytes][payload bytes]
//! ```
//!
//! The header is a MessagePack-encoded [`RequestHeader`] or [`ResponseHeader`];
//! the payload is the opaque op input or output. Decoding yields header and
//! payload as zero-copy slices of the receive buffer.

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::codec::Decoder;

use crate::transport::{RemoteRequest, TransportError};

/// Current schema version
const SCHEMA_VERSION_V1: u16 = 1;

/// Maximum frame size (16 MB)
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Frame preamble size (version + type + 2 lengths)
const PREAMBLE_SIZE: usize = 2 + 1 + 4 + 4;

/// Kind of frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Request = 0,
    Response = 1,
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameType::Request),
            1 => Some(FrameType::Response),
            _ => None,
        }
    }
}

/// Header of a request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Per-connection id echoed by the reply.
    pub correlation: u64,
    pub request: RemoteRequest,
}

/// Header of a response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub correlation: u64,
    /// Worker-side failure; `None` means the payload is the result.
    pub error: Option<String>,
}

pub fn encode_header<T: Serialize>(header: &T) -> Result<Vec<u8>, TransportError> {
    rmp_serde::to_vec_named(header).map_err(|e| TransportError::Codec(e.to_string()))
}

pub fn decode_header<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, TransportError> {
    rmp_serde::from_slice(bytes).map_err(|e| TransportError::Codec(e.to_string()))
}

/// Frame decoder; also builds outgoing frames.
///
/// The decoder keeps state across calls to support partial frame reception.
#[derive(Debug, Clone)]
pub struct TcpFrameCodec {
    state: DecodeState,
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    /// Waiting for the preamble
    AwaitingPreamble,
    /// Waiting for header + payload, with known lengths
    AwaitingData {
        frame_type: FrameType,
        header_len: u32,
        payload_len: u32,
    },
}

impl TcpFrameCodec {
    pub fn new() -> Self {
        Self {
            state: DecodeState::AwaitingPreamble,
        }
    }

    /// Build the fixed-size preamble for a frame.
    #[inline]
    pub fn build_preamble(
        frame_type: FrameType,
        header_len: u32,
        payload_len: u32,
    ) -> io::Result<[u8; PREAMBLE_SIZE]> {
        Self::validate_lengths(header_len, payload_len)?;

        let mut preamble = [0u8; PREAMBLE_SIZE];
        preamble[0..2].copy_from_slice(&SCHEMA_VERSION_V1.to_be_bytes());
        preamble[2] = frame_type.as_u8();
        preamble[3..7].copy_from_slice(&header_len.to_be_bytes());
        preamble[7..11].copy_from_slice(&payload_len.to_be_bytes());
        Ok(preamble)
    }

    /// Encode a complete frame into one contiguous buffer, ready to hand to a
    /// writer task.
    pub fn encode_frame(frame_type: FrameType, header: &[u8], payload: &[u8]) -> io::Result<Bytes> {
        let header_len = u32::try_from(header.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Header too large"))?;
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Payload too large"))?;
        let preamble = Self::build_preamble(frame_type, header_len, payload_len)?;

        let mut buf = BytesMut::with_capacity(PREAMBLE_SIZE + header.len() + payload.len());
        buf.extend_from_slice(&preamble);
        buf.extend_from_slice(header);
        buf.extend_from_slice(payload);
        Ok(buf.freeze())
    }

    fn validate_lengths(header_len: u32, payload_len: u32) -> io::Result<()> {
        let total_len = header_len
            .checked_add(payload_len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Frame size overflow"))?;

        if total_len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Frame size {} exceeds maximum {}", total_len, MAX_FRAME_SIZE),
            ));
        }
        Ok(())
    }
}

impl Default for TcpFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TcpFrameCodec {
    type Item = (FrameType, Bytes, Bytes);
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::AwaitingPreamble => {
                    if src.len() < PREAMBLE_SIZE {
                        return Ok(None);
                    }

                    let schema_version = u16::from_be_bytes([src[0], src[1]]);
                    let frame_type_byte = src[2];
                    let header_len = u32::from_be_bytes([src[3], src[4], src[5], src[6]]);
                    let payload_len = u32::from_be_bytes([src[7], src[8], src[9], src[10]]);

                    if schema_version != SCHEMA_VERSION_V1 {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!(
                                "Unsupported schema version: {} (expected {})",
                                schema_version, SCHEMA_VERSION_V1
                            ),
                        ));
                    }

                    let frame_type = FrameType::from_u8(frame_type_byte).ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("Invalid frame type: {}", frame_type_byte),
                        )
                    })?;

                    // Validate lengths before waiting for the body
                    Self::validate_lengths(header_len, payload_len)?;

                    src.advance(PREAMBLE_SIZE);
                    self.state = DecodeState::AwaitingData {
                        frame_type,
                        header_len,
                        payload_len,
                    };
                }

                DecodeState::AwaitingData {
                    frame_type,
                    header_len,
                    payload_len,
                } => {
                    let total_data_len = (header_len + payload_len) as usize;
                    if src.len() < total_data_len {
                        src.reserve(total_data_len - src.len());
                        return Ok(None);
                    }

                    let header = src.split_to(header_len as usize).freeze();
                    let payload = src.split_to(payload_len as usize).freeze();
                    self.state = DecodeState::AwaitingPreamble;

                    return Ok(Some((frame_type, header, payload)));
                }
            }
        }
    }
}

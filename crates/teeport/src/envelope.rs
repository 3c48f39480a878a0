// SPDX-License-Identifier: Apache-2.0

//! The client-facing request envelope.
//!
//! Client applications talk to the service layer through byte buffers
//! carrying a fixed header followed by payload. A request buffer starts
//! with a [`RequestHeader`]; every buffer the service hands back starts
//! with a [`ResponseHeader`].

use crate::{Result, TeeError};

use core::mem::size_of;

/// What a request buffer carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestKind {
    /// Submit a new command to the trusted application.
    Command = 0,
    /// Answer an out-call previously surfaced to the application.
    OcallReply = 1,
}

impl TryFrom<u32> for RequestKind {
    type Error = TeeError;

    fn try_from(kind: u32) -> Result<Self> {
        match kind {
            0 => Ok(Self::Command),
            1 => Ok(Self::OcallReply),
            _ => Err(TeeError::BadParameters),
        }
    }
}

/// What a completed buffer carries back to the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseKind {
    /// The submitted command finished; the payload is its output.
    CommandCompleted = 0,
    /// The secure side issued an out-call; the payload is its input and
    /// the application must answer with an [`RequestKind::OcallReply`].
    OcallRequest = 1,
}

/// Header at the front of every request buffer.
///
/// `input_len`/`output_len` describe the payload sizes the request uses,
/// which may be smaller than the buffers carrying them; declared sizes
/// exceeding the actual buffers are rejected before any processing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RequestHeader {
    pub key: u32,
    pub kind: u32,
    pub input_len: u64,
    pub output_len: u64,
}

impl RequestHeader {
    pub const SIZE: usize = size_of::<Self>();

    pub fn new(key: u32, kind: RequestKind, input_len: u64, output_len: u64) -> Self {
        Self {
            key,
            kind: kind as u32,
            input_len,
            output_len,
        }
    }

    pub fn kind(&self) -> Result<RequestKind> {
        RequestKind::try_from(self.kind)
    }

    /// Parses the header off the front of a request buffer. Fails with
    /// [`TeeError::ShortBuffer`] if the buffer cannot hold a header at
    /// all.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(TeeError::ShortBuffer);
        }
        Ok(Self {
            key: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            kind: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            input_len: u64::from_le_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
            output_len: u64::from_le_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        })
    }

    pub fn emit(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.key.to_le_bytes());
        buf[4..8].copy_from_slice(&self.kind.to_le_bytes());
        buf[8..16].copy_from_slice(&self.input_len.to_le_bytes());
        buf[16..24].copy_from_slice(&self.output_len.to_le_bytes());
    }
}

/// Header at the front of every buffer completed back to the application.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ResponseHeader {
    pub kind: u32,
    pub rpc_type: u32,
}

impl ResponseHeader {
    pub const SIZE: usize = size_of::<Self>();

    pub fn new(kind: ResponseKind, rpc_type: u32) -> Self {
        Self {
            kind: kind as u32,
            rpc_type,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(TeeError::ShortBuffer);
        }
        Ok(Self {
            kind: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            rpc_type: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    pub fn emit(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.kind.to_le_bytes());
        buf[4..8].copy_from_slice(&self.rpc_type.to_le_bytes());
    }
}

/// Upper bound on the payload of one out-call surfaced to the
/// application.
pub const MAX_OCALL_INPUT: usize = 0x1_0000;

#[cfg(test)]
mod tests {
    use super::*;

    use testaso::testaso;

    testaso! {
        struct RequestHeader: 8, 24 => {
            key: 0,
            kind: 4,
            input_len: 8,
            output_len: 16
        }

        struct ResponseHeader: 4, 8 => {
            kind: 0,
            rpc_type: 4
        }
    }

    #[test]
    fn request_round_trip() {
        let header = RequestHeader::new(7, RequestKind::Command, 100, 200);
        let mut buf = [0u8; RequestHeader::SIZE];
        header.emit(&mut buf);
        assert_eq!(RequestHeader::parse(&buf), Ok(header));
        assert_eq!(header.kind(), Ok(RequestKind::Command));
    }

    #[test]
    fn short_buffer() {
        assert_eq!(
            RequestHeader::parse(&[0u8; RequestHeader::SIZE - 1]),
            Err(TeeError::ShortBuffer)
        );
        assert_eq!(ResponseHeader::parse(&[0u8; 4]), Err(TeeError::ShortBuffer));
    }

    #[test]
    fn bad_kind() {
        let header = RequestHeader {
            kind: 2,
            ..Default::default()
        };
        assert_eq!(header.kind(), Err(TeeError::BadParameters));
    }
}

// SPDX-License-Identifier: Apache-2.0

//! Replay-protected-storage proxy.
//!
//! The secure side speaks the RPMB frame protocol; the actual device
//! access belongs to an external collaborator behind [`RpmbDevice`].
//! This module translates between the frames in shared buffers and typed
//! collaborator calls, staging each sub-command through its own scratch
//! copies so the shared buffers are only touched at the edges.

use crate::TeeError;

use teeport::rpc::{
    RpmbFrame, RpmbRequest, RPMB_CID_SIZE, RPMB_MSG_AUTHENTICATED_READ,
    RPMB_MSG_AUTHENTICATED_WRITE, RPMB_MSG_PROGRAM_KEY, RPMB_MSG_WRITE_COUNTER,
};
use tracing::{trace, warn};

/// Device geometry and identity reported to the secure side.
#[derive(Clone, Copy, Debug, Default)]
pub struct RpmbDeviceInfo {
    /// Card identification register.
    pub cid: [u8; RPMB_CID_SIZE],
    /// Partition size in 128 KiB units.
    pub size_mult: u8,
    /// Reliable write sector count.
    pub rel_wr_sec_c: u8,
}

/// The external storage-access collaborator.
pub trait RpmbDevice: Send + Sync {
    /// Programs the authentication key; returns the device's result
    /// frame.
    fn program_key(&self, request: &RpmbFrame) -> Result<RpmbFrame, TeeError>;

    /// Queries the write counter; returns the device's result frame.
    fn read_counter(&self, request: &RpmbFrame) -> Result<RpmbFrame, TeeError>;

    /// Performs an authenticated write of one or more frames; returns
    /// the device's result frame.
    fn write_blocks(&self, request: &[RpmbFrame]) -> Result<RpmbFrame, TeeError>;

    /// Performs an authenticated read of `count` frames.
    fn read_blocks(&self, request: &RpmbFrame, count: usize) -> Result<Vec<RpmbFrame>, TeeError>;

    /// Reports device identity and geometry.
    fn info(&self) -> Result<RpmbDeviceInfo, TeeError>;
}

/// Services a data request: `input` holds the frames following the
/// [`RpmbRequest`] header, `output` receives the response frames.
/// Returns the number of bytes written to `output`.
pub(super) fn data_request(
    device: &dyn RpmbDevice,
    header: &RpmbRequest,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize, TeeError> {
    let request = read_frame(input, 0)?;
    let msg_type = request.msg_type();
    trace!(msg_type, "storage proxy data request");

    match msg_type {
        RPMB_MSG_PROGRAM_KEY => {
            let result = device.program_key(&request)?;
            write_frames(output, &[result])
        }
        RPMB_MSG_WRITE_COUNTER => {
            let result = device.read_counter(&request)?;
            write_frames(output, &[result])
        }
        RPMB_MSG_AUTHENTICATED_WRITE => {
            // The frame itself carries the count for writes.
            let count = request.block_count() as usize;
            let mut frames = Vec::with_capacity(count);
            for index in 0..count {
                frames.push(read_frame(input, index)?);
            }
            let result = device.write_blocks(&frames)?;
            write_frames(output, &[result])
        }
        RPMB_MSG_AUTHENTICATED_READ => {
            // The request header carries the count for reads.
            let count = header.block_count as usize;
            let frames = device.read_blocks(&request, count)?;
            if frames.len() != count {
                warn!(
                    want = count,
                    got = frames.len(),
                    "storage collaborator returned a short read"
                );
                return Err(TeeError::Generic);
            }
            write_frames(output, &frames)
        }
        _ => Err(TeeError::BadParameters),
    }
}

fn read_frame(input: &[u8], index: usize) -> Result<RpmbFrame, TeeError> {
    let start = index * RpmbFrame::SIZE;
    let end = start + RpmbFrame::SIZE;
    if input.len() < end {
        return Err(TeeError::BadParameters);
    }
    let mut bytes = [0u8; RpmbFrame::SIZE];
    bytes.copy_from_slice(&input[start..end]);
    Ok(RpmbFrame::from_bytes(bytes))
}

fn write_frames(output: &mut [u8], frames: &[RpmbFrame]) -> Result<usize, TeeError> {
    let len = frames.len() * RpmbFrame::SIZE;
    if output.len() < len {
        return Err(TeeError::ShortBuffer);
    }
    for (index, frame) in frames.iter().enumerate() {
        output[index * RpmbFrame::SIZE..][..RpmbFrame::SIZE].copy_from_slice(&frame.to_bytes());
    }
    Ok(len)
}

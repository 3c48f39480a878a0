// SPDX-License-Identifier: Apache-2.0

//! The generic-command sub-protocol.
//!
//! When the monitor returns [`crate::smc::RpcFunc::Cmd`], the registers
//! point at a secondary argument block whose [`crate::arg::Arg::cmd`]
//! field carries one of the [`RpcCmd`] identifiers below, with its own
//! parameter list. These definitions are kept in sync with the secure
//! side's supplicant protocol.

use crate::{Result, TeeError};

/// Generic-command identifiers.
///
/// `Fs`, `SqlFs`, `Gprof` and `Socket` are carried for protocol
/// completeness; the normal world answers them with
/// [`TeeError::NotImplemented`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum RpcCmd {
    LoadTa = 0,
    Rpmb = 1,
    Fs = 2,
    GetTime = 3,
    WaitQueue = 4,
    Suspend = 5,
    ShmAlloc = 6,
    ShmFree = 7,
    SqlFs = 8,
    Gprof = 9,
    Socket = 10,
    Ocall = 11,
}

impl TryFrom<u32> for RpcCmd {
    type Error = TeeError;

    fn try_from(cmd: u32) -> Result<Self> {
        match cmd {
            cmd if cmd == Self::LoadTa as u32 => Ok(Self::LoadTa),
            cmd if cmd == Self::Rpmb as u32 => Ok(Self::Rpmb),
            cmd if cmd == Self::Fs as u32 => Ok(Self::Fs),
            cmd if cmd == Self::GetTime as u32 => Ok(Self::GetTime),
            cmd if cmd == Self::WaitQueue as u32 => Ok(Self::WaitQueue),
            cmd if cmd == Self::Suspend as u32 => Ok(Self::Suspend),
            cmd if cmd == Self::ShmAlloc as u32 => Ok(Self::ShmAlloc),
            cmd if cmd == Self::ShmFree as u32 => Ok(Self::ShmFree),
            cmd if cmd == Self::SqlFs as u32 => Ok(Self::SqlFs),
            cmd if cmd == Self::Gprof as u32 => Ok(Self::Gprof),
            cmd if cmd == Self::Socket as u32 => Ok(Self::Socket),
            cmd if cmd == Self::Ocall as u32 => Ok(Self::Ocall),
            _ => Err(TeeError::NotImplemented),
        }
    }
}

/// Wait-queue operation, the first value word of a
/// [`RpcCmd::WaitQueue`] command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum WaitQueueOp {
    Sleep = 0,
    Wakeup = 1,
}

impl TryFrom<u64> for WaitQueueOp {
    type Error = TeeError;

    fn try_from(op: u64) -> Result<Self> {
        match op {
            0 => Ok(Self::Sleep),
            1 => Ok(Self::Wakeup),
            _ => Err(TeeError::BadParameters),
        }
    }
}

/// Shared-memory usage kind for [`RpcCmd::ShmAlloc`]/[`RpcCmd::ShmFree`].
/// A closed set: any other value is a protocol error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum ShmKind {
    /// Shareable with a non-secure user-space application.
    Application = 0,
    /// Only shared with the non-secure kernel.
    Kernel = 1,
    /// Alias of `Application` kept for cross-OS protocol compatibility.
    Host = 3,
}

impl TryFrom<u64> for ShmKind {
    type Error = TeeError;

    fn try_from(kind: u64) -> Result<Self> {
        match kind {
            0 => Ok(Self::Application),
            1 => Ok(Self::Kernel),
            3 => Ok(Self::Host),
            _ => Err(TeeError::BadParameters),
        }
    }
}

/// Replay-protected-storage sub-command, [`RpmbRequest::cmd`].
pub const RPMB_CMD_DATA_REQUEST: u16 = 0;
pub const RPMB_CMD_GET_DEV_INFO: u16 = 1;

/// Device-info result codes, [`RpmbDevInfo::ret_code`].
pub const RPMB_DEV_INFO_OK: u8 = 0;
pub const RPMB_DEV_INFO_ERROR: u8 = 1;

/// RPMB frame message types, big-endian in [`RpmbFrame::msg_type`].
pub const RPMB_MSG_PROGRAM_KEY: u16 = 0x0001;
pub const RPMB_MSG_WRITE_COUNTER: u16 = 0x0002;
pub const RPMB_MSG_AUTHENTICATED_WRITE: u16 = 0x0003;
pub const RPMB_MSG_AUTHENTICATED_READ: u16 = 0x0004;

/// Request header at the head of a [`RpcCmd::Rpmb`] input buffer; the
/// data frames follow directly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RpmbRequest {
    pub cmd: u16,
    pub dev_id: u16,
    pub block_count: u16,
}

/// One 512-byte replay-protected-storage data frame. All multi-byte
/// fields are big-endian on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct RpmbFrame {
    pub stuff: [u8; 196],
    pub key_mac: [u8; 32],
    pub data: [u8; 256],
    pub nonce: [u8; 16],
    pub write_counter: [u8; 4],
    pub address: [u8; 2],
    pub block_count: [u8; 2],
    pub op_result: [u8; 2],
    pub msg_type: [u8; 2],
}

impl Default for RpmbFrame {
    fn default() -> Self {
        Self {
            stuff: [0; 196],
            key_mac: [0; 32],
            data: [0; 256],
            nonce: [0; 16],
            write_counter: [0; 4],
            address: [0; 2],
            block_count: [0; 2],
            op_result: [0; 2],
            msg_type: [0; 2],
        }
    }
}

impl RpmbFrame {
    pub const SIZE: usize = 512;

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        // SAFETY: the frame is exactly 512 bytes of `u8` arrays with no
        // padding, valid for all bit patterns.
        unsafe { core::mem::transmute(bytes) }
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        // SAFETY: as in `from_bytes`.
        unsafe { core::mem::transmute(self) }
    }

    pub fn msg_type(&self) -> u16 {
        u16::from_be_bytes(self.msg_type)
    }

    pub fn set_msg_type(&mut self, msg_type: u16) {
        self.msg_type = msg_type.to_be_bytes();
    }

    pub fn block_count(&self) -> u16 {
        u16::from_be_bytes(self.block_count)
    }
}

/// Size of the eMMC card identification register.
pub const RPMB_CID_SIZE: usize = 16;

/// Device-info reply written into the output buffer of a
/// [`RPMB_CMD_GET_DEV_INFO`] request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RpmbDevInfo {
    pub cid: [u8; RPMB_CID_SIZE],
    /// Partition size in 128 KiB units.
    pub rpmb_size_mult: u8,
    /// Reliable write sector count.
    pub rel_wr_sec_c: u8,
    pub ret_code: u8,
}

// SPDX-License-Identifier: Apache-2.0

//! The argument block passed to the secure world.
//!
//! An [`Arg`] header followed by [`Arg::num_params`] × [`Param`] slots is
//! written into memory both worlds can address and handed to the monitor
//! by physical address. The secure side may only rewrite `ret`,
//! `ret_origin` and the output halves of the parameter slots.

use crate::{Result, TeeError};

use bitflags::bitflags;

/// Operation selector, [`Arg::cmd`].
pub const CMD_OPEN_SESSION: u32 = 0;
pub const CMD_INVOKE_COMMAND: u32 = 1;
pub const CMD_CLOSE_SESSION: u32 = 2;
pub const CMD_CANCEL: u32 = 3;

/// Login method carried in the second open-session meta parameter. Only
/// the public (anonymous) login is supported.
pub const LOGIN_PUBLIC: u64 = 0;

/// Argument block header.
///
/// `session` is an input for every command except open-session, where the
/// secure side writes the newly assigned session id into it instead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Arg {
    pub cmd: u32,
    pub func: u32,
    pub session: u32,
    pub cancel_id: u32,
    pub pad: u32,
    pub ret: u32,
    pub ret_origin: u32,
    pub num_params: u32,
}

/// Size in bytes of an argument block carrying `num_params` parameters.
pub const fn arg_size(num_params: usize) -> usize {
    core::mem::size_of::<Arg>() + num_params * core::mem::size_of::<Param>()
}

/// Parameter slot type codes, the low byte of [`Param::attr`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AttrType {
    None = 0x0,
    ValueInput = 0x1,
    ValueOutput = 0x2,
    ValueInout = 0x3,
    RmemInput = 0x5,
    RmemOutput = 0x6,
    RmemInout = 0x7,
    TmemInput = 0x9,
    TmemOutput = 0xa,
    TmemInout = 0xb,
}

impl TryFrom<u32> for AttrType {
    type Error = TeeError;

    fn try_from(attr: u32) -> Result<Self> {
        match attr & ATTR_TYPE_MASK {
            t if t == Self::None as u32 => Ok(Self::None),
            t if t == Self::ValueInput as u32 => Ok(Self::ValueInput),
            t if t == Self::ValueOutput as u32 => Ok(Self::ValueOutput),
            t if t == Self::ValueInout as u32 => Ok(Self::ValueInout),
            t if t == Self::RmemInput as u32 => Ok(Self::RmemInput),
            t if t == Self::RmemOutput as u32 => Ok(Self::RmemOutput),
            t if t == Self::RmemInout as u32 => Ok(Self::RmemInout),
            t if t == Self::TmemInput as u32 => Ok(Self::TmemInput),
            t if t == Self::TmemOutput as u32 => Ok(Self::TmemOutput),
            t if t == Self::TmemInout as u32 => Ok(Self::TmemInout),
            _ => Err(TeeError::BadParameters),
        }
    }
}

/// Mask extracting the [`AttrType`] from [`Param::attr`].
pub const ATTR_TYPE_MASK: u32 = 0xff;

bitflags! {
    /// Flag bits in [`Param::attr`] above the type code.
    pub struct AttrFlags: u32 {
        /// Absorbed by the secure OS, not passed to the trusted
        /// application. Only valid on open-session.
        const META = 1 << 8;
        /// This temp memref is continued by the next slot.
        const FRAGMENT = 1 << 9;
    }
}

/// Cache attribute field shift/width within [`Param::attr`].
pub const ATTR_CACHE_SHIFT: u32 = 4;
pub const ATTR_CACHE_MASK: u32 = 0xf;
/// Inner and outer write-back, the default for cached shared memory.
pub const ATTR_CACHE_DEFAULT: u32 = 0x2 | 0x8;

/// A tagged parameter slot.
///
/// The three 64-bit words are interpreted per the type code in `attr`:
/// `{a, b, c}` for values, `{buffer physical address, size, shm
/// reference}` for temporary memrefs, `{offset, size, shm reference}` for
/// registered memrefs. Reading a slot through the wrong interpretation is
/// a protocol error and fails with [`TeeError::BadParameters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Param {
    pub attr: u32,
    pub pad: u32,
    pub a: u64,
    pub b: u64,
    pub c: u64,
}

impl Param {
    pub const fn none() -> Self {
        Self {
            attr: AttrType::None as u32,
            pad: 0,
            a: 0,
            b: 0,
            c: 0,
        }
    }

    pub const fn value(ty: AttrType, a: u64, b: u64, c: u64) -> Self {
        Self {
            attr: ty as u32,
            pad: 0,
            a,
            b,
            c,
        }
    }

    pub const fn tmem(ty: AttrType, buf_ptr: u64, size: u64) -> Self {
        Self {
            attr: ty as u32,
            pad: 0,
            a: buf_ptr,
            b: size,
            c: 0,
        }
    }

    /// Marks the slot as a meta parameter (open-session only).
    pub const fn meta(mut self) -> Self {
        self.attr |= AttrFlags::META.bits();
        self
    }

    pub fn attr_type(&self) -> Result<AttrType> {
        AttrType::try_from(self.attr)
    }

    fn is(&self, ty: AttrType) -> bool {
        self.attr & ATTR_TYPE_MASK == ty as u32
    }

    /// Reads the slot as a value of exactly type `ty`.
    pub fn as_value(&self, ty: AttrType) -> Result<(u64, u64, u64)> {
        if self.is(ty) {
            Ok((self.a, self.b, self.c))
        } else {
            Err(TeeError::BadParameters)
        }
    }

    /// Reads the slot as a temporary memref of exactly type `ty`,
    /// returning `(buffer physical address, size)`.
    pub fn as_tmem(&self, ty: AttrType) -> Result<(u64, u64)> {
        if self.is(ty) {
            Ok((self.a, self.b))
        } else {
            Err(TeeError::BadParameters)
        }
    }

    /// Rewrites the size word of a memref slot, used to report a required
    /// size back to the secure side.
    pub fn set_memref_size(&mut self, size: u64) {
        self.b = size;
    }
}

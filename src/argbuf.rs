// SPDX-License-Identifier: Apache-2.0

//! In-region argument block access.
//!
//! An argument block lives in the shared region so the secure side can
//! read and partially rewrite it. This module is the one place that turns
//! region offsets into typed references to [`Arg`] and its parameter
//! slots; everything else works through it.

use crate::shm::SharedRegion;
use crate::TeeError;

use std::mem::{align_of, size_of};

use teeport::arg::{arg_size, Arg, Param};

/// A validated argument block inside the shared region.
pub(crate) struct ArgBuf<'r> {
    region: &'r SharedRegion,
    offset: usize,
    num_params: usize,
}

impl<'r> ArgBuf<'r> {
    /// Allocates and zeroes a block with room for `num_params` parameter
    /// slots. The caller must [`ArgBuf::free`] it on every path.
    pub fn alloc(region: &'r SharedRegion, num_params: usize) -> Result<Self, TeeError> {
        let size = arg_size(num_params);
        let shared = region.alloc(size)?;
        region.fill_zero(shared.offset(), size);

        let mut buf = Self {
            region,
            offset: shared.offset(),
            num_params,
        };
        buf.arg_mut().num_params = num_params as u32;
        Ok(buf)
    }

    /// Interprets an existing block at a physical address handed over by
    /// the secure side, taking the parameter count from the header.
    pub fn at_phys(region: &'r SharedRegion, phys: u64) -> Result<Self, TeeError> {
        let offset = region.offset_of_phys(phys)?;
        if offset % align_of::<Param>() != 0 {
            return Err(TeeError::BadParameters);
        }

        let mut header = [0u8; size_of::<Arg>()];
        region.read(offset, &mut header);
        let num_params =
            u32::from_le_bytes([header[28], header[29], header[30], header[31]]) as usize;

        // The whole block, slots included, must lie inside the region.
        region
            .offset_of_phys(phys + arg_size(num_params) as u64 - 1)
            .map_err(|_| TeeError::BadParameters)?;

        Ok(Self {
            region,
            offset,
            num_params,
        })
    }

    pub fn phys(&self) -> u64 {
        self.region.phys_of(self.offset)
    }

    pub fn free(self) {
        self.region.free_offset(self.offset);
    }

    pub fn arg(&self) -> &Arg {
        // SAFETY: offset is aligned and in bounds per construction; `Arg`
        // is repr(C) with no padding and valid for all bit patterns. The
        // suspended-call discipline (see `shm`) gives this thread
        // exclusive access while it services the call.
        unsafe {
            &*(self
                .region
                .slice_mut(self.offset, size_of::<Arg>())
                .as_ptr() as *const Arg)
        }
    }

    pub fn arg_mut(&mut self) -> &mut Arg {
        // SAFETY: as in `arg`, plus `&mut self` keeps this the only
        // normal-world reference into the block.
        unsafe {
            &mut *(self
                .region
                .slice_mut(self.offset, size_of::<Arg>())
                .as_mut_ptr() as *mut Arg)
        }
    }

    pub fn params(&self) -> &[Param] {
        let offset = self.offset + size_of::<Arg>();
        let len = self.num_params * size_of::<Param>();
        // SAFETY: as in `arg`; the slot array starts 8-aligned directly
        // after the fixed header.
        unsafe {
            std::slice::from_raw_parts(
                self.region.slice_mut(offset, len).as_ptr() as *const Param,
                self.num_params,
            )
        }
    }

    pub fn params_mut(&mut self) -> &mut [Param] {
        let offset = self.offset + size_of::<Arg>();
        let len = self.num_params * size_of::<Param>();
        // SAFETY: as in `arg_mut`.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.region.slice_mut(offset, len).as_mut_ptr() as *mut Param,
                self.num_params,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::anonymous_region;

    use teeport::arg::{AttrType, CMD_INVOKE_COMMAND};

    #[test]
    fn alloc_view_round_trip() {
        let region = anonymous_region(8, 0x8000_0000).unwrap();

        let mut buf = ArgBuf::alloc(&region, 2).unwrap();
        buf.arg_mut().cmd = CMD_INVOKE_COMMAND;
        buf.arg_mut().func = 7;
        buf.params_mut()[0] = Param::value(AttrType::ValueInput, 1, 2, 3);
        buf.params_mut()[1] = Param::tmem(AttrType::TmemOutput, 0x9000, 64);

        let phys = buf.phys();
        let view = ArgBuf::at_phys(&region, phys).unwrap();
        assert_eq!(view.arg().cmd, CMD_INVOKE_COMMAND);
        assert_eq!(view.arg().func, 7);
        assert_eq!(view.arg().num_params, 2);
        assert_eq!(
            view.params()[0].as_value(AttrType::ValueInput),
            Ok((1, 2, 3))
        );
        assert_eq!(
            view.params()[1].as_tmem(AttrType::TmemOutput),
            Ok((0x9000, 64))
        );

        buf.free();
    }

    #[test]
    fn at_phys_rejects_foreign_addresses() {
        let region = anonymous_region(4, 0x8000_0000).unwrap();
        assert!(ArgBuf::at_phys(&region, 0x1000).is_err());
        assert!(ArgBuf::at_phys(&region, 0x8000_0001).is_err());
    }
}

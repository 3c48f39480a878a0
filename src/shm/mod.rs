// SPDX-License-Identifier: Apache-2.0

//! The memory range shared with the secure world.
//!
//! Both worlds allocate parameter blocks and payload buffers from this
//! range and refer to them by physical address. The region is mapped once
//! at bring-up; a bitmap with one bit per granule tracks occupancy and a
//! small header in front of every allocation records what `free` needs.
//!
//! All pointer arithmetic stays inside this module. Callers hold opaque
//! [`Shared`] handles (offsets into the allocatable window) and move data
//! with [`SharedRegion::read`]/[`SharedRegion::write`].

mod bitmap;

use crate::TeeError;

use std::sync::Mutex;

use anyhow::{ensure, Context as _};
use lset::{Contains, Line};
use mmarinus::{perms, Map};

/// The fixed allocation unit, one page.
pub const GRANULE: usize = 4096;

/// Reserved head of the region, excluded from allocation. The secure
/// side keeps its cross-world spinlock area here.
pub const RESERVED_HEAD: usize = GRANULE;

/// Header prepended invisibly to every allocation.
const HEADER_SIZE: usize = 16;

/// An allocation in the shared region: the offset of its payload within
/// the allocatable window, and the usable length. Plain data; the region
/// itself is the owner of the underlying granules until `free`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shared {
    offset: usize,
    len: usize,
}

impl Shared {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A sub-range of this allocation, for carving one allocation into
    /// adjacent wire buffers. The parent allocation remains the unit of
    /// `free`.
    pub fn sub(&self, start: usize, len: usize) -> Shared {
        assert!(start + len <= self.len);
        Shared {
            offset: self.offset + start,
            len,
        }
    }
}

/// The mapped both-worlds memory range and its allocator.
pub struct SharedRegion {
    /// Base of the allocatable window (map base plus [`RESERVED_HEAD`]).
    base: *mut u8,
    /// Length of the allocatable window.
    len: usize,
    /// Physical addresses of the allocatable window.
    phys: Line<u64>,
    bits: Mutex<bitmap::BitMap>,
    /// Keeps the backing mapping alive for as long as the region lives.
    _map: Map<perms::ReadWrite>,
}

// SAFETY: the raw base pointer refers to memory owned by `_map`, which
// lives as long as the region. Concurrent access is disciplined by the
// allocator: distinct allocations never overlap, the bitmap is only
// touched under its lock, and a buffer handed to the secure side is not
// otherwise accessed while the call referencing it is outstanding.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Takes ownership of an established mapping of the shared range and
    /// its physical base address.
    pub fn new(map: Map<perms::ReadWrite>, phys_base: u64) -> anyhow::Result<Self> {
        let map_len = map.size();
        ensure!(
            map_len % GRANULE == 0,
            "shared region length {map_len:#x} is not granule aligned"
        );
        ensure!(
            map_len > RESERVED_HEAD,
            "shared region of {map_len:#x} bytes has no space beyond the reserved head"
        );

        let len = map_len - RESERVED_HEAD;
        let granules = len / GRANULE;
        let base = (map.addr() + RESERVED_HEAD) as *mut u8;
        let phys_start = phys_base
            .checked_add(RESERVED_HEAD as u64)
            .context("shared region physical base overflows")?;

        Ok(Self {
            base,
            len,
            phys: Line::new(phys_start, phys_start + len as u64),
            bits: Mutex::new(bitmap::BitMap::new(granules)),
            _map: map,
        })
    }

    /// Number of allocatable granules.
    pub fn granules(&self) -> usize {
        self.len / GRANULE
    }

    /// Number of currently occupied granules.
    pub fn occupied_granules(&self) -> usize {
        self.bits.lock().unwrap().occupied()
    }

    /// Allocates `len` usable bytes, granule aligned, first fit at the
    /// lowest address.
    pub fn alloc(&self, len: usize) -> Result<Shared, TeeError> {
        let total = len.checked_add(HEADER_SIZE).ok_or(TeeError::OutOfMemory)?;
        u32::try_from(total).map_err(|_| TeeError::OutOfMemory)?;
        let count = total.div_ceil(GRANULE);

        let mut bits = self.bits.lock().unwrap();
        let index = bits.find_clear_and_set(count).ok_or(TeeError::OutOfMemory)?;
        drop(bits);

        let start = index * GRANULE;
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&(index as u32).to_le_bytes());
        header[4..8].copy_from_slice(&((count * GRANULE) as u32).to_le_bytes());
        self.write(start, &header);

        Ok(Shared {
            offset: start + HEADER_SIZE,
            len,
        })
    }

    /// Frees an allocation previously returned by [`Self::alloc`].
    ///
    /// # Panics
    ///
    /// Freeing an offset that was not returned by `alloc`, or freeing it
    /// twice, corrupts the allocator's ownership of the bitmap and is
    /// treated as a fatal contract violation.
    pub fn free(&self, shared: Shared) {
        self.free_offset(shared.offset)
    }

    /// Frees by payload offset, for buffers identified by a wire cookie
    /// rather than a live handle.
    pub fn free_offset(&self, offset: usize) {
        assert!(
            offset >= HEADER_SIZE && offset % GRANULE == HEADER_SIZE,
            "free of {offset:#x}: not an allocation payload offset"
        );
        let start = offset - HEADER_SIZE;

        let mut header = [0u8; HEADER_SIZE];
        self.read(start, &mut header);
        let index = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let span = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        assert!(
            index * GRANULE == start && span % GRANULE == 0 && span != 0,
            "free of {offset:#x}: corrupt allocation header"
        );

        let count = span / GRANULE;
        let mut bits = self.bits.lock().unwrap();
        assert!(
            bits.all_set(index, count),
            "free of {offset:#x}: granules not in use"
        );
        bits.clear_run(index, count);
    }

    /// Physical address of a window offset.
    pub fn phys_of(&self, offset: usize) -> u64 {
        assert!(offset <= self.len);
        self.phys.start + offset as u64
    }

    /// Window offset of a physical address inside the region.
    pub fn offset_of_phys(&self, phys: u64) -> Result<usize, TeeError> {
        if self.phys.contains(&phys) {
            Ok((phys - self.phys.start) as usize)
        } else {
            Err(TeeError::BadParameters)
        }
    }

    /// Copies bytes out of the region.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.len);
        // SAFETY: in range per the assert above; see the Send/Sync note
        // for the aliasing discipline.
        unsafe {
            self.base
                .add(offset)
                .copy_to_nonoverlapping(buf.as_mut_ptr(), buf.len());
        }
    }

    /// Copies bytes into the region.
    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len);
        // SAFETY: in range per the assert above; see the Send/Sync note
        // for the aliasing discipline.
        unsafe {
            self.base
                .add(offset)
                .copy_from_nonoverlapping(data.as_ptr(), data.len());
        }
    }

    /// Zero-fills a range of the region.
    pub fn fill_zero(&self, offset: usize, len: usize) {
        assert!(offset + len <= self.len);
        // SAFETY: in range per the assert above.
        unsafe {
            self.base.add(offset).write_bytes(0, len);
        }
    }

    /// Borrows a range of the region as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must guarantee nothing else accesses the same range for
    /// the lifetime of the borrow. Within this crate that holds for the
    /// buffers of a suspended call: the secure side is parked and the
    /// owning request's worker is the thread asking.
    pub(crate) unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset + len <= self.len);
        unsafe { std::slice::from_raw_parts_mut(self.base.add(offset), len) }
    }
}

/// Maps an anonymous region for testing and local fakes.
pub fn anonymous_region(granules: usize, phys_base: u64) -> anyhow::Result<SharedRegion> {
    let map = Map::bytes((granules + 1) * GRANULE)
        .anywhere()
        .anonymously()
        .with(perms::ReadWrite)
        .context("failed to map anonymous shared region")?;
    SharedRegion::new(map, phys_base)
}

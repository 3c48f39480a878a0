// SPDX-License-Identifier: Apache-2.0

//! Trusted application identity.

use core::fmt;

/// A 128-bit trusted application identifier in RFC 4122 field layout.
///
/// The secure side transmits the three leading fields big-endian; use
/// [`TaUuid::swapped`] when moving a UUID across the boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TaUuid {
    pub time_low: u32,
    pub time_mid: u16,
    pub time_hi_and_version: u16,
    pub clock_seq_and_node: [u8; 8],
}

impl TaUuid {
    pub const fn new(
        time_low: u32,
        time_mid: u16,
        time_hi_and_version: u16,
        clock_seq_and_node: [u8; 8],
    ) -> Self {
        Self {
            time_low,
            time_mid,
            time_hi_and_version,
            clock_seq_and_node,
        }
    }

    /// Returns the UUID with the endianness of the three leading fields
    /// swapped. Its own inverse.
    pub const fn swapped(self) -> Self {
        Self {
            time_low: self.time_low.swap_bytes(),
            time_mid: self.time_mid.swap_bytes(),
            time_hi_and_version: self.time_hi_and_version.swap_bytes(),
            clock_seq_and_node: self.clock_seq_and_node,
        }
    }

    /// Serializes into the 16-byte wire form: native-endian words as laid
    /// out in memory.
    pub fn to_bytes(self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&self.time_low.to_ne_bytes());
        bytes[4..6].copy_from_slice(&self.time_mid.to_ne_bytes());
        bytes[6..8].copy_from_slice(&self.time_hi_and_version.to_ne_bytes());
        bytes[8..16].copy_from_slice(&self.clock_seq_and_node);
        bytes
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self {
            time_low: u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            time_mid: u16::from_ne_bytes([bytes[4], bytes[5]]),
            time_hi_and_version: u16::from_ne_bytes([bytes[6], bytes[7]]),
            clock_seq_and_node: [
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ],
        }
    }
}

impl fmt::Display for TaUuid {
    /// Canonical hyphenated form, e.g.
    /// `650d52ab-9cbf-4c80-97cd-77a38cf6f68e`. The normal world derives
    /// the trusted application image file name from this.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.time_low,
            self.time_mid,
            self.time_hi_and_version,
            self.clock_seq_and_node[0],
            self.clock_seq_and_node[1],
            self.clock_seq_and_node[2],
            self.clock_seq_and_node[3],
            self.clock_seq_and_node[4],
            self.clock_seq_and_node[5],
            self.clock_seq_and_node[6],
            self.clock_seq_and_node[7],
        )
    }
}

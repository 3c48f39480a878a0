// SPDX-License-Identifier: Apache-2.0

//! API for the normal-world/secure-world boundary
//!
//! `teeport` is a protocol crate describing the data both worlds exchange
//! when the normal world enters the secure monitor: the argument block and
//! its tagged parameter slots, the monitor function identifiers and their
//! return-code classification, the callback (RPC) sub-protocol the secure
//! side uses to call back into the normal world while an entry is still
//! outstanding, and the result-code taxonomy shared by every layer.
//!
//! # Mechanism of action
//!
//! A logical operation (open a session to a trusted application, invoke a
//! command in it, close the session) is packed into an [`arg::Arg`] block
//! living in memory both worlds can address. The block is passed to the
//! monitor *by physical address* split across two registers, because the
//! two worlds do not share a virtual address space. The monitor either
//! completes the operation — final result in [`arg::Arg::ret`] — or
//! returns a callback request, one of [`smc::RpcFunc`], which the normal
//! world must service before re-entering with [`smc::SmcRegs::resume`].
//!
//! Everything in this crate is pure data: no I/O, no allocation, no
//! assumptions about who performs the world switch.

#![cfg_attr(not(test), no_std)]
#![deny(clippy::all)]

pub mod arg;
pub mod envelope;
pub mod result;
pub mod rpc;
pub mod smc;
pub mod uuid;

pub use result::{Origin, TeeError};
pub use uuid::TaUuid;

/// Result type used at the boundary.
pub type Result<T> = core::result::Result<T, TeeError>;

/// The teeport protocol version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

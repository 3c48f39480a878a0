// SPDX-License-Identifier: Apache-2.0

//! Normal-world client bridge for TrustZone trusted applications.
//!
//! This crate is the untrusted half of a TEE client stack. It owns the
//! memory pool both worlds allocate from ([`shm::SharedRegion`]), packs
//! logical operations into argument blocks and enters the secure world
//! through an injected [`monitor::Monitor`] ([`transport::Context`]),
//! services the callbacks the secure side issues while an entry is still
//! outstanding ([`rpc::Dispatcher`]), and drives asynchronous client
//! requests through their lifecycle, including out-calls the secure side
//! makes back into the client application mid-request ([`service`]).
//!
//! The wire ABI shared with the secure side lives in the [`teeport`]
//! crate.

#![deny(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod monitor;
pub mod rpc;
pub mod service;
pub mod shm;
pub mod sync;
pub mod transport;

mod argbuf;

pub use monitor::Monitor;
pub use teeport::{TaUuid, TeeError};

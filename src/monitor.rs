// SPDX-License-Identifier: Apache-2.0

//! The privileged-call seam.

use teeport::smc::SmcRegs;

/// The instruction that transfers execution into the secure monitor and
/// back.
///
/// Implementations swap the register block with the secure world: the
/// function identifier and arguments go in, the return code and any
/// callback arguments come out. The call executes synchronously on the
/// calling thread and the secure side stays suspended until the thread
/// re-enters — all callback servicing between entries happens with the
/// secure side parked.
///
/// Production supplies the platform's SMC shim; tests supply a scripted
/// secure world.
pub trait Monitor: Send + Sync {
    fn call(&self, regs: &mut SmcRegs);
}

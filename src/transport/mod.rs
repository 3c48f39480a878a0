// SPDX-License-Identifier: Apache-2.0

//! Packing logical operations into argument blocks and driving the
//! privileged call until it completes.
//!
//! One entry into the secure world may suspend any number of times with a
//! callback request before it produces a final result. The loop in
//! [`Context::call`] services each callback through the [`Dispatcher`]
//! and re-enters; the "resume" is nothing more than the next loop
//! iteration.

use crate::argbuf::ArgBuf;
use crate::monitor::Monitor;
use crate::rpc::Dispatcher;
use crate::shm::{Shared, SharedRegion};
use crate::TeeError;

use std::fmt;
use std::sync::Arc;

use teeport::arg::{
    Arg, AttrType, Param, CMD_CLOSE_SESSION, CMD_INVOKE_COMMAND, CMD_OPEN_SESSION, LOGIN_PUBLIC,
};
use teeport::smc::{SmcRegs, SmcReturn};
use teeport::{Origin, TaUuid};
use tracing::{trace, warn};

/// Number of caller-visible parameter slots per operation.
pub const PARAM_COUNT: usize = 4;

/// Open-session carries the TA identity and login method in two leading
/// meta slots the secure OS absorbs.
const META_PARAM_COUNT: usize = 2;

/// A failed call: the result code and which layer produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallError {
    pub code: TeeError,
    pub origin: Origin,
}

impl CallError {
    fn api(code: TeeError) -> Self {
        Self {
            code,
            origin: Origin::Api,
        }
    }

    fn comms(code: TeeError) -> Self {
        Self {
            code,
            origin: Origin::Comms,
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {:?}", self.code, self.origin)
    }
}

impl From<TeeError> for CallError {
    fn from(code: TeeError) -> Self {
        Self::api(code)
    }
}

/// A caller-supplied operation parameter. Memory parameters point at
/// buffers already allocated from the shared region; `len` is the used
/// length, updated from the secure side's write-back on output slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parameter {
    None,
    ValueInput { a: u64, b: u64 },
    ValueOutput { a: u64, b: u64 },
    ValueInout { a: u64, b: u64 },
    TmemInput { buf: Shared, len: usize },
    TmemOutput { buf: Shared, len: usize },
    TmemInout { buf: Shared, len: usize },
}

/// The parameters of one open-session or invoke-command operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct Operation {
    pub params: [Parameter; PARAM_COUNT],
}

impl Default for Parameter {
    fn default() -> Self {
        Self::None
    }
}

/// An open session, identified by the id the secure side assigned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionHandle {
    id: u32,
}

impl SessionHandle {
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// The privileged-call transport: region + monitor + callback dispatcher.
pub struct Context {
    region: Arc<SharedRegion>,
    monitor: Arc<dyn Monitor>,
    dispatcher: Arc<Dispatcher>,
}

impl Context {
    pub fn new(
        region: Arc<SharedRegion>,
        monitor: Arc<dyn Monitor>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            region,
            monitor,
            dispatcher,
        }
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Opens a session to the trusted application identified by `uuid`
    /// with the public login. On success the caller owns the returned
    /// handle and must close it.
    pub fn open_session(
        &self,
        uuid: &TaUuid,
        op: &mut Operation,
    ) -> Result<SessionHandle, CallError> {
        let mut buf = ArgBuf::alloc(&self.region, PARAM_COUNT + META_PARAM_COUNT)
            .map_err(CallError::api)?;
        buf.arg_mut().cmd = CMD_OPEN_SESSION;

        // The secure side expects the identity fields big-endian.
        let uuid_bytes = uuid.swapped().to_bytes();
        let slots = buf.params_mut();
        slots[0] = Param::value(
            AttrType::ValueInput,
            u64::from_ne_bytes(uuid_bytes[0..8].try_into().unwrap()),
            u64::from_ne_bytes(uuid_bytes[8..16].try_into().unwrap()),
            0,
        )
        .meta();
        slots[1] = Param::value(AttrType::ValueInput, 0, 0, LOGIN_PUBLIC).meta();
        self.set_params(op, &mut slots[META_PARAM_COUNT..]);

        let result = self.call(buf.phys()).and_then(|()| {
            let session = buf.arg().session;
            check_result(buf.arg())?;
            self.get_params(&buf.params()[META_PARAM_COUNT..], op);
            Ok(SessionHandle { id: session })
        });

        buf.free();
        result
    }

    /// Invokes a command in an open session.
    pub fn invoke(
        &self,
        session: &SessionHandle,
        func: u32,
        op: &mut Operation,
    ) -> Result<(), CallError> {
        let mut buf = ArgBuf::alloc(&self.region, PARAM_COUNT).map_err(CallError::api)?;
        {
            let arg = buf.arg_mut();
            arg.cmd = CMD_INVOKE_COMMAND;
            arg.func = func;
            arg.session = session.id;
        }
        self.set_params(op, buf.params_mut());

        let result = self.call(buf.phys()).and_then(|()| {
            check_result(buf.arg())?;
            self.get_params(buf.params(), op);
            Ok(())
        });

        buf.free();
        result
    }

    /// Closes a session. The specification for the client API does not
    /// let this fail, but failures are reported here so callers can log
    /// them.
    pub fn close_session(&self, session: SessionHandle) -> Result<(), CallError> {
        let mut buf = ArgBuf::alloc(&self.region, 0).map_err(CallError::api)?;
        {
            let arg = buf.arg_mut();
            arg.cmd = CMD_CLOSE_SESSION;
            arg.session = session.id;
        }

        let result = self.call(buf.phys()).and_then(|()| check_result(buf.arg()));

        buf.free();
        result
    }

    /// Enters the secure world and keeps re-entering until the call
    /// produces a final result. Callbacks are serviced even when their
    /// handling fails, so the secure side can unwind with its own error
    /// information.
    fn call(&self, arg_phys: u64) -> Result<(), CallError> {
        let mut regs = SmcRegs::with_arg(arg_phys);
        loop {
            self.monitor.call(&mut regs);

            match SmcReturn::classify(regs.a[0]) {
                SmcReturn::Rpc(func) => {
                    trace!(?func, "servicing callback");
                    if let Err(code) = self.dispatcher.dispatch(func, &mut regs) {
                        trace!(%code, ?func, "callback failed");
                    }
                    regs.resume();
                }
                SmcReturn::UnknownRpc(func) => {
                    warn!(func, "unsupported callback request");
                    regs.resume();
                }
                SmcReturn::UnknownFunction => {
                    return Err(CallError::comms(TeeError::NotImplemented))
                }
                SmcReturn::Error(code) => {
                    warn!(code, "secure world returned a transport error");
                    return Err(CallError::comms(TeeError::Communication));
                }
                SmcReturn::Ok => return Ok(()),
            }
        }
    }

    /// Translates caller parameters into wire slots.
    fn set_params(&self, op: &Operation, slots: &mut [Param]) {
        for (param, slot) in op.params.iter().zip(slots.iter_mut()) {
            *slot = match *param {
                Parameter::None => Param::none(),
                Parameter::ValueInput { a, b } => Param::value(AttrType::ValueInput, a, b, 0),
                Parameter::ValueOutput { a, b } => Param::value(AttrType::ValueOutput, a, b, 0),
                Parameter::ValueInout { a, b } => Param::value(AttrType::ValueInout, a, b, 0),
                Parameter::TmemInput { buf, len } => Param::tmem(
                    AttrType::TmemInput,
                    self.region.phys_of(buf.offset()),
                    len as u64,
                ),
                Parameter::TmemOutput { buf, len } => Param::tmem(
                    AttrType::TmemOutput,
                    self.region.phys_of(buf.offset()),
                    len as u64,
                ),
                Parameter::TmemInout { buf, len } => Param::tmem(
                    AttrType::TmemInout,
                    self.region.phys_of(buf.offset()),
                    len as u64,
                ),
            };
        }
    }

    /// Updates caller parameters from the secure side's write-back.
    fn get_params(&self, slots: &[Param], op: &mut Operation) {
        for (slot, param) in slots.iter().zip(op.params.iter_mut()) {
            match param {
                Parameter::None | Parameter::ValueInput { .. } | Parameter::TmemInput { .. } => {}
                Parameter::ValueOutput { a, b } | Parameter::ValueInout { a, b } => {
                    *a = slot.a;
                    *b = slot.b;
                }
                Parameter::TmemOutput { len, .. } | Parameter::TmemInout { len, .. } => {
                    *len = slot.b as usize;
                }
            }
        }
    }
}

fn check_result(arg: &Arg) -> Result<(), CallError> {
    match TeeError::check(arg.ret) {
        Ok(()) => Ok(()),
        Err(code) => Err(CallError {
            code,
            origin: Origin::from_raw(arg.ret_origin),
        }),
    }
}

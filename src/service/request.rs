// SPDX-License-Identifier: Apache-2.0

//! Sessions and the per-request state machine.

use crate::sync::Event;
use crate::transport::{Context, Operation, Parameter, SessionHandle};
use crate::TeeError;

use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use teeport::envelope::{ResponseHeader, ResponseKind};
use tracing::{debug, trace, warn};

use super::{Completion, CompletionKind, CompletionSink};

/// Lifecycle of one asynchronous client request.
///
/// Two locks are involved — the session's table lock and each request's
/// own state lock — and they are never held at the same time: every path
/// takes one, releases it, then takes the other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Pending,
    Setup,
    Submitted,
    WaitingOcallReply,
    OcallReplyReady,
    Completed,
    Cancelled,
}

struct RequestState {
    phase: Phase,
    /// Completion token of the client call currently carrying this
    /// request; consumed by the next partial or final completion.
    sink: Option<CompletionSink>,
    /// Output payload capacity declared by that client call.
    output_len: usize,
    /// Out-call reply payload staged by `supply_reply` for the thread
    /// blocked in `receive_ocall`.
    reply: Option<Vec<u8>>,
}

pub(super) struct Request {
    key: u32,
    function: u32,
    event: Event,
    state: Mutex<RequestState>,
}

impl Request {
    fn new(key: u32, function: u32, output_len: usize, sink: CompletionSink) -> Self {
        Self {
            key,
            function,
            event: Event::new(),
            state: Mutex::new(RequestState {
                phase: Phase::Idle,
                sink: Some(sink),
                output_len,
                reply: None,
            }),
        }
    }
}

struct SessionTable {
    requests: Vec<Arc<Request>>,
    /// Requests admitted but not yet finally completed. Teardown waits
    /// for this to reach zero so no completion fires after it returns.
    active: usize,
    closing: bool,
}

/// An open session: the secure-assigned id, the transport handle, and
/// the table of in-flight requests.
pub struct Session {
    id: u32,
    handle: Mutex<Option<SessionHandle>>,
    ctx: Arc<Context>,
    table: Mutex<SessionTable>,
    drained: Condvar,
}

impl Session {
    pub(super) fn new(ctx: Arc<Context>, handle: SessionHandle) -> Self {
        Self {
            id: handle.id(),
            handle: Mutex::new(Some(handle)),
            ctx,
            table: Mutex::new(SessionTable {
                requests: Vec::new(),
                active: 0,
                closing: false,
            }),
            drained: Condvar::new(),
        }
    }

    /// The id the secure side assigned at open.
    pub fn id(&self) -> u32 {
        self.id
    }

    fn find(&self, key: u32) -> Option<Arc<Request>> {
        let table = self.table.lock().unwrap();
        table
            .requests
            .iter()
            .find(|request| request.key == key)
            .cloned()
    }

    /// Admits a new command request and schedules a worker to drive it.
    /// Fails synchronously if `key` already has a pending request.
    pub(super) fn submit(
        self: &Arc<Self>,
        key: u32,
        function: u32,
        input: Vec<u8>,
        output_len: usize,
        sink: CompletionSink,
    ) -> Result<(), TeeError> {
        let request = Arc::new(Request::new(key, function, output_len, sink));

        {
            let mut table = self.table.lock().unwrap();
            if table.closing {
                return Err(TeeError::BadState);
            }
            if table.requests.iter().any(|other| other.key == key) {
                warn!(key, "key already has a pending request");
                return Err(TeeError::BadParameters);
            }
            request.state.lock().unwrap().phase = Phase::Pending;
            table.requests.push(Arc::clone(&request));
            table.active += 1;
        }

        debug!(key, function, session = self.id, "request admitted");

        let session = Arc::clone(self);
        thread::spawn(move || session.run_worker(&request, input));
        Ok(())
    }

    /// The request worker: builds the operation, performs the privileged
    /// call (servicing any out-calls through the session registry on this
    /// same thread), and finally completes the request exactly once.
    fn run_worker(self: &Arc<Self>, request: &Arc<Request>, input: Vec<u8>) {
        let output_len = {
            let mut state = request.state.lock().unwrap();
            if state.phase == Phase::Cancelled {
                drop(state);
                self.finalize(request, Err(TeeError::Cancelled), Vec::new());
                return;
            }
            state.phase = Phase::Setup;
            state.output_len
        };

        // Stage the payloads in one shared allocation: input first, the
        // in/out output area directly after.
        let region = self.ctx.region();
        let total = input.len() + output_len;
        let staged = if total != 0 {
            match region.alloc(total) {
                Ok(staged) => Some(staged),
                Err(err) => {
                    warn!(key = request.key, %err, "failed to stage request payload");
                    self.finalize(request, Err(err), Vec::new());
                    return;
                }
            }
        } else {
            None
        };

        let mut op = Operation::default();
        op.params[0] = Parameter::ValueInput {
            a: request.key as u64,
            b: 0,
        };
        let mut output_param = None;
        if let Some(staged) = staged {
            let mut index = 1;
            if !input.is_empty() {
                region.write(staged.offset(), &input);
                op.params[index] = Parameter::TmemInput {
                    buf: staged.sub(0, input.len()),
                    len: input.len(),
                };
                index += 1;
            }
            if output_len != 0 {
                region.fill_zero(staged.offset() + input.len(), output_len);
                op.params[index] = Parameter::TmemInout {
                    buf: staged.sub(input.len(), output_len),
                    len: output_len,
                };
                output_param = Some(index);
            }
        }

        let admitted = {
            let mut state = request.state.lock().unwrap();
            match state.phase {
                Phase::Setup => {
                    state.phase = Phase::Submitted;
                    Ok(())
                }
                Phase::Cancelled => Err(TeeError::Cancelled),
                phase => {
                    warn!(key = request.key, ?phase, "request in impossible state");
                    Err(TeeError::BadState)
                }
            }
        };

        let status = admitted.and_then(|()| {
            trace!(key = request.key, session = self.id, "submitting request");
            // Snapshot the handle so concurrent workers on this session
            // do not serialize on the lock across the call.
            let handle = self.handle.lock().unwrap().as_ref().cloned();
            let handle = handle.ok_or(TeeError::BadState)?;
            self.ctx
                .invoke(&handle, request.function, &mut op)
                .map_err(|err| err.code)
        });

        // Assemble the final completion payload from the staged output.
        let mut payload = Vec::new();
        let status = status.and_then(|()| {
            let returned = match output_param {
                Some(index) => match op.params[index] {
                    Parameter::TmemInout { len, .. } => len,
                    _ => 0,
                },
                None => 0,
            };

            // The reply that most recently carried this request defines
            // the capacity the client has for the final output.
            let capacity = request.state.lock().unwrap().output_len;
            if capacity < returned {
                warn!(
                    key = request.key,
                    capacity, returned, "client buffer too small for final output"
                );
                return Err(TeeError::ShortBuffer);
            }

            payload = vec![0u8; ResponseHeader::SIZE + returned];
            ResponseHeader::new(ResponseKind::CommandCompleted, 0).emit(&mut payload);
            if let Some(staged) = staged {
                region.read(
                    staged.offset() + input.len(),
                    &mut payload[ResponseHeader::SIZE..],
                );
            }
            Ok(())
        });

        if let Some(staged) = staged {
            region.free(staged);
        }

        self.finalize(request, status, payload);
    }

    /// Completes a request exactly once and retires it from the table.
    /// A request cancelled anywhere along the way reports `Cancelled`
    /// regardless of what the transport returned.
    fn finalize(&self, request: &Arc<Request>, status: Result<(), TeeError>, payload: Vec<u8>) {
        let (status, sink) = {
            let mut state = request.state.lock().unwrap();
            let status = if state.phase == Phase::Cancelled {
                Err(TeeError::Cancelled)
            } else {
                state.phase = Phase::Completed;
                status
            };
            (status, state.sink.take())
        };

        {
            let mut table = self.table.lock().unwrap();
            table
                .requests
                .retain(|other| !Arc::ptr_eq(other, request));
        }

        debug!(key = request.key, ?status, "request finalized");
        if let Some(sink) = sink {
            sink(Completion {
                kind: CompletionKind::Final,
                status,
                payload,
            });
        }

        let mut table = self.table.lock().unwrap();
        table.active -= 1;
        self.drained.notify_all();
    }

    /// Routes an out-call from the secure side to the client: surfaces the
    /// payload through the request's pending completion token, then blocks
    /// until the client replies or the request is cancelled. Returns the
    /// number of reply bytes written into `output`.
    pub(super) fn receive_ocall(
        &self,
        key: u32,
        rpc_type: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, TeeError> {
        let request = self.find(key).ok_or_else(|| {
            warn!(key, session = self.id, "out-call for unknown request");
            TeeError::Communication
        })?;

        let sink = {
            let mut state = request.state.lock().unwrap();
            match state.phase {
                Phase::Submitted => state.phase = Phase::WaitingOcallReply,
                Phase::Cancelled => return Err(TeeError::ExternalCancel),
                phase => {
                    warn!(key, ?phase, "out-call in impossible state");
                    return Err(TeeError::BadState);
                }
            }
            state.sink.take()
        };

        let sink = sink.ok_or(TeeError::BadState)?;
        let mut payload = vec![0u8; ResponseHeader::SIZE + input.len()];
        ResponseHeader::new(ResponseKind::OcallRequest, rpc_type).emit(&mut payload);
        payload[ResponseHeader::SIZE..].copy_from_slice(input);

        trace!(key, rpc_type, "surfacing out-call to the client");
        sink(Completion {
            kind: CompletionKind::Partial,
            status: Ok(()),
            payload,
        });

        request.event.wait();

        let mut state = request.state.lock().unwrap();
        match state.phase {
            Phase::OcallReplyReady => {
                state.phase = Phase::Submitted;
                let reply = state.reply.take().unwrap_or_default();
                let len = reply.len().min(output.len());
                output[..len].copy_from_slice(&reply[..len]);
                trace!(key, len, "out-call reply forwarded");
                Ok(len)
            }
            Phase::Cancelled => Err(TeeError::ExternalCancel),
            phase => {
                warn!(key, ?phase, "out-call wait ended in impossible state");
                Err(TeeError::BadState)
            }
        }
    }

    /// Delivers the client's reply to an out-call and wakes the waiting
    /// dispatch.
    pub(super) fn supply_reply(
        &self,
        key: u32,
        reply: Vec<u8>,
        output_len: usize,
        sink: CompletionSink,
    ) -> Result<(), TeeError> {
        let request = self.find(key).ok_or_else(|| {
            warn!(key, session = self.id, "reply for unknown request");
            TeeError::BadParameters
        })?;

        let mut state = request.state.lock().unwrap();
        match state.phase {
            Phase::WaitingOcallReply => {
                state.phase = Phase::OcallReplyReady;
                state.reply = Some(reply);
                state.sink = Some(sink);
                state.output_len = output_len;
                drop(state);
                request.event.set();
                Ok(())
            }
            Phase::Cancelled => {
                drop(state);
                request.event.set();
                Err(TeeError::Cancelled)
            }
            phase => {
                warn!(key, ?phase, "reply while not waiting for one");
                Err(TeeError::BadState)
            }
        }
    }

    /// Best-effort cancellation: marks the request and unblocks any wait.
    /// The privileged call may already be irrevocably in flight; the
    /// request still completes, reporting `Cancelled`.
    pub(super) fn cancel(&self, key: u32) {
        if let Some(request) = self.find(key) {
            warn!(key, session = self.id, "cancelling request");
            let mut state = request.state.lock().unwrap();
            if state.phase != Phase::Completed {
                state.phase = Phase::Cancelled;
                drop(state);
                request.event.set();
            }
        }
    }

    /// Drains the table: cancels every remaining request, unblocks their
    /// waits, and blocks until all of them have finally completed. No
    /// completion fires after this returns.
    pub(super) fn drain(&self) {
        let requests = {
            let mut table = self.table.lock().unwrap();
            table.closing = true;
            table.requests.clone()
        };

        for request in requests {
            warn!(key = request.key, session = self.id, "aborting request");
            let mut state = request.state.lock().unwrap();
            if state.phase != Phase::Completed {
                state.phase = Phase::Cancelled;
            }
            drop(state);
            request.event.set();
        }

        let mut table = self.table.lock().unwrap();
        while table.active != 0 {
            table = self.drained.wait(table).unwrap();
        }
    }

    /// Closes the transport session. The table must be drained first.
    pub(super) fn close_transport(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            if let Err(err) = self.ctx.close_session(handle) {
                warn!(session = self.id, %err, "failed to close session");
            }
        }
    }
}

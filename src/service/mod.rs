// SPDX-License-Identifier: Apache-2.0

//! The client-facing service layer.
//!
//! A service fronts one trusted application. Clients open sessions to it
//! and submit asynchronous requests through the envelope protocol
//! ([`teeport::envelope`]); each accepted request is driven by its own
//! worker thread and completes exactly once through the completion token
//! supplied with it. While a request is in flight the secure side may
//! issue an out-call back to the client, which surfaces as a *partial*
//! completion the client answers with a reply request.

mod registry;
mod request;

pub use registry::SessionRegistry;
pub use request::Session;

use crate::transport::{Context, Operation};
use crate::TeeError;

use std::sync::Arc;

use teeport::envelope::{RequestHeader, RequestKind, ResponseHeader};
use teeport::TaUuid;
use tracing::{debug, warn};

/// Whether a completion releases the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionKind {
    /// New data for the client — an out-call — without releasing the
    /// request; the client owes a reply.
    Partial,
    /// The request is finished and retired.
    Final,
}

/// What a completion delivers: the outcome and the response buffer
/// (a [`ResponseHeader`] followed by payload).
pub struct Completion {
    pub kind: CompletionKind,
    pub status: Result<(), TeeError>,
    pub payload: Vec<u8>,
}

/// The completion token handed in with every client call. Consumed by
/// the next partial or final completion of the request carrying it.
pub type CompletionSink = Box<dyn FnOnce(Completion) + Send>;

/// The closed interface a logical service exposes to the surrounding
/// device framework: connection lifecycle, session lifecycle, request
/// processing, cancellation, and a hook for unrecognized I/O.
pub trait SecureService: Send + Sync {
    /// Called when the service is first used or returns from a
    /// power-state change.
    fn connect(&self) -> Result<(), TeeError> {
        Ok(())
    }

    /// Called to quiesce the service ahead of a possible power-state
    /// change.
    fn disconnect(&self) -> Result<(), TeeError> {
        Ok(())
    }

    /// Opens a session to the trusted application this service fronts.
    fn create_session(&self) -> Result<Arc<Session>, TeeError>;

    /// Tears a session down: drains its requests, then closes it on the
    /// secure side.
    fn destroy_session(&self, session: Arc<Session>);

    /// Processes one client request buffer against a session. Accepted
    /// requests complete through `sink`; rejections are synchronous.
    fn process_request(
        &self,
        session: &Arc<Session>,
        function: u32,
        input: &[u8],
        output_capacity: usize,
        sink: CompletionSink,
    ) -> Result<(), TeeError>;

    /// Cancels the request with `key`, best effort.
    fn cancel_request(&self, session: &Arc<Session>, key: u32);

    /// Unrecognized I/O; services with private calls override this.
    fn process_other_io(&self, _session: &Arc<Session>) -> Result<(), TeeError> {
        Err(TeeError::BadParameters)
    }
}

/// The generic service: forwards envelope-framed client commands to its
/// trusted application verbatim.
pub struct GenericService {
    ctx: Arc<Context>,
    uuid: TaUuid,
    registry: Arc<SessionRegistry>,
}

impl GenericService {
    /// Creates the service fronting `uuid`. The registry must be
    /// [attached](SessionRegistry::attach) to the context's dispatcher
    /// for out-calls to find their way back.
    pub fn new(ctx: Arc<Context>, uuid: TaUuid, registry: Arc<SessionRegistry>) -> Self {
        Self {
            ctx,
            uuid,
            registry,
        }
    }

    pub fn uuid(&self) -> &TaUuid {
        &self.uuid
    }
}

impl SecureService for GenericService {
    fn create_session(&self) -> Result<Arc<Session>, TeeError> {
        let mut op = Operation::default();
        let handle = self
            .ctx
            .open_session(&self.uuid, &mut op)
            .map_err(|err| {
                warn!(uuid = %self.uuid, %err, "failed to open session");
                err.code
            })?;

        debug!(uuid = %self.uuid, session = handle.id(), "session opened");
        let session = Arc::new(Session::new(Arc::clone(&self.ctx), handle));
        self.registry.register(&session);
        Ok(session)
    }

    fn destroy_session(&self, session: Arc<Session>) {
        debug!(session = session.id(), "closing session");

        // Out of the lookup table first so no new out-call can route to
        // it, then drain so nobody is left blocked, then close.
        self.registry.unregister(&session);
        session.drain();
        session.close_transport();
    }

    fn process_request(
        &self,
        session: &Arc<Session>,
        function: u32,
        input: &[u8],
        output_capacity: usize,
        sink: CompletionSink,
    ) -> Result<(), TeeError> {
        let header = RequestHeader::parse(input)?;
        if output_capacity < ResponseHeader::SIZE {
            return Err(TeeError::ShortBuffer);
        }
        if header.input_len > (input.len() - RequestHeader::SIZE) as u64 {
            warn!(
                declared = header.input_len,
                actual = input.len(),
                "declared input exceeds the supplied buffer"
            );
            return Err(TeeError::BadParameters);
        }
        if header.output_len > (output_capacity - ResponseHeader::SIZE) as u64 {
            warn!(
                declared = header.output_len,
                output_capacity, "declared output exceeds the supplied buffer"
            );
            return Err(TeeError::BadParameters);
        }

        let payload =
            input[RequestHeader::SIZE..RequestHeader::SIZE + header.input_len as usize].to_vec();

        match header.kind()? {
            RequestKind::Command => session.submit(
                header.key,
                function,
                payload,
                header.output_len as usize,
                sink,
            ),
            RequestKind::OcallReply => {
                session.supply_reply(header.key, payload, header.output_len as usize, sink)
            }
        }
    }

    fn cancel_request(&self, session: &Arc<Session>, key: u32) {
        session.cancel(key);
    }
}

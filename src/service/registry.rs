// SPDX-License-Identifier: Apache-2.0

//! Process-wide lookup of open sessions by secure-assigned id.

use crate::rpc::{Dispatcher, OcallHandler};
use crate::TeeError;

use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

use super::request::Session;

/// The session table out-calls are routed through.
///
/// Holds weak references only: the service that opened a session owns it,
/// the registry merely finds it by id. One lock guards membership; the
/// scan is linear, which is fine at the expected scale of tens of
/// sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<Vec<Weak<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Routes out-calls from `dispatcher` through this registry.
    pub fn attach(self: &Arc<Self>, dispatcher: &Dispatcher) {
        let weak = Arc::downgrade(self);
        dispatcher.set_ocall_handler(weak);
    }

    pub(super) fn register(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.push(Arc::downgrade(session));
    }

    pub(super) fn unregister(&self, session: &Session) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|other| match other.upgrade() {
            Some(other) => !std::ptr::eq(other.as_ref(), session),
            None => false,
        });
    }

    /// Finds an open session by the id the secure side assigned.
    pub fn find_by_id(&self, id: u32) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .iter()
            .filter_map(Weak::upgrade)
            .find(|session| session.id() == id)
    }
}

impl OcallHandler for SessionRegistry {
    fn ocall(
        &self,
        session_id: u32,
        key: u32,
        rpc_type: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, TeeError> {
        let session = self.find_by_id(session_id).ok_or_else(|| {
            warn!(session_id, "out-call for unknown session");
            TeeError::Communication
        })?;
        session.receive_ocall(key, rpc_type, input, output)
    }
}

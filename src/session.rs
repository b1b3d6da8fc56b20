// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session (§3 Data Model): a connection-scoped handle selecting one
//! datastore and accumulating an edit before it is committed as a single
//! change through the Commit Protocol Engine (§4.F).

use crate::connection::Connection;
use crate::error::{ErrorInfo, Result};
use crate::types::{Datastore, SessionId};
use std::sync::Arc;

/// One client's view onto a datastore through a [`Connection`]. Edits
/// accumulate in an internal buffer until [`Session::apply`] commits them
/// as a single diff; [`Session::discard`] drops them unapplied.
///
/// Dropping a `Session` removes every subscription it originated, both the
/// in-process registry rows and their SHM mirror, via
/// [`Connection::del_session`] (§4.C `del_session`, "interleaving SHM
/// side-effects").
pub struct Session {
    connection: Arc<Connection>,
    id: SessionId,
    datastore: Datastore,
    pending: Vec<u8>,
}

impl Session {
    pub(crate) fn new_with_id(connection: Arc<Connection>, id: SessionId, datastore: Datastore) -> Self {
        Self {
            connection,
            id,
            datastore,
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn datastore(&self) -> Datastore {
        self.datastore
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Appends to the pending edit without committing it.
    pub fn edit(&mut self, diff: &[u8]) {
        self.pending.extend_from_slice(diff);
    }

    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Commits the accumulated edit as one change on `module` at this
    /// session's datastore, running the full Update → Change → Done/Abort
    /// protocol (§4.F). The pending buffer is cleared regardless of
    /// outcome — a failed commit must be re-edited from scratch, matching
    /// the Candidate/Running semantics the protocol is built around.
    pub fn apply(&mut self, module: &str) -> Result<Vec<ErrorInfo>> {
        let diff = std::mem::take(&mut self.pending);
        self.connection.engine().apply_change(module, self.datastore, &diff)
    }

    /// Drops the accumulated edit without committing it.
    pub fn discard(&mut self) {
        self.pending.clear();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.connection.del_session(self.id) {
            crate::warn!("session teardown failed to fully clear subscriptions: session={} err={e}", self.id.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn connection() -> (tempfile::TempDir, Arc<Connection>) {
        let dir = tempfile::tempdir().unwrap();
        let conn = Arc::new(Connection::attach_local(Config::builder().run_dir(dir.path()).build()).unwrap());
        (dir, conn)
    }

    #[test]
    fn apply_clears_pending_buffer_on_success() {
        let (_dir, conn) = connection();
        let mut session = conn.open_session(Datastore::Running);
        session.edit(b"a=1");
        let errors = session.apply("m").unwrap();
        assert!(errors.is_empty());
        assert!(session.pending().is_empty());
    }

    #[test]
    fn discard_drops_pending_edit() {
        let (_dir, conn) = connection();
        let mut session = conn.open_session(Datastore::Running);
        session.edit(b"a=1");
        session.discard();
        assert!(session.pending().is_empty());
    }

    #[test]
    fn two_sessions_on_the_same_connection_get_distinct_ids() {
        let (_dir, conn) = connection();
        let a = conn.open_session(Datastore::Running);
        let b = conn.open_session(Datastore::Candidate);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn dropping_a_session_removes_its_subscriptions() {
        use crate::callbacks::test_support::RecordingChangeCallback;
        use crate::registry::ChangeSubFlags;
        use crate::types::Priority;

        let (_dir, conn) = connection();
        let session = conn.open_session(Datastore::Running);
        let cb = Arc::new(RecordingChangeCallback::new(None));
        conn.subscribe_change(session.id(), "m", Datastore::Running, None, cb, Priority(0), ChangeSubFlags::default())
            .unwrap();
        let session_id = session.id();
        assert_eq!(conn.registry().count_for_session(session_id), 1);
        drop(session);
        assert_eq!(conn.registry().count_for_session(session_id), 0);
    }

    #[test]
    fn dropping_a_session_clears_its_shm_records_too() {
        use crate::callbacks::test_support::RecordingChangeCallback;
        use crate::registry::ChangeSubFlags;
        use crate::shm_index::ListKind;
        use crate::types::Priority;

        let dir = tempfile::tempdir().unwrap();
        let conn = Arc::new(Connection::attach(Config::builder().run_dir(dir.path()).build()).unwrap());
        let session = conn.open_session(Datastore::Running);
        let cb = Arc::new(RecordingChangeCallback::new(None));
        conn.subscribe_change(session.id(), "m", Datastore::Running, None, cb, Priority(0), ChangeSubFlags::default())
            .unwrap();
        let records = conn
            .shm()
            .unwrap()
            .read_list("m", ListKind::Change(Datastore::Running), std::time::Duration::from_secs(1))
            .unwrap();
        assert_eq!(records.len(), 1);

        drop(session);

        let records = conn
            .shm()
            .unwrap()
            .read_list("m", ListKind::Change(Datastore::Running), std::time::Duration::from_secs(1))
            .unwrap();
        assert!(records.is_empty());
    }
}

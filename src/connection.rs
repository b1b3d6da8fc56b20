// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection (§3 Data Model, §6 External Interfaces): a process's single
//! attachment to the subscription machinery. Owns a [`Cid`], the
//! in-process [`SubscriptionContext`], the [`CommitEngine`] that runs
//! commits on this process's behalf, and — when attached with SHM — the
//! [`ShmIndex`] every `subscribe_*`/`unsubscribe` call mirrors into.
//!
//! ## Registry ⇔ SHM parity
//!
//! Every subscribe call follows the same two-step shape: mutate the
//! in-process registry, then resync that one `(module|path, kind)` list's
//! SHM mirror. If the SHM step fails — lock timeout, growth failure — the
//! registry mutation is rolled back so the two never drift apart (§4.D
//! add/delete contract). Unsubscribe and suspend/resume follow the same
//! rule in reverse: mutate the registry (or the local suspended set)
//! first, then resync.

use crate::callbacks::{ChangeCallback, NotifCallback, OperGetCallback, RpcCallback};
use crate::config::Config;
use crate::engine::CommitEngine;
use crate::error::{Error, Result};
use crate::liveness;
use crate::notify::EventPipe;
use crate::registry::{ChangeSubFlags, Owner, SubscriptionContext};
use crate::shm::layout::{ExtShm, MainShm, SubRecord};
use crate::shm_index::{ListKind, ShmIndex};
use crate::types::{Cid, Datastore, Priority, SessionId, SubId};
use dashmap::DashSet;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A process's attachment to one subscription arena.
pub struct Connection {
    cid: Cid,
    config: Arc<Config>,
    registry: Arc<SubscriptionContext>,
    engine: CommitEngine,
    shm: Option<ShmIndex>,
    event_pipe: EventPipe,
    suspended: Arc<DashSet<SubId>>,
    session_ids: AtomicU32,
}

impl Connection {
    /// Attaches to the shared-memory arena named by `config.run_dir()`,
    /// creating the main/ext SHM files on first use (§4.A).
    pub fn attach(config: Config) -> Result<Self> {
        Self::attach_inner(config, true)
    }

    /// Attaches without mapping shared memory. Subscriptions stay purely
    /// in-process: useful for unit/integration tests and for embedding
    /// this crate in a single-process application with no cross-process
    /// peers.
    pub fn attach_local(config: Config) -> Result<Self> {
        Self::attach_inner(config, false)
    }

    fn attach_inner(config: Config, with_shm: bool) -> Result<Self> {
        let config = Arc::new(config);
        std::fs::create_dir_all(config.run_dir())?;
        if with_shm {
            match crate::shm::segment::Segment::sweep_stale_run_dir(config.run_dir()) {
                Ok(0) => {}
                Ok(n) => crate::info!("swept {n} stale SHM file(s) from {}", config.run_dir().display()),
                Err(e) => crate::warn!("stale-segment sweep failed: {e}"),
            }
        }
        let cid = Cid(std::process::id());
        let registry = Arc::new(SubscriptionContext::new(config.clone()));
        let suspended = Arc::new(DashSet::new());
        let engine = CommitEngine::with_suspended(registry.clone(), cid, suspended.clone());
        let shm = if with_shm { Some(Self::open_shm(&config)?) } else { None };
        let event_pipe = EventPipe::new()?;
        crate::info!("connection attached: cid={cid} run_dir={} shm={with_shm}", config.run_dir().display());
        Ok(Self {
            cid,
            config,
            registry,
            engine,
            shm,
            event_pipe,
            suspended,
            session_ids: AtomicU32::new(0),
        })
    }

    fn open_shm(config: &Config) -> Result<ShmIndex> {
        let main_path = config.main_shm_path();
        let main = if main_path.exists() {
            MainShm::open(&main_path)?
        } else {
            MainShm::create(&main_path, config.main_shm_initial_modules(), config.page_size())?
        };
        let ext_path = config.ext_shm_path();
        let ext = if ext_path.exists() {
            let size = std::fs::metadata(&ext_path)?.len() as usize;
            ExtShm::open(&ext_path, size)?
        } else {
            ExtShm::create(&ext_path, config.ext_shm_initial_bytes())?
        };
        Ok(ShmIndex::new(main, ext))
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionContext> {
        &self.registry
    }

    pub fn engine(&self) -> &CommitEngine {
        &self.engine
    }

    pub fn shm(&self) -> Option<&ShmIndex> {
        self.shm.as_ref()
    }

    /// `get_event_pipe(ctx) -> fd` (§6): the descriptor an external event
    /// loop polls for readability before calling
    /// [`crate::dispatch::process_events`].
    pub fn get_event_pipe(&self) -> RawFd {
        self.event_pipe.fd()
    }

    pub(crate) fn event_pipe(&self) -> &EventPipe {
        &self.event_pipe
    }

    fn next_session_id(&self) -> SessionId {
        SessionId(self.session_ids.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Opens a new [`crate::session::Session`] scoped to this connection.
    pub fn open_session(self: &Arc<Self>, datastore: Datastore) -> crate::session::Session {
        let id = self.next_session_id();
        crate::session::Session::new_with_id(self.clone(), id, datastore)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn subscribe_change(
        &self,
        session: SessionId,
        module: &str,
        datastore: Datastore,
        xpath: Option<String>,
        callback: Arc<dyn ChangeCallback>,
        priority: Priority,
        flags: ChangeSubFlags,
    ) -> Result<SubId> {
        let wants_enabled = flags.contains(ChangeSubFlags::WANTS_ENABLED);
        let enabled_cb = if wants_enabled { Some(callback.clone()) } else { None };
        let sub_id = self.registry.add_change(session, module, datastore, xpath, callback, priority, flags)?;
        let insertion_index = self
            .registry
            .change_snapshot(module, datastore)
            .into_iter()
            .find(|(id, ..)| *id == sub_id)
            .map(|(_, _, _, idx)| idx)
            .unwrap_or(0);

        // §4.F ENABLED: sent synchronously during subscribe, not through a
        // channel wave; a rejecting subscriber aborts the subscribe call
        // and its registry-side state is rolled back before returning.
        if let Some(cb) = enabled_cb {
            if let Err(info) = cb.on_event(crate::types::EventKind::Enabled, 0, &[]) {
                crate::error!("ENABLED callback rejected subscribe: module={module} ds={datastore} code={}", info.code);
                let _ = self.registry.del_change(sub_id);
                return Err(Error::CallbackFailed(info));
            }
        }

        let record = self.record(sub_id, priority.0, flags.0, insertion_index);
        if let Err(e) = self.add_shm_record(module, ListKind::Change(datastore), record) {
            let _ = self.registry.del_change(sub_id);
            return Err(e);
        }
        crate::info!("change subscription added: module={module} ds={datastore} sub={sub_id}");
        Ok(sub_id)
    }

    pub fn subscribe_oper_get(
        &self,
        session: SessionId,
        module: &str,
        path: &str,
        callback: Arc<dyn OperGetCallback>,
        priority: Priority,
    ) -> Result<SubId> {
        let sub_id = self.registry.add_oper_get(session, module, path, callback, priority)?;
        let record = self.record(sub_id, priority.0, 0, 0);
        if let Err(e) = self.add_shm_record(module, ListKind::OperGet, record) {
            let _ = self.registry.del_oper_get(sub_id);
            return Err(e);
        }
        Ok(sub_id)
    }

    pub fn subscribe_oper_poll(&self, session: SessionId, module: &str, path: &str, valid_ms: u32) -> Result<SubId> {
        let sub_id = self.registry.add_oper_poll(session, module, path, valid_ms)?;
        let record = self.record(sub_id, 0, 0, 0);
        if let Err(e) = self.add_shm_record(module, ListKind::OperPoll, record) {
            let _ = self.registry.del_oper_poll(sub_id);
            return Err(e);
        }
        Ok(sub_id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn subscribe_notif(
        &self,
        session: SessionId,
        module: &str,
        xpath: Option<String>,
        since_mono_ns: u64,
        since_real_ns: u64,
        start_ns: Option<u64>,
        stop_ns: Option<u64>,
        callback: Arc<dyn NotifCallback>,
    ) -> Result<SubId> {
        let sub_id = self
            .registry
            .add_notif(session, module, xpath, since_mono_ns, since_real_ns, start_ns, stop_ns, callback)?;
        let record = self.record(sub_id, 0, 0, 0);
        if let Err(e) = self.add_shm_record(module, ListKind::Notif, record) {
            let _ = self.registry.del_notif(sub_id);
            return Err(e);
        }
        Ok(sub_id)
    }

    pub fn subscribe_rpc(
        &self,
        session: SessionId,
        path: &str,
        is_extension: bool,
        xpath: Option<String>,
        callback: Arc<dyn RpcCallback>,
        priority: Priority,
    ) -> Result<SubId> {
        let sub_id = self.registry.add_rpc(session, path, is_extension, xpath, callback, priority)?;
        let record = self.record(sub_id, priority.0, 0, 0);
        if let Err(e) = self.add_shm_record(path, ListKind::Rpc, record) {
            let _ = self.registry.del_rpc(sub_id);
            return Err(e);
        }
        Ok(sub_id)
    }

    /// `unsubscribe(sub_id)` (§6). `None` tears down every subscription
    /// this context owns, mirroring §4.C's `del(0)`.
    pub fn unsubscribe(&self, sub_id: Option<SubId>) -> Result<()> {
        match sub_id {
            None => {
                let owners: Vec<(SubId, Owner)> = self
                    .registry
                    .all_owners()
                    .into_iter()
                    .flat_map(|owner| self.sub_ids_for(&owner).into_iter().map(move |id| (id, owner.clone())))
                    .collect();
                self.registry.del(None)?;
                self.suspended.clear();
                for (id, owner) in owners {
                    self.remove_shm_record(&owner, id)?;
                }
                Ok(())
            }
            Some(id) => {
                let owner = self.registry.find_owner(id);
                self.registry.del(Some(id))?;
                self.suspended.remove(&id);
                if let Some(owner) = owner {
                    self.remove_shm_record(&owner, id)?;
                }
                Ok(())
            }
        }
    }

    /// Removes every subscription `session` originated in this context,
    /// mirroring each one's SHM removal the same way `unsubscribe(None)`
    /// does (§4.C `del_session` "interleaving SHM side-effects"). Called
    /// from [`crate::session::Session::drop`]; also callable directly
    /// during session teardown.
    pub fn del_session(&self, session: SessionId) -> Result<()> {
        let owners = self.registry.owners_for_session(session);
        self.registry.del_session(session);
        for (id, owner) in &owners {
            self.suspended.remove(id);
            self.remove_shm_record(owner, *id)?;
        }
        Ok(())
    }

    pub fn suspend(&self, sub_id: SubId) -> Result<()> {
        self.set_suspended(sub_id, true)
    }

    pub fn resume(&self, sub_id: SubId) -> Result<()> {
        self.set_suspended(sub_id, false)
    }

    pub fn is_suspended(&self, sub_id: SubId) -> bool {
        self.suspended.contains(&sub_id)
    }

    fn set_suspended(&self, sub_id: SubId, value: bool) -> Result<()> {
        if value {
            self.suspended.insert(sub_id);
        } else {
            self.suspended.remove(&sub_id);
        }
        if let Some(shm) = &self.shm {
            if let Some(owner) = self.registry.find_owner(sub_id) {
                let (name, kind) = owner_name_and_kind(&owner);
                shm.set_suspended(&name, kind, sub_id.0, value, self.config.lock_timeout())?;
            }
        }
        Ok(())
    }

    /// Removes every notification subscription whose bounded `stop` time
    /// has elapsed, delivering the synthetic `TERMINATED` each gets and
    /// removing its SHM mirror. Callers typically run this periodically
    /// from the same loop driving [`crate::dispatch::process_events`].
    pub fn expire_notifications(&self, now_real_ns: u64) -> Result<Vec<SubId>> {
        let expired = self.registry.expire_notifications(now_real_ns);
        for (sub_id, module) in &expired {
            self.suspended.remove(sub_id);
            self.remove_shm_record(&Owner::Notif(module.clone()), *sub_id)?;
        }
        Ok(expired.into_iter().map(|(id, _)| id).collect())
    }

    /// Opportunistically sweeps `module`'s SHM lists for subscribers whose
    /// owning process is no longer alive (§4.G). Returns how many were
    /// removed; a no-op when attached without SHM.
    pub fn reap_dead(&self, module: &str) -> Result<usize> {
        match &self.shm {
            Some(shm) => liveness::reap_dead_subscribers(shm, module, self.config.lock_timeout()),
            None => Ok(0),
        }
    }

    /// Appends one record to the SHM list `owner` addresses. A no-op when
    /// attached without SHM.
    fn add_shm_record(&self, name: &str, kind: ListKind, record: SubRecord) -> Result<()> {
        let Some(shm) = &self.shm else { return Ok(()) };
        shm.add_record(name, kind, record, self.config.lock_timeout())
    }

    /// Removes `sub_id`'s record from the SHM list `owner` addresses. A
    /// no-op when attached without SHM.
    fn remove_shm_record(&self, owner: &Owner, sub_id: SubId) -> Result<()> {
        let Some(shm) = &self.shm else { return Ok(()) };
        let (name, kind) = owner_name_and_kind(owner);
        shm.remove_record(&name, kind, sub_id.0, self.config.lock_timeout())?;
        Ok(())
    }

    /// Every sub id this registry currently attributes to `owner`, used by
    /// `unsubscribe(None)` to remove each SHM record individually before
    /// the registry side is cleared wholesale.
    fn sub_ids_for(&self, owner: &Owner) -> Vec<SubId> {
        match owner {
            Owner::Change(module, ds) => self.registry.change_snapshot(module, *ds).into_iter().map(|(id, ..)| id).collect(),
            Owner::OperGet(module) => self.registry.oper_get_snapshot(module).into_iter().map(|(id, ..)| id).collect(),
            Owner::OperPoll(module) => self.registry.oper_poll_snapshot(module),
            Owner::Notif(module) => self.registry.notif_snapshot(module),
            Owner::Rpc(path) => self.registry.rpc_snapshot(path).into_iter().map(|(id, ..)| id).collect(),
        }
    }

    /// This crate does not expose named cross-process eventfds (§9 Design
    /// Notes — wake is polling-based via [`Connection::reap_dead`] and
    /// [`crate::dispatch::process_events`]); `event_pipe_id` is carried as
    /// zero for layout fidelity with the SHM record format only.
    fn record(&self, sub_id: SubId, priority: i32, flags: u32, insertion_index: u32) -> SubRecord {
        let mut record = SubRecord::new(sub_id.0, self.cid.0, priority, flags, 0, insertion_index);
        record.suspended = u32::from(self.suspended.contains(&sub_id));
        record
    }
}

fn owner_name_and_kind(owner: &Owner) -> (String, ListKind) {
    match owner {
        Owner::Change(module, ds) => (module.clone(), ListKind::Change(*ds)),
        Owner::OperGet(module) => (module.clone(), ListKind::OperGet),
        Owner::OperPoll(module) => (module.clone(), ListKind::OperPoll),
        Owner::Notif(module) => (module.clone(), ListKind::Notif),
        Owner::Rpc(path) => (path.clone(), ListKind::Rpc),
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Graceful teardown: release every subscription (and its SHM
        // mirror) rather than leaving this cid's records for a peer's
        // liveness sweep to clean up later.
        if let Err(e) = self.unsubscribe(None) {
            crate::warn!("connection teardown failed to fully clear subscriptions: cid={} err={e}", self.cid);
        }
    }
}

/// Blocks up to `timeout` for `fd` to become readable. Used by
/// [`crate::dispatch::process_events`] to wait on [`Connection::get_event_pipe`].
#[cfg(target_os = "linux")]
pub(crate) fn wait_readable(fd: RawFd, timeout: Duration) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    // SAFETY: `pfd` is a single live stack-allocated entry for the
    // duration of this call; `fd` is owned by the caller's `EventPipe`.
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(ret > 0 && (pfd.revents & libc::POLLIN) != 0)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn wait_readable(_fd: RawFd, _timeout: Duration) -> Result<bool> {
    Ok(true)
}

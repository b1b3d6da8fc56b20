// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscription Registry (§4.C): the in-process table of live
//! subscriptions for one subscription context, grouped by kind.
//!
//! Guarded by `subs_lock`, reused here as an in-process
//! none/read/read-upgradable/write lock via `parking_lot`'s upgradable
//! read guard — the same three modes §4.B defines for the cross-process
//! SHM locks, just without a futex, since this lock only ever has
//! in-process contenders.
//!
//! Removal everywhere is swap-with-last (§3 invariants, §9 Design Notes):
//! preserves O(1) removal and matches the SHM Subscription Index's array
//! layout one-for-one.

use crate::callbacks::{ChangeCallback, NotifCallback, OperGetCallback, RpcCallback};
use crate::channel::Channel;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{hash_path, hash_path_priority, Datastore, Priority, SessionId, SubId, SubIdGenerator};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64
}

/// Opt-in flags for a change subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeSubFlags(pub u32);

impl ChangeSubFlags {
    pub const WANTS_UPDATE: Self = Self(1 << 0);
    pub const WANTS_ENABLED: Self = Self(1 << 1);

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for ChangeSubFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

pub struct ChangeSub {
    pub sub_id: SubId,
    pub xpath: Option<String>,
    pub priority: Priority,
    pub flags: ChangeSubFlags,
    pub callback: Arc<dyn ChangeCallback>,
    pub session: SessionId,
    pub insertion_index: u32,
}

pub struct ChangeGroup {
    pub channel: Arc<Channel>,
    pub subs: Vec<ChangeSub>,
}

pub struct OperGetSub {
    pub sub_id: SubId,
    pub path: String,
    pub priority: Priority,
    pub callback: Arc<dyn OperGetCallback>,
    pub session: SessionId,
    pub channel: Arc<Channel>,
    pub insertion_index: u32,
}

pub struct OperPollSub {
    pub sub_id: SubId,
    pub path: String,
    pub valid_ms: u32,
    pub session: SessionId,
}

pub struct NotifSub {
    pub sub_id: SubId,
    pub xpath: Option<String>,
    pub since_mono_ns: u64,
    pub since_real_ns: u64,
    pub start_ns: Option<u64>,
    pub stop_ns: Option<u64>,
    pub callback: Arc<dyn NotifCallback>,
    pub session: SessionId,
    pub subscribe_timestamp_ns: u64,
}

pub struct RpcSub {
    pub sub_id: SubId,
    pub xpath: Option<String>,
    pub priority: Priority,
    pub callback: Arc<dyn RpcCallback>,
    pub session: SessionId,
    pub insertion_index: u32,
}

pub struct RpcGroup {
    pub is_extension: bool,
    pub channel: Arc<Channel>,
    pub subs: Vec<RpcSub>,
}

/// Where a found subscription lives, so callers can route deletes/updates
/// without re-deriving the owning key.
#[derive(Debug, Clone)]
pub enum Owner {
    Change(String, Datastore),
    OperGet(String),
    OperPoll(String),
    Notif(String),
    Rpc(String),
}

#[derive(Default)]
struct RegistryInner {
    change: HashMap<(String, Datastore), ChangeGroup>,
    oper_get: HashMap<String, Vec<OperGetSub>>,
    oper_poll: HashMap<String, Vec<OperPollSub>>,
    notif: HashMap<String, Vec<NotifSub>>,
    notif_channels: HashMap<String, Arc<Channel>>,
    rpc: HashMap<String, RpcGroup>,
}

/// Process-local grouping of subscriptions owned by an application (§3).
pub struct SubscriptionContext {
    config: Arc<Config>,
    id_gen: SubIdGenerator,
    inner: RwLock<RegistryInner>,
}

impl SubscriptionContext {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            id_gen: SubIdGenerator::new(),
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub fn last_sub_id(&self) -> u32 {
        self.id_gen.last()
    }

    fn open_change_channel(&self, module: &str, ds: Datastore) -> Result<Arc<Channel>> {
        let path = self.config.change_channel_path(module, ds);
        let reply_cap = 64;
        let payload_cap = 64 * 1024;
        let channel = if path.exists() {
            Channel::open(&path, payload_cap, reply_cap)?
        } else {
            Channel::create(&path, payload_cap, reply_cap, self.config.page_size())?
        };
        Ok(Arc::new(channel))
    }

    fn open_oper_get_channel(&self, module: &str, path: &str, priority: Priority) -> Result<Arc<Channel>> {
        let hash = hash_path_priority(path, priority);
        let file_path = self.config.oper_get_channel_path(module, hash);
        let channel = Channel::create(&file_path, 64 * 1024, 1, self.config.page_size())?;
        Ok(Arc::new(channel))
    }

    fn open_notif_channel(&self, module: &str) -> Result<Arc<Channel>> {
        let file_path = self.config.notif_channel_path(module);
        let channel = if file_path.exists() {
            Channel::open(&file_path, 64 * 1024, 64)?
        } else {
            Channel::create(&file_path, 64 * 1024, 64, self.config.page_size())?
        };
        Ok(Arc::new(channel))
    }

    fn open_rpc_channel(&self, path: &str) -> Result<Arc<Channel>> {
        let hash = hash_path(path);
        let file_path = self.config.rpc_channel_path("rpc", hash);
        let channel = Channel::create(&file_path, 64 * 1024, 32, self.config.page_size())?;
        Ok(Arc::new(channel))
    }

    // ---- add_* (write mode) ----

    pub fn add_change(
        &self,
        session: SessionId,
        module: &str,
        datastore: Datastore,
        xpath: Option<String>,
        callback: Arc<dyn ChangeCallback>,
        priority: Priority,
        flags: ChangeSubFlags,
    ) -> Result<SubId> {
        let sub_id = self.id_gen.next();
        let mut inner = self.inner.write();
        let key = (module.to_string(), datastore);
        let is_new_group = !inner.change.contains_key(&key);
        if is_new_group {
            let channel = self.open_change_channel(module, datastore)?;
            inner.change.insert(key.clone(), ChangeGroup { channel, subs: Vec::new() });
        }
        let group = inner.change.get_mut(&key).expect("just inserted or already present");
        let insertion_index = group.subs.len() as u32;
        group.subs.push(ChangeSub {
            sub_id,
            xpath,
            priority,
            flags,
            callback,
            session,
            insertion_index,
        });
        Ok(sub_id)
    }

    pub fn add_oper_get(
        &self,
        session: SessionId,
        module: &str,
        path: &str,
        callback: Arc<dyn OperGetCallback>,
        priority: Priority,
    ) -> Result<SubId> {
        let mut inner = self.inner.write();
        let existing = inner.oper_get.entry(module.to_string()).or_default();
        // §9 Open question (b): reject a racing duplicate (path, priority)
        // with EXISTS, checked under the same write lock that inserts.
        if existing.iter().any(|s| s.path == path && s.priority == priority) {
            return Err(Error::Exists(format!("oper-get already subscribed: {module}{path}@{priority:?}")));
        }
        let sub_id = self.id_gen.next();
        let channel = self.open_oper_get_channel(module, path, priority)?;
        let insertion_index = existing.len() as u32;
        existing.push(OperGetSub {
            sub_id,
            path: path.to_string(),
            priority,
            callback,
            session,
            channel,
            insertion_index,
        });
        Ok(sub_id)
    }

    pub fn add_oper_poll(&self, session: SessionId, module: &str, path: &str, valid_ms: u32) -> Result<SubId> {
        let sub_id = self.id_gen.next();
        let mut inner = self.inner.write();
        inner.oper_poll.entry(module.to_string()).or_default().push(OperPollSub {
            sub_id,
            path: path.to_string(),
            valid_ms,
            session,
        });
        Ok(sub_id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_notif(
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
        let sub_id = self.id_gen.next();
        let mut inner = self.inner.write();
        if !inner.notif_channels.contains_key(module) {
            // One channel per module, shared by all notif subscribers on it.
            let channel = self.open_notif_channel(module)?;
            inner.notif_channels.insert(module.to_string(), channel);
            inner.notif.insert(module.to_string(), Vec::new());
        }
        let list = inner.notif.entry(module.to_string()).or_default();
        list.push(NotifSub {
            sub_id,
            xpath,
            since_mono_ns,
            since_real_ns,
            start_ns,
            stop_ns,
            callback,
            session,
            subscribe_timestamp_ns: now_ns(),
        });
        Ok(sub_id)
    }

    pub fn add_rpc(
        &self,
        session: SessionId,
        path: &str,
        is_extension: bool,
        xpath: Option<String>,
        callback: Arc<dyn RpcCallback>,
        priority: Priority,
    ) -> Result<SubId> {
        let sub_id = self.id_gen.next();
        let mut inner = self.inner.write();
        if !inner.rpc.contains_key(path) {
            let channel = self.open_rpc_channel(path)?;
            inner.rpc.insert(
                path.to_string(),
                RpcGroup {
                    is_extension,
                    channel,
                    subs: Vec::new(),
                },
            );
        }
        let group = inner.rpc.get_mut(path).expect("just inserted or present");
        let insertion_index = group.subs.len() as u32;
        group.subs.push(RpcSub {
            sub_id,
            xpath,
            priority,
            callback,
            session,
            insertion_index,
        });
        Ok(sub_id)
    }

    // ---- del_* ----

    pub fn del_change(&self, sub_id: SubId) -> Result<()> {
        let mut inner = self.inner.write();
        let mut empty_key = None;
        for (key, group) in inner.change.iter_mut() {
            if let Some(idx) = group.subs.iter().position(|s| s.sub_id == sub_id) {
                group.subs.swap_remove(idx);
                if group.subs.is_empty() {
                    empty_key = Some(key.clone());
                }
                break;
            }
        }
        if let Some(key) = empty_key {
            inner.change.remove(&key);
        }
        Ok(())
    }

    pub fn del_oper_get(&self, sub_id: SubId) -> Result<()> {
        let mut inner = self.inner.write();
        let mut empty_key = None;
        for (key, list) in inner.oper_get.iter_mut() {
            if let Some(idx) = list.iter().position(|s| s.sub_id == sub_id) {
                list.swap_remove(idx);
                if list.is_empty() {
                    empty_key = Some(key.clone());
                }
                break;
            }
        }
        if let Some(key) = empty_key {
            inner.oper_get.remove(&key);
        }
        Ok(())
    }

    /// Also drops the connection's operational cache entry keyed by
    /// `sub_id` (§4.C) — modeled here as the caller's responsibility since
    /// the cache lives on the owning `Connection`, not the registry.
    pub fn del_oper_poll(&self, sub_id: SubId) -> Result<()> {
        let mut inner = self.inner.write();
        let mut empty_key = None;
        for (key, list) in inner.oper_poll.iter_mut() {
            if let Some(idx) = list.iter().position(|s| s.sub_id == sub_id) {
                list.swap_remove(idx);
                if list.is_empty() {
                    empty_key = Some(key.clone());
                }
                break;
            }
        }
        if let Some(key) = empty_key {
            inner.oper_poll.remove(&key);
        }
        Ok(())
    }

    pub fn del_rpc(&self, sub_id: SubId) -> Result<()> {
        let mut inner = self.inner.write();
        let mut empty_key = None;
        for (key, group) in inner.rpc.iter_mut() {
            if let Some(idx) = group.subs.iter().position(|s| s.sub_id == sub_id) {
                group.subs.swap_remove(idx);
                if group.subs.is_empty() {
                    empty_key = Some(key.clone());
                }
                break;
            }
        }
        if let Some(key) = empty_key {
            inner.rpc.remove(&key);
        }
        Ok(())
    }

    /// §4.C del_notif: mark any unprocessed SHM event for this subscriber
    /// ignored, then deliver a synthetic `TERMINATED` callback — performed
    /// while the write lock is released to a read-upgradable-equivalent
    /// state so the callback cannot re-enter and block (§9 callback
    /// reentrancy). `parking_lot`'s plain `write()` has no downgrade step,
    /// so we model the "downgrade" by releasing the write guard before
    /// invoking the callback and re-acquiring only to finish removing the
    /// entry, matching the two-phase shape of the source pattern exactly.
    pub fn del_notif(&self, sub_id: SubId) -> Result<()> {
        let callback = {
            let mut inner = self.inner.write();
            let mut found = None;
            let mut module_key = None;
            for (module, list) in inner.notif.iter_mut() {
                if let Some(idx) = list.iter().position(|s| s.sub_id == sub_id) {
                    let removed = list.swap_remove(idx);
                    found = Some(removed.callback);
                    module_key = Some(module.clone());
                    break;
                }
            }
            let Some(callback) = found else {
                return Err(Error::NotFound(format!("{sub_id}")));
            };
            // §4.C del_notif (i): the module's notif channel is broadcast
            // (one per module, not per subscriber), so "an unprocessed
            // event for this subscriber" collapses to "a pending event
            // still sitting in this module's channel" — flag it ignored
            // the same way a stale oper-get request is (§4.F), rather than
            // leaving it for a subscriber that is about to be gone.
            if let Some(module) = &module_key {
                if let Some(channel) = inner.notif_channels.get(module) {
                    if !matches!(channel.event_kind(), Some(crate::types::EventKind::None)) {
                        channel.mark_ignored();
                    }
                }
            }
            callback
        };
        // The write guard above is released before the callback runs, so a
        // synchronous TERMINATED delivery can't deadlock re-entering this
        // context (§9 callback reentrancy).
        callback.on_terminated(now_ns());
        Ok(())
    }

    // ---- find / count / del(session|all) ----

    pub fn find_owner(&self, sub_id: SubId) -> Option<Owner> {
        let inner = self.inner.read();
        for ((module, ds), group) in &inner.change {
            if group.subs.iter().any(|s| s.sub_id == sub_id) {
                return Some(Owner::Change(module.clone(), *ds));
            }
        }
        for (module, list) in &inner.oper_get {
            if list.iter().any(|s| s.sub_id == sub_id) {
                return Some(Owner::OperGet(module.clone()));
            }
        }
        for (module, list) in &inner.oper_poll {
            if list.iter().any(|s| s.sub_id == sub_id) {
                return Some(Owner::OperPoll(module.clone()));
            }
        }
        for (module, list) in &inner.notif {
            if list.iter().any(|s| s.sub_id == sub_id) {
                return Some(Owner::Notif(module.clone()));
            }
        }
        for (path, group) in &inner.rpc {
            if group.subs.iter().any(|s| s.sub_id == sub_id) {
                return Some(Owner::Rpc(path.clone()));
            }
        }
        None
    }

    pub fn count_for_session(&self, session: SessionId) -> usize {
        let inner = self.inner.read();
        let mut count = 0;
        count += inner
            .change
            .values()
            .flat_map(|g| g.subs.iter())
            .filter(|s| s.session == session)
            .count();
        count += inner
            .oper_get
            .values()
            .flatten()
            .filter(|s| s.session == session)
            .count();
        count += inner
            .oper_poll
            .values()
            .flatten()
            .filter(|s| s.session == session)
            .count();
        count += inner
            .notif
            .values()
            .flatten()
            .filter(|s| s.session == session)
            .count();
        count += inner
            .rpc
            .values()
            .flat_map(|g| g.subs.iter())
            .filter(|s| s.session == session)
            .count();
        count
    }

    /// Every `(sub_id, owner)` pair originated by `session`, so a caller
    /// (`Connection::del_session`) can remove each one's SHM mirror before
    /// the registry side is cleared wholesale, the same
    /// gather-then-clear-then-unmirror shape `unsubscribe(None)` uses.
    pub fn owners_for_session(&self, session: SessionId) -> Vec<(SubId, Owner)> {
        let inner = self.inner.read();
        let mut owners = Vec::new();
        for ((module, ds), group) in &inner.change {
            owners.extend(group.subs.iter().filter(|s| s.session == session).map(|s| (s.sub_id, Owner::Change(module.clone(), *ds))));
        }
        for (module, list) in &inner.oper_get {
            owners.extend(list.iter().filter(|s| s.session == session).map(|s| (s.sub_id, Owner::OperGet(module.clone()))));
        }
        for (module, list) in &inner.oper_poll {
            owners.extend(list.iter().filter(|s| s.session == session).map(|s| (s.sub_id, Owner::OperPoll(module.clone()))));
        }
        for (module, list) in &inner.notif {
            owners.extend(list.iter().filter(|s| s.session == session).map(|s| (s.sub_id, Owner::Notif(module.clone()))));
        }
        for (path, group) in &inner.rpc {
            owners.extend(group.subs.iter().filter(|s| s.session == session).map(|s| (s.sub_id, Owner::Rpc(path.clone()))));
        }
        owners
    }

    /// Remove every subscription in the context originated by `session`
    /// (§4.C del_session, used during session teardown).
    pub fn del_session(&self, session: SessionId) {
        let mut inner = self.inner.write();
        let mut empty_change = Vec::new();
        for (key, group) in inner.change.iter_mut() {
            group.subs.retain(|s| s.session != session);
            if group.subs.is_empty() {
                empty_change.push(key.clone());
            }
        }
        for key in empty_change {
            inner.change.remove(&key);
        }

        retain_and_prune(&mut inner.oper_get, session);
        retain_and_prune(&mut inner.oper_poll, session);
        retain_and_prune(&mut inner.notif, session);

        let mut empty_rpc = Vec::new();
        for (key, group) in inner.rpc.iter_mut() {
            group.subs.retain(|s| s.session != session);
            if group.subs.is_empty() {
                empty_rpc.push(key.clone());
            }
        }
        for key in empty_rpc {
            inner.rpc.remove(&key);
        }
    }

    /// `del(sub_id_or_zero)` (§4.C): zero removes every subscription in the
    /// context; nonzero removes just that one.
    pub fn del(&self, sub_id: Option<SubId>) -> Result<()> {
        match sub_id {
            None => {
                let mut inner = self.inner.write();
                *inner = RegistryInner::default();
                Ok(())
            }
            Some(id) => match self.find_owner(id) {
                Some(Owner::Change(..)) => self.del_change(id),
                Some(Owner::OperGet(_)) => self.del_oper_get(id),
                Some(Owner::OperPoll(_)) => self.del_oper_poll(id),
                Some(Owner::Notif(_)) => self.del_notif(id),
                Some(Owner::Rpc(_)) => self.del_rpc(id),
                None => Err(Error::NotFound(format!("{id}"))),
            },
        }
    }

    /// Visits change subscribers for a (module, datastore) in strictly
    /// descending priority, insertion order breaking ties (§4.C priority
    /// and ordering).
    pub fn change_waves(&self, module: &str, datastore: Datastore) -> Vec<Vec<SubId>> {
        let inner = self.inner.read();
        let Some(group) = inner.change.get(&(module.to_string(), datastore)) else {
            return Vec::new();
        };
        build_waves(&group.subs, |s| (s.priority, s.insertion_index, s.sub_id))
    }

    pub fn with_change_group<R>(&self, module: &str, datastore: Datastore, f: impl FnOnce(Option<&ChangeGroup>) -> R) -> R {
        let inner = self.inner.read();
        f(inner.change.get(&(module.to_string(), datastore)))
    }

    pub fn with_rpc_group<R>(&self, path: &str, f: impl FnOnce(Option<&RpcGroup>) -> R) -> R {
        let inner = self.inner.read();
        f(inner.rpc.get(path))
    }

    pub fn with_oper_get<R>(&self, module: &str, f: impl FnOnce(&[OperGetSub]) -> R) -> R {
        let inner = self.inner.read();
        f(inner.oper_get.get(module).map(Vec::as_slice).unwrap_or(&[]))
    }

    pub fn with_notif_subs<R>(&self, module: &str, f: impl FnOnce(&[NotifSub]) -> R) -> R {
        let inner = self.inner.read();
        f(inner.notif.get(module).map(Vec::as_slice).unwrap_or(&[]))
    }

    pub fn notif_channel(&self, module: &str) -> Option<Arc<Channel>> {
        let inner = self.inner.read();
        inner.notif_channels.get(module).cloned()
    }

    /// Every (module/path, kind) group currently holding at least one
    /// subscription, for callers that need to resync or tear down the whole
    /// context rather than one known owner (e.g. `del(None)`).
    pub fn all_owners(&self) -> Vec<Owner> {
        let inner = self.inner.read();
        let mut owners = Vec::new();
        owners.extend(inner.change.keys().map(|(module, ds)| Owner::Change(module.clone(), *ds)));
        owners.extend(inner.oper_get.keys().cloned().map(Owner::OperGet));
        owners.extend(inner.oper_poll.keys().cloned().map(Owner::OperPoll));
        owners.extend(inner.notif.keys().cloned().map(Owner::Notif));
        owners.extend(inner.rpc.keys().cloned().map(Owner::Rpc));
        owners
    }

    /// Snapshot of `(sub_id, priority, flags, insertion_index)` for a change
    /// group, in registry order — the shape the SHM Subscription Index needs
    /// to mirror a group (§4.D).
    pub fn change_snapshot(&self, module: &str, datastore: Datastore) -> Vec<(SubId, Priority, ChangeSubFlags, u32)> {
        let inner = self.inner.read();
        inner
            .change
            .get(&(module.to_string(), datastore))
            .map(|g| g.subs.iter().map(|s| (s.sub_id, s.priority, s.flags, s.insertion_index)).collect())
            .unwrap_or_default()
    }

    pub fn oper_get_snapshot(&self, module: &str) -> Vec<(SubId, Priority, u32)> {
        let inner = self.inner.read();
        inner
            .oper_get
            .get(module)
            .map(|l| l.iter().map(|s| (s.sub_id, s.priority, s.insertion_index)).collect())
            .unwrap_or_default()
    }

    pub fn oper_poll_snapshot(&self, module: &str) -> Vec<SubId> {
        let inner = self.inner.read();
        inner.oper_poll.get(module).map(|l| l.iter().map(|s| s.sub_id).collect()).unwrap_or_default()
    }

    pub fn notif_snapshot(&self, module: &str) -> Vec<SubId> {
        let inner = self.inner.read();
        inner.notif.get(module).map(|l| l.iter().map(|s| s.sub_id).collect()).unwrap_or_default()
    }

    pub fn rpc_snapshot(&self, path: &str) -> Vec<(SubId, Priority, u32)> {
        let inner = self.inner.read();
        inner
            .rpc
            .get(path)
            .map(|g| g.subs.iter().map(|s| (s.sub_id, s.priority, s.insertion_index)).collect())
            .unwrap_or_default()
    }

    /// Delivers a synthetic `TERMINATED` to and removes every notification
    /// subscription whose `stop_ns` has elapsed (§3 scenario: bounded-time
    /// notification subscriptions auto-unsubscribe at `stop`). Returns each
    /// removed subscription's id alongside its owning module, so the caller
    /// can resync SHM per module after the registry-side removal.
    pub fn expire_notifications(&self, now_real_ns: u64) -> Vec<(SubId, String)> {
        let expired: Vec<(SubId, String)> = {
            let inner = self.inner.read();
            inner
                .notif
                .iter()
                .flat_map(|(module, subs)| {
                    subs.iter()
                        .filter(|s| matches!(s.stop_ns, Some(stop) if now_real_ns >= stop))
                        .map(|s| (s.sub_id, module.clone()))
                })
                .collect()
        };
        for (sub_id, _) in &expired {
            let _ = self.del_notif(*sub_id);
        }
        expired
    }
}

fn retain_and_prune<T>(map: &mut HashMap<String, Vec<T>>, session: SessionId)
where
    T: HasSession,
{
    let mut empty = Vec::new();
    for (key, list) in map.iter_mut() {
        list.retain(|item| item.session() != session);
        if list.is_empty() {
            empty.push(key.clone());
        }
    }
    for key in empty {
        map.remove(&key);
    }
}

trait HasSession {
    fn session(&self) -> SessionId;
}
impl HasSession for OperGetSub {
    fn session(&self) -> SessionId {
        self.session
    }
}
impl HasSession for OperPollSub {
    fn session(&self) -> SessionId {
        self.session
    }
}
impl HasSession for NotifSub {
    fn session(&self) -> SessionId {
        self.session
    }
}

/// Groups items sharing the same priority into waves, in descending
/// priority order with insertion order breaking ties within a wave.
pub fn build_waves<T>(items: &[T], key: impl Fn(&T) -> (Priority, u32, SubId)) -> Vec<Vec<SubId>> {
    let mut ordered: Vec<(Priority, u32, SubId)> = items.iter().map(&key).collect();
    ordered.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    let mut waves: Vec<Vec<SubId>> = Vec::new();
    let mut current_priority: Option<Priority> = None;
    for (priority, _, sub_id) in ordered {
        if current_priority == Some(priority) {
            waves.last_mut().expect("current_priority implies a wave exists").push(sub_id);
        } else {
            waves.push(vec![sub_id]);
            current_priority = Some(priority);
        }
    }
    waves
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::test_support::*;
    use crate::config::Config;
    use crate::types::Datastore;

    fn ctx() -> (tempfile::TempDir, SubscriptionContext) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::builder().run_dir(dir.path()).build());
        (dir, SubscriptionContext::new(config))
    }

    #[test]
    fn sub_ids_are_unique_and_last_sub_id_tracks_max() {
        let (_dir, ctx) = ctx();
        let cb = Arc::new(RecordingChangeCallback::new(None));
        let a = ctx
            .add_change(SessionId(1), "m", Datastore::Running, None, cb.clone(), Priority(0), ChangeSubFlags::default())
            .unwrap();
        let b = ctx
            .add_change(SessionId(1), "m", Datastore::Running, None, cb, Priority(5), ChangeSubFlags::default())
            .unwrap();
        assert_ne!(a.0, b.0);
        assert_eq!(ctx.last_sub_id(), b.0.max(a.0));
    }

    #[test]
    fn swap_remove_keeps_remaining_members_only() {
        let (_dir, ctx) = ctx();
        let cb = Arc::new(RecordingChangeCallback::new(None));
        let a = ctx
            .add_change(SessionId(1), "m", Datastore::Running, None, cb.clone(), Priority(0), ChangeSubFlags::default())
            .unwrap();
        let b = ctx
            .add_change(SessionId(1), "m", Datastore::Running, None, cb.clone(), Priority(1), ChangeSubFlags::default())
            .unwrap();
        let c = ctx
            .add_change(SessionId(1), "m", Datastore::Running, None, cb, Priority(2), ChangeSubFlags::default())
            .unwrap();
        ctx.del_change(b).unwrap();
        let remaining: Vec<SubId> = ctx.with_change_group("m", Datastore::Running, |g| {
            g.unwrap().subs.iter().map(|s| s.sub_id).collect()
        });
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&a));
        assert!(remaining.contains(&c));
        assert!(!remaining.contains(&b));
    }

    #[test]
    fn emptying_the_inner_list_removes_the_outer_group() {
        let (_dir, ctx) = ctx();
        let cb = Arc::new(RecordingChangeCallback::new(None));
        let a = ctx
            .add_change(SessionId(1), "m", Datastore::Running, None, cb, Priority(0), ChangeSubFlags::default())
            .unwrap();
        ctx.del_change(a).unwrap();
        let exists = ctx.with_change_group("m", Datastore::Running, |g| g.is_some());
        assert!(!exists);
    }

    #[test]
    fn oper_get_rejects_duplicate_path_priority() {
        let (_dir, ctx) = ctx();
        let cb = Arc::new(FixedOperGetCallback { tree: b"<a/>".to_vec() });
        ctx.add_oper_get(SessionId(1), "m", "/m:state", cb.clone(), Priority(10)).unwrap();
        let err = ctx.add_oper_get(SessionId(1), "m", "/m:state", cb, Priority(10)).unwrap_err();
        assert!(matches!(err, Error::Exists(_)));
    }

    #[test]
    fn del_notif_delivers_terminated_with_timestamp_after_subscribe() {
        let (_dir, ctx) = ctx();
        let cb = Arc::new(RecordingNotifCallback::default());
        let sub_id = ctx
            .add_notif(SessionId(1), "m", None, 0, 0, None, None, cb.clone())
            .unwrap();
        ctx.del_notif(sub_id).unwrap();
        assert_eq!(cb.terminated_count.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(cb.last_terminated_ts.lock().unwrap().is_some());
    }

    #[test]
    fn del_notif_flags_a_pending_channel_event_ignored() {
        let (_dir, ctx) = ctx();
        let cb = Arc::new(RecordingNotifCallback::default());
        let sub_id = ctx
            .add_notif(SessionId(1), "m", None, 0, 0, None, None, cb)
            .unwrap();
        let channel = ctx.notif_channel("m").unwrap();
        channel.publish(crate::types::EventKind::Notif, 1, 0, 0, 0, b"payload").unwrap();
        assert_eq!(channel.event_kind(), Some(crate::types::EventKind::Notif));

        ctx.del_notif(sub_id).unwrap();

        assert_eq!(channel.event_kind(), Some(crate::types::EventKind::None));
    }

    #[test]
    fn del_session_removes_only_that_sessions_subscriptions() {
        let (_dir, ctx) = ctx();
        let cb = Arc::new(RecordingChangeCallback::new(None));
        ctx.add_change(SessionId(1), "m", Datastore::Running, None, cb.clone(), Priority(0), ChangeSubFlags::default())
            .unwrap();
        ctx.add_change(SessionId(2), "m", Datastore::Running, None, cb, Priority(1), ChangeSubFlags::default())
            .unwrap();
        ctx.del_session(SessionId(1));
        assert_eq!(ctx.count_for_session(SessionId(1)), 0);
        assert_eq!(ctx.count_for_session(SessionId(2)), 1);
    }
}

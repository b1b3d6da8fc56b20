// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Commit Protocol Engine (§4.F): drives the channel state machine for
//! change commits, operational-state reads, RPC/action calls, and
//! notification broadcast, running inside the publisher's process.
//!
//! Delivery to every subscriber callback happens behind an unwind
//! boundary (§4.F panic isolation): one misbehaving callback cannot
//! poison delivery to the rest of a wave or to an unrelated topic. A
//! caught panic is folded into that subscriber's result as
//! `CALLBACK_FAILED` and logged at error level, the same treatment a
//! callback returning that error explicitly would get.

use crate::callbacks::{ChangeCallback, NotifCallback, OperGetCallback, RpcCallback};
use crate::error::{Error, ErrorCode, ErrorInfo, Result};
use crate::registry::{ChangeGroup, ChangeSub, OperGetSub, RpcGroup, RpcSub, SubscriptionContext};
use crate::types::{Cid, Datastore, EventKind, SubId};
use dashmap::DashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Runs the commit protocol on behalf of one publishing connection.
///
/// `suspended` is shared with the owning [`crate::connection::Connection`]:
/// entries are skipped during delivery but left in the registry (§4.G
/// "Suspended subscriptions ... are skipped by the engine but retained").
pub struct CommitEngine {
    registry: Arc<SubscriptionContext>,
    cid: Cid,
    request_ids: AtomicU32,
    suspended: Arc<DashSet<SubId>>,
}

impl CommitEngine {
    pub fn new(registry: Arc<SubscriptionContext>, cid: Cid) -> Self {
        Self::with_suspended(registry, cid, Arc::new(DashSet::new()))
    }

    pub fn with_suspended(registry: Arc<SubscriptionContext>, cid: Cid, suspended: Arc<DashSet<SubId>>) -> Self {
        Self {
            registry,
            cid,
            request_ids: AtomicU32::new(0),
            suspended,
        }
    }

    pub fn suspended(&self) -> &Arc<DashSet<SubId>> {
        &self.suspended
    }

    fn is_suspended(&self, sub_id: SubId) -> bool {
        self.suspended.contains(&sub_id)
    }

    fn next_request_id(&self) -> u32 {
        self.request_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Runs the UPDATE → CHANGE → DONE/ABORT protocol for one commit on
    /// `(module, datastore)`. Returns the accumulated callback errors (empty
    /// on success); the commit itself is considered failed iff this is
    /// non-empty (§7 fatal tier: any CALLBACK_FAILED from a verify-phase
    /// subscriber aborts the commit).
    pub fn apply_change(&self, module: &str, datastore: Datastore, diff: &[u8]) -> Result<Vec<ErrorInfo>> {
        let request_id = self.next_request_id();
        self.registry
            .with_change_group(module, datastore, |group| self.run_change(group, request_id, diff))
    }

    fn run_change(&self, group: Option<&ChangeGroup>, request_id: u32, diff: &[u8]) -> Result<Vec<ErrorInfo>> {
        let Some(group) = group else {
            return Ok(Vec::new());
        };

        // UPDATE phase: only subscribers that opted in, sent once, before
        // anything else. A failure here aborts the commit before any
        // subscriber has seen CHANGE, so there is nothing to unwind.
        let update_subs: Vec<&ChangeSub> = group
            .subs
            .iter()
            .filter(|s| !self.is_suspended(s.sub_id) && s.flags.contains(crate::registry::ChangeSubFlags::WANTS_UPDATE))
            .collect();
        if !update_subs.is_empty() {
            group.channel.publish(EventKind::Update, request_id, 0, self.cid.0, 0, diff)?;
            for sub in &update_subs {
                if let Err(info) = invoke_change(sub, EventKind::Update, request_id, diff) {
                    crate::error!("change update rejected: module request_id={request_id} sub={} code={}", sub.sub_id, info.code);
                    return Ok(vec![info]);
                }
            }
        }

        let active: Vec<&ChangeSub> = group.subs.iter().filter(|s| !self.is_suspended(s.sub_id)).collect();
        let waves = crate::registry::build_waves(&active, |s| (s.priority, s.insertion_index, s.sub_id));
        let mut succeeded: Vec<SubId> = Vec::new();
        let mut failure: Option<ErrorInfo> = None;

        'outer: for wave in &waves {
            let priority = sub_by_id(&group.subs, wave[0]).priority.0 as u32;
            group.channel.publish(EventKind::Change, request_id, priority, self.cid.0, 0, diff)?;
            crate::debug!("change wave dispatched: request_id={request_id} priority={priority} size={}", wave.len());
            for sub_id in wave {
                let sub = sub_by_id(&group.subs, *sub_id);
                match invoke_change(sub, EventKind::Change, request_id, diff) {
                    Ok(()) => succeeded.push(*sub_id),
                    // §7: CALLBACK_SHELVE keeps the event pending for this
                    // subscriber (no DONE this cycle, not a wave failure);
                    // the rest of the wave proceeds and the subscriber
                    // retries on its next event-pipe wake.
                    Err(info) if info.code == crate::error::ErrorCode::CallbackShelve => {
                        crate::warn!("change callback shelved: request_id={request_id} sub={sub_id}");
                    }
                    Err(info) => {
                        failure = Some(info);
                        break 'outer;
                    }
                }
            }
        }

        if let Some(info) = failure {
            crate::error!("change commit aborted: request_id={request_id} code={}", info.code);
            group.channel.publish(EventKind::Abort, request_id, 0, self.cid.0, 0, &[])?;
            for sub_id in &succeeded {
                let sub = sub_by_id(&group.subs, *sub_id);
                let _ = invoke_change(sub, EventKind::Abort, request_id, &[]);
            }
            return Ok(vec![info]);
        }

        group.channel.publish(EventKind::Done, request_id, 0, self.cid.0, 0, &[])?;
        for sub_id in &succeeded {
            let sub = sub_by_id(&group.subs, *sub_id);
            let _ = invoke_change(sub, EventKind::Done, request_id, &[]);
        }
        crate::info!("change commit applied: module request_id={request_id} subscribers={}", succeeded.len());
        Ok(Vec::new())
    }

    /// Single-wave operational-state read (§4.F). Visits every subscriber on
    /// `path` in descending priority; the first reply becomes the returned
    /// tree, later subscribers' replies are appended (their children).
    pub fn get_oper_data(&self, module: &str, path: &str) -> Result<Vec<u8>> {
        let request_id = self.next_request_id();
        self.registry.with_oper_get(module, |subs| {
            let mut matching: Vec<&OperGetSub> = subs.iter().filter(|s| s.path == path && !self.is_suspended(s.sub_id)).collect();
            matching.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.insertion_index.cmp(&b.insertion_index)));
            if matching.is_empty() {
                return Err(Error::NotFound(format!("no oper-get subscriber for {path}")));
            }
            let mut tree = Vec::new();
            for sub in matching {
                if sub.channel.event_kind() != Some(EventKind::None) {
                    sub.channel.mark_ignored();
                }
                sub.channel.publish(EventKind::OperGet, request_id, sub.priority.0 as u32, self.cid.0, 0, path.as_bytes())?;
                match invoke_oper_get(sub, path) {
                    Ok(mut bytes) => tree.append(&mut bytes),
                    Err(info) => return Err(Error::CallbackFailed(info)),
                }
            }
            Ok(tree)
        })
    }

    /// RPC/action call (§4.F). Waves run in descending priority order; each
    /// successful wave's output becomes the next wave's input, so the
    /// returned tree is whatever the highest-priority successful wave
    /// produced before any failure stopped the pipeline.
    pub fn call_rpc(&self, path: &str, input: &[u8]) -> Result<Vec<u8>> {
        let request_id = self.next_request_id();
        self.registry
            .with_rpc_group(path, |group| self.run_rpc(group, path, request_id, input))
    }

    fn run_rpc(&self, group: Option<&RpcGroup>, path: &str, request_id: u32, input: &[u8]) -> Result<Vec<u8>> {
        let Some(group) = group else {
            return Err(Error::NotFound(format!("no rpc subscriber for {path}")));
        };
        let active: Vec<&RpcSub> = group.subs.iter().filter(|s| !self.is_suspended(s.sub_id)).collect();
        let waves = crate::registry::build_waves(&active, |s| (s.priority, s.insertion_index, s.sub_id));
        let mut running = input.to_vec();
        let mut succeeded: Vec<SubId> = Vec::new();

        for wave in &waves {
            let priority = sub_by_id(&group.subs, wave[0]).priority.0 as u32;
            group.channel.publish(EventKind::Rpc, request_id, priority, self.cid.0, 0, &running)?;
            let mut wave_failure = None;
            for sub_id in wave {
                let sub = rpc_sub_by_id(&group.subs, *sub_id);
                match invoke_rpc(sub, &running) {
                    Ok(out) => {
                        running = out;
                        succeeded.push(*sub_id);
                    }
                    Err(info) => {
                        wave_failure = Some(info);
                        break;
                    }
                }
            }
            if let Some(info) = wave_failure {
                group.channel.publish(EventKind::Abort, request_id, 0, self.cid.0, 0, &[])?;
                for sub_id in &succeeded {
                    let sub = rpc_sub_by_id(&group.subs, *sub_id);
                    invoke_rpc_abort(sub);
                }
                crate::error!("rpc call aborted: request_id={request_id} code={}", info.code);
                return Err(Error::CallbackFailed(info));
            }
        }
        Ok(running)
    }

    /// Broadcasts one notification to every subscriber on `module`. Unlike
    /// change/RPC this does not collect or escalate application errors
    /// (§4.F): each subscriber processes the event exactly once.
    pub fn publish_notification(&self, module: &str, payload: &[u8]) -> Result<()> {
        let request_id = self.next_request_id();
        let Some(channel) = self.registry.notif_channel(module) else {
            return Ok(());
        };
        channel.publish(EventKind::Notif, request_id, 0, self.cid.0, 0, payload)?;
        self.registry.with_notif_subs(module, |subs| {
            for sub in subs {
                if !self.is_suspended(sub.sub_id) {
                    invoke_notif(sub, payload, request_id);
                }
            }
        });
        Ok(())
    }
}

fn sub_by_id<'a>(subs: &'a [ChangeSub], id: SubId) -> &'a ChangeSub {
    subs.iter().find(|s| s.sub_id == id).expect("wave built from this group's own subs")
}

fn rpc_sub_by_id<'a>(subs: &'a [RpcSub], id: SubId) -> &'a RpcSub {
    subs.iter().find(|s| s.sub_id == id).expect("wave built from this group's own subs")
}

fn invoke_change(sub: &ChangeSub, kind: EventKind, request_id: u32, diff: &[u8]) -> std::result::Result<(), ErrorInfo> {
    match catch_unwind(AssertUnwindSafe(|| sub.callback.on_event(kind, request_id, diff))) {
        Ok(result) => result,
        Err(_) => {
            crate::error!("change callback panicked: sub={} kind={kind:?} request_id={request_id}", sub.sub_id);
            Err(ErrorInfo::new(ErrorCode::CallbackFailed, "callback panicked"))
        }
    }
}

fn invoke_oper_get(sub: &OperGetSub, path: &str) -> std::result::Result<Vec<u8>, ErrorInfo> {
    match catch_unwind(AssertUnwindSafe(|| sub.callback.on_request(path))) {
        Ok(result) => result,
        Err(_) => {
            crate::error!("oper-get callback panicked: sub={} path={path}", sub.sub_id);
            Err(ErrorInfo::new(ErrorCode::CallbackFailed, "callback panicked"))
        }
    }
}

fn invoke_rpc(sub: &RpcSub, input: &[u8]) -> std::result::Result<Vec<u8>, ErrorInfo> {
    match catch_unwind(AssertUnwindSafe(|| sub.callback.on_call(input))) {
        Ok(result) => result,
        Err(_) => {
            crate::error!("rpc callback panicked: sub={}", sub.sub_id);
            Err(ErrorInfo::new(ErrorCode::CallbackFailed, "callback panicked"))
        }
    }
}

fn invoke_rpc_abort(sub: &RpcSub) {
    if catch_unwind(AssertUnwindSafe(|| sub.callback.on_abort())).is_err() {
        crate::error!("rpc abort callback panicked: sub={}", sub.sub_id);
    }
}

fn invoke_notif(sub: &crate::registry::NotifSub, payload: &[u8], request_id: u32) {
    let result = catch_unwind(AssertUnwindSafe(|| sub.callback.on_notification(payload, request_id as u64)));
    if result.is_err() {
        crate::error!("notif callback panicked: sub={} request_id={request_id}", sub.sub_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::test_support::*;
    use crate::config::Config;
    use crate::registry::ChangeSubFlags;
    use crate::types::{Priority, SessionId};

    fn setup() -> (tempfile::TempDir, CommitEngine, Arc<SubscriptionContext>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::builder().run_dir(dir.path()).build());
        let registry = Arc::new(SubscriptionContext::new(config));
        let engine = CommitEngine::new(registry.clone(), Cid(1));
        (dir, engine, registry)
    }

    #[test]
    fn single_subscriber_receives_change_then_done() {
        let (_dir, engine, registry) = setup();
        let cb = Arc::new(RecordingChangeCallback::new(None));
        registry
            .add_change(SessionId(1), "m", Datastore::Running, None, cb.clone(), Priority(0), ChangeSubFlags::default())
            .unwrap();
        let errors = engine.apply_change("m", Datastore::Running, b"a=1").unwrap();
        assert!(errors.is_empty());
        let events = cb.events.lock().unwrap();
        assert_eq!(events.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![EventKind::Change, EventKind::Done]);
    }

    #[test]
    fn failing_low_priority_subscriber_aborts_only_the_higher_one() {
        let (_dir, engine, registry) = setup();
        let high = Arc::new(RecordingChangeCallback::new(None));
        let low = Arc::new(RecordingChangeCallback::new(Some(EventKind::Change)));
        registry
            .add_change(SessionId(1), "m", Datastore::Running, None, high.clone(), Priority(10), ChangeSubFlags::default())
            .unwrap();
        registry
            .add_change(SessionId(1), "m", Datastore::Running, None, low.clone(), Priority(5), ChangeSubFlags::default())
            .unwrap();

        let errors = engine.apply_change("m", Datastore::Running, b"a=1").unwrap();
        assert_eq!(errors.len(), 1);

        let high_events: Vec<EventKind> = high.events.lock().unwrap().iter().map(|(k, _)| *k).collect();
        assert_eq!(high_events, vec![EventKind::Change, EventKind::Abort]);

        let low_events: Vec<EventKind> = low.events.lock().unwrap().iter().map(|(k, _)| *k).collect();
        assert_eq!(low_events, vec![EventKind::Change]);
    }

    struct ShelvingChangeCallback {
        events: std::sync::Mutex<Vec<EventKind>>,
    }

    impl ChangeCallback for ShelvingChangeCallback {
        fn on_event(&self, kind: EventKind, _request_id: u32, _diff: &[u8]) -> std::result::Result<(), ErrorInfo> {
            self.events.lock().unwrap().push(kind);
            if kind == EventKind::Change {
                return Err(ErrorInfo::new(ErrorCode::CallbackShelve, "not ready yet"));
            }
            Ok(())
        }
    }

    #[test]
    fn shelved_subscriber_does_not_abort_the_wave_or_receive_done() {
        let (_dir, engine, registry) = setup();
        let shelving = Arc::new(ShelvingChangeCallback { events: std::sync::Mutex::new(Vec::new()) });
        let other = Arc::new(RecordingChangeCallback::new(None));
        registry
            .add_change(SessionId(1), "m", Datastore::Running, None, shelving.clone(), Priority(10), ChangeSubFlags::default())
            .unwrap();
        registry
            .add_change(SessionId(1), "m", Datastore::Running, None, other.clone(), Priority(5), ChangeSubFlags::default())
            .unwrap();

        let errors = engine.apply_change("m", Datastore::Running, b"a=1").unwrap();
        assert!(errors.is_empty());

        let shelved_events = shelving.events.lock().unwrap();
        assert_eq!(*shelved_events, vec![EventKind::Change]);

        let other_events: Vec<EventKind> = other.events.lock().unwrap().iter().map(|(k, _)| *k).collect();
        assert_eq!(other_events, vec![EventKind::Change, EventKind::Done]);
    }

    #[test]
    fn oper_get_round_trips_tree_from_subscriber() {
        let (_dir, engine, registry) = setup();
        let cb = Arc::new(FixedOperGetCallback { tree: b"<state><x>42</x></state>".to_vec() });
        registry.add_oper_get(SessionId(1), "m", "/m:state", cb, Priority(0)).unwrap();
        let tree = engine.get_oper_data("m", "/m:state").unwrap();
        assert_eq!(tree, b"<state><x>42</x></state>");
    }

    #[test]
    fn rpc_low_priority_failure_aborts_high_priority_success() {
        let (_dir, engine, registry) = setup();
        let high = Arc::new(EchoRpcCallback);
        let low = Arc::new(FailingRpcCallback);
        registry.add_rpc(SessionId(1), "/m:ping", false, None, high, Priority(20)).unwrap();
        registry.add_rpc(SessionId(1), "/m:ping", false, None, low, Priority(10)).unwrap();

        let err = engine.call_rpc("/m:ping", b"ping").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::CallbackFailed);
    }

    #[test]
    fn notification_is_delivered_to_every_subscriber() {
        let (_dir, engine, registry) = setup();
        let cb = Arc::new(RecordingNotifCallback::default());
        registry
            .add_notif(SessionId(1), "m", None, 0, 0, None, None, cb.clone())
            .unwrap();
        engine.publish_notification("m", b"event").unwrap();
        assert_eq!(cb.notifications.lock().unwrap().len(), 1);
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscriber-side event dispatch (§6 `process_events`): the loop an
//! external event loop drives once [`Connection::get_event_pipe`]'s
//! descriptor becomes readable, walking this connection's own channels
//! for events a publisher — possibly living in a different process —
//! has written into them.
//!
//! [`crate::engine::CommitEngine`] is this crate's *same-process* fast
//! path: it holds `Arc<dyn Callback>` trait objects straight out of the
//! in-process registry, which only works when a publisher and subscriber
//! share one `SubscriptionContext`. A genuinely cross-process subscriber
//! has no such trait object for a publisher in another process — only the
//! `Channel` it opened for itself when it subscribed. `process_events` is
//! that subscriber's half of the protocol: it notices a channel cell has
//! moved to a new `(request_id, event_kind)` pair it hasn't handled yet,
//! invokes its own local callback exactly once for that pair, and posts
//! the reply back into the channel's reply ring for the publisher to
//! collect.
//!
//! [`Connection::get_event_pipe`]: crate::connection::Connection::get_event_pipe

use crate::callbacks::{ChangeCallback, NotifCallback, OperGetCallback, RpcCallback};
use crate::channel::Channel;
use crate::connection::Connection;
use crate::error::{ErrorCode, ErrorInfo, Result};
use crate::registry::{ChangeGroup, ChangeSub, NotifSub, Owner, OperGetSub, RpcGroup, RpcSub};
use crate::types::EventKind;
use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// Dedup state for one connection's `process_events` loop: remembers the
/// last `(request_id, event_kind)` handled per channel, keyed by the
/// channel's allocation address, which is stable for the channel's
/// lifetime. `request_id` alone is not a safe key: it is assigned once
/// per commit and stays constant across that commit's Update → Change
/// (waves) → Done/Abort progression, all of which land in the same cell
/// in sequence and must each be delivered once.
#[derive(Default)]
pub struct DispatchState {
    last_seen: DashMap<usize, (u32, EventKind)>,
}

impl DispatchState {
    pub fn new() -> Self {
        Self::default()
    }

    fn should_handle(&self, channel: &Arc<Channel>, request_id: u32, kind: EventKind) -> bool {
        let key = Arc::as_ptr(channel) as usize;
        let seen = self.last_seen.get(&key).map(|v| *v == (request_id, kind)).unwrap_or(false);
        if !seen {
            self.last_seen.insert(key, (request_id, kind));
        }
        !seen
    }
}

/// Waits up to `timeout` for the connection's event pipe to become
/// readable — a pacing hint only, since this crate's event pipe has no
/// cross-process wake path (§9 Design Notes simplification) — then walks
/// every channel this context has a local subscription against regardless
/// of whether the wait was actually woken, delivering any event not
/// already processed. The channel's own state is the source of truth;
/// the pipe only avoids a busy-loop. Returns the number of callback
/// invocations performed.
pub fn process_events(conn: &Connection, state: &DispatchState, timeout: Duration) -> Result<usize> {
    let _ = crate::connection::wait_readable(conn.get_event_pipe(), timeout)?;
    conn.event_pipe().drain()?;

    let registry = conn.registry();
    let mut delivered = 0;
    for owner in registry.all_owners() {
        delivered += match owner {
            Owner::Change(module, ds) => registry.with_change_group(&module, ds, |group| match group {
                Some(group) => dispatch_change(group, state),
                None => 0,
            }),
            Owner::OperGet(module) => registry.with_oper_get(&module, |subs| dispatch_oper_get(subs, state)),
            Owner::OperPoll(_) => 0,
            Owner::Notif(module) => match registry.notif_channel(&module) {
                Some(channel) => registry.with_notif_subs(&module, |subs| dispatch_notif(&channel, subs, state)),
                None => 0,
            },
            Owner::Rpc(path) => registry.with_rpc_group(&path, |group| match group {
                Some(group) => dispatch_rpc(group, state),
                None => 0,
            }),
        };
    }
    Ok(delivered)
}

fn dispatch_change(group: &ChangeGroup, state: &DispatchState) -> usize {
    let Some(kind) = group.channel.event_kind() else { return 0 };
    if kind == EventKind::None {
        return 0;
    }
    let request_id = group.channel.request_id();
    if !state.should_handle(&group.channel, request_id, kind) {
        return 0;
    }
    let Some(payload) = group.channel.snapshot_payload() else { return 0 };

    let mut delivered = 0;
    for sub in &group.subs {
        match invoke_change(sub, kind, request_id, &payload) {
            Ok(()) => {
                let _ = group.channel.post_reply(sub.sub_id.0, ErrorCode::Ok as u32, "");
            }
            Err(info) => {
                let _ = group.channel.post_reply(sub.sub_id.0, info.code as u32, &info.message);
            }
        }
        delivered += 1;
    }
    delivered
}

fn dispatch_oper_get(subs: &[OperGetSub], state: &DispatchState) -> usize {
    let mut delivered = 0;
    for sub in subs {
        let Some(kind) = sub.channel.event_kind() else { continue };
        if kind != EventKind::OperGet {
            continue;
        }
        let request_id = sub.channel.request_id();
        if !state.should_handle(&sub.channel, request_id, kind) {
            continue;
        }
        let path = sub
            .channel
            .snapshot_payload()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        match invoke_oper_get(sub, &path) {
            Ok(_tree) => {
                // The channel's reply ring carries status only (§4.E); the
                // returned tree has no cross-process transport in this
                // crate and is only meaningful to same-process callers via
                // `CommitEngine::get_oper_data`.
                let _ = sub.channel.post_reply(sub.sub_id.0, ErrorCode::Ok as u32, "");
            }
            Err(info) => {
                let _ = sub.channel.post_reply(sub.sub_id.0, info.code as u32, &info.message);
            }
        }
        delivered += 1;
    }
    delivered
}

fn dispatch_notif(channel: &Arc<Channel>, subs: &[NotifSub], state: &DispatchState) -> usize {
    let Some(kind) = channel.event_kind() else { return 0 };
    if kind != EventKind::Notif {
        return 0;
    }
    let request_id = channel.request_id();
    if !state.should_handle(channel, request_id, kind) {
        return 0;
    }
    let Some(payload) = channel.snapshot_payload() else { return 0 };
    for sub in subs {
        invoke_notif(sub, &payload, request_id);
    }
    subs.len()
}

fn dispatch_rpc(group: &RpcGroup, state: &DispatchState) -> usize {
    let Some(kind) = group.channel.event_kind() else { return 0 };
    if kind != EventKind::Rpc {
        return 0;
    }
    let request_id = group.channel.request_id();
    if !state.should_handle(&group.channel, request_id, kind) {
        return 0;
    }
    let Some(payload) = group.channel.snapshot_payload() else { return 0 };

    let mut delivered = 0;
    for sub in &group.subs {
        match invoke_rpc(sub, &payload) {
            Ok(_out) => {
                let _ = group.channel.post_reply(sub.sub_id.0, ErrorCode::Ok as u32, "");
            }
            Err(info) => {
                let _ = group.channel.post_reply(sub.sub_id.0, info.code as u32, &info.message);
            }
        }
        delivered += 1;
    }
    delivered
}

fn invoke_change(sub: &ChangeSub, kind: EventKind, request_id: u32, diff: &[u8]) -> std::result::Result<(), ErrorInfo> {
    match catch_unwind(AssertUnwindSafe(|| sub.callback.on_event(kind, request_id, diff))) {
        Ok(result) => result,
        Err(_) => {
            crate::error!("dispatch change callback panicked: sub={} kind={kind:?} request_id={request_id}", sub.sub_id);
            Err(ErrorInfo::new(ErrorCode::CallbackFailed, "callback panicked"))
        }
    }
}

fn invoke_oper_get(sub: &OperGetSub, path: &str) -> std::result::Result<Vec<u8>, ErrorInfo> {
    match catch_unwind(AssertUnwindSafe(|| sub.callback.on_request(path))) {
        Ok(result) => result,
        Err(_) => {
            crate::error!("dispatch oper-get callback panicked: sub={} path={path}", sub.sub_id);
            Err(ErrorInfo::new(ErrorCode::CallbackFailed, "callback panicked"))
        }
    }
}

fn invoke_rpc(sub: &RpcSub, input: &[u8]) -> std::result::Result<Vec<u8>, ErrorInfo> {
    match catch_unwind(AssertUnwindSafe(|| sub.callback.on_call(input))) {
        Ok(result) => result,
        Err(_) => {
            crate::error!("dispatch rpc callback panicked: sub={}", sub.sub_id);
            Err(ErrorInfo::new(ErrorCode::CallbackFailed, "callback panicked"))
        }
    }
}

fn invoke_notif(sub: &NotifSub, payload: &[u8], request_id: u32) {
    let result = catch_unwind(AssertUnwindSafe(|| sub.callback.on_notification(payload, request_id as u64)));
    if result.is_err() {
        crate::error!("dispatch notif callback panicked: sub={} request_id={request_id}", sub.sub_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::test_support::*;
    use crate::config::Config;
    use crate::registry::ChangeSubFlags;
    use crate::types::{Datastore, Priority, SessionId};

    /// Models two separate processes attached to the same run directory:
    /// `publisher` is the only subscriber its own `CommitEngine` knows
    /// about, so `apply_change` never touches `subscriber`'s callback
    /// directly. `subscriber` only learns about the commit by walking the
    /// shared channel file through `process_events`.
    #[test]
    fn process_events_delivers_to_a_separately_attached_connection() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::builder().run_dir(dir.path()).build();

        let publisher = Connection::attach(config.clone()).unwrap();
        let publisher_cb = Arc::new(RecordingChangeCallback::new(None));
        publisher
            .subscribe_change(SessionId(1), "m", Datastore::Running, None, publisher_cb.clone(), Priority(0), ChangeSubFlags::default())
            .unwrap();

        let subscriber = Connection::attach(config).unwrap();
        let subscriber_cb = Arc::new(RecordingChangeCallback::new(None));
        subscriber
            .subscribe_change(SessionId(1), "m", Datastore::Running, None, subscriber_cb.clone(), Priority(0), ChangeSubFlags::default())
            .unwrap();

        publisher.engine().apply_change("m", Datastore::Running, b"a=1").unwrap();
        assert!(!publisher_cb.events.lock().unwrap().is_empty());
        assert!(subscriber_cb.events.lock().unwrap().is_empty());

        let state = DispatchState::new();
        let delivered = process_events(&subscriber, &state, Duration::from_millis(20)).unwrap();
        assert_eq!(delivered, 1);
        assert!(!subscriber_cb.events.lock().unwrap().is_empty());

        subscriber_cb.events.lock().unwrap().clear();
        let delivered_again = process_events(&subscriber, &state, Duration::from_millis(20)).unwrap();
        assert_eq!(delivered_again, 0);
        assert!(subscriber_cb.events.lock().unwrap().is_empty());
    }
}

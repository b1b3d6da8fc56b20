// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Callback traits invoked by the Commit Protocol Engine (§4.F) on behalf
//! of subscribers. Payloads are opaque byte trees — this crate does not
//! parse or marshal them (§1 Non-goals); that is the schema engine's job.

use crate::error::ErrorInfo;
use crate::types::EventKind;

/// Validates or reacts to a configuration change. Invoked for every
/// `UPDATE`/`CHANGE`/`DONE`/`ABORT`/`ENABLED` event the subscriber opted
/// into (§4.F).
pub trait ChangeCallback: Send + Sync {
    fn on_event(&self, kind: EventKind, request_id: u32, diff: &[u8]) -> Result<(), ErrorInfo>;
}

/// Supplies operational state for a subscribed path (§4.C add_oper_get).
pub trait OperGetCallback: Send + Sync {
    fn on_request(&self, path: &str) -> Result<Vec<u8>, ErrorInfo>;
}

/// Receives notifications, plus the synthetic `TERMINATED` delivered by
/// `del_notif` (§4.C).
pub trait NotifCallback: Send + Sync {
    fn on_notification(&self, payload: &[u8], timestamp_ns: u64);
    fn on_terminated(&self, timestamp_ns: u64);
}

/// Executes an RPC/action and optionally transforms its input tree
/// (§4.F RPC/action protocol).
pub trait RpcCallback: Send + Sync {
    fn on_call(&self, input: &[u8]) -> Result<Vec<u8>, ErrorInfo>;

    /// Notifies a subscriber that already returned `RPC` success that a
    /// later, lower-priority wave failed and the call is being unwound.
    /// Default no-op since most subscribers have nothing to undo.
    fn on_abort(&self) {}
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    pub struct RecordingChangeCallback {
        pub fail_on: Option<EventKind>,
        pub events: Mutex<Vec<(EventKind, u32)>>,
    }

    impl RecordingChangeCallback {
        pub fn new(fail_on: Option<EventKind>) -> Self {
            Self {
                fail_on,
                events: Mutex::new(Vec::new()),
            }
        }
    }

    impl ChangeCallback for RecordingChangeCallback {
        fn on_event(&self, kind: EventKind, request_id: u32, _diff: &[u8]) -> Result<(), ErrorInfo> {
            self.events.lock().unwrap().push((kind, request_id));
            if self.fail_on == Some(kind) {
                return Err(ErrorInfo::new(crate::error::ErrorCode::CallbackFailed, "injected failure"));
            }
            Ok(())
        }
    }

    pub struct FixedOperGetCallback {
        pub tree: Vec<u8>,
    }

    impl OperGetCallback for FixedOperGetCallback {
        fn on_request(&self, _path: &str) -> Result<Vec<u8>, ErrorInfo> {
            Ok(self.tree.clone())
        }
    }

    pub struct RecordingNotifCallback {
        pub notifications: Mutex<Vec<Vec<u8>>>,
        pub terminated_count: AtomicU32,
        pub last_terminated_ts: Mutex<Option<u64>>,
    }

    impl Default for RecordingNotifCallback {
        fn default() -> Self {
            Self {
                notifications: Mutex::new(Vec::new()),
                terminated_count: AtomicU32::new(0),
                last_terminated_ts: Mutex::new(None),
            }
        }
    }

    impl NotifCallback for RecordingNotifCallback {
        fn on_notification(&self, payload: &[u8], _timestamp_ns: u64) {
            self.notifications.lock().unwrap().push(payload.to_vec());
        }

        fn on_terminated(&self, timestamp_ns: u64) {
            self.terminated_count.fetch_add(1, Ordering::SeqCst);
            *self.last_terminated_ts.lock().unwrap() = Some(timestamp_ns);
        }
    }

    pub struct FailingRpcCallback;

    impl RpcCallback for FailingRpcCallback {
        fn on_call(&self, _input: &[u8]) -> Result<Vec<u8>, ErrorInfo> {
            Err(ErrorInfo::new(crate::error::ErrorCode::CallbackFailed, "rpc failed"))
        }
    }

    pub struct EchoRpcCallback;

    impl RpcCallback for EchoRpcCallback {
        fn on_call(&self, input: &[u8]) -> Result<Vec<u8>, ErrorInfo> {
            Ok(input.to_vec())
        }
    }
}

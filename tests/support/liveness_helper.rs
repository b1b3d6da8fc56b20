// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Standalone helper process for `tests/liveness_recovery.rs`: attaches a
//! change subscription on the run directory given as `argv[1]`/`argv[2]`,
//! prints `ready` once the SHM record is published, then blocks forever so
//! the parent test can kill it without a graceful `unsubscribe`.

use srsub::callbacks::ChangeCallback;
use srsub::config::Config;
use srsub::connection::Connection;
use srsub::error::ErrorInfo;
use srsub::registry::ChangeSubFlags;
use srsub::types::{Datastore, EventKind, Priority, SessionId};
use std::io::Write;
use std::sync::Arc;

struct NoopChangeCallback;

impl ChangeCallback for NoopChangeCallback {
    fn on_event(&self, _kind: EventKind, _request_id: u32, _diff: &[u8]) -> Result<(), ErrorInfo> {
        Ok(())
    }
}

fn main() {
    let mut args = std::env::args().skip(1);
    let run_dir = args.next().expect("run_dir argument required");
    let module = args.next().expect("module argument required");

    let config = Config::builder().run_dir(&run_dir).build();
    let conn = Connection::attach(config).expect("attach");
    conn.subscribe_change(SessionId(1), &module, Datastore::Running, None, Arc::new(NoopChangeCallback), Priority(0), ChangeSubFlags::default())
        .expect("subscribe_change");

    println!("ready");
    std::io::stdout().flush().ok();

    // Killed by the parent test before it ever reaches here; this process
    // must not run its own `Drop`-based unsubscribe.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}

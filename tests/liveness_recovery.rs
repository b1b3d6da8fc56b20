// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end liveness recovery (§4.G, scenario 6): a real child process
//! subscribes to a change group, is killed without a chance to
//! unsubscribe, and a second process sweeps the stale SHM record via
//! `Connection::reap_dead`.

use srsub::config::Config;
use srsub::connection::Connection;
use srsub::shm_index::ListKind;
use srsub::types::Datastore;
use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::time::Duration;

fn helper_binary() -> std::path::PathBuf {
    let mut path = std::env::current_exe().expect("current_exe");
    path.pop(); // test binary
    if path.ends_with("deps") {
        path.pop();
    }
    path.push(if cfg!(windows) { "srsub-liveness-helper.exe" } else { "srsub-liveness-helper" });
    path
}

#[test]
fn killed_subscriber_is_reaped_from_shm() {
    let dir = tempfile::tempdir().unwrap();
    let module = "ietf-interfaces";

    let mut child = Command::new(helper_binary())
        .arg(dir.path())
        .arg(module)
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn helper");

    let mut line = String::new();
    BufReader::new(child.stdout.take().unwrap()).read_line(&mut line).expect("read ready line");
    assert_eq!(line.trim(), "ready");

    let config = Config::builder().run_dir(dir.path()).build();
    let conn = Connection::attach(config).expect("attach");
    let before = conn.shm().unwrap().read_list(module, ListKind::Change(Datastore::Running), Duration::from_secs(1)).unwrap();
    assert_eq!(before.len(), 1, "helper's subscription should be visible before it dies");

    child.kill().expect("kill helper");
    child.wait().expect("reap child");

    let removed = conn.reap_dead(module).expect("reap_dead");
    assert_eq!(removed, 1);

    let after = conn.shm().unwrap().read_list(module, ListKind::Change(Datastore::Running), Duration::from_secs(1)).unwrap();
    assert!(after.is_empty());
}

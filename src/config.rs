// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Operational configuration for SHM layout, timeouts, and growth.
//!
//! Unlike the mutable key/value runtime configuration some daemons expose
//! for QoS policy, the knobs here are fixed once a [`Connection`] attaches:
//! changing `run_dir` or `page_size` mid-flight would desynchronize peers
//! already mapped to the same files. `Config` is therefore a plain
//! immutable value built once via [`ConfigBuilder`], not a `DashMap`-backed
//! store.
//!
//! [`Connection`]: crate::connection::Connection

use std::path::PathBuf;
use std::time::Duration;

/// Default timeout applied to SHM lock acquisitions and futex waits.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// Default timeout the Commit Protocol Engine waits for a wave's replies.
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(10);
/// Initial module-table capacity in main SHM before the first growth.
pub const DEFAULT_MAIN_SHM_INITIAL_MODULES: usize = 64;
/// Initial ext SHM size in bytes before the first power-of-two growth.
pub const DEFAULT_EXT_SHM_INITIAL_BYTES: usize = 64 * 1024;

fn default_page_size() -> u32 {
    // SAFETY: sysconf with a well-known name never fails in practice; a
    // negative/zero result only happens on exotic platforms we fall back
    // safely for.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw > 0 {
        raw as u32
    } else {
        4096
    }
}

/// Immutable operational configuration shared by every component.
#[derive(Debug, Clone)]
pub struct Config {
    run_dir: PathBuf,
    lock_timeout: Duration,
    apply_timeout: Duration,
    main_shm_initial_modules: usize,
    ext_shm_initial_bytes: usize,
    page_size: u32,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn run_dir(&self) -> &std::path::Path {
        &self.run_dir
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn apply_timeout(&self) -> Duration {
        self.apply_timeout
    }

    pub fn main_shm_initial_modules(&self) -> usize {
        self.main_shm_initial_modules
    }

    pub fn ext_shm_initial_bytes(&self) -> usize {
        self.ext_shm_initial_bytes
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Path of a change-subscription channel file (§6 SHM file layout).
    pub fn change_channel_path(&self, module: &str, ds: crate::types::Datastore) -> PathBuf {
        self.run_dir.join(format!("{module}.{ds}.sub"))
    }

    /// Path of an oper-get channel file, keyed by `hash(path, priority)`.
    pub fn oper_get_channel_path(&self, module: &str, hash: u64) -> PathBuf {
        self.run_dir.join(format!("{module}.oper.{hash:016x}.sub"))
    }

    /// Path of a module's single notification channel file.
    pub fn notif_channel_path(&self, module: &str) -> PathBuf {
        self.run_dir.join(format!("{module}.notif.sub"))
    }

    /// Path of an RPC/action channel file, keyed by `hash(path)`.
    pub fn rpc_channel_path(&self, module: &str, hash: u64) -> PathBuf {
        self.run_dir.join(format!("{module}.rpc.{hash:016x}.sub"))
    }

    pub fn main_shm_path(&self) -> PathBuf {
        self.run_dir.join("main.sr")
    }

    pub fn ext_shm_path(&self) -> PathBuf {
        self.run_dir.join("ext.sr")
    }
}

/// Builder for [`Config`], with documented defaults for every field.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    run_dir: PathBuf,
    lock_timeout: Duration,
    apply_timeout: Duration,
    main_shm_initial_modules: usize,
    ext_shm_initial_bytes: usize,
    page_size: u32,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            run_dir: std::env::temp_dir().join("srsub"),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
            main_shm_initial_modules: DEFAULT_MAIN_SHM_INITIAL_MODULES,
            ext_shm_initial_bytes: DEFAULT_EXT_SHM_INITIAL_BYTES,
            page_size: default_page_size(),
        }
    }
}

impl ConfigBuilder {
    pub fn run_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_dir = dir.into();
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    pub fn main_shm_initial_modules(mut self, n: usize) -> Self {
        self.main_shm_initial_modules = n;
        self
    }

    pub fn ext_shm_initial_bytes(mut self, n: usize) -> Self {
        self.ext_shm_initial_bytes = n;
        self
    }

    pub fn build(self) -> Config {
        Config {
            run_dir: self.run_dir,
            lock_timeout: self.lock_timeout,
            apply_timeout: self.apply_timeout,
            main_shm_initial_modules: self.main_shm_initial_modules,
            ext_shm_initial_bytes: self.ext_shm_initial_bytes,
            page_size: self.page_size,
        }
    }
}

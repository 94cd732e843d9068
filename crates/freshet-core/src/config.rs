//! Runtime configuration.
//!
//! Every knob can be set programmatically through [`RuntimeConfigBuilder`] or
//! picked up from `FRESHET_*` environment variables at process start.

use std::env;

use crate::stream::ScheduleMode;

/// Configuration for a [`crate::runtime::Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Allow-list of platform device ordinals, applied before registry
    /// indices are assigned. `None` keeps every device the kind policy
    /// admits.
    pub visible_devices: Option<Vec<usize>>,
    /// Admit CPU agents into the registry. Off by default; the registry is
    /// GPU-only unless a deployment opts in.
    pub allow_cpu_agents: bool,
    /// Size of each pinned staging buffer in KiB. Zero disables pinned
    /// staging entirely, forcing unpinned staged copies.
    pub staging_kib: usize,
    /// Number of pinned staging buffers to pool.
    pub staging_buffers: usize,
    /// Force a wait after every asynchronous submission. Turns every launch
    /// into a synchronous one for debugging.
    pub launch_blocking: bool,
    /// Route every cross-device copy through host staging even when a direct
    /// peer path is enabled.
    pub force_staged_peer_copies: bool,
    /// Use real locks for the context and stream critical sections. Turning
    /// this off selects pass-through locks for single-threaded diagnostics.
    pub thread_safe_locks: bool,
    /// Scheduling mode inherited by streams that do not pick their own.
    pub default_schedule: ScheduleMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            visible_devices: None,
            allow_cpu_agents: false,
            staging_kib: 64,
            staging_buffers: 2,
            launch_blocking: false,
            force_staged_peer_copies: false,
            thread_safe_locks: true,
            default_schedule: ScheduleMode::Auto,
        }
    }
}

impl RuntimeConfig {
    /// Configuration taken from `FRESHET_*` environment variables, with
    /// defaults for everything unset.
    ///
    /// Recognized variables: `FRESHET_VISIBLE_DEVICES` (comma-separated
    /// ordinals), `FRESHET_STAGING_KIB`, `FRESHET_STAGING_BUFFERS`,
    /// `FRESHET_LAUNCH_BLOCKING`, `FRESHET_FORCE_STAGED_P2P`,
    /// `FRESHET_BYPASS_LOCKS`, `FRESHET_SCHEDULE` (`auto`/`spin`/`yield`).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(list) = env::var("FRESHET_VISIBLE_DEVICES") {
            cfg.visible_devices = parse_device_list(&list);
        }
        if let Some(kib) = env_usize("FRESHET_STAGING_KIB") {
            cfg.staging_kib = kib;
        }
        if let Some(n) = env_usize("FRESHET_STAGING_BUFFERS") {
            cfg.staging_buffers = n;
        }
        if let Some(flag) = env_flag("FRESHET_LAUNCH_BLOCKING") {
            cfg.launch_blocking = flag;
        }
        if let Some(flag) = env_flag("FRESHET_FORCE_STAGED_P2P") {
            cfg.force_staged_peer_copies = flag;
        }
        if let Some(flag) = env_flag("FRESHET_BYPASS_LOCKS") {
            cfg.thread_safe_locks = !flag;
        }
        if let Ok(mode) = env::var("FRESHET_SCHEDULE") {
            if let Some(mode) = parse_schedule(&mode) {
                cfg.default_schedule = mode;
            }
        }

        cfg
    }

    /// Start building a configuration from the defaults.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Restrict the registry to the given platform ordinals.
    #[must_use]
    pub fn visible_devices(mut self, devices: Vec<usize>) -> Self {
        self.config.visible_devices = Some(devices);
        self
    }

    /// Admit CPU agents into the registry.
    #[must_use]
    pub fn allow_cpu_agents(mut self, allow: bool) -> Self {
        self.config.allow_cpu_agents = allow;
        self
    }

    /// Set the pinned staging buffer size in KiB (zero disables pinning).
    #[must_use]
    pub fn staging_kib(mut self, kib: usize) -> Self {
        self.config.staging_kib = kib;
        self
    }

    /// Set the number of pooled staging buffers.
    #[must_use]
    pub fn staging_buffers(mut self, count: usize) -> Self {
        self.config.staging_buffers = count;
        self
    }

    /// Force a wait after every asynchronous submission.
    #[must_use]
    pub fn launch_blocking(mut self, blocking: bool) -> Self {
        self.config.launch_blocking = blocking;
        self
    }

    /// Route every cross-device copy through host staging.
    #[must_use]
    pub fn force_staged_peer_copies(mut self, force: bool) -> Self {
        self.config.force_staged_peer_copies = force;
        self
    }

    /// Select real or pass-through critical-section locks.
    #[must_use]
    pub fn thread_safe_locks(mut self, thread_safe: bool) -> Self {
        self.config.thread_safe_locks = thread_safe;
        self
    }

    /// Set the scheduling mode streams inherit by default.
    #[must_use]
    pub fn default_schedule(mut self, mode: ScheduleMode) -> Self {
        self.config.default_schedule = mode;
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

fn parse_device_list(list: &str) -> Option<Vec<usize>> {
    let devices: Vec<usize> = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect();
    if devices.is_empty() {
        None
    } else {
        Some(devices)
    }
}

fn parse_schedule(mode: &str) -> Option<ScheduleMode> {
    match mode.trim().to_ascii_lowercase().as_str() {
        "auto" => Some(ScheduleMode::Auto),
        "spin" => Some(ScheduleMode::Spin),
        "yield" => Some(ScheduleMode::Yield),
        _ => None,
    }
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| !matches!(v.trim(), "" | "0" | "false" | "off"))
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

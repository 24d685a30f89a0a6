//! Client configuration.
//!
//! Configuration can be deserialized (every field has a default) or loaded
//! from the environment with [`ClientConfig::from_env`].

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Environment variable overriding the remote control plane URL.
pub const ENV_BASE_URL: &str = "DESKPILOT_BASE_URL";
/// Environment variable overriding the local backend URL.
pub const ENV_LOCAL_URL: &str = "DESKPILOT_LOCAL_URL";
/// Environment variable overriding the viewer UI URL.
pub const ENV_UI_URL: &str = "DESKPILOT_UI_URL";
/// Environment variable holding the API credential.
pub const ENV_SECRET_KEY: &str = "DESKPILOT_SECRET_KEY";

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the remote control plane.
    #[serde(default = "ClientConfig::default_remote_url")]
    pub remote_url: String,

    /// Base URL of the local backend.
    #[serde(default = "ClientConfig::default_local_url")]
    pub local_url: String,

    /// Base URL of the viewer UI, used only for logged links.
    #[serde(default = "ClientConfig::default_ui_url")]
    pub ui_url: String,

    /// API credential. Not needed for local machines.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Request timeout in seconds.
    #[serde(default = "ClientConfig::default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Connect timeout in seconds.
    #[serde(default = "ClientConfig::default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Polling policy for [`Connection::await_control`](crate::Connection::await_control).
    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Inter-step delays for composite input actions.
    #[serde(default)]
    pub input_timing: InputTiming,
}

impl ClientConfig {
    fn default_remote_url() -> String {
        "https://api.pig.dev".to_string()
    }

    fn default_local_url() -> String {
        "http://localhost:3000".to_string()
    }

    fn default_ui_url() -> String {
        "https://pig.dev".to_string()
    }

    const fn default_request_timeout() -> u64 {
        30
    }

    const fn default_connect_timeout() -> u64 {
        5
    }

    /// Load configuration from `DESKPILOT_*` environment variables, falling
    /// back to defaults for anything unset.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_BASE_URL) {
            config.remote_url = url;
        }
        if let Some(url) = lookup(ENV_LOCAL_URL) {
            config.local_url = url;
        }
        if let Some(url) = lookup(ENV_UI_URL) {
            config.ui_url = url;
        }
        config.api_key = lookup(ENV_SECRET_KEY).filter(|k| !k.is_empty());
        config.normalized()
    }

    /// Set the remote control plane URL.
    #[must_use]
    pub fn with_remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote_url = url.into();
        self.normalized()
    }

    /// Set the local backend URL.
    #[must_use]
    pub fn with_local_url(mut self, url: impl Into<String>) -> Self {
        self.local_url = url.into();
        self.normalized()
    }

    /// Set the API credential.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the handoff polling policy.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the composite input timing.
    #[must_use]
    pub const fn with_input_timing(mut self, timing: InputTiming) -> Self {
        self.input_timing = timing;
        self
    }

    fn normalized(mut self) -> Self {
        for url in [&mut self.remote_url, &mut self.local_url, &mut self.ui_url] {
            let trimmed = url.trim_end_matches('/').len();
            url.truncate(trimmed);
        }
        self
    }

    /// Check the configuration for values that can never work.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a URL is empty or the backoff policy is degenerate.
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("remote_url", &self.remote_url),
            ("local_url", &self.local_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!("{name} must be an http(s) URL, got {url:?}")));
            }
        }
        self.backoff.validate()
    }

    /// Get the request timeout as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Get the connect timeout as a `Duration`.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_url: Self::default_remote_url(),
            local_url: Self::default_local_url(),
            ui_url: Self::default_ui_url(),
            api_key: None,
            request_timeout_seconds: Self::default_request_timeout(),
            connect_timeout_seconds: Self::default_connect_timeout(),
            backoff: BackoffPolicy::default(),
            input_timing: InputTiming::default(),
        }
    }
}

/// Exponential backoff used while waiting for control to be handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BackoffPolicy {
    /// First sleep between polls, in milliseconds.
    #[serde(default = "BackoffPolicy::default_initial_ms")]
    pub initial_ms: u64,
    /// Upper bound for any single sleep, in milliseconds.
    #[serde(default = "BackoffPolicy::default_cap_ms")]
    pub cap_ms: u64,
    /// Growth factor applied after each unsuccessful poll.
    #[serde(default = "BackoffPolicy::default_factor")]
    pub factor: u32,
}

impl BackoffPolicy {
    const fn default_initial_ms() -> u64 {
        1_000
    }

    const fn default_cap_ms() -> u64 {
        10_000
    }

    const fn default_factor() -> u32 {
        2
    }

    /// Create a policy from durations.
    #[must_use]
    pub fn new(initial: Duration, cap: Duration, factor: u32) -> Self {
        Self {
            initial_ms: u64::try_from(initial.as_millis()).unwrap_or(u64::MAX),
            cap_ms: u64::try_from(cap.as_millis()).unwrap_or(u64::MAX),
            factor,
        }
    }

    /// First sleep between polls.
    #[must_use]
    pub const fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    /// Upper bound for any single sleep.
    #[must_use]
    pub const fn cap(&self) -> Duration {
        Duration::from_millis(self.cap_ms)
    }

    /// Check that the policy neither busy-loops nor shrinks.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for a zero interval, a cap below the initial
    /// interval, or a factor below one.
    pub fn validate(&self) -> Result<()> {
        if self.initial_ms == 0 {
            return Err(Error::Config("backoff initial interval must be positive".into()));
        }
        if self.cap_ms < self.initial_ms {
            return Err(Error::Config(format!(
                "backoff cap ({} ms) is below the initial interval ({} ms)",
                self.cap_ms, self.initial_ms
            )));
        }
        if self.factor == 0 {
            return Err(Error::Config("backoff factor must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: Self::default_initial_ms(),
            cap_ms: Self::default_cap_ms(),
            factor: Self::default_factor(),
        }
    }
}

/// Delays between the steps of composite input actions.
///
/// The remote input device drops events that arrive back to back, so these
/// are part of the protocol, not tuning knobs for speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct InputTiming {
    /// Between a button press and its release, in milliseconds.
    #[serde(default = "InputTiming::default_press_release_ms")]
    pub press_release_ms: u64,
    /// Between the two clicks of a double click, in milliseconds.
    #[serde(default = "InputTiming::default_double_click_gap_ms")]
    pub double_click_gap_ms: u64,
    /// Between the steps of a drag, in milliseconds.
    #[serde(default = "InputTiming::default_drag_step_ms")]
    pub drag_step_ms: u64,
}

impl InputTiming {
    const fn default_press_release_ms() -> u64 {
        100
    }

    const fn default_double_click_gap_ms() -> u64 {
        200
    }

    const fn default_drag_step_ms() -> u64 {
        100
    }

    /// Delay between press and release.
    #[must_use]
    pub const fn press_release(&self) -> Duration {
        Duration::from_millis(self.press_release_ms)
    }

    /// Delay between the clicks of a double click.
    #[must_use]
    pub const fn double_click_gap(&self) -> Duration {
        Duration::from_millis(self.double_click_gap_ms)
    }

    /// Delay between drag steps.
    #[must_use]
    pub const fn drag_step(&self) -> Duration {
        Duration::from_millis(self.drag_step_ms)
    }
}

impl Default for InputTiming {
    fn default() -> Self {
        Self {
            press_release_ms: Self::default_press_release_ms(),
            double_click_gap_ms: Self::default_double_click_gap_ms(),
            drag_step_ms: Self::default_drag_step_ms(),
        }
    }
}

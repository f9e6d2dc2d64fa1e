use std::time::Duration;

use tracing::trace;

use crate::RouteKey;
use crate::scheduler::SchedulerConfig;

/// Top-level hub configuration: the sockets to create, the static routes
/// between them, and the knobs for the two core loops.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sockets: Vec<SocketConfig>,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    #[serde(default)]
    pub router: RouterSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SocketConfig {
    pub name: String,

    /// High-water-mark: queued-but-unsent envelopes beyond this are
    /// refused.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RouteConfig {
    pub to: Option<RouteKey>,
    pub from: Option<RouteKey>,
    pub src: String,
    pub dest: String,

    /// Config-file routes are static unless explicitly marked otherwise.
    #[serde(rename = "static", default = "default_static")]
    pub static_route: bool,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RouterSettings {
    #[serde(default = "crate::util::get_default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    #[serde(default = "default_control_capacity")]
    pub control_capacity: usize,

    /// Name of the socket that receives unroutable envelopes.
    pub error_socket: Option<String>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            poll_timeout_ms: crate::util::get_default_poll_timeout_ms(),
            control_capacity: default_control_capacity(),
            error_socket: None,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,

    #[serde(default = "default_dispatch_route")]
    pub dispatch_route: RouteKey,

    /// Name of the socket the scheduler dispatches into (a router feed
    /// input).
    #[serde(default = "default_dispatch_socket")]
    pub dispatch_socket: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            dispatch_route: default_dispatch_route(),
            dispatch_socket: default_dispatch_socket(),
        }
    }
}

impl SchedulerSettings {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_millis(self.tick_ms),
            dispatch_timeout: Duration::from_millis(self.dispatch_timeout_ms),
            dispatch_route: self.dispatch_route.clone(),
        }
    }
}

fn default_capacity() -> usize {
    1024
}

fn default_static() -> bool {
    true
}

fn default_control_capacity() -> usize {
    16
}

fn default_tick_ms() -> u64 {
    100
}

fn default_dispatch_timeout_ms() -> u64 {
    1000
}

fn default_dispatch_route() -> RouteKey {
    RouteKey::from("plugin_exec")
}

fn default_dispatch_socket() -> String {
    "scheduler.feed".to_string()
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|_| anyhow::anyhow!("Invalid configuration file provided!"))
        .inspect(|config: &Config| trace!("loaded config: {config:?}"))
}

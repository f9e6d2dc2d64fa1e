use tokio::time::Instant;

const HUB_CONFIG: &str = "HUB_CONFIG";

pub fn get_config_path() -> Option<String> {
    std::env::var(HUB_CONFIG).ok()
}

const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

pub fn get_default_poll_timeout_ms() -> u64 {
    DEFAULT_POLL_TIMEOUT_MS
}

/// Microsecond clock anchored to the wall clock at construction time and
/// advanced by the tokio runtime's notion of elapsed time.
///
/// Timestamps stay comparable across processes (they are epoch-based) while
/// remaining driven by `tokio::time`, so tests running under paused virtual
/// time observe deadlines deterministically.
#[derive(Debug, Clone)]
pub struct Clock {
    base_wall_us: u64,
    started: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            base_wall_us: chrono::Utc::now().timestamp_micros() as u64,
            started: Instant::now(),
        }
    }

    /// Current time in microseconds since the Unix epoch.
    pub fn now_us(&self) -> u64 {
        self.base_wall_us + self.started.elapsed().as_micros() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

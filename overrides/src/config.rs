use log::warn;
use stubline_intercept::ThreadSuspension;

const PANIC_ON_ORPHAN_ENV: &str = "STUBLINE_PANIC_ON_ORPHAN";
const THREAD_SUSPENSION_ENV: &str = "STUBLINE_THREAD_SUSPENSION";

/// Session behaviour knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionConfig {
    /// Panic as soon as a replacement runs with no override pointing at it,
    /// instead of reporting it when the session finishes.
    pub panic_on_orphan: bool,
    /// Whether other threads are frozen while hardened text is rewritten.
    pub thread_suspension: ThreadSuspension,
}

impl SessionConfig {
    /// Defaults overridden by `STUBLINE_PANIC_ON_ORPHAN` (set and not `0`)
    /// and `STUBLINE_THREAD_SUSPENSION` (`all` or `none`).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key).map(|v| v.to_string_lossy().into_owned()))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(value) = lookup(PANIC_ON_ORPHAN_ENV) {
            config.panic_on_orphan = !matches!(value.trim(), "" | "0" | "false");
        }
        if let Some(value) = lookup(THREAD_SUSPENSION_ENV) {
            match parse_suspension(&value) {
                Some(mode) => config.thread_suspension = mode,
                None => warn!(
                    "ignoring {}={:?}: expected `all` or `none`",
                    THREAD_SUSPENSION_ENV, value
                ),
            }
        }
        config
    }

    pub fn with_panic_on_orphan(mut self, enabled: bool) -> Self {
        self.panic_on_orphan = enabled;
        self
    }

    pub fn with_thread_suspension(mut self, mode: ThreadSuspension) -> Self {
        self.thread_suspension = mode;
        self
    }
}

fn parse_suspension(value: &str) -> Option<ThreadSuspension> {
    match value.trim().to_ascii_lowercase().as_str() {
        "all" => Some(ThreadSuspension::All),
        "none" => Some(ThreadSuspension::None),
        _ => None,
    }
}

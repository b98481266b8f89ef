//! Runtime settings read from `TETHER_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_FIELD_OWNER: &str = "tether";
pub const DEFAULT_QUEUE_CAP: usize = 1024;
pub const DEFAULT_POLL_SECS: u64 = 60;
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Upper bound for the initial sync of a watch session.
    pub sync_timeout: Duration,
    /// Namespace used for namespaced kinds whose manifest leaves it empty.
    pub default_namespace: String,
    /// Field manager name for server-side apply.
    pub field_owner: String,
    /// Capacity of trigger and change channels.
    pub queue_cap: usize,
    pub poll_interval: Duration,
    pub max_concurrent: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(DEFAULT_SYNC_TIMEOUT_SECS),
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            field_owner: DEFAULT_FIELD_OWNER.to_string(),
            queue_cap: DEFAULT_QUEUE_CAP,
            poll_interval: Duration::from_secs(DEFAULT_POLL_SECS),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            sync_timeout: env_parse::<u64>("TETHER_SYNC_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.sync_timeout),
            default_namespace: env_nonempty("TETHER_DEFAULT_NAMESPACE").unwrap_or(d.default_namespace),
            field_owner: env_nonempty("TETHER_FIELD_OWNER").unwrap_or(d.field_owner),
            queue_cap: env_parse::<usize>("TETHER_QUEUE_CAP").filter(|c| *c > 0).unwrap_or(d.queue_cap),
            poll_interval: env_parse::<u64>("TETHER_POLL_SECS").map(Duration::from_secs).unwrap_or(d.poll_interval),
            max_concurrent: env_parse::<usize>("TETHER_MAX_CONCURRENT").filter(|c| *c > 0).unwrap_or(d.max_concurrent),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.sync_timeout, Duration::from_secs(120));
        assert_eq!(s.default_namespace, "default");
        assert_eq!(s.field_owner, "tether");
    }
}

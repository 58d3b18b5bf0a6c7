use std::time::Duration;

pub const DEFAULT_INITIAL_BACKOFF_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_BACKOFF_DELAY: Duration = Duration::from_millis(60 * 1_000);
pub const DEFAULT_JITTER_FACTOR: f64 = 0.5;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(60 * 1_000);
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
pub const DEFAULT_MAX_PENDING_WRITES: usize = 10;
pub const DEFAULT_MAX_STORAGE_RETRIES: u32 = 3;
pub const DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE: usize = 100;
pub const DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT: f64 = 2.0;
pub const DEFAULT_ONLINE_STATE_TIMEOUT: Duration = Duration::from_millis(10 * 1_000);

/// Reconnect policy shared by both persistent streams and the storage retry
/// loop.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Fraction of the current delay applied as uniform random jitter in
    /// both directions.
    pub jitter_factor: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_BACKOFF_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_BACKOFF_DELAY,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

/// Tunables for the synchronization engine.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncSettings {
    pub max_concurrent_limbo_resolutions: usize,
    pub backoff: BackoffSettings,
    pub listen_idle_timeout: Duration,
    pub write_idle_timeout: Duration,
    pub online_state_timeout: Duration,
    pub max_pending_writes: usize,
    pub index_auto_creation: bool,
    pub index_auto_creation_min_collection_size: usize,
    pub relative_index_read_cost_per_document: f64,
    pub max_storage_retries: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            backoff: BackoffSettings::default(),
            listen_idle_timeout: DEFAULT_IDLE_TIMEOUT,
            write_idle_timeout: DEFAULT_IDLE_TIMEOUT,
            online_state_timeout: DEFAULT_ONLINE_STATE_TIMEOUT,
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            index_auto_creation: false,
            index_auto_creation_min_collection_size:
                DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE,
            relative_index_read_cost_per_document: DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT,
            max_storage_retries: DEFAULT_MAX_STORAGE_RETRIES,
        }
    }
}

impl SyncSettings {
    pub fn with_max_concurrent_limbo_resolutions(mut self, value: usize) -> Self {
        self.max_concurrent_limbo_resolutions = value.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSettings) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.listen_idle_timeout = timeout;
        self.write_idle_timeout = timeout;
        self
    }

    pub fn with_online_state_timeout(mut self, timeout: Duration) -> Self {
        self.online_state_timeout = timeout;
        self
    }

    pub fn with_max_pending_writes(mut self, value: usize) -> Self {
        self.max_pending_writes = value.max(1);
        self
    }

    pub fn with_index_auto_creation(mut self, enabled: bool) -> Self {
        self.index_auto_creation = enabled;
        self
    }

    pub fn with_index_auto_creation_min_collection_size(mut self, value: usize) -> Self {
        self.index_auto_creation_min_collection_size = value;
        self
    }

    pub fn with_max_storage_retries(mut self, value: u32) -> Self {
        self.max_storage_retries = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let settings = SyncSettings::default();
        assert_eq!(settings.max_concurrent_limbo_resolutions, 100);
        assert_eq!(settings.backoff.initial_delay, Duration::from_secs(1));
        assert_eq!(settings.backoff.max_delay, Duration::from_secs(60));
        assert_eq!(settings.max_pending_writes, 10);
        assert!(!settings.index_auto_creation);
    }

    #[test]
    fn builder_clamps_limbo_cap() {
        let settings = SyncSettings::default().with_max_concurrent_limbo_resolutions(0);
        assert_eq!(settings.max_concurrent_limbo_resolutions, 1);
    }
}

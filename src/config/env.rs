use super::WatchConfig;
use std::path::PathBuf;

pub const ENV_DATABASE_PATH: &str = "STATEWATCH_DATABASE_PATH";
pub const ENV_BATCH_DELAY_MS: &str = "STATEWATCH_BATCH_DELAY_MS";
pub const ENV_MAX_BATCH_SIZE: &str = "STATEWATCH_MAX_BATCH_SIZE";

impl WatchConfig {
    /// Override individual knobs from env vars. Unparseable values are ignored.
    pub fn apply_env(mut self) -> Self {
        self.apply_vars(|name| std::env::var(name).ok());
        self
    }

    fn apply_vars<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_DATABASE_PATH) {
            if !v.is_empty() {
                self.storage.database_path = PathBuf::from(v);
            }
        }
        if let Some(v) = lookup(ENV_BATCH_DELAY_MS) {
            if let Ok(ms) = v.parse::<u64>() {
                self.batcher.batch_delay_ms = ms;
            }
        }
        if let Some(v) = lookup(ENV_MAX_BATCH_SIZE) {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    self.batcher.max_batch_size = n;
                }
            }
        }
    }
}

use std::env;

/// Pipeline sizing, from the environment.
#[derive(Debug, Clone, Copy)]
pub struct UpdaterConfig {
    /// Bounded queue capacity between stages (`PIPE_SIZE`).
    pub pipe_size: usize,
    /// Rows per SQL batch (`BATCH_SIZE`).
    pub batch_size: usize,
}

impl UpdaterConfig {
    pub fn from_env() -> UpdaterConfig {
        UpdaterConfig {
            pipe_size: usize_from_env("PIPE_SIZE", 100),
            batch_size: usize_from_env("BATCH_SIZE", 100),
        }
    }
}

fn usize_from_env(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

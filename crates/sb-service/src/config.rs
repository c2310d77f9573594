use sb_bus::BusConfig;
use std::env;
use std::time::Duration;

/// Infrastructure knobs, read from the environment.
#[derive(Debug, Clone)]
pub struct InfraConfig {
    /// Broker endpoint, `host:port`.
    pub addr: String,
    /// Interval between healthcheck ping rounds.
    pub ping_delay: Duration,
    /// How long a ping round collects pongs.
    pub ping_timeout: Duration,
    /// Delay between broker reconnect attempts.
    pub reconnect: Duration,
}

impl InfraConfig {
    /// `INFRA_ADDR` (or `INFRA_HOST`+`INFRA_PORT`), `INFRA_PING_DELAY`,
    /// `INFRA_PING_TIMEOUT`, `INFRA_RECONNECT`.
    pub fn from_env() -> InfraConfig {
        let bus = BusConfig::from_env();
        InfraConfig {
            addr: bus.addr,
            reconnect: bus.reconnect_delay,
            ping_delay: secs_from_env("INFRA_PING_DELAY", 30.0),
            ping_timeout: secs_from_env("INFRA_PING_TIMEOUT", 2.0),
        }
    }

    /// Same knobs pointed at an explicit broker address (tests, embedded use).
    pub fn with_addr(addr: impl Into<String>) -> InfraConfig {
        InfraConfig {
            addr: addr.into(),
            ..InfraConfig::from_env()
        }
    }

    pub(crate) fn bus_config(&self) -> BusConfig {
        BusConfig {
            addr: self.addr.clone(),
            reconnect_delay: self.reconnect,
        }
    }
}

fn secs_from_env(key: &str, default: f64) -> Duration {
    let secs = env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<f64>().ok())
        .unwrap_or(default);
    Duration::from_secs_f64(secs)
}

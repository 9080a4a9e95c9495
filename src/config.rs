//! Settings read once at setup.
//!
//! Defaults are merged with `SPINDLE_`-prefixed environment variables:
//!
//! | Variable | Field | Default |
//! |---|---|---|
//! | `SPINDLE_SERVICE_NAME` | `service_name` | `spindle-service` |
//! | `SPINDLE_CONCURRENCY_LIMIT` | `concurrency_limit` | unset (no global limit) |
//! | `SPINDLE_CONCURRENCY_MAX_WAIT_MS` | `concurrency_max_wait_ms` | `100` |
//! | `SPINDLE_DEFAULT_TIMEOUT_MS` | `default_timeout_ms` | `30000` |
//! | `SPINDLE_DEBUG` | `debug` | `false` |

use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Reported in logs and request contexts.
    pub service_name: String,
    /// Global admission capacity. `None` disables the global limiter.
    pub concurrency_limit: Option<usize>,
    pub concurrency_max_wait_ms: u64,
    /// Budget for requests that arrive without one.
    pub default_timeout_ms: u64,
    /// Show internal error detail in 5xx responses.
    pub debug: bool,
}

impl Settings {
    pub const ENV_PREFIX: &'static str = "SPINDLE_";

    /// Defaults overridden by the environment.
    pub fn load() -> Result<Self, Error> {
        Ok(Self::figment().extract()?)
    }

    /// The provider stack behind [`Settings::load`], for callers that want
    /// to merge in more sources (a TOML file, CLI flags) first.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(Self::ENV_PREFIX))
    }

    pub fn concurrency_max_wait(&self) -> Duration {
        Duration::from_millis(self.concurrency_max_wait_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_name: "spindle-service".to_owned(),
            concurrency_limit: None,
            concurrency_max_wait_ms: 100,
            default_timeout_ms: 30_000,
            debug: false,
        }
    }
}

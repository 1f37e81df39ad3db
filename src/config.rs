//! Configuration for the dispatcher, the model backend and trace export
//!
//! Everything is read once into plain structs and passed to constructors.
//! `AppConfig::from_env()` reads the process environment;
//! `AppConfig::from_env_file` layers a `.env` file underneath it;
//! `AppConfig::from_lookup` takes any key lookup so tests never touch it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{DispatchError, Result};

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_MAX_HOPS: usize = 10;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: usize,

    /// Initial retry delay
    pub initial_delay: Duration,

    /// Maximum retry delay
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

/// Which chat-completions vendor to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vendor {
    Azure {
        endpoint: String,
        api_version: String,
        deployment: String,
    },
    OpenAi {
        base_url: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub vendor: Vendor,
    pub api_key: String,
    /// Model used by responders without their own override
    pub model: String,
    /// Per-call deadline enforced by the timeout layer
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

/// Trace export settings. Disabled unless explicitly turned on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
}

/// Whether a run may transfer back to a responder it already left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisitPolicy {
    #[default]
    Allow,
    Forbid,
}

/// Safety bounds for a single run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum number of transfers per run
    pub max_hops: usize,

    pub revisit: RevisitPolicy,

    /// Overall deadline, checked before each backend invocation
    pub run_deadline: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            revisit: RevisitPolicy::Allow,
            run_deadline: None,
        }
    }
}

impl DispatchConfig {
    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn with_revisit_policy(mut self, revisit: RevisitPolicy) -> Self {
        self.revisit = revisit;
        self
    }

    pub fn with_run_deadline(mut self, deadline: Duration) -> Self {
        self.run_deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub trace: TraceConfig,
    pub dispatch: DispatchConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from the process environment, falling back to the
    /// values in a dotenv-style file. Variables already set in the process
    /// win; a missing file is the same as an empty one.
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_lookup_over_file(|key| std::env::var(key).ok(), path.as_ref())
    }

    fn from_lookup_over_file<F>(lookup: F, path: &Path) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = read_env_file(path)?;
        Self::from_lookup(|key| lookup(key).or_else(|| file.get(key).cloned()))
    }

    /// Load configuration from an arbitrary key lookup. Empty values count as
    /// unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let vendor = match env.get("AZURE_OPENAI_ENDPOINT") {
            Some(endpoint) => Vendor::Azure {
                endpoint,
                api_version: env.require("AZURE_OPENAI_API_VERSION")?,
                deployment: env.require("AZURE_OPENAI_DEPLOYMENT")?,
            },
            None => Vendor::OpenAi {
                base_url: env.get("OPENAI_BASE_URL"),
            },
        };
        let api_key = match vendor {
            Vendor::Azure { .. } => env.require("AZURE_OPENAI_API_KEY")?,
            Vendor::OpenAi { .. } => env.require("OPENAI_API_KEY")?,
        };

        let mut retry = RetryConfig::default();
        if let Some(n) = env.parse::<usize>("HANDOFF_MAX_RETRIES")? {
            retry.max_retries = n;
        }
        let backend = BackendConfig {
            vendor,
            api_key,
            model: env
                .get("HANDOFF_MODEL")
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            request_timeout: Duration::from_secs(
                env.positive("HANDOFF_REQUEST_TIMEOUT_SECS")?.unwrap_or(60),
            ),
            retry,
        };

        let mut dispatch = DispatchConfig::default();
        if let Some(max_hops) = env.parse::<usize>("HANDOFF_MAX_HOPS")? {
            dispatch = dispatch.with_max_hops(max_hops);
        }
        if env.flag("HANDOFF_NO_REVISIT")?.unwrap_or(false) {
            dispatch = dispatch.with_revisit_policy(RevisitPolicy::Forbid);
        }
        if let Some(secs) = env.parse::<u64>("HANDOFF_RUN_TIMEOUT_SECS")? {
            dispatch = dispatch.with_run_deadline(Duration::from_secs(secs));
        }

        let trace = TraceConfig {
            enabled: env.flag("HANDOFF_TRACING")?.unwrap_or(false),
            endpoint: env.get("HANDOFF_TRACE_ENDPOINT"),
            api_key: env.get("HANDOFF_TRACE_API_KEY"),
        };
        if trace.enabled && trace.endpoint.is_some() && trace.api_key.is_none() {
            return Err(DispatchError::MissingConfig {
                key: "HANDOFF_TRACE_API_KEY".to_string(),
            });
        }

        Ok(Self {
            backend,
            trace,
            dispatch,
        })
    }
}

/// Parse a dotenv file into a map without touching the process environment.
fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let env_file_error = |err: dotenvy::Error| DispatchError::EnvFile {
        path: path.display().to_string(),
        message: err.to_string(),
    };
    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(err) if err.not_found() => return Ok(HashMap::new()),
        Err(err) => return Err(env_file_error(err)),
    };
    let vars = iter
        .collect::<std::result::Result<HashMap<_, _>, _>>()
        .map_err(env_file_error)?;
    debug!(path = %path.display(), keys = vars.len(), "loaded env file");
    Ok(vars)
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, key: &str) -> Result<String> {
        self.get(key).ok_or_else(|| DispatchError::MissingConfig {
            key: key.to_string(),
        })
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value
                .parse::<T>()
                .map(Some)
                .map_err(|_| DispatchError::InvalidConfig {
                    key: key.to_string(),
                    value,
                }),
        }
    }

    /// Like `parse`, but zero is rejected.
    fn positive(&self, key: &str) -> Result<Option<u64>> {
        match self.parse::<u64>(key)? {
            Some(0) => Err(DispatchError::InvalidConfig {
                key: key.to_string(),
                value: "0".to_string(),
            }),
            other => Ok(other),
        }
    }

    fn flag(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(DispatchError::InvalidConfig {
                    key: key.to_string(),
                    value,
                }),
            },
        }
    }
}

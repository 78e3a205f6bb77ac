use std::path::PathBuf;
use std::time::Duration;

use crate::sandbox::SandboxKind;

const DEFAULT_QUEUE_NAME: &str = "submission_queue";
const DEFAULT_DB_NAME: &str = "judger";
const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Callback delivery settings; present only when callback mode is enabled.
#[derive(Clone, Debug)]
pub struct CallbackConfig {
    pub url: String,
    pub secret: String,
}

/// Everything the daemon reads from the environment, resolved once at
/// startup. Missing required values are fatal.
#[derive(Clone, Debug)]
pub struct Config {
    pub redis_url: String,
    pub queue_name: String,
    pub mongo_uri: String,
    pub mongo_db: String,
    pub callback: Option<CallbackConfig>,
    pub sandbox_backend: SandboxKind,
    pub scratch_dir: PathBuf,
    pub store_timeout: Duration,
    pub lang_config_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable lookup. Empty values are
    /// treated the same as absent ones.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|value| !value.is_empty());
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let redis_url = required("REDIS_URL")?;
        let queue_name = get("REDIS_QUEUE_NAME").unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string());
        let mongo_uri = required("MONGO_URI")?;
        let mongo_db = get("MONGO_DB_NAME").unwrap_or_else(|| DEFAULT_DB_NAME.to_string());

        // Callback mode is enabled by the presence of the URL; the secret is
        // then mandatory.
        let callback = match get("INTERNAL_API_URL") {
            Some(url) => Some(CallbackConfig {
                url,
                secret: required("INTERNAL_API_SECRET")?,
            }),
            None => None,
        };

        // isolate is the default: it is the backend that jails the
        // filesystem as well as the network.
        let sandbox_backend = match get("SANDBOX_BACKEND") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                var: "SANDBOX_BACKEND",
                value: raw,
            })?,
            None => SandboxKind::Isolate,
        };

        let scratch_dir = get("SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("judged"));

        let store_timeout = match get("STORE_TIMEOUT_MS") {
            Some(raw) => {
                let ms: u64 = raw.parse().map_err(|_| ConfigError::Invalid {
                    var: "STORE_TIMEOUT_MS",
                    value: raw,
                })?;
                Duration::from_millis(ms)
            }
            None => Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
        };

        let lang_config_path = get("LANG_CONFIG_PATH").map(PathBuf::from);

        Ok(Config {
            redis_url,
            queue_name,
            mongo_uri,
            mongo_db,
            callback,
            sandbox_backend,
            scratch_dir,
            store_timeout,
            lang_config_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("REDIS_URL", "redis://localhost:6379"),
            ("MONGO_URI", "mongodb://localhost:27017"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|name| env.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_apply_when_optional_values_absent() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.queue_name, "submission_queue");
        assert_eq!(config.mongo_db, "judger");
        assert!(config.callback.is_none());
        assert_eq!(config.sandbox_backend, SandboxKind::Isolate);
        assert_eq!(config.store_timeout, Duration::from_millis(5_000));
    }

    #[test]
    fn missing_redis_url_is_fatal() {
        let mut env = base_env();
        env.remove("REDIS_URL");
        assert!(matches!(
            load(&env),
            Err(ConfigError::Missing("REDIS_URL"))
        ));
    }

    #[test]
    fn missing_mongo_uri_is_fatal() {
        let mut env = base_env();
        env.remove("MONGO_URI");
        assert!(matches!(load(&env), Err(ConfigError::Missing("MONGO_URI"))));
    }

    #[test]
    fn empty_value_counts_as_missing() {
        let mut env = base_env();
        env.insert("REDIS_URL", "");
        assert!(matches!(
            load(&env),
            Err(ConfigError::Missing("REDIS_URL"))
        ));
    }

    #[test]
    fn callback_url_requires_secret() {
        let mut env = base_env();
        env.insert("INTERNAL_API_URL", "http://api.internal/callback");
        assert!(matches!(
            load(&env),
            Err(ConfigError::Missing("INTERNAL_API_SECRET"))
        ));

        env.insert("INTERNAL_API_SECRET", "hunter2");
        let config = load(&env).unwrap();
        let callback = config.callback.unwrap();
        assert_eq!(callback.url, "http://api.internal/callback");
        assert_eq!(callback.secret, "hunter2");
    }

    #[test]
    fn sandbox_backend_parses_or_fails() {
        let mut env = base_env();
        env.insert("SANDBOX_BACKEND", "process");
        assert_eq!(load(&env).unwrap().sandbox_backend, SandboxKind::Process);

        env.insert("SANDBOX_BACKEND", "isolate");
        assert_eq!(load(&env).unwrap().sandbox_backend, SandboxKind::Isolate);

        env.insert("SANDBOX_BACKEND", "chroot");
        assert!(matches!(
            load(&env),
            Err(ConfigError::Invalid {
                var: "SANDBOX_BACKEND",
                ..
            })
        ));
    }

    #[test]
    fn store_timeout_is_configurable() {
        let mut env = base_env();
        env.insert("STORE_TIMEOUT_MS", "2500");
        assert_eq!(
            load(&env).unwrap().store_timeout,
            Duration::from_millis(2_500)
        );

        env.insert("STORE_TIMEOUT_MS", "soon");
        assert!(matches!(load(&env), Err(ConfigError::Invalid { .. })));
    }
}

use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    /// When unset, history and the auto forward flag live in process memory.
    pub redis_url: Option<String>,

    /// When unset, verified addresses are only logged.
    pub forward_url: Option<String>,

    #[envconfig(default = "5000")]
    pub forward_timeout: EnvMsDuration,

    /// Used when the store does not hold an auto forward flag.
    #[envconfig(default = "true")]
    pub auto_forward: bool,

    #[envconfig(default = "10")]
    pub window_size: usize,

    #[envconfig(default = "20")]
    pub buffer_size: usize,

    #[envconfig(default = "10000")]
    pub buffer_window: EnvMsDuration,

    #[envconfig(default = "pump,bonk")]
    pub suffix_markers: CommaSeparated,

    #[envconfig(default = "3")]
    pub suffix_max_overlap: usize,

    #[envconfig(default = "20")]
    pub direct_previous_max_len: usize,

    #[envconfig(default = "44")]
    pub direct_current_max_len: usize,

    #[envconfig(default = "50")]
    pub history_limit: usize,

    #[envconfig(default = "30")]
    pub liveness_deadline_secs: u64,

    #[envconfig(nested = true)]
    pub verification: VerificationConfig,

    #[envconfig(nested = true)]
    pub reconstruction: ReconstructionConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct VerificationConfig {
    #[envconfig(default = "https://quote-api.jup.ag/v6")]
    pub quote_url: NonEmptyString,

    #[envconfig(default = "8000")]
    pub quote_timeout: EnvMsDuration,

    #[envconfig(default = "https://api.dexscreener.com")]
    pub market_url: NonEmptyString,

    #[envconfig(default = "8000")]
    pub market_timeout: EnvMsDuration,

    #[envconfig(default = "https://frontend-api.pump.fun")]
    pub registry_url: NonEmptyString,

    #[envconfig(default = "5000")]
    pub registry_timeout: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct ReconstructionConfig {
    #[envconfig(default = "true")]
    pub reconstruction_enabled: bool,

    #[envconfig(default = "https://api.openai.com/v1")]
    pub reconstruction_url: NonEmptyString,

    /// Reconstruction is disabled when no key is available.
    pub reconstruction_api_key: Option<String>,

    #[envconfig(default = "gpt-4o-mini")]
    pub reconstruction_model: NonEmptyString,

    #[envconfig(default = "15000")]
    pub reconstruction_timeout: EnvMsDuration,

    #[envconfig(default = "3")]
    pub reconstruction_max_attempts: u32,

    #[envconfig(default = "2")]
    pub reconstruction_backoff_coefficient: u32,

    #[envconfig(default = "250")]
    pub reconstruction_initial_interval: EnvMsDuration,

    #[envconfig(default = "2000")]
    pub reconstruction_maximum_interval: EnvMsDuration,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// A comma separated list, with surrounding whitespace and empty items dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommaSeparated(pub Vec<String>);

impl FromStr for CommaSeparated {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CommaSeparated(
            s.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3302");
        assert_eq!(config.window_size, 10);
        assert_eq!(config.buffer_size, 20);
        assert_eq!(config.buffer_window.0, time::Duration::from_secs(10));
        assert_eq!(
            config.suffix_markers.0,
            vec!["pump".to_owned(), "bonk".to_owned()]
        );
        assert_eq!(
            config.verification.quote_timeout.0,
            time::Duration::from_secs(8)
        );
        assert_eq!(
            config.verification.registry_timeout.0,
            time::Duration::from_secs(5)
        );
        assert_eq!(config.reconstruction.reconstruction_max_attempts, 3);
        assert!(config.reconstruction.reconstruction_api_key.is_none());
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let env = HashMap::from([
            ("SUFFIX_MARKERS".to_owned(), " moon , ,pump".to_owned()),
            ("FORWARD_URL".to_owned(), "http://localhost:9000/hook".to_owned()),
            ("MARKET_TIMEOUT".to_owned(), "250".to_owned()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(
            config.suffix_markers.0,
            vec!["moon".to_owned(), "pump".to_owned()]
        );
        assert_eq!(
            config.forward_url.as_deref(),
            Some("http://localhost:9000/hook")
        );
        assert_eq!(
            config.verification.market_timeout.0,
            time::Duration::from_millis(250)
        );
    }

    #[test]
    fn test_invalid_duration() {
        assert_eq!(
            EnvMsDuration::from_str("soon").unwrap_err(),
            ParseEnvMsDurationError
        );
    }
}

//! Configuration and environment selection.
//!
//! A [`Config`] is built once at process start (in code or from TOML) and passed
//! by reference to every component. Nothing in this crate reads environment
//! variables.
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use zeroize::Zeroizing;

/// SIFEN environment selection.
/// - Test: the `sifen-test` homologation environment.
/// - Production: the live environment; documents sent here are legally binding.
///
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use sifen_core::config::EnvironmentType;
///
/// let env = EnvironmentType::from_str("test")?;
/// assert_eq!(env, EnvironmentType::Test);
/// # Ok::<(), sifen_core::config::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentType {
    #[default]
    Test,
    Production,
}

/// Error returned when parsing an [`EnvironmentType`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid environment type: {input}")]
    Invalid { input: String },
}

impl FromStr for EnvironmentType {
    type Err = EnvironmentParseError;
    fn from_str(env: &str) -> Result<EnvironmentType, EnvironmentParseError> {
        match env.to_ascii_lowercase().as_str() {
            "test" | "dev" | "homologacion" => Ok(EnvironmentType::Test),
            "production" | "prod" => Ok(EnvironmentType::Production),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "test",
            EnvironmentType::Production => "production",
        }
    }

    /// Base URL of the SOAP services.
    pub fn endpoint_url(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "https://sifen-test.set.gov.py/",
            EnvironmentType::Production => "https://sifen.set.gov.py/",
        }
    }

    /// Prefix of the public consultation URL embedded in the QR trailer.
    pub fn qr_base_url(&self) -> &'static str {
        match self {
            EnvironmentType::Test => "https://ekuatia.set.gov.py/consultas-test/qr?",
            EnvironmentType::Production => "https://ekuatia.set.gov.py/consultas/qr?",
        }
    }
}

/// Service operations the client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Asynchronous batch reception (`siRecepLoteDE`).
    RecibeLote,
    /// Batch status query (`siConsLoteDE`).
    ConsultaLote,
    /// Single document lookup by CDC (`siConsDE`).
    ConsultaDe,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::RecibeLote => "recibe_lote",
            Operation::ConsultaLote => "consulta_lote",
            Operation::ConsultaDe => "consulta_de",
        }
    }

    /// Path of the service description, relative to the environment base URL.
    pub fn wsdl_path(&self) -> &'static str {
        match self {
            Operation::RecibeLote => "de/ws/async/recibe-lote.wsdl",
            Operation::ConsultaLote => "de/ws/consultas/consulta-lote.wsdl",
            Operation::ConsultaDe => "de/ws/consultas/consulta.wsdl",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A secret string that never shows up in `Debug` output and is wiped on drop.
#[derive(Clone, Default)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Secret::new)
    }
}

/// PKCS#12 location and password.
#[derive(Debug, Clone, Deserialize)]
pub struct CertificateConfig {
    pub path: PathBuf,
    pub password: Secret,
}

/// Taxpayer security code (CSC) used to seal the QR trailer.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityCodeConfig {
    /// Four-digit CSC identifier, e.g. `0001`.
    pub id: String,
    pub secret: Secret,
}

/// Exponential backoff with jitter, shared by transport retries and status polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Ceiling applied after jitter.
    pub max_delay_ms: u64,
    /// Jitter upper bound as a percentage of the computed delay.
    pub jitter_percent: u8,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_percent: 25,
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            jitter_percent: BackoffPolicy::default().jitter_percent,
        }
    }

    pub fn with_jitter_percent(mut self, jitter_percent: u8) -> Self {
        self.jitter_percent = jitter_percent.min(100);
        self
    }

    /// Delay before retry number `attempt` (1-based: the wait after the first failure
    /// is `delay_for(1)`), without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Delay including a random jitter of up to `jitter_percent`% of the base delay.
    ///
    /// Below the cap the jitter is added; once `base + spread` would cross
    /// `max_delay_ms` the window slides down to `[max - spread, max]` instead, so
    /// retries that sit at the cap still spread out.
    pub fn delay_for(&self, attempt: u32, rng: &mut impl rand::Rng) -> Duration {
        let base = self.base_delay_for(attempt).as_millis() as u64;
        let spread = base.saturating_mul(u64::from(self.jitter_percent)) / 100;
        let jitter = if spread == 0 { 0 } else { rng.gen_range(0..=spread) };
        let delay = if base.saturating_add(spread) <= self.max_delay_ms {
            base + jitter
        } else {
            self.max_delay_ms.saturating_sub(jitter)
        };
        Duration::from_millis(delay)
    }
}

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Configuration for the submission pipeline.
///
/// # Examples
/// ```rust
/// use sifen_core::config::{Config, EnvironmentType};
///
/// let config = Config::new(EnvironmentType::Test)
///     .with_certificate("certs/taxpayer.p12", "changeit");
/// assert_eq!(config.env(), EnvironmentType::Test);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    env: EnvironmentType,
    certificate: Option<CertificateConfig>,
    security_code: Option<SecurityCodeConfig>,
    base_url: Option<String>,
    endpoints: BTreeMap<Operation, String>,
    use_known_endpoints: bool,
    request_timeout_ms: u64,
    retry: BackoffPolicy,
    poll: BackoffPolicy,
    autofix_max_iterations: u32,
    openssl_binary: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            env: EnvironmentType::Test,
            certificate: None,
            security_code: None,
            base_url: None,
            endpoints: BTreeMap::new(),
            use_known_endpoints: true,
            request_timeout_ms: 30_000,
            retry: BackoffPolicy::default(),
            poll: BackoffPolicy {
                max_attempts: 10,
                base_delay_ms: 2_000,
                max_delay_ms: 60_000,
                jitter_percent: 25,
            },
            autofix_max_iterations: 3,
            openssl_binary: PathBuf::from("openssl"),
        }
    }
}

impl Config {
    pub fn new(env: EnvironmentType) -> Self {
        Self {
            env,
            ..Self::default()
        }
    }

    /// Parses a TOML document. Missing keys take their defaults.
    ///
    /// ```rust
    /// use sifen_core::config::{Config, EnvironmentType};
    ///
    /// let config = Config::from_toml_str(r#"
    ///     env = "production"
    ///     autofix_max_iterations = 5
    ///
    ///     [certificate]
    ///     path = "/etc/sifen/taxpayer.p12"
    ///     password = "secret"
    ///
    ///     [retry]
    ///     max_attempts = 4
    /// "#)?;
    /// assert_eq!(config.env(), EnvironmentType::Production);
    /// assert_eq!(config.retry().max_attempts, 4);
    /// # Ok::<(), sifen_core::config::ConfigError>(())
    /// ```
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(input)?;
        config.check()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Rejects settings that cannot work (zero attempts, malformed CSC id).
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                message: "must be at least 1".into(),
            });
        }
        if self.poll.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "poll.max_attempts",
                message: "must be at least 1".into(),
            });
        }
        if let Some(code) = &self.security_code {
            if code.id.len() != 4 || !code.id.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ConfigError::Invalid {
                    field: "security_code.id",
                    message: format!("expected 4 digits, got '{}'", code.id),
                });
            }
        }
        Ok(())
    }

    pub fn with_certificate(mut self, path: impl Into<PathBuf>, password: impl Into<String>) -> Self {
        self.certificate = Some(CertificateConfig {
            path: path.into(),
            password: Secret::new(password),
        });
        self
    }

    pub fn with_security_code(mut self, id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.security_code = Some(SecurityCodeConfig {
            id: id.into(),
            secret: Secret::new(secret),
        });
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_endpoint(mut self, operation: Operation, url: impl Into<String>) -> Self {
        self.endpoints.insert(operation, url.into());
        self
    }

    pub fn with_known_endpoints(mut self, enabled: bool) -> Self {
        self.use_known_endpoints = enabled;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll(mut self, poll: BackoffPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_autofix_max_iterations(mut self, iterations: u32) -> Self {
        self.autofix_max_iterations = iterations;
        self
    }

    pub fn with_openssl_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.openssl_binary = binary.into();
        self
    }

    pub fn env(&self) -> EnvironmentType {
        self.env
    }

    pub fn certificate(&self) -> Option<&CertificateConfig> {
        self.certificate.as_ref()
    }

    pub fn security_code(&self) -> Option<&SecurityCodeConfig> {
        self.security_code.as_ref()
    }

    /// Base URL with a guaranteed trailing slash.
    pub fn base_url(&self) -> String {
        match &self.base_url {
            Some(value) if value.ends_with('/') => value.clone(),
            Some(value) => format!("{value}/"),
            None => self.env.endpoint_url().to_string(),
        }
    }

    pub fn endpoint_override(&self, operation: Operation) -> Option<&str> {
        self.endpoints.get(&operation).map(String::as_str)
    }

    pub fn use_known_endpoints(&self) -> bool {
        self.use_known_endpoints
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry(&self) -> &BackoffPolicy {
        &self.retry
    }

    pub fn poll(&self) -> &BackoffPolicy {
        &self.poll
    }

    pub fn autofix_max_iterations(&self) -> u32 {
        self.autofix_max_iterations
    }

    pub fn openssl_binary(&self) -> &Path {
        &self.openssl_binary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn environment_round_trips_through_strings() {
        for env in [EnvironmentType::Test, EnvironmentType::Production] {
            assert_eq!(EnvironmentType::from_str(env.as_str()).unwrap(), env);
        }
        assert!(EnvironmentType::from_str("staging").is_err());
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let config = Config::default().with_base_url("http://localhost:8080");
        assert_eq!(config.base_url(), "http://localhost:8080/");
        assert_eq!(
            Config::new(EnvironmentType::Production).base_url(),
            "https://sifen.set.gov.py/"
        );
    }

    #[test]
    fn toml_overrides_defaults_and_keeps_the_rest() {
        let config = Config::from_toml_str(
            r#"
            env = "test"
            base_url = "http://127.0.0.1:9000"
            use_known_endpoints = false

            [endpoints]
            consulta_lote = "http://127.0.0.1:9000/lote"

            [poll]
            max_attempts = 20
            base_delay_ms = 10
            "#,
        )
        .expect("config");
        assert!(!config.use_known_endpoints());
        assert_eq!(
            config.endpoint_override(Operation::ConsultaLote),
            Some("http://127.0.0.1:9000/lote")
        );
        assert_eq!(config.poll().max_attempts, 20);
        assert_eq!(config.poll().max_delay_ms, BackoffPolicy::default().max_delay_ms);
        assert_eq!(config.retry(), &BackoffPolicy::default());
        assert_eq!(config.autofix_max_iterations(), 3);
    }

    #[test]
    fn toml_rejects_zero_attempts_and_bad_csc_id() {
        let err = Config::from_toml_str("[retry]\nmax_attempts = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "retry.max_attempts", .. }));

        let err = Config::from_toml_str("[security_code]\nid = \"1\"\nsecret = \"x\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "security_code.id", .. }));
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let config = Config::default().with_certificate("a.p12", "hunter2");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn backoff_grows_exponentially_and_respects_ceiling() {
        let policy = BackoffPolicy::new(5, 100, 1_000).with_jitter_percent(0);
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay_for(10), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay_for(200), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = BackoffPolicy::new(5, 100, 10_000).with_jitter_percent(50);
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..6 {
            let base = policy.base_delay_for(attempt);
            let delay = policy.delay_for(attempt, &mut rng);
            assert!(delay >= base);
            assert!(delay <= base + base / 2);
        }

        let capped = BackoffPolicy::new(5, 1_000, 1_000).with_jitter_percent(100);
        let delay = capped.delay_for(1, &mut rng);
        assert!(delay <= Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_survives_at_the_cap() {
        let policy = BackoffPolicy::new(10, 1_000, 4_000).with_jitter_percent(25);
        let mut rng = StdRng::seed_from_u64(11);
        let delays: std::collections::BTreeSet<_> = (0..32)
            .map(|_| policy.delay_for(8, &mut rng))
            .collect();

        assert!(delays.len() > 1, "capped delays collapsed to {delays:?}");
        for delay in &delays {
            assert!(*delay <= Duration::from_millis(4_000));
            assert!(*delay >= Duration::from_millis(3_000));
        }
    }
}

//! Runtime configuration
//!
//! Settings are read through a [`ConfigResolver`], which is also what the
//! topic registry uses to resolve `#KEY` topic tokens. [`EnvResolver`] reads
//! the process environment; a `HashMap<String, String>` works for tests and
//! for hosts that already loaded their configuration.
//!
//! # Example
//!
//! ```rust
//! use conflux::config::{KafkaSettings, SecurityProtocol};
//! use std::time::Duration;
//!
//! let settings = KafkaSettings::builder()
//!     .bootstrap_servers(["kafka-1:9092", "kafka-2:9092"])
//!     .group_id("billing")
//!     .security_protocol(SecurityProtocol::SaslSsl)
//!     .sasl_plain("svc-billing", "secret")
//!     .auto_commit_interval(Duration::from_secs(5))
//!     .build();
//!
//! assert_eq!(settings.group_id, "billing-CLIENT");
//! ```

use crate::codec::PayloadFormat;
use crate::error::{Error, Result};
use crate::types::SensitiveString;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Configuration keys
pub mod keys {
    pub const ENABLED: &str = "KAFKA_ENABLED";
    pub const BOOTSTRAP_SERVERS: &str = "KAFKA_BOOTSTRAP_SERVERS";
    pub const GROUP_ID: &str = "KAFKA_GROUP_ID";
    pub const CLIENT_ID: &str = "KAFKA_CLIENT_ID";
    pub const CLIENT_POSTFIX: &str = "KAFKA_CLIENT_POSTFIX";
    pub const SECURITY_PROTOCOL: &str = "KAFKA_SECURITY_PROTOCOL";
    pub const SASL_MECHANISM: &str = "KAFKA_SASL_MECHANISM";
    pub const SASL_USER: &str = "KAFKA_SASL_AUTH_USER";
    pub const SASL_PASSWORD: &str = "KAFKA_SASL_AUTH_PASSWORD";
    pub const AUTO_COMMIT: &str = "KAFKA_CONSUMER_AUTO_COMMIT";
    pub const AUTO_COMMIT_INTERVAL: &str = "KAFKA_AUTO_COMMIT_INTERVAL";
    pub const AUTO_COMMIT_THRESHOLD: &str = "KAFKA_AUTO_COMMIT_THRESHOLD";
    pub const AUTO_CONNECT: &str = "KAFKA_AUTO_CONNECT";
    pub const STARTUP_DELAY_MS: &str = "KAFKA_STARTUP_DELAY_MS";
    pub const POLL_MAX_WAIT_MS: &str = "KAFKA_POLL_MAX_WAIT_MS";
    pub const CONNECT_TIMEOUT_MS: &str = "KAFKA_CONNECT_TIMEOUT_MS";
    pub const RECONNECT_BACKOFF_MS: &str = "KAFKA_RECONNECT_BACKOFF_MS";
    pub const RECONNECT_BACKOFF_MAX_MS: &str = "KAFKA_RECONNECT_BACKOFF_MAX_MS";
    pub const PAYLOAD_FORMAT: &str = "KAFKA_PAYLOAD_FORMAT";
}

const DEFAULT_BOOTSTRAP: &str = "localhost:9092";
const DEFAULT_GROUP_ID: &str = "conflux";
const DEFAULT_POSTFIX: &str = "CLIENT";

// ============================================================================
// Resolvers
// ============================================================================

/// Source of configuration values
pub trait ConfigResolver: Send + Sync {
    /// Value for `key`, if set
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvResolver;

impl ConfigResolver for EnvResolver {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl ConfigResolver for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

impl<R: ConfigResolver + ?Sized> ConfigResolver for &R {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }
}

// ============================================================================
// Security
// ============================================================================

/// Broker security protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityProtocol {
    Plaintext,
    SaslPlaintext,
    SaslSsl,
    Ssl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plaintext => "PLAINTEXT",
            Self::SaslPlaintext => "SASL_PLAINTEXT",
            Self::SaslSsl => "SASL_SSL",
            Self::Ssl => "SSL",
        }
    }

    pub fn uses_sasl(&self) -> bool {
        matches!(self, Self::SaslPlaintext | Self::SaslSsl)
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self, Self::SaslSsl | Self::Ssl)
    }

    /// Lenient parse: case-insensitive, anything unknown is `None`
    pub fn parse_lenient(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PLAINTEXT" => Some(Self::Plaintext),
            "SASL_PLAINTEXT" => Some(Self::SaslPlaintext),
            "SASL_SSL" => Some(Self::SaslSsl),
            "SSL" => Some(Self::Ssl),
            _ => None,
        }
    }
}

impl fmt::Display for SecurityProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SASL mechanism
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum SaslMechanism {
    #[default]
    #[serde(rename = "PLAIN")]
    Plain,
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
    #[serde(rename = "SCRAM-SHA-512")]
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

impl FromStr for SaslMechanism {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('_', "-").as_str() {
            "PLAIN" => Ok(Self::Plain),
            "SCRAM-SHA-256" => Ok(Self::ScramSha256),
            "SCRAM-SHA-512" => Ok(Self::ScramSha512),
            other => Err(Error::config(format!("unsupported SASL mechanism '{}'", other))),
        }
    }
}

/// SASL credentials
#[derive(Debug, Clone, Serialize)]
pub struct SaslSettings {
    pub mechanism: SaslMechanism,
    pub username: String,
    pub password: SensitiveString,
}

// ============================================================================
// Commit and reconnect policies
// ============================================================================

/// Consumer-group commit behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoCommitSettings {
    /// Commit automatically; when false handlers receive a commit token
    pub enabled: bool,
    /// Commit at most this often
    #[serde(with = "duration_ms")]
    pub interval: Option<Duration>,
    /// Commit after this many resolved records
    pub threshold: Option<u32>,
}

impl Default for AutoCommitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: None,
            threshold: None,
        }
    }
}

/// Delay between a failed reconnect and the next attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Retry right away. A sustained outage becomes a tight reconnect loop.
    #[default]
    Immediate,
    /// Doubling delay from `initial` up to `max`, reset after a successful connect
    Backoff {
        #[serde(with = "duration_ms_required")]
        initial: Duration,
        #[serde(with = "duration_ms_required")]
        max: Duration,
    },
}

impl ReconnectPolicy {
    /// Delay before attempt number `failures` (1-based)
    pub fn delay(&self, failures: u32) -> Duration {
        match self {
            Self::Immediate => Duration::ZERO,
            Self::Backoff { initial, max } => {
                let factor = 1u32 << failures.saturating_sub(1).min(16);
                initial.saturating_mul(factor).min(*max)
            }
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Complete runtime settings
#[derive(Debug, Clone, Serialize)]
pub struct KafkaSettings {
    /// Runtime enabled at all
    pub enabled: bool,
    pub bootstrap_servers: Vec<String>,
    /// Effective consumer group id (postfix applied)
    pub group_id: String,
    /// Effective client id (postfix applied)
    pub client_id: String,
    pub security_protocol: Option<SecurityProtocol>,
    pub sasl: Option<SaslSettings>,
    pub auto_commit: AutoCommitSettings,
    /// Connect from `start()`
    pub auto_connect: bool,
    /// Delay before the auto-connect attempt
    #[serde(with = "duration_ms_required")]
    pub startup_delay: Duration,
    /// Long-poll wait for a receive call
    #[serde(with = "duration_ms_required")]
    pub poll_max_wait: Duration,
    #[serde(with = "duration_ms_required")]
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub payload_format: PayloadFormat,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bootstrap_servers: vec![DEFAULT_BOOTSTRAP.to_string()],
            group_id: with_postfix(DEFAULT_GROUP_ID, DEFAULT_POSTFIX),
            client_id: with_postfix(DEFAULT_GROUP_ID, DEFAULT_POSTFIX),
            security_protocol: None,
            sasl: None,
            auto_commit: AutoCommitSettings::default(),
            auto_connect: true,
            startup_delay: Duration::from_secs(5),
            poll_max_wait: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::Immediate,
            payload_format: PayloadFormat::FramedJson,
        }
    }
}

impl KafkaSettings {
    pub fn builder() -> KafkaSettingsBuilder {
        KafkaSettingsBuilder::default()
    }

    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_resolver(&EnvResolver)
    }

    /// Load from any resolver. Unset keys take their defaults; a set key
    /// with an unparsable value is a configuration error.
    pub fn from_resolver(resolver: &dyn ConfigResolver) -> Result<Self> {
        let get = |key: &str| {
            resolver
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bootstrap_servers = get(keys::BOOTSTRAP_SERVERS)
            .map(|raw| split_servers(&raw))
            .unwrap_or_else(|| vec![DEFAULT_BOOTSTRAP.to_string()]);
        if bootstrap_servers.is_empty() {
            return Err(Error::config(format!(
                "{} contains no broker address",
                keys::BOOTSTRAP_SERVERS
            )));
        }

        let postfix = get(keys::CLIENT_POSTFIX).unwrap_or_else(|| DEFAULT_POSTFIX.to_string());
        let base_group = get(keys::GROUP_ID).unwrap_or_else(|| DEFAULT_GROUP_ID.to_string());
        let base_client = get(keys::CLIENT_ID).unwrap_or_else(|| base_group.clone());

        let security_protocol = get(keys::SECURITY_PROTOCOL).and_then(|raw| {
            let parsed = SecurityProtocol::parse_lenient(&raw);
            if parsed.is_none() {
                tracing::warn!(value = %raw, "Ignoring unknown {}", keys::SECURITY_PROTOCOL);
            }
            parsed
        });

        let sasl = match security_protocol {
            Some(protocol) if protocol.uses_sasl() => {
                let mechanism = get(keys::SASL_MECHANISM)
                    .map(|m| m.parse())
                    .transpose()?
                    .unwrap_or_default();
                let username = get(keys::SASL_USER).ok_or_else(|| {
                    Error::config(format!("{} is required for {}", keys::SASL_USER, protocol))
                })?;
                let password = get(keys::SASL_PASSWORD).ok_or_else(|| {
                    Error::config(format!(
                        "{} is required for {}",
                        keys::SASL_PASSWORD,
                        protocol
                    ))
                })?;
                Some(SaslSettings {
                    mechanism,
                    username,
                    password: SensitiveString::new(password),
                })
            }
            _ => None,
        };

        let auto_commit = AutoCommitSettings {
            enabled: parse_opt(keys::AUTO_COMMIT, get(keys::AUTO_COMMIT), parse_bool)?
                .unwrap_or(true),
            interval: parse_opt(keys::AUTO_COMMIT_INTERVAL, get(keys::AUTO_COMMIT_INTERVAL), parse_millis)?,
            threshold: parse_opt(keys::AUTO_COMMIT_THRESHOLD, get(keys::AUTO_COMMIT_THRESHOLD), |v| {
                v.parse::<u32>().ok().filter(|n| *n > 0)
            })?,
        };

        let defaults = KafkaSettings::default();
        let reconnect = match parse_opt(
            keys::RECONNECT_BACKOFF_MS,
            get(keys::RECONNECT_BACKOFF_MS),
            parse_millis,
        )? {
            Some(initial) if !initial.is_zero() => ReconnectPolicy::Backoff {
                initial,
                max: parse_opt(
                    keys::RECONNECT_BACKOFF_MAX_MS,
                    get(keys::RECONNECT_BACKOFF_MAX_MS),
                    parse_millis,
                )?
                .unwrap_or(Duration::from_secs(30))
                .max(initial),
            },
            _ => ReconnectPolicy::Immediate,
        };

        Ok(Self {
            enabled: parse_opt(keys::ENABLED, get(keys::ENABLED), parse_bool)?.unwrap_or(false),
            bootstrap_servers,
            group_id: with_postfix(&base_group, &postfix),
            client_id: with_postfix(&base_client, &postfix),
            security_protocol,
            sasl,
            auto_commit,
            auto_connect: parse_opt(keys::AUTO_CONNECT, get(keys::AUTO_CONNECT), parse_bool)?
                .unwrap_or(true),
            startup_delay: parse_opt(keys::STARTUP_DELAY_MS, get(keys::STARTUP_DELAY_MS), parse_millis)?
                .unwrap_or(defaults.startup_delay),
            poll_max_wait: parse_opt(keys::POLL_MAX_WAIT_MS, get(keys::POLL_MAX_WAIT_MS), parse_millis)?
                .unwrap_or(defaults.poll_max_wait),
            connect_timeout: parse_opt(
                keys::CONNECT_TIMEOUT_MS,
                get(keys::CONNECT_TIMEOUT_MS),
                parse_millis,
            )?
            .unwrap_or(defaults.connect_timeout),
            reconnect,
            payload_format: get(keys::PAYLOAD_FORMAT)
                .map(|raw| raw.parse::<PayloadFormat>().map_err(Error::config))
                .transpose()?
                .unwrap_or_default(),
        })
    }
}

/// `<id>-<postfix>`; an empty id becomes a random UUID
fn with_postfix(id: &str, postfix: &str) -> String {
    let id = id.trim();
    if id.is_empty() {
        return uuid::Uuid::new_v4().to_string();
    }
    if postfix.is_empty() {
        return id.to_string();
    }
    format!("{}-{}", id, postfix)
}

fn split_servers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_millis(value: &str) -> Option<Duration> {
    value.parse::<u64>().ok().map(Duration::from_millis)
}

fn parse_opt<T>(
    key: &str,
    value: Option<String>,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>> {
    match value {
        None => Ok(None),
        Some(raw) => parse(&raw)
            .map(Some)
            .ok_or_else(|| Error::config(format!("invalid value '{}' for {}", raw, key))),
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Fluent builder for [`KafkaSettings`]; group and client id get the
/// `-CLIENT` postfix on `build()` unless [`KafkaSettingsBuilder::postfix`]
/// changes it.
#[derive(Debug, Clone)]
pub struct KafkaSettingsBuilder {
    settings: KafkaSettings,
    group_id: String,
    client_id: Option<String>,
    postfix: String,
}

impl Default for KafkaSettingsBuilder {
    fn default() -> Self {
        Self {
            settings: KafkaSettings::default(),
            group_id: DEFAULT_GROUP_ID.to_string(),
            client_id: None,
            postfix: DEFAULT_POSTFIX.to_string(),
        }
    }
}

impl KafkaSettingsBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.settings.enabled = enabled;
        self
    }

    pub fn bootstrap_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings.bootstrap_servers = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Postfix for group and client id; empty disables it
    pub fn postfix(mut self, postfix: impl Into<String>) -> Self {
        self.postfix = postfix.into();
        self
    }

    pub fn security_protocol(mut self, protocol: SecurityProtocol) -> Self {
        self.settings.security_protocol = Some(protocol);
        self
    }

    pub fn sasl_plain(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.settings.sasl = Some(SaslSettings {
            mechanism: SaslMechanism::Plain,
            username: username.into(),
            password: SensitiveString::new(password),
        });
        self
    }

    pub fn sasl(mut self, sasl: SaslSettings) -> Self {
        self.settings.sasl = Some(sasl);
        self
    }

    pub fn auto_commit(mut self, enabled: bool) -> Self {
        self.settings.auto_commit.enabled = enabled;
        self
    }

    pub fn auto_commit_interval(mut self, interval: Duration) -> Self {
        self.settings.auto_commit.interval = Some(interval);
        self
    }

    pub fn auto_commit_threshold(mut self, threshold: u32) -> Self {
        self.settings.auto_commit.threshold = Some(threshold.max(1));
        self
    }

    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.settings.auto_connect = auto_connect;
        self
    }

    pub fn startup_delay(mut self, delay: Duration) -> Self {
        self.settings.startup_delay = delay;
        self
    }

    pub fn poll_max_wait(mut self, wait: Duration) -> Self {
        self.settings.poll_max_wait = wait;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.settings.connect_timeout = timeout;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.settings.reconnect = policy;
        self
    }

    pub fn payload_format(mut self, format: PayloadFormat) -> Self {
        self.settings.payload_format = format;
        self
    }

    pub fn build(self) -> KafkaSettings {
        let client_base = self.client_id.unwrap_or_else(|| self.group_id.clone());
        KafkaSettings {
            group_id: with_postfix(&self.group_id, &self.postfix),
            client_id: with_postfix(&client_base, &self.postfix),
            ..self.settings
        }
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }
}

mod duration_ms_required {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }
}

//! Shared value types

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

/// A credential that never shows up in logs or config dumps.
///
/// `Debug` prints `[REDACTED]` and serialization writes `"***REDACTED***"`,
/// so `conflux config` and `{:?}` of the settings stay safe to share.
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// The actual value, for building SASL credentials
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

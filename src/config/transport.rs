//! Transport configuration types.
//!
//! Lists the stream listeners that accept downstream peers and the optional
//! upstream connection.

use serde::{Deserialize, Serialize};

/// Upstream connection (`transports.upstream`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Remote listener address (`addr`), e.g. "10.0.0.1:4100".
    pub addr: String,

    /// Sub-domain under which this router's name server registers
    /// (`domain`). Empty makes it a stub resolver.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
}

/// Transports configuration (`transports.*`).
///
/// ```yaml
/// transports:
///   listen:
///     - "0.0.0.0:4100"
///   upstream:
///     addr: "10.0.0.1:4100"
///     domain: "left"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportsConfig {
    /// Addresses accepting downstream peers (`listen`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listen: Vec<String>,

    /// Upstream peer (`upstream`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamConfig>,
}

impl TransportsConfig {
    /// Check if no transports are configured.
    pub fn is_empty(&self) -> bool {
        self.listen.is_empty() && self.upstream.is_none()
    }

    /// Merge another transports config into this one.
    ///
    /// A non-empty listener list replaces the current one; an upstream
    /// entry overrides any previous one.
    pub fn merge(&mut self, other: TransportsConfig) {
        if !other.listen.is_empty() {
            self.listen = other.listen;
        }
        if other.upstream.is_some() {
            self.upstream = other.upstream;
        }
    }
}

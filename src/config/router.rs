//! Router configuration types.

use serde::{Deserialize, Serialize};

/// Default bits of host space delegated to each downstream port.
const DEFAULT_SUBNET_PREFIX_LEN: u8 = 8;

/// Default limit on redirects followed by a single name lookup.
const DEFAULT_MAX_REDIRECTS: u32 = 8;

/// Default timeout for requests forwarded to an upstream name server.
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

/// Name server settings (`router.name_server.*`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NameServerConfig {
    /// Redirects followed before a lookup gives up (`max_redirects`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_redirects: Option<u32>,

    /// Upstream request timeout in milliseconds (`request_timeout_ms`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
}

impl NameServerConfig {
    /// Get the redirect limit, using default if not configured.
    pub fn max_redirects(&self) -> u32 {
        self.max_redirects.unwrap_or(DEFAULT_MAX_REDIRECTS)
    }

    /// Get the upstream request timeout, using default if not configured.
    pub fn request_timeout_ms(&self) -> u64 {
        self.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS)
    }

    fn merge(&mut self, other: NameServerConfig) {
        if other.max_redirects.is_some() {
            self.max_redirects = other.max_redirects;
        }
        if other.request_timeout_ms.is_some() {
            self.request_timeout_ms = other.request_timeout_ms;
        }
    }
}

/// Router settings (`router.*`).
///
/// ```yaml
/// router:
///   subnet_prefix_len: 8
///   name_server:
///     max_redirects: 8
///     request_timeout_ms: 5000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    /// Host bits delegated per downstream port (`subnet_prefix_len`).
    /// Zero disables downstream ports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_prefix_len: Option<u8>,

    /// Name server settings (`name_server`).
    #[serde(default)]
    pub name_server: NameServerConfig,
}

impl RouterConfig {
    /// Get the subnet prefix length, using default if not configured.
    pub fn subnet_prefix_len(&self) -> u8 {
        self.subnet_prefix_len.unwrap_or(DEFAULT_SUBNET_PREFIX_LEN)
    }

    pub(super) fn merge(&mut self, other: RouterConfig) {
        if other.subnet_prefix_len.is_some() {
            self.subnet_prefix_len = other.subnet_prefix_len;
        }
        self.name_server.merge(other.name_server);
    }
}

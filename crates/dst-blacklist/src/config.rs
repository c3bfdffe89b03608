//! Configuration for the destination blacklist

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BlacklistError, Result};
use crate::table::DEFAULT_BUCKET_COUNT;
use crate::ticks::{Ticks, s_to_ticks};
use crate::types::{BlacklistFlags, Protocol};

/// Main blacklist configuration
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// max_mem_kb = 512
/// default_ttl_secs = 120
/// udp_ignore_mask = 0x04
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    /// Build the table at all; a disabled blacklist cannot be enabled later
    pub enabled: bool,
    /// Memory budget for entries, in KiB
    pub max_mem_kb: usize,
    /// TTL applied by `blacklist` when the caller does not pass one
    pub default_ttl_secs: u64,
    /// Period of the background sweep; 0 disables it
    pub sweep_interval_secs: u64,
    /// Number of hash buckets, a power of two
    pub bucket_count: usize,
    /// Size of the shared arena created by `DstBlacklist::init`, in KiB
    pub arena_kb: usize,
    /// Reasons ignored for UDP (and wildcard) destinations
    pub udp_ignore_mask: u8,
    /// Reasons ignored for TCP destinations
    pub tcp_ignore_mask: u8,
    /// Reasons ignored for TLS destinations
    pub tls_ignore_mask: u8,
    /// Reasons ignored for SCTP destinations
    pub sctp_ignore_mask: u8,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_mem_kb: 250,
            default_ttl_secs: 60,
            sweep_interval_secs: 60,
            bucket_count: DEFAULT_BUCKET_COUNT,
            arena_kb: 64 * 1024,
            udp_ignore_mask: 0,
            tcp_ignore_mask: 0,
            tls_ignore_mask: 0,
            sctp_ignore_mask: 0,
        }
    }
}

impl BlacklistConfig {
    /// Parse a TOML document
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: BlacklistConfig = toml::from_str(input)
            .map_err(|e| BlacklistError::Config(format!("Invalid blacklist config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| {
            BlacklistError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 || !self.bucket_count.is_power_of_two() {
            return Err(BlacklistError::Config(format!(
                "bucket_count must be a non-zero power of two, got {}",
                self.bucket_count
            )));
        }
        if self.max_mem_kb == 0 {
            return Err(BlacklistError::Config("max_mem_kb must be positive".to_string()));
        }
        Ok(())
    }

    /// Memory budget in bytes
    pub fn max_bytes(&self) -> usize {
        self.max_mem_kb << 10
    }

    pub fn arena_bytes(&self) -> usize {
        self.arena_kb << 10
    }

    pub fn default_ttl(&self) -> Ticks {
        s_to_ticks(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    /// Same configuration without the background sweep
    pub fn without_sweep(mut self) -> Self {
        self.sweep_interval_secs = 0;
        self
    }

    pub fn ignore_masks(&self) -> IgnoreMasks {
        IgnoreMasks {
            udp: BlacklistFlags::from_bits(self.udp_ignore_mask),
            tcp: BlacklistFlags::from_bits(self.tcp_ignore_mask),
            tls: BlacklistFlags::from_bits(self.tls_ignore_mask),
            sctp: BlacklistFlags::from_bits(self.sctp_ignore_mask),
        }
    }
}

/// Per-protocol reasons that do not lead to blacklisting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IgnoreMasks {
    pub udp: BlacklistFlags,
    pub tcp: BlacklistFlags,
    pub tls: BlacklistFlags,
    pub sctp: BlacklistFlags,
}

impl IgnoreMasks {
    /// Ignored reasons for `protocol`; the wildcard follows UDP
    pub fn for_protocol(&self, protocol: Protocol) -> BlacklistFlags {
        match protocol {
            Protocol::Any | Protocol::Udp => self.udp,
            Protocol::Tcp => self.tcp,
            Protocol::Tls => self.tls,
            Protocol::Sctp => self.sctp,
            Protocol::Ws | Protocol::Wss => BlacklistFlags::NONE,
        }
    }

    /// Whether `flags` still has a reason left once the mask is applied
    pub fn should_blacklist(&self, protocol: Protocol, flags: BlacklistFlags) -> bool {
        !(flags & !self.for_protocol(protocol)).reasons().is_empty()
    }
}

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::error::{ErrorKind, JoinError};

/// IEEE 802.11 limit on SSID length, in bytes
pub const MAX_SSID_BYTES: usize = 32;

/// How the SSID of a request is matched against nearby networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetMode {
    Exact,
    Prefix,
}

impl fmt::Display for TargetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Prefix => write!(f, "prefix"),
        }
    }
}

/// Security settings of a join request
#[derive(Clone, PartialEq, Eq)]
pub enum Security {
    Open,
    Psk {
        passphrase: String,
        /// Treat the passphrase as a WEP key instead of WPA
        legacy_wep: bool,
    },
}

// Keeps passphrases out of logs.
impl fmt::Debug for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Psk { legacy_wep, .. } => f
                .debug_struct("Psk")
                .field("passphrase", &"<redacted>")
                .field("legacy_wep", legacy_wep)
                .finish(),
        }
    }
}

/// A connection request as received from a caller, not yet validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub mode: TargetMode,
    pub ssid: String,
    pub security: Security,
    /// When false the network is joined once and not saved
    pub persist: bool,
}

impl ConnectionRequest {
    pub fn open(ssid: impl Into<String>, persist: bool) -> Self {
        Self {
            mode: TargetMode::Exact,
            ssid: ssid.into(),
            security: Security::Open,
            persist,
        }
    }

    pub fn open_prefix(ssid: impl Into<String>, persist: bool) -> Self {
        Self {
            mode: TargetMode::Prefix,
            ..Self::open(ssid, persist)
        }
    }

    pub fn secured(
        ssid: impl Into<String>,
        passphrase: impl Into<String>,
        legacy_wep: bool,
        persist: bool,
    ) -> Self {
        Self {
            mode: TargetMode::Exact,
            ssid: ssid.into(),
            security: Security::Psk {
                passphrase: passphrase.into(),
                legacy_wep,
            },
            persist,
        }
    }

    pub fn secured_prefix(
        ssid: impl Into<String>,
        passphrase: impl Into<String>,
        legacy_wep: bool,
        persist: bool,
    ) -> Self {
        Self {
            mode: TargetMode::Prefix,
            ..Self::secured(ssid, passphrase, legacy_wep, persist)
        }
    }

    /// The single-flight slot this request occupies
    pub fn target_key(&self) -> TargetKey {
        TargetKey {
            mode: self.mode,
            ssid: self.ssid.clone(),
        }
    }

    /// Check the request against a backend's capabilities.
    ///
    /// Pure: never touches the backend.
    pub fn validate(self, caps: &Capabilities) -> Result<NormalizedRequest, ValidationError> {
        if self.ssid.is_empty() {
            return Err(ValidationError::EmptySsid);
        }
        if self.ssid.len() > caps.max_ssid_length {
            return Err(ValidationError::SsidTooLong {
                len: self.ssid.len(),
                max: caps.max_ssid_length,
            });
        }
        if let Security::Psk { passphrase, .. } = &self.security {
            if passphrase.is_empty() {
                return Err(ValidationError::EmptyPassphrase);
            }
        }
        // Capability checks only after the arguments themselves are sound.
        if self.mode == TargetMode::Prefix && !caps.supports_prefix_match {
            return Err(ValidationError::PrefixUnsupported);
        }

        Ok(NormalizedRequest {
            key: self.target_key(),
            security: self.security,
            persist: self.persist,
        })
    }
}

/// Identifies a single-flight slot: two requests with the same key never run
/// concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub mode: TargetMode,
    pub ssid: String,
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.mode, self.ssid)
    }
}

/// A request that passed validation against a specific backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRequest {
    key: TargetKey,
    security: Security,
    persist: bool,
}

impl NormalizedRequest {
    pub fn key(&self) -> &TargetKey {
        &self.key
    }

    pub fn ssid(&self) -> &str {
        &self.key.ssid
    }

    pub fn mode(&self) -> TargetMode {
        self.key.mode
    }

    pub fn security(&self) -> &Security {
        &self.security
    }

    pub fn persist(&self) -> bool {
        self.persist
    }

    pub fn join_once(&self) -> bool {
        !self.persist
    }
}

/// Capability flags a backend declares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_prefix_match: bool,
    pub max_ssid_length: usize,
    /// Backend-preferred join deadline, if it has one
    pub join_timeout: Option<Duration>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_prefix_match: false,
            max_ssid_length: MAX_SSID_BYTES,
            join_timeout: None,
        }
    }
}

/// Why a request was rejected before dispatch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("SSID must not be empty")]
    EmptySsid,

    #[error("SSID is {len} bytes, backend allows at most {max}")]
    SsidTooLong { len: usize, max: usize },

    #[error("secured networks need a non-empty password")]
    EmptyPassphrase,

    #[error("prefix matching is not supported by this backend")]
    PrefixUnsupported,
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PrefixUnsupported => ErrorKind::Unsupported,
            _ => ErrorKind::InvalidArguments,
        }
    }
}

impl From<ValidationError> for JoinError {
    fn from(err: ValidationError) -> Self {
        JoinError::new(err.kind(), err.to_string())
    }
}

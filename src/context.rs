//! Per-request evaluation context
//!
//! A `RequestContext` carries the facts conditions are evaluated against:
//! timestamp, source IP, derived country, user-agent classification and a
//! precomputed risk score, plus free-form extension fields. Contexts are
//! built fresh per call and never persisted by the engine.

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

/// User-agent classification supplied by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Browser,
    Mobile,
    Cli,
    Service,
    Unknown,
}

impl DeviceKind {
    fn tag(&self) -> u8 {
        match self {
            DeviceKind::Browser => 0,
            DeviceKind::Mobile => 1,
            DeviceKind::Cli => 2,
            DeviceKind::Service => 3,
            DeviceKind::Unknown => 4,
        }
    }
}

/// Facts about the request being evaluated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// When the request was made
    pub timestamp: DateTime<Utc>,
    /// Raw source IP as received; parsed lazily at condition evaluation
    pub source_ip: Option<String>,
    /// ISO 3166-1 alpha-2 country code derived from the IP (geo lookup is
    /// an external collaborator)
    pub country: Option<String>,
    /// User-agent classification
    pub device: DeviceKind,
    /// Risk score precomputed by the caller, typically in [0.0, 1.0]
    pub risk_score: Option<f64>,
    /// Extension fields; participate in the fingerprint
    #[serde(default)]
    pub extensions: AHashMap<String, String>,
}

impl RequestContext {
    /// Context at a given timestamp with no other facts
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        RequestContext {
            timestamp,
            source_ip: None,
            country: None,
            device: DeviceKind::Unknown,
            risk_score: None,
            extensions: AHashMap::new(),
        }
    }

    /// Context for "now"
    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    pub fn with_source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_device(mut self, device: DeviceKind) -> Self {
        self.device = device;
        self
    }

    pub fn with_risk_score(mut self, score: f64) -> Self {
        self.risk_score = Some(score);
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    /// Stable fingerprint of the fields that affect evaluation
    ///
    /// The timestamp is truncated to the second so that a burst of identical
    /// checks within one second shares a cache key; the decision cache TTL
    /// bounds staleness beyond that.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Xxh3::new();
        hasher.update(&self.timestamp.timestamp().to_le_bytes());
        if let Some(ip) = &self.source_ip {
            hasher.update(b"ip");
            hasher.update(ip.as_bytes());
        }
        if let Some(country) = &self.country {
            hasher.update(b"geo");
            hasher.update(country.as_bytes());
        }
        hasher.update(&[self.device.tag()]);
        if let Some(score) = self.risk_score {
            hasher.update(b"risk");
            hasher.update(&score.to_bits().to_le_bytes());
        }
        // Extension fields hashed in sorted order for stability
        let mut keys: Vec<&String> = self.extensions.keys().collect();
        keys.sort();
        for key in keys {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(self.extensions[key].as_bytes());
        }
        hasher.digest()
    }
}

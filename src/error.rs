use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamError {
    #[error("Invalid pattern: {0} (wildcard only allowed as trailing segment)")]
    InvalidPattern(String),

    #[error("Policy validation failed: {0}")]
    PolicyValidation(String),

    #[error("Malformed condition in policy {policy_id} statement {index}: {detail}")]
    MalformedCondition {
        policy_id: String,
        index: usize,
        detail: String,
    },

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, SamError>;

//! Error types for vitalgate

use crate::types::{DeviceState, MetricType, ProviderKind};
use thiserror::Error;

/// Errors that can occur during ingestion, sync, or trend computation
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse provider payload: {0}")]
    Parse(String),

    #[error("Credential vault not initialized")]
    VaultUninitialized,

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed")]
    Decrypt,

    #[error("Unknown provider tag: {0}")]
    UnknownProvider(String),

    #[error("Provider {provider} does not support {operation}")]
    UnsupportedCapability {
        provider: ProviderKind,
        operation: &'static str,
    },

    #[error("Provider {provider} does not report {metric}")]
    UnsupportedMetric {
        provider: ProviderKind,
        metric: MetricType,
    },

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Invalid device state transition: {from} -> {to}")]
    InvalidTransition { from: DeviceState, to: DeviceState },

    #[error("Device {device_id} is {state}, expected an authorized state")]
    NotAuthorized {
        device_id: String,
        state: DeviceState,
    },

    #[error("No credential stored for device {0}")]
    MissingCredential(String),

    #[error("OAuth state parameter invalid or expired")]
    InvalidOauthState,

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("Provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned error status {status}: {message}")]
    ProviderApi { status: u16, message: String },

    #[error("Fetch for {0} timed out")]
    FetchTimeout(MetricType),

    #[error("Not enough samples for a baseline: have {have}, need {need}")]
    InsufficientSamples { have: usize, need: usize },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),
}

//! Provider adapter registry.
//!
//! Every provider tag maps to exactly one adapter, tagged by capability:
//! pull adapters speak the provider's OAuth API, push adapters verify and
//! parse signed webhooks. Callers dispatch on the declared capability, never
//! on the provider tag directly; requesting a pull adapter for a push
//! provider fails loudly so "not supported" is never mistaken for "no data".

pub mod fitbit;
pub mod garmin;
pub mod google_fit;
pub mod health_connect;
pub mod healthkit;
pub mod withings;

use crate::config::ProvidersConfig;
use crate::error::IngestError;
use crate::types::{Capability, MetricType, ProviderKind, RawHealthSample, TokenSet};
use crate::vault;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::borrow::Cow;
use std::collections::HashMap;

pub use fitbit::FitbitAdapter;
pub use garmin::GarminAdapter;
pub use google_fit::GoogleFitAdapter;
pub use health_connect::HealthConnectAdapter;
pub use healthkit::HealthKitAdapter;
pub use withings::WithingsAdapter;

/// What a provider HMACs: the raw body verbatim, or the body with a trailing
/// ampersand. Preserved per provider bit-for-bit to match the real external
/// signing convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureInput {
    RawBody,
    BodyWithAmpersand,
}

/// Webhook signature scheme a push provider declares.
#[derive(Debug, Clone, Copy)]
pub struct WebhookScheme {
    /// Header carrying the hex-encoded HMAC-SHA256 signature.
    pub header: &'static str,
    pub input: SignatureInput,
}

impl WebhookScheme {
    fn signature_base<'a>(&self, raw_body: &'a [u8]) -> Cow<'a, [u8]> {
        match self.input {
            SignatureInput::RawBody => Cow::Borrowed(raw_body),
            SignatureInput::BodyWithAmpersand => {
                let mut buf = Vec::with_capacity(raw_body.len() + 1);
                buf.extend_from_slice(raw_body);
                buf.push(b'&');
                Cow::Owned(buf)
            }
        }
    }

    /// Constant-time verification of a hex HMAC-SHA256 signature.
    pub fn verify(&self, signature: &str, raw_body: &[u8], secret: &str) -> bool {
        let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(&self.signature_base(raw_body));
        let expected = hex::encode(mac.finalize().into_bytes());
        vault::secure_compare(&expected, signature.trim())
    }
}

/// Parsed webhook payload: the device's natural key plus raw sample batches.
#[derive(Debug, Clone)]
pub struct PushPayload {
    pub serial_number: String,
    pub samples: Vec<RawHealthSample>,
}

/// Pull/OAuth provider contract.
#[async_trait]
pub trait PullProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Metrics this provider's API can report.
    fn supported_metrics(&self) -> &'static [MetricType];

    /// Authorization URL carrying the caller-supplied opaque state.
    fn authorization_url(&self, state: &str) -> String;

    async fn exchange_code(&self, code: &str) -> Result<TokenSet, IngestError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, IngestError>;

    async fn revoke(&self, access_token: &str) -> Result<bool, IngestError>;

    /// Fetch raw samples for one metric type over a time range. `tz` is the
    /// device's timezone, for providers whose API reports offset-less local
    /// timestamps.
    async fn fetch(
        &self,
        access_token: &str,
        metric: MetricType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tz: Tz,
    ) -> Result<Vec<RawHealthSample>, IngestError>;
}

/// Push provider contract.
pub trait PushProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// The signature scheme inbound webhooks are verified against.
    fn scheme(&self) -> WebhookScheme;

    /// Parse a raw webhook body into device identity plus raw samples.
    fn parse_payload(&self, raw: &[u8]) -> Result<PushPayload, IngestError>;

    /// Verify a webhook signature against this provider's scheme.
    fn validate_webhook(&self, signature: &str, raw_body: &[u8], secret: &str) -> bool {
        self.scheme().verify(signature, raw_body, secret)
    }
}

/// Capability-tagged adapter.
pub enum ProviderAdapter {
    Pull(Box<dyn PullProvider>),
    Push(Box<dyn PushProvider>),
}

impl ProviderAdapter {
    pub fn capability(&self) -> Capability {
        match self {
            ProviderAdapter::Pull(_) => Capability::Pull,
            ProviderAdapter::Push(_) => Capability::Push,
        }
    }
}

/// Registry mapping every provider tag to its concrete adapter.
pub struct AdapterRegistry {
    adapters: HashMap<ProviderKind, ProviderAdapter>,
}

impl AdapterRegistry {
    pub fn from_config(config: &ProvidersConfig) -> Self {
        let mut adapters = HashMap::new();
        adapters.insert(
            ProviderKind::AppleWatch,
            ProviderAdapter::Push(Box::new(HealthKitAdapter)),
        );
        adapters.insert(
            ProviderKind::WearOs,
            ProviderAdapter::Push(Box::new(HealthConnectAdapter::new(ProviderKind::WearOs))),
        );
        adapters.insert(
            ProviderKind::HealthConnect,
            ProviderAdapter::Push(Box::new(HealthConnectAdapter::new(
                ProviderKind::HealthConnect,
            ))),
        );
        adapters.insert(
            ProviderKind::Samsung,
            ProviderAdapter::Push(Box::new(HealthConnectAdapter::new(ProviderKind::Samsung))),
        );
        adapters.insert(
            ProviderKind::Fitbit,
            ProviderAdapter::Pull(Box::new(FitbitAdapter::new(config.fitbit.clone()))),
        );
        adapters.insert(
            ProviderKind::Garmin,
            ProviderAdapter::Pull(Box::new(GarminAdapter::new(config.garmin.clone()))),
        );
        adapters.insert(
            ProviderKind::GoogleFit,
            ProviderAdapter::Pull(Box::new(GoogleFitAdapter::new(config.google_fit.clone()))),
        );
        adapters.insert(
            ProviderKind::Withings,
            ProviderAdapter::Pull(Box::new(WithingsAdapter::new(config.withings.clone()))),
        );
        Self { adapters }
    }

    pub fn get(&self, provider: ProviderKind) -> Option<&ProviderAdapter> {
        self.adapters.get(&provider)
    }

    /// The pull adapter for a provider; fails explicitly for push providers.
    pub fn pull(&self, provider: ProviderKind) -> Result<&dyn PullProvider, IngestError> {
        match self.adapters.get(&provider) {
            Some(ProviderAdapter::Pull(adapter)) => Ok(adapter.as_ref()),
            _ => Err(IngestError::UnsupportedCapability {
                provider,
                operation: "pull sync",
            }),
        }
    }

    /// The push adapter for a provider; fails explicitly for pull providers.
    pub fn push(&self, provider: ProviderKind) -> Result<&dyn PushProvider, IngestError> {
        match self.adapters.get(&provider) {
            Some(ProviderAdapter::Push(adapter)) => Ok(adapter.as_ref()),
            _ => Err(IngestError::UnsupportedCapability {
                provider,
                operation: "webhook ingestion",
            }),
        }
    }

    /// Provider tags with their declared capabilities.
    pub fn capabilities(&self) -> Vec<(ProviderKind, Capability)> {
        let mut caps: Vec<_> = self
            .adapters
            .iter()
            .map(|(kind, adapter)| (*kind, adapter.capability()))
            .collect();
        caps.sort_by_key(|(kind, _)| kind.as_str());
        caps
    }
}

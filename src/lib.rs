//! Vitalgate - health wearables ingestion platform.
//!
//! This library ingests biometric data from consumer wearables, normalizes
//! it into a canonical sample model, and computes per-patient baselines and
//! trends for clinical monitoring.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Vitalgate                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐   ┌────────────┐   ┌───────────┐             │
//! │  │  Webhook  │──▶│ Normalizer │──▶│  Sample   │             │
//! │  │  Gateway  │   │            │   │  Store    │             │
//! │  └───────────┘   └────────────┘   └───────────┘             │
//! │        │                │               │                   │
//! │  ┌───────────┐   ┌────────────┐   ┌───────────┐             │
//! │  │  Adapter  │   │ Credential │   │  Trend    │             │
//! │  │ Registry  │   │   Vault    │   │  Engine   │             │
//! │  └───────────┘   └────────────┘   └───────────┘             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Push providers (Apple Watch, Wear OS, Health Connect, Samsung) deliver
//! signed webhooks; pull providers (Fitbit, Garmin, Google Fit, Withings)
//! are synced through delegated OAuth. Both paths converge on the same
//! canonical samples, keyed so that repeated delivery is idempotent.

pub mod config;
pub mod error;
pub mod normalize;
pub mod providers;
pub mod server;
pub mod store;
pub mod sync;
pub mod trends;
pub mod types;
pub mod vault;

// Re-export key types at crate root for convenience
pub use config::{Config, OauthClientConfig, ProvidersConfig};
pub use error::IngestError;
pub use normalize::Normalizer;
pub use providers::{AdapterRegistry, ProviderAdapter, PullProvider, PushProvider};
pub use store::{DeviceStore, MemorySampleStore, SampleStore};
pub use sync::{ConnectOutcome, SyncEngine, SyncOutcome};
pub use trends::{Baseline, ThresholdConfig, TrendEngine, TrendResult, TrendStatus};
pub use types::{
    Bucket, CanonicalSample, Capability, Device, DeviceState, MetricType, ProviderKind,
    RawHealthSample, SampleKey, TokenSet,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

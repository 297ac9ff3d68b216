//! Sync engine: device connection lifecycle, OAuth flows, pull syncs, and
//! push ingestion.
//!
//! All credential material moves through the vault; plaintext tokens exist
//! only on the stack while a provider call is in flight. A per-device lock
//! serializes syncs, which also makes token refresh single-flight: the second
//! caller re-reads the credential after acquiring the lock and finds a fresh
//! token already stored.

use crate::config::Config;
use crate::error::IngestError;
use crate::normalize::Normalizer;
use crate::providers::{AdapterRegistry, PullProvider};
use crate::store::{DeviceLocks, DeviceStore, SampleStore};
use crate::trends::TrendEngine;
use crate::types::{
    Device, DeviceState, MetricType, ProviderKind, RawHealthSample, TokenSet,
};
use crate::vault;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;

/// OAuth state parameters expire after this many minutes.
const OAUTH_STATE_TTL_MINUTES: i64 = 10;

/// Default lookback for a device that has never synced.
const FIRST_SYNC_LOOKBACK_DAYS: i64 = 7;

/// Result of starting a connection.
#[derive(Debug)]
pub enum ConnectOutcome {
    /// Push device registered and authorized; the plaintext webhook token is
    /// returned exactly once.
    PushRegistered { device: Device, push_token: String },
    /// Pull device pending authorization at the returned URL.
    PullPending {
        device: Device,
        authorization_url: String,
    },
}

/// Per-metric results of one pull sync. Metrics fail independently.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub stored: HashMap<MetricType, usize>,
    pub errors: Vec<(MetricType, String)>,
}

impl SyncOutcome {
    pub fn total_stored(&self) -> usize {
        self.stored.values().sum()
    }
}

struct PendingAuth {
    device_id: String,
    created_at: DateTime<Utc>,
}

pub struct SyncEngine {
    registry: AdapterRegistry,
    devices: Arc<DeviceStore>,
    samples: Arc<dyn SampleStore>,
    trends: Arc<TrendEngine>,
    locks: DeviceLocks,
    pending_auth: tokio::sync::Mutex<HashMap<String, PendingAuth>>,
    fetch_timeout: std::time::Duration,
}

impl SyncEngine {
    pub fn new(
        config: &Config,
        devices: Arc<DeviceStore>,
        samples: Arc<dyn SampleStore>,
        trends: Arc<TrendEngine>,
    ) -> Self {
        Self {
            registry: AdapterRegistry::from_config(&config.providers),
            devices,
            samples,
            trends,
            locks: DeviceLocks::new(),
            pending_auth: tokio::sync::Mutex::new(HashMap::new()),
            fetch_timeout: std::time::Duration::from_secs(config.fetch_timeout_secs),
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Register a device and start its authorization flow.
    pub async fn begin_connect(
        &self,
        patient_id: &str,
        provider: ProviderKind,
        serial_number: Option<String>,
        timezone: Option<String>,
    ) -> Result<ConnectOutcome, IngestError> {
        // Fail before creating the device if the timezone is bogus.
        let timezone = timezone.unwrap_or_else(|| "UTC".to_string());
        if timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(IngestError::InvalidTimezone(timezone));
        }

        let mut device = Device::new(patient_id, provider);
        device.serial_number = serial_number;
        device.timezone = timezone;

        match self.registry.get(provider) {
            Some(crate::providers::ProviderAdapter::Push(_)) => {
                let push_token = generate_token();
                device.credential = Some(vault::encrypt(&push_token)?);
                device.transition(DeviceState::Authorized)?;
                let stored = device.clone();
                self.devices.insert(device);
                tracing::info!(device_id = %stored.id, provider = %provider, "push device registered");
                Ok(ConnectOutcome::PushRegistered {
                    device: stored,
                    push_token,
                })
            }
            Some(crate::providers::ProviderAdapter::Pull(adapter)) => {
                device.transition(DeviceState::PendingAuth)?;
                let state = generate_token();
                let authorization_url = adapter.authorization_url(&state);
                let stored = device.clone();
                self.devices.insert(device);

                let mut pending = self.pending_auth.lock().await;
                // Abandoned flows would otherwise accumulate forever.
                let now = Utc::now();
                pending.retain(|_, p| {
                    now - p.created_at <= Duration::minutes(OAUTH_STATE_TTL_MINUTES)
                });
                pending.insert(
                    state,
                    PendingAuth {
                        device_id: stored.id.clone(),
                        created_at: now,
                    },
                );
                tracing::info!(device_id = %stored.id, provider = %provider, "pull device pending authorization");
                Ok(ConnectOutcome::PullPending {
                    device: stored,
                    authorization_url,
                })
            }
            None => Err(IngestError::UnknownProvider(provider.to_string())),
        }
    }

    /// Finish the OAuth flow for a pending pull device. The state parameter
    /// is single-use and expires.
    pub async fn complete_oauth(&self, state: &str, code: &str) -> Result<Device, IngestError> {
        let pending = {
            let mut pending = self.pending_auth.lock().await;
            pending.remove(state).ok_or(IngestError::InvalidOauthState)?
        };
        if Utc::now() - pending.created_at > Duration::minutes(OAUTH_STATE_TTL_MINUTES) {
            return Err(IngestError::InvalidOauthState);
        }

        let device = self
            .devices
            .get(&pending.device_id)
            .ok_or_else(|| IngestError::UnknownDevice(pending.device_id.clone()))?;
        let adapter = self.registry.pull(device.provider)?;

        let tokens = adapter.exchange_code(code).await?;
        let credential = vault::encrypt(&serde_json::to_string(&tokens)?)?;

        self.devices
            .update(&pending.device_id, |d| {
                d.credential = Some(credential);
                d.transition(DeviceState::Authorized)
            })
            .ok_or_else(|| IngestError::UnknownDevice(pending.device_id.clone()))??;

        tracing::info!(device_id = %pending.device_id, "oauth authorization complete");
        self.devices
            .get(&pending.device_id)
            .ok_or(IngestError::UnknownDevice(pending.device_id))
    }

    /// Pull one device's enabled metrics from its provider. Metrics fail
    /// independently; a partial outcome still advances last_sync, but a sync
    /// where every fetch failed leaves it unchanged so the window is retried.
    pub async fn sync_device(
        &self,
        device_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<SyncOutcome, IngestError> {
        let lock = self.locks.lock_for(device_id).await;
        let _guard = lock.lock().await;

        let device = self
            .devices
            .get(device_id)
            .ok_or_else(|| IngestError::UnknownDevice(device_id.to_string()))?;
        let adapter = self.registry.pull(device.provider)?;

        if !matches!(device.state, DeviceState::Authorized | DeviceState::Expired) {
            return Err(IngestError::NotAuthorized {
                device_id: device_id.to_string(),
                state: device.state,
            });
        }

        let tokens = self.current_tokens(&device, adapter).await?;

        let now = Utc::now();
        let since = since
            .or(device.last_sync)
            .unwrap_or(now - Duration::days(FIRST_SYNC_LOOKBACK_DAYS));
        let normalizer = Normalizer::new(&device.patient_id, &device.id, &device.timezone)?;
        let tz: chrono_tz::Tz = device
            .timezone
            .parse()
            .map_err(|_| IngestError::InvalidTimezone(device.timezone.clone()))?;

        let mut outcome = SyncOutcome::default();
        for metric in &device.enabled_metrics {
            if !adapter.supported_metrics().contains(metric) {
                continue;
            }
            match tokio::time::timeout(
                self.fetch_timeout,
                adapter.fetch(&tokens.access_token, *metric, since, now, tz),
            )
            .await
            {
                Ok(Ok(raw)) => {
                    let count = self.store_raw(&normalizer, raw);
                    outcome.stored.insert(*metric, count);
                }
                Ok(Err(e)) => {
                    tracing::warn!(device_id, metric = %metric, error = %e, "metric fetch failed");
                    outcome.errors.push((*metric, e.to_string()));
                }
                Err(_) => {
                    let e = IngestError::FetchTimeout(*metric);
                    tracing::warn!(device_id, metric = %metric, "metric fetch timed out");
                    outcome.errors.push((*metric, e.to_string()));
                }
            }
        }

        // Advancing the watermark after a total failure would skip the
        // unfetched window on the next sync.
        if outcome.errors.is_empty() || !outcome.stored.is_empty() {
            self.devices.update(device_id, |d| d.last_sync = Some(now));
        }
        self.trends.invalidate(&device.patient_id);
        tracing::info!(
            device_id,
            stored = outcome.total_stored(),
            failed = outcome.errors.len(),
            "sync complete"
        );
        Ok(outcome)
    }

    /// Decrypt the stored token set, refreshing it first when expired.
    async fn current_tokens(
        &self,
        device: &Device,
        adapter: &dyn PullProvider,
    ) -> Result<TokenSet, IngestError> {
        let credential = device
            .credential
            .as_deref()
            .ok_or_else(|| IngestError::MissingCredential(device.id.clone()))?;
        let tokens: TokenSet = serde_json::from_str(&vault::decrypt(credential)?)?;

        if !tokens.is_expired(Utc::now()) {
            if device.state == DeviceState::Expired {
                // Refreshed by a concurrent sync while we waited on the lock.
                self.devices
                    .update(&device.id, |d| d.transition(DeviceState::Authorized))
                    .transpose()?;
            }
            return Ok(tokens);
        }

        let refresh_token = tokens
            .refresh_token
            .as_deref()
            .ok_or_else(|| IngestError::TokenRefresh("no refresh token stored".to_string()))?;

        match adapter.refresh(refresh_token).await {
            Ok(fresh) => {
                let credential = vault::encrypt(&serde_json::to_string(&fresh)?)?;
                self.devices
                    .update(&device.id, |d| {
                        d.credential = Some(credential);
                        if d.state == DeviceState::Expired {
                            d.transition(DeviceState::Authorized)
                        } else {
                            Ok(())
                        }
                    })
                    .transpose()?;
                tracing::debug!(device_id = %device.id, "access token refreshed");
                Ok(fresh)
            }
            Err(e) => {
                self.devices
                    .update(&device.id, |d| {
                        if d.state == DeviceState::Authorized {
                            d.transition(DeviceState::Expired)
                        } else {
                            Ok(())
                        }
                    })
                    .transpose()?;
                Err(IngestError::TokenRefresh(e.to_string()))
            }
        }
    }

    /// Normalize and store a raw batch for a connected push device. Returns
    /// the number of canonical samples written (inserts and overwrites).
    pub fn ingest_samples(&self, device: &Device, raw: Vec<RawHealthSample>) -> Result<usize, IngestError> {
        let normalizer = Normalizer::new(&device.patient_id, &device.id, &device.timezone)?;
        let count = self.store_raw(&normalizer, raw);
        self.devices
            .update(&device.id, |d| d.last_sync = Some(Utc::now()));
        self.trends.invalidate(&device.patient_id);
        Ok(count)
    }

    fn store_raw(&self, normalizer: &Normalizer, raw: Vec<RawHealthSample>) -> usize {
        let canonical = normalizer.normalize(raw);
        let count = canonical.len();
        for sample in canonical {
            self.samples.upsert(sample);
        }
        count
    }

    /// Disconnect a device: best-effort remote revocation, credentials
    /// cleared, historical samples retained.
    pub async fn disconnect(&self, device_id: &str) -> Result<Device, IngestError> {
        let lock = self.locks.lock_for(device_id).await;
        let _guard = lock.lock().await;

        let device = self
            .devices
            .get(device_id)
            .ok_or_else(|| IngestError::UnknownDevice(device_id.to_string()))?;

        if let (Ok(adapter), Some(credential)) =
            (self.registry.pull(device.provider), device.credential.as_deref())
        {
            if let Ok(json) = vault::decrypt(credential) {
                if let Ok(tokens) = serde_json::from_str::<TokenSet>(&json) {
                    if let Err(e) = adapter.revoke(&tokens.access_token).await {
                        tracing::warn!(device_id, error = %e, "remote revocation failed, disconnecting anyway");
                    }
                }
            }
        }

        self.devices
            .update(device_id, |d| d.disconnect())
            .ok_or_else(|| IngestError::UnknownDevice(device_id.to_string()))?;
        tracing::info!(device_id, "device disconnected");
        self.devices
            .get(device_id)
            .ok_or_else(|| IngestError::UnknownDevice(device_id.to_string()))
    }
}

/// 32 hex characters of OS randomness, used for push tokens and OAuth state.
fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

use crate::config::LeaderElection;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn holder(spec: &LeaseSpec) -> Option<&str> {
    spec.holder_identity.as_deref().filter(|h| !h.is_empty())
}

fn expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    let renewed = spec.renew_time.as_ref().or(spec.acquire_time.as_ref());
    match renewed {
        Some(MicroTime(renewed)) => {
            let duration = i64::from(spec.lease_duration_seconds.unwrap_or_default());
            *renewed + chrono::Duration::seconds(duration) <= now
        }
        None => true,
    }
}

/// Decides what the lease should look like after `identity` tried to take or keep it.
/// Returns `None` while someone else holds a live lease.
fn next_spec(
    current: Option<&LeaseSpec>,
    identity: &str,
    duration_seconds: i32,
    now: DateTime<Utc>,
) -> Option<LeaseSpec> {
    let taken = |transitions: i32| LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: Some(duration_seconds),
        acquire_time: Some(MicroTime(now)),
        renew_time: Some(MicroTime(now)),
        lease_transitions: Some(transitions),
        ..LeaseSpec::default()
    };
    match current {
        None => Some(taken(0)),
        Some(spec) if holder(spec) == Some(identity) => Some(LeaseSpec {
            lease_duration_seconds: Some(duration_seconds),
            renew_time: Some(MicroTime(now)),
            ..spec.clone()
        }),
        Some(spec) if holder(spec).is_none() || expired(spec, now) => {
            Some(taken(spec.lease_transitions.unwrap_or_default() + 1))
        }
        Some(_) => None,
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Errors retrying will not fix: missing RBAC permissions or a missing namespace.
fn is_setup_error(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<kube::Error>(),
        Some(kube::Error::Api(ae)) if matches!(ae.code, 401 | 403 | 404)
    )
}

/// Lease based leader election. Only the replica holding the Lease runs the controllers.
pub struct LeaderElector {
    api: Api<Lease>,
    name: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
}

impl LeaderElector {
    pub fn new(client: Client, config: &LeaderElection) -> Self {
        let namespace = config
            .namespace
            .clone()
            .unwrap_or_else(|| client.default_namespace().to_string());
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "imgscanner".to_string());
        Self {
            api: Api::namespaced(client, &namespace),
            name: config.lease_name.clone(),
            identity: format!("{}_{}", host, std::process::id()),
            lease_duration: Duration::from_secs(config.lease_duration_seconds),
            renew_interval: Duration::from_secs(config.renew_interval_seconds),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn lease(&self, spec: LeaseSpec, resource_version: Option<String>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                resource_version,
                ..ObjectMeta::default()
            },
            spec: Some(spec),
        }
    }

    /// One acquire or renew round trip. Returns whether this replica holds the lease afterwards.
    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let duration = i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX);
        let existing = self
            .api
            .get_opt(&self.name)
            .await
            .with_context(|| format!("Failed to get lease {}", self.name))?;

        let Some(existing) = existing else {
            let Some(spec) = next_spec(None, &self.identity, duration, now) else {
                return Ok(false);
            };
            return match self
                .api
                .create(&PostParams::default(), &self.lease(spec, None))
                .await
            {
                Ok(_) => Ok(true),
                Err(e) if is_conflict(&e) => Ok(false),
                Err(e) => Err(e).with_context(|| format!("Failed to create lease {}", self.name)),
            };
        };

        let current = existing.spec.clone().unwrap_or_default();
        let Some(spec) = next_spec(Some(&current), &self.identity, duration, now) else {
            debug!(
                "Lease {} is held by {}",
                self.name,
                holder(&current).unwrap_or_default()
            );
            return Ok(false);
        };
        let lease = self.lease(spec, existing.resource_version());
        match self
            .api
            .replace(&self.name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to update lease {}", self.name)),
        }
    }

    /// Blocks until the lease is acquired. Returns false if `shutdown` fired first, and an
    /// error if the Lease API cannot be used at all.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> Result<bool> {
        info!("Trying to acquire lease {} as {}", self.name, self.identity);
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!("Acquired lease {}", self.name);
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) if is_setup_error(&e) => {
                    return Err(e).context("Unable to set up leader election");
                }
                Err(e) => warn!("Error acquiring lease: {:#}", e),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(false),
                _ = tokio::time::sleep(self.renew_interval) => {}
            }
        }
    }

    /// Renews the lease until `leading` is cancelled. If the lease is lost or cannot be renewed
    /// for a whole lease duration, `leading` is cancelled and an error returned.
    pub async fn hold(&self, leading: CancellationToken) -> Result<()> {
        let mut last_renewal = Instant::now();
        loop {
            tokio::select! {
                _ = leading.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.renew_interval) => {}
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewal = Instant::now(),
                Ok(false) => {
                    leading.cancel();
                    anyhow::bail!("Lease {} was taken over by another replica", self.name);
                }
                Err(e) => {
                    warn!("Error renewing lease: {:#}", e);
                    if last_renewal.elapsed() >= self.lease_duration {
                        leading.cancel();
                        anyhow::bail!("Unable to renew lease {} in time", self.name);
                    }
                }
            }
        }
    }

    /// Gives up the lease so another replica can take over without waiting for it to expire.
    pub async fn release(&self) -> Result<()> {
        let Some(existing) = self.api.get_opt(&self.name).await? else {
            return Ok(());
        };
        let current = existing.spec.clone().unwrap_or_default();
        if holder(&current) != Some(self.identity.as_str()) {
            return Ok(());
        }
        let patch = json!({
            "metadata": { "resourceVersion": existing.resource_version() },
            "spec": { "holderIdentity": null },
        });
        self.api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("Failed to release lease {}", self.name))?;
        info!("Released lease {}", self.name);
        Ok(())
    }
}

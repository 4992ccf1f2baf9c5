//! Lease-based leader election.
//!
//! Only one replica runs the controllers and responders; the others idle
//! until the coordination Lease expires. Lease duration 60s, renew
//! deadline 15s, retry period 5s, released on shutdown.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{ObjectMeta, Patch, PatchParams, PostParams};
use kube::Api;
use tracing::{info, warn};

pub const LEASE_NAME: &str = "dcloud-dhcp-controller";

const LEASE_DURATION: Duration = Duration::from_secs(60);
const RENEW_DEADLINE: Duration = Duration::from_secs(15);
const RETRY_PERIOD: Duration = Duration::from_secs(5);

pub struct LeaderElection {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
}

impl LeaderElection {
    pub fn new(api: Api<Lease>, lease_name: &str, identity: String) -> Self {
        Self {
            api,
            lease_name: lease_name.to_string(),
            identity,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn lease_spec(&self, acquire: bool, transitions: Option<i32>) -> LeaseSpec {
        let now = MicroTime(Utc::now());
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
            acquire_time: acquire.then(|| now.clone()),
            renew_time: Some(now),
            lease_transitions: transitions,
            ..Default::default()
        }
    }

    /// One election round: create, renew or take over the lease.
    /// `Ok(true)` means this process currently holds it.
    async fn try_acquire_or_renew(&self) -> Result<bool, kube::Error> {
        let Some(lease) = self.api.get_opt(&self.lease_name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.lease_name.clone()),
                    ..Default::default()
                },
                spec: Some(self.lease_spec(true, Some(0))),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                // another replica won the create race
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(e),
            };
        };

        let spec = lease.spec.unwrap_or_default();
        let holder = spec.holder_identity.clone().unwrap_or_default();

        if holder == self.identity {
            let patch = serde_json::json!({ "spec": self.lease_spec(false, spec.lease_transitions) });
            self.api
                .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            return Ok(true);
        }

        let duration = spec
            .lease_duration_seconds
            .map(|s| chrono::Duration::seconds(s.into()))
            .unwrap_or_else(|| chrono::Duration::seconds(LEASE_DURATION.as_secs() as i64));
        let expired = match spec.renew_time.as_ref() {
            Some(renew) => renew.0 + duration < Utc::now(),
            None => true,
        };
        if holder.is_empty() || expired {
            let transitions = spec.lease_transitions.unwrap_or(0) + 1;
            let patch = serde_json::json!({ "spec": self.lease_spec(true, Some(transitions)) });
            return match self
                .api
                .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(e),
            };
        }

        Ok(false)
    }

    /// Block until this process becomes the leader, or the shutdown signal
    /// fires (returns false).
    pub async fn acquire(&self, shutdown: &mut tokio::sync::watch::Receiver<bool>) -> bool {
        let mut observed_leader = String::new();
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!("(leader.acquire) became leader: {}", self.identity);
                    return true;
                }
                Ok(false) => {
                    if let Ok(Some(lease)) = self.api.get_opt(&self.lease_name).await {
                        let holder = lease
                            .spec
                            .and_then(|s| s.holder_identity)
                            .unwrap_or_default();
                        if !holder.is_empty() && holder != observed_leader {
                            info!("(leader.acquire) new leader elected: {}", holder);
                            observed_leader = holder;
                        }
                    }
                }
                Err(e) => warn!("(leader.acquire) election round failed: {}", e),
            }
            tokio::select! {
                _ = tokio::time::sleep(RETRY_PERIOD) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    /// Keep renewing until leadership is lost: a renewal failing past the
    /// renew deadline, or another holder taking the lease.
    pub async fn hold(&self) {
        let mut last_renew = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(RETRY_PERIOD).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renew = tokio::time::Instant::now(),
                Ok(false) => {
                    warn!("(leader.hold) leadership taken by another holder");
                    return;
                }
                Err(e) => {
                    warn!("(leader.hold) renew failed: {}", e);
                    if last_renew.elapsed() > RENEW_DEADLINE {
                        warn!("(leader.hold) renew deadline exceeded, giving up leadership");
                        return;
                    }
                }
            }
        }
    }

    /// Hand the lease back so a standby can take over immediately.
    pub async fn release(&self) {
        let patch = serde_json::json!({ "spec": { "holderIdentity": "" } });
        if let Err(e) = self
            .api
            .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            warn!("(leader.release) cannot release lease: {}", e);
        }
    }
}

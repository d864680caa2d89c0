use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Width of one tenant usage bucket.
const BUCKET_SECS: i64 = 300;

/// Absolute resource levels reported in one instance sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleLevels {
    pub vcpus: i64,
    pub mem_mb: i64,
    pub disk_mb: i64,
}

/// One 5-minute row of a tenant's usage series. Values are absolute
/// levels reached by summing per-instance deltas.
#[derive(Debug, Clone, Serialize)]
pub struct UsageBucket {
    pub start: DateTime<Utc>,
    pub vcpus: i64,
    pub mem_mb: i64,
    pub disk_mb: i64,
}

#[derive(Default)]
struct CollectorState {
    /// Last observed levels per instance, for delta computation.
    previous: HashMap<Uuid, SampleLevels>,
    /// Per-tenant bucketed series.
    usage: HashMap<String, Vec<UsageBucket>>,
}

/// Aggregates per-instance periodic samples into per-tenant usage.
#[derive(Default)]
pub struct UsageCollector {
    state: Mutex<CollectorState>,
}

impl UsageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one instance sample into the tenant's series. The delta
    /// against the previous sample is computed here; zero deltas post
    /// nothing.
    pub async fn record_sample(&self, tenant_id: &str, instance_id: Uuid, levels: SampleLevels) {
        self.record_sample_at(tenant_id, instance_id, levels, Utc::now())
            .await
    }

    pub async fn record_sample_at(
        &self,
        tenant_id: &str,
        instance_id: Uuid,
        levels: SampleLevels,
        at: DateTime<Utc>,
    ) {
        let mut state = self.state.lock().await;
        let previous = state
            .previous
            .insert(instance_id, levels)
            .unwrap_or_default();
        let delta = SampleLevels {
            vcpus: levels.vcpus - previous.vcpus,
            mem_mb: levels.mem_mb - previous.mem_mb,
            disk_mb: levels.disk_mb - previous.disk_mb,
        };
        if delta == SampleLevels::default() {
            return;
        }

        let buckets = state.usage.entry(tenant_id.to_string()).or_default();
        match buckets.last_mut() {
            Some(last) if at - last.start < Duration::seconds(BUCKET_SECS) => {
                last.vcpus += delta.vcpus;
                last.mem_mb += delta.mem_mb;
                last.disk_mb += delta.disk_mb;
            }
            Some(last) => {
                let bucket = UsageBucket {
                    start: at,
                    vcpus: last.vcpus + delta.vcpus,
                    mem_mb: last.mem_mb + delta.mem_mb,
                    disk_mb: last.disk_mb + delta.disk_mb,
                };
                buckets.push(bucket);
            }
            None => {
                buckets.push(UsageBucket {
                    start: at,
                    vcpus: delta.vcpus,
                    mem_mb: delta.mem_mb,
                    disk_mb: delta.disk_mb,
                });
            }
        }
    }

    /// Drop the previous-sample entry for a deleted instance so a reused
    /// id starts from zero.
    pub async fn forget_instance(&self, instance_id: Uuid) {
        self.state.lock().await.previous.remove(&instance_id);
    }

    pub async fn tenant_usage(&self, tenant_id: &str) -> Vec<UsageBucket> {
        self.state
            .lock()
            .await
            .usage
            .get(tenant_id)
            .cloned()
            .unwrap_or_default()
    }
}

//! CorrelationCache - bucketed message cache with a reserved staging area
//!
//! Buckets are sharded maps behind their own `Arc`, so operations on
//! different ids never wait on each other beyond a shard lock. Every single
//! entry read, write and move is one atomic map call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use dashmap::DashMap;
use tracing::{debug, trace};

use cg_common::{CachedMessage, ConfirmGuardError, Result, STAGING_NAMESPACE};

const STAGING_GAUGE: &str = "confirmguard_staging_entries";

type Bucket = Arc<DashMap<String, CachedMessage>>;

/// A returned message parked until its channel ack arrives
#[derive(Debug, Clone)]
pub struct StagedMessage {
    /// Bucket the message was taken from
    pub bucket: String,
    pub message: CachedMessage,
    pub staged_at: Instant,
}

impl StagedMessage {
    pub fn new(bucket: impl Into<String>, message: CachedMessage) -> Self {
        Self {
            bucket: bucket.into(),
            message,
            staged_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.staged_at.elapsed()
    }
}

/// Correlation cache shared by the publish path, the reconciler and the
/// resend job.
///
/// Absence is never an error: lookups return `Option` and removes of missing
/// keys are no-ops.
#[derive(Debug, Default)]
pub struct CorrelationCache {
    /// Business buckets by name. Buckets are created on first write and kept
    /// for the life of the cache.
    buckets: DashMap<String, Bucket>,

    /// Reserved staging area keyed by message id only
    staging: DashMap<String, StagedMessage>,
}

impl CorrelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, name: &str) -> Option<Bucket> {
        self.buckets.get(name).map(|b| b.value().clone())
    }

    fn bucket_or_create(&self, name: &str) -> Bucket {
        if let Some(bucket) = self.bucket(name) {
            return bucket;
        }
        self.buckets
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .value()
            .clone()
    }

    /// Add or overwrite the entry at `(bucket, id)`.
    ///
    /// Fails only for the reserved staging namespace or an empty bucket/id.
    pub fn put(&self, bucket: &str, id: &str, message: CachedMessage) -> Result<()> {
        if bucket == STAGING_NAMESPACE {
            return Err(ConfirmGuardError::ReservedNamespace(bucket.to_string()));
        }
        if bucket.is_empty() || id.is_empty() {
            return Err(ConfirmGuardError::InvalidKey(format!(
                "bucket and id must be non-empty (bucket='{}', id='{}')",
                bucket, id
            )));
        }

        let replaced = self.bucket_or_create(bucket).insert(id.to_string(), message);
        trace!(bucket = %bucket, message_id = %id, replaced = replaced.is_some(), "Cache put");
        Ok(())
    }

    pub fn get(&self, bucket: &str, id: &str) -> Option<CachedMessage> {
        if bucket == STAGING_NAMESPACE {
            return self.staging.get(id).map(|s| s.message.clone());
        }
        let bucket = self.bucket(bucket)?;
        let message = bucket.get(id).map(|m| m.value().clone());
        message
    }

    pub fn contains(&self, bucket: &str, id: &str) -> bool {
        if bucket == STAGING_NAMESPACE {
            return self.staging.contains_key(id);
        }
        self.bucket(bucket).map_or(false, |b| b.contains_key(id))
    }

    /// Remove `(bucket, id)`, returning the entry if one was there
    pub fn remove(&self, bucket: &str, id: &str) -> Option<CachedMessage> {
        if bucket == STAGING_NAMESPACE {
            return self.unstage(id).map(|s| s.message);
        }
        let removed = self.bucket(bucket)?.remove(id).map(|(_, m)| m);
        trace!(bucket = %bucket, message_id = %id, removed = removed.is_some(), "Cache remove");
        removed
    }

    /// Snapshot of a namespace, `None` if it was never written to.
    /// The staging area counts as unwritten while it holds nothing.
    pub fn get_namespace(&self, bucket: &str) -> Option<HashMap<String, CachedMessage>> {
        if bucket == STAGING_NAMESPACE {
            let snapshot: HashMap<_, _> = self
                .staging
                .iter()
                .map(|e| (e.key().clone(), e.value().message.clone()))
                .collect();
            return (!snapshot.is_empty()).then_some(snapshot);
        }
        let bucket = self.bucket(bucket)?;
        let snapshot = bucket
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        Some(snapshot)
    }

    /// Number of entries in a business bucket
    pub fn bucket_len(&self, bucket: &str) -> usize {
        self.bucket(bucket).map_or(0, |b| b.len())
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.iter().map(|e| e.key().clone()).collect()
    }

    /// Entries across all business buckets, i.e. the resend backlog
    pub fn pending_total(&self) -> usize {
        let buckets: Vec<Bucket> = self.buckets.iter().map(|e| e.value().clone()).collect();
        buckets.iter().map(|b| b.len()).sum()
    }

    // ========================================================================
    // Staging
    // ========================================================================

    /// Park a returned message under its id, replacing any previous entry
    pub fn stage(&self, id: &str, staged: StagedMessage) {
        let bucket = staged.bucket.clone();
        if self.staging.insert(id.to_string(), staged).is_none() {
            metrics::gauge!(STAGING_GAUGE).increment(1.0);
        }
        debug!(bucket = %bucket, message_id = %id, "Message staged");
    }

    /// Take a message out of staging
    pub fn unstage(&self, id: &str) -> Option<StagedMessage> {
        let removed = self.staging.remove(id).map(|(_, s)| s);
        if removed.is_some() {
            metrics::gauge!(STAGING_GAUGE).decrement(1.0);
        }
        removed
    }

    pub fn staged(&self, id: &str) -> Option<StagedMessage> {
        self.staging.get(id).map(|s| s.value().clone())
    }

    pub fn staging_len(&self) -> usize {
        self.staging.len()
    }

    /// Ids that have been staged for at least `max_age`
    pub fn stale_staged(&self, max_age: Duration) -> Vec<String> {
        self.staging
            .iter()
            .filter(|e| e.value().age() >= max_age)
            .map(|e| e.key().clone())
            .collect()
    }
}

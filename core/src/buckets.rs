//! Bucket catalog: local bucket records and their remote keywords

use std::sync::Arc;
use tracing::{info, warn};

use crate::bucket::Bucket;
use crate::error::{SortaError, SortaResult};
use crate::gateway::MailboxGateway;
use crate::storage::Database;

/// Attempts at finding a free id before giving up
const MAX_ID_ATTEMPTS: usize = 5;

/// Changes to an existing bucket; `None` leaves a field as is
#[derive(Debug, Clone, Default)]
pub struct BucketUpdate {
    pub label: Option<String>,
    pub color: Option<String>,
    pub sort_order: Option<i64>,
}

/// Manages the bucket table against the remote category markers
pub struct BucketCatalog {
    db: Database,
    gateway: Arc<dyn MailboxGateway>,
}

impl BucketCatalog {
    pub fn new(db: Database, gateway: Arc<dyn MailboxGateway>) -> Self {
        Self { db, gateway }
    }

    /// List buckets by sort order
    pub fn list(&self) -> SortaResult<Vec<Bucket>> {
        self.db.get_buckets()
    }

    pub fn get(&self, bucket_id: &str) -> SortaResult<Option<Bucket>> {
        self.db.get_bucket(bucket_id)
    }

    /// Create a bucket; the id is derived from the label and made unique
    pub fn create(&self, label: &str, color: Option<&str>) -> SortaResult<Bucket> {
        let mut bucket = Bucket::new(label.trim());
        if let Some(color) = color {
            bucket = bucket.with_color(color);
        }
        let next_order = self
            .db
            .get_buckets()?
            .iter()
            .map(|b| b.sort_order + 1)
            .max()
            .unwrap_or(0);
        bucket = bucket.with_sort_order(next_order);
        bucket.validate()?;

        let mut attempts = 0;
        while self.db.get_bucket(&bucket.id)?.is_some() {
            attempts += 1;
            if attempts > MAX_ID_ATTEMPTS {
                return Err(SortaError::invalid_state(format!("No free id for bucket {}", label)));
            }
            bucket.id = Bucket::new(label.trim()).id;
            bucket.disambiguate();
        }

        self.db.upsert_bucket(&bucket)?;
        info!("Created bucket {} ({})", bucket.id, bucket.label);
        Ok(bucket)
    }

    /// Update label, color or sort order. The id, and so the remote keyword,
    /// never changes.
    pub fn update(&self, bucket_id: &str, update: BucketUpdate) -> SortaResult<Bucket> {
        let mut bucket = self
            .db
            .get_bucket(bucket_id)?
            .ok_or_else(|| SortaError::not_found(format!("Bucket {}", bucket_id)))?;

        if let Some(label) = update.label {
            bucket.label = label.trim().to_string();
        }
        if let Some(color) = update.color {
            bucket.color = color;
        }
        if let Some(sort_order) = update.sort_order {
            bucket.sort_order = sort_order;
        }

        self.db.upsert_bucket(&bucket)?;
        Ok(bucket)
    }

    /// Delete a bucket and its local assignments. Remote markers are left on
    /// the messages.
    pub fn delete(&self, bucket_id: &str) -> SortaResult<bool> {
        let deleted = self.db.delete_bucket(bucket_id)?;
        if deleted {
            info!("Deleted bucket {}", bucket_id);
        }
        Ok(deleted)
    }

    /// Create buckets for category markers found remotely but unknown here
    pub async fn discover(&self) -> SortaResult<Vec<Bucket>> {
        let found = self.gateway.discover_category_markers().await?;

        let mut created = Vec::new();
        for marker in found {
            let Some(bucket) = Bucket::from_marker(&marker) else {
                warn!("Ignoring category marker with unusable id: {}", marker);
                continue;
            };
            if self.db.get_bucket(&bucket.id)?.is_some() {
                continue;
            }
            self.db.upsert_bucket(&bucket)?;
            created.push(bucket);
        }

        if !created.is_empty() {
            info!("Discovered {} buckets", created.len());
        }
        Ok(created)
    }

    /// Recount members from the cache
    pub fn refresh_counts_from_cache(&self) -> SortaResult<()> {
        for bucket in self.db.get_buckets()? {
            let count = self.db.count_bucket_members(&bucket.id)?;
            self.db.set_bucket_count(&bucket.id, count)?;
        }
        Ok(())
    }

    /// Recount members with a remote scan per bucket. Returns the number of
    /// buckets refreshed; failures are logged and skipped.
    pub async fn refresh_counts_from_remote(&self) -> SortaResult<usize> {
        let mut refreshed = 0;
        for bucket in self.db.get_buckets()? {
            match self.gateway.count_matching_marker(&bucket.marker()).await {
                Ok(count) => {
                    self.db.set_bucket_count(&bucket.id, count as i64)?;
                    refreshed += 1;
                }
                Err(e) => warn!("Could not count bucket {}: {}", bucket.id, e),
            }
        }
        Ok(refreshed)
    }
}

//! User-defined buckets (categories)

use serde::{Deserialize, Serialize};

use crate::error::{SortaError, SortaResult};
use crate::markers;

/// Default display color for new buckets
pub const DEFAULT_COLOR: &str = "#6b7280";

/// Maximum length of a bucket id
const MAX_ID_LEN: usize = 48;

/// A bucket, mapped 1:1 to the remote keyword `$Bucket_<id>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Slug id, `[a-z0-9_]`
    pub id: String,
    /// Display label
    pub label: String,
    /// Display color
    pub color: String,
    /// Sort order
    pub sort_order: i64,
    /// Cached member count, eventually consistent
    pub count: i64,
}

impl Bucket {
    /// Create a new bucket with an id derived from its label
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            id: slugify(&label),
            label,
            color: DEFAULT_COLOR.to_string(),
            sort_order: 0,
            count: 0,
        }
    }

    /// Create a bucket for a remote category keyword
    pub fn from_marker(marker: &str) -> Option<Self> {
        let id = markers::bucket_for_marker(marker)?;
        if !is_valid_id(id) {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            label: label_from_id(id),
            color: DEFAULT_COLOR.to_string(),
            sort_order: 0,
            count: 0,
        })
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    pub fn with_sort_order(mut self, sort_order: i64) -> Self {
        self.sort_order = sort_order;
        self
    }

    /// Remote category keyword for this bucket
    pub fn marker(&self) -> String {
        markers::marker_for_bucket(&self.id)
    }

    /// Give the bucket a unique id by appending a short random suffix
    pub fn disambiguate(&mut self) {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let base: String = self.id.chars().take(MAX_ID_LEN - 7).collect();
        self.id = format!("{}_{}", base, &suffix[..6]);
    }

    /// Validate the bucket
    pub fn validate(&self) -> SortaResult<()> {
        if self.label.trim().is_empty() {
            return Err(SortaError::validation("Bucket label cannot be empty"));
        }

        if !is_valid_id(&self.id) {
            return Err(SortaError::validation(format!("Invalid bucket id: {:?}", self.id)));
        }

        if !markers::is_valid_keyword(&self.marker()) {
            return Err(SortaError::validation(format!(
                "Bucket id {} does not form a valid keyword",
                self.id
            )));
        }

        Ok(())
    }
}

/// Check that an id only uses `[a-z0-9_]`
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Derive an id from a label
pub fn slugify(label: &str) -> String {
    let mut slug = String::with_capacity(label.len());
    let mut last_underscore = true;

    for c in label.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            slug.push('_');
            last_underscore = true;
        }
    }

    let slug = slug.trim_end_matches('_');
    let slug: String = slug.chars().take(MAX_ID_LEN).collect();
    if slug.is_empty() {
        "bucket".to_string()
    } else {
        slug
    }
}

fn label_from_id(id: &str) -> String {
    id.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_creation() {
        let bucket = Bucket::new("Finance & Bills");
        assert_eq!(bucket.id, "finance_bills");
        assert_eq!(bucket.marker(), "$Bucket_finance_bills");
        assert!(bucket.validate().is_ok());
    }

    #[test]
    fn test_slugify_edge_cases() {
        assert_eq!(slugify("  Travel  "), "travel");
        assert_eq!(slugify("***"), "bucket");
        assert_eq!(slugify("Q3 / Q4 reports"), "q3_q4_reports");
    }

    #[test]
    fn test_bucket_from_marker() {
        let bucket = Bucket::from_marker("$Bucket_side_projects").unwrap();
        assert_eq!(bucket.id, "side_projects");
        assert_eq!(bucket.label, "Side Projects");
        assert!(Bucket::from_marker("$Bucketed").is_none());
        assert!(Bucket::from_marker("$Bucket_Bad-Id").is_none());
    }

    #[test]
    fn test_bucket_disambiguate() {
        let mut bucket = Bucket::new("Finance");
        bucket.disambiguate();
        assert!(bucket.id.starts_with("finance_"));
        assert_eq!(bucket.id.len(), "finance_".len() + 6);
        assert!(bucket.validate().is_ok());
    }

    #[test]
    fn test_bucket_validation() {
        let mut bucket = Bucket::new("Work");
        bucket.label = " ".to_string();
        assert!(bucket.validate().is_err());

        let mut bucket = Bucket::new("Work");
        bucket.id = "Work!".to_string();
        assert!(bucket.validate().is_err());
    }
}

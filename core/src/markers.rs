//! Remote keyword markers used to encode buckets and archiving
//!
//! IMAP only knows folders and per-message flags, so bucket membership and
//! archive state are stored as keywords on the message itself.

use std::collections::BTreeSet;

/// Sentinel keyword carried by every categorized message
pub const CATEGORIZED: &str = "$Bucketed";

/// Keyword carried by every archived message
pub const ARCHIVED: &str = "$Archived";

/// Prefix of the per-bucket category keyword
pub const CATEGORY_PREFIX: &str = "$Bucket_";

/// Standard seen flag
pub const SEEN: &str = "\\Seen";

/// Standard flagged flag
pub const FLAGGED: &str = "\\Flagged";

/// Standard draft flag
pub const DRAFT: &str = "\\Draft";

/// Category keyword for a bucket id
pub fn marker_for_bucket(bucket_id: &str) -> String {
    format!("{}{}", CATEGORY_PREFIX, bucket_id)
}

/// Bucket id encoded in a category keyword
pub fn bucket_for_marker(marker: &str) -> Option<&str> {
    marker
        .strip_prefix(CATEGORY_PREFIX)
        .filter(|id| !id.is_empty())
}

/// Check if a keyword is a per-bucket category keyword
pub fn is_category_marker(marker: &str) -> bool {
    bucket_for_marker(marker).is_some()
}

/// Check if a keyword is one of the markers excluded from the inbox listing
pub fn hides_from_inbox(marker: &str) -> bool {
    marker.eq_ignore_ascii_case(CATEGORIZED) || marker.eq_ignore_ascii_case(ARCHIVED)
}

/// Keywords that must be removed before a new category set is applied
pub fn category_markers_in<'a, I>(flags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a String>,
{
    flags
        .into_iter()
        .filter(|f| is_category_marker(f) || f.eq_ignore_ascii_case(CATEGORIZED))
        .cloned()
        .collect()
}

/// Check that a keyword is a valid IMAP atom we are willing to send
pub fn is_valid_keyword(keyword: &str) -> bool {
    !keyword.is_empty()
        && keyword.chars().all(|c| {
            c.is_ascii_graphic() && !matches!(c, '(' | ')' | '{' | '%' | '*' | '"' | '\\' | ']')
        })
}

/// Build the flag list for a STORE command, e.g. `($Bucket_a $Bucketed)`
pub fn flag_list<'a, I>(flags: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let joined = flags.into_iter().collect::<Vec<_>>().join(" ");
    format!("({})", joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_marker_mapping() {
        assert_eq!(marker_for_bucket("finance"), "$Bucket_finance");
        assert_eq!(bucket_for_marker("$Bucket_finance"), Some("finance"));
        assert_eq!(bucket_for_marker("$Bucket_"), None);
        assert_eq!(bucket_for_marker("$Bucketed"), None);
        assert_eq!(bucket_for_marker("\\Seen"), None);
    }

    #[test]
    fn test_category_detection() {
        assert!(is_category_marker("$Bucket_travel"));
        assert!(!is_category_marker(CATEGORIZED));
        assert!(!is_category_marker(ARCHIVED));
        assert!(hides_from_inbox("$bucketed"));
        assert!(hides_from_inbox(ARCHIVED));
        assert!(!hides_from_inbox(FLAGGED));
    }

    #[test]
    fn test_category_markers_in() {
        let flags = vec![
            "\\Seen".to_string(),
            "$Bucket_a".to_string(),
            "$Bucketed".to_string(),
            "$Archived".to_string(),
        ];
        let found = category_markers_in(&flags);
        assert_eq!(found.len(), 2);
        assert!(found.contains("$Bucket_a"));
        assert!(found.contains("$Bucketed"));
    }

    #[test]
    fn test_keyword_validation() {
        assert!(is_valid_keyword("$Bucket_finance"));
        assert!(!is_valid_keyword("$Bucket finance"));
        assert!(!is_valid_keyword("$Bucket(x)"));
        assert!(!is_valid_keyword(""));
        assert_eq!(flag_list(["$Bucket_a", CATEGORIZED]), "($Bucket_a $Bucketed)");
    }
}

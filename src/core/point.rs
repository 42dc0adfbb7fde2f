//! Indexed points: one stored item's fingerprint plus render metadata.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::Fingerprint;

/// Enough metadata to render a search hit without a second storage lookup.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayMetadata {
    pub title: Option<String>,
    pub attribution: Option<String>,
    pub tags: Vec<String>,
    /// Milliseconds since the Unix epoch
    pub created_at: Option<u64>,
    /// Milliseconds since the Unix epoch
    pub updated_at: Option<u64>,
}

impl DisplayMetadata {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn with_attribution(mut self, attribution: impl Into<String>) -> Self {
        self.attribution = Some(attribution.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Immutable snapshot of one stored item's fingerprint.
///
/// Metadata is behind an `Arc` so search results share it with the index
/// instead of copying strings per hit.
#[derive(Clone, Debug)]
pub struct IndexedPoint {
    pub fingerprint: Fingerprint,
    pub item_id: String,
    pub metadata: Arc<DisplayMetadata>,
}

impl IndexedPoint {
    pub fn new(fingerprint: Fingerprint, item_id: impl Into<String>, metadata: DisplayMetadata) -> Self {
        Self {
            fingerprint,
            item_id: item_id.into(),
            metadata: Arc::new(metadata),
        }
    }

    /// Point with empty metadata
    pub fn bare(fingerprint: Fingerprint, item_id: impl Into<String>) -> Self {
        Self::new(fingerprint, item_id, DisplayMetadata::default())
    }
}

//! ID-based paging over sortable ID lists

use serde::Deserialize;

/// Direction a page is walked in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    /// Newest first
    #[default]
    Descending,
    /// Oldest first, starting just above `min`
    Ascending,
}

/// A window over a newest-first ID list
///
/// Bounds are exclusive. A limit of zero means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Page {
    pub min: Option<String>,
    pub max: Option<String>,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub order: Order,
}

impl Page {
    /// Newest `limit` IDs
    pub fn newest(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Newest `limit` IDs older than `max`
    pub fn older_than(max: impl Into<String>, limit: usize) -> Self {
        Self {
            max: Some(max.into()),
            limit,
            ..Self::default()
        }
    }

    /// Oldest `limit` IDs newer than `min`, oldest first
    pub fn newer_than(min: impl Into<String>, limit: usize) -> Self {
        Self {
            min: Some(min.into()),
            limit,
            order: Order::Ascending,
            ..Self::default()
        }
    }

    /// Slice `ids`, which must be sorted newest first
    pub fn apply(&self, ids: &[String]) -> Vec<String> {
        let in_bounds = |id: &&String| {
            self.min.as_deref().is_none_or(|min| id.as_str() > min)
                && self.max.as_deref().is_none_or(|max| id.as_str() < max)
        };
        let limit = if self.limit == 0 { usize::MAX } else { self.limit };

        match self.order {
            Order::Descending => ids.iter().filter(in_bounds).take(limit).cloned().collect(),
            Order::Ascending => ids.iter().rev().filter(in_bounds).take(limit).cloned().collect(),
        }
    }
}

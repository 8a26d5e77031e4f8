use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use super::{TagInclusionFilter, TagSet};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error(
    "no tag combination out of {catalogue_size} satisfies the inclusion expression '{expression}'"
)]
pub struct EmptyScopeError {
    pub expression: String,
    pub catalogue_size: usize,
}

/// Tag combinations currently in scope for counting and loading.
#[derive(Debug, Clone)]
pub struct TagScope {
    filter: TagInclusionFilter,
    combinations: Vec<TagSet>,
    refreshed_at: Option<Instant>,
}

impl TagScope {
    pub fn new(filter: TagInclusionFilter) -> Self {
        Self {
            filter,
            combinations: Vec::new(),
            refreshed_at: None,
        }
    }

    pub fn filter(&self) -> &TagInclusionFilter {
        &self.filter
    }

    pub fn combinations(&self) -> &[TagSet] {
        &self.combinations
    }

    pub fn is_empty(&self) -> bool {
        self.combinations.is_empty()
    }

    pub fn refreshed_at(&self) -> Option<Instant> {
        self.refreshed_at
    }

    /// True when the scope is empty or older than `interval`.
    pub fn needs_refresh(&self, now: Instant, interval: Duration) -> bool {
        match self.refreshed_at {
            Some(at) if !self.combinations.is_empty() => {
                now.saturating_duration_since(at) >= interval
            }
            _ => true,
        }
    }

    /// Replaces the scope with the catalogue entries the filter includes.
    ///
    /// An empty result clears the scope and is an error.
    pub fn refresh(
        &mut self,
        catalogue: Vec<TagSet>,
        now: Instant,
    ) -> Result<usize, EmptyScopeError> {
        let catalogue_size = catalogue.len();
        let included: Vec<TagSet> = catalogue
            .into_iter()
            .filter(|tags| {
                let included = self.filter.includes(tags);
                debug!(
                    event = "tag_combination_checked",
                    tags = ?tags,
                    included,
                    "checked tag combination"
                );
                included
            })
            .collect();

        if included.is_empty() {
            self.combinations.clear();
            self.refreshed_at = None;
            return Err(EmptyScopeError {
                expression: self.filter.expression().to_string(),
                catalogue_size,
            });
        }

        info!(
            event = "tag_scope_refreshed",
            included = included.len(),
            catalogue_size,
            "refreshed tag scope"
        );
        self.combinations = included;
        self.refreshed_at = Some(now);
        Ok(self.combinations.len())
    }
}

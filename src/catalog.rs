use std::collections::BTreeSet;

/// Source of the valid topic identifiers. Consulted only when a roster is
/// built from scratch (first bootstrap and reset).
pub trait TopicCatalog: Send + Sync {
    fn all_topic_ids(&self) -> BTreeSet<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    topics: BTreeSet<String>,
}

impl StaticCatalog {
    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }

    /// Comma separated list; blanks and duplicates are dropped.
    pub fn parse_list(raw: &str) -> Self {
        Self::new(
            raw.split(',')
                .map(str::trim)
                .filter(|topic| !topic.is_empty()),
        )
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

impl TopicCatalog for StaticCatalog {
    fn all_topic_ids(&self) -> BTreeSet<String> {
        self.topics.clone()
    }
}

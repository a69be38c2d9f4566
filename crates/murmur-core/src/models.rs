//! Domain models exchanged with the content collaborators.

use serde::{Deserialize, Serialize};

use crate::job::{ContentRef, RecordKind};

/// Text of a post or comment, ready to be embedded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentText {
    pub record_id: String,
    pub record_kind: RecordKind,
    /// Post title plus body, or comment body.
    pub text: String,
    /// For comments, the title of the parent post.
    pub context: Option<String>,
}

impl ContentText {
    /// Text handed to the embedding and extraction models.
    ///
    /// Comments are prefixed with their parent post title so a short reply
    /// still lands near its thread in vector space.
    pub fn embedding_input(&self) -> String {
        match &self.context {
            Some(context) if !context.trim().is_empty() => {
                format!("{}\n\n{}", context.trim(), self.text.trim())
            }
            _ => self.text.trim().to_string(),
        }
    }
}

/// Entities extracted from a piece of content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entities {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Entities {
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty() && self.locations.is_empty() && self.tags.is_empty()
    }

    /// Trims, lowercases and deduplicates every list, preserving first occurrence.
    pub fn normalized(self) -> Self {
        fn clean(values: Vec<String>) -> Vec<String> {
            let mut out: Vec<String> = Vec::with_capacity(values.len());
            for value in values {
                let value = value.trim().to_lowercase();
                if !value.is_empty() && !out.contains(&value) {
                    out.push(value);
                }
            }
            out
        }

        Self {
            topics: clean(self.topics),
            locations: clean(self.locations),
            tags: clean(self.tags),
        }
    }
}

/// One page of a content scan.
#[derive(Debug, Clone, Default)]
pub struct ContentPage {
    pub items: Vec<ContentRef>,
    /// Cursor for the next page; `None` when the scan is complete.
    pub next_cursor: Option<String>,
}

/// A semantic search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub record_id: String,
    pub record_kind: RecordKind,
    pub title: Option<String>,
    pub snippet: String,
    /// Cosine similarity in `[0, 1]` for normalized vectors.
    pub similarity: f32,
}

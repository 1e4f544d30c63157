use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::AggregatorError;
use crate::storage::WriteBatcher;

pub const KEY_NEXT_POST_ID: &str = "meta:nextPostId";

/// `posturi:<id>` value. New rows are a bare string; legacy rows may carry
/// the derived URL alongside the URI. Both are accepted on read; only the
/// plain form is ever written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PostUriValue {
    Plain(String),
    Legacy { uri: String, #[serde(default)] url: Option<String> },
}

impl PostUriValue {
    pub fn uri(&self) -> &str {
        match self {
            PostUriValue::Plain(uri) => uri,
            PostUriValue::Legacy { uri, .. } => uri,
        }
    }
}

/// Bidirectional map between post URIs and the compact numeric ids stored in
/// the active-reference caches, backed by the `postid:`/`posturi:`/`posturl:`
/// and `meta:nextPostId` KV rows.
#[derive(Debug, Default)]
pub struct PostIdRegistry {
    by_uri: HashMap<String, u64>,
    by_id: HashMap<u64, String>,
    url_cache: HashMap<u64, Option<String>>,
    next_id: u64,
}

impl PostIdRegistry {
    pub fn new() -> Self {
        Self { next_id: 1, ..Default::default() }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn id_for_uri(&self, uri: &str) -> Option<u64> {
        self.by_uri.get(uri).copied()
    }

    pub fn uri_for_id(&self, id: u64) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    pub fn url_for_id(&self, id: u64) -> Option<String> {
        self.url_cache.get(&id).cloned().flatten()
    }

    /// Returns the id for `uri`, allocating and persisting a new one if
    /// unseen.
    pub fn get_or_allocate(
        &mut self,
        batcher: &WriteBatcher<'_>,
        uri: &str,
    ) -> Result<u64, AggregatorError> {
        if let Some(id) = self.by_uri.get(uri) {
            return Ok(*id);
        }
        let id = self.next_id;
        self.next_id += 1;
        let url = derive_display_url(uri);

        self.by_uri.insert(uri.to_string(), id);
        self.by_id.insert(id, uri.to_string());
        self.url_cache.insert(id, url.clone());

        batcher.put(format!("postid:{uri}"), serde_json::to_vec(&id)?)?;
        batcher.put(
            format!("posturi:{id}"),
            serde_json::to_vec(&PostUriValue::Plain(uri.to_string()))?,
        )?;
        batcher.put(format!("posturl:{id}"), serde_json::to_vec(&url)?)?;
        batcher.put(KEY_NEXT_POST_ID, serde_json::to_vec(&self.next_id)?)?;
        Ok(id)
    }

    /// Removes the id/URI mapping for `id`, deleting all three KV rows.
    pub fn remove(&mut self, batcher: &WriteBatcher<'_>, id: u64) -> Result<(), AggregatorError> {
        if let Some(uri) = self.by_id.remove(&id) {
            self.by_uri.remove(&uri);
            batcher.delete(format!("postid:{uri}"))?;
        }
        self.url_cache.remove(&id);
        batcher.delete(format!("posturi:{id}"))?;
        batcher.delete(format!("posturl:{id}"))?;
        Ok(())
    }

    /// Recovery-only: installs a `postid:<uri> -> id` mapping read directly
    /// from KV without touching storage.
    pub fn load_postid(&mut self, uri: String, id: u64) {
        self.by_uri.insert(uri, id);
        if id >= self.next_id {
            self.next_id = id + 1;
        }
    }

    /// Recovery-only: installs a `posturi:<id> -> uri` mapping.
    pub fn load_posturi(&mut self, id: u64, uri: String) {
        self.by_id.insert(id, uri);
    }

    /// Recovery-only: installs a cached display URL.
    pub fn load_posturl(&mut self, id: u64, url: Option<String>) {
        self.url_cache.insert(id, url);
    }

    pub fn set_next_id(&mut self, next_id: u64) {
        self.next_id = self.next_id.max(next_id);
    }
}

/// `at://<did>/app.bsky.feed.post/<rkey>` -> `https://bsky.app/profile/<did>/post/<rkey>`.
/// Returns `None` for anything that isn't a post record URI.
pub fn derive_display_url(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("at://")?;
    let mut parts = rest.splitn(3, '/');
    let did = parts.next()?;
    let collection = parts.next()?;
    let rkey = parts.next()?;
    if collection != "app.bsky.feed.post" {
        return None;
    }
    Some(format!("https://bsky.app/profile/{did}/post/{rkey}"))
}

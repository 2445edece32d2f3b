//! Friendly-name ↔ upstream-id alias table.
//!
//! Upstream ids are often file paths (`/models/Qwen3-8B-Q4_K_M.gguf`);
//! clients get a readable alias in `/api/tags` and may send it back as
//! `model` on any endpoint. The table is rebuilt on every `/api/tags`
//! call and published wholesale so readers never observe a half-built
//! mapping.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

/// Process-wide alias mapping with swap-on-rebuild publication.
#[derive(Debug, Default)]
pub struct AliasTable {
    map: RwLock<Arc<HashMap<String, String>>>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a possibly-aliased model name. Unknown names resolve to
    /// themselves so raw upstream ids keep working.
    pub fn resolve(&self, name: &str) -> String {
        let snapshot = self
            .map
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        snapshot.get(name).cloned().unwrap_or_else(|| name.to_owned())
    }

    /// Replace the table with a freshly built mapping.
    pub fn publish(&self, map: HashMap<String, String>) {
        debug!(aliases = map.len(), "publishing model alias table");
        *self
            .map
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(map);
    }
}

/// Derive a human-friendly alias from a model id or file path: basename,
/// known extensions stripped, whitespace runs collapsed.
///
/// Extension stripping cascades: each extension is checked against the
/// already-shrunk name, so `model.bin.gguf` reduces to `model`.
pub fn friendly_model_name(id: &str) -> String {
    let mut base = id.rsplit('/').next().unwrap_or(id);
    for ext in [".gguf", ".bin", ".pt", ".pth"] {
        if let Some(stripped) = base.strip_suffix(ext) {
            base = stripped;
        }
    }
    let collapsed = base.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        id.to_owned()
    } else {
        collapsed
    }
}

/// Register `alias -> real_id`, disambiguating collisions with a
/// `" (2)"`, `" (3)"`, ... suffix until the key is free.
pub fn register_alias(map: &mut HashMap<String, String>, alias: &str, real_id: &str) {
    if alias.is_empty() || real_id.is_empty() {
        return;
    }
    let mut key = alias.to_owned();
    let mut idx = 2;
    while map.get(&key).is_some_and(|existing| existing != real_id) {
        key = format!("{alias} ({idx})");
        idx += 1;
    }
    debug!(alias = %key, id = %real_id, "registered model alias");
    map.insert(key, real_id.to_owned());
}

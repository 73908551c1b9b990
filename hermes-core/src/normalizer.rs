//! Model identifier canonicalization.
//!
//! Upstreams advertise the same model under different spellings
//! (`openai/gpt-4o-mini`, `GPT-4o-mini `, `gpt-4o-mini`). The registry's
//! inverted index and the dispatcher both key on the canonical form, so
//! normalization must be deterministic and stable across the process.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Alias configuration for the normalizer.
///
/// `strip_prefixes` are vendor prefixes removed when the remainder is
/// non-empty; `aliases` are exact post-lowercase rewrites applied after
/// prefix stripping.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AliasTable {
    #[serde(default)]
    pub strip_prefixes: Vec<String>,
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

/// Canonicalizes model identifiers. Pure and cheap; construct once and share.
#[derive(Debug, Clone)]
pub struct ModelNormalizer {
    strip_prefixes: Vec<String>,
    aliases: HashMap<String, String>,
    table_hash: String,
}

impl ModelNormalizer {
    pub fn new(table: AliasTable) -> Self {
        let strip_prefixes: Vec<String> = table
            .strip_prefixes
            .iter()
            .map(|p| p.to_ascii_lowercase())
            .collect();
        let aliases: HashMap<String, String> = table
            .aliases
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.to_ascii_lowercase()))
            .collect();

        // Hash the canonical rendering of the table so callers can key
        // caches on it and invalidate when configuration changes.
        let mut hasher = Sha256::new();
        let mut prefixes = strip_prefixes.clone();
        prefixes.sort();
        for p in &prefixes {
            hasher.update(b"p:");
            hasher.update(p.as_bytes());
            hasher.update(b"\n");
        }
        let mut pairs: Vec<_> = aliases.iter().collect();
        pairs.sort();
        for (k, v) in pairs {
            hasher.update(b"a:");
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b"\n");
        }
        let table_hash = format!("{:x}", hasher.finalize());

        Self {
            strip_prefixes,
            aliases,
            table_hash,
        }
    }

    /// Canonical form: lowercase, surrounding whitespace stripped, vendor
    /// prefix collapsed, alias applied. Idempotent.
    pub fn normalize(&self, model: &str) -> String {
        let mut m = model.trim().to_ascii_lowercase();
        for prefix in &self.strip_prefixes {
            if let Some(rest) = m.strip_prefix(prefix.as_str()) {
                if !rest.is_empty() {
                    m = rest.to_string();
                    break;
                }
            }
        }
        if let Some(alias) = self.aliases.get(&m) {
            m = alias.clone();
        }
        m
    }

    /// Hex digest of the alias table, exposed for cache invalidation.
    pub fn table_hash(&self) -> &str {
        &self.table_hash
    }
}

impl Default for ModelNormalizer {
    fn default() -> Self {
        Self::new(AliasTable {
            strip_prefixes: vec!["openai/".into()],
            aliases: HashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> ModelNormalizer {
        ModelNormalizer::new(AliasTable {
            strip_prefixes: vec!["openai/".into(), "azure/".into()],
            aliases: HashMap::from([("gpt4o-mini".into(), "gpt-4o-mini".into())]),
        })
    }

    #[test]
    fn lowercases_and_trims() {
        let n = normalizer();
        assert_eq!(n.normalize("  GPT-4o-Mini "), "gpt-4o-mini");
    }

    #[test]
    fn strips_vendor_prefix() {
        let n = normalizer();
        assert_eq!(n.normalize("openai/gpt-4o-mini"), "gpt-4o-mini");
        assert_eq!(n.normalize("azure/GPT-4"), "gpt-4");
        // A bare prefix with nothing after it is left alone.
        assert_eq!(n.normalize("openai/"), "openai/");
    }

    #[test]
    fn applies_alias_after_prefix() {
        let n = normalizer();
        assert_eq!(n.normalize("openai/gpt4o-mini"), "gpt-4o-mini");
    }

    #[test]
    fn normalizing_twice_is_a_noop() {
        let n = normalizer();
        for input in ["openai/GPT-4o-mini", " gpt-4 ", "gpt4o-mini"] {
            let once = n.normalize(input);
            assert_eq!(n.normalize(&once), once);
        }
    }

    #[test]
    fn table_hash_tracks_configuration() {
        let a = normalizer();
        let b = normalizer();
        assert_eq!(a.table_hash(), b.table_hash());

        let c = ModelNormalizer::new(AliasTable {
            strip_prefixes: vec!["openai/".into()],
            aliases: HashMap::new(),
        });
        assert_ne!(a.table_hash(), c.table_hash());
    }
}

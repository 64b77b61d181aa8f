//! Index keys, index specs and the index cache.
//!
//! Index keys are written as `[$<kind>:][-|+]<field>` (or the legacy `@field`
//! for 2d indexes). Each key maps to a canonical index name, which together
//! with the collection namespace forms the cache key that lets repeated
//! `ensure_index` calls skip the server.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bson::{Bson, Document};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// An index description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Index {
    /// Key fields; prefix with `-` for descending order.
    pub key: Vec<String>,
    /// Reject documents with a duplicate key.
    pub unique: bool,
    /// Drop documents whose key duplicates an earlier one.
    pub drop_dups: bool,
    /// Build in the background.
    pub background: bool,
    /// Only index documents containing the key fields.
    pub sparse: bool,
    /// Expire documents whose indexed time is older than this.
    pub expire_after: Duration,
    /// Index name, computed from the key by `ensure_index`.
    pub name: String,
    /// Precision of spatial indexes.
    pub bits: i32,
    /// Lower bound of spatial indexes.
    pub min: i32,
    /// Upper bound of spatial indexes.
    pub max: i32,
}

impl Index {
    /// Creates an index over `key`.
    pub fn new<S: AsRef<str>>(key: &[S]) -> Self {
        Self {
            key: key.iter().map(|k| k.as_ref().to_string()).collect(),
            ..Default::default()
        }
    }

    /// Sets uniqueness.
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Sets duplicate dropping.
    pub fn drop_dups(mut self, drop_dups: bool) -> Self {
        self.drop_dups = drop_dups;
        self
    }

    /// Sets background building.
    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    /// Sets sparseness.
    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    /// Sets the document expiry.
    pub fn expire_after(mut self, expire_after: Duration) -> Self {
        self.expire_after = expire_after;
        self
    }

    /// Sets spatial index bounds and precision.
    pub fn spatial(mut self, bits: i32, min: i32, max: i32) -> Self {
        self.bits = bits;
        self.min = min;
        self.max = max;
        self
    }
}

/// The index document stored in `<db>.system.indexes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index name.
    pub name: String,
    /// Namespace the index belongs to.
    pub ns: String,
    /// Key document.
    pub key: Document,
    #[serde(default, skip_serializing_if = "is_false")]
    /// Unique constraint.
    pub unique: bool,
    #[serde(default, rename = "dropDups", skip_serializing_if = "is_false")]
    /// Drop duplicates while building.
    pub drop_dups: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    /// Background build.
    pub background: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    /// Sparse index.
    pub sparse: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    /// Spatial precision.
    pub bits: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    /// Spatial lower bound.
    pub min: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    /// Spatial upper bound.
    pub max: i32,
    #[serde(default, rename = "expireAfterSeconds", skip_serializing_if = "is_zero")]
    /// Document time to live.
    pub expire_after_seconds: i32,
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

impl IndexSpec {
    /// Builds the spec for `index` on namespace `ns`.
    pub fn new(ns: &str, name: String, key: Document, index: &Index) -> Self {
        Self {
            name,
            ns: ns.to_string(),
            key,
            unique: index.unique,
            drop_dups: index.drop_dups,
            background: index.background,
            sparse: index.sparse,
            bits: index.bits,
            min: index.min,
            max: index.max,
            expire_after_seconds: index.expire_after.as_secs() as i32,
        }
    }

    /// Converts the stored spec back into an [`Index`].
    pub fn into_index(self) -> ClientResult<Index> {
        Ok(Index {
            key: simple_index_key(&self.key)?,
            unique: self.unique,
            drop_dups: self.drop_dups,
            background: self.background,
            sparse: self.sparse,
            expire_after: Duration::from_secs(self.expire_after_seconds.max(0) as u64),
            name: self.name,
            bits: self.bits,
            min: self.min,
            max: self.max,
        })
    }
}

fn invalid_key(raw: &str) -> ClientError {
    ClientError::InvalidArgument(format!(
        "invalid index key: want \"[$<kind>:][-]<field name>\", got {:?}",
        raw
    ))
}

/// Parses an index key into its canonical name and key document.
pub fn parse_index_key<S: AsRef<str>>(key: &[S]) -> ClientResult<(String, Document)> {
    let mut parts = Vec::with_capacity(key.len());
    let mut real_key = Document::new();

    for raw in key {
        let raw = raw.as_ref();
        let mut field = raw;
        let mut kind: Option<&str> = None;

        if let Some(rest) = field.strip_prefix('$') {
            match rest.split_once(':') {
                Some((k, f)) if !k.is_empty() && !f.is_empty() => {
                    kind = Some(k);
                    field = f;
                }
                _ => return Err(invalid_key(raw)),
            }
        }

        let (name, field, order) = if let Some(f) = field.strip_prefix('@') {
            (format!("{}_2d", f), f, Bson::String("2d".into()))
        } else if let Some(f) = field.strip_prefix('-') {
            (format!("{}_-1", f), f, Bson::Int32(-1))
        } else {
            let f = field.strip_prefix('+').unwrap_or(field);
            match kind {
                Some(k) => (format!("{}_{}", f, k), f, Bson::String(k.to_string())),
                None => (format!("{}_1", f), f, Bson::Int32(1)),
            }
        };

        // A kind prefix cannot be combined with a direction.
        let kind_mismatch = kind.map_or(false, |k| order != Bson::String(k.to_string()));
        if field.is_empty() || field.starts_with('$') || kind_mismatch {
            return Err(invalid_key(raw));
        }
        parts.push(name);
        real_key.insert(field, order);
    }

    if parts.is_empty() {
        return Err(ClientError::InvalidArgument(
            "invalid index key: no fields provided".to_string(),
        ));
    }
    Ok((parts.join("_"), real_key))
}

/// Renders a key document back into the `[$<kind>:][-]<field>` syntax.
pub fn simple_index_key(real_key: &Document) -> ClientResult<Vec<String>> {
    real_key
        .iter()
        .map(|(field, value)| {
            let direction = match value {
                Bson::Int32(v) => Some(*v as i64),
                Bson::Int64(v) => Some(*v),
                Bson::Double(v) => Some(*v as i64),
                _ => None,
            };
            match (direction, value) {
                (Some(1), _) => Ok(field.clone()),
                (Some(-1), _) => Ok(format!("-{}", field)),
                (_, Bson::String(kind)) => Ok(format!("${}:{}", kind, field)),
                _ => Err(ClientError::InvalidArgument(format!(
                    "unknown index key type for field {}",
                    field
                ))),
            }
        })
        .collect()
}

/// Builds the cache key for an index.
pub(crate) fn cache_key(namespace: &str, name: &str) -> String {
    format!("{}\x00{}", namespace, name)
}

/// Statistics for index cache operations.
#[derive(Debug, Default)]
pub struct IndexCacheStats {
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
}

impl IndexCacheStats {
    /// Returns total lookups.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Returns cache hits.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Returns cache misses.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Returns insertions.
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Returns evictions.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Returns the hit ratio (0.0 to 1.0).
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.lookups();
        if lookups == 0 {
            0.0
        } else {
            self.hits() as f64 / lookups as f64
        }
    }
}

impl fmt::Display for IndexCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IndexCacheStats {{ lookups: {}, hits: {}, misses: {}, hit_ratio: {:.2}%, inserts: {}, evictions: {} }}",
            self.lookups(),
            self.hits(),
            self.misses(),
            self.hit_ratio() * 100.0,
            self.inserts(),
            self.evictions()
        )
    }
}

/// Remembers which indexes are known to exist.
#[derive(Debug, Default)]
pub struct IndexCache {
    known: RwLock<HashSet<String>>,
    stats: IndexCacheStats,
}

impl IndexCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the index is known to exist.
    pub fn contains(&self, key: &str) -> bool {
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);
        let hit = self.known.read().contains(key);
        if hit {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Records that the index exists.
    pub fn insert(&self, key: String) {
        if self.known.write().insert(key) {
            self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Forgets the index.
    pub fn remove(&self, key: &str) {
        if self.known.write().remove(key) {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Forgets every index.
    pub fn clear(&self) {
        let mut known = self.known.write();
        self.stats
            .evictions
            .fetch_add(known.len() as u64, Ordering::Relaxed);
        known.clear();
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.known.read().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.known.read().is_empty()
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> &IndexCacheStats {
        &self.stats
    }
}

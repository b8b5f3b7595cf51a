use anyhow::{Context, Result};
use serde::Serialize;

/// Separator placed between identity parts
pub const SEPARATOR: char = ':';

/// Builder for the string key that decides which calls get merged.
///
/// Parts are joined with [`SEPARATOR`]. String parts are used verbatim,
/// anything else goes through [`signature`].
#[derive(Debug, Clone)]
pub struct Identity {
    key: String,
}

impl Identity {
    pub fn new(first: impl AsRef<str>) -> Self {
        Self {
            key: first.as_ref().to_string(),
        }
    }

    pub fn part(mut self, part: impl AsRef<str>) -> Self {
        self.key.push(SEPARATOR);
        self.key.push_str(part.as_ref());
        self
    }

    pub fn json<A: Serialize + ?Sized>(self, value: &A) -> Result<Self> {
        let encoded = signature(value)?;
        Ok(self.part(encoded))
    }

    pub fn build(self) -> String {
        self.key
    }
}

/// Serializes call arguments into a dedup key.
///
/// This is plain `serde_json` output: struct fields follow declaration order
/// and map keys follow the map's iteration order, so two argument values only
/// share a signature when they are built with the same shape. A `HashMap`
/// argument is therefore a poor fit; prefer structs or `BTreeMap`.
pub fn signature<A: Serialize + ?Sized>(args: &A) -> Result<String> {
    serde_json::to_string(args).context("Failed to serialize call arguments into a signature")
}

/// Strips a single trailing slash (except for root "/") so `/users/` and
/// `/users` name the same resource.
pub fn normalize_path(path: &str) -> &str {
    match path.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => path,
    }
}

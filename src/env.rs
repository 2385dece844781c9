//! Scoped environment overlays.
//!
//! An overlay is an insertion-ordered set of `set`/`unset` entries
//! carried in the ambient context. Key comparison matches the host
//! platform: case-insensitive on Windows, exact elsewhere. `None`
//! entries delete variables when the overlay is applied.

use std::borrow::Cow;
use std::future::Future;
use std::hash::{Hash, Hasher};

use indexmap::IndexMap;

use crate::capture::{self, ScriptContext};

/// An environment variable name with platform key semantics.
#[derive(Clone, Debug)]
pub struct EnvKey(String);

impl EnvKey {
    #[cfg(windows)]
    fn normalized(&self) -> Cow<'_, str> {
        Cow::Owned(self.0.to_ascii_lowercase())
    }

    #[cfg(not(windows))]
    fn normalized(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.0.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EnvKey {
    fn from(key: &str) -> EnvKey {
        EnvKey(key.to_owned())
    }
}

impl From<String> for EnvKey {
    fn from(key: String) -> EnvKey {
        EnvKey(key)
    }
}

impl PartialEq for EnvKey {
    fn eq(&self, other: &EnvKey) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for EnvKey {}

impl Hash for EnvKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

#[derive(Clone, Debug, Default)]
pub struct EnvOverlay {
    entries: IndexMap<EnvKey, Option<String>>,
}

impl EnvOverlay {
    pub fn new() -> EnvOverlay {
        EnvOverlay::default()
    }

    pub fn set(mut self, key: impl Into<EnvKey>, value: impl Into<String>) -> EnvOverlay {
        self.entries.insert(key.into(), Some(value.into()));
        self
    }

    /// Mark a variable for deletion wherever the overlay applies.
    pub fn unset(mut self, key: impl Into<EnvKey>) -> EnvOverlay {
        self.entries.insert(key.into(), None);
        self
    }

    pub fn get(&self, key: impl Into<EnvKey>) -> Option<&str> {
        match self.entries.get(&key.into()) {
            Some(Some(value)) => Some(value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// This overlay with `over`'s entries layered on top.
    pub fn merged(&self, over: &EnvOverlay) -> EnvOverlay {
        let mut merged = self.clone();
        for (key, value) in &over.entries {
            merged.entries.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Apply the overlay's entries onto a resolved variable map. The
    /// map is keyed by platform semantics; values keep the spelling
    /// they were set with.
    pub(crate) fn apply(&self, map: &mut IndexMap<EnvKey, (String, String)>) {
        for (key, value) in &self.entries {
            match value {
                Some(value) => {
                    map.insert(key.clone(), (key.as_str().to_owned(), value.clone()));
                }
                None => {
                    map.shift_remove(key);
                }
            }
        }
    }
}

/// Resolve the full variable set for a subprocess: the parent process
/// environment (when requested), with the ambient overlay and then the
/// per-command overlay applied.
pub(crate) fn resolve(
    include_parent: bool,
    ambient: Option<&EnvOverlay>,
    command: &EnvOverlay,
) -> Vec<(String, String)> {
    let mut map: IndexMap<EnvKey, (String, String)> = IndexMap::new();
    if include_parent {
        for (key, value) in std::env::vars() {
            map.insert(EnvKey::from(key.as_str()), (key, value));
        }
    }
    if let Some(ambient) = ambient {
        ambient.apply(&mut map);
    }
    command.apply(&mut map);
    map.into_values().collect()
}

/// Scope an environment overlay for the duration of `fut`. With
/// `include_parent`, the new overlay merges over the ambient one;
/// without, the ambient overlay is cleared first.
pub async fn with_env<F: Future>(overlay: EnvOverlay, include_parent: bool, fut: F) -> F::Output {
    let base = capture::current();
    let env = if include_parent {
        base.as_ref()
            .map(|ctx| ctx.env().clone())
            .unwrap_or_default()
            .merged(&overlay)
    } else {
        overlay
    };
    let ctx = ScriptContext::derive_env(base, env);
    capture::scoped(ctx, fut).await
}

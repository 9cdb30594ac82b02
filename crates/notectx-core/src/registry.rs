//! Collection discovery and query routing.
//!
//! The registry never caches: every call inspects the store, so a
//! collection created by an indexing run is routable as soon as it is
//! promoted.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::CollectionInfo;
use crate::store::VectorStore;

/// Which collections a search should cover.
///
/// Deserializes from `"all"`, a single collection name, or an array of
/// names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TargetRepr", into = "TargetRepr")]
pub enum CollectionTarget {
    #[default]
    All,
    One(String),
    Many(Vec<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TargetRepr {
    Name(String),
    Names(Vec<String>),
}

impl From<TargetRepr> for CollectionTarget {
    fn from(repr: TargetRepr) -> Self {
        match repr {
            TargetRepr::Name(name) if name == "all" => CollectionTarget::All,
            TargetRepr::Name(name) => CollectionTarget::One(name),
            TargetRepr::Names(names) => CollectionTarget::Many(names),
        }
    }
}

impl From<CollectionTarget> for TargetRepr {
    fn from(target: CollectionTarget) -> Self {
        match target {
            CollectionTarget::All => TargetRepr::Name("all".into()),
            CollectionTarget::One(name) => TargetRepr::Name(name),
            CollectionTarget::Many(names) => TargetRepr::Names(names),
        }
    }
}

impl CollectionTarget {
    /// Build a target from repeated CLI flags; no names means all.
    pub fn from_names(mut names: Vec<String>) -> Self {
        match names.len() {
            0 => CollectionTarget::All,
            1 => {
                let name = names.remove(0);
                if name == "all" {
                    CollectionTarget::All
                } else {
                    CollectionTarget::One(name)
                }
            }
            _ => CollectionTarget::Many(names),
        }
    }
}

/// Read-only view over the collections a store holds.
pub struct CollectionRegistry<'a, S: VectorStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: VectorStore + ?Sized> CollectionRegistry<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Every persisted collection with its metadata, ordered by name.
    pub async fn list(&self) -> Result<Vec<CollectionInfo>> {
        self.store.list_collections().await
    }

    /// Resolve a search target to concrete collections, ordered by name.
    ///
    /// Unknown names fail with `NotFound`. Repeated names collapse. `All`
    /// against an empty store yields an empty list.
    pub async fn resolve(&self, target: &CollectionTarget) -> Result<Vec<CollectionInfo>> {
        let all = self.store.list_collections().await?;

        let wanted: BTreeSet<&str> = match target {
            CollectionTarget::All => return Ok(all),
            CollectionTarget::One(name) => std::iter::once(name.as_str()).collect(),
            CollectionTarget::Many(names) => names.iter().map(String::as_str).collect(),
        };

        if let Some(missing) = wanted
            .iter()
            .find(|name| !all.iter().any(|c| c.name == **name))
        {
            return Err(Error::NotFound {
                collection: missing.to_string(),
            });
        }

        Ok(all
            .into_iter()
            .filter(|c| wanted.contains(c.name.as_str()))
            .collect())
    }
}

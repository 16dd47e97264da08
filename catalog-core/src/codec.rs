//! Wire encoding for item collections.
//!
//! The payload is `{"items":[...]}` followed by a single newline. An empty
//! collection is still `{"items":[]}`, never `null`.

use crate::error::{CatalogError, Result};
use crate::storage::ItemRecord;
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCollection {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub items: Vec<ItemRecord>,
}

#[derive(Serialize)]
struct ItemCollectionRef<'a> {
    items: &'a [ItemRecord],
}

pub fn encode(items: &[ItemRecord]) -> Result<Vec<u8>> {
    let mut payload = serde_json::to_vec(&ItemCollectionRef { items })?;
    payload.push(b'\n');
    Ok(payload)
}

/// Accepts payloads with or without the trailing newline, and legacy
/// payloads where an empty collection was written as `"items": null`.
pub fn decode(payload: &[u8]) -> Result<ItemCollection> {
    serde_json::from_slice(payload)
        .map_err(|error| CatalogError::Validation(format!("malformed item collection: {}", error)))
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<ItemRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<ItemRecord>>::deserialize(deserializer)?.unwrap_or_default())
}

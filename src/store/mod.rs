//! The object store that fragments are pushed to and fetched from.
//!
//! The store is content-addressed: `put()` hands back an opaque [`ContentId`] and `get()` returns
//! exactly the bytes that were stored under it.  Putting the same bytes twice is allowed and must
//! yield an id that resolves to the same content.

pub mod command;
pub mod local;
pub mod memory;

use std::fmt;

use anyhow::{
    Context,
    Result,
    bail,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::checksum::Sha256HashValue;

pub use command::{
    ClientOptions,
    CommandStore,
};
pub use local::LocalStore;
pub use memory::MemoryStore;

/// Identifier handed out by the store for a stored fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(value: impl Into<String>) -> ContentId {
        ContentId(value.into())
    }

    /// Renders a 32-byte root hash the way the storage network does: "0x" + 64 hex digits.
    pub fn root(hash: &Sha256HashValue) -> ContentId {
        ContentId(format!("0x{}", hex::encode(hash)))
    }

    /// Strictly parses a root hash, with or without the "0x" prefix.  Anything else, including
    /// other 64-character tokens that aren't hex, is rejected.
    pub fn parse_root(value: &str) -> Result<ContentId> {
        let hash = Self::decode_root(value)?;
        Ok(ContentId::root(&hash))
    }

    /// The 32-byte value behind a root-shaped id.
    pub fn to_hash(&self) -> Result<Sha256HashValue> {
        Self::decode_root(&self.0)
    }

    fn decode_root(value: &str) -> Result<Sha256HashValue> {
        let value = value.trim();
        let digits = value.strip_prefix("0x").unwrap_or(value);
        if digits.len() != 64 {
            bail!("Root {:?} should have 64 hex digits", value);
        }
        let mut hash = [0u8; 32];
        hex::decode_to_slice(digits, &mut hash)
            .with_context(|| format!("Root {:?} is not valid hex", value))?;
        Ok(hash)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where fragments go.  Callers bound every call with their own timeout, so implementations are
/// free to block for as long as the backend needs; dropping the future must abandon the request.
#[allow(async_fn_in_trait)]
pub trait ObjectStore {
    async fn put(&self, data: &[u8]) -> Result<ContentId>;
    async fn get(&self, id: &ContentId) -> Result<Vec<u8>>;
}

impl<S: ObjectStore> ObjectStore for &S {
    async fn put(&self, data: &[u8]) -> Result<ContentId> {
        (**self).put(data).await
    }

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>> {
        (**self).get(id).await
    }
}

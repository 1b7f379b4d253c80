use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::KvError;

#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, KvError>;

    async fn put(&self, key: &str, value: Value) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<bool, KvError>;
}

/// Reads a key and deserialises it.
pub async fn get_json<T: DeserializeOwned>(kv: &dyn KvBackend, key: &str) -> Result<Option<T>, KvError> {
    match kv.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| KvError::Serialisation(format!("{key}: {e}"))),
        None => Ok(None),
    }
}

/// Serialises a value and writes it under a key.
pub async fn put_json<T: Serialize + ?Sized>(kv: &dyn KvBackend, key: &str, value: &T) -> Result<(), KvError> {
    let value = serde_json::to_value(value).map_err(|e| KvError::Serialisation(format!("{key}: {e}")))?;
    kv.put(key, value).await
}

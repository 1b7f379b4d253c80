use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::KvError;
use crate::traits::KvBackend;

#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    data: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Value>, KvError> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), KvError> {
        let mut data = self.data.write().await;
        data.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut data = self.data.write().await;
        Ok(data.remove(key).is_some())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{get_json, put_json};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn put_then_get() {
        let kv = MemoryKv::new();
        kv.put("users", serde_json::json!({"alice": {}})).await.unwrap();

        let value = kv.get("users").await.unwrap().unwrap();
        assert!(value.get("alice").is_some());
        assert!(kv.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn last_put_wins() {
        let kv = MemoryKv::new();
        kv.put("k", Value::from(1)).await.unwrap();
        kv.put("k", Value::from(2)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(Value::from(2)));
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let kv = MemoryKv::new();
        kv.put("k", Value::Null).await.unwrap();
        assert!(kv.delete("k").await.unwrap());
        assert!(!kv.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn typed_helpers() {
        let kv = MemoryKv::new();
        let mut graph = BTreeMap::new();
        graph.insert("a".to_string(), vec!["b".to_string()]);

        put_json(&kv, "graph", &graph).await.unwrap();
        let back: Option<BTreeMap<String, Vec<String>>> = get_json(&kv, "graph").await.unwrap();
        assert_eq!(back, Some(graph));

        kv.put("bad", Value::from("not a map")).await.unwrap();
        let err = get_json::<BTreeMap<String, Vec<String>>>(&kv, "bad").await.unwrap_err();
        assert!(matches!(err, KvError::Serialisation(_)));
    }
}

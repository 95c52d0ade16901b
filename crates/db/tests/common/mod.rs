//! Shared fixtures for id-map integration tests.

#![allow(dead_code)]

use idmap_core::config::{IdMapConfig, MapNamespace};
use idmap_core::key::{DestinationKey, KeyValue, SourceKey};
use idmap_core::schema::{KeyFieldType, KeySchema};
use idmap_db::{IdMap, InMemoryStore, KeyValueStore, MemoryKvEngine};

pub fn config(namespace: &str) -> IdMapConfig {
    IdMapConfig::builder(
        MapNamespace::new(namespace).unwrap(),
        KeySchema::single("id", KeyFieldType::Integer),
        KeySchema::single("nid", KeyFieldType::Integer),
    )
    .message_page_size(3)
    .build()
    .unwrap()
}

/// Integer source ids mapped to text destination ids.
pub fn text_destination_config(namespace: &str) -> IdMapConfig {
    IdMapConfig::builder(
        MapNamespace::new(namespace).unwrap(),
        KeySchema::single("id", KeyFieldType::Integer),
        KeySchema::single("machine_name", KeyFieldType::Text),
    )
    .build()
    .unwrap()
}

pub fn memory_text_map() -> IdMap<InMemoryStore> {
    let config = text_destination_config("contract_text");
    let store = InMemoryStore::new(config.namespace.clone());
    IdMap::new(config, store).unwrap()
}

pub fn kv_text_map() -> IdMap<KeyValueStore<MemoryKvEngine>> {
    let config = text_destination_config("contract_text");
    let store = KeyValueStore::new(config.namespace.clone(), MemoryKvEngine::new());
    IdMap::new(config, store).unwrap()
}

pub fn text_dst(name: &str) -> DestinationKey {
    DestinationKey::from([KeyValue::from(name)])
}

pub fn memory_map() -> IdMap<InMemoryStore> {
    let config = config("contract");
    let store = InMemoryStore::new(config.namespace.clone());
    IdMap::new(config, store).unwrap()
}

pub fn kv_map() -> IdMap<KeyValueStore<MemoryKvEngine>> {
    let config = config("contract");
    let store = KeyValueStore::new(config.namespace.clone(), MemoryKvEngine::new());
    IdMap::new(config, store).unwrap()
}

pub fn src(id: i64) -> SourceKey {
    SourceKey::from([KeyValue::from(id)])
}

pub fn dst(nid: i64) -> DestinationKey {
    DestinationKey::from([KeyValue::from(nid)])
}

/// First component of a source key as an integer.
pub fn id_of(key: &SourceKey) -> i64 {
    key.values()[0].as_i64().unwrap()
}

//! Per-topic codecs. Every topic a worker reads from or produces to must have
//! a [TopicSerde] registered; a missing entry is a configuration bug and is
//! treated as fatal wherever it is discovered.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::message::DomainValue;

/// Converts between a user-domain type and its wire representation.
pub trait Serde: Send + Sync {
    fn serialize(&self, value: &(dyn Any + Send + Sync)) -> Result<Bytes>;
    fn deserialize(&self, bytes: &[u8]) -> Result<DomainValue>;
}

/// Key and value codecs for one topic.
#[derive(Clone)]
pub struct TopicSerde {
    pub key: Arc<dyn Serde>,
    pub value: Arc<dyn Serde>,
}

impl TopicSerde {
    pub fn new(key: impl Serde + 'static, value: impl Serde + 'static) -> Self {
        Self {
            key: Arc::new(key),
            value: Arc::new(value),
        }
    }
}

/// Registry mapping topic names to their codecs.
pub type TopicSerdes = HashMap<String, TopicSerde>;

/// Pass-through codec for raw payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerde;

impl Serde for BytesSerde {
    fn serialize(&self, value: &(dyn Any + Send + Sync)) -> Result<Bytes> {
        value
            .downcast_ref::<Bytes>()
            .cloned()
            .ok_or_else(|| Error::Codec("BytesSerde expects a Bytes value".into()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<DomainValue> {
        Ok(Box::new(Bytes::copy_from_slice(bytes)))
    }
}

/// UTF-8 string codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerde;

impl Serde for StringSerde {
    fn serialize(&self, value: &(dyn Any + Send + Sync)) -> Result<Bytes> {
        let value = value
            .downcast_ref::<String>()
            .ok_or_else(|| Error::Codec("StringSerde expects a String value".into()))?;
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<DomainValue> {
        let value = std::str::from_utf8(bytes)
            .map_err(|e| Error::Codec(format!("Invalid UTF-8 sequence: {e}")))?;
        Ok(Box::new(value.to_string()))
    }
}

/// JSON codec over any `serde`-enabled type.
pub struct JsonSerde<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerde<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerde<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Serde for JsonSerde<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn serialize(&self, value: &(dyn Any + Send + Sync)) -> Result<Bytes> {
        let value = value.downcast_ref::<T>().ok_or_else(|| {
            Error::Codec(format!(
                "JsonSerde expects a {} value",
                std::any::type_name::<T>()
            ))
        })?;
        let encoded =
            serde_json::to_vec(value).map_err(|e| Error::Codec(format!("JSON encode: {e}")))?;
        Ok(Bytes::from(encoded))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<DomainValue> {
        let value: T = serde_json::from_slice(bytes)
            .map_err(|e| Error::Codec(format!("JSON decode: {e}")))?;
        Ok(Box::new(value))
    }
}

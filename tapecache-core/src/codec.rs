//! Key/value record serialization for topic caches.

use std::io::Write;

use crate::error::{Result, TapeError};
use crate::schema::{Datum, Schema};
use crate::typed::Converter;

/// One measurement: a key (usually the source identity) and its value.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: Datum,
    pub value: Datum,
}

impl Record {
    #[must_use]
    pub fn new(key: Datum, value: Datum) -> Self {
        Self { key, value }
    }
}

/// Encodes records as `key bytes ++ value bytes` under a fixed pair of schemas.
///
/// Consecutive records usually share a key, so the encoded bytes of the last key
/// are kept and reused instead of being encoded again.
#[derive(Debug, Clone)]
pub struct RecordCodec {
    key_schema: Schema,
    value_schema: Schema,
    last_key: Option<(Datum, Vec<u8>)>,
    scratch: Vec<u8>,
}

impl RecordCodec {
    #[must_use]
    pub fn new(key_schema: Schema, value_schema: Schema) -> Self {
        Self {
            key_schema,
            value_schema,
            last_key: None,
            scratch: Vec::new(),
        }
    }

    #[must_use]
    pub fn key_schema(&self) -> &Schema {
        &self.key_schema
    }

    #[must_use]
    pub fn value_schema(&self) -> &Schema {
        &self.value_schema
    }

    /// Validates and encodes a record into a fresh buffer.
    pub fn encode(&mut self, record: &Record) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.serialize(record, &mut out)?;
        Ok(out)
    }

    fn key_bytes(&mut self, key: &Datum) -> Result<&[u8]> {
        let reuse = matches!(&self.last_key, Some((cached, _)) if cached == key);
        if !reuse {
            let mut bytes = Vec::new();
            self.key_schema.encode(key, &mut bytes)?;
            self.last_key = Some((key.clone(), bytes));
        }
        Ok(self
            .last_key
            .as_ref()
            .map(|(_, bytes)| bytes.as_slice())
            .unwrap_or_default())
    }
}

impl Converter<Record> for RecordCodec {
    fn serialize(&mut self, record: &Record, out: &mut dyn Write) -> Result<()> {
        let mut value = std::mem::take(&mut self.scratch);
        value.clear();
        let encoded = self.value_schema.encode(&record.value, &mut value);
        let result = encoded.and_then(|()| {
            out.write_all(self.key_bytes(&record.key)?)?;
            out.write_all(&value)?;
            Ok(())
        });
        self.scratch = value;
        result
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Record> {
        let mut input = bytes;
        let key = self.key_schema.decode(&mut input)?;
        let value = self.value_schema.decode(&mut input)?;
        if !input.is_empty() {
            return Err(TapeError::validation(format!(
                "{} trailing bytes after record",
                input.len()
            )));
        }
        self.key_schema.validate(&key)?;
        self.value_schema.validate(&value)?;
        Ok(Record { key, value })
    }
}

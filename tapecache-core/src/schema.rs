//! Record schemas and their compact binary encoding.
//!
//! Schemas are written as Avro-style JSON (`"long"`, `{"type": "record", ...}`,
//! `["null", "string"]`) and persisted next to every cache generation. Values are
//! [`Datum`] trees; the binary form uses zig-zag varints for integers and
//! length-prefixed bytes and strings, so encoded records are self-delimiting.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map as JsonMap, Value as JsonValue, json};

use crate::error::{Result, TapeError};

/// Named field of a record schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
}

/// Shape of a key or value.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Bytes,
    String,
    Enum { name: String, symbols: Vec<String> },
    Array(Box<Schema>),
    Map(Box<Schema>),
    Record { name: String, fields: Vec<Field> },
    Union(Vec<Schema>),
}

/// A value conforming to some [`Schema`].
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
    String(String),
    /// Enum symbol.
    Enum(String),
    Array(Vec<Datum>),
    Map(BTreeMap<String, Datum>),
    /// Field values in schema order.
    Record(Vec<(String, Datum)>),
}

impl Schema {
    /// Parses schema JSON text.
    pub fn parse(text: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(text)?;
        let mut names = HashMap::new();
        parse_value(&value, &mut names)
    }

    /// Canonical JSON form, used to compare stored schemas with declared ones.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => json!("null"),
            Self::Boolean => json!("boolean"),
            Self::Int => json!("int"),
            Self::Long => json!("long"),
            Self::Float => json!("float"),
            Self::Double => json!("double"),
            Self::Bytes => json!("bytes"),
            Self::String => json!("string"),
            Self::Enum { name, symbols } => {
                json!({"type": "enum", "name": name, "symbols": symbols})
            }
            Self::Array(items) => json!({"type": "array", "items": items.to_json()}),
            Self::Map(values) => json!({"type": "map", "values": values.to_json()}),
            Self::Record { name, fields } => {
                let fields: Vec<JsonValue> = fields
                    .iter()
                    .map(|field| json!({"name": field.name, "type": field.schema.to_json()}))
                    .collect();
                json!({"type": "record", "name": name, "fields": fields})
            }
            Self::Union(branches) => {
                JsonValue::Array(branches.iter().map(Schema::to_json).collect())
            }
        }
    }

    /// Canonical text form, as written to `.avsc` files.
    #[must_use]
    pub fn canonical_text(&self) -> String {
        self.to_json().to_string()
    }

    /// Checks that `datum` conforms to this schema.
    pub fn validate(&self, datum: &Datum) -> Result<()> {
        validate_at(self, datum, "$")
    }

    /// Encodes a validated datum, appending to `out`.
    pub fn encode(&self, datum: &Datum, out: &mut Vec<u8>) -> Result<()> {
        self.validate(datum)?;
        encode_datum(self, datum, out);
        Ok(())
    }

    /// Decodes one datum from the front of `input`, advancing it.
    pub fn decode(&self, input: &mut &[u8]) -> Result<Datum> {
        decode_datum(self, input)
    }

    fn type_name(&self) -> &str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Bytes => "bytes",
            Self::String => "string",
            Self::Enum { name, .. } | Self::Record { name, .. } => name,
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Union(_) => "union",
        }
    }
}

fn schema_error(reason: impl Into<String>) -> TapeError {
    TapeError::Schema {
        reason: reason.into(),
    }
}

fn parse_value(value: &JsonValue, names: &mut HashMap<String, Schema>) -> Result<Schema> {
    match value {
        JsonValue::String(name) => parse_named(name, names),
        JsonValue::Array(branches) => {
            let branches = branches
                .iter()
                .map(|branch| parse_value(branch, names))
                .collect::<Result<Vec<_>>>()?;
            if branches.iter().any(|branch| matches!(branch, Schema::Union(_))) {
                return Err(schema_error("unions may not contain unions"));
            }
            Ok(Schema::Union(branches))
        }
        JsonValue::Object(object) => parse_object(object, names),
        other => Err(schema_error(format!("unexpected schema element {other}"))),
    }
}

fn parse_named(name: &str, names: &HashMap<String, Schema>) -> Result<Schema> {
    Ok(match name {
        "null" => Schema::Null,
        "boolean" => Schema::Boolean,
        "int" => Schema::Int,
        "long" => Schema::Long,
        "float" => Schema::Float,
        "double" => Schema::Double,
        "bytes" => Schema::Bytes,
        "string" => Schema::String,
        other => names
            .get(other)
            .cloned()
            .ok_or_else(|| schema_error(format!("unknown type '{other}'")))?,
    })
}

fn required_str<'a>(object: &'a JsonMap<String, JsonValue>, key: &str) -> Result<&'a str> {
    object
        .get(key)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| schema_error(format!("missing string attribute '{key}'")))
}

fn full_name(object: &JsonMap<String, JsonValue>) -> Result<String> {
    let name = required_str(object, "name")?;
    Ok(match object.get("namespace").and_then(JsonValue::as_str) {
        Some(namespace) if !namespace.is_empty() && !name.contains('.') => {
            format!("{namespace}.{name}")
        }
        _ => name.to_string(),
    })
}

fn parse_object(
    object: &JsonMap<String, JsonValue>,
    names: &mut HashMap<String, Schema>,
) -> Result<Schema> {
    let kind = object
        .get("type")
        .ok_or_else(|| schema_error("schema object without 'type'"))?;
    let JsonValue::String(kind) = kind else {
        return parse_value(kind, names);
    };
    match kind.as_str() {
        "record" | "error" => {
            let name = full_name(object)?;
            let fields = object
                .get("fields")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| schema_error(format!("record '{name}' has no fields array")))?;
            let mut parsed = Vec::with_capacity(fields.len());
            for field in fields {
                let field = field
                    .as_object()
                    .ok_or_else(|| schema_error("record field must be an object"))?;
                let field_name = required_str(field, "name")?;
                let field_type = field
                    .get("type")
                    .ok_or_else(|| schema_error(format!("field '{field_name}' has no type")))?;
                parsed.push(Field {
                    name: field_name.to_string(),
                    schema: parse_value(field_type, names)?,
                });
            }
            let schema = Schema::Record {
                name: name.clone(),
                fields: parsed,
            };
            names.insert(name, schema.clone());
            Ok(schema)
        }
        "enum" => {
            let name = full_name(object)?;
            let symbols = object
                .get("symbols")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| schema_error(format!("enum '{name}' has no symbols")))?
                .iter()
                .map(|symbol| {
                    symbol
                        .as_str()
                        .map(str::to_string)
                        .ok_or_else(|| schema_error("enum symbols must be strings"))
                })
                .collect::<Result<Vec<_>>>()?;
            let schema = Schema::Enum {
                name: name.clone(),
                symbols,
            };
            names.insert(name, schema.clone());
            Ok(schema)
        }
        "array" => {
            let items = object
                .get("items")
                .ok_or_else(|| schema_error("array schema without 'items'"))?;
            Ok(Schema::Array(Box::new(parse_value(items, names)?)))
        }
        "map" => {
            let values = object
                .get("values")
                .ok_or_else(|| schema_error("map schema without 'values'"))?;
            Ok(Schema::Map(Box::new(parse_value(values, names)?)))
        }
        primitive => parse_named(primitive, names),
    }
}

fn mismatch(schema: &Schema, datum: &Datum, path: &str) -> TapeError {
    TapeError::validation(format!(
        "{path}: expected {}, found {}",
        schema.type_name(),
        datum.kind()
    ))
}

fn validate_at(schema: &Schema, datum: &Datum, path: &str) -> Result<()> {
    match (schema, datum) {
        (Schema::Null, Datum::Null)
        | (Schema::Boolean, Datum::Boolean(_))
        | (Schema::Int, Datum::Int(_))
        | (Schema::Long, Datum::Long(_))
        | (Schema::Float, Datum::Float(_))
        | (Schema::Double, Datum::Double(_))
        | (Schema::Bytes, Datum::Bytes(_))
        | (Schema::String, Datum::String(_)) => Ok(()),
        (Schema::Enum { name, symbols }, Datum::Enum(symbol)) => {
            if symbols.contains(symbol) {
                Ok(())
            } else {
                Err(TapeError::validation(format!(
                    "{path}: '{symbol}' is not a symbol of {name}"
                )))
            }
        }
        (Schema::Array(items), Datum::Array(values)) => {
            if values.len() > MAX_ZERO_WIDTH_ITEMS && min_encoded_len(items) == 0 {
                return Err(TapeError::validation(format!(
                    "{path}: {} items encode to no bytes, at most {MAX_ZERO_WIDTH_ITEMS} allowed",
                    values.len()
                )));
            }
            values
                .iter()
                .enumerate()
                .try_for_each(|(i, value)| validate_at(items, value, &format!("{path}[{i}]")))
        }
        (Schema::Map(values), Datum::Map(entries)) => entries
            .iter()
            .try_for_each(|(key, value)| validate_at(values, value, &format!("{path}.{key}"))),
        (Schema::Record { name, fields }, Datum::Record(values)) => {
            if fields.len() != values.len() {
                return Err(TapeError::validation(format!(
                    "{path}: {name} has {} fields, found {}",
                    fields.len(),
                    values.len()
                )));
            }
            for (field, (value_name, value)) in fields.iter().zip(values) {
                if &field.name != value_name {
                    return Err(TapeError::validation(format!(
                        "{path}: expected field '{}', found '{value_name}'",
                        field.name
                    )));
                }
                validate_at(&field.schema, value, &format!("{path}.{value_name}"))?;
            }
            Ok(())
        }
        (Schema::Union(branches), datum) => {
            if union_branch(branches, datum).is_some() {
                Ok(())
            } else {
                Err(TapeError::validation(format!(
                    "{path}: {} matches no branch of the union",
                    datum.kind()
                )))
            }
        }
        (schema, datum) => Err(mismatch(schema, datum, path)),
    }
}

fn union_branch(branches: &[Schema], datum: &Datum) -> Option<usize> {
    branches
        .iter()
        .position(|branch| validate_at(branch, datum, "").is_ok())
}

fn encode_long(value: i64, out: &mut Vec<u8>) {
    let mut zigzag = ((value << 1) ^ (value >> 63)) as u64;
    loop {
        let byte = (zigzag & 0x7F) as u8;
        zigzag >>= 7;
        if zigzag == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    encode_long(bytes.len() as i64, out);
    out.extend_from_slice(bytes);
}

// Only called on validated data.
fn encode_datum(schema: &Schema, datum: &Datum, out: &mut Vec<u8>) {
    match (schema, datum) {
        (Schema::Boolean, Datum::Boolean(value)) => out.push(u8::from(*value)),
        (Schema::Int, Datum::Int(value)) => encode_long(i64::from(*value), out),
        (Schema::Long, Datum::Long(value)) => encode_long(*value, out),
        (Schema::Float, Datum::Float(value)) => out.extend_from_slice(&value.to_le_bytes()),
        (Schema::Double, Datum::Double(value)) => out.extend_from_slice(&value.to_le_bytes()),
        (Schema::Bytes, Datum::Bytes(bytes)) => encode_bytes(bytes, out),
        (Schema::String, Datum::String(text)) => encode_bytes(text.as_bytes(), out),
        (Schema::Enum { symbols, .. }, Datum::Enum(symbol)) => {
            let index = symbols.iter().position(|s| s == symbol).unwrap_or_default();
            encode_long(index as i64, out);
        }
        (Schema::Array(items), Datum::Array(values)) => {
            if !values.is_empty() {
                encode_long(values.len() as i64, out);
                for value in values {
                    encode_datum(items, value, out);
                }
            }
            encode_long(0, out);
        }
        (Schema::Map(schema), Datum::Map(entries)) => {
            if !entries.is_empty() {
                encode_long(entries.len() as i64, out);
                for (key, value) in entries {
                    encode_bytes(key.as_bytes(), out);
                    encode_datum(schema, value, out);
                }
            }
            encode_long(0, out);
        }
        (Schema::Record { fields, .. }, Datum::Record(values)) => {
            for (field, (_, value)) in fields.iter().zip(values) {
                encode_datum(&field.schema, value, out);
            }
        }
        (Schema::Union(branches), datum) => {
            let index = union_branch(branches, datum).unwrap_or_default();
            encode_long(index as i64, out);
            encode_datum(&branches[index], datum, out);
        }
        _ => {}
    }
}

fn truncated() -> TapeError {
    TapeError::validation("record ends unexpectedly")
}

fn take<'a>(input: &mut &'a [u8], count: usize) -> Result<&'a [u8]> {
    if input.len() < count {
        return Err(truncated());
    }
    let (head, tail) = input.split_at(count);
    *input = tail;
    Ok(head)
}

fn decode_long(input: &mut &[u8]) -> Result<i64> {
    let mut zigzag = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = take(input, 1)?[0];
        zigzag |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64));
        }
    }
    Err(TapeError::validation("varint is longer than ten bytes"))
}

fn decode_len(input: &mut &[u8]) -> Result<usize> {
    let len = decode_long(input)?;
    let len = usize::try_from(len)
        .map_err(|_| TapeError::validation(format!("negative length {len}")))?;
    if len > input.len() {
        return Err(truncated());
    }
    Ok(len)
}

/// Arrays of items that encode to nothing (nulls, empty records) carry no bytes to
/// bound their block counts, so their length is capped instead.
const MAX_ZERO_WIDTH_ITEMS: usize = 1 << 16;

/// Fewest bytes any datum of `schema` encodes to.
fn min_encoded_len(schema: &Schema) -> usize {
    match schema {
        Schema::Null => 0,
        Schema::Float => 4,
        Schema::Double => 8,
        Schema::Record { fields, .. } => {
            fields.iter().map(|field| min_encoded_len(&field.schema)).sum()
        }
        Schema::Boolean
        | Schema::Int
        | Schema::Long
        | Schema::Bytes
        | Schema::String
        | Schema::Enum { .. }
        | Schema::Array(_)
        | Schema::Map(_)
        | Schema::Union(_) => 1,
    }
}

/// Reads a block count whose items take at least `item_len` bytes each.
fn decode_block_count(input: &mut &[u8], item_len: usize) -> Result<usize> {
    let count = decode_long(input)?;
    let count = usize::try_from(count.unsigned_abs())
        .map_err(|_| TapeError::validation("block count overflows"))?;
    match item_len {
        0 if count > MAX_ZERO_WIDTH_ITEMS => Err(TapeError::validation(format!(
            "block of {count} empty items exceeds {MAX_ZERO_WIDTH_ITEMS}"
        ))),
        0 => Ok(count),
        len if count > input.len() / len => Err(truncated()),
        _ => Ok(count),
    }
}

fn decode_datum(schema: &Schema, input: &mut &[u8]) -> Result<Datum> {
    Ok(match schema {
        Schema::Null => Datum::Null,
        Schema::Boolean => match take(input, 1)?[0] {
            0 => Datum::Boolean(false),
            1 => Datum::Boolean(true),
            other => return Err(TapeError::validation(format!("invalid boolean byte {other}"))),
        },
        Schema::Int => {
            let value = decode_long(input)?;
            Datum::Int(
                i32::try_from(value)
                    .map_err(|_| TapeError::validation(format!("{value} overflows an int")))?,
            )
        }
        Schema::Long => Datum::Long(decode_long(input)?),
        Schema::Float => {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(take(input, 4)?);
            Datum::Float(f32::from_le_bytes(bytes))
        }
        Schema::Double => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(take(input, 8)?);
            Datum::Double(f64::from_le_bytes(bytes))
        }
        Schema::Bytes => {
            let len = decode_len(input)?;
            Datum::Bytes(take(input, len)?.to_vec())
        }
        Schema::String => {
            let len = decode_len(input)?;
            let text = std::str::from_utf8(take(input, len)?)
                .map_err(|err| TapeError::validation(format!("invalid utf-8: {err}")))?;
            Datum::String(text.to_string())
        }
        Schema::Enum { name, symbols } => {
            let index = decode_long(input)?;
            let symbol = usize::try_from(index)
                .ok()
                .and_then(|i| symbols.get(i))
                .ok_or_else(|| {
                    TapeError::validation(format!("enum index {index} out of range for {name}"))
                })?;
            Datum::Enum(symbol.clone())
        }
        Schema::Array(items) => {
            let item_len = min_encoded_len(items);
            let mut values = Vec::new();
            loop {
                let count = decode_block_count(input, item_len)?;
                if item_len == 0 && values.len() + count > MAX_ZERO_WIDTH_ITEMS {
                    return Err(TapeError::validation("too many empty array items"));
                }
                if count == 0 {
                    break;
                }
                for _ in 0..count {
                    values.push(decode_datum(items, input)?);
                }
            }
            Datum::Array(values)
        }
        Schema::Map(schema) => {
            // Every entry carries at least its key length.
            let item_len = 1 + min_encoded_len(schema);
            let mut entries = BTreeMap::new();
            loop {
                let count = decode_block_count(input, item_len)?;
                if count == 0 {
                    break;
                }
                for _ in 0..count {
                    let len = decode_len(input)?;
                    let key = std::str::from_utf8(take(input, len)?)
                        .map_err(|err| TapeError::validation(format!("invalid map key: {err}")))?
                        .to_string();
                    entries.insert(key, decode_datum(schema, input)?);
                }
            }
            Datum::Map(entries)
        }
        Schema::Record { fields, .. } => {
            let mut values = Vec::with_capacity(fields.len());
            for field in fields {
                values.push((field.name.clone(), decode_datum(&field.schema, input)?));
            }
            Datum::Record(values)
        }
        Schema::Union(branches) => {
            let index = decode_long(input)?;
            let branch = usize::try_from(index)
                .ok()
                .and_then(|i| branches.get(i))
                .ok_or_else(|| TapeError::validation(format!("union index {index} out of range")))?;
            decode_datum(branch, input)?
        }
    })
}

impl Datum {
    fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::Bytes(_) => "bytes",
            Self::String(_) => "string",
            Self::Enum(_) => "enum",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Record(_) => "record",
        }
    }

    /// Looks up a record field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Datum> {
        match self {
            Self::Record(values) => values
                .iter()
                .find(|(field, _)| field == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    /// Plain JSON rendering for inspection output. Bytes become arrays of numbers.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Boolean(value) => json!(value),
            Self::Int(value) => json!(value),
            Self::Long(value) => json!(value),
            Self::Float(value) => json!(value),
            Self::Double(value) => json!(value),
            Self::Bytes(bytes) => json!(bytes),
            Self::String(text) | Self::Enum(text) => json!(text),
            Self::Array(values) => JsonValue::Array(values.iter().map(Datum::to_json).collect()),
            Self::Map(entries) => JsonValue::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Self::Record(values) => JsonValue::Object(
                values
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }

    /// Builds a datum for `schema` from plain JSON, the inverse of [`Datum::to_json`].
    pub fn from_json(schema: &Schema, value: &JsonValue) -> Result<Self> {
        let fail = || {
            TapeError::validation(format!(
                "JSON value {value} does not fit {}",
                schema.type_name()
            ))
        };
        Ok(match schema {
            Schema::Null if value.is_null() => Datum::Null,
            Schema::Boolean => Datum::Boolean(value.as_bool().ok_or_else(fail)?),
            Schema::Int => Datum::Int(
                value
                    .as_i64()
                    .and_then(|v| i32::try_from(v).ok())
                    .ok_or_else(fail)?,
            ),
            Schema::Long => Datum::Long(value.as_i64().ok_or_else(fail)?),
            Schema::Float => Datum::Float(value.as_f64().ok_or_else(fail)? as f32),
            Schema::Double => Datum::Double(value.as_f64().ok_or_else(fail)?),
            Schema::Bytes => match value {
                JsonValue::String(text) => Datum::Bytes(text.as_bytes().to_vec()),
                JsonValue::Array(items) => Datum::Bytes(
                    items
                        .iter()
                        .map(|item| {
                            item.as_u64()
                                .and_then(|b| u8::try_from(b).ok())
                                .ok_or_else(fail)
                        })
                        .collect::<Result<Vec<_>>>()?,
                ),
                _ => return Err(fail()),
            },
            Schema::String => Datum::String(value.as_str().ok_or_else(fail)?.to_string()),
            Schema::Enum { .. } => Datum::Enum(value.as_str().ok_or_else(fail)?.to_string()),
            Schema::Array(items) => Datum::Array(
                value
                    .as_array()
                    .ok_or_else(fail)?
                    .iter()
                    .map(|item| Datum::from_json(items, item))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Schema::Map(values) => Datum::Map(
                value
                    .as_object()
                    .ok_or_else(fail)?
                    .iter()
                    .map(|(key, item)| Ok((key.clone(), Datum::from_json(values, item)?)))
                    .collect::<Result<BTreeMap<_, _>>>()?,
            ),
            Schema::Record { fields, .. } => {
                let object = value.as_object().ok_or_else(fail)?;
                Datum::Record(
                    fields
                        .iter()
                        .map(|field| {
                            let item = object.get(&field.name).unwrap_or(&JsonValue::Null);
                            Ok((field.name.clone(), Datum::from_json(&field.schema, item)?))
                        })
                        .collect::<Result<Vec<_>>>()?,
                )
            }
            Schema::Union(branches) => branches
                .iter()
                .find_map(|branch| {
                    Datum::from_json(branch, value)
                        .ok()
                        .filter(|datum| branch.validate(datum).is_ok())
                })
                .ok_or_else(fail)?,
            Schema::Null => return Err(fail()),
        })
    }
}

//! Structural value codec.
//!
//! Step results are cached as `serde_json::Value`s and reconstructed as their
//! declared type on replay. [`Schema`] describes the closed set of types the
//! cache can hold; [`Structural`] ties a Rust type to its schema.
//!
//! Unions decode to the first candidate that validates, in declaration order.
//! `#[serde(untagged)]` enums pick by variant order instead, so [`decode`]
//! re-encodes its result and rejects a value whose union choices changed on
//! the way through. A union schema must list its candidates in the same order
//! as the enum's variants.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::engine::error::CodecError;

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
}

/// A codec-representable type.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    Integer,
    /// Accepts any JSON number.
    Real,
    String,
    Boolean,
    Null,
    /// A closed set of atomic values.
    Enum { name: String, values: Vec<Value> },
    /// Named, typed fields. Unknown fields are ignored; a missing field is
    /// accepted only when its schema accepts `null`.
    Record { name: String, fields: Vec<Field> },
    List(Box<Schema>),
    /// String-keyed map.
    Map(Box<Schema>),
    /// Ordered candidates, first match wins.
    Union(Vec<Schema>),
}

impl Schema {
    pub fn list(item: Schema) -> Self {
        Schema::List(Box::new(item))
    }

    pub fn map(value: Schema) -> Self {
        Schema::Map(Box::new(value))
    }

    pub fn union(candidates: impl IntoIterator<Item = Schema>) -> Self {
        Schema::Union(candidates.into_iter().collect())
    }

    /// `schema | null`
    pub fn optional(schema: Schema) -> Self {
        Schema::Union(vec![schema, Schema::Null])
    }

    pub fn enumeration<V: Into<Value>>(
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Schema::Enum {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn record<N: Into<String>>(
        name: impl Into<String>,
        fields: impl IntoIterator<Item = (N, Schema)>,
    ) -> Self {
        Schema::Record {
            name: name.into(),
            fields: fields
                .into_iter()
                .map(|(name, schema)| Field {
                    name: name.into(),
                    schema,
                })
                .collect(),
        }
    }

    /// Check that the schema itself is well formed: unions and enumerations
    /// are non-empty, enumeration values are distinct atoms, record fields are
    /// unique. At most one union candidate may accept `null`, otherwise
    /// nested optionals would collapse.
    pub fn check_well_formed(&self) -> Result<(), String> {
        match self {
            Schema::Integer | Schema::Real | Schema::String | Schema::Boolean | Schema::Null => {
                Ok(())
            }
            Schema::Enum { name, values } => {
                if values.is_empty() {
                    return Err(format!("enumeration {name} has no values"));
                }
                for (idx, value) in values.iter().enumerate() {
                    if value.is_array() || value.is_object() {
                        return Err(format!("enumeration {name} has non-atomic value {value}"));
                    }
                    if values[..idx].contains(value) {
                        return Err(format!("enumeration {name} repeats value {value}"));
                    }
                }
                Ok(())
            }
            Schema::Record { name, fields } => {
                let mut seen = HashSet::new();
                for field in fields {
                    if !seen.insert(field.name.as_str()) {
                        return Err(format!("record {name} repeats field `{}`", field.name));
                    }
                    field.schema.check_well_formed()?;
                }
                Ok(())
            }
            Schema::List(item) => item.check_well_formed(),
            Schema::Map(value) => value.check_well_formed(),
            Schema::Union(candidates) => {
                if candidates.is_empty() {
                    return Err("union has no candidate types".to_string());
                }
                candidates.iter().try_for_each(Schema::check_well_formed)?;
                let nullable = candidates.iter().filter(|c| c.accepts_null()).count();
                if nullable > 1 {
                    return Err(format!("union {self} has {nullable} candidates accepting null"));
                }
                Ok(())
            }
        }
    }

    /// Validate a transport value against this schema.
    pub fn validate(&self, value: &Value) -> Result<(), CodecError> {
        let mismatch = |reason: &str| Err(CodecError::new(value.clone(), self.to_string(), reason));
        match self {
            Schema::Integer => {
                if value.is_i64() || value.is_u64() {
                    Ok(())
                } else {
                    mismatch("expected an integer")
                }
            }
            Schema::Real => {
                if value.is_number() {
                    Ok(())
                } else {
                    mismatch("expected a number")
                }
            }
            Schema::String => {
                if value.is_string() {
                    Ok(())
                } else {
                    mismatch("expected a string")
                }
            }
            Schema::Boolean => {
                if value.is_boolean() {
                    Ok(())
                } else {
                    mismatch("expected a boolean")
                }
            }
            Schema::Null => {
                if value.is_null() {
                    Ok(())
                } else {
                    mismatch("expected null")
                }
            }
            Schema::Enum { values, .. } => {
                if values.contains(value) {
                    Ok(())
                } else {
                    mismatch("not a member of the enumeration")
                }
            }
            Schema::Record { fields, .. } => {
                let Some(object) = value.as_object() else {
                    return mismatch("expected an object");
                };
                for field in fields {
                    match object.get(&field.name) {
                        Some(inner) => field.schema.validate(inner)?,
                        None if field.schema.accepts_null() => {}
                        None => {
                            return Err(CodecError::new(
                                value.clone(),
                                self.to_string(),
                                format!("missing field `{}`", field.name),
                            ))
                        }
                    }
                }
                Ok(())
            }
            Schema::List(item) => {
                let Some(items) = value.as_array() else {
                    return mismatch("expected an array");
                };
                items.iter().try_for_each(|inner| item.validate(inner))
            }
            Schema::Map(inner_schema) => {
                let Some(object) = value.as_object() else {
                    return mismatch("expected an object");
                };
                object.values().try_for_each(|inner| inner_schema.validate(inner))
            }
            Schema::Union(_) => match self.matching_candidate(value) {
                Some(_) => Ok(()),
                None => mismatch("matches no candidate type"),
            },
        }
    }

    /// Index of the first union candidate accepting `value`.
    pub fn matching_candidate(&self, value: &Value) -> Option<usize> {
        match self {
            Schema::Union(candidates) => candidates
                .iter()
                .position(|candidate| candidate.validate(value).is_ok()),
            _ => None,
        }
    }

    /// Candidate indices chosen by every union inside `value`, in schema order.
    fn union_choices(&self, value: &Value, choices: &mut Vec<usize>) {
        static NULL: Value = Value::Null;
        match self {
            Schema::Record { fields, .. } => {
                if let Some(object) = value.as_object() {
                    for field in fields {
                        let inner = object.get(&field.name).unwrap_or(&NULL);
                        field.schema.union_choices(inner, choices);
                    }
                }
            }
            Schema::List(item) => {
                for inner in value.as_array().into_iter().flatten() {
                    item.union_choices(inner, choices);
                }
            }
            Schema::Map(inner_schema) => {
                if let Some(object) = value.as_object() {
                    let mut keys: Vec<&String> = object.keys().collect();
                    keys.sort();
                    for key in keys {
                        inner_schema.union_choices(&object[key.as_str()], choices);
                    }
                }
            }
            Schema::Union(candidates) => {
                if let Some(idx) = self.matching_candidate(value) {
                    choices.push(idx);
                    candidates[idx].union_choices(value, choices);
                }
            }
            _ => {}
        }
    }

    fn accepts_null(&self) -> bool {
        self.validate(&Value::Null).is_ok()
    }

    /// JSON-schema rendering, used for documentation.
    pub fn json_schema(&self) -> Value {
        match self {
            Schema::Integer => json!({ "type": "integer" }),
            Schema::Real => json!({ "type": "number" }),
            Schema::String => json!({ "type": "string" }),
            Schema::Boolean => json!({ "type": "boolean" }),
            Schema::Null => json!({ "type": "null" }),
            Schema::Enum { name, values } => json!({ "title": name, "enum": values }),
            Schema::Record { name, fields } => {
                let mut properties = Map::new();
                let mut required = Vec::new();
                for field in fields {
                    properties.insert(field.name.clone(), field.schema.json_schema());
                    if !field.schema.accepts_null() {
                        required.push(Value::String(field.name.clone()));
                    }
                }
                json!({
                    "title": name,
                    "type": "object",
                    "properties": properties,
                    "required": required,
                })
            }
            Schema::List(item) => json!({ "type": "array", "items": item.json_schema() }),
            Schema::Map(value) => json!({
                "type": "object",
                "additionalProperties": value.json_schema(),
            }),
            Schema::Union(candidates) => json!({
                "anyOf": candidates.iter().map(Schema::json_schema).collect::<Vec<_>>(),
            }),
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schema::Integer => f.write_str("integer"),
            Schema::Real => f.write_str("real"),
            Schema::String => f.write_str("string"),
            Schema::Boolean => f.write_str("boolean"),
            Schema::Null => f.write_str("null"),
            Schema::Enum { name, .. } | Schema::Record { name, .. } => f.write_str(name),
            Schema::List(item) => write!(f, "list[{item}]"),
            Schema::Map(value) => write!(f, "map[string, {value}]"),
            Schema::Union(candidates) => {
                for (idx, candidate) in candidates.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(" | ")?;
                    }
                    write!(f, "{candidate}")?;
                }
                Ok(())
            }
        }
    }
}

/// A Rust type the codec can carry.
///
/// Records and enumerations implement `schema()` by hand next to their serde
/// derives; unions are `#[serde(untagged)]` enums.
pub trait Structural: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn schema() -> Schema;
}

macro_rules! structural_atom {
    ($schema:expr => $($ty:ty),*) => {
        $(
            impl Structural for $ty {
                fn schema() -> Schema {
                    $schema
                }
            }
        )*
    };
}

structural_atom!(Schema::Integer => i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);
structural_atom!(Schema::Real => f32, f64);
structural_atom!(Schema::String => String);
structural_atom!(Schema::Boolean => bool);
structural_atom!(Schema::Null => ());

impl<T: Structural> Structural for Vec<T> {
    fn schema() -> Schema {
        Schema::list(T::schema())
    }
}

impl<T: Structural> Structural for BTreeMap<String, T> {
    fn schema() -> Schema {
        Schema::map(T::schema())
    }
}

impl<T: Structural> Structural for HashMap<String, T> {
    fn schema() -> Schema {
        Schema::map(T::schema())
    }
}

impl<T: Structural> Structural for Option<T> {
    fn schema() -> Schema {
        Schema::optional(T::schema())
    }
}

/// Encode `value` into its transport form, checking it against `schema`.
pub fn encode<T: Serialize + ?Sized>(schema: &Schema, value: &T) -> Result<Value, CodecError> {
    let encoded = serde_json::to_value(value)
        .map_err(|err| CodecError::new(Value::Null, schema.to_string(), err.to_string()))?;
    schema.validate(&encoded)?;
    Ok(encoded)
}

/// Decode a transport value as `T`, checking it against `schema` first.
///
/// Fails if `T` resolves any union to a different candidate than `schema`
/// does.
pub fn decode<T: Serialize + DeserializeOwned>(
    schema: &Schema,
    value: Value,
) -> Result<T, CodecError> {
    schema.validate(&value)?;
    let decoded: T = match serde_json::from_value(value.clone()) {
        Ok(decoded) => decoded,
        Err(err) => return Err(CodecError::new(value, schema.to_string(), err.to_string())),
    };
    let reencoded = match serde_json::to_value(&decoded) {
        Ok(reencoded) => reencoded,
        Err(err) => return Err(CodecError::new(value, schema.to_string(), err.to_string())),
    };

    let (mut expected, mut actual) = (Vec::new(), Vec::new());
    schema.union_choices(&value, &mut expected);
    schema.union_choices(&reencoded, &mut actual);
    if expected != actual {
        return Err(CodecError::new(
            value,
            schema.to_string(),
            "union candidate order disagrees with the Rust type",
        ));
    }
    Ok(decoded)
}

/// [`encode`] against the type's own schema.
pub fn encode_value<T: Structural>(value: &T) -> Result<Value, CodecError> {
    encode(&T::schema(), value)
}

/// [`decode`] against the type's own schema.
pub fn decode_value<T: Structural>(value: Value) -> Result<T, CodecError> {
    decode(&T::schema(), value)
}

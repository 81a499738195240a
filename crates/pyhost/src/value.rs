//! Host-native values and their conversion to and from Python objects.

use std::{collections::BTreeMap, fmt};

use base64::Engine as _;
use pyo3::{
    IntoPyObjectExt,
    prelude::*,
    types::{PyBool, PyBytes, PyDict, PyFloat, PyInt, PyList, PyString, PyTuple},
};
use serde::{
    Deserialize, Serialize,
    de::{DeserializeOwned, Visitor},
    ser::{SerializeMap, SerializeSeq},
};

use crate::error::{BridgeError, Result, describe_foreign};

/// Nesting limit for foreign containers; deeper structures are treated as
/// circular.
pub(crate) const MAX_DEPTH: usize = 128;

/// A value copied across the bridge.
///
/// Dict keys are strings and iteration follows key order, not insertion
/// order. Use [`Value::Bytes`] explicitly for binary data: `Vec<u8>` converts
/// to a list of integers.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

impl Value {
    /// Build a value from any serde-serializable host type.
    ///
    /// # Errors
    /// Returns [`BridgeError::ArgumentMarshal`] if the value has no
    /// representation (for example an unsigned integer above `i64::MAX`).
    pub fn from_serde<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let json = serde_json::to_value(value)
            .map_err(|e| BridgeError::argument(std::any::type_name::<T>(), e.to_string()))?;
        Self::from_json(json)
    }

    /// # Errors
    /// Returns [`BridgeError::ResultMarshal`] if the value does not fit `T`.
    pub fn to_serde<T: DeserializeOwned>(&self) -> Result<T> {
        let json =
            serde_json::to_value(self).map_err(|e| BridgeError::result(self.kind(), e.to_string()))?;
        T::deserialize(json).map_err(|e| BridgeError::result(self.kind(), e.to_string()))
    }

    /// # Errors
    /// Returns [`BridgeError::ArgumentMarshal`] for numbers outside `i64`/`f64`.
    pub fn from_json(json: serde_json::Value) -> Result<Self> {
        let shown = json.to_string();
        Self::deserialize(json).map_err(|e| BridgeError::argument(shown, e.to_string()))
    }

    /// Render as JSON; bytes become base64 strings.
    ///
    /// # Errors
    /// Returns [`BridgeError::ResultMarshal`] for non-finite floats.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            Self::None => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| BridgeError::result(f.to_string(), "not representable in JSON"))?,
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(b) => {
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            Self::List(items) | Self::Tuple(items) => serde_json::Value::Array(
                items.iter().map(Self::to_json).collect::<Result<_>>()?,
            ),
            Self::Dict(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
                    .collect::<Result<_>>()?,
            ),
        })
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
        }
    }

    pub(crate) fn to_foreign<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        match self {
            Self::None => Ok(py.None().into_bound(py)),
            Self::Bool(b) => b.into_bound_py_any(py),
            Self::Int(i) => i.into_bound_py_any(py),
            Self::Float(f) => f.into_bound_py_any(py),
            Self::Str(s) => s.as_str().into_bound_py_any(py),
            Self::Bytes(b) => Ok(PyBytes::new(py, b).into_any()),
            Self::List(items) => Ok(PyList::new(
                py,
                items
                    .iter()
                    .map(|v| v.to_foreign(py))
                    .collect::<PyResult<Vec<_>>>()?,
            )?
            .into_any()),
            Self::Tuple(items) => Ok(PyTuple::new(
                py,
                items
                    .iter()
                    .map(|v| v.to_foreign(py))
                    .collect::<PyResult<Vec<_>>>()?,
            )?
            .into_any()),
            Self::Dict(map) => {
                let dict = PyDict::new(py);
                for (k, v) in map {
                    dict.set_item(k, v.to_foreign(py)?)?;
                }
                Ok(dict.into_any())
            }
        }
    }

    pub(crate) fn from_foreign(obj: &Bound<'_, PyAny>) -> Result<Self> {
        Self::from_foreign_at(obj, 0)
    }

    fn from_foreign_at(obj: &Bound<'_, PyAny>, depth: usize) -> Result<Self> {
        if depth > MAX_DEPTH {
            return Err(BridgeError::result(
                describe_foreign(obj),
                "maximum nesting depth exceeded, possible circular reference",
            ));
        }
        let depth = depth + 1;

        if obj.is_none() {
            Ok(Self::None)
        } else if let Ok(b) = obj.cast::<PyBool>() {
            Ok(Self::Bool(b.is_true()))
        } else if obj.is_instance_of::<PyInt>() {
            obj.extract::<i64>()
                .map(Self::Int)
                .map_err(|_| BridgeError::result(describe_foreign(obj), "integer does not fit in i64"))
        } else if obj.is_instance_of::<PyFloat>() {
            obj.extract::<f64>()
                .map(Self::Float)
                .map_err(|_| BridgeError::result(describe_foreign(obj), "not a float"))
        } else if obj.is_instance_of::<PyString>() {
            obj.extract::<String>()
                .map(Self::Str)
                .map_err(|_| BridgeError::result(describe_foreign(obj), "string is not valid UTF-8"))
        } else if let Ok(b) = obj.cast::<PyBytes>() {
            Ok(Self::Bytes(b.as_bytes().to_vec()))
        } else if let Ok(list) = obj.cast::<PyList>() {
            list.iter()
                .map(|item| Self::from_foreign_at(&item, depth))
                .collect::<Result<_>>()
                .map(Self::List)
        } else if let Ok(tuple) = obj.cast::<PyTuple>() {
            tuple
                .iter()
                .map(|item| Self::from_foreign_at(&item, depth))
                .collect::<Result<_>>()
                .map(Self::Tuple)
        } else if let Ok(dict) = obj.cast::<PyDict>() {
            let mut map = BTreeMap::new();
            for (k, v) in dict.iter() {
                let Ok(key) = k.extract::<String>() else {
                    return Err(BridgeError::result(
                        describe_foreign(&k),
                        "dict keys must be strings",
                    ));
                };
                map.insert(key, Self::from_foreign_at(&v, depth)?);
            }
            Ok(Self::Dict(map))
        } else {
            Err(BridgeError::result(
                describe_foreign(obj),
                "no host representation; keep it as a ForeignValue",
            ))
        }
    }
}

macro_rules! value_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Self::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i8 => Int,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u8 => Int,
    u16 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    String => Str,
    &str => Str,
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Self::None
    }
}

impl<T: Into<Self>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::None, Into::into)
    }
}

impl<T: Into<Self>> From<BTreeMap<String, T>> for Value {
    fn from(v: BTreeMap<String, T>) -> Self {
        Self::Dict(v.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl TryFrom<u64> for Value {
    type Error = BridgeError;

    fn try_from(v: u64) -> Result<Self> {
        i64::try_from(v)
            .map(Self::Int)
            .map_err(|_| BridgeError::argument(v, "integer does not fit in i64"))
    }
}

impl TryFrom<usize> for Value {
    type Error = BridgeError;

    fn try_from(v: usize) -> Result<Self> {
        i64::try_from(v)
            .map(Self::Int)
            .map_err(|_| BridgeError::argument(v, "integer does not fit in i64"))
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::None => serializer.serialize_none(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::Str(s) => serializer.serialize_str(s),
            Self::Bytes(b) if serializer.is_human_readable() => {
                serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(b))
            }
            Self::Bytes(b) => serializer.serialize_bytes(b),
            Self::List(items) | Self::Tuple(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Dict(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a value representable on both sides of the bridge")
    }

    fn visit_bool<E: serde::de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_i128<E: serde::de::Error>(self, v: i128) -> Result<Value, E> {
        i64::try_from(v)
            .map(Value::Int)
            .map_err(|_| E::custom(format!("integer {v} does not fit in i64")))
    }

    fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Value, E> {
        i64::try_from(v)
            .map(Value::Int)
            .map_err(|_| E::custom(format!("integer {v} does not fit in i64")))
    }

    fn visit_u128<E: serde::de::Error>(self, v: u128) -> Result<Value, E> {
        i64::try_from(v)
            .map(Value::Int)
            .map_err(|_| E::custom(format!("integer {v} does not fit in i64")))
    }

    fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::Str(v.to_owned()))
    }

    fn visit_string<E: serde::de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::Str(v))
    }

    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Value, E> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Value, E> {
        Ok(Value::Bytes(v))
    }

    fn visit_none<E: serde::de::Error>(self) -> Result<Value, E> {
        Ok(Value::None)
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<Value, E> {
        Ok(Value::None)
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }

    fn visit_newtype_struct<D>(self, deserializer: D) -> Result<Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Value, A::Error>
    where
        A: serde::de::SeqAccess<'de>,
    {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn visit_map<A>(self, mut map: A) -> Result<Value, A::Error>
    where
        A: serde::de::MapAccess<'de>,
    {
        let mut entries = BTreeMap::new();
        while let Some((k, v)) = map.next_entry::<String, Value>()? {
            entries.insert(k, v);
        }
        Ok(Value::Dict(entries))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(ValueVisitor)
    }
}

/// Conversion of a [`Value`] received by a host function into a parameter
/// type.
pub trait FromValue: Sized {
    /// # Errors
    /// Returns [`BridgeError::ArgumentMarshal`] when the value has the wrong
    /// shape or does not fit.
    fn from_value(value: Value) -> Result<Self>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(BridgeError::argument(&other, "expected bool")),
        }
    }
}

macro_rules! int_from_value {
    ($($t:ty),*) => {
        $(
            impl FromValue for $t {
                fn from_value(value: Value) -> Result<Self> {
                    match value {
                        Value::Int(i) => <$t>::try_from(i).map_err(|_| {
                            BridgeError::argument(i, concat!("integer does not fit in ", stringify!($t)))
                        }),
                        other => Err(BridgeError::argument(&other, "expected int")),
                    }
                }
            }
        )*
    };
}

int_from_value!(i8, i16, i32, i64, u8, u16, u32, u64, usize);

impl FromValue for f64 {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Float(f) => Ok(f),
            // Every f64 in i64's range fits i128, so the comparison is exact.
            Value::Int(i) if (i as Self) as i128 == i128::from(i) => Ok(i as Self),
            other @ Value::Int(_) => Err(BridgeError::argument(
                &other,
                "integer is not exactly representable as f64",
            )),
            other => Err(BridgeError::argument(&other, "expected float")),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Str(s) => Ok(s),
            other => Err(BridgeError::argument(&other, "expected str")),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::List(items) | Value::Tuple(items) => {
                items.into_iter().map(T::from_value).collect()
            }
            other => Err(BridgeError::argument(&other, "expected list or tuple")),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::None => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

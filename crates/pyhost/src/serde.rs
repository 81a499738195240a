use pyo3::{
    Bound, IntoPyObjectExt, Py, PyAny, PyTypeInfo, Python,
    types::{
        PyAnyMethods, PyBytes, PyBytesMethods, PyDict, PyDictMethods, PyFloat, PyInt, PyList,
        PyListMethods, PyTuple, PyTupleMethods,
    },
};
use serde::{
    de::{DeserializeSeed, Visitor},
    ser::{SerializeMap, SerializeSeq},
};

use crate::value::MAX_DEPTH;

/// Builds Python objects from any serde data source.
pub struct ForeignSeed<'py> {
    py: Python<'py>,
}

impl<'py> ForeignSeed<'py> {
    pub const fn new(py: Python<'py>) -> Self {
        Self { py }
    }

    fn wrap<T, E>(&self, v: T) -> Result<Py<PyAny>, E>
    where
        T: pyo3::IntoPyObject<'py>,
        E: serde::de::Error,
    {
        v.into_py_any(self.py).map_err(E::custom)
    }
}

impl<'de> DeserializeSeed<'de> for &ForeignSeed<'_> {
    type Value = Py<PyAny>;

    fn deserialize<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for &ForeignSeed<'_> {
    type Value = Py<PyAny>;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a type that can deserialize in Python")
    }

    fn visit_bool<E: serde::de::Error>(self, v: bool) -> Result<Self::Value, E> {
        self.wrap(v)
    }

    fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
        self.wrap(v)
    }

    fn visit_i128<E: serde::de::Error>(self, v: i128) -> Result<Self::Value, E> {
        self.wrap(v)
    }

    fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
        self.wrap(v)
    }

    fn visit_u128<E: serde::de::Error>(self, v: u128) -> Result<Self::Value, E> {
        self.wrap(v)
    }

    fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E> {
        self.wrap(v)
    }

    fn visit_char<E: serde::de::Error>(self, v: char) -> Result<Self::Value, E> {
        self.wrap(v)
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
        self.wrap(v)
    }

    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        Ok(PyBytes::new(self.py, v).into_any().unbind())
    }

    fn visit_none<E: serde::de::Error>(self) -> Result<Self::Value, E> {
        Ok(self.py.None())
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
        Ok(self.py.None())
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        self.deserialize(deserializer)
    }

    fn visit_newtype_struct<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        self.deserialize(deserializer)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::SeqAccess<'de>,
    {
        let mut elems = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(elem) = seq.next_element_seed(self)? {
            elems.push(elem);
        }
        PyList::new(self.py, elems)
            .map(|l| l.into_any().unbind())
            .map_err(serde::de::Error::custom)
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::MapAccess<'de>,
    {
        let dict = PyDict::new(self.py);
        while let Some((key, value)) = map.next_entry_seed(self, self)? {
            dict.set_item(key, value).map_err(serde::de::Error::custom)?;
        }
        Ok(dict.into_any().unbind())
    }
}

/// Serializes a Python object graph of plain data.
pub struct ForeignSerializer<'a, 'py> {
    obj: &'a Bound<'py, PyAny>,
    depth: usize,
}

impl<'a, 'py> ForeignSerializer<'a, 'py> {
    pub const fn new(obj: &'a Bound<'py, PyAny>) -> Self {
        Self { obj, depth: 0 }
    }

    const fn nested(obj: &'a Bound<'py, PyAny>, depth: usize) -> Self {
        Self { obj, depth }
    }
}

impl serde::Serialize for ForeignSerializer<'_, '_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let depth = self.depth + 1;
        if self.depth > MAX_DEPTH {
            return Err(serde::ser::Error::custom(
                "maximum serialization depth exceeded, possible circular reference",
            ));
        }

        let obj = self.obj;
        if let Ok(dict) = obj.cast_exact::<PyDict>() {
            let mut map = serializer.serialize_map(Some(dict.len()))?;
            for (key, value) in dict {
                map.serialize_entry(
                    &ForeignSerializer::nested(&key, depth),
                    &ForeignSerializer::nested(&value, depth),
                )?;
            }
            map.end()
        } else if let Ok(list) = obj.cast_exact::<PyList>() {
            let mut seq = serializer.serialize_seq(Some(list.len()))?;
            for elem in list {
                seq.serialize_element(&ForeignSerializer::nested(&elem, depth))?;
            }
            seq.end()
        } else if let Ok(tuple) = obj.cast_exact::<PyTuple>() {
            let mut seq = serializer.serialize_seq(Some(tuple.len()))?;
            for elem in tuple {
                seq.serialize_element(&ForeignSerializer::nested(&elem, depth))?;
            }
            seq.end()
        } else if let Ok(s) = obj.extract::<String>() {
            serializer.serialize_str(&s)
        } else if let Ok(b) = obj.cast_exact::<PyBytes>() {
            serializer.serialize_bytes(b.as_bytes())
        } else if let Ok(b) = obj.extract::<bool>() {
            serializer.serialize_bool(b)
        } else if obj.is_none() {
            serializer.serialize_none()
        } else if PyFloat::is_exact_type_of(obj) {
            obj.extract::<f64>().map_or_else(
                |_| {
                    Err(serde::ser::Error::custom(format!(
                        "object of type '{}' does not fit into a float",
                        obj.get_type()
                    )))
                },
                |f| serializer.serialize_f64(f),
            )
        } else if PyInt::is_exact_type_of(obj) {
            if let Ok(i) = obj.extract::<i64>() {
                serializer.serialize_i64(i)
            } else if let Ok(i) = obj.extract::<u64>() {
                serializer.serialize_u64(i)
            } else {
                Err(serde::ser::Error::custom(format!(
                    "object of type '{}' does not fit into an integer",
                    obj.get_type()
                )))
            }
        } else {
            Err(serde::ser::Error::custom(format!(
                "object of type '{}' is not serializable",
                obj.get_type()
            )))
        }
    }
}

/// Keyword arguments of a script log call, rendered as structured fields.
pub struct LogFields<'a, 'py> {
    dict: &'a Bound<'py, PyDict>,
}

impl<'a, 'py> LogFields<'a, 'py> {
    pub const fn new(dict: &'a Bound<'py, PyDict>) -> Self {
        Self { dict }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl serde::Serialize for LogFields<'_, '_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.dict.len()))?;
        for (key, value) in self.dict {
            let value = if value.is_callable() {
                value.call0().map_err(serde::ser::Error::custom)?
            } else {
                value
            };
            map.serialize_entry(
                &ForeignSerializer::new(&key),
                &ForeignSerializer::new(&value),
            )?;
        }
        map.end()
    }
}

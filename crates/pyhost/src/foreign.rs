//! Handles to live Python objects.

use std::fmt;

use pyo3::{
    exceptions::PyAttributeError,
    intern,
    prelude::*,
    types::{PyBool, PyDict, PyFloat, PyInt, PyList, PyModule, PyString, PyTuple, PyType},
};
use serde::{
    Serialize,
    de::{DeserializeOwned, DeserializeSeed},
};
use tracing::debug;

use crate::{
    args::{ArgValue, Args},
    error::{BridgeError, ForeignResultExt, Result, describe_foreign},
    runtime::Bridge,
    serde::{ForeignSeed, ForeignSerializer},
    value::Value,
};

impl<'py> Bridge<'py> {
    /// Copy a host value into a new Python object.
    ///
    /// # Errors
    /// Returns [`BridgeError::ForeignException`] if the interpreter cannot
    /// allocate the object.
    pub fn to_foreign(&self, value: impl Into<Value>) -> Result<ForeignValue<'py>> {
        let py = self.py();
        value
            .into()
            .to_foreign(py)
            .foreign(py)
            .map(|obj| self.wrap(obj))
    }

    /// Build a Python object from any serde-serializable host value.
    ///
    /// # Errors
    /// Returns [`BridgeError::ArgumentMarshal`] if `value` fails to
    /// serialize.
    pub fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<ForeignValue<'py>> {
        let py = self.py();
        let json = serde_json::to_value(value)
            .map_err(|e| BridgeError::argument(std::any::type_name::<T>(), e.to_string()))?;
        let obj = DeserializeSeed::deserialize(&ForeignSeed::new(py), json)
            .map_err(|e| BridgeError::argument(std::any::type_name::<T>(), e.to_string()))?;
        Ok(self.wrap(obj.into_bound(py)))
    }
}

/// A Python object, valid for the duration of one [`Runtime::enter`] call.
///
/// [`Runtime::enter`]: crate::Runtime::enter
#[derive(Clone)]
pub struct ForeignValue<'py> {
    obj: Bound<'py, PyAny>,
    generation: u64,
}

impl<'py> ForeignValue<'py> {
    pub(crate) const fn new(obj: Bound<'py, PyAny>, generation: u64) -> Self {
        Self { obj, generation }
    }

    fn wrap(&self, obj: Bound<'py, PyAny>) -> Self {
        Self::new(obj, self.generation)
    }

    #[must_use]
    pub fn py(&self) -> Python<'py> {
        self.obj.py()
    }

    #[must_use]
    pub const fn as_bound(&self) -> &Bound<'py, PyAny> {
        &self.obj
    }

    #[must_use]
    pub fn into_bound(self) -> Bound<'py, PyAny> {
        self.obj
    }

    /// # Errors
    /// Returns [`BridgeError::AttributeNotFound`] if the object has no such
    /// attribute, or [`BridgeError::ForeignException`] if the lookup raised
    /// anything else.
    pub fn attr(&self, name: &str) -> Result<Self> {
        let py = self.py();
        match self.obj.getattr(name) {
            Ok(v) => Ok(self.wrap(v)),
            Err(e)
                if e.is_instance_of::<PyAttributeError>(py) && names_absent(&e, &self.obj, name) =>
            {
                Err(BridgeError::AttributeNotFound {
                    object: describe_foreign(&self.obj),
                    name: name.to_owned(),
                })
            }
            Err(e) => Err(BridgeError::from_pyerr(py, e)),
        }
    }

    #[must_use]
    pub fn has_attr(&self, name: &str) -> bool {
        self.obj.hasattr(name).unwrap_or(false)
    }

    /// # Errors
    /// Returns [`BridgeError::ArgumentMarshal`] if `value` cannot be
    /// converted, or [`BridgeError::ForeignException`] if assignment raised.
    pub fn set_attr(&self, name: &str, value: impl Into<ArgValue<'py>>) -> Result<()> {
        let py = self.py();
        let value = value.into().into_foreign(py)?;
        self.obj.setattr(name, value).foreign(py)
    }

    /// Call the object with positional and keyword arguments.
    ///
    /// # Errors
    /// Returns [`BridgeError::ArgumentMarshal`] for arguments that cannot be
    /// marshalled, or [`BridgeError::ForeignException`] if the call raised.
    pub fn call(&self, args: Args<'py>) -> Result<Self> {
        let py = self.py();
        let (positional, named) = args.marshal(py)?;
        debug!(callee = %describe_foreign(&self.obj), "calling foreign object");
        self.obj
            .call(positional, named.as_ref())
            .foreign(py)
            .map(|v| self.wrap(v))
    }

    /// # Errors
    /// Returns [`BridgeError::ForeignException`] if the call raised.
    pub fn call0(&self) -> Result<Self> {
        let py = self.py();
        self.obj.call0().foreign(py).map(|v| self.wrap(v))
    }

    /// Look up `name` and call it.
    ///
    /// # Errors
    /// As for [`ForeignValue::attr`] followed by [`ForeignValue::call`].
    pub fn call_method(&self, name: &str, args: Args<'py>) -> Result<Self> {
        self.attr(name)?.call(args)
    }

    /// Copy the object into a host [`Value`].
    ///
    /// # Errors
    /// Returns [`BridgeError::ResultMarshal`] if the object (or something it
    /// contains) has no host representation.
    pub fn to_value(&self) -> Result<Value> {
        Value::from_foreign(&self.obj)
    }

    /// # Errors
    /// Returns [`BridgeError::ResultMarshal`] if the object does not fit `T`.
    pub fn extract<T: FromForeign>(&self) -> Result<T> {
        T::from_foreign(&self.obj)
    }

    /// Deserialize plain data (dicts, lists, scalars) into `T`.
    ///
    /// # Errors
    /// Returns [`BridgeError::ResultMarshal`] if the object is not plain data
    /// or does not match `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        let json = serde_json::to_value(ForeignSerializer::new(&self.obj))
            .map_err(|e| BridgeError::result(describe_foreign(&self.obj), e.to_string()))?;
        T::deserialize(json)
            .map_err(|e| BridgeError::result(describe_foreign(&self.obj), e.to_string()))
    }

    /// Turn the handle into one that can be stored across `enter` calls.
    #[must_use]
    pub fn detach(self) -> Detached {
        Detached {
            obj: self.obj.unbind(),
            generation: self.generation,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ForeignKind {
        ForeignKind::of(&self.obj)
    }

    /// Identity comparison (`a is b`).
    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        self.obj.is(&other.obj)
    }

    #[must_use]
    pub fn repr(&self) -> String {
        self.obj
            .repr()
            .map_or_else(|_| describe_foreign(&self.obj), |r| r.to_string())
    }
}

/// Whether an `AttributeError` from `obj.name` means `name` itself is missing,
/// as opposed to one escaping a property getter or `__getattr__`.
fn names_absent(err: &PyErr, obj: &Bound<'_, PyAny>, name: &str) -> bool {
    let py = obj.py();
    let value = err.value(py);
    // 3.10+ tags the error with the innermost failed lookup.
    let failed = value
        .getattr(intern!(py, "name"))
        .ok()
        .filter(|failed| !failed.is_none());
    if let Some(failed) = failed {
        let same_name = failed.extract::<String>().is_ok_and(|n| n == name);
        let same_obj = value
            .getattr(intern!(py, "obj"))
            .is_ok_and(|o| o.is(obj));
        if !(same_name && same_obj) {
            return false;
        }
    }
    // A descriptor on the type raised it, so the attribute exists.
    !obj.get_type().hasattr(name).unwrap_or(false)
}

impl fmt::Debug for ForeignValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ForeignValue")
            .field(&describe_foreign(&self.obj))
            .finish()
    }
}

/// A [`ForeignValue`] stored outside of an `enter` scope.
///
/// Stamped with the session it came from; [`Bridge::attach`] rejects it once
/// that session has been released.
///
/// [`Bridge::attach`]: crate::Bridge::attach
pub struct Detached {
    pub(crate) obj: Py<PyAny>,
    pub(crate) generation: u64,
}

impl Detached {
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for Detached {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detached")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Coarse classification of a foreign object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignKind {
    None,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List,
    Tuple,
    Dict,
    Module,
    Class,
    Callable,
    Object,
}

impl ForeignKind {
    fn of(obj: &Bound<'_, PyAny>) -> Self {
        if obj.is_none() {
            Self::None
        } else if obj.is_instance_of::<PyBool>() {
            Self::Bool
        } else if obj.is_instance_of::<PyInt>() {
            Self::Int
        } else if obj.is_instance_of::<PyFloat>() {
            Self::Float
        } else if obj.is_instance_of::<PyString>() {
            Self::Str
        } else if obj.is_instance_of::<pyo3::types::PyBytes>() {
            Self::Bytes
        } else if obj.is_instance_of::<PyList>() {
            Self::List
        } else if obj.is_instance_of::<PyTuple>() {
            Self::Tuple
        } else if obj.is_instance_of::<PyDict>() {
            Self::Dict
        } else if obj.is_instance_of::<PyModule>() {
            Self::Module
        } else if obj.is_instance_of::<PyType>() {
            Self::Class
        } else if obj.is_callable() {
            Self::Callable
        } else {
            Self::Object
        }
    }
}

/// Typed conversion out of a foreign object. Never truncates or wraps.
pub trait FromForeign: Sized {
    /// # Errors
    /// Returns [`BridgeError::ResultMarshal`] if the object does not fit.
    fn from_foreign(obj: &Bound<'_, PyAny>) -> Result<Self>;
}

impl FromForeign for Value {
    fn from_foreign(obj: &Bound<'_, PyAny>) -> Result<Self> {
        Self::from_foreign(obj)
    }
}

macro_rules! int_from_foreign {
    ($($t:ty),*) => {
        $(
            impl FromForeign for $t {
                fn from_foreign(obj: &Bound<'_, PyAny>) -> Result<Self> {
                    if !obj.is_instance_of::<PyInt>() || obj.is_instance_of::<PyBool>() {
                        return Err(BridgeError::result(describe_foreign(obj), "expected int"));
                    }
                    obj.extract::<$t>().map_err(|_| {
                        BridgeError::result(
                            describe_foreign(obj),
                            concat!("integer does not fit in ", stringify!($t)),
                        )
                    })
                }
            }
        )*
    };
}

int_from_foreign!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);

impl FromForeign for f64 {
    fn from_foreign(obj: &Bound<'_, PyAny>) -> Result<Self> {
        if obj.is_instance_of::<PyBool>()
            || !(obj.is_instance_of::<PyFloat>() || obj.is_instance_of::<PyInt>())
        {
            return Err(BridgeError::result(describe_foreign(obj), "expected float"));
        }
        let v = obj
            .extract::<Self>()
            .map_err(|_| BridgeError::result(describe_foreign(obj), "number does not fit in f64"))?;
        // int == float compares exactly in Python, so this rejects rounded ints.
        if obj.is_instance_of::<PyInt>() && !obj.eq(v).unwrap_or(false) {
            return Err(BridgeError::result(
                describe_foreign(obj),
                "integer is not exactly representable as f64",
            ));
        }
        Ok(v)
    }
}

impl FromForeign for f32 {
    #[allow(clippy::cast_possible_truncation)]
    fn from_foreign(obj: &Bound<'_, PyAny>) -> Result<Self> {
        let v = f64::from_foreign(obj)?;
        if v.is_finite() && v.abs() > f64::from(Self::MAX) {
            return Err(BridgeError::result(
                describe_foreign(obj),
                "float outside the range of f32",
            ));
        }
        Ok(v as Self)
    }
}

impl FromForeign for bool {
    fn from_foreign(obj: &Bound<'_, PyAny>) -> Result<Self> {
        obj.cast::<PyBool>()
            .map(|b| b.is_true())
            .map_err(|_| BridgeError::result(describe_foreign(obj), "expected bool"))
    }
}

impl FromForeign for String {
    fn from_foreign(obj: &Bound<'_, PyAny>) -> Result<Self> {
        if !obj.is_instance_of::<PyString>() {
            return Err(BridgeError::result(describe_foreign(obj), "expected str"));
        }
        obj.extract::<Self>()
            .map_err(|_| BridgeError::result(describe_foreign(obj), "string is not valid UTF-8"))
    }
}

impl<T: FromForeign> FromForeign for Vec<T> {
    fn from_foreign(obj: &Bound<'_, PyAny>) -> Result<Self> {
        if let Ok(list) = obj.cast::<PyList>() {
            list.iter().map(|item| T::from_foreign(&item)).collect()
        } else if let Ok(tuple) = obj.cast::<PyTuple>() {
            tuple.iter().map(|item| T::from_foreign(&item)).collect()
        } else {
            Err(BridgeError::result(
                describe_foreign(obj),
                "expected list or tuple",
            ))
        }
    }
}

impl<T: FromForeign> FromForeign for Option<T> {
    fn from_foreign(obj: &Bound<'_, PyAny>) -> Result<Self> {
        if obj.is_none() {
            Ok(None)
        } else {
            T::from_foreign(obj).map(Some)
        }
    }
}

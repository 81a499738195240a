//! Call arguments.

use pyo3::{
    prelude::*,
    types::{PyDict, PyTuple},
};
use smallvec::SmallVec;

use crate::{
    error::{BridgeError, ForeignResultExt, Result},
    foreign::ForeignValue,
    value::Value,
};

/// An argument value: copied from the host, or an existing Python object
/// passed through unchanged.
pub enum ArgValue<'py> {
    Host(Value),
    Foreign(Bound<'py, PyAny>),
}

impl<'py> ArgValue<'py> {
    pub(crate) fn into_foreign(self, py: Python<'py>) -> Result<Bound<'py, PyAny>> {
        match self {
            Self::Host(value) => value.to_foreign(py).foreign(py),
            Self::Foreign(obj) => Ok(obj),
        }
    }
}

impl core::fmt::Debug for ArgValue<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Host(value) => f.debug_tuple("Host").field(value).finish(),
            Self::Foreign(obj) => f
                .debug_tuple("Foreign")
                .field(&crate::error::describe_foreign(obj))
                .finish(),
        }
    }
}

impl From<Value> for ArgValue<'_> {
    fn from(value: Value) -> Self {
        Self::Host(value)
    }
}

impl<'py> From<ForeignValue<'py>> for ArgValue<'py> {
    fn from(value: ForeignValue<'py>) -> Self {
        Self::Foreign(value.into_bound())
    }
}

impl<'py> From<&ForeignValue<'py>> for ArgValue<'py> {
    fn from(value: &ForeignValue<'py>) -> Self {
        Self::Foreign(value.as_bound().clone())
    }
}

impl<'py> From<Bound<'py, PyAny>> for ArgValue<'py> {
    fn from(value: Bound<'py, PyAny>) -> Self {
        Self::Foreign(value)
    }
}

macro_rules! host_arg_from {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for ArgValue<'_> {
                fn from(v: $t) -> Self {
                    Self::Host(Value::from(v))
                }
            }
        )*
    };
}

host_arg_from!(
    (),
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    f32,
    f64,
    String,
    &str,
);

impl<T: Into<Value>> From<Vec<T>> for ArgValue<'_> {
    fn from(v: Vec<T>) -> Self {
        Self::Host(Value::from(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for ArgValue<'_> {
    fn from(v: Option<T>) -> Self {
        Self::Host(Value::from(v))
    }
}

#[derive(Debug)]
pub enum Arg<'py> {
    Positional(ArgValue<'py>),
    Named(String, ArgValue<'py>),
}

/// Positional and keyword arguments for one call.
///
/// Positional order is preserved. Keyword names must be unique, valid Python
/// identifiers; they are checked when the call is made. The order in which
/// keywords reach the callee is not guaranteed.
#[derive(Debug, Default)]
pub struct Args<'py> {
    items: SmallVec<[Arg<'py>; 4]>,
}

impl<'py> Args<'py> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn arg(mut self, value: impl Into<ArgValue<'py>>) -> Self {
        self.items.push(Arg::Positional(value.into()));
        self
    }

    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<ArgValue<'py>>) -> Self {
        self.items.push(Arg::Named(name.into(), value.into()));
        self
    }

    pub fn push(&mut self, arg: Arg<'py>) {
        self.items.push(arg);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arg<'py>> {
        self.items.iter()
    }

    pub(crate) fn marshal(
        self,
        py: Python<'py>,
    ) -> Result<(Bound<'py, PyTuple>, Option<Bound<'py, PyDict>>)> {
        let mut positional = Vec::with_capacity(self.items.len());
        let mut named: Option<Bound<'py, PyDict>> = None;
        for arg in self.items {
            match arg {
                Arg::Positional(value) => positional.push(value.into_foreign(py)?),
                Arg::Named(name, value) => {
                    if !is_identifier(&name) {
                        return Err(BridgeError::argument(
                            &name,
                            "keyword is not a valid identifier",
                        ));
                    }
                    let dict = named.get_or_insert_with(|| PyDict::new(py));
                    if dict.contains(&name).foreign(py)? {
                        return Err(BridgeError::argument(&name, "duplicate keyword argument"));
                    }
                    dict.set_item(&name, value.into_foreign(py)?).foreign(py)?;
                }
            }
        }
        Ok((PyTuple::new(py, positional).foreign(py)?, named))
    }
}

impl<'py, const N: usize> From<[Arg<'py>; N]> for Args<'py> {
    fn from(items: [Arg<'py>; N]) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }
}

impl<'py> FromIterator<Arg<'py>> for Args<'py> {
    fn from_iter<I: IntoIterator<Item = Arg<'py>>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<'py> Extend<Arg<'py>> for Args<'py> {
    fn extend<I: IntoIterator<Item = Arg<'py>>>(&mut self, iter: I) {
        self.items.extend(iter);
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c == '_' || c.is_alphabetic())
        && chars.all(|c| c == '_' || c.is_alphanumeric())
}

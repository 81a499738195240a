//! Modules implemented by the host and registered with the interpreter at
//! run time.

use std::{
    collections::BTreeMap,
    ffi::{CStr, CString},
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use parking_lot::Mutex;
use pyo3::{
    PyClass,
    exceptions::{PyRuntimeError, PyTypeError},
    intern,
    prelude::*,
    types::{PyCFunction, PyDict, PyList, PyModule, PyTuple},
};
use tracing::debug;

use crate::{
    error::{BridgeError, ForeignResultExt, Result},
    foreign::ForeignValue,
    runtime::Bridge,
    value::{FromValue, Value},
};

/// Why a host function call did not produce a value.
pub enum HostError {
    /// The arguments did not fit the parameters; raised as `TypeError`.
    Argument(BridgeError),
    /// The function itself failed; raised as `RuntimeError`.
    Failed(String),
}

/// A value a host function can hand back to Python.
pub trait HostReturn {
    /// # Errors
    /// Returns a message raised in Python as `RuntimeError`.
    fn into_host_result(self) -> core::result::Result<Value, String>;
}

macro_rules! host_return_value {
    ($($t:ty),* $(,)?) => {
        $(
            impl HostReturn for $t {
                fn into_host_result(self) -> core::result::Result<Value, String> {
                    Ok(Value::from(self))
                }
            }
        )*
    };
}

host_return_value!(
    Value,
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
    &'static str,
);

impl HostReturn for u64 {
    fn into_host_result(self) -> core::result::Result<Value, String> {
        Value::try_from(self).map_err(|e| e.to_string())
    }
}

impl HostReturn for usize {
    fn into_host_result(self) -> core::result::Result<Value, String> {
        Value::try_from(self).map_err(|e| e.to_string())
    }
}

impl<T: Into<Value>> HostReturn for Vec<T> {
    fn into_host_result(self) -> core::result::Result<Value, String> {
        Ok(Value::from(self))
    }
}

impl<T: Into<Value>> HostReturn for Option<T> {
    fn into_host_result(self) -> core::result::Result<Value, String> {
        Ok(Value::from(self))
    }
}

impl<T: Into<Value>> HostReturn for BTreeMap<String, T> {
    fn into_host_result(self) -> core::result::Result<Value, String> {
        Ok(Value::from(self))
    }
}

impl<T: HostReturn, E: fmt::Display> HostReturn for core::result::Result<T, E> {
    fn into_host_result(self) -> core::result::Result<Value, String> {
        self.map_err(|e| e.to_string())?.into_host_result()
    }
}

/// A host closure callable from Python with a fixed number of positional
/// arguments. Implemented for closures of zero to four parameters.
pub trait HostFunction<Marker>: Send + Sync + 'static {
    fn arity(&self) -> usize;

    /// # Errors
    /// See [`HostError`].
    fn invoke(&self, args: Vec<Value>) -> core::result::Result<Value, HostError>;
}

macro_rules! host_function {
    ($($param:ident),*) => {
        impl<F, R, $($param,)*> HostFunction<($($param,)*)> for F
        where
            F: Fn($($param),*) -> R + Send + Sync + 'static,
            R: HostReturn,
            $($param: FromValue,)*
        {
            fn arity(&self) -> usize {
                <[&str]>::len(&[$(stringify!($param)),*])
            }

            #[allow(non_snake_case, unused_variables, unused_mut)]
            fn invoke(&self, args: Vec<Value>) -> core::result::Result<Value, HostError> {
                let mut args = args.into_iter();
                $(
                    let $param = $param::from_value(args.next().unwrap_or_default())
                        .map_err(HostError::Argument)?;
                )*
                (self)($($param),*).into_host_result().map_err(HostError::Failed)
            }
        }
    };
}

host_function!();
host_function!(A);
host_function!(A, B);
host_function!(A, B, C);
host_function!(A, B, C, D);

type Invoke = dyn Fn(Vec<Value>) -> core::result::Result<Value, HostError> + Send + Sync;
type Init = for<'py> fn(Python<'py>) -> PyResult<Bound<'py, PyModule>>;
type AddClass = Box<dyn Fn(&Bound<'_, PyModule>) -> PyResult<()> + Send + Sync>;

struct Function {
    name: String,
    arity: usize,
    invoke: Arc<Invoke>,
}

/// A module assembled from host closures, classes and constants.
///
/// ```ignore
/// let module = SyntheticModule::new("rust_module")
///     .function("minus", |a: i64, b: i64| a - b)
///     .class::<Calculator>();
/// ```
pub struct SyntheticModule {
    name: String,
    init: Option<Init>,
    functions: Vec<Function>,
    classes: Vec<AddClass>,
    constants: Vec<(String, Value)>,
}

impl SyntheticModule {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            init: None,
            functions: Vec::new(),
            classes: Vec::new(),
            constants: Vec::new(),
        }
    }

    /// Start from a module built by `init`, typically one holding
    /// `#[pyfunction]`s.
    #[must_use]
    pub fn native(name: impl Into<String>, init: Init) -> Self {
        Self {
            init: Some(init),
            ..Self::new(name)
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn function<M, F: HostFunction<M>>(mut self, name: impl Into<String>, f: F) -> Self {
        let arity = f.arity();
        self.functions.push(Function {
            name: name.into(),
            arity,
            invoke: Arc::new(move |args: Vec<Value>| f.invoke(args)),
        });
        self
    }

    /// Expose a host `#[pyclass]` under its Python name.
    #[must_use]
    pub fn class<T: PyClass + 'static>(mut self) -> Self {
        self.classes
            .push(Box::new(|m: &Bound<'_, PyModule>| m.add_class::<T>()));
        self
    }

    #[must_use]
    pub fn constant(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constants.push((name.into(), value.into()));
        self
    }

    fn build<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyModule>> {
        let module = match self.init {
            Some(init) => init(py)?,
            None => PyModule::new(py, &self.name)?,
        };
        for function in &self.functions {
            module.add(function.name.as_str(), function.to_callable(py)?)?;
        }
        for (name, value) in &self.constants {
            module.add(name.as_str(), value.to_foreign(py)?)?;
        }
        for add_class in &self.classes {
            add_class(&module)?;
        }
        Ok(module)
    }
}

impl fmt::Debug for SyntheticModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyntheticModule")
            .field("name", &self.name)
            .field(
                "functions",
                &self.functions.iter().map(|f| &f.name).collect::<Vec<_>>(),
            )
            .field("classes", &self.classes.len())
            .finish_non_exhaustive()
    }
}

impl Function {
    fn to_callable<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyCFunction>> {
        let name = self.name.clone();
        let arity = self.arity;
        let invoke = Arc::clone(&self.invoke);
        PyCFunction::new_closure(
            py,
            Some(intern_name(&self.name)?),
            None,
            move |args: &Bound<'_, PyTuple>,
                  kwargs: Option<&Bound<'_, PyDict>>|
                  -> PyResult<Py<PyAny>> {
                let py = args.py();
                if kwargs.is_some_and(|k| !k.is_empty()) {
                    return Err(PyTypeError::new_err(format!(
                        "{name}() takes no keyword arguments"
                    )));
                }
                if args.len() != arity {
                    return Err(PyTypeError::new_err(format!(
                        "{name}() takes {arity} positional argument(s) but {} were given",
                        args.len()
                    )));
                }
                let values = args
                    .iter()
                    .map(|a| Value::from_foreign(&a))
                    .collect::<Result<Vec<_>>>()
                    .map_err(|e| PyTypeError::new_err(format!("{name}(): {e}")))?;

                match catch_unwind(AssertUnwindSafe(|| invoke(values))) {
                    Ok(Ok(value)) => value.to_foreign(py).map(Bound::unbind),
                    Ok(Err(HostError::Argument(e))) => {
                        Err(PyTypeError::new_err(format!("{name}(): {e}")))
                    }
                    Ok(Err(HostError::Failed(message))) => Err(PyRuntimeError::new_err(message)),
                    Err(payload) => Err(PyRuntimeError::new_err(format!(
                        "host function {name}() panicked: {}",
                        panic_message(payload.as_ref())
                    ))),
                }
            },
        )
    }
}

/// Function names handed to the interpreter must be `'static`; each distinct
/// name is allocated once per process.
fn intern_name(name: &str) -> PyResult<&'static CStr> {
    static NAMES: Mutex<BTreeMap<String, &'static CStr>> = Mutex::new(BTreeMap::new());

    let mut names = NAMES.lock();
    if let Some(interned) = names.get(name) {
        return Ok(interned);
    }
    let owned = CString::new(name)
        .map_err(|_| PyTypeError::new_err("function name contains a NUL byte"))?;
    let interned: &'static CStr = Box::leak(owned.into_boxed_c_str());
    names.insert(name.to_owned(), interned);
    Ok(interned)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn is_module_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|c| c == '_' || c.is_alphabetic())
                && chars.all(|c| c == '_' || c.is_alphanumeric())
        })
}

impl<'py> Bridge<'py> {
    /// Insert `module` into `sys.modules` so that Python code can import it.
    /// It is removed again when the session ends.
    ///
    /// # Errors
    /// Returns [`BridgeError::Registration`] if the name is invalid, already
    /// registered or already imported.
    pub fn register_module(&self, module: SyntheticModule) -> Result<ForeignValue<'py>> {
        let py = self.py();
        let name = module.name.clone();
        let conflict = |reason: &str| BridgeError::Registration {
            name: name.clone(),
            reason: reason.to_owned(),
        };
        if !is_module_name(&name) {
            return Err(conflict("not a valid module name"));
        }
        if self.session().owned.contains(&name) {
            return Err(conflict("already registered in this session"));
        }
        let modules = self.sys_modules()?;
        if modules.contains(&name).foreign(py)? {
            return Err(conflict("a module with this name is already imported"));
        }
        let parents: Vec<&str> = name.match_indices('.').map(|(end, _)| &name[..end]).collect();
        for parent in &parents {
            let owned = self.session().owned.iter().any(|o| o == parent);
            if !owned && modules.contains(*parent).foreign(py)? {
                return Err(conflict(&format!(
                    "parent module '{parent}' was not registered in this session"
                )));
            }
        }

        let built = module
            .build(py)
            .map_err(|e| conflict(&BridgeError::from_pyerr(py, e).to_string()))?
            .into_any();
        let mut outer: Option<Bound<'py, PyAny>> = None;
        for parent in parents {
            let package = self.synthetic_package(&modules, parent)?;
            if let Some(outer) = &outer {
                outer.setattr(last_segment(parent), &package).foreign(py)?;
            }
            outer = Some(package);
        }
        if let Some(outer) = &outer {
            outer.setattr(last_segment(&name), &built).foreign(py)?;
        }
        modules.set_item(&name, &built).foreign(py)?;
        {
            let mut session = self.session();
            session.owned.push(name.clone());
            session.modules.insert(name.clone(), built.clone().unbind());
        }
        debug!(module = %name, functions = module.functions.len(), "registered synthetic module");
        Ok(self.wrap(built))
    }

    /// The session-owned package `name`, created empty if it does not exist
    /// yet.
    fn synthetic_package(
        &self,
        modules: &Bound<'py, PyDict>,
        name: &str,
    ) -> Result<Bound<'py, PyAny>> {
        let py = self.py();
        if let Some(existing) = modules.get_item(name).foreign(py)? {
            return Ok(existing);
        }
        let package = PyModule::new(py, name).foreign(py)?;
        package
            .setattr(intern!(py, "__path__"), PyList::empty(py))
            .foreign(py)?;
        modules.set_item(name, &package).foreign(py)?;
        let package = package.into_any();
        {
            let mut session = self.session();
            session.owned.push(name.to_owned());
            session.modules.insert(name.to_owned(), package.clone().unbind());
        }
        debug!(package = %name, "created synthetic parent package");
        Ok(package)
    }
}

fn last_segment(name: &str) -> &str {
    name.rsplit_once('.').map_or(name, |(_, last)| last)
}

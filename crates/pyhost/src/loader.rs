//! Import-path management and module loading.

use std::{
    ffi::CString,
    path::{Path, PathBuf},
};

use pyo3::{exceptions::PyModuleNotFoundError, intern, prelude::*, types::PyModule};
use tracing::debug;

use crate::{
    error::{BridgeError, ForeignResultExt, Result},
    exec::{Scope, dedent, source_text},
    foreign::ForeignValue,
    runtime::{Bridge, path_str},
};

impl<'py> Bridge<'py> {
    /// Append `dir` (made absolute) to `sys.path`.
    ///
    /// Returns `false` without changing anything if the directory is already
    /// on the path. Existence is not checked.
    ///
    /// # Errors
    /// Returns [`BridgeError::Io`] if the current directory is needed and
    /// unavailable.
    pub fn add_search_path(&self, dir: impl AsRef<Path>) -> Result<bool> {
        let py = self.py();
        let dir = std::path::absolute(dir.as_ref())?;
        let entry = path_str(&dir);
        let path = self.sys_path_list()?;
        if path.contains(&entry).foreign(py)? {
            return Ok(false);
        }
        path.append(&entry).foreign(py)?;
        self.session().search_paths.push(dir);
        self.invalidate_import_caches()?;
        debug!(dir = %entry, "added search path");
        Ok(true)
    }

    /// Directories this session appended to `sys.path`, in order.
    #[must_use]
    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.session().search_paths.clone()
    }

    /// The full `sys.path`.
    ///
    /// # Errors
    /// Returns [`BridgeError::ResultMarshal`] if an entry is not a string.
    pub fn sys_path(&self) -> Result<Vec<String>> {
        self.wrap(self.sys_path_list()?.into_any()).extract()
    }

    /// Import `name`, or return the module this session already loaded.
    ///
    /// # Errors
    /// Returns [`BridgeError::ModuleNotFound`] if neither the module nor one
    /// of its parent packages exists, and [`BridgeError::ForeignException`]
    /// for any other import failure, including a missing dependency of a
    /// module that does exist.
    pub fn load_module(&self, name: &str) -> Result<ForeignValue<'py>> {
        let py = self.py();
        let cached = self.session().modules.get(name).map(|m| m.clone_ref(py));
        if let Some(module) = cached {
            return Ok(self.wrap(module.into_bound(py)));
        }

        let module = match py.import(name) {
            Ok(module) => module.into_any(),
            Err(e) if is_missing(py, &e, name) => {
                debug!(module = name, "module not found");
                return Err(BridgeError::ModuleNotFound {
                    name: name.to_owned(),
                });
            }
            Err(e) => return Err(BridgeError::from_pyerr(py, e)),
        };
        self.session()
            .modules
            .insert(name.to_owned(), module.clone().unbind());
        debug!(module = name, "loaded module");
        Ok(self.wrap(module))
    }

    /// Build module `name` from source text and register it in
    /// `sys.modules`. The module is removed again when the session ends.
    ///
    /// # Errors
    /// Returns [`BridgeError::ArgumentMarshal`] if a string contains a NUL
    /// byte, or [`BridgeError::ForeignException`] if the module body raised.
    pub fn load_source(&self, name: &str, code: &str, file_name: &str) -> Result<ForeignValue<'py>> {
        let py = self.py();
        let code = source_text(&dedent(code))?;
        let file_name = c_string("file name", file_name)?;
        let module_name = c_string("module name", name)?;
        let module = PyModule::from_code(py, &code, &file_name, &module_name)
            .foreign(py)?
            .into_any();
        {
            let mut session = self.session();
            session.owned.push(name.to_owned());
            session
                .modules
                .insert(name.to_owned(), module.clone().unbind());
        }
        debug!(module = name, "loaded module from source");
        Ok(self.wrap(module))
    }

    /// Execute a script file in `scope` as `__main__`, with `__file__` set.
    ///
    /// # Errors
    /// Returns [`BridgeError::Io`] if the file cannot be read, or
    /// [`BridgeError::ForeignException`] if compiling or running it raised.
    pub fn run_file(&self, path: impl AsRef<Path>, scope: &Scope<'py>) -> Result<()> {
        let py = self.py();
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let file_name = path_str(path);
        let globals = scope.globals();
        globals
            .set_item(intern!(py, "__file__"), &file_name)
            .foreign(py)?;
        globals
            .set_item(intern!(py, "__name__"), "__main__")
            .foreign(py)?;

        let builtins = py.import(intern!(py, "builtins")).foreign(py)?;
        let code = builtins
            .call_method1(intern!(py, "compile"), (source, &file_name, "exec"))
            .foreign(py)?;
        debug!(file = %file_name, "running script");
        builtins
            .call_method1(intern!(py, "exec"), (code, globals, scope.locals()))
            .foreign(py)?;
        Ok(())
    }
}

/// Whether `err` says that `name` itself (or a parent package) is missing,
/// as opposed to something `name` imports.
fn is_missing(py: Python<'_>, err: &PyErr, name: &str) -> bool {
    if !err.is_instance_of::<PyModuleNotFoundError>(py) {
        return false;
    }
    let Some(missing) = err
        .value(py)
        .getattr(intern!(py, "name"))
        .ok()
        .and_then(|n| n.extract::<String>().ok())
    else {
        return false;
    };
    name == missing
        || name
            .strip_prefix(missing.as_str())
            .is_some_and(|rest| rest.starts_with('.'))
}

fn c_string(what: &str, s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| BridgeError::argument(s, format!("{what} contains a NUL byte")))
}

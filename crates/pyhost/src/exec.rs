//! Executing source text.

use std::{borrow::Cow, ffi::CString};

use pyo3::{prelude::*, types::PyDict};

use crate::{
    args::ArgValue,
    error::{BridgeError, ForeignResultExt, Result},
    foreign::ForeignValue,
    runtime::Bridge,
};

/// Namespace that executed code reads and writes.
///
/// A scope from [`Bridge::scope`] uses one dict for globals and locals, like
/// a module body. [`Bridge::scope_with_locals`] keeps a separate locals dict,
/// like a class body.
pub struct Scope<'py> {
    globals: Bound<'py, PyDict>,
    locals: Option<Bound<'py, PyDict>>,
    generation: u64,
}

impl<'py> Scope<'py> {
    /// Bind `name` in the globals.
    ///
    /// # Errors
    /// Returns [`BridgeError::ArgumentMarshal`] if `value` cannot be
    /// converted.
    pub fn set(&self, name: &str, value: impl Into<ArgValue<'py>>) -> Result<()> {
        let py = self.globals.py();
        let value = value.into().into_foreign(py)?;
        self.globals.set_item(name, value).foreign(py)
    }

    /// Look `name` up in the locals, then the globals.
    ///
    /// # Errors
    /// Returns [`BridgeError::ForeignException`] if a lookup raised.
    pub fn get(&self, name: &str) -> Result<Option<ForeignValue<'py>>> {
        if let Some(v) = self.local(name)? {
            return Ok(Some(v));
        }
        self.lookup(&self.globals, name)
    }

    /// Look `name` up in the locals only.
    ///
    /// # Errors
    /// Returns [`BridgeError::ForeignException`] if the lookup raised.
    pub fn local(&self, name: &str) -> Result<Option<ForeignValue<'py>>> {
        self.lookup(self.locals(), name)
    }

    #[must_use]
    pub const fn globals(&self) -> &Bound<'py, PyDict> {
        &self.globals
    }

    #[must_use]
    pub fn locals(&self) -> &Bound<'py, PyDict> {
        self.locals.as_ref().unwrap_or(&self.globals)
    }

    fn lookup(&self, dict: &Bound<'py, PyDict>, name: &str) -> Result<Option<ForeignValue<'py>>> {
        Ok(dict
            .get_item(name)
            .foreign(dict.py())?
            .map(|v| ForeignValue::new(v, self.generation)))
    }
}

impl<'py> Bridge<'py> {
    #[must_use]
    pub fn scope(&self) -> Scope<'py> {
        Scope {
            globals: PyDict::new(self.py()),
            locals: None,
            generation: self.generation(),
        }
    }

    #[must_use]
    pub fn scope_with_locals(&self) -> Scope<'py> {
        Scope {
            globals: PyDict::new(self.py()),
            locals: Some(PyDict::new(self.py())),
            generation: self.generation(),
        }
    }

    /// Run statements in `scope`. Common leading indentation is removed
    /// first, so code can be written inline in Rust string literals.
    ///
    /// # Errors
    /// Returns [`BridgeError::ArgumentMarshal`] if the text contains a NUL
    /// byte, or [`BridgeError::ForeignException`] if execution raised.
    pub fn exec(&self, code: &str, scope: &Scope<'py>) -> Result<()> {
        let py = self.py();
        let code = source_text(&dedent(code))?;
        py.run(&code, Some(&scope.globals), scope.locals.as_ref())
            .foreign(py)
    }

    /// Evaluate one expression, in `scope` or in a fresh namespace.
    ///
    /// # Errors
    /// As for [`Bridge::exec`].
    pub fn eval(&self, expr: &str, scope: Option<&Scope<'py>>) -> Result<ForeignValue<'py>> {
        let py = self.py();
        let expr = source_text(expr.trim())?;
        let fresh;
        let scope = if let Some(scope) = scope {
            scope
        } else {
            fresh = self.scope();
            &fresh
        };
        py.eval(&expr, Some(&scope.globals), scope.locals.as_ref())
            .foreign(py)
            .map(|v| self.wrap(v))
    }
}

pub(crate) fn source_text(code: &str) -> Result<CString> {
    CString::new(code).map_err(|e| {
        BridgeError::argument(
            "source text",
            format!("contains a NUL byte at offset {}", e.nul_position()),
        )
    })
}

/// Remove the whitespace prefix shared by every non-blank line.
pub(crate) fn dedent(code: &str) -> Cow<'_, str> {
    let mut margin: Option<&str> = None;
    for line in code.lines().filter(|l| !l.trim().is_empty()) {
        let indent = &line[..line.len() - line.trim_start_matches([' ', '\t']).len()];
        margin = Some(match margin {
            None => indent,
            Some(m) => {
                let shared = m
                    .bytes()
                    .zip(indent.bytes())
                    .take_while(|(a, b)| a == b)
                    .count();
                &m[..shared]
            }
        });
    }
    let margin = margin.unwrap_or_default();
    if margin.is_empty() {
        return Cow::Borrowed(code);
    }

    let mut out = String::with_capacity(code.len());
    for line in code.split_inclusive('\n') {
        match line.strip_prefix(margin) {
            Some(rest) if !line.trim().is_empty() => out.push_str(rest),
            _ if line.trim().is_empty() => {
                if line.ends_with('\n') {
                    out.push('\n');
                }
            }
            _ => out.push_str(line),
        }
    }
    Cow::Owned(out)
}

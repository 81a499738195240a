use pyo3::{PyErr, Python, prelude::*};
use thiserror::Error;

pub type Result<T, E = BridgeError> = core::result::Result<T, E>;

/// Failure at a host/foreign crossing.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The runtime home or virtual environment could not be resolved.
    #[error("environment setup failed: {reason}")]
    EnvironmentSetup { reason: String },

    /// The interpreter could not be started or a session could not be opened.
    #[error("runtime start failed: {reason}")]
    RuntimeStart { reason: String },

    #[error("module not found: {name}")]
    ModuleNotFound { name: String },

    #[error("attribute '{name}' not found on {object}")]
    AttributeNotFound { object: String, name: String },

    /// A host value could not be converted for the foreign side.
    #[error("cannot marshal argument {value}: {reason}")]
    ArgumentMarshal { value: String, reason: String },

    /// Foreign code raised an exception.
    #[error("{kind}: {message}")]
    ForeignException {
        kind: String,
        message: String,
        traceback: Option<String>,
    },

    /// A foreign value could not be converted into the requested host type.
    #[error("cannot marshal result {value}: {reason}")]
    ResultMarshal { value: String, reason: String },

    /// A detached handle was re-attached after its session ended.
    #[error("handle from session {issued} used in session {current}")]
    StaleValue { issued: u64, current: u64 },

    #[error("cannot register module '{name}': {reason}")]
    Registration { name: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Reify a Python exception, keeping its type name and traceback.
    pub fn from_pyerr(py: Python<'_>, e: impl Into<PyErr>) -> Self {
        let e = e.into();
        let kind = e
            .get_type(py)
            .name()
            .map_or_else(|_| "Exception".to_owned(), |n| n.to_string());
        let message = e.value(py).to_string();
        let message = if message.is_empty() {
            kind.clone()
        } else {
            message
        };
        Self::ForeignException {
            kind,
            message,
            traceback: e.traceback(py).and_then(|tb| tb.format().ok()),
        }
    }

    pub(crate) fn environment(reason: impl Into<String>) -> Self {
        Self::EnvironmentSetup {
            reason: reason.into(),
        }
    }

    pub(crate) fn runtime_start(reason: impl Into<String>) -> Self {
        Self::RuntimeStart {
            reason: reason.into(),
        }
    }

    pub(crate) fn argument(value: impl std::fmt::Debug, reason: impl Into<String>) -> Self {
        Self::ArgumentMarshal {
            value: describe(&value),
            reason: reason.into(),
        }
    }

    pub(crate) fn result(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResultMarshal {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Whether the runtime stays usable after this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::EnvironmentSetup { .. } | Self::RuntimeStart { .. }
        )
    }

    /// Foreign traceback text, if the error came from a raised exception.
    #[must_use]
    pub fn traceback(&self) -> Option<&str> {
        match self {
            Self::ForeignException { traceback, .. } => traceback.as_deref(),
            _ => None,
        }
    }

    /// Human-readable report: the message, then the traceback when present.
    #[must_use]
    pub fn report(&self) -> String {
        match self.traceback() {
            Some(traceback) => format!("{self}\n\n{traceback}"),
            None => self.to_string(),
        }
    }
}

/// Routes a raw Python failure through [`BridgeError::from_pyerr`].
pub(crate) trait ForeignResultExt<T> {
    fn foreign(self, py: Python<'_>) -> Result<T>;
}

impl<T, E: Into<PyErr>> ForeignResultExt<T> for core::result::Result<T, E> {
    fn foreign(self, py: Python<'_>) -> Result<T> {
        self.map_err(|e| BridgeError::from_pyerr(py, e))
    }
}

const MAX_DESCRIPTION: usize = 80;

fn describe(value: &impl std::fmt::Debug) -> String {
    truncate(format!("{value:?}"))
}

fn truncate(mut s: String) -> String {
    if s.len() > MAX_DESCRIPTION {
        let mut end = MAX_DESCRIPTION;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
        s.push_str("...");
    }
    s
}

/// Short description of a foreign object for error messages.
pub(crate) fn describe_foreign(obj: &Bound<'_, PyAny>) -> String {
    let type_name = obj
        .get_type()
        .name()
        .map_or_else(|_| "object".to_owned(), |n| n.to_string());
    obj.repr().map_or_else(
        |_| format!("<{type_name}>"),
        |repr| format!("{} ({type_name})", truncate(repr.to_string())),
    )
}

use pyo3::{
    exceptions::PyTypeError,
    prelude::*,
    types::{PyDict, PyString, PyTuple},
    wrap_pyfunction,
};
use tracing::Level;

use crate::{serde::LogFields, synthetic::SyntheticModule};

/// `tracing` target of records emitted by scripts through `_pyhost_logging`.
pub const TRACE_TARGET_SCRIPT: &str = "pyhost::script";

pub(crate) const MODULE_NAME: &str = "_pyhost_logging";

pub(crate) fn module() -> SyntheticModule {
    SyntheticModule::native(MODULE_NAME, init)
}

fn init(py: Python<'_>) -> PyResult<Bound<'_, PyModule>> {
    let module = PyModule::new(py, MODULE_NAME)?;
    module.add_function(wrap_pyfunction!(debug, &module)?)?;
    module.add_function(wrap_pyfunction!(info, &module)?)?;
    module.add_function(wrap_pyfunction!(warning, &module)?)?;
    module.add_function(wrap_pyfunction!(error, &module)?)?;
    Ok(module)
}

fn format_message(msg: &Bound<'_, PyString>, args: &Bound<'_, PyTuple>) -> PyResult<String> {
    if args.is_empty() {
        Ok(msg.to_string())
    } else {
        Ok(msg.call_method1("format", args)?.to_string())
    }
}

fn format_fields(kwds: Option<&Bound<'_, PyDict>>) -> PyResult<Option<String>> {
    match kwds {
        Some(dict) if !dict.is_empty() => LogFields::new(dict)
            .to_json()
            .map(Some)
            .map_err(|e| PyTypeError::new_err(format!("Failed to convert log fields to JSON: {e}"))),
        _ => Ok(None),
    }
}

macro_rules! script_log {
    ($level:expr, $name:ident) => {
        #[pyfunction]
        #[pyo3(signature = (msg, *args, **kwds))]
        fn $name(
            msg: &Bound<'_, PyString>,
            args: &Bound<'_, PyTuple>,
            kwds: Option<&Bound<'_, PyDict>>,
        ) -> PyResult<()> {
            if !tracing::enabled!(target: TRACE_TARGET_SCRIPT, $level) {
                return Ok(());
            }
            let message = format_message(msg, args)?;
            let fields = format_fields(kwds)?;
            tracing::event!(
                target: TRACE_TARGET_SCRIPT,
                $level,
                fields = fields.as_deref(),
                "{message}"
            );
            Ok(())
        }
    };
}

script_log!(Level::DEBUG, debug);
script_log!(Level::INFO, info);
script_log!(Level::WARN, warning);
script_log!(Level::ERROR, error);

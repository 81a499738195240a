//! Embed a CPython interpreter and move calls, values and errors across the
//! boundary.
//!
//! ```ignore
//! let descriptor = pyhost::EnvironmentDescriptor::discover()?;
//! let runtime = pyhost::Runtime::acquire(&descriptor)?;
//! let total: i64 = runtime.enter(|bridge| {
//!     let builtins = bridge.load_module("builtins")?;
//!     builtins.call_method("sum", pyhost::args![vec![1, 2, 3]]?)?.extract()
//! })?;
//! ```

mod args;
mod args_macro;
mod config;
mod env;
mod error;
mod exec;
mod foreign;
mod loader;
mod logging;
mod runtime;
mod serde;
mod synthetic;
mod value;

pub use args::{Arg, ArgValue, Args};
pub use config::{Config, RuntimeOptions};
pub use env::{
    EnvironmentDescriptor, EnvironmentOverrides, EnvironmentResolver, PythonVersion, Source,
    VirtualEnv,
};
pub use error::{BridgeError, Result};
pub use exec::Scope;
pub use foreign::{Detached, ForeignKind, ForeignValue, FromForeign};
pub use logging::TRACE_TARGET_SCRIPT;
pub use runtime::{Bridge, Runtime};
pub use synthetic::{HostError, HostFunction, HostReturn, SyntheticModule};
pub use value::{FromValue, Value};

pub use pyo3;

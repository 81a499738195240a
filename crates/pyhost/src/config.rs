use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{
    env::EnvironmentOverrides,
    error::{BridgeError, Result},
    synthetic::SyntheticModule,
};

/// Session settings applied by [`Runtime::acquire_with`](crate::Runtime::acquire_with).
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeOptions {
    /// Directories appended to `sys.path`, in order.
    pub search_paths: Vec<PathBuf>,
    /// Source executed once the session is set up.
    pub prelude: Option<String>,
    /// Register the `_pyhost_logging` module.
    pub logging_module: bool,
    /// Flush `sys.stdout` and `sys.stderr` at teardown.
    pub flush_stdio: bool,
    #[serde(skip)]
    pub(crate) synthetic: Vec<SyntheticModule>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            prelude: None,
            logging_module: true,
            flush_stdio: true,
            synthetic: Vec::new(),
        }
    }
}

impl RuntimeOptions {
    #[must_use]
    pub fn search_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_paths.push(dir.into());
        self
    }

    #[must_use]
    pub fn prelude(mut self, code: impl Into<String>) -> Self {
        self.prelude = Some(code.into());
        self
    }

    #[must_use]
    pub const fn logging_module(mut self, enabled: bool) -> Self {
        self.logging_module = enabled;
        self
    }

    #[must_use]
    pub const fn flush_stdio(mut self, enabled: bool) -> Self {
        self.flush_stdio = enabled;
        self
    }

    /// Register `module` while the session opens, before the prelude runs.
    #[must_use]
    pub fn synthetic_module(mut self, module: SyntheticModule) -> Self {
        self.synthetic.push(module);
        self
    }
}

/// File-level configuration: where the interpreter lives and how sessions
/// are set up.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub environment: EnvironmentOverrides,
    pub runtime: RuntimeOptions,
}

impl Config {
    /// # Errors
    /// Returns [`BridgeError::EnvironmentSetup`] if the document is not valid
    /// JSON for this schema.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| BridgeError::environment(format!("invalid configuration: {e}")))
    }

    /// # Errors
    /// Returns [`BridgeError::Io`] if the file cannot be read, or
    /// [`BridgeError::EnvironmentSetup`] if its content is invalid.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            BridgeError::environment(format!("invalid configuration {}: {e}", path.display()))
        })
    }
}

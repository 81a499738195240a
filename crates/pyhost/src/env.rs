//! Locating the interpreter's home, standard library and virtual environment.
//!
//! Resolution happens before the interpreter starts: CPython fixes its module
//! search paths during initialization and ignores later changes to the
//! variables it reads at bootstrap.

use std::{
    collections::HashMap,
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
    process::Command,
};

use serde::Deserialize;
use tracing::debug;

use crate::error::{BridgeError, Result};

const LANDMARK: &str = "os.py";
const PYTHONHOME: &str = "PYTHONHOME";
const VIRTUAL_ENV: &str = "VIRTUAL_ENV";

/// `major.minor` of the interpreter this crate links against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PythonVersion {
    pub major: u8,
    pub minor: u8,
}

impl PythonVersion {
    /// Version recorded by `pyo3-build-config` when this crate was built.
    #[must_use]
    pub fn linked() -> Self {
        Self::parse(env!("PYHOST_PYTHON_VERSION")).unwrap_or(Self { major: 3, minor: 0 })
    }

    fn parse(s: &str) -> Option<Self> {
        let (major, minor) = s.trim().split_once('.')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    fn lib_dir_name(self) -> String {
        format!("python{}.{}", self.major, self.minor)
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Where the runtime home came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Explicit,
    Environment,
    Platform,
}

/// Host-provided overrides, usually read from the `environment` section of
/// a [`Config`](crate::Config).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentOverrides {
    /// Interpreter home (the `sys.base_prefix` of an installation).
    pub home: Option<PathBuf>,
    /// Root of a virtual environment whose `site-packages` should be visible.
    pub venv: Option<PathBuf>,
    /// Consult `PYTHONHOME` and `VIRTUAL_ENV` when no override is given.
    pub use_process_env: bool,
}

impl Default for EnvironmentOverrides {
    fn default() -> Self {
        Self {
            home: None,
            venv: None,
            use_process_env: true,
        }
    }
}

impl EnvironmentOverrides {
    #[must_use]
    pub fn home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    #[must_use]
    pub fn venv(mut self, venv: impl Into<PathBuf>) -> Self {
        self.venv = Some(venv.into());
        self
    }

    #[must_use]
    pub const fn use_process_env(mut self, enabled: bool) -> Self {
        self.use_process_env = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualEnv {
    pub root: PathBuf,
    pub site_packages: PathBuf,
}

/// Resolved, immutable description of the environment the interpreter will
/// start in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentDescriptor {
    home: PathBuf,
    stdlib: Vec<PathBuf>,
    venv: Option<VirtualEnv>,
    version: PythonVersion,
    source: Source,
}

impl EnvironmentDescriptor {
    /// Resolve with default overrides.
    ///
    /// # Errors
    /// Returns [`BridgeError::EnvironmentSetup`] if no usable home is found.
    pub fn discover() -> Result<Self> {
        EnvironmentResolver::new(EnvironmentOverrides::default()).resolve()
    }

    #[must_use]
    pub fn home(&self) -> &Path {
        &self.home
    }

    #[must_use]
    pub fn stdlib_paths(&self) -> &[PathBuf] {
        &self.stdlib
    }

    #[must_use]
    pub const fn venv(&self) -> Option<&VirtualEnv> {
        self.venv.as_ref()
    }

    #[must_use]
    pub const fn version(&self) -> PythonVersion {
        self.version
    }

    #[must_use]
    pub const fn source(&self) -> Source {
        self.source
    }

    /// Publish the home to the interpreter's bootstrap.
    ///
    /// Only an explicit home needs publishing: an environment-sourced home is
    /// already in `PYTHONHOME`, and a discovered home is the one the linked
    /// library computes on its own.
    pub(crate) fn apply(&self) {
        if self.source == Source::Explicit {
            debug!(home = %self.home.display(), "setting PYTHONHOME");
            // SAFETY: called once, under the runtime's initialization guard and
            // before the interpreter (and any thread it owns) exists.
            unsafe { std::env::set_var(PYTHONHOME, &self.home) };
        }
    }
}

/// Produces an [`EnvironmentDescriptor`] from overrides, environment hints
/// and platform discovery, in that order.
pub struct EnvironmentResolver {
    overrides: EnvironmentOverrides,
    vars: Option<HashMap<String, OsString>>,
    version: PythonVersion,
}

impl EnvironmentResolver {
    #[must_use]
    pub fn new(overrides: EnvironmentOverrides) -> Self {
        Self {
            overrides,
            vars: None,
            version: PythonVersion::linked(),
        }
    }

    /// Read environment hints from `vars` instead of the process environment.
    #[must_use]
    pub fn with_vars<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<OsString>,
    {
        self.vars = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    fn var(&self, name: &str) -> Option<OsString> {
        if !self.overrides.use_process_env {
            return None;
        }
        let value = match &self.vars {
            Some(vars) => vars.get(name).cloned(),
            None => std::env::var_os(name),
        };
        value.filter(|v| !v.is_empty())
    }

    /// # Errors
    /// Returns [`BridgeError::EnvironmentSetup`] if the home or virtual
    /// environment cannot be validated.
    pub fn resolve(&self) -> Result<EnvironmentDescriptor> {
        let (home, source) = self.resolve_home()?;
        let stdlib = stdlib_paths(&home, self.version);
        let venv = self.resolve_venv()?;
        debug!(home = %home.display(), ?source, venv = ?venv.as_ref().map(|v| &v.root), "resolved environment");
        Ok(EnvironmentDescriptor {
            home,
            stdlib,
            venv,
            version: self.version,
            source,
        })
    }

    fn resolve_home(&self) -> Result<(PathBuf, Source)> {
        if let Some(home) = &self.overrides.home {
            return self
                .validate_home(home)
                .map(|home| (home, Source::Explicit));
        }
        if let Some(home) = self.var(PYTHONHOME) {
            return self
                .validate_home(Path::new(&home))
                .map(|home| (home, Source::Environment));
        }

        let mut tried = vec![];
        for candidate in self.platform_candidates() {
            if has_landmark(&candidate, self.version) {
                return Ok((candidate, Source::Platform));
            }
            tried.push(candidate.display().to_string());
        }
        Err(BridgeError::environment(format!(
            "no Python {} installation found (tried: {})",
            self.version,
            if tried.is_empty() {
                "nothing".to_owned()
            } else {
                tried.join(", ")
            }
        )))
    }

    fn validate_home(&self, home: &Path) -> Result<PathBuf> {
        if !home.is_dir() {
            return Err(BridgeError::environment(format!(
                "runtime home '{}' is not a directory",
                home.display()
            )));
        }
        if !has_landmark(home, self.version) {
            return Err(BridgeError::environment(format!(
                "runtime home '{}' has no Python {} standard library",
                home.display(),
                self.version
            )));
        }
        Ok(home.to_path_buf())
    }

    fn resolve_venv(&self) -> Result<Option<VirtualEnv>> {
        let root = match &self.overrides.venv {
            Some(root) => root.clone(),
            None => match self.var(VIRTUAL_ENV) {
                Some(root) => PathBuf::from(root),
                None => return Ok(None),
            },
        };
        let site_packages = site_packages(&root, self.version);
        if !site_packages.is_dir() {
            return Err(BridgeError::environment(format!(
                "virtual environment '{}' has no site-packages at '{}'",
                root.display(),
                site_packages.display()
            )));
        }
        Ok(Some(VirtualEnv {
            root,
            site_packages,
        }))
    }

    fn platform_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = vec![];
        if let Some(executable) = option_env!("PYHOST_PYTHON_EXECUTABLE") {
            let executable = Path::new(executable);
            if let Some(prefix) = query_base_prefix(executable) {
                candidates.push(prefix);
            }
            if let Some(prefix) = executable.parent().and_then(Path::parent) {
                candidates.push(prefix.to_path_buf());
            }
        }
        let on_path = if cfg!(windows) { "python" } else { "python3" };
        if let Some(prefix) = query_base_prefix(Path::new(on_path)) {
            candidates.push(prefix);
        }
        candidates.extend(self.fixed_locations());
        candidates.dedup();
        candidates
    }

    fn fixed_locations(&self) -> Vec<PathBuf> {
        if cfg!(windows) {
            let tag = format!("Python{}{}", self.version.major, self.version.minor);
            let mut out = vec![];
            if let Some(local) = std::env::var_os("LOCALAPPDATA") {
                out.push(PathBuf::from(local).join("Programs").join("Python").join(&tag));
            }
            out.push(PathBuf::from("C:\\").join(tag));
            out
        } else {
            ["/usr/local", "/usr", "/opt/homebrew"]
                .into_iter()
                .map(PathBuf::from)
                .collect()
        }
    }
}

fn stdlib_dir(home: &Path, version: PythonVersion) -> PathBuf {
    if cfg!(windows) {
        home.join("Lib")
    } else {
        home.join("lib").join(version.lib_dir_name())
    }
}

fn has_landmark(home: &Path, version: PythonVersion) -> bool {
    stdlib_dir(home, version).join(LANDMARK).is_file()
}

fn stdlib_paths(home: &Path, version: PythonVersion) -> Vec<PathBuf> {
    let stdlib = stdlib_dir(home, version);
    let native = if cfg!(windows) {
        home.join("DLLs")
    } else {
        stdlib.join("lib-dynload")
    };
    let mut paths = vec![stdlib];
    if native.is_dir() {
        paths.push(native);
    }
    paths
}

fn site_packages(venv: &Path, version: PythonVersion) -> PathBuf {
    if cfg!(windows) {
        venv.join("Lib").join("site-packages")
    } else {
        venv.join("lib")
            .join(version.lib_dir_name())
            .join("site-packages")
    }
}

fn query_base_prefix(executable: &Path) -> Option<PathBuf> {
    let output = Command::new(executable)
        .args(["-c", "import sys; print(sys.base_prefix)"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let prefix = String::from_utf8(output.stdout).ok()?;
    let prefix = prefix.trim();
    (!prefix.is_empty()).then(|| PathBuf::from(prefix))
}

//! Interpreter start-up and per-acquisition sessions.
//!
//! CPython is initialized once per process and never finalized: extension
//! modules cannot survive a finalize/initialize cycle. What a [`Runtime`]
//! owns is a *session*: the changes it makes to `sys.path` and
//! `sys.modules`, which are rolled back at teardown so that a later
//! acquisition starts from the same interpreter state.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, MutexGuard, ReentrantMutex};
use pyo3::{
    intern,
    marker::Ungil,
    prelude::*,
    types::{PyDict, PyList},
};
use tracing::{debug, debug_span, info, warn};

use crate::{
    config::RuntimeOptions,
    env::EnvironmentDescriptor,
    error::{BridgeError, ForeignResultExt, Result},
    foreign::{Detached, ForeignValue},
    logging,
};

static LIVE: AtomicBool = AtomicBool::new(false);
static GENERATION: AtomicU64 = AtomicU64::new(0);
static STARTED_HOME: OnceLock<PathBuf> = OnceLock::new();

/// Exclusive handle to the embedded interpreter.
///
/// At most one `Runtime` is live per process. Dropping it (or calling
/// [`Runtime::release`]) tears the session down; a new one can be acquired
/// afterwards.
pub struct Runtime {
    shared: Arc<Shared>,
    released: bool,
}

pub(crate) struct Shared {
    boundary: ReentrantMutex<()>,
    generation: u64,
    descriptor: EnvironmentDescriptor,
    session: Mutex<Session>,
}

/// What a session changed, so teardown can undo it.
#[derive(Default)]
pub(crate) struct Session {
    saved_path: Option<Py<PyList>>,
    baseline: HashSet<String>,
    flush_stdio: bool,
    pub(crate) search_paths: Vec<PathBuf>,
    pub(crate) modules: HashMap<String, Py<PyAny>>,
    /// Modules created by the session itself (synthetic or built from source).
    pub(crate) owned: Vec<String>,
}

impl Runtime {
    /// # Errors
    /// See [`Runtime::acquire_with`].
    pub fn acquire(descriptor: &EnvironmentDescriptor) -> Result<Self> {
        Self::acquire_with(descriptor, RuntimeOptions::default())
    }

    /// Start the interpreter if needed and open a session on it.
    ///
    /// # Errors
    /// Returns [`BridgeError::RuntimeStart`] if another runtime is live, if
    /// the interpreter was started with a different home, or if the session
    /// could not be opened (a failing prelude, an unavailable search path).
    pub fn acquire_with(descriptor: &EnvironmentDescriptor, options: RuntimeOptions) -> Result<Self> {
        if LIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BridgeError::runtime_start(
                "a runtime handle is already live in this process",
            ));
        }
        if let Err(e) = initialize(descriptor) {
            LIVE.store(false, Ordering::Release);
            return Err(e);
        }

        let generation = GENERATION.fetch_add(1, Ordering::AcqRel) + 1;
        let runtime = Self {
            shared: Arc::new(Shared {
                boundary: ReentrantMutex::new(()),
                generation,
                descriptor: descriptor.clone(),
                session: Mutex::new(Session::default()),
            }),
            released: false,
        };
        match runtime.enter(|bridge| bridge.open(options)) {
            Ok(()) => {
                info!(generation, "runtime acquired");
                Ok(runtime)
            }
            Err(e) => {
                drop(runtime);
                Err(BridgeError::runtime_start(format!(
                    "cannot open session: {}",
                    e.report()
                )))
            }
        }
    }

    /// Whether some runtime handle is live in this process.
    #[must_use]
    pub fn is_live() -> bool {
        LIVE.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    #[must_use]
    pub fn descriptor(&self) -> &EnvironmentDescriptor {
        &self.shared.descriptor
    }

    /// Run `f` with exclusive access to the interpreter.
    ///
    /// The boundary lock is taken before attaching to the interpreter, so a
    /// thread waiting here never holds the GIL. Re-entering from the same
    /// thread (for example inside a host function) is allowed.
    pub fn enter<F, R>(&self, f: F) -> R
    where
        F: for<'py> FnOnce(&Bridge<'py>) -> R,
    {
        let _boundary = self.shared.boundary.lock();
        let _span = debug_span!("pyhost.session", generation = self.shared.generation).entered();
        Python::attach(|py| {
            let bridge = Bridge {
                py,
                shared: Arc::clone(&self.shared),
            };
            f(&bridge)
        })
    }

    /// Tear the session down and report any teardown failure.
    ///
    /// # Errors
    /// Returns the first error met while flushing output, purging modules or
    /// restoring `sys.path`. The runtime is released regardless.
    pub fn release(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.released, true) {
            return Ok(());
        }
        let result = self.enter(|bridge| bridge.close());
        LIVE.store(false, Ordering::Release);
        info!(generation = self.shared.generation, "runtime released");
        result
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(error = %e, "runtime teardown failed");
        }
    }
}

fn initialize(descriptor: &EnvironmentDescriptor) -> Result<()> {
    let home = STARTED_HOME.get_or_init(|| {
        descriptor.apply();
        Python::initialize();
        info!(
            home = %descriptor.home().display(),
            version = %descriptor.version(),
            source = ?descriptor.source(),
            "interpreter initialized"
        );
        descriptor.home().to_path_buf()
    });
    if home.as_path() != descriptor.home() {
        return Err(BridgeError::runtime_start(format!(
            "interpreter already started with home '{}', cannot switch to '{}'",
            home.display(),
            descriptor.home().display()
        )));
    }
    Ok(())
}

/// Access to the interpreter inside [`Runtime::enter`].
pub struct Bridge<'py> {
    py: Python<'py>,
    shared: Arc<Shared>,
}

impl<'py> Bridge<'py> {
    #[must_use]
    pub const fn py(&self) -> Python<'py> {
        self.py
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    #[must_use]
    pub fn descriptor(&self) -> &EnvironmentDescriptor {
        &self.shared.descriptor
    }

    /// `sys.version` of the running interpreter.
    #[must_use]
    pub fn interpreter_version(&self) -> &'py str {
        self.py.version()
    }

    /// Re-attach a handle stored outside of an `enter` scope.
    ///
    /// # Errors
    /// Returns [`BridgeError::StaleValue`] if the handle was detached in a
    /// session that has since been released.
    pub fn attach(&self, handle: &Detached) -> Result<ForeignValue<'py>> {
        if handle.generation != self.shared.generation {
            return Err(BridgeError::StaleValue {
                issued: handle.generation,
                current: self.shared.generation,
            });
        }
        Ok(self.wrap(handle.obj.bind(self.py).clone()))
    }

    /// Release the GIL while `f` runs. `f` must not touch Python; the
    /// runtime boundary stays held, so other threads keep waiting.
    pub fn detach<T, F>(&self, f: F) -> T
    where
        F: Ungil + FnOnce() -> T,
        T: Ungil,
    {
        self.py.detach(f)
    }

    /// Flush `sys.stdout` and `sys.stderr`.
    ///
    /// # Errors
    /// Returns [`BridgeError::ForeignException`] if a stream fails to flush.
    pub fn flush_stdio(&self) -> Result<()> {
        let py = self.py;
        let sys = self.sys()?;
        for name in [intern!(py, "stdout"), intern!(py, "stderr")] {
            if let Ok(stream) = sys.getattr(name)
                && !stream.is_none()
            {
                stream.call_method0(intern!(py, "flush")).foreign(py)?;
            }
        }
        Ok(())
    }

    pub(crate) fn wrap(&self, obj: Bound<'py, PyAny>) -> ForeignValue<'py> {
        ForeignValue::new(obj, self.shared.generation)
    }

    /// Session bookkeeping. Never hold the guard across a Python call.
    pub(crate) fn session(&self) -> MutexGuard<'_, Session> {
        self.shared.session.lock()
    }

    pub(crate) fn sys(&self) -> Result<Bound<'py, PyModule>> {
        self.py.import(intern!(self.py, "sys")).foreign(self.py)
    }

    pub(crate) fn sys_path_list(&self) -> Result<Bound<'py, PyList>> {
        let py = self.py;
        self.sys()?
            .getattr(intern!(py, "path"))
            .foreign(py)?
            .cast_into::<PyList>()
            .foreign(py)
    }

    pub(crate) fn sys_modules(&self) -> Result<Bound<'py, PyDict>> {
        let py = self.py;
        self.sys()?
            .getattr(intern!(py, "modules"))
            .foreign(py)?
            .cast_into::<PyDict>()
            .foreign(py)
    }

    pub(crate) fn invalidate_import_caches(&self) -> Result<()> {
        let py = self.py;
        py.import(intern!(py, "importlib"))
            .foreign(py)?
            .call_method0(intern!(py, "invalidate_caches"))
            .foreign(py)?;
        Ok(())
    }

    fn open(&self, options: RuntimeOptions) -> Result<()> {
        let py = self.py;
        let RuntimeOptions {
            search_paths,
            prelude,
            logging_module,
            flush_stdio,
            synthetic,
        } = options;

        let path = self.sys_path_list()?;
        let saved = PyList::new(py, path.iter()).foreign(py)?;
        let baseline = self
            .sys_modules()?
            .keys()
            .iter()
            .filter_map(|k| k.extract::<String>().ok())
            .collect();
        {
            let mut session = self.session();
            session.saved_path = Some(saved.unbind());
            session.baseline = baseline;
            session.flush_stdio = flush_stdio;
        }

        if let Some(venv) = self.shared.descriptor.venv() {
            debug!(site_packages = %venv.site_packages.display(), "adding virtual environment");
            py.import(intern!(py, "site"))
                .foreign(py)?
                .call_method1(
                    intern!(py, "addsitedir"),
                    (path_str(&venv.site_packages),),
                )
                .foreign(py)?;
        }
        for dir in &search_paths {
            self.add_search_path(dir)?;
        }
        if logging_module {
            self.register_module(logging::module())?;
        }
        for module in synthetic {
            self.register_module(module)?;
        }
        if let Some(prelude) = prelude {
            let scope = self.scope();
            self.exec(&prelude, &scope)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let py = self.py;
        let session = std::mem::take(&mut *self.session());
        let steps = [
            if session.flush_stdio {
                self.flush_stdio()
            } else {
                Ok(())
            },
            self.purge_modules(&session),
            self.restore_sys_path(&session),
        ];
        drop(session);
        let collected = py
            .import(intern!(py, "gc"))
            .and_then(|gc| gc.call_method0(intern!(py, "collect")))
            .map(drop)
            .foreign(py);
        steps
            .into_iter()
            .chain([collected])
            .find_map(Result::err)
            .map_or(Ok(()), Err)
    }

    fn purge_modules(&self, session: &Session) -> Result<()> {
        let py = self.py;
        let modules = self.sys_modules()?;
        let mut purged = 0_usize;
        for key in modules.keys() {
            let Ok(name) = key.extract::<String>() else {
                continue;
            };
            if session.baseline.contains(&name) {
                continue;
            }
            let remove = session.owned.contains(&name)
                || modules
                    .get_item(&key)
                    .foreign(py)?
                    .and_then(|m| module_file(&m))
                    .is_some_and(|file| session.search_paths.iter().any(|dir| file.starts_with(dir)));
            if remove {
                modules.del_item(&key).foreign(py)?;
                purged += 1;
            }
        }
        debug!(purged, "purged session modules");
        Ok(())
    }

    fn restore_sys_path(&self, session: &Session) -> Result<()> {
        let Some(saved) = &session.saved_path else {
            return Ok(());
        };
        let py = self.py;
        let path = self.sys_path_list()?;
        path.set_slice(0, path.len(), saved.bind(py).as_any())
            .foreign(py)?;
        self.invalidate_import_caches()
    }
}

fn module_file(module: &Bound<'_, PyAny>) -> Option<PathBuf> {
    module
        .getattr(intern!(module.py(), "__file__"))
        .ok()?
        .extract::<String>()
        .ok()
        .map(PathBuf::from)
}

pub(crate) fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

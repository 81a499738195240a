use std::{
    ops::Deref,
    path::{Path, PathBuf},
    sync::{Once, OnceLock},
};

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use pyhost::{EnvironmentDescriptor, Runtime, RuntimeOptions};
use tempfile::TempDir;

const FIXTURES: [&str; 3] = ["example.py", "broken_dep.py", "script.py"];

/// Runtimes are process-wide; tests that acquire one take this lock first.
static RUNTIME_LOCK: Mutex<()> = Mutex::new(());

/// A live runtime plus the lock that keeps other tests out of the
/// interpreter. The runtime is dropped (and torn down) before the lock is
/// released.
pub(crate) struct TestRuntime {
    runtime: Runtime,
    _guard: MutexGuard<'static, ()>,
}

impl TestRuntime {
    pub(crate) fn release(self) -> pyhost::Result<()> {
        self.runtime.release()
    }
}

impl Deref for TestRuntime {
    type Target = Runtime;

    fn deref(&self) -> &Runtime {
        &self.runtime
    }
}

fn print_skip_once(message: String) {
    static SKIP_MESSAGE_ONCE: Once = Once::new();
    SKIP_MESSAGE_ONCE.call_once(|| {
        eprintln!("{message}");
    });
}

/// The discovered environment, or `None` (after printing why) when no usable
/// interpreter installation is present.
pub(crate) fn descriptor() -> Option<EnvironmentDescriptor> {
    static DESCRIPTOR: OnceLock<Option<EnvironmentDescriptor>> = OnceLock::new();
    DESCRIPTOR
        .get_or_init(|| match EnvironmentDescriptor::discover() {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                print_skip_once(format!("skipping integration_bridge tests: {e}"));
                None
            }
        })
        .clone()
}

pub(crate) fn lock() -> MutexGuard<'static, ()> {
    RUNTIME_LOCK.lock()
}

pub(crate) fn acquire() -> Result<Option<TestRuntime>> {
    acquire_with(RuntimeOptions::default())
}

pub(crate) fn acquire_with(options: RuntimeOptions) -> Result<Option<TestRuntime>> {
    let Some(descriptor) = descriptor() else {
        return Ok(None);
    };
    let guard = lock();
    let runtime =
        Runtime::acquire_with(&descriptor, options).context("failed to acquire runtime")?;
    Ok(Some(TestRuntime {
        runtime,
        _guard: guard,
    }))
}

fn fixtures_source() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

/// A scratch directory holding copies of the fixture modules, so bytecode
/// caches never land in the source tree.
pub(crate) fn fixture_dir() -> Result<TempDir> {
    let dir = tempfile::tempdir().context("failed to create fixture directory")?;
    let source = fixtures_source();
    for name in FIXTURES {
        std::fs::copy(source.join(name), dir.path().join(name))
            .with_context(|| format!("failed to copy fixture {name}"))?;
    }
    Ok(dir)
}

/// Acquire a runtime with a fresh fixture directory on the search path.
pub(crate) fn acquire_with_fixtures() -> Result<Option<(TestRuntime, TempDir)>> {
    let dir = fixture_dir()?;
    let Some(runtime) = acquire_with(RuntimeOptions::default().search_path(dir.path()))? else {
        return Ok(None);
    };
    Ok(Some((runtime, dir)))
}

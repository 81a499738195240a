fn main() {
    let config = pyo3_build_config::get();
    println!(
        "cargo:rustc-env=PYHOST_PYTHON_VERSION={}.{}",
        config.version.major, config.version.minor
    );
    if let Some(executable) = &config.executable {
        println!("cargo:rustc-env=PYHOST_PYTHON_EXECUTABLE={executable}");
    }
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=PYO3_PYTHON");
}

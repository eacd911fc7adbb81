fn main() {
    println!("cargo:rerun-if-changed=version_scripts/leakshim.map");
    println!("cargo:rerun-if-env-changed=PROFILE");
    // Interceptors are only exported (`no_mangle`) in release builds.
    if std::env::var("PROFILE").as_deref() != Ok("release") {
        return;
    }
    let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        return;
    };
    let version_script = format!("{manifest_dir}/version_scripts/leakshim.map");
    if std::path::Path::new(&version_script).exists() {
        println!("cargo:rustc-cdylib-link-arg=-Wl,--version-script={version_script}");
    }
}

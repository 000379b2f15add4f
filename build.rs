fn main() {
    println!("cargo:rerun-if-changed=src");
    println!("cargo:rerun-if-changed=include/backend_bridge.h");

    #[cfg(feature = "generate-header")]
    header::write();
}

#[cfg(feature = "generate-header")]
mod header {
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    /// Regenerates `include/backend_bridge.h` for hosts that consume the C ABI.
    pub fn write() {
        let crate_dir =
            PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR missing"));
        let include_dir = crate_dir.join("include");
        fs::create_dir_all(&include_dir)
            .unwrap_or_else(|error| panic!("failed to create {include_dir:?}: {error}"));

        let output = include_dir.join("backend_bridge.h");
        let generator = cbindgen::generate(&crate_dir)
            .unwrap_or_else(|error| panic!("cbindgen failed: {error}"));
        if generator.write_to_file(&output) {
            println!("cargo:warning=Updated {output:?}");
        }
    }
}

use std::{env, path::Path};

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // host builds (unit tests) link normally
    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("none") {
        return;
    }
    let arch = env::var("CARGO_CFG_TARGET_ARCH").expect("cargo sets the target arch");
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("cargo sets the manifest dir");
    let script = Path::new(&manifest_dir).join(format!("linker-{arch}.ld"));
    println!("cargo:rustc-link-arg-bins=-T{}", script.display());
    println!("cargo:rerun-if-changed={}", script.display());
}

use std::env;

fn main() {
    println!("cargo::rustc-check-cfg=cfg(hv_bare_metal)");

    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    // Register access through inline asm is only meaningful when we own EL2.
    if arch == "aarch64" && os == "none" {
        println!("cargo:rustc-cfg=hv_bare_metal");
    }
}

use std::env;
use std::path::Path;

struct FabricLinkage {
    include_dirs: Vec<String>,
}

/// Try to link to an existing `libfabric` installation via `pkg-config`.
fn link_libfabric() -> Result<FabricLinkage, ()> {
    let lib = pkg_config::Config::new()
        .atleast_version("1.9.0")
        .statik(false)
        .probe("libfabric")
        .map_err(|_| ())?;

    Ok(FabricLinkage {
        include_dirs: lib
            .include_paths
            .iter()
            .map(|p| p.to_str().unwrap().to_owned())
            .collect(),
    })
}

/// Fall back to the default system search paths, assuming the development
/// headers are installed under `/usr/include` (the common case for a
/// distro package that does not ship a `.pc` file).
fn link_default() -> FabricLinkage {
    println!("cargo:rustc-link-lib=fabric");
    FabricLinkage {
        include_dirs: Vec::new(),
    }
}

fn main() {
    if cfg!(not(target_pointer_width = "64")) {
        panic!("`fabric-transport` currently only supports 64-bit platforms");
    }

    println!("cargo:rerun-if-changed=src/bindings/fabric.h");
    println!("cargo:rerun-if-env-changed=LIBFABRIC_INCLUDE_DIR");

    let link = link_libfabric().unwrap_or_else(|_| link_default());
    println!("cargo:rustc-cfg=have_libfabric");
    gen_fabric_bindings(link.include_dirs);
}

fn gen_fabric_bindings(include_dirs: Vec<String>) {
    let mut include_dirs = include_dirs;
    if let Ok(extra) = env::var("LIBFABRIC_INCLUDE_DIR") {
        include_dirs.push(extra);
    }
    let include_args = include_dirs.iter().map(|p| format!("-I{}", p));

    let bindings = bindgen::builder()
        .clang_args(include_args)
        .header("src/bindings/fabric.h")
        .allowlist_function("fi_.*")
        .allowlist_type("fi_.*")
        .allowlist_type("fid_.*")
        .allowlist_var("FI_.*")
        .blocklist_type("sockaddr.*")
        .blocklist_type("addrinfo")
        .blocklist_type("timespec")
        .bitfield_enum("fi_ep_type")
        .constified_enum_module("fi_cq_format")
        .constified_enum_module("fi_wait_obj")
        .derive_copy(true)
        .derive_debug(true)
        .derive_default(true)
        .generate_comments(true)
        .layout_tests(false)
        .prepend_enum_name(false)
        .size_t_is_usize(true)
        .disable_untagged_union()
        .generate()
        .expect("failed to generate libfabric bindings");

    let out_dir = env::var_os("OUT_DIR").unwrap();
    let dest = Path::new(&out_dir).join("fabric_bindings.rs");
    bindings
        .write_to_file(dest)
        .expect("failed to write libfabric bindings");
}

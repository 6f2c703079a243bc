//! Generates libibverbs bindings when the `verbs` feature is enabled.
//!
//! Without the feature nothing is linked, and only the in-process software
//! provider is available.

fn main() {
    // Refuse to compile on non-64-bit platforms.
    if cfg!(not(target_pointer_width = "64")) {
        panic!("`rrcomm` currently only supports 64-bit platforms");
    }

    #[cfg(feature = "verbs")]
    verbs::generate();
}

#[cfg(feature = "verbs")]
mod verbs {
    use std::env;
    use std::path::{Path, PathBuf};

    /// Find `libibverbs`, first through `pkg-config` and then through the
    /// `RDMA_CORE_LIB_DIR` / `RDMA_CORE_INCLUDE_DIR` overrides.
    fn link_rdma_core() -> Vec<PathBuf> {
        println!("cargo:rerun-if-env-changed=RDMA_CORE_LIB_DIR");
        println!("cargo:rerun-if-env-changed=RDMA_CORE_INCLUDE_DIR");

        if let Ok(lib_dir) = env::var("RDMA_CORE_LIB_DIR") {
            println!("cargo:rustc-link-search=native={}", lib_dir);
            println!("cargo:rustc-link-lib=ibverbs");
            return env::var("RDMA_CORE_INCLUDE_DIR")
                .map(|dir| vec![PathBuf::from(dir)])
                .unwrap_or_default();
        }

        // rdma-core registers `libibverbs` to `pkg-config`.
        match pkg_config::Config::new()
            .atleast_version("1.8.28")
            .statik(false)
            .probe("libibverbs")
        {
            Ok(lib) => lib.include_paths,
            Err(e) => panic!(
                "cannot find libibverbs ({}); install rdma-core or set RDMA_CORE_LIB_DIR",
                e
            ),
        }
    }

    pub fn generate() {
        println!("cargo:rerun-if-changed=src/bindings/verbs.h");
        let include_dirs = link_rdma_core();
        let include_args = include_dirs.iter().map(|p| format!("-I{}", p.display()));

        let bindings = bindgen::builder()
            .clang_args(include_args)
            .header("src/bindings/verbs.h")
            .allowlist_function("ibv_.*")
            .allowlist_type("ibv_.*")
            .opaque_type("pthread_.*")
            .blocklist_type("in6_addr")
            .blocklist_type("sockaddr.*")
            .blocklist_type("timespec")
            .blocklist_type("ibv_ah_attr")
            .blocklist_type("ibv_gid")
            .blocklist_type("ibv_global_route")
            .blocklist_type("ibv_send_wr")
            .blocklist_type("ibv_wc")
            .bitfield_enum("ibv_access_flags")
            .bitfield_enum("ibv_qp_attr_mask")
            .bitfield_enum("ibv_send_flags")
            .bitfield_enum("ibv_wc_flags")
            .constified_enum_module("ibv_mtu")
            .constified_enum_module("ibv_port_state")
            .constified_enum_module("ibv_wc_status")
            .constified_enum_module("ibv_wc_opcode")
            .constified_enum_module("ibv_qp_type")
            .constified_enum_module("ibv_qp_state")
            .constified_enum_module("ibv_wr_opcode")
            .derive_copy(true)
            .derive_debug(false)
            .derive_default(true)
            .generate_comments(false)
            .layout_tests(false)
            .prepend_enum_name(false)
            .size_t_is_usize(true)
            .disable_untagged_union()
            .generate()
            .expect("failed to generate bindings");

        let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo");
        let dest = Path::new(&out_dir).join("verbs_bindings.rs");
        bindings
            .write_to_file(dest)
            .expect("failed to write bindings");
    }
}

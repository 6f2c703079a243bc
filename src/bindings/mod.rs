//! Bindings of libibverbs C interfaces.
//!
//! Most items are generated by `bindgen` at build time. Types that bindgen
//! cannot lay out correctly (anonymous unions) and the `static inline` data
//! path functions of `verbs.h` are written by hand in `common`.

#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(deref_nullptr)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(unused)]

mod common;

mod private {
    use libc::*;
    include!(concat!(env!("OUT_DIR"), "/verbs_bindings.rs"));

    pub use super::common::*;
}

pub(crate) use self::private::*;

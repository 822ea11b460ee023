#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(deref_nullptr)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(unused)]

/// Hand-written wrappers for the libfabric calls that are `static inline`
/// functions in the C headers rather than exported symbols, so bindgen never
/// generates them, plus a few macro-only constants.
mod common;

mod private {
    use libc::*;
    include!(concat!(env!("OUT_DIR"), "/fabric_bindings.rs"));
}

pub(crate) use common::*;
pub(crate) use private::*;

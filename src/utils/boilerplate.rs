#![macro_use]

/// Implements the common `Deref`/`From`/`Send`/`Sync` boilerplate for a
/// `#[repr(transparent)]` wrapper around `NonNull<$fid_ty>`.
///
/// Every libfabric handle (`fid_fabric`, `fid_domain`, `fid_pep`, `fid_eq`,
/// `fid_cq`, `fid_ep`, `fid_mr`, ...) is a pointer to a C struct that the
/// provider guarantees stays valid until explicitly closed. Wrapping each in
/// its own newtype keeps the raw pointer out of safe code while letting every
/// resource module share the same close/drop shape.
macro_rules! impl_fid_wrapper_traits {
    ($fid_ty:ty, $wrapper_ty:ty) => {
        impl ::std::ops::Deref for $wrapper_ty {
            type Target = ::std::ptr::NonNull<$fid_ty>;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<::std::ptr::NonNull<$fid_ty>> for $wrapper_ty {
            fn from(pointer: ::std::ptr::NonNull<$fid_ty>) -> Self {
                Self(pointer)
            }
        }

        unsafe impl Send for $wrapper_ty {}
        unsafe impl Sync for $wrapper_ty {}
    };
}

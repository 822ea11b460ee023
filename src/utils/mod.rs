/// Shared `NonNull<fid_*>` wrapper boilerplate.
#[macro_use]
pub(crate) mod boilerplate;

/// Provide interoperability with libfabric's C return values.
pub(crate) mod interop;

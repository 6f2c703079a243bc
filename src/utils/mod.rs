/// Provide interoperability with C return values.
pub(crate) mod interop;

/// Provide the boilerplate of owned `libibverbs` handles.
#[macro_use]
pub(crate) mod boilerplate;

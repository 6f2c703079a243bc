#![macro_use]

/// Implement pointer access and thread-safety markers for a type that owns a
/// single `libibverbs` handle in field `0`.
macro_rules! impl_ibv_wrapper_traits {
    ($ibv_ty:ty, $wrapper_ty:ty) => {
        impl $wrapper_ty {
            #[inline]
            pub(crate) fn as_ptr(&self) -> *mut $ibv_ty {
                self.0.as_ptr()
            }
        }

        // SAFETY: libibverbs handles may be used from any thread.
        unsafe impl Send for $wrapper_ty {}
        unsafe impl Sync for $wrapper_ty {}
    };
}

//! Conversion between Rust function pointers and raw code addresses.

/// A function pointer type whose value is a code address.
pub trait FunctionHandle: Copy {
    fn code_address(self) -> usize;

    /// # Safety
    ///
    /// `address` must be the entry of a function with exactly this
    /// signature and calling convention.
    unsafe fn from_code_address(address: usize) -> Self;
}

macro_rules! impl_function_handle {
    (@one $ty:ty; $($arg:ident),*) => {
        impl<R, $($arg),*> FunctionHandle for $ty {
            fn code_address(self) -> usize {
                self as usize
            }

            unsafe fn from_code_address(address: usize) -> Self {
                // SAFETY: function pointers are address-sized; the caller
                // guarantees the signature.
                unsafe { std::mem::transmute_copy::<usize, Self>(&address) }
            }
        }
    };
    ($($arg:ident),*) => {
        impl_function_handle!(@one fn($($arg),*) -> R; $($arg),*);
        impl_function_handle!(@one unsafe fn($($arg),*) -> R; $($arg),*);
        impl_function_handle!(@one extern "C" fn($($arg),*) -> R; $($arg),*);
        impl_function_handle!(@one unsafe extern "C" fn($($arg),*) -> R; $($arg),*);
    };
}

impl_function_handle!();
impl_function_handle!(A);
impl_function_handle!(A, B);
impl_function_handle!(A, B, C);
impl_function_handle!(A, B, C, D);
impl_function_handle!(A, B, C, D, E);
impl_function_handle!(A, B, C, D, E, G);

// This module exposes a handful of C library functions from the host process to compiled
// scripts. The functions come from the libc the Rust standard library already links against,
// so no extra dependency is involved; registering them is just binding each name to the
// address the dynamic loader resolved for this process. Embedders that want a different set
// can register their own functions instead of, or on top of, this one.

//! Host C runtime registration.

use std::ffi::{c_char, c_int, c_void};

use crate::core::error::RegistryError;
use crate::core::registry::Registry;

extern "C" {
    fn printf(format: *const c_char, ...) -> c_int;
    fn puts(s: *const c_char) -> c_int;
    fn putchar(c: c_int) -> c_int;
    fn strlen(s: *const c_char) -> usize;
    fn strcmp(a: *const c_char, b: *const c_char) -> c_int;
    fn memcpy(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void;
    fn memset(dst: *mut c_void, c: c_int, n: usize) -> *mut c_void;
    fn malloc(size: usize) -> *mut c_void;
    fn free(ptr: *mut c_void);
    fn abs(x: c_int) -> c_int;
}

/// Names bound by [`register_c_runtime`].
pub const C_RUNTIME_FUNCTIONS: [&str; 10] = [
    "printf", "puts", "putchar", "strlen", "strcmp", "memcpy", "memset", "malloc", "free", "abs",
];

fn c_runtime_table() -> [(&'static str, usize); 10] {
    [
        ("printf", printf as *const () as usize),
        ("puts", puts as *const () as usize),
        ("putchar", putchar as *const () as usize),
        ("strlen", strlen as *const () as usize),
        ("strcmp", strcmp as *const () as usize),
        ("memcpy", memcpy as *const () as usize),
        ("memset", memset as *const () as usize),
        ("malloc", malloc as *const () as usize),
        ("free", free as *const () as usize),
        ("abs", abs as *const () as usize),
    ]
}

/// Register the host C runtime functions in `registry`.
///
/// Fails on the first name that is already bound when the registry does
/// not allow overwrites; names registered before that point stay bound.
pub fn register_c_runtime(registry: &Registry) -> Result<(), RegistryError> {
    for (name, address) in c_runtime_table() {
        registry.register_function(name, address)?;
    }
    log::debug!("host: registered {} C runtime functions", C_RUNTIME_FUNCTIONS.len());
    Ok(())
}

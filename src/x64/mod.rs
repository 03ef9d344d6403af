//! x86-64 architecture-specific components.
//!
//! - [`encoder`]: instruction encoding on top of iced-x86, jump stubs, disassembly
//! - [`register`]: register and operand-width descriptions
//! - [`calling_convention`]: System V argument assignment and frame layout
//! - [`function_codegen`]: code generation for one C function
//! - [`backend`]: the [`X64Backend`] compile backend

pub mod backend;
pub mod calling_convention;
pub mod encoder;
pub mod function_codegen;
pub mod register;

pub use backend::X64Backend;
pub use encoder::{disassemble, EncodingError, X64Encoder};

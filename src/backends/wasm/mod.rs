//! # WebAssembly text backend
//!
//! Lowers a stack-machine style stream of front end operations into a textual
//! WebAssembly module. Each function is lowered by a `FunctionCodegen` borrowed from
//! the `ModuleAssembler`, which owns data, declarations and the function table.
//!
//! ```text
//! front end ops -> FunctionCodegen -> CompiledFunction -> ModuleAssembler::finish -> .wat
//!                                                                            validator -> .wasm
//! ```

pub mod calling_convention;
pub mod control_flow;
pub mod function_codegen;
pub mod goto_labels;
pub mod module_assembler;
pub mod operand;
pub mod types;
pub mod validator;

#[cfg(test)]
#[path = "tests/test_support.rs"]
pub(crate) mod test_support;

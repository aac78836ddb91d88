//! Textual replay of the front end's call sequence, used by the CLI and the tests

pub mod driver;
pub mod parser;

use crate::backends::wasm::module_assembler::ModuleOutput;
use crate::compiler_messages::compiler_errors::CompilerError;
use crate::settings::BackendConfig;
use std::fs;
use std::path::Path;

pub fn compile_source(
    source: &str,
    file: Option<&Path>,
    config: &BackendConfig,
) -> Result<ModuleOutput, CompilerError> {
    let script = parser::parse_script(source, file)?;
    driver::compile_script(&script, config)
}

pub fn compile_file(path: &Path, config: &BackendConfig) -> Result<ModuleOutput, CompilerError> {
    let source = fs::read_to_string(path)
        .map_err(|e| CompilerError::file_error(path, format!("Couldn't read script: {e}")))?;
    compile_source(&source, Some(path), config)
}

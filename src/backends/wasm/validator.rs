//! Module validation
//!
//! The text module is assembled with `wat` and the resulting binary checked with `wasmparser`.
//! Either step failing means the backend produced an invalid module.

use crate::compiler_messages::compiler_errors::{CompilerError, ErrorMetaDataKey};
use crate::module_log;

/// Assembles module text into a validated binary
pub fn assemble_binary(module_text: &str) -> Result<Vec<u8>, CompilerError> {
    let bytes = wat::parse_str(module_text).map_err(|e| {
        CompilerError::validation_error(format!("Generated module text doesn't assemble: {e}"))
            .with_metadata(ErrorMetaDataKey::CompilationStage, "wat assembly")
    })?;

    validate_binary(&bytes)?;

    module_log!("assembled ", bytes.len(), " bytes");
    Ok(bytes)
}

pub fn validate_binary(bytes: &[u8]) -> Result<(), CompilerError> {
    match wasmparser::validate(bytes) {
        Ok(_) => Ok(()),
        Err(e) => Err(CompilerError::validation_error(format!(
            "Generated module failed validation at offset {}: {}",
            e.offset(),
            e.message()
        ))
        .with_metadata(ErrorMetaDataKey::CompilationStage, "binary validation")
        .with_metadata(
            ErrorMetaDataKey::PrimarySuggestion,
            "Inspect the generated .wat text around the failing function",
        )),
    }
}

#[cfg(test)]
#[path = "tests/validator_tests.rs"]
mod tests;

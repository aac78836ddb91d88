use crate::compiler_messages::compiler_errors::{CompilerError, ErrorMetaDataKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const IR_SCRIPT_EXTENSION: &str = "wir";
pub const CONFIG_FILE_NAME: &str = "wasmgen.toml";
pub const WASM_PAGE_SIZE: u32 = 65536;

// The single host import every module carries
pub const WRITE_IMPORT_NAME: &str = "fd_write";
pub const WRITE_IMPORT_SYMBOL: &str = "__wasi_fd_write";

// Module level globals, exported under these exact names
pub const MEMORY_BASE_GLOBAL: &str = "__memory_base";
pub const DATA_END_GLOBAL: &str = "__data_end";
pub const HEAP_BASE_GLOBAL: &str = "__heap_base";
pub const STACK_POINTER_GLOBAL: &str = "__stack_pointer";
pub const TABLE_BASE_GLOBAL: &str = "__table_base";
pub const MEMORY_EXPORT_NAME: &str = "memory";
pub const TABLE_EXPORT_NAME: &str = "__indirect_function_table";

// Per function locals the backend introduces
pub const GOTO_TARGET_LOCAL: &str = "$goto_target";
pub const GOTO_REACHED_LOCAL: &str = "$goto_reached";
pub const SRET_LOCAL: &str = "$sret";
pub const VA_AREA_LOCAL: &str = "$va";

// Rough guess at how many instructions a single IR operation expands into,
// used to size body buffers up front
pub const LINES_PER_OPERATION: usize = 4;

/// Layout and naming choices for generated modules.
/// Every field has a default, so an empty or partial `wasmgen.toml` is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    /// Address of the first data byte
    pub memory_base: u32,

    /// Minimum bytes between the end of data and the initial stack pointer
    pub heap_reserve: u32,

    pub stack_alignment: u32,
    pub min_memory_pages: u32,

    /// Module name of the byte-write import
    pub import_module: String,

    /// Index 0 stays empty so calling a null function pointer traps
    pub table_base: u32,

    pub export_functions: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            memory_base: 16,
            heap_reserve: 65536,
            stack_alignment: 8,
            min_memory_pages: 2,
            import_module: String::from("wasi_unstable"),
            table_base: 1,
            export_functions: true,
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<(), CompilerError> {
        if self.stack_alignment == 0 || !self.stack_alignment.is_power_of_two() {
            return Err(CompilerError::config_error(format!(
                "stack_alignment must be a power of two, found {}",
                self.stack_alignment
            ))
            .with_metadata(
                ErrorMetaDataKey::PrimarySuggestion,
                "Use 8, the natural alignment of the widest scalar",
            ));
        }

        // Frames rely on 8 byte slots for i64 and f64 values
        if self.stack_alignment < 8 {
            return Err(CompilerError::config_error(format!(
                "stack_alignment must be at least 8, found {}",
                self.stack_alignment
            )));
        }

        if self.min_memory_pages == 0 {
            return Err(CompilerError::config_error(
                "min_memory_pages must be at least 1",
            ));
        }

        if self.memory_base % 4 != 0 {
            return Err(CompilerError::config_error(format!(
                "memory_base must be 4 byte aligned, found {}",
                self.memory_base
            )));
        }

        if self.import_module.trim().is_empty() {
            return Err(CompilerError::config_error(
                "import_module can't be empty",
            ));
        }

        if self.table_base > i32::MAX as u32 {
            return Err(CompilerError::config_error(format!(
                "table_base {} doesn't fit a 32 bit table index",
                self.table_base
            )));
        }

        Ok(())
    }

    pub fn from_toml_str(source: &str) -> Result<BackendConfig, CompilerError> {
        let config: BackendConfig = match toml::from_str(source) {
            Ok(config) => config,
            Err(e) => return Err(CompilerError::config_error(e.to_string())),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Finds the config for a build.
///
/// An explicit path must exist. Otherwise `wasmgen.toml` next to the input is used
/// if there is one, and the defaults if not.
pub fn load_config(
    explicit_path: Option<&Path>,
    input_file: &Path,
) -> Result<BackendConfig, CompilerError> {
    let config_path: PathBuf = match explicit_path {
        Some(path) => path.to_path_buf(),
        None => {
            let beside_input = input_file
                .parent()
                .unwrap_or(Path::new(""))
                .join(CONFIG_FILE_NAME);

            if !beside_input.is_file() {
                return Ok(BackendConfig::default());
            }

            beside_input
        }
    };

    let source = match fs::read_to_string(&config_path) {
        Ok(source) => source,
        Err(e) => {
            return Err(CompilerError::file_error(
                &config_path,
                format!("Failed to read config file: {e}"),
            ));
        }
    };

    BackendConfig::from_toml_str(&source).map_err(|mut e| {
        e.location.file = Some(config_path);
        e
    })
}

#[cfg(test)]
#[path = "tests/settings_tests.rs"]
mod tests;

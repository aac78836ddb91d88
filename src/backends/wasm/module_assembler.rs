//! Module Assembler
//!
//! Owns everything that outlives a single function: static data, function declarations,
//! committed function bodies and the indirect call table.
//! Lifecycle: `new` -> data and functions in any order -> `finish` exactly once.
//!
//! Linear memory layout:
//! ```text
//! 0 .. memory_base             unused, so address 0 is never valid data
//! memory_base .. data_end      static data
//! data_end .. stack_pointer    the stack, growing down from stack_pointer
//! ```

use crate::backends::wasm::calling_convention::{FunctionDecl, Signature};
use crate::backends::wasm::function_codegen::{BodyLine, FunctionCodegen};
use crate::backends::wasm::types::ValueType;
use crate::compiler_messages::compiler_errors::CompilerError;
use crate::settings::{
    BackendConfig, DATA_END_GLOBAL, HEAP_BASE_GLOBAL, MEMORY_BASE_GLOBAL, MEMORY_EXPORT_NAME,
    STACK_POINTER_GLOBAL, TABLE_BASE_GLOBAL, TABLE_EXPORT_NAME, WASM_PAGE_SIZE, WRITE_IMPORT_NAME,
    WRITE_IMPORT_SYMBOL,
};
use crate::{module_log, return_compiler_error, return_link_error};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fmt::Write as _;

/// A function body ready for the module, waiting only on module level addresses
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    pub name: String,
    pub header: String,
    pub locals: Vec<String>,
    pub body: Vec<BodyLine>,
    pub table_refs: Vec<String>,
    pub call_refs: Vec<String>,
    pub data_refs: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct DataSymbol {
    offset: u32,
    size: u32,
}

#[derive(Debug, Clone)]
struct Relocation {
    symbol: String,
    offset: u32,
    target: String,
}

/// Where everything ended up, reported next to the module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryLayout {
    pub memory_base: u32,
    pub data_end: u32,
    pub heap_base: u32,
    pub stack_pointer: u32,
    pub memory_pages: u32,
    pub table_base: u32,
    pub table_size: u32,
    pub table_entries: Vec<String>,
    pub data_symbols: Vec<DataSymbolLayout>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataSymbolLayout {
    pub name: String,
    pub address: u32,
    pub size: u32,
}

impl MemoryLayout {
    pub fn to_json(&self) -> Result<String, CompilerError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CompilerError::compiler_error(format!("Failed to serialize layout: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct ModuleOutput {
    pub text: String,
    pub layout: MemoryLayout,
}

pub struct ModuleAssembler {
    config: BackendConfig,

    data: Vec<u8>,
    data_order: Vec<String>,
    data_symbols: FxHashMap<String, DataSymbol>,
    relocations: Vec<Relocation>,

    declarations: FxHashMap<String, FunctionDecl>,
    imports: Vec<String>,
    functions: Vec<CompiledFunction>,

    // Address taken functions in first use order
    table: Vec<String>,
    table_slots: FxHashMap<String, u32>,
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

fn escape_bytes(bytes: &[u8]) -> String {
    let mut escaped = String::with_capacity(bytes.len() * 3);
    for byte in bytes {
        let _ = write!(escaped, "\\{byte:02x}");
    }
    escaped
}

impl ModuleAssembler {
    pub fn new(config: &BackendConfig) -> Self {
        let mut assembler = ModuleAssembler {
            config: config.to_owned(),
            data: Vec::new(),
            data_order: Vec::new(),
            data_symbols: FxHashMap::default(),
            relocations: Vec::new(),
            declarations: FxHashMap::default(),
            imports: Vec::new(),
            functions: Vec::new(),
            table: Vec::new(),
            table_slots: FxHashMap::default(),
        };

        // The one host primitive: fd_write(fd, iovs, iovs_len, nwritten) -> errno
        let write_signature = Signature::new(
            vec![ValueType::int(false); 4],
            ValueType::int(false),
            false,
        );
        assembler.declarations.insert(
            WRITE_IMPORT_SYMBOL.to_owned(),
            FunctionDecl::new(WRITE_IMPORT_SYMBOL, write_signature, true),
        );
        assembler.imports.push(WRITE_IMPORT_SYMBOL.to_owned());

        assembler
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    // Functions

    /// Declares a function so it can be called or have its address taken.
    /// Declaring the same name twice is fine as long as the signatures agree.
    pub fn declare_function(&mut self, declaration: FunctionDecl) -> Result<(), CompilerError> {
        if let Some(existing) = self.declarations.get(&declaration.name) {
            if existing.signature != declaration.signature {
                return_link_error!(format!("Conflicting declarations of '{}'", declaration.name), {
                    FunctionName => declaration.name,
                })
            }
            return Ok(());
        }

        module_log!("declare ", declaration.name);
        self.declarations
            .insert(declaration.name.to_owned(), declaration);
        Ok(())
    }

    pub fn declaration(&self, name: &str) -> Option<&FunctionDecl> {
        self.declarations.get(name)
    }

    fn is_defined(&self, name: &str) -> bool {
        self.imports.iter().any(|import| import == name)
            || self.functions.iter().any(|function| function.name == name)
    }

    /// Starts lowering a function definition. The prologue is validated here,
    /// the body is only added to the module when the returned codegen finishes.
    pub fn begin_function(
        &mut self,
        declaration: FunctionDecl,
    ) -> Result<FunctionCodegen<'_>, CompilerError> {
        if self.is_defined(&declaration.name) {
            return_link_error!(format!("Function '{}' is defined twice", declaration.name), {
                FunctionName => declaration.name,
            })
        }

        declaration.header(self.config.export_functions)?;
        self.declare_function(declaration.to_owned())?;

        // A matching earlier declaration may have a different linkage, the definition wins
        self.declarations
            .insert(declaration.name.to_owned(), declaration.to_owned());

        let export = self.config.export_functions;
        let stack_alignment = self.config.stack_alignment;
        Ok(FunctionCodegen::new(self, declaration, export, stack_alignment))
    }

    pub(super) fn commit_function(&mut self, function: CompiledFunction) -> Result<(), CompilerError> {
        if self.is_defined(&function.name) {
            return_link_error!(format!("Function '{}' is defined twice", function.name), {
                FunctionName => function.name,
            })
        }

        for name in &function.table_refs {
            self.register_table_entry(name);
        }

        module_log!("commit function ", function.name);
        self.functions.push(function);
        Ok(())
    }

    fn register_table_entry(&mut self, name: &str) -> u32 {
        if let Some(index) = self.table_slots.get(name) {
            return *index;
        }

        let index = self.config.table_base + self.table.len() as u32;
        self.table.push(name.to_owned());
        self.table_slots.insert(name.to_owned(), index);
        index
    }

    // Data

    fn append_data(&mut self, name: &str, bytes: &[u8], align: u32) -> Result<u32, CompilerError> {
        if self.data_symbols.contains_key(name) {
            return_link_error!(format!("Data symbol '{name}' is defined twice"), {
                Construct => name,
            })
        }
        if !align.is_power_of_two() {
            return_compiler_error!("Data alignment isn't a power of two", {
                FoundType => align,
            })
        }

        let base = self.config.memory_base as u64;
        let aligned = align_up(base + self.data.len() as u64, align as u64) - base;
        self.data.resize(aligned as usize, 0);

        let offset = self.data.len() as u32;
        self.data.extend_from_slice(bytes);
        self.data_symbols.insert(
            name.to_owned(),
            DataSymbol {
                offset,
                size: bytes.len() as u32,
            },
        );
        self.data_order.push(name.to_owned());

        module_log!("data ", name, " at offset ", offset);
        Ok(offset)
    }

    /// Appends an initialized static object and returns its offset into the data section
    pub fn define_data(&mut self, name: &str, bytes: &[u8], align: u32) -> Result<u32, CompilerError> {
        self.append_data(name, bytes, align)
    }

    /// Appends a zero filled static object
    pub fn reserve_data(&mut self, name: &str, size: u32, align: u32) -> Result<u32, CompilerError> {
        self.append_data(name, &vec![0; size as usize], align)
    }

    /// Absolute address of a data symbol
    pub fn data_address(&self, name: &str) -> Option<u32> {
        self.data_symbols
            .get(name)
            .map(|symbol| self.config.memory_base + symbol.offset)
    }

    /// Stores the address of `target` (a data symbol or a function) as a 32 bit word
    /// at `offset` inside `symbol`. Resolved when the module finishes.
    pub fn relocate(&mut self, symbol: &str, offset: u32, target: &str) -> Result<(), CompilerError> {
        let Some(data_symbol) = self.data_symbols.get(symbol) else {
            return_link_error!(format!("Relocation in unknown data symbol '{symbol}'"), {
                Construct => symbol,
            })
        };

        if offset.saturating_add(4) > data_symbol.size {
            return_compiler_error!("Relocation outside its data symbol", {
                Construct => symbol,
                FoundType => offset,
                ExpectedType => data_symbol.size,
            })
        }

        self.relocations.push(Relocation {
            symbol: symbol.to_owned(),
            offset: data_symbol.offset + offset,
            target: target.to_owned(),
        });
        Ok(())
    }

    // Finalization

    fn check_references(&self) -> Result<(), CompilerError> {
        for function in &self.functions {
            for callee in &function.call_refs {
                if !self.is_defined(callee) {
                    return_link_error!(format!("Call to undefined function '{callee}'"), {
                        FunctionName => function.name,
                        Construct => callee,
                    })
                }
            }

            for name in &function.table_refs {
                if !self.is_defined(name) {
                    return_link_error!(format!("Address taken of undefined function '{name}'"), {
                        FunctionName => function.name,
                        Construct => name,
                    })
                }
            }

            for symbol in &function.data_refs {
                if !self.data_symbols.contains_key(symbol) {
                    return_link_error!(format!("Reference to undefined data symbol '{symbol}'"), {
                        FunctionName => function.name,
                        Construct => symbol,
                    })
                }
            }
        }
        Ok(())
    }

    fn apply_relocations(&mut self) -> Result<(), CompilerError> {
        for relocation in std::mem::take(&mut self.relocations) {
            let address = if let Some(address) = self.data_address(&relocation.target) {
                address
            } else if self.is_defined(&relocation.target) {
                self.register_table_entry(&relocation.target)
            } else {
                return_link_error!(format!("Unresolved relocation target '{}'", relocation.target), {
                    Construct => relocation.symbol,
                })
            };

            let start = relocation.offset as usize;
            self.data[start..start + 4].copy_from_slice(&address.to_le_bytes());
        }
        Ok(())
    }

    fn compute_layout(&self) -> Result<MemoryLayout, CompilerError> {
        let alignment = self.config.stack_alignment as u64;
        let data_end = self.config.memory_base as u64 + self.data.len() as u64;
        let stack_pointer =
            align_up(data_end, alignment) + align_up(self.config.heap_reserve as u64, alignment);
        let pages = stack_pointer
            .div_ceil(WASM_PAGE_SIZE as u64)
            .max(self.config.min_memory_pages as u64);

        if stack_pointer > u32::MAX as u64 || pages > 65536 {
            return_link_error!("Static data and stack don't fit in 32 bit memory", {
                FoundType => stack_pointer,
            })
        }

        let mut data_symbols = Vec::with_capacity(self.data_order.len());
        for name in &self.data_order {
            if let Some(symbol) = self.data_symbols.get(name) {
                data_symbols.push(DataSymbolLayout {
                    name: name.to_owned(),
                    address: self.config.memory_base + symbol.offset,
                    size: symbol.size,
                });
            }
        }

        Ok(MemoryLayout {
            memory_base: self.config.memory_base,
            data_end: data_end as u32,
            heap_base: stack_pointer as u32,
            stack_pointer: stack_pointer as u32,
            memory_pages: pages as u32,
            table_base: self.config.table_base,
            table_size: self.config.table_base + self.table.len() as u32,
            table_entries: self.table.to_owned(),
            data_symbols,
        })
    }

    fn render_line(&self, line: &BodyLine) -> Result<Vec<String>, CompilerError> {
        Ok(match line {
            BodyLine::Text(text) => vec![text.to_owned()],
            BodyLine::DataAddress { symbol, addend } => {
                let Some(address) = self.data_address(symbol) else {
                    return_link_error!(format!("Reference to undefined data symbol '{symbol}'"), {
                        Construct => symbol,
                    })
                };
                let offset = address as i64 - self.config.memory_base as i64 + *addend as i64;
                vec![
                    format!("global.get ${MEMORY_BASE_GLOBAL}"),
                    format!("i32.const {}", offset as i32),
                    String::from("i32.add"),
                ]
            }
            BodyLine::TableIndex(name) => match self.table_slots.get(name) {
                Some(index) => vec![format!("i32.const {index}")],
                None => return_compiler_error!(format!("Function '{name}' missing from the table")),
            },
            BodyLine::StackAdjust { .. }
            | BodyLine::SwitchDefaultGuard { .. }
            | BodyLine::LabelScope { .. }
            | BodyLine::GotoBranch { .. } => {
                return_compiler_error!("Function level placeholder reached the module")
            }
        })
    }

    fn render_function(&self, function: &CompiledFunction, out: &mut String) -> Result<(), CompilerError> {
        let _ = writeln!(out, "  {}", function.header);
        for local in &function.locals {
            let _ = writeln!(out, "    {local}");
        }

        let mut depth: usize = 2;
        for line in &function.body {
            for text in self.render_line(line)? {
                if text.starts_with("end") || text.starts_with("else") {
                    depth = depth.saturating_sub(1).max(2);
                }

                let _ = writeln!(out, "{}{text}", "  ".repeat(depth));

                if text.starts_with("block")
                    || text.starts_with("loop")
                    || text.starts_with("if")
                    || text.starts_with("else")
                {
                    depth += 1;
                }
            }
        }

        out.push_str("  )\n");
        Ok(())
    }

    /// Resolves every symbol and writes the module. Consumes the assembler, so it runs once.
    pub fn finish(mut self) -> Result<ModuleOutput, CompilerError> {
        self.check_references()?;
        self.apply_relocations()?;
        let layout = self.compute_layout()?;

        module_log!("data end ", layout.data_end, " stack pointer ", layout.stack_pointer);

        let mut out = String::with_capacity(4096);
        out.push_str("(module\n");
        let _ = writeln!(
            out,
            "  (import \"{}\" \"{WRITE_IMPORT_NAME}\" (func ${WRITE_IMPORT_SYMBOL} (param i32 i32 i32 i32) (result i32)))",
            self.config.import_module
        );
        let _ = writeln!(
            out,
            "  (memory (export \"{MEMORY_EXPORT_NAME}\") {})",
            layout.memory_pages
        );

        for function in &self.functions {
            self.render_function(function, &mut out)?;
        }

        let _ = writeln!(
            out,
            "  (global ${MEMORY_BASE_GLOBAL} (export \"{MEMORY_BASE_GLOBAL}\") i32 (i32.const {}))",
            layout.memory_base
        );
        let _ = writeln!(
            out,
            "  (global ${DATA_END_GLOBAL} (export \"{DATA_END_GLOBAL}\") i32 (i32.const {}))",
            layout.data_end
        );
        let _ = writeln!(
            out,
            "  (global ${HEAP_BASE_GLOBAL} (export \"{HEAP_BASE_GLOBAL}\") i32 (i32.const {}))",
            layout.heap_base
        );
        let _ = writeln!(
            out,
            "  (global ${STACK_POINTER_GLOBAL} (export \"{STACK_POINTER_GLOBAL}\") (mut i32) (i32.const {}))",
            layout.stack_pointer
        );
        let _ = writeln!(
            out,
            "  (global ${TABLE_BASE_GLOBAL} (export \"{TABLE_BASE_GLOBAL}\") i32 (i32.const {}))",
            layout.table_base
        );

        let _ = writeln!(
            out,
            "  (data (i32.const {}) \"{}\")",
            layout.memory_base,
            escape_bytes(&self.data)
        );

        let _ = writeln!(
            out,
            "  (table ${TABLE_EXPORT_NAME} (export \"{TABLE_EXPORT_NAME}\") {} funcref)",
            layout.table_size
        );
        for (position, name) in self.table.iter().enumerate() {
            let _ = writeln!(
                out,
                "  (elem (i32.const {}) func ${name})",
                layout.table_base + position as u32
            );
        }

        out.push_str(")\n");

        Ok(ModuleOutput { text: out, layout })
    }
}

#[cfg(test)]
#[path = "tests/module_assembler_tests.rs"]
mod tests;

//! Replays a parsed script against the backend.
//!
//! Top level items go straight to the `ModuleAssembler`, function bodies drive a
//! `FunctionCodegen` one operation at a time. Block tokens and frame variables are
//! tracked by name here, which is the bookkeeping a real front end would do.

use crate::backends::wasm::calling_convention::{FunctionDecl, Signature};
use crate::backends::wasm::control_flow::BlockToken;
use crate::backends::wasm::function_codegen::FunctionCodegen;
use crate::backends::wasm::module_assembler::{ModuleAssembler, ModuleOutput};
use crate::backends::wasm::types::ValueType;
use crate::compiler_messages::compiler_errors::{CompilerError, ErrorLocation, ErrorMetaDataKey};
use crate::ir_script::parser::{BodyLine, Item, Operation, Script, SignatureSpec, TypeSpec};
use crate::settings::BackendConfig;
use crate::{codegen_log, return_link_error, return_syntax_error};
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::rc::Rc;

/// Resolves a script type, looking up function pointer signatures with `lookup`
fn resolve_type<'a>(
    written: &TypeSpec,
    lookup: impl Fn(&str) -> Option<&'a FunctionDecl>,
) -> Result<ValueType, CompilerError> {
    match written {
        TypeSpec::Value(value_type) => Ok(value_type.to_owned()),
        TypeSpec::FunctionPointer(name) => match lookup(name) {
            Some(declaration) => Ok(ValueType::function(Rc::clone(&declaration.signature))),
            None => return_link_error!(format!("Function pointer type names undeclared function '{name}'"), {
                FunctionName => name,
            }),
        },
    }
}

fn resolve_signature(assembler: &ModuleAssembler, written: &SignatureSpec) -> Result<Signature, CompilerError> {
    let lookup = |name: &str| assembler.declaration(name);
    let result = resolve_type(&written.result, lookup)?;

    if !written.prototyped {
        return Ok(Signature::unprototyped(result));
    }

    let mut params = Vec::with_capacity(written.params.len());
    for param in &written.params {
        params.push(resolve_type(param, lookup)?);
    }
    Ok(Signature::new(params, result, written.variadic))
}

/// Names the script gave to tokens and frame variables in one function
struct FunctionScope {
    file: Option<PathBuf>,
    line: usize,
    tokens: FxHashMap<String, BlockToken>,
    frame_vars: FxHashMap<String, (i32, ValueType)>,
}

impl FunctionScope {
    fn location(&self) -> ErrorLocation {
        ErrorLocation::at_line(self.file.to_owned(), self.line)
    }

    fn token(&self, name: &str) -> Result<BlockToken, CompilerError> {
        match self.tokens.get(name) {
            Some(token) => Ok(*token),
            None => return_syntax_error!(format!("Unknown block token '@{name}'"), self.location()),
        }
    }

    fn bind(&mut self, name: &str, token: BlockToken) {
        self.tokens.insert(name.to_owned(), token);
    }

    /// Labels come into existence on their first mention, goto or definition
    fn label(&mut self, codegen: &mut FunctionCodegen, name: &str) -> BlockToken {
        if let Some(token) = self.tokens.get(name) {
            return *token;
        }
        let token = codegen.new_label();
        self.bind(name, token);
        token
    }
}

fn replay_operation(
    codegen: &mut FunctionCodegen,
    scope: &mut FunctionScope,
    operation: &Operation,
) -> Result<(), CompilerError> {
    match operation {
        Operation::Frame { var, value_type } => {
            let value_type = resolve_type(value_type, |name| codegen.lookup_function(name))?;
            if scope.frame_vars.contains_key(var) {
                return_syntax_error!(format!("Frame variable '{var}' declared twice"), scope.location())
            }
            let offset = codegen.allocate_frame(value_type.size(), value_type.align());
            scope.frame_vars.insert(var.to_owned(), (offset, value_type));
        }
        Operation::Var(var) => {
            let Some((offset, value_type)) = scope.frame_vars.get(var).cloned() else {
                return_syntax_error!(format!("Unknown frame variable '{var}'"), scope.location())
            };
            codegen.push_frame_variable(offset, value_type)?;
        }
        Operation::Param(index) => codegen.push_parameter(*index)?,
        Operation::Const { value_type, value } => {
            let value_type = resolve_type(value_type, |name| codegen.lookup_function(name))?;
            codegen.push_constant(*value, value_type)?;
        }
        Operation::Global { name, value_type } => {
            let value_type = resolve_type(value_type, |name| codegen.lookup_function(name))?;
            codegen.push_global(name, value_type)?;
        }
        Operation::Addr(symbol) => codegen.push_data_address(symbol)?,
        Operation::Function(name) => codegen.push_function(name)?,
        Operation::VariadicArea => codegen.push_variadic_area()?,

        Operation::Deref(value_type) => {
            let value_type = resolve_type(value_type, |name| codegen.lookup_function(name))?;
            codegen.deref(value_type)?;
        }
        Operation::AddressOf => codegen.address_of()?,
        Operation::Store => codegen.store()?,
        Operation::Pop => codegen.pop()?,
        Operation::Dup => codegen.dup()?,
        Operation::Arith(op) => codegen.arith(*op)?,
        Operation::Compare(op) => codegen.compare(*op)?,
        Operation::Not => codegen.logical_not()?,
        Operation::Convert(value_type) => {
            let value_type = resolve_type(value_type, |name| codegen.lookup_function(name))?;
            codegen.convert(value_type)?;
        }

        Operation::If(name) => {
            let token = codegen.open_if()?;
            scope.bind(name, token);
        }
        Operation::Else(name) => {
            let token = codegen.open_else(scope.token(name)?)?;
            scope.bind(name, token);
        }
        Operation::End(name) => codegen.close_block(scope.token(name)?)?,
        Operation::Block(name) => {
            let token = codegen.open_block()?;
            scope.bind(name, token);
        }
        Operation::Loop(name) => {
            let token = codegen.open_loop()?;
            scope.bind(name, token);
        }
        Operation::Break(name) => {
            let token = codegen.branch(scope.token(name)?)?;
            scope.bind(name, token);
        }
        Operation::BreakIf(name, when) => {
            let token = codegen.branch_if(scope.token(name)?, *when)?;
            scope.bind(name, token);
        }
        Operation::Continue(name) => codegen.continue_loop(scope.token(name)?)?,
        Operation::ContinueIf(name, when) => codegen.continue_loop_if(scope.token(name)?, *when)?,
        Operation::Join(name, jump_value) => {
            let token = codegen.reserve_join(*jump_value);
            scope.bind(name, token);
        }
        Operation::Pending(name) => codegen.push_pending_branch(scope.token(name)?)?,
        Operation::Yield(name) => codegen.yield_block_result(scope.token(name)?)?,
        Operation::BlockResult(name) => codegen.push_block_result(scope.token(name)?)?,
        Operation::Switch(name) => {
            let token = codegen.open_switch()?;
            scope.bind(name, token);
        }
        Operation::Case(name, value) => codegen.switch_case(scope.token(name)?, *value)?,
        Operation::Default(name) => codegen.switch_default(scope.token(name)?)?,
        Operation::Label(name) => {
            let token = scope.label(codegen, name);
            codegen.define_label(token)?;
        }
        Operation::Goto(name) => {
            let token = scope.label(codegen, name);
            codegen.goto(token)?;
        }

        Operation::Call(arg_count) => codegen.call(*arg_count)?,
        Operation::Return => codegen.gen_return()?,
        Operation::ComputedGoto => codegen.computed_goto()?,
        Operation::Vla => codegen.alloc_vla()?,
    }

    Ok(())
}

fn compile_function(
    assembler: &mut ModuleAssembler,
    file: &Option<PathBuf>,
    declaration: FunctionDecl,
    body: &[BodyLine],
) -> Result<(), CompilerError> {
    let name = declaration.name.to_owned();
    let mut codegen = assembler.begin_function(declaration)?;
    let mut scope = FunctionScope {
        file: file.to_owned(),
        line: 0,
        tokens: FxHashMap::default(),
        frame_vars: FxHashMap::default(),
    };

    for body_line in body {
        scope.line = body_line.line;
        codegen_log!(Dark "line ", body_line.line, " depth ", codegen.operand_depth());
        replay_operation(&mut codegen, &mut scope, &body_line.operation).map_err(|e| {
            e.with_function(&name)
                .with_line(file.to_owned(), body_line.line)
                .with_metadata(ErrorMetaDataKey::CompilationStage, "function body")
        })?;
    }

    codegen.finish().map_err(|e| e.with_function(&name))
}

/// Runs every item of the script and assembles the module
pub fn compile_script(script: &Script, config: &BackendConfig) -> Result<ModuleOutput, CompilerError> {
    let mut assembler = ModuleAssembler::new(config);
    let file = &script.file;

    for script_item in &script.items {
        let line = script_item.line;
        let result = match &script_item.item {
            Item::Data { name, bytes, align } => {
                assembler.define_data(name, bytes, *align).map(|_| ())
            }
            Item::ZeroData { name, size, align } => {
                assembler.reserve_data(name, *size, *align).map(|_| ())
            }
            Item::Relocation {
                symbol,
                offset,
                target,
            } => assembler.relocate(symbol, *offset, target),
            Item::Declare { name, signature } => resolve_signature(&assembler, signature)
                .and_then(|signature| {
                    assembler.declare_function(FunctionDecl::new(name, signature, false))
                }),
            Item::Function {
                name,
                signature,
                internal,
                body,
            } => resolve_signature(&assembler, signature)
                .map(|signature| FunctionDecl::new(name, signature, *internal))
                .and_then(|declaration| compile_function(&mut assembler, file, declaration, body))
                .map_err(|e| e.with_function(name)),
        };

        result.map_err(|e| e.with_line(file.to_owned(), line))?;
    }

    assembler.finish().map_err(|mut e| {
        if e.location.file.is_none() {
            e.location.file = file.to_owned();
        }
        e
    })
}

#[cfg(test)]
#[path = "tests/driver_tests.rs"]
mod tests;

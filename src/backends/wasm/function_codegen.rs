//! Per function code generation.
//!
//! A `FunctionCodegen` is created by `ModuleAssembler::begin_function` and receives the
//! front end's operations in program order. The body is buffered and only handed to the
//! assembler by `finish`, so a function that fails part way never reaches the module.

use crate::backends::wasm::calling_convention::FunctionDecl;
use crate::backends::wasm::control_flow::ControlFlowManager;
use crate::backends::wasm::goto_labels::LabelDispatch;
use crate::backends::wasm::module_assembler::{CompiledFunction, ModuleAssembler};
use crate::backends::wasm::operand::{
    ArithOp, CompareOp, Constant, Operand, OperandKind, OperandStack, constant_instruction,
};
use crate::backends::wasm::types::{MachineType, ValueType, conversion};
use crate::compiler_messages::compiler_errors::CompilerError;
use crate::settings::{GOTO_REACHED_LOCAL, GOTO_TARGET_LOCAL, LINES_PER_OPERATION};
use crate::{codegen_log, return_compiler_error, return_link_error, return_unsupported_error};

/// One entry of a buffered function body.
/// Some instructions depend on facts only known later and are resolved when rendered.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyLine {
    Text(String),

    // Needs the final frame size of this function
    StackAdjust { grow: bool },

    // Needs every case value of the switch
    SwitchDefaultGuard { switch_id: u32 },

    // Need the module's data layout and function table
    DataAddress { symbol: String, addend: i32 },
    TableIndex(String),

    // Opens a block's dispatch loop if a label ends up defined in it
    LabelScope { scope: u32 },

    // Needs the scope the label is defined in, `segments` are the open segments per scope
    GotoBranch { label: u32, segments: Vec<(u32, String)> },
}

pub struct FunctionCodegen<'a> {
    assembler: &'a mut ModuleAssembler,
    export: bool,
    stack_alignment: u32,

    pub(super) declaration: FunctionDecl,
    pub(super) operands: OperandStack,
    pub(super) body: Vec<BodyLine>,
    pub(super) slots: Vec<MachineType>,
    pub(super) blocks: ControlFlowManager,
    pub(super) labels: LabelDispatch,

    // Lowest frame offset handed out so far
    pub(super) frame_offset: i32,

    // Symbols this function needs from the module, committed with it
    pub(super) table_refs: Vec<String>,
    pub(super) call_refs: Vec<String>,
    pub(super) data_refs: Vec<String>,
}

impl<'a> FunctionCodegen<'a> {
    pub(super) fn new(
        assembler: &'a mut ModuleAssembler,
        declaration: FunctionDecl,
        export: bool,
        stack_alignment: u32,
    ) -> Self {
        FunctionCodegen {
            assembler,
            export,
            stack_alignment,
            declaration,
            operands: OperandStack::new(),
            body: Vec::with_capacity(32 * LINES_PER_OPERATION),
            slots: Vec::new(),
            blocks: ControlFlowManager::new(),
            labels: LabelDispatch::new(),
            frame_offset: 0,
            table_refs: Vec::new(),
            call_refs: Vec::new(),
            data_refs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.declaration.name
    }

    pub fn operand_depth(&self) -> usize {
        self.operands.len()
    }

    /// Looks up another function of the module, for function designators and pointer types
    pub fn lookup_function(&self, name: &str) -> Option<&FunctionDecl> {
        self.assembler.declaration(name)
    }

    pub(super) fn emit(&mut self, text: impl Into<String>) {
        self.body.push(BodyLine::Text(text.into()));
    }

    // Operand producers

    pub fn push_constant(&mut self, value: Constant, value_type: ValueType) -> Result<(), CompilerError> {
        value_type.machine_type()?;
        self.push_operand(Operand::value(OperandKind::Constant(value), value_type))
    }

    /// A variable stored in the frame at `offset` (from `allocate_frame`)
    pub fn push_frame_variable(&mut self, offset: i32, value_type: ValueType) -> Result<(), CompilerError> {
        if offset >= 0 || offset < self.frame_offset {
            return_compiler_error!("Frame variable outside the allocated frame", {
                FunctionName => self.declaration.name,
                FoundType => offset,
            })
        }
        self.push_operand(Operand::location(OperandKind::StackFrameRef(offset), value_type))
    }

    pub fn push_parameter(&mut self, index: u32) -> Result<(), CompilerError> {
        let Some(param) = self.declaration.signature.params.get(index as usize).cloned() else {
            return_compiler_error!("Parameter index out of range", {
                FunctionName => self.declaration.name,
                FoundType => index,
            })
        };
        self.push_operand(Operand::location(OperandKind::Parameter(index), param))
    }

    /// A static variable, as a location
    pub fn push_global(&mut self, symbol: &str, value_type: ValueType) -> Result<(), CompilerError> {
        self.push_operand(Operand::location(
            OperandKind::SymbolAddress {
                symbol: symbol.to_owned(),
                addend: 0,
            },
            value_type,
        ))
    }

    /// The address of a static symbol, as a pointer value
    pub fn push_data_address(&mut self, symbol: &str) -> Result<(), CompilerError> {
        self.push_operand(Operand::value(
            OperandKind::SymbolAddress {
                symbol: symbol.to_owned(),
                addend: 0,
            },
            ValueType::pointer(),
        ))
    }

    pub fn push_function(&mut self, name: &str) -> Result<(), CompilerError> {
        let Some(declaration) = self.assembler.declaration(name) else {
            return_link_error!(format!("Function '{name}' used before it was declared"), {
                FunctionName => name,
            })
        };
        let value_type = ValueType::function(declaration.signature.clone());
        self.push_operand(Operand::value(OperandKind::FunctionRef(name.to_owned()), value_type))
    }

    pub fn push_variadic_area(&mut self) -> Result<(), CompilerError> {
        if !self.declaration.signature.variadic {
            return_compiler_error!("Variadic area used in a function without variadic arguments", {
                FunctionName => self.declaration.name,
            })
        }
        self.push_operand(Operand::value(OperandKind::VariadicArea, ValueType::pointer()))
    }

    // Memory

    /// Turns the pointer on top of the stack into a location of `value_type`
    pub fn deref(&mut self, value_type: ValueType) -> Result<(), CompilerError> {
        let pointer = self.operands.pop()?;
        let pointer = self.settle(pointer)?;

        let kind = match (&pointer.kind, pointer.lvalue) {
            (OperandKind::Constant(Constant::Int(address)), false) => {
                OperandKind::Constant(Constant::Int(*address))
            }
            (OperandKind::SymbolAddress { .. }, false) | (OperandKind::StackFrameRef(_), false) => {
                pointer.kind.to_owned()
            }
            (OperandKind::LocalSlot(slot), false) => OperandKind::IndirectMemory(*slot),
            _ => OperandKind::IndirectMemory(self.materialize(&pointer)?),
        };

        self.push_operand(Operand::location(kind, value_type))
    }

    pub fn address_of(&mut self) -> Result<(), CompilerError> {
        let location = self.operands.pop()?;
        if !location.lvalue {
            return_compiler_error!("Address of a value that isn't a location", {
                TypeCode => location.value_type.code(),
            })
        }

        let kind = match location.kind {
            OperandKind::Parameter(index) => {
                return_unsupported_error!("taking the address of a function parameter", {
                    FunctionName => self.declaration.name,
                    FoundType => index,
                })
            }
            OperandKind::IndirectMemory(slot) => OperandKind::LocalSlot(slot),
            kind @ (OperandKind::Constant(_)
            | OperandKind::SymbolAddress { .. }
            | OperandKind::StackFrameRef(_)) => kind,
            other => {
                return_compiler_error!(format!("Operand {other:?} has no address"), {
                    TypeCode => location.value_type.code(),
                })
            }
        };

        self.push_operand(Operand::value(kind, ValueType::pointer()))
    }

    /// Pops a value and the location below it, stores, and pushes the stored value
    pub fn store(&mut self) -> Result<(), CompilerError> {
        let value = self.operands.pop()?;
        let value = self.settle(value)?;
        let destination = self.operands.pop()?;

        if !destination.lvalue {
            return_compiler_error!("Store to a value that isn't a location", {
                TypeCode => destination.value_type.code(),
            })
        }

        // Structure assignment copies the bytes
        if destination.value_type.is_aggregate() {
            if !value.value_type.is_aggregate() || !value.lvalue {
                return_compiler_error!("Structure assigned from a value that isn't a structure", {
                    ExpectedType => destination.value_type.code(),
                    FoundType => value.value_type.code(),
                })
            }
            self.emit_push_address(&destination)?;
            self.emit_push_address(&value)?;
            self.emit(format!("i32.const {}", destination.value_type.size()));
            self.emit("memory.copy");
            return self.push_operand(destination);
        }

        let expected = destination.value_type.machine_type()?;
        let found = self.value_machine_type(&value)?;
        if expected != found {
            return_compiler_error!("Stored value doesn't match the location's type", {
                ExpectedType => destination.value_type.code(),
                FoundType => value.value_type.code(),
            })
        }

        let slot = self.materialize(&value)?;
        match destination.kind {
            OperandKind::Parameter(index) => {
                self.emit(format!("local.get {slot}"));
                self.emit(format!("local.set $p{index}"));
            }
            _ => {
                let store = destination.value_type.store_instruction()?;
                self.emit_push_address(&destination)?;
                self.emit(format!("local.get {slot}"));
                self.emit(store);
            }
        }

        self.push_operand(Operand::value(
            OperandKind::LocalSlot(slot),
            destination.value_type,
        ))
    }

    // Stack shuffling

    pub fn pop(&mut self) -> Result<(), CompilerError> {
        let operand = self.operands.pop()?;

        // A join block still has to be closed even when its value is unused
        self.settle(operand)?;
        Ok(())
    }

    pub fn dup(&mut self) -> Result<(), CompilerError> {
        let top = self.operands.pop()?;
        let top = self.settle(top)?;
        self.operands.push(top.to_owned());
        self.operands.push(top);
        Ok(())
    }

    // Arithmetic

    fn pop_binary_operands(&mut self) -> Result<(Operand, Operand, MachineType), CompilerError> {
        let right = self.operands.pop()?;
        let right = self.settle(right)?;
        let left = self.operands.pop()?;
        let left = self.settle(left)?;

        let left_type = left.value_type.machine_type()?;
        let right_type = right.value_type.machine_type()?;
        if left_type != right_type {
            return_compiler_error!("Binary operands have different machine types", {
                ExpectedType => left.value_type.code(),
                FoundType => right.value_type.code(),
            })
        }

        Ok((left, right, left_type))
    }

    pub fn arith(&mut self, op: ArithOp) -> Result<(), CompilerError> {
        let (left, right, machine_type) = self.pop_binary_operands()?;

        // Check the operator before anything is emitted
        let mnemonic = op.mnemonic(machine_type)?;
        codegen_log!("arith ", mnemonic);

        let left_slot = self.materialize(&left)?;
        let right_slot = self.materialize(&right)?;
        let result = self.new_slot(machine_type);
        self.emit(format!("local.get {left_slot}"));
        self.emit(format!("local.get {right_slot}"));
        self.emit(mnemonic);
        self.emit(format!("local.set {result}"));

        self.push_operand(Operand::value(OperandKind::LocalSlot(result), left.value_type))
    }

    /// Records a comparison. Nothing is emitted until the result is consumed.
    pub fn compare(&mut self, op: CompareOp) -> Result<(), CompilerError> {
        let (left, right, machine_type) = self.pop_binary_operands()?;
        let left_slot = self.materialize(&left)?;
        let right_slot = self.materialize(&right)?;

        self.push_operand(Operand::value(
            OperandKind::PendingComparison {
                op,
                left: left_slot,
                right: right_slot,
                machine_type,
                negated: false,
            },
            ValueType::int(false),
        ))
    }

    pub fn logical_not(&mut self) -> Result<(), CompilerError> {
        let operand = self.operands.pop()?;
        let operand = self.settle(operand)?;

        if let OperandKind::PendingComparison {
            op,
            left,
            right,
            machine_type,
            negated,
        } = operand.kind
        {
            let (op, negated) = if machine_type.is_float() {
                (op, !negated)
            } else {
                (op.invert(), negated)
            };
            return self.push_operand(Operand::value(
                OperandKind::PendingComparison {
                    op,
                    left,
                    right,
                    machine_type,
                    negated,
                },
                operand.value_type,
            ));
        }

        let machine_type = operand.value_type.machine_type()?;
        let value = self.materialize(&operand)?;
        let zero = self.new_slot(machine_type);
        self.emit(constant_instruction(Constant::Int(0), machine_type));
        self.emit(format!("local.set {zero}"));

        self.push_operand(Operand::value(
            OperandKind::PendingComparison {
                op: CompareOp::Eq,
                left: value,
                right: zero,
                machine_type,
                negated: false,
            },
            ValueType::int(false),
        ))
    }

    pub fn convert(&mut self, target: ValueType) -> Result<(), CompilerError> {
        let operand = self.operands.pop()?;
        let operand = self.settle(operand)?;

        if target.is_void() {
            return_compiler_error!("Conversion to void", {
                FoundType => operand.value_type.code(),
            })
        }

        let instruction = conversion(&operand.value_type, &target)?;

        let Some(instruction) = instruction else {
            // Same machine type, only the tag changes
            if let (OperandKind::Constant(constant), false) = (&operand.kind, operand.lvalue) {
                let constant = *constant;
                return self.push_operand(Operand::value(OperandKind::Constant(constant), target));
            }
            let slot = self.materialize(&operand)?;
            return self.push_operand(Operand::value(OperandKind::LocalSlot(slot), target));
        };

        let source = self.materialize(&operand)?;
        let result = self.new_slot(target.machine_type()?);
        self.emit(format!("local.get {source}"));
        self.emit(instruction);
        self.emit(format!("local.set {result}"));
        self.push_operand(Operand::value(OperandKind::LocalSlot(result), target))
    }

    pub fn alloc_vla(&mut self) -> Result<(), CompilerError> {
        return_unsupported_error!("variable length arrays")
    }

    // Epilogue

    /// Checks the function is complete and hands it to the assembler
    pub fn finish(mut self) -> Result<(), CompilerError> {
        if let Some(open) = self.blocks.innermost() {
            return_compiler_error!("Block still open at the end of the function", {
                FunctionName => self.declaration.name,
                BlockId => open.token.id,
                BlockKind => open.token.kind.name(),
            })
        }

        if !self.operands.is_empty() {
            return_compiler_error!("Operands left on the stack at the end of the function", {
                FunctionName => self.declaration.name,
                FoundType => self.operands.len(),
            })
        }

        let header = self.declaration.header(self.export)?;
        let frame_size = self.frame_offset & -(self.stack_alignment as i32);

        let mut body = Vec::with_capacity(self.body.len() + 16);
        let dispatch_epilogue = if self.labels.is_active() {
            body.extend(self.dispatch_prologue().into_iter().map(BodyLine::Text));
            self.dispatch_epilogue()?
        } else {
            Vec::new()
        };

        for line in std::mem::take(&mut self.body) {
            match line {
                BodyLine::StackAdjust { grow } => {
                    let lines = self.render_stack_adjust(grow, frame_size);
                    body.extend(lines.into_iter().map(BodyLine::Text));
                }
                BodyLine::SwitchDefaultGuard { switch_id } => {
                    let lines = self.render_default_guard(switch_id)?;
                    body.extend(lines.into_iter().map(BodyLine::Text));
                }
                BodyLine::LabelScope { scope } => {
                    let lines = self.label_scope_prologue(scope);
                    body.extend(lines.into_iter().map(BodyLine::Text));
                }
                BodyLine::GotoBranch { label, segments } => {
                    body.push(BodyLine::Text(self.resolve_goto(label, &segments)?));
                }
                other => body.push(other),
            }
        }

        body.extend(dispatch_epilogue.into_iter().map(BodyLine::Text));

        // Falling off the end of a value returning function returns zero
        if let Some(result) = self.declaration.signature.lowered_result()? {
            body.push(BodyLine::Text(constant_instruction(Constant::Int(0), result)));
        }

        let mut locals: Vec<String> = self
            .slots
            .iter()
            .enumerate()
            .map(|(index, machine_type)| format!("(local $t{index} {machine_type})"))
            .collect();
        if self.labels.is_active() {
            locals.push(format!("(local {GOTO_TARGET_LOCAL} i32)"));
            locals.push(format!("(local {GOTO_REACHED_LOCAL} i32)"));
        }

        let compiled = CompiledFunction {
            name: self.declaration.name.to_owned(),
            header,
            locals,
            body,
            table_refs: std::mem::take(&mut self.table_refs),
            call_refs: std::mem::take(&mut self.call_refs),
            data_refs: std::mem::take(&mut self.data_refs),
        };

        codegen_log!("finished function ", compiled.name);
        self.assembler.commit_function(compiled)
    }
}

#[cfg(test)]
#[path = "tests/function_codegen_tests.rs"]
mod tests;

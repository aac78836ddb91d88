//! The operand stack and how each kind of operand turns into instructions.
//!
//! Operands are descriptions of where a value currently lives. Nothing is emitted
//! when they are pushed, only when a consumer materializes them as a value or an address.

use crate::backends::wasm::control_flow::BlockToken;
use crate::backends::wasm::function_codegen::{BodyLine, FunctionCodegen};
use crate::backends::wasm::types::{MachineType, ValueType};
use crate::compiler_messages::compiler_errors::CompilerError;
use crate::settings::{STACK_POINTER_GLOBAL, VA_AREA_LOCAL};
use crate::{codegen_log, return_compiler_error, return_unsupported_error};
use std::fmt;

/// A machine local owned by the backend, rendered as `$t<n>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$t{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    LtS,
    LtU,
    LeS,
    LeU,
    GtS,
    GtU,
    GeS,
    GeU,
}

impl CompareOp {
    pub fn from_name(name: &str) -> Option<CompareOp> {
        Some(match name {
            "eq" => CompareOp::Eq,
            "ne" => CompareOp::Ne,
            "lt_s" => CompareOp::LtS,
            "lt_u" => CompareOp::LtU,
            "le_s" => CompareOp::LeS,
            "le_u" => CompareOp::LeU,
            "gt_s" => CompareOp::GtS,
            "gt_u" => CompareOp::GtU,
            "ge_s" => CompareOp::GeS,
            "ge_u" => CompareOp::GeU,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::LtS => "lt_s",
            CompareOp::LtU => "lt_u",
            CompareOp::LeS => "le_s",
            CompareOp::LeU => "le_u",
            CompareOp::GtS => "gt_s",
            CompareOp::GtU => "gt_u",
            CompareOp::GeS => "ge_s",
            CompareOp::GeU => "ge_u",
        }
    }

    /// The comparison that is true exactly when this one is false (for integers).
    /// Floats can't use this because of NaN, they keep a negated flag instead.
    pub fn invert(self) -> CompareOp {
        match self {
            CompareOp::Eq => CompareOp::Ne,
            CompareOp::Ne => CompareOp::Eq,
            CompareOp::LtS => CompareOp::GeS,
            CompareOp::LtU => CompareOp::GeU,
            CompareOp::LeS => CompareOp::GtS,
            CompareOp::LeU => CompareOp::GtU,
            CompareOp::GtS => CompareOp::LeS,
            CompareOp::GtU => CompareOp::LeU,
            CompareOp::GeS => CompareOp::LtS,
            CompareOp::GeU => CompareOp::LtU,
        }
    }

    pub fn mnemonic(self, machine_type: MachineType) -> String {
        if !machine_type.is_float() {
            return format!("{machine_type}.{}", self.name());
        }

        let float_name = match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::LtS | CompareOp::LtU => "lt",
            CompareOp::LeS | CompareOp::LeU => "le",
            CompareOp::GtS | CompareOp::GtU => "gt",
            CompareOp::GeS | CompareOp::GeU => "ge",
        };
        format!("{machine_type}.{float_name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
}

impl ArithOp {
    pub fn from_name(name: &str) -> Option<ArithOp> {
        Some(match name {
            "add" => ArithOp::Add,
            "sub" => ArithOp::Sub,
            "mul" => ArithOp::Mul,
            "div_s" | "div" => ArithOp::DivS,
            "div_u" => ArithOp::DivU,
            "rem_s" => ArithOp::RemS,
            "rem_u" => ArithOp::RemU,
            "and" => ArithOp::And,
            "or" => ArithOp::Or,
            "xor" => ArithOp::Xor,
            "shl" => ArithOp::Shl,
            "shr_s" => ArithOp::ShrS,
            "shr_u" => ArithOp::ShrU,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::DivS => "div_s",
            ArithOp::DivU => "div_u",
            ArithOp::RemS => "rem_s",
            ArithOp::RemU => "rem_u",
            ArithOp::And => "and",
            ArithOp::Or => "or",
            ArithOp::Xor => "xor",
            ArithOp::Shl => "shl",
            ArithOp::ShrS => "shr_s",
            ArithOp::ShrU => "shr_u",
        }
    }

    pub fn mnemonic(self, machine_type: MachineType) -> Result<String, CompilerError> {
        if !machine_type.is_float() {
            return Ok(format!("{machine_type}.{}", self.name()));
        }

        let float_name = match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::DivS => "div",
            _ => {
                return_compiler_error!("Unknown operator for a floating point type", {
                    Operator => self.name(),
                    TypeCode => machine_type,
                })
            }
        };
        Ok(format!("{machine_type}.{float_name}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperandKind {
    Constant(Constant),

    /// A static data symbol. As a value it's the symbol's address.
    SymbolAddress { symbol: String, addend: i32 },

    /// A function designator, its value is the function's table index
    FunctionRef(String),

    LocalSlot(SlotId),

    /// Function parameters live in machine locals, never in memory
    Parameter(u32),

    /// Pointer to the caller's spilled variadic arguments
    VariadicArea,

    /// Offset from the stack pointer into the current frame
    StackFrameRef(i32),

    /// Memory at the address held in a slot
    IndirectMemory(SlotId),

    PendingComparison {
        op: CompareOp,
        left: SlotId,
        right: SlotId,
        machine_type: MachineType,
        negated: bool,
    },

    /// The value of a short circuit expression, known once its join block closes
    PendingBranch { join: BlockToken },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub kind: OperandKind,
    pub value_type: ValueType,

    // Denotes a location to load from or store to rather than a ready value
    pub lvalue: bool,
}

impl Operand {
    pub fn value(kind: OperandKind, value_type: ValueType) -> Self {
        Operand {
            kind,
            value_type,
            lvalue: false,
        }
    }

    pub fn location(kind: OperandKind, value_type: ValueType) -> Self {
        Operand {
            kind,
            value_type,
            lvalue: true,
        }
    }

    pub fn is_pending_branch(&self) -> bool {
        matches!(self.kind, OperandKind::PendingBranch { .. })
    }
}

#[derive(Debug, Default)]
pub struct OperandStack {
    operands: Vec<Operand>,
}

impl OperandStack {
    pub fn new() -> Self {
        OperandStack {
            operands: Vec::with_capacity(16),
        }
    }

    pub fn push(&mut self, operand: Operand) {
        self.operands.push(operand);
    }

    pub fn pop(&mut self) -> Result<Operand, CompilerError> {
        match self.operands.pop() {
            Some(operand) => Ok(operand),
            None => return_compiler_error!("Operand stack underflow"),
        }
    }

    pub fn top(&self) -> Option<&Operand> {
        self.operands.last()
    }

    pub fn len(&self) -> usize {
        self.operands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operands.is_empty()
    }
}

fn float_literal(value: f64, machine_type: MachineType) -> String {
    if value.is_nan() {
        return String::from("nan");
    }
    if value.is_infinite() {
        return String::from(if value > 0.0 { "inf" } else { "-inf" });
    }

    // f32 constants print their own shortest form so they read back to the same bits
    match machine_type {
        MachineType::F32 => format!("{:?}", value as f32),
        _ => format!("{value:?}"),
    }
}

pub fn constant_instruction(constant: Constant, machine_type: MachineType) -> String {
    match (constant, machine_type) {
        (Constant::Int(value), MachineType::I32) => format!("i32.const {}", value as i32),
        (Constant::Int(value), MachineType::I64) => format!("i64.const {value}"),
        (Constant::Int(value), float_type) => {
            format!("{float_type}.const {}", float_literal(value as f64, float_type))
        }
        (Constant::Float(value), MachineType::I32) => format!("i32.const {}", value as i32),
        (Constant::Float(value), MachineType::I64) => format!("i64.const {}", value as i64),
        (Constant::Float(value), float_type) => {
            format!("{float_type}.const {}", float_literal(value, float_type))
        }
    }
}

impl FunctionCodegen<'_> {
    pub(super) fn new_slot(&mut self, machine_type: MachineType) -> SlotId {
        let slot = SlotId(self.slots.len() as u32);
        self.slots.push(machine_type);
        slot
    }

    /// Every push goes through here so an unresolved branch join below the new operand
    /// is closed first, its block can't stay open across unrelated code.
    pub(super) fn push_operand(&mut self, operand: Operand) -> Result<(), CompilerError> {
        if self.operands.top().is_some_and(Operand::is_pending_branch) {
            let pending = self.operands.pop()?;
            let settled = self.settle(pending)?;
            self.operands.push(settled);
        }

        codegen_log!("push ", operand.value_type.code());
        self.operands.push(operand);
        Ok(())
    }

    /// Resolves a pending branch into a plain local, everything else is returned untouched
    pub(super) fn settle(&mut self, operand: Operand) -> Result<Operand, CompilerError> {
        if !operand.is_pending_branch() {
            return Ok(operand);
        }

        let slot = self.materialize(&operand)?;
        Ok(Operand::value(OperandKind::LocalSlot(slot), operand.value_type))
    }

    /// Leaves the operand's value in a local and returns it.
    pub(super) fn materialize(&mut self, operand: &Operand) -> Result<SlotId, CompilerError> {
        if let (OperandKind::LocalSlot(slot), false) = (&operand.kind, operand.lvalue) {
            return Ok(*slot);
        }

        let machine_type = self.value_machine_type(operand)?;
        self.emit_push_value(operand)?;
        let slot = self.new_slot(machine_type);
        self.emit(format!("local.set {slot}"));
        Ok(slot)
    }

    /// Aggregates are always handled through their address
    pub(super) fn value_machine_type(&self, operand: &Operand) -> Result<MachineType, CompilerError> {
        if operand.value_type.is_aggregate() {
            return Ok(MachineType::I32);
        }
        operand.value_type.machine_type()
    }

    /// Emits instructions leaving the operand's value on the machine stack
    pub(super) fn emit_push_value(&mut self, operand: &Operand) -> Result<(), CompilerError> {
        if operand.lvalue {
            if let OperandKind::Parameter(index) = operand.kind {
                self.emit(format!("local.get $p{index}"));
                return Ok(());
            }

            self.emit_push_address(operand)?;
            if !operand.value_type.is_aggregate() {
                let load = operand.value_type.load_instruction()?;
                self.emit(load);
            }
            return Ok(());
        }

        match &operand.kind {
            OperandKind::Constant(constant) => {
                let machine_type = self.value_machine_type(operand)?;
                self.emit(constant_instruction(*constant, machine_type));
            }

            OperandKind::SymbolAddress { symbol, addend } => {
                self.emit_data_address(symbol, *addend);
            }

            OperandKind::FunctionRef(name) => {
                self.table_refs.push(name.to_owned());
                self.body.push(BodyLine::TableIndex(name.to_owned()));
            }

            OperandKind::LocalSlot(slot) | OperandKind::IndirectMemory(slot) => {
                self.emit(format!("local.get {slot}"));
            }

            OperandKind::Parameter(index) => {
                self.emit(format!("local.get $p{index}"));
            }

            OperandKind::VariadicArea => {
                if !self.declaration.signature.variadic {
                    return_compiler_error!("Variadic area used in a function without variadic arguments", {
                        FunctionName => self.declaration.name,
                    })
                }
                self.emit(format!("local.get {VA_AREA_LOCAL}"));
            }

            OperandKind::StackFrameRef(offset) => {
                self.emit_frame_address(*offset);
            }

            OperandKind::PendingComparison {
                op,
                left,
                right,
                machine_type,
                negated,
            } => {
                self.emit(format!("local.get {left}"));
                self.emit(format!("local.get {right}"));
                self.emit(op.mnemonic(*machine_type));
                if *negated {
                    self.emit("i32.eqz");
                }
            }

            OperandKind::PendingBranch { join } => {
                self.close_join(*join)?;
            }
        }

        Ok(())
    }

    /// Emits the address an lvalue refers to
    pub(super) fn emit_push_address(&mut self, operand: &Operand) -> Result<(), CompilerError> {
        if !operand.lvalue {
            return_compiler_error!("Address requested for an operand that isn't a location", {
                TypeCode => operand.value_type.code(),
            })
        }

        match &operand.kind {
            OperandKind::Constant(Constant::Int(address)) => {
                self.emit(format!("i32.const {}", *address as i32));
            }
            OperandKind::SymbolAddress { symbol, addend } => {
                self.emit_data_address(symbol, *addend);
            }
            OperandKind::StackFrameRef(offset) => self.emit_frame_address(*offset),
            OperandKind::IndirectMemory(slot) => self.emit(format!("local.get {slot}")),
            OperandKind::Parameter(_) => {
                return_unsupported_error!("taking the address of a function parameter", {
                    FunctionName => self.declaration.name,
                })
            }
            other => {
                return_compiler_error!(format!("Operand {other:?} has no address"), {
                    TypeCode => operand.value_type.code(),
                })
            }
        }

        Ok(())
    }

    pub(super) fn emit_frame_address(&mut self, offset: i32) {
        self.emit(format!("global.get ${STACK_POINTER_GLOBAL}"));
        self.emit(format!("i32.const {offset}"));
        self.emit("i32.add");
    }

    fn emit_data_address(&mut self, symbol: &str, addend: i32) {
        self.data_refs.push(symbol.to_owned());
        self.body.push(BodyLine::DataAddress {
            symbol: symbol.to_owned(),
            addend,
        });
    }

    /// Pushes an `i32` that is non zero exactly when the operand's truth equals `when`.
    /// Pending comparisons are fused straight into the test instead of being stored first.
    pub(super) fn emit_condition(&mut self, operand: Operand, when: bool) -> Result<(), CompilerError> {
        if let OperandKind::PendingComparison {
            op,
            left,
            right,
            machine_type,
            negated,
        } = operand.kind
        {
            let (op, negated) = match (when, machine_type.is_float()) {
                (true, _) => (op, negated),
                (false, false) => (op.invert(), negated),
                (false, true) => (op, !negated),
            };
            let fused = Operand::value(
                OperandKind::PendingComparison {
                    op,
                    left,
                    right,
                    machine_type,
                    negated,
                },
                operand.value_type,
            );
            return self.emit_push_value(&fused);
        }

        let machine_type = self.value_machine_type(&operand)?;
        self.emit_push_value(&operand)?;

        match (machine_type, when) {
            (MachineType::I32, true) => {}
            (MachineType::I32, false) => self.emit("i32.eqz"),
            (MachineType::I64, true) => {
                self.emit("i64.eqz");
                self.emit("i32.eqz");
            }
            (MachineType::I64, false) => self.emit("i64.eqz"),
            (float_type, when) => {
                self.emit(constant_instruction(Constant::Float(0.0), float_type));
                self.emit(format!("{float_type}.{}", if when { "ne" } else { "eq" }));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/operand_tests.rs"]
mod tests;

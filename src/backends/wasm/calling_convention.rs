//! Calling Convention
//!
//! Lowered function parameters, in order:
//! 1. `$sret`, a pointer to caller owned memory, when the function returns a structure
//! 2. `$p0..$pN`, the fixed parameters as machine values
//! 3. `$va`, a pointer to the spilled variadic arguments, for variadic functions
//!
//! Callers move the stack pointer below their own frame for the duration of the call,
//! so the callee's frame relative addressing never overlaps the caller's locals.

use crate::backends::wasm::function_codegen::{BodyLine, FunctionCodegen};
use crate::backends::wasm::operand::{Operand, OperandKind, SlotId};
use crate::backends::wasm::types::{MachineType, ValueType};
use crate::compiler_messages::compiler_errors::CompilerError;
use crate::settings::{SRET_LOCAL, STACK_POINTER_GLOBAL, VA_AREA_LOCAL};
use crate::{codegen_log, return_compiler_error, return_unsupported_error};
use std::rc::Rc;

// Variadic arguments never get less than a word each
const MIN_VARIADIC_ALIGN: u32 = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub params: Vec<ValueType>,
    pub result: ValueType,
    pub variadic: bool,

    // Old style declarations give no parameter information at all
    pub prototyped: bool,
}

impl Signature {
    pub fn new(params: Vec<ValueType>, result: ValueType, variadic: bool) -> Self {
        Signature {
            params,
            result,
            variadic,
            prototyped: true,
        }
    }

    pub fn unprototyped(result: ValueType) -> Self {
        Signature {
            params: Vec::new(),
            result,
            variadic: false,
            prototyped: false,
        }
    }

    pub fn returns_aggregate(&self) -> bool {
        self.result.is_aggregate()
    }

    /// Machine types of the parameters after lowering, hidden pointers included
    pub fn lowered_params(&self) -> Result<Vec<MachineType>, CompilerError> {
        let mut lowered = Vec::with_capacity(self.params.len() + 2);
        if self.returns_aggregate() {
            lowered.push(MachineType::I32);
        }

        for param in &self.params {
            if param.is_aggregate() {
                return_unsupported_error!("structures passed by value", {
                    TypeCode => param.code(),
                })
            }
            lowered.push(param.machine_type()?);
        }

        if self.variadic {
            lowered.push(MachineType::I32);
        }
        Ok(lowered)
    }

    /// Structures come back through the hidden pointer, not as a result
    pub fn lowered_result(&self) -> Result<Option<MachineType>, CompilerError> {
        if self.result.is_void() || self.returns_aggregate() {
            return Ok(None);
        }
        Ok(Some(self.result.machine_type()?))
    }

    /// `(param ..) (result ..)` type use for `call_indirect`
    pub fn type_use(&self) -> Result<String, CompilerError> {
        let mut text = String::new();
        let params = self.lowered_params()?;
        if !params.is_empty() {
            text.push_str("(param");
            for param in params {
                text.push(' ');
                text.push_str(param.as_str());
            }
            text.push(')');
        }

        if let Some(result) = self.lowered_result()? {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&format!("(result {result})"));
        }
        Ok(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub signature: Rc<Signature>,

    // Internal linkage, never exported
    pub internal: bool,
}

impl FunctionDecl {
    pub fn new(name: impl Into<String>, signature: Signature, internal: bool) -> Self {
        FunctionDecl {
            name: name.into(),
            signature: Rc::new(signature),
            internal,
        }
    }

    /// The `(func ...)` header of a definition, up to and including the result
    pub fn header(&self, export: bool) -> Result<String, CompilerError> {
        let signature = &self.signature;
        if !signature.prototyped {
            return_unsupported_error!("unprototyped function definitions", {
                FunctionName => self.name,
            })
        }

        let mut header = format!("(func ${}", self.name);
        if export && !self.internal {
            header.push_str(&format!(" (export \"{}\")", self.name));
        }

        if signature.returns_aggregate() {
            header.push_str(&format!(" (param {SRET_LOCAL} i32)"));
        }
        for (index, param) in signature.params.iter().enumerate() {
            if param.is_aggregate() {
                return_unsupported_error!("structures passed by value", {
                    FunctionName => self.name,
                    TypeCode => param.code(),
                })
            }
            header.push_str(&format!(" (param $p{index} {})", param.machine_type()?));
        }
        if signature.variadic {
            header.push_str(&format!(" (param {VA_AREA_LOCAL} i32)"));
        }

        if let Some(result) = signature.lowered_result()? {
            header.push_str(&format!(" (result {result})"));
        }
        Ok(header)
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

impl FunctionCodegen<'_> {
    /// Reserves `size` bytes in the current frame and returns their stack pointer offset.
    /// Frames grow downwards so offsets are negative.
    pub fn allocate_frame(&mut self, size: u32, align: u32) -> i32 {
        let align = align.max(1) as i32;
        self.frame_offset = (self.frame_offset - size as i32) & -align;
        self.frame_offset
    }

    /// Pops `arg_count` arguments and the callee below them, then calls.
    ///
    /// A function designator is called directly, anything else holding a function
    /// value goes through the table.
    pub fn call(&mut self, arg_count: usize) -> Result<(), CompilerError> {
        let mut args = Vec::with_capacity(arg_count);
        for _ in 0..arg_count {
            args.push(self.operands.pop()?);
        }
        args.reverse();

        let callee = self.operands.pop()?;
        let Some(signature) = callee.value_type.signature().cloned() else {
            return_compiler_error!("Call through a value that isn't a function", {
                TypeCode => callee.value_type.code(),
            })
        };

        let direct_target = match (&callee.kind, callee.lvalue) {
            (OperandKind::FunctionRef(name), false) => Some(name.to_owned()),
            _ => None,
        };

        if direct_target.is_none() && !signature.prototyped {
            return_unsupported_error!("indirect calls through an unprototyped function type")
        }
        if args.iter().any(|arg| arg.value_type.is_aggregate())
            || signature.params.iter().any(ValueType::is_aggregate)
        {
            return_unsupported_error!("structures passed by value")
        }

        let fixed_count = if signature.prototyped {
            signature.params.len()
        } else {
            args.len()
        };
        if args.len() < fixed_count || (args.len() > fixed_count && !signature.variadic) {
            return_compiler_error!("Argument count doesn't match the callee's prototype", {
                ExpectedType => fixed_count,
                FoundType => args.len(),
            })
        }
        let variadic_args = args.split_off(fixed_count);

        codegen_log!("call with ", arg_count, " arguments");

        // Fixed arguments, evaluated in order
        let mut fixed_slots: Vec<SlotId> = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let found = self.value_machine_type(arg)?;
            if let Some(param) = signature.params.get(index) {
                let expected = param.machine_type()?;
                if expected != found {
                    return_compiler_error!("Argument type doesn't match the parameter", {
                        ExpectedType => expected,
                        FoundType => found,
                    })
                }
            }
            fixed_slots.push(self.materialize(arg)?);
        }

        let sret_offset = if signature.returns_aggregate() {
            Some(self.allocate_frame(signature.result.size(), signature.result.align()))
        } else {
            None
        };

        let spill_area = if signature.variadic {
            Some(self.spill_variadic_arguments(&variadic_args)?)
        } else {
            None
        };

        let table_index = match direct_target {
            Some(_) => None,
            None => Some(self.materialize(&callee)?),
        };

        // Frame addresses are taken before the stack pointer moves
        if let Some(offset) = sret_offset {
            self.emit_frame_address(offset);
        }
        for slot in &fixed_slots {
            self.emit(format!("local.get {slot}"));
        }
        if let Some(area) = spill_area {
            self.emit_frame_address(area);
        }

        self.body.push(BodyLine::StackAdjust { grow: true });

        match (&direct_target, table_index) {
            (Some(name), _) => {
                self.call_refs.push(name.to_owned());
                self.emit(format!("call ${name}"));
            }
            (None, Some(index)) => {
                self.emit(format!("local.get {index}"));
                let type_use = signature.type_use()?;
                if type_use.is_empty() {
                    self.emit("call_indirect");
                } else {
                    self.emit(format!("call_indirect {type_use}"));
                }
            }
            (None, None) => return_compiler_error!("Indirect call lost its table index"),
        }

        let result_slot = match signature.lowered_result()? {
            Some(machine_type) => {
                let slot = self.new_slot(machine_type);
                self.emit(format!("local.set {slot}"));
                Some(slot)
            }
            None => None,
        };

        self.body.push(BodyLine::StackAdjust { grow: false });

        if let Some(slot) = result_slot {
            self.push_operand(Operand::value(
                OperandKind::LocalSlot(slot),
                signature.result.to_owned(),
            ))?;
        } else if let Some(offset) = sret_offset {
            self.push_operand(Operand::location(
                OperandKind::StackFrameRef(offset),
                signature.result.to_owned(),
            ))?;
        }

        Ok(())
    }

    /// Stores variadic arguments in ascending order into a fresh frame area and
    /// returns the area's offset. The callee reads them back through `$va`.
    fn spill_variadic_arguments(&mut self, args: &[Operand]) -> Result<i32, CompilerError> {
        let mut layout = Vec::with_capacity(args.len());
        let mut area_size = 0;
        for arg in args {
            let machine_type = self.value_machine_type(arg)?;
            let align = machine_type.size().max(MIN_VARIADIC_ALIGN);
            let offset = align_up(area_size, align);
            area_size = offset + machine_type.size();
            layout.push((offset, machine_type));
        }

        let area = self.allocate_frame(area_size, 8);

        for (arg, (offset, machine_type)) in args.iter().zip(layout) {
            let slot = self.materialize(arg)?;
            self.emit_frame_address(area + offset as i32);
            self.emit(format!("local.get {slot}"));
            self.emit(format!("{machine_type}.store"));
        }

        Ok(area)
    }

    /// Returns from the function, popping the return value if there is one
    pub fn gen_return(&mut self) -> Result<(), CompilerError> {
        let result = self.declaration.signature.result.to_owned();
        if result.is_void() {
            self.emit("return");
            return Ok(());
        }

        let value = self.operands.pop()?;
        let value = self.settle(value)?;

        if result.is_aggregate() {
            if !value.value_type.is_aggregate() || !value.lvalue {
                return_compiler_error!("Structure return of a value that isn't a structure", {
                    ExpectedType => result.code(),
                    FoundType => value.value_type.code(),
                })
            }

            self.emit(format!("local.get {SRET_LOCAL}"));
            self.emit_push_address(&value)?;
            self.emit(format!("i32.const {}", result.size()));
            self.emit("memory.copy");
            self.emit("return");
            return Ok(());
        }

        let expected = result.machine_type()?;
        let found = self.value_machine_type(&value)?;
        if expected != found {
            return_compiler_error!("Returned value doesn't match the function's result type", {
                ExpectedType => expected,
                FoundType => found,
            })
        }

        self.emit_push_value(&value)?;
        self.emit("return");
        Ok(())
    }

    /// The stack pointer moves for calls, rendered once the final frame size is known
    pub(super) fn render_stack_adjust(&self, grow: bool, frame_size: i32) -> Vec<String> {
        if frame_size == 0 {
            return Vec::new();
        }

        vec![
            format!("global.get ${STACK_POINTER_GLOBAL}"),
            format!("i32.const {frame_size}"),
            String::from(if grow { "i32.add" } else { "i32.sub" }),
            format!("global.set ${STACK_POINTER_GLOBAL}"),
        ]
    }
}

#[cfg(test)]
#[path = "tests/calling_convention_tests.rs"]
mod tests;

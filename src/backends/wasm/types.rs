//! Source scalar types and their mapping onto the four WebAssembly value types.
//!
//! Everything narrower than 32 bits lives in an `i32` while on the operand stack,
//! only loads and stores care about the real width.

use crate::backends::wasm::calling_convention::Signature;
use crate::compiler_messages::compiler_errors::CompilerError;
use crate::return_compiler_error;
use std::fmt;
use std::rc::Rc;

pub const POINTER_SIZE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineType {
    I32,
    I64,
    F32,
    F64,
}

impl MachineType {
    pub fn as_str(self) -> &'static str {
        match self {
            MachineType::I32 => "i32",
            MachineType::I64 => "i64",
            MachineType::F32 => "f32",
            MachineType::F64 => "f64",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, MachineType::F32 | MachineType::F64)
    }

    pub fn size(self) -> u32 {
        match self {
            MachineType::I32 | MachineType::F32 => 4,
            MachineType::I64 | MachineType::F64 => 8,
        }
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Void,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Pointer,

    // A function designator. Calls read the signature from here,
    // as a value it decays to its table index.
    Function(Rc<Signature>),

    Aggregate { size: u32, align: u32 },
}

/// The semantic type of an operand.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueType {
    pub kind: TypeKind,
    pub unsigned: bool,
}

impl ValueType {
    pub fn new(kind: TypeKind, unsigned: bool) -> Self {
        ValueType { kind, unsigned }
    }

    pub fn void() -> Self {
        ValueType::new(TypeKind::Void, false)
    }

    pub fn int(unsigned: bool) -> Self {
        ValueType::new(TypeKind::Int, unsigned)
    }

    pub fn long(unsigned: bool) -> Self {
        ValueType::new(TypeKind::Long, unsigned)
    }

    pub fn float() -> Self {
        ValueType::new(TypeKind::Float, false)
    }

    pub fn double() -> Self {
        ValueType::new(TypeKind::Double, false)
    }

    /// Pointers compare and extend as unsigned values
    pub fn pointer() -> Self {
        ValueType::new(TypeKind::Pointer, true)
    }

    pub fn function(signature: Rc<Signature>) -> Self {
        ValueType::new(TypeKind::Function(signature), true)
    }

    pub fn aggregate(size: u32, align: u32) -> Self {
        ValueType::new(TypeKind::Aggregate { size, align }, false)
    }

    pub fn is_void(&self) -> bool {
        self.kind == TypeKind::Void
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.kind, TypeKind::Aggregate { .. })
    }

    pub fn signature(&self) -> Option<&Rc<Signature>> {
        match &self.kind {
            TypeKind::Function(signature) => Some(signature),
            _ => None,
        }
    }

    pub fn machine_type(&self) -> Result<MachineType, CompilerError> {
        match self.kind {
            TypeKind::Byte
            | TypeKind::Short
            | TypeKind::Int
            | TypeKind::Pointer
            | TypeKind::Function(_) => Ok(MachineType::I32),
            TypeKind::Long => Ok(MachineType::I64),
            TypeKind::Float => Ok(MachineType::F32),
            TypeKind::Double => Ok(MachineType::F64),
            TypeKind::Void | TypeKind::Aggregate { .. } => {
                return_compiler_error!("Type has no machine representation", {
                    TypeCode => self.code(),
                })
            }
        }
    }

    /// Bytes occupied in linear memory
    pub fn size(&self) -> u32 {
        match self.kind {
            TypeKind::Void => 0,
            TypeKind::Byte => 1,
            TypeKind::Short => 2,
            TypeKind::Int | TypeKind::Float | TypeKind::Pointer | TypeKind::Function(_) => {
                POINTER_SIZE
            }
            TypeKind::Long | TypeKind::Double => 8,
            TypeKind::Aggregate { size, .. } => size,
        }
    }

    pub fn align(&self) -> u32 {
        match self.kind {
            TypeKind::Void => 1,
            TypeKind::Aggregate { align, .. } => align.max(1),
            _ => self.size(),
        }
    }

    pub fn load_instruction(&self) -> Result<String, CompilerError> {
        let suffix = if self.unsigned { 'u' } else { 's' };
        Ok(match self.kind {
            TypeKind::Byte => format!("i32.load8_{suffix}"),
            TypeKind::Short => format!("i32.load16_{suffix}"),
            _ => format!("{}.load", self.machine_type()?),
        })
    }

    pub fn store_instruction(&self) -> Result<String, CompilerError> {
        Ok(match self.kind {
            TypeKind::Byte => String::from("i32.store8"),
            TypeKind::Short => String::from("i32.store16"),
            _ => format!("{}.store", self.machine_type()?),
        })
    }

    /// Short type code used in diagnostics and the IR script
    pub fn code(&self) -> String {
        let sign = if self.unsigned { "u" } else { "i" };
        match &self.kind {
            TypeKind::Void => String::from("void"),
            TypeKind::Byte => format!("{sign}8"),
            TypeKind::Short => format!("{sign}16"),
            TypeKind::Int => format!("{sign}32"),
            TypeKind::Long => format!("{sign}64"),
            TypeKind::Float => String::from("f32"),
            TypeKind::Double => String::from("f64"),
            TypeKind::Pointer => String::from("ptr"),
            TypeKind::Function(_) => String::from("fn"),
            TypeKind::Aggregate { size, align } => format!("struct:{size}:{align}"),
        }
    }
}

/// The instruction converting a `from` value into a `to` value, if one is needed.
///
/// Types sharing a machine type convert for free, only the tag changes.
/// Integer widening uses the source signedness, float to integer truncation the destination's.
pub fn conversion(from: &ValueType, to: &ValueType) -> Result<Option<String>, CompilerError> {
    let source = from.machine_type()?;
    let target = to.machine_type()?;

    if source == target {
        return Ok(None);
    }

    let source_sign = if from.unsigned { 'u' } else { 's' };
    let target_sign = if to.unsigned { 'u' } else { 's' };

    let instruction = match (source, target) {
        (MachineType::I32, MachineType::I64) => format!("i64.extend_i32_{source_sign}"),
        (MachineType::I64, MachineType::I32) => String::from("i32.wrap_i64"),
        (MachineType::F32, MachineType::F64) => String::from("f64.promote_f32"),
        (MachineType::F64, MachineType::F32) => String::from("f32.demote_f64"),
        (s, t) if s.is_float() && !t.is_float() => format!("{t}.trunc_{s}_{target_sign}"),
        (s, t) if !s.is_float() && t.is_float() => format!("{t}.convert_{s}_{source_sign}"),
        _ => {
            return_compiler_error!("Can't convert between these types", {
                FoundType => from.code(),
                ExpectedType => to.code(),
            })
        }
    };

    Ok(Some(instruction))
}

#[cfg(test)]
#[path = "tests/types_tests.rs"]
mod tests;

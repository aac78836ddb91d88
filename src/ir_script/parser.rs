//! IR script parser
//!
//! A line oriented text format replaying what a front end would ask of the backend.
//! Each line is one item, `#` starts a comment (outside of quoted data).
//!
//! ```text
//! data greeting "hi\n" align 1
//! declare puts (ptr)->i32
//! func main ()->i32
//!     addr greeting
//!     ...
//! endfunc
//! ```

use crate::backends::wasm::operand::{ArithOp, CompareOp, Constant};
use crate::backends::wasm::types::{TypeKind, ValueType};
use crate::compiler_messages::compiler_errors::{CompilerError, ErrorLocation};
use crate::return_syntax_error;
use std::path::{Path, PathBuf};

/// A type as written in the script. Function pointers name a declared function
/// whose signature is only known once the backend has seen the declaration.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSpec {
    Value(ValueType),
    FunctionPointer(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignatureSpec {
    pub params: Vec<TypeSpec>,
    pub result: TypeSpec,
    pub variadic: bool,
    pub prototyped: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    // Operands
    Frame { var: String, value_type: TypeSpec },
    Var(String),
    Param(u32),
    Const { value_type: TypeSpec, value: Constant },
    Global { name: String, value_type: TypeSpec },
    Addr(String),
    Function(String),
    VariadicArea,

    // Memory, stack and arithmetic
    Deref(TypeSpec),
    AddressOf,
    Store,
    Pop,
    Dup,
    Arith(ArithOp),
    Compare(CompareOp),
    Not,
    Convert(TypeSpec),

    // Blocks, named by `@token`
    If(String),
    Else(String),
    End(String),
    Block(String),
    Loop(String),
    Break(String),
    BreakIf(String, bool),
    Continue(String),
    ContinueIf(String, bool),
    Join(String, bool),
    Pending(String),
    Yield(String),
    BlockResult(String),
    Switch(String),
    Case(String, i64),
    Default(String),
    Label(String),
    Goto(String),

    // Calls
    Call(usize),
    Return,

    ComputedGoto,
    Vla,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BodyLine {
    pub line: usize,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Data {
        name: String,
        bytes: Vec<u8>,
        align: u32,
    },
    ZeroData {
        name: String,
        size: u32,
        align: u32,
    },
    Relocation {
        symbol: String,
        offset: u32,
        target: String,
    },
    Declare {
        name: String,
        signature: SignatureSpec,
    },
    Function {
        name: String,
        signature: SignatureSpec,
        internal: bool,
        body: Vec<BodyLine>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptItem {
    pub line: usize,
    pub item: Item,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub file: Option<PathBuf>,
    pub items: Vec<ScriptItem>,
}

struct LineParser<'a> {
    file: Option<&'a Path>,
    line: usize,
}

impl LineParser<'_> {
    fn location(&self) -> ErrorLocation {
        ErrorLocation::at_line(self.file.map(Path::to_path_buf), self.line)
    }

    fn error<T>(&self, msg: impl Into<String>) -> Result<T, CompilerError> {
        return_syntax_error!(msg, self.location())
    }

    fn expect_args(&self, keyword: &str, args: &[&str], count: usize) -> Result<(), CompilerError> {
        if args.len() != count {
            return self.error(format!(
                "'{keyword}' takes {count} argument(s), found {}",
                args.len()
            ));
        }
        Ok(())
    }

    fn parse_type(&self, text: &str) -> Result<TypeSpec, CompilerError> {
        let value_type = match text {
            "void" => ValueType::void(),
            "i8" => ValueType::new(TypeKind::Byte, false),
            "u8" => ValueType::new(TypeKind::Byte, true),
            "i16" => ValueType::new(TypeKind::Short, false),
            "u16" => ValueType::new(TypeKind::Short, true),
            "i32" => ValueType::int(false),
            "u32" => ValueType::int(true),
            "i64" => ValueType::long(false),
            "u64" => ValueType::long(true),
            "f32" => ValueType::float(),
            "f64" => ValueType::double(),
            "ptr" => ValueType::pointer(),
            _ => {
                if let Some(name) = text.strip_prefix("fnptr:") {
                    if name.is_empty() {
                        return self.error("Function pointer type without a function name");
                    }
                    return Ok(TypeSpec::FunctionPointer(name.to_owned()));
                }

                let Some(layout) = text.strip_prefix("struct:") else {
                    return self.error(format!("Unknown type '{text}'"));
                };
                let Some((size, align)) = layout.split_once(':') else {
                    return self.error(format!("Structure type '{text}' needs struct:SIZE:ALIGN"));
                };
                let size = self.parse_number::<u32>(size, "structure size")?;
                let align = self.parse_number::<u32>(align, "structure alignment")?;
                if !align.is_power_of_two() {
                    return self.error(format!("Structure alignment {align} isn't a power of two"));
                }
                ValueType::aggregate(size, align)
            }
        };

        Ok(TypeSpec::Value(value_type))
    }

    /// `(T,T,...)->T`, `(?)->T` for an old style declaration
    fn parse_signature(&self, text: &str) -> Result<SignatureSpec, CompilerError> {
        let Some((params, result)) = text.split_once("->") else {
            return self.error(format!("Signature '{text}' is missing '->'"));
        };
        let Some(params) = params
            .strip_prefix('(')
            .and_then(|params| params.strip_suffix(')'))
        else {
            return self.error(format!("Signature parameters '{params}' need parentheses"));
        };

        let result = self.parse_type(result)?;

        if params == "?" {
            return Ok(SignatureSpec {
                params: Vec::new(),
                result,
                variadic: false,
                prototyped: false,
            });
        }

        let mut parsed = Vec::new();
        let mut variadic = false;
        if !params.is_empty() {
            let parts: Vec<&str> = params.split(',').map(str::trim).collect();
            for (index, part) in parts.iter().enumerate() {
                if *part == "..." {
                    if index + 1 != parts.len() {
                        return self.error("'...' has to be the last parameter");
                    }
                    variadic = true;
                    continue;
                }
                parsed.push(self.parse_type(part)?);
            }
        }

        Ok(SignatureSpec {
            params: parsed,
            result,
            variadic,
            prototyped: true,
        })
    }

    fn parse_number<T: std::str::FromStr>(&self, text: &str, what: &str) -> Result<T, CompilerError> {
        match text.parse::<T>() {
            Ok(value) => Ok(value),
            Err(_) => self.error(format!("Invalid {what} '{text}'")),
        }
    }

    fn parse_bool(&self, text: &str) -> Result<bool, CompilerError> {
        match text {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => self.error(format!("Expected true or false, found '{text}'")),
        }
    }

    fn parse_token(&self, text: &str) -> Result<String, CompilerError> {
        match text.strip_prefix('@') {
            Some(name) if !name.is_empty() => Ok(name.to_owned()),
            _ => self.error(format!("Expected a block token like '@name', found '{text}'")),
        }
    }

    fn parse_constant(&self, value_type: &TypeSpec, text: &str) -> Result<Constant, CompilerError> {
        let is_float = matches!(
            value_type,
            TypeSpec::Value(ValueType {
                kind: TypeKind::Float | TypeKind::Double,
                ..
            })
        );

        if is_float {
            let value = match text {
                "nan" => f64::NAN,
                "inf" => f64::INFINITY,
                "-inf" => f64::NEG_INFINITY,
                _ => self.parse_number::<f64>(text, "float constant")?,
            };
            return Ok(Constant::Float(value));
        }

        if let Some(hex) = text.strip_prefix("0x") {
            return match u64::from_str_radix(hex, 16) {
                Ok(value) => Ok(Constant::Int(value as i64)),
                Err(_) => self.error(format!("Invalid hex constant '{text}'")),
            };
        }

        // Unsigned 64 bit constants above i64::MAX keep their bit pattern
        match text.parse::<i64>() {
            Ok(value) => Ok(Constant::Int(value)),
            Err(_) => Ok(Constant::Int(self.parse_number::<u64>(text, "integer constant")? as i64)),
        }
    }

    fn parse_align(&self, args: &[&str]) -> Result<u32, CompilerError> {
        match args {
            [] => Ok(1),
            ["align", value] => {
                let align = self.parse_number::<u32>(value, "alignment")?;
                if !align.is_power_of_two() {
                    return self.error(format!("Alignment {align} isn't a power of two"));
                }
                Ok(align)
            }
            _ => self.error("Expected 'align N' after the data"),
        }
    }

    fn parse_data(&self, rest: &str) -> Result<Item, CompilerError> {
        let rest = rest.trim();
        let Some((name, value)) = rest.split_once(char::is_whitespace) else {
            return self.error("'data' needs a name and a value");
        };
        let value = value.trim_start();

        if let Some(quoted) = value.strip_prefix('"') {
            let Some(end) = quoted.rfind('"') else {
                return self.error("Unterminated data string");
            };
            let bytes = self.unescape(&quoted[..end])?;
            let tail: Vec<&str> = quoted[end + 1..].split_whitespace().collect();
            return Ok(Item::Data {
                name: name.to_owned(),
                bytes,
                align: self.parse_align(&tail)?,
            });
        }

        let parts: Vec<&str> = value.split_whitespace().collect();
        match parts.as_slice() {
            ["zero", size, tail @ ..] => Ok(Item::ZeroData {
                name: name.to_owned(),
                size: self.parse_number::<u32>(size, "data size")?,
                align: self.parse_align(tail)?,
            }),
            _ => self.error("Data value must be a quoted string or 'zero SIZE'"),
        }
    }

    fn unescape(&self, text: &str) -> Result<Vec<u8>, CompilerError> {
        let mut bytes = Vec::with_capacity(text.len());
        let raw = text.as_bytes();
        let mut index = 0;

        while index < raw.len() {
            let byte = raw[index];
            index += 1;
            if byte != b'\\' {
                bytes.push(byte);
                continue;
            }

            let Some(escape) = raw.get(index) else {
                return self.error("Data string ends in a lone backslash");
            };
            index += 1;
            match escape {
                b'n' => bytes.push(b'\n'),
                b't' => bytes.push(b'\t'),
                b'r' => bytes.push(b'\r'),
                b'0' => bytes.push(0),
                b'\\' => bytes.push(b'\\'),
                b'"' => bytes.push(b'"'),
                b'x' => {
                    let hex = raw.get(index..index + 2).and_then(|hex| std::str::from_utf8(hex).ok());
                    let Some(value) = hex.and_then(|hex| u8::from_str_radix(hex, 16).ok()) else {
                        return self.error("'\\x' needs two hex digits");
                    };
                    bytes.push(value);
                    index += 2;
                }
                other => {
                    return self.error(format!("Unknown escape '\\{}'", *other as char));
                }
            }
        }

        Ok(bytes)
    }

    fn parse_operation(&self, keyword: &str, args: &[&str]) -> Result<Operation, CompilerError> {
        let count = match keyword {
            "addrof" | "store" | "pop" | "dup" | "not" | "return" | "va_area" | "computed_goto"
            | "vla" => 0,
            "var" | "param" | "addr" | "fn" | "deref" | "arith" | "cmp" | "cvt" | "if" | "else"
            | "end" | "block" | "loop" | "break" | "continue" | "pending" | "yield" | "result"
            | "switch" | "default" | "label" | "goto" | "call" => 1,
            "frame" | "const" | "global" | "break_if" | "continue_if" | "join" | "case" => 2,
            _ => return self.error(format!("Unknown operation '{keyword}'")),
        };
        self.expect_args(keyword, args, count)?;

        Ok(match keyword {
            "frame" => Operation::Frame {
                var: args[0].to_owned(),
                value_type: self.parse_type(args[1])?,
            },
            "var" => Operation::Var(args[0].to_owned()),
            "param" => Operation::Param(self.parse_number(args[0], "parameter index")?),
            "const" => {
                let value_type = self.parse_type(args[0])?;
                let value = self.parse_constant(&value_type, args[1])?;
                Operation::Const { value_type, value }
            }
            "global" => Operation::Global {
                name: args[0].to_owned(),
                value_type: self.parse_type(args[1])?,
            },
            "addr" => Operation::Addr(args[0].to_owned()),
            "fn" => Operation::Function(args[0].to_owned()),
            "va_area" => Operation::VariadicArea,

            "deref" => Operation::Deref(self.parse_type(args[0])?),
            "addrof" => Operation::AddressOf,
            "store" => Operation::Store,
            "pop" => Operation::Pop,
            "dup" => Operation::Dup,
            "arith" => match ArithOp::from_name(args[0]) {
                Some(op) => Operation::Arith(op),
                None => return self.error(format!("Unknown arithmetic operator '{}'", args[0])),
            },
            "cmp" => match CompareOp::from_name(args[0]) {
                Some(op) => Operation::Compare(op),
                None => return self.error(format!("Unknown comparison '{}'", args[0])),
            },
            "not" => Operation::Not,
            "cvt" => Operation::Convert(self.parse_type(args[0])?),

            "if" => Operation::If(self.parse_token(args[0])?),
            "else" => Operation::Else(self.parse_token(args[0])?),
            "end" => Operation::End(self.parse_token(args[0])?),
            "block" => Operation::Block(self.parse_token(args[0])?),
            "loop" => Operation::Loop(self.parse_token(args[0])?),
            "break" => Operation::Break(self.parse_token(args[0])?),
            "break_if" => {
                Operation::BreakIf(self.parse_token(args[0])?, self.parse_bool(args[1])?)
            }
            "continue" => Operation::Continue(self.parse_token(args[0])?),
            "continue_if" => {
                Operation::ContinueIf(self.parse_token(args[0])?, self.parse_bool(args[1])?)
            }
            "join" => Operation::Join(self.parse_token(args[0])?, self.parse_bool(args[1])?),
            "pending" => Operation::Pending(self.parse_token(args[0])?),
            "yield" => Operation::Yield(self.parse_token(args[0])?),
            "result" => Operation::BlockResult(self.parse_token(args[0])?),
            "switch" => Operation::Switch(self.parse_token(args[0])?),
            "case" => Operation::Case(
                self.parse_token(args[0])?,
                self.parse_number(args[1], "case value")?,
            ),
            "default" => Operation::Default(self.parse_token(args[0])?),
            "label" => Operation::Label(self.parse_token(args[0])?),
            "goto" => Operation::Goto(self.parse_token(args[0])?),

            "call" => Operation::Call(self.parse_number(args[0], "argument count")?),
            "return" => Operation::Return,
            "computed_goto" => Operation::ComputedGoto,
            _ => Operation::Vla,
        })
    }
}

/// Drops a trailing comment, leaving `#` inside a quoted string alone
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '\\' if in_string => {
                escaped = !escaped;
                continue;
            }
            '"' if !escaped => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
        escaped = false;
    }
    line
}

pub fn parse_script(source: &str, file: Option<&Path>) -> Result<Script, CompilerError> {
    let mut items = Vec::new();
    let mut parser = LineParser { file, line: 0 };

    // The function currently being read: name, signature, internal, start line, body
    let mut open_function: Option<(String, SignatureSpec, bool, usize, Vec<BodyLine>)> = None;

    for (index, raw_line) in source.lines().enumerate() {
        parser.line = index + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let (keyword, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let args: Vec<&str> = rest.split_whitespace().collect();

        if let Some((_, _, _, _, body)) = open_function.as_mut() {
            match keyword {
                "endfunc" => {
                    parser.expect_args(keyword, &args, 0)?;
                    if let Some((name, signature, internal, start, body)) = open_function.take() {
                        items.push(ScriptItem {
                            line: start,
                            item: Item::Function {
                                name,
                                signature,
                                internal,
                                body,
                            },
                        });
                    }
                }
                "func" | "data" | "reloc" | "declare" => {
                    return parser.error(format!("'{keyword}' inside a function body, missing 'endfunc'?"));
                }
                _ => {
                    let operation = parser.parse_operation(keyword, &args)?;
                    body.push(BodyLine {
                        line: parser.line,
                        operation,
                    });
                }
            }
            continue;
        }

        let item = match keyword {
            "data" => parser.parse_data(rest)?,
            "reloc" => {
                parser.expect_args(keyword, &args, 3)?;
                Item::Relocation {
                    symbol: args[0].to_owned(),
                    offset: parser.parse_number(args[1], "relocation offset")?,
                    target: args[2].to_owned(),
                }
            }
            "declare" => {
                parser.expect_args(keyword, &args, 2)?;
                Item::Declare {
                    name: args[0].to_owned(),
                    signature: parser.parse_signature(args[1])?,
                }
            }
            "func" => {
                let internal = match args.as_slice() {
                    [_, _] => false,
                    [_, _, "static"] => true,
                    _ => return parser.error("Expected 'func NAME SIGNATURE [static]'"),
                };
                open_function = Some((
                    args[0].to_owned(),
                    parser.parse_signature(args[1])?,
                    internal,
                    parser.line,
                    Vec::new(),
                ));
                continue;
            }
            "endfunc" => return parser.error("'endfunc' without a matching 'func'"),
            _ => return parser.error(format!("Unknown top level item '{keyword}'")),
        };

        items.push(ScriptItem {
            line: parser.line,
            item,
        });
    }

    if let Some((name, _, _, start, _)) = open_function {
        parser.line = start;
        return parser.error(format!("Function '{name}' is missing 'endfunc'"));
    }

    Ok(Script {
        file: file.map(Path::to_path_buf),
        items,
    })
}

#[cfg(test)]
#[path = "tests/parser_tests.rs"]
mod tests;

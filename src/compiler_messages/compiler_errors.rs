use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum ErrorMetaDataKey {
    // What the source program asked for that this target can't express
    Construct,
    CompilationStage,

    // Internal state dumped with compiler bugs
    Operator,
    TypeCode,
    BlockKind,
    BlockId,
    LabelId,
    FunctionName,

    // Data type information
    ExpectedType,
    FoundType,

    // Optional suggestion
    PrimarySuggestion,
}

/// Where code generation was when the error happened.
/// The backend only knows about functions, the script replay adds the file and line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorLocation {
    pub function: Option<String>,
    pub file: Option<PathBuf>,
    pub line: Option<usize>,
}

impl ErrorLocation {
    pub fn in_function(name: impl Into<String>) -> Self {
        ErrorLocation {
            function: Some(name.into()),
            ..ErrorLocation::default()
        }
    }

    pub fn at_line(file: Option<PathBuf>, line: usize) -> Self {
        ErrorLocation {
            function: None,
            file,
            line: Some(line),
        }
    }
}

impl fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(file) = &self.file {
            parts.push(file.display().to_string());
        }
        if let Some(line) = self.line {
            parts.push(format!("line {line}"));
        }
        if let Some(function) = &self.function {
            parts.push(format!("in function '{function}'"));
        }
        write!(f, "{}", parts.join(", "))
    }
}

#[derive(Debug, Clone)]
pub struct CompilerError {
    pub msg: String,
    pub location: ErrorLocation,
    pub error_type: ErrorType,

    // Structured details so a compiler bug report contains the state that caused it
    pub metadata: HashMap<ErrorMetaDataKey, String>,
}

impl CompilerError {
    pub fn new(msg: impl Into<String>, location: ErrorLocation, error_type: ErrorType) -> Self {
        CompilerError {
            msg: msg.into(),
            location,
            error_type,
            metadata: HashMap::new(),
        }
    }

    /// Create a compiler error (internal bug, not the user's fault)
    pub fn compiler_error(msg: impl Into<String>) -> Self {
        CompilerError::new(msg, ErrorLocation::default(), ErrorType::Compiler)
    }

    /// A construct the target can't express. Compilation stops, no fallback is attempted.
    pub fn unsupported(construct: impl Into<String>) -> Self {
        let construct = construct.into();
        let mut error = CompilerError::new(
            format!("{construct} is not supported by the WebAssembly backend"),
            ErrorLocation::default(),
            ErrorType::Unsupported,
        );
        error.new_metadata_entry(ErrorMetaDataKey::Construct, construct);
        error
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        CompilerError::new(msg, ErrorLocation::default(), ErrorType::Config)
    }

    pub fn file_error(path: &std::path::Path, msg: impl Into<String>) -> Self {
        CompilerError::new(
            msg,
            ErrorLocation {
                file: Some(path.to_path_buf()),
                ..ErrorLocation::default()
            },
            ErrorType::File,
        )
    }

    pub fn validation_error(msg: impl Into<String>) -> Self {
        CompilerError::new(msg, ErrorLocation::default(), ErrorType::Validation)
    }

    /// Fills in the function name unless a more specific one was already recorded
    pub fn with_function(mut self, name: &str) -> Self {
        if self.location.function.is_none() {
            self.location.function = Some(name.to_owned());
        }
        self
    }

    pub fn with_line(mut self, file: Option<PathBuf>, line: usize) -> Self {
        if self.location.file.is_none() {
            self.location.file = file;
        }
        if self.location.line.is_none() {
            self.location.line = Some(line);
        }
        self
    }

    pub fn with_metadata(mut self, key: ErrorMetaDataKey, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value.into());
        self
    }

    pub fn new_metadata_entry(&mut self, key: ErrorMetaDataKey, value: impl Into<String>) {
        self.metadata.insert(key, value.into());
    }
}

impl fmt::Display for CompilerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", error_type_to_str(&self.error_type), self.msg)
    }
}

impl std::error::Error for CompilerError {}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ErrorType {
    Syntax,
    Unsupported,
    Compiler,
    Link,
    Validation,
    Config,
    File,
}

pub fn error_type_to_str(e_type: &ErrorType) -> &'static str {
    match e_type {
        ErrorType::Syntax => "Syntax Error",
        ErrorType::Unsupported => "Unsupported Construct",
        ErrorType::Compiler => "Compiler Bug",
        ErrorType::Link => "Link Error",
        ErrorType::Validation => "Invalid Module",
        ErrorType::Config => "Malformed Config",
        ErrorType::File => "File Error",
    }
}

/// Returns a new CompilerError for internal invariant violations.
///
/// These should never happen for a correct front end, so include
/// the operator/type/block codes needed to track the defect down.
///
/// Usage:
/// `return_compiler_error!("Unknown operator", { Operator => "rem_s", TypeCode => "f32" })`;
#[macro_export]
macro_rules! return_compiler_error {
    ($msg:expr, { $( $key:ident => $value:expr ),* $(,)? }) => {
        return Err($crate::compiler_messages::compiler_errors::CompilerError {
            msg: $msg.into(),
            location: $crate::compiler_messages::compiler_errors::ErrorLocation::default(),
            error_type: $crate::compiler_messages::compiler_errors::ErrorType::Compiler,
            metadata: {
                let mut map = std::collections::HashMap::new();
                $(
                    map.insert(
                        $crate::compiler_messages::compiler_errors::ErrorMetaDataKey::$key,
                        $value.to_string(),
                    );
                )*
                map
            },
        })
    };
    ($msg:expr) => {
        return Err($crate::compiler_messages::compiler_errors::CompilerError::compiler_error($msg))
    };
}

/// Returns a new CompilerError for documented target limitations.
///
/// Usage:
/// `return_unsupported_error!("computed goto")`;
/// `return_unsupported_error!("structures passed by value", { FunctionName => name })`;
#[macro_export]
macro_rules! return_unsupported_error {
    ($construct:expr, { $( $key:ident => $value:expr ),* $(,)? }) => {{
        let mut error = $crate::compiler_messages::compiler_errors::CompilerError::unsupported($construct);
        $(
            error.new_metadata_entry(
                $crate::compiler_messages::compiler_errors::ErrorMetaDataKey::$key,
                $value.to_string(),
            );
        )*
        return Err(error);
    }};
    ($construct:expr) => {
        return Err($crate::compiler_messages::compiler_errors::CompilerError::unsupported($construct))
    };
}

/// Returns a new CompilerError for malformed IR script lines.
///
/// Usage: `return_syntax_error!("Expected a type", location)`;
#[macro_export]
macro_rules! return_syntax_error {
    ($msg:expr, $location:expr) => {
        return Err($crate::compiler_messages::compiler_errors::CompilerError::new(
            $msg,
            $location,
            $crate::compiler_messages::compiler_errors::ErrorType::Syntax,
        ))
    };
}

/// Returns a new CompilerError for symbol resolution failures at module end.
#[macro_export]
macro_rules! return_link_error {
    ($msg:expr, { $( $key:ident => $value:expr ),* $(,)? }) => {
        return Err($crate::compiler_messages::compiler_errors::CompilerError {
            msg: $msg.into(),
            location: $crate::compiler_messages::compiler_errors::ErrorLocation::default(),
            error_type: $crate::compiler_messages::compiler_errors::ErrorType::Link,
            metadata: {
                let mut map = std::collections::HashMap::new();
                $(
                    map.insert(
                        $crate::compiler_messages::compiler_errors::ErrorMetaDataKey::$key,
                        $value.to_string(),
                    );
                )*
                map
            },
        })
    };
}

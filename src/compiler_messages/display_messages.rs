use crate::compiler_messages::compiler_errors::{CompilerError, ErrorMetaDataKey, ErrorType};
use saying::say;
use std::path::{Path, PathBuf};
use std::{env, fs};

fn relative_display_path(path: &Path) -> String {
    match env::current_dir() {
        Ok(dir) => path
            .strip_prefix(&dir)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string(),
        Err(_) => path.to_string_lossy().to_string(),
    }
}

fn source_line(file: &Path, line_number: usize) -> Option<String> {
    let source = fs::read_to_string(file).ok()?;
    source
        .lines()
        .nth(line_number.saturating_sub(1))
        .map(|line| line.trim_end().to_owned())
}

pub fn print_formatted_error(e: &CompilerError) {
    let relative_dir = e
        .location
        .file
        .as_deref()
        .map(relative_display_path)
        .unwrap_or_default();

    match e.error_type {
        ErrorType::Syntax => {
            if !relative_dir.is_empty() {
                say!("\n(╯°□°)╯  🔥🔥 ", Dark Magenta relative_dir, " 🔥🔥  Σ(°△°;) ");
            }
            say!(Red "Syntax");
        }

        ErrorType::Unsupported => {
            if !relative_dir.is_empty() {
                say!("\n(ಠ_ಠ) ", Dark Magenta relative_dir);
            }
            say!(Red "Unsupported Construct");
            say!(Dark Yellow "The WebAssembly target has no way to express this, compilation stopped");
        }

        ErrorType::Compiler => {
            if !relative_dir.is_empty() {
                say!("\nヽ༼☉ ‿ ⚆༽ﾉ  🔥🔥🔥🔥 ", Dark Magenta relative_dir, " 🔥🔥🔥🔥  ╰(° _ o╰) ");
            }
            say!(Yellow "COMPILER BUG - ");
            say!(Dark Yellow "backend or front end invariant broken (not your fault)");
        }

        ErrorType::Link => {
            if !relative_dir.is_empty() {
                say!("\n(ﾉ☉_⚆)ﾉ  🔥 ", Dark Magenta relative_dir, " 🔥 ╰(° O °)╯ ");
            }
            say!(Red "Link Error");
        }

        ErrorType::Validation => {
            say!(Yellow "INVALID MODULE - ");
            say!(Dark Yellow "the generated module was rejected by the validator");
        }

        ErrorType::Config => {
            if !relative_dir.is_empty() {
                say!("\n (-_-)  🔥🔥🔥🔥 ", Dark Magenta relative_dir, " 🔥🔥🔥🔥  <(^~^)/ ");
            }
            say!(Yellow "CONFIG FILE ISSUE - ");
            say!(Dark Yellow "Malformed config file, something doesn't make sense inside the backend config");
        }

        ErrorType::File => {
            say!(Yellow "🏚 Can't find/read file or directory: ", relative_dir);
            say!(e.msg);
            return;
        }
    }

    if let Some(function) = &e.location.function {
        say!(Dark Magenta "Function ", Magenta function);
    }

    say!(Red e.msg);

    if let (Some(file), Some(line_number)) = (&e.location.file, e.location.line) {
        say!(Dark Magenta "Line ", Magenta line_number);
        if let Some(line) = source_line(file, line_number) {
            println!("\n{line}");
            say!(Red { "^".repeat(line.trim_start().len().max(1)) });
        }
    }

    print_metadata(e);
}

fn print_metadata(e: &CompilerError) {
    if e.metadata.is_empty() {
        return;
    }

    // Sorted so the report reads the same every time
    let mut entries: Vec<(&ErrorMetaDataKey, &String)> = e.metadata.iter().collect();
    entries.sort_by_key(|(key, _)| **key);

    for (key, value) in entries {
        match key {
            ErrorMetaDataKey::PrimarySuggestion => {
                say!(Green "Suggestion: ", value);
            }
            _ => {
                let key_name = format!("  {key:?}: ");
                say!(Dark Yellow key_name, value);
            }
        }
    }
}

/// The one diagnostic-and-abort point of the compiler.
/// Prints the error and terminates the process with a failing status.
pub fn abort_compilation(e: CompilerError) -> ! {
    print_formatted_error(&e);
    std::process::exit(1)
}

/// Path relative to the working directory, for build summaries
pub fn display_output_path(path: &Path) -> PathBuf {
    PathBuf::from(relative_display_path(path))
}

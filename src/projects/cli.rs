//! Command-line entrypoints for the wasmgen backend.
//!
//! This module parses CLI commands and dispatches them into the build and check workflows.

use crate::backends::wasm::module_assembler::ModuleOutput;
use crate::backends::wasm::validator::assemble_binary;
use crate::compiler_messages::compiler_errors::CompilerError;
use crate::compiler_messages::display_messages::{abort_compilation, display_output_path};
use crate::ir_script::compile_file;
use crate::settings::{IR_SCRIPT_EXTENSION, load_config};
use crate::timer_log;
use saying::say;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    // Directory the outputs go to, the script's own directory if not given
    pub output_dir: Option<PathBuf>,
    pub binary: bool,
    pub layout: bool,
    pub config: Option<PathBuf>,
    pub hide_timers: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    // Writes the module text, and optionally the binary and layout report
    Build { path: PathBuf, options: BuildOptions },

    // Compiles, assembles and validates without writing anything
    Check { path: PathBuf, options: BuildOptions },

    Help,
}

/// Files written by a build
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub text: PathBuf,
    pub binary: Option<PathBuf>,
    pub layout: Option<PathBuf>,
}

pub fn start_cli() {
    let compiler_args: Vec<String> = env::args().collect();

    if compiler_args.len() < 2 {
        print_help(false);
        return;
    }

    let command = match get_command(&compiler_args[1..]) {
        Ok(command) => command,
        Err(e) => {
            say!(Red e);
            print_help(true);
            return;
        }
    };

    match command {
        Command::Help => {
            print_help(false);
        }

        Command::Build { path, options } => {
            let start = Instant::now();
            match build_script(&path, &options) {
                Ok(report) => {
                    say!(Green "Wrote ", { report.text.display() });
                    if let Some(binary) = &report.binary {
                        say!(Green "Wrote ", { binary.display() });
                    }
                    if let Some(layout) = &report.layout {
                        say!(Green "Wrote ", { layout.display() });
                    }
                    if !options.hide_timers {
                        say!("Build finished in: ", Green #start.elapsed());
                    }
                }
                Err(e) => abort_compilation(e),
            }
        }

        Command::Check { path, options } => {
            let start = Instant::now();
            match check_script(&path, &options) {
                Ok(output) => {
                    say!(
                        Green "Module is valid. ",
                        output.layout.memory_pages,
                        " pages, ",
                        { output.layout.table_entries.len() },
                        " table entries"
                    );
                    if !options.hide_timers {
                        say!("Check finished in: ", Green #start.elapsed());
                    }
                }
                Err(e) => abort_compilation(e),
            }
        }
    }
}

fn get_command(args: &[String]) -> Result<Command, String> {
    let command = args.first().map(String::as_str);

    match command {
        Some("help") | Some("--help") | Some("-h") => Ok(Command::Help),

        Some("build") => {
            let (path, options) = parse_build_args(&args[1..])?;
            Ok(Command::Build { path, options })
        }

        Some("check") => {
            let (path, options) = parse_build_args(&args[1..])?;
            if options.output_dir.is_some() || options.binary || options.layout {
                return Err(String::from(
                    "Check doesn't write files, -o, --binary and --layout only apply to build",
                ));
            }
            Ok(Command::Check { path, options })
        }

        Some(other) => Err(format!("Invalid command: '{other}'")),
        None => Err(String::from("No command given")),
    }
}

fn parse_build_args(args: &[String]) -> Result<(PathBuf, BuildOptions), String> {
    let mut path: Option<PathBuf> = None;
    let mut options = BuildOptions::default();
    let mut index = 0usize;

    while let Some(arg) = args.get(index) {
        match arg.as_str() {
            "-o" | "--config" => {
                let Some(value) = args.get(index + 1) else {
                    return Err(format!("Missing value for {arg}"));
                };
                if value.starts_with('-') {
                    return Err(format!("Missing value for {arg}"));
                }
                if arg == "-o" {
                    options.output_dir = Some(PathBuf::from(value));
                } else {
                    options.config = Some(PathBuf::from(value));
                }
                index += 2;
            }
            "--binary" => {
                options.binary = true;
                index += 1;
            }
            "--layout" => {
                options.layout = true;
                index += 1;
            }
            "--hide-timers" => {
                options.hide_timers = true;
                index += 1;
            }
            _ if arg.starts_with('-') => {
                return Err(format!(
                    "Unknown flag: '{arg}'. Supported flags are -o, --binary, --layout, --config, --hide-timers."
                ));
            }
            _ => {
                if path.is_some() {
                    return Err(String::from("Only one script path can be given"));
                }
                path = Some(PathBuf::from(arg));
                index += 1;
            }
        }
    }

    match path {
        Some(path) => Ok((path, options)),
        None => Err(format!("Missing path to a .{IR_SCRIPT_EXTENSION} script")),
    }
}

fn compile_with_options(path: &Path, options: &BuildOptions) -> Result<ModuleOutput, CompilerError> {
    let config = load_config(options.config.as_deref(), path)?;

    let time = Instant::now();
    let output = compile_file(path, &config)?;
    timer_log!(time, "Script compiled in: ");

    Ok(output)
}

fn write_output(path: &Path, contents: &[u8]) -> Result<(), CompilerError> {
    fs::write(path, contents)
        .map_err(|e| CompilerError::file_error(path, format!("Couldn't write output: {e}")))
}

/// Compiles the script and writes `<stem>.wat` and any requested extras
pub fn build_script(path: &Path, options: &BuildOptions) -> Result<BuildReport, CompilerError> {
    let output = compile_with_options(path, options)?;

    let output_dir = match &options.output_dir {
        Some(dir) => dir.to_owned(),
        None => path.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    fs::create_dir_all(&output_dir).map_err(|e| {
        CompilerError::file_error(&output_dir, format!("Couldn't create output directory: {e}"))
    })?;

    let stem = match path.file_stem() {
        Some(stem) => stem.to_string_lossy().into_owned(),
        None => String::from("module"),
    };

    // Validate before anything is written, an invalid module never reaches disk as a binary
    let binary = if options.binary {
        let time = Instant::now();
        let bytes = assemble_binary(&output.text)?;
        timer_log!(time, "Module assembled in: ");
        Some(bytes)
    } else {
        None
    };

    let text_path = output_dir.join(format!("{stem}.wat"));
    write_output(&text_path, output.text.as_bytes())?;

    let mut report = BuildReport {
        text: display_output_path(&text_path),
        binary: None,
        layout: None,
    };

    if let Some(bytes) = binary {
        let binary_path = output_dir.join(format!("{stem}.wasm"));
        write_output(&binary_path, &bytes)?;
        report.binary = Some(display_output_path(&binary_path));
    }

    if options.layout {
        let layout_path = output_dir.join(format!("{stem}.layout.json"));
        write_output(&layout_path, output.layout.to_json()?.as_bytes())?;
        report.layout = Some(display_output_path(&layout_path));
    }

    Ok(report)
}

/// Compiles, assembles and validates without touching the filesystem
pub fn check_script(path: &Path, options: &BuildOptions) -> Result<ModuleOutput, CompilerError> {
    let output = compile_with_options(path, options)?;
    assemble_binary(&output.text)?;
    Ok(output)
}

fn print_help(commands_only: bool) {
    if !commands_only {
        say!(Bright Black "------------------------------------");
        say!(Green Bold "wasmgen, a WebAssembly text backend");
        say!("Usage: ", Bold "<command>", Italic " <args>");
    }
    say!(Green Bold "\nCommands:");
    say!("  build <script.", IR_SCRIPT_EXTENSION, ">   - Writes the module text next to the script");
    say!("  check <script.", IR_SCRIPT_EXTENSION, ">   - Compiles and validates without writing files");
    say!("  help                 - Shows this message");

    say!(Green Bold "\nBuild flags:");
    say!("  -o <dir>             Output directory");
    say!("  --binary             Also write the validated .wasm binary");
    say!("  --layout             Also write the memory layout as JSON");
    say!("  --config <toml>      Backend config, defaults to wasmgen.toml next to the script");
    say!("  --hide-timers");
}

#[cfg(test)]
#[path = "tests/cli_tests.rs"]
mod tests;

//! Tests for CLI command parsing and the build and check workflows.

use super::*;
use std::fs;
use tempfile::tempdir;

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

const SCRIPT: &str = "data message \"ok\\n\" align 1
func main ()->i32
    const i32 0
    return
endfunc
";

#[test]
fn build_command_uses_default_options() {
    let command = get_command(&args(&["build", "main.wir"])).expect("command should parse");
    assert_eq!(
        command,
        Command::Build {
            path: PathBuf::from("main.wir"),
            options: BuildOptions::default(),
        }
    );
}

#[test]
fn build_command_parses_every_flag() {
    let command = get_command(&args(&[
        "build",
        "--binary",
        "main.wir",
        "-o",
        "out",
        "--layout",
        "--config",
        "custom.toml",
        "--hide-timers",
    ]))
    .expect("command should parse");

    assert_eq!(
        command,
        Command::Build {
            path: PathBuf::from("main.wir"),
            options: BuildOptions {
                output_dir: Some(PathBuf::from("out")),
                binary: true,
                layout: true,
                config: Some(PathBuf::from("custom.toml")),
                hide_timers: true,
            },
        }
    );
}

#[test]
fn flags_that_need_a_value_reject_a_missing_one() {
    let error = get_command(&args(&["build", "main.wir", "-o"])).expect_err("-o needs a value");
    assert!(error.contains("-o"));

    let error = get_command(&args(&["build", "main.wir", "--config", "--binary"]))
        .expect_err("a flag isn't a value");
    assert!(error.contains("--config"));
}

#[test]
fn build_command_rejects_bad_arguments() {
    assert!(get_command(&args(&["build"])).unwrap_err().contains("Missing path"));
    assert!(get_command(&args(&["build", "a.wir", "b.wir"])).is_err());
    assert!(get_command(&args(&["build", "a.wir", "--release"])).unwrap_err().contains("Unknown flag"));
}

#[test]
fn check_command_rejects_output_flags() {
    let command = get_command(&args(&["check", "main.wir", "--hide-timers"])).expect("check parses");
    assert!(matches!(command, Command::Check { .. }));

    assert!(get_command(&args(&["check", "main.wir", "--binary"])).is_err());
    assert!(get_command(&args(&["check", "main.wir", "-o", "out"])).is_err());
}

#[test]
fn help_and_unknown_commands() {
    assert_eq!(get_command(&args(&["help"])), Ok(Command::Help));
    assert_eq!(get_command(&args(&["-h"])), Ok(Command::Help));
    assert!(get_command(&args(&["run", "main.wir"])).unwrap_err().contains("Invalid command"));
    assert!(get_command(&[]).is_err());
}

#[test]
fn build_writes_text_next_to_the_script() {
    let dir = tempdir().expect("temp dir should be created");
    let script = dir.path().join("hello.wir");
    fs::write(&script, SCRIPT).expect("script should be written");

    let report = build_script(&script, &BuildOptions::default()).expect("build should succeed");
    assert!(report.binary.is_none());
    assert!(report.layout.is_none());

    let text = fs::read_to_string(dir.path().join("hello.wat")).expect("module text should exist");
    assert!(text.starts_with("(module\n"));
    assert!(text.contains("(func $main (export \"main\") (result i32)"));
    assert!(!dir.path().join("hello.wasm").exists());
}

#[test]
fn build_writes_binary_and_layout_to_the_output_dir() {
    let dir = tempdir().expect("temp dir should be created");
    let script = dir.path().join("hello.wir");
    fs::write(&script, SCRIPT).expect("script should be written");
    let out = dir.path().join("build").join("nested");

    let options = BuildOptions {
        output_dir: Some(out.to_owned()),
        binary: true,
        layout: true,
        hide_timers: true,
        ..BuildOptions::default()
    };
    let report = build_script(&script, &options).expect("build should succeed");
    assert!(report.binary.is_some());
    assert!(report.layout.is_some());

    let bytes = fs::read(out.join("hello.wasm")).expect("binary should exist");
    assert_eq!(&bytes[0..4], b"\0asm");

    let layout = fs::read_to_string(out.join("hello.layout.json")).expect("layout should exist");
    let layout: serde_json::Value = serde_json::from_str(&layout).expect("layout should be json");
    assert_eq!(layout["data_end"], 19);
    assert_eq!(layout["data_symbols"][0]["name"], "message");
}

#[test]
fn config_next_to_the_script_is_picked_up() {
    let dir = tempdir().expect("temp dir should be created");
    let script = dir.path().join("hello.wir");
    fs::write(&script, SCRIPT).expect("script should be written");
    fs::write(dir.path().join("wasmgen.toml"), "memory_base = 1024\nimport_module = \"host\"")
        .expect("config should be written");

    let output = check_script(&script, &BuildOptions::default()).expect("check should succeed");
    assert_eq!(output.layout.memory_base, 1024);
    assert!(output.text.contains("(import \"host\" \"fd_write\""));
}

#[test]
fn check_reports_script_errors_without_writing() {
    let dir = tempdir().expect("temp dir should be created");
    let script = dir.path().join("broken.wir");
    fs::write(&script, "func main ()->i32\n  pop\nendfunc\n").expect("script should be written");

    let error = check_script(&script, &BuildOptions::default()).expect_err("pop on an empty stack");
    assert_eq!(error.location.line, Some(2));
    assert!(!dir.path().join("broken.wat").exists());
}

#[test]
fn missing_script_is_a_file_error() {
    let dir = tempdir().expect("temp dir should be created");
    let error = check_script(&dir.path().join("absent.wir"), &BuildOptions::default())
        .expect_err("script doesn't exist");
    assert_eq!(
        error.error_type,
        crate::compiler_messages::compiler_errors::ErrorType::File
    );
}

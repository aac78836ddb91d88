//! Tests for goto/label dispatch.

use super::*;
use crate::backends::wasm::test_support::{
    body_text, finish_valid, function, int, new_assembler, position,
};
use crate::backends::wasm::types::ValueType;
use crate::compiler_messages::compiler_errors::ErrorType;

#[test]
fn labels_are_numbered_from_one() {
    let mut assembler = new_assembler();
    let mut codegen = assembler
        .begin_function(function("f", Vec::new(), ValueType::void()))
        .unwrap();

    let first = codegen.new_label();
    let second = codegen.new_label();
    assert_eq!(first.id, 1);
    assert_eq!(second.id, 2);
    assert_eq!(first.kind, BlockKind::GotoGuard);
    assert!(!codegen.labels.is_active());
}

#[test]
fn forward_goto_leaves_the_current_segment() {
    let mut assembler = new_assembler();
    let mut codegen = assembler
        .begin_function(function("skip", Vec::new(), ValueType::void()))
        .unwrap();

    let label = codegen.new_label();
    codegen.goto(label).unwrap();
    codegen.define_label(label).unwrap();

    let lines = body_text(&codegen.body);
    assert_eq!(
        &lines[..5],
        &[
            "i32.const 1",
            "local.set $goto_target",
            "i32.const 0",
            "local.set $goto_reached",
            "<goto 1>",
        ]
    );
    assert_eq!(lines[5], "end $G0");
    assert!(lines.contains(&String::from("block $G1")));
    assert!(lines.contains(&String::from("br_if $G1")));
    assert!(codegen.labels.is_active());

    codegen.finish().unwrap();
    let output = finish_valid(assembler);
    assert!(output.text.contains("loop $D"));
    assert!(output.text.contains("br $G0"));
    assert!(output.text.contains("(local $goto_target i32)"));
}

#[test]
fn backward_goto_restarts_the_dispatch_loop() {
    let mut assembler = new_assembler();
    let mut codegen = assembler
        .begin_function(function("spin", vec![int()], ValueType::void()))
        .unwrap();

    let top = codegen.new_label();
    codegen.define_label(top).unwrap();
    codegen.push_parameter(0).unwrap();
    let token = codegen.open_if().unwrap();
    codegen.goto(top).unwrap();
    codegen.close_block(token).unwrap();

    let epilogue = codegen.dispatch_epilogue().unwrap();
    assert_eq!(epilogue.first().map(String::as_str), Some("end $G1"));
    assert!(epilogue.contains(&String::from("br_if $D")));
    assert_eq!(epilogue.last().map(String::as_str), Some("end $D"));

    codegen.finish().unwrap();
    finish_valid(assembler);
}

fn trimmed_lines(text: &str) -> Vec<&str> {
    text.lines().map(str::trim).collect()
}

#[test]
fn goto_within_a_loop_body_dispatches_inside_the_loop() {
    let mut assembler = new_assembler();
    let mut codegen = assembler
        .begin_function(function("skip", vec![int()], ValueType::void()))
        .unwrap();

    let next = codegen.new_label();
    let each = codegen.open_loop().unwrap();
    codegen.push_parameter(0).unwrap();
    let skip = codegen.open_if().unwrap();
    codegen.goto(next).unwrap();
    codegen.close_block(skip).unwrap();
    codegen.define_label(next).unwrap();
    codegen.continue_loop(each).unwrap();
    codegen.close_block(each).unwrap();
    assert!(!codegen.labels.dispatches_function_body());

    codegen.finish().unwrap();
    let output = finish_valid(assembler);
    let lines = trimmed_lines(&output.text);
    assert!(lines.contains(&"loop $D1"));
    assert!(lines.contains(&"block $E1"));
    assert!(lines.contains(&"br $E1"));
    assert!(lines.contains(&"br_if $D1"));
    assert!(!lines.contains(&"loop $D"));

    // The goto locals are still reset on entry
    assert!(lines.contains(&"local.set $goto_target"));
}

#[test]
fn label_inside_an_if_reached_from_the_same_arm() {
    let mut assembler = new_assembler();
    let mut codegen = assembler
        .begin_function(function("f", vec![int()], ValueType::void()))
        .unwrap();

    let done = codegen.new_label();
    codegen.push_parameter(0).unwrap();
    let token = codegen.open_if().unwrap();
    codegen.goto(done).unwrap();
    codegen.define_label(done).unwrap();
    let token = codegen.open_else(token).unwrap();
    codegen.close_block(token).unwrap();

    let lines = body_text(&codegen.body);
    let epilogue_end = position(&lines, "end $D1");
    let otherwise = position(&lines, "else $B1");
    assert!(epilogue_end < otherwise);

    codegen.finish().unwrap();
    finish_valid(assembler);
}

#[test]
fn goto_into_a_block_from_outside_is_unsupported() {
    let mut assembler = new_assembler();
    let mut codegen = assembler
        .begin_function(function("f", Vec::new(), ValueType::void()))
        .unwrap();

    let inside = codegen.new_label();
    codegen.goto(inside).unwrap();
    let token = codegen.open_block().unwrap();
    codegen.define_label(inside).unwrap();
    codegen.close_block(token).unwrap();

    let error = codegen.finish().expect_err("goto enters the block");
    assert_eq!(error.error_type, ErrorType::Unsupported);
}

#[test]
fn goto_between_if_arms_is_unsupported() {
    let mut assembler = new_assembler();
    let mut codegen = assembler
        .begin_function(function("f", vec![int()], ValueType::void()))
        .unwrap();

    let then_label = codegen.new_label();
    codegen.push_parameter(0).unwrap();
    let token = codegen.open_if().unwrap();
    codegen.define_label(then_label).unwrap();
    let token = codegen.open_else(token).unwrap();
    codegen.goto(then_label).unwrap();
    codegen.close_block(token).unwrap();

    let error = codegen.finish().expect_err("else arm can't enter the then arm");
    assert_eq!(error.error_type, ErrorType::Unsupported);
}

#[test]
fn label_inside_a_short_circuit_join_is_unsupported() {
    let mut assembler = new_assembler();
    let mut codegen = assembler
        .begin_function(function("f", vec![int()], ValueType::void()))
        .unwrap();

    let label = codegen.new_label();
    let join = codegen.reserve_join(false);
    codegen.push_parameter(0).unwrap();
    codegen.branch_if(join, false).unwrap();
    let error = codegen.define_label(label).expect_err("label in an expression");
    assert_eq!(error.error_type, ErrorType::Unsupported);
}

#[test]
fn label_defined_twice_is_a_compiler_error() {
    let mut assembler = new_assembler();
    let mut codegen = assembler
        .begin_function(function("f", Vec::new(), ValueType::void()))
        .unwrap();

    let label = codegen.new_label();
    codegen.define_label(label).unwrap();
    let error = codegen.define_label(label).expect_err("duplicate label");
    assert_eq!(error.error_type, ErrorType::Compiler);
}

#[test]
fn goto_to_a_missing_label_fails_at_the_end() {
    let mut assembler = new_assembler();
    let mut codegen = assembler
        .begin_function(function("f", Vec::new(), ValueType::void()))
        .unwrap();

    let label = codegen.new_label();
    codegen.goto(label).unwrap();
    let error = codegen.finish().expect_err("label never defined");
    assert_eq!(error.error_type, ErrorType::Compiler);
}

#[test]
fn computed_goto_is_unsupported() {
    let mut assembler = new_assembler();
    let mut codegen = assembler
        .begin_function(function("f", Vec::new(), ValueType::void()))
        .unwrap();

    let error = codegen.computed_goto().expect_err("computed goto");
    assert_eq!(error.error_type, ErrorType::Unsupported);
}

#[test]
fn branch_to_a_label_token_is_a_goto() {
    let mut assembler = new_assembler();
    let mut codegen = assembler
        .begin_function(function("f", Vec::new(), ValueType::void()))
        .unwrap();

    let label = codegen.new_label();
    codegen.branch(label).unwrap();
    let lines = body_text(&codegen.body);
    assert_eq!(lines.last().map(String::as_str), Some("<goto 1>"));
}

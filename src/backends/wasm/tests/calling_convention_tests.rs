//! Tests for signatures, frames and call lowering.

use super::*;
use crate::backends::wasm::operand::Constant;
use crate::backends::wasm::test_support::{
    body_text, finish_valid, function, int, new_assembler, position, variadic,
};
use crate::compiler_messages::compiler_errors::ErrorType;

#[test]
fn lowered_parameters_put_hidden_pointers_around_the_fixed_ones() {
    let signature = Signature::new(
        vec![ValueType::long(false), ValueType::double()],
        ValueType::aggregate(16, 8),
        true,
    );
    assert_eq!(
        signature.lowered_params().unwrap(),
        vec![MachineType::I32, MachineType::I64, MachineType::F64, MachineType::I32]
    );
    assert_eq!(signature.lowered_result().unwrap(), None);
    assert_eq!(signature.type_use().unwrap(), "(param i32 i64 f64 i32)");
}

#[test]
fn void_signature_has_an_empty_type_use() {
    let signature = Signature::new(Vec::new(), ValueType::void(), false);
    assert_eq!(signature.type_use().unwrap(), "");
}

#[test]
fn headers_name_every_parameter() {
    let decl = FunctionDecl::new(
        "sum",
        Signature::new(vec![int(), ValueType::float()], int(), true),
        false,
    );
    assert_eq!(
        decl.header(true).unwrap(),
        "(func $sum (export \"sum\") (param $p0 i32) (param $p1 f32) (param $va i32) (result i32)"
    );

    let internal = FunctionDecl::new("helper", Signature::new(Vec::new(), int(), false), true);
    assert_eq!(internal.header(true).unwrap(), "(func $helper (result i32)");
}

#[test]
fn unprototyped_definitions_and_structure_parameters_are_unsupported() {
    let old_style = FunctionDecl::new("old", Signature::unprototyped(int()), false);
    assert_eq!(old_style.header(true).unwrap_err().error_type, ErrorType::Unsupported);

    let by_value = FunctionDecl::new(
        "take",
        Signature::new(vec![ValueType::aggregate(8, 4)], ValueType::void(), false),
        false,
    );
    assert_eq!(by_value.header(true).unwrap_err().error_type, ErrorType::Unsupported);
}

#[test]
fn frame_offsets_grow_downwards_and_stay_aligned() {
    let mut assembler = new_assembler();
    let mut codegen = assembler
        .begin_function(function("f", Vec::new(), ValueType::void()))
        .unwrap();

    assert_eq!(codegen.allocate_frame(4, 4), -4);
    assert_eq!(codegen.allocate_frame(8, 8), -16);
    assert_eq!(codegen.allocate_frame(1, 1), -17);
    assert_eq!(codegen.allocate_frame(2, 2), -20);
}

#[test]
fn direct_call_moves_the_stack_pointer_around_the_call() {
    let mut assembler = new_assembler();
    assembler.declare_function(function("g", vec![int()], int())).unwrap();
    let mut codegen = assembler
        .begin_function(function("f", Vec::new(), int()))
        .unwrap();

    codegen.allocate_frame(4, 4);
    codegen.push_function("g").unwrap();
    codegen.push_constant(Constant::Int(7), int()).unwrap();
    codegen.call(1).unwrap();
    codegen.gen_return().unwrap();

    let lines = body_text(&codegen.body);
    let grow = position(&lines, "<stack grow>");
    let call = position(&lines, "call $g");
    let shrink = position(&lines, "<stack shrink>");
    assert!(grow < call && call < shrink);
    assert_eq!(codegen.call_refs, vec![String::from("g")]);

    // The frame size is known now, so the adjustments render
    assert_eq!(
        codegen.render_stack_adjust(true, -8),
        vec![
            "global.get $__stack_pointer",
            "i32.const -8",
            "i32.add",
            "global.set $__stack_pointer",
        ]
    );
    assert!(codegen.render_stack_adjust(false, 0).is_empty());
}

#[test]
fn variadic_arguments_are_spilled_in_order() {
    let mut assembler = new_assembler();
    assembler
        .declare_function(variadic("printf_like", vec![ValueType::pointer()], int()))
        .unwrap();
    let mut codegen = assembler
        .begin_function(function("f", Vec::new(), ValueType::void()))
        .unwrap();

    codegen.push_function("printf_like").unwrap();
    codegen.push_constant(Constant::Int(0), ValueType::pointer()).unwrap();
    codegen.push_constant(Constant::Int(1), int()).unwrap();
    codegen.push_constant(Constant::Float(2.5), ValueType::double()).unwrap();
    codegen.call(3).unwrap();
    codegen.pop().unwrap();

    // i32 at 0, the f64 aligned up to 8, sixteen bytes in all
    assert_eq!(codegen.frame_offset, -16);

    let lines = body_text(&codegen.body);
    let int_store = position(&lines, "i32.store");
    let double_store = position(&lines, "f64.store");
    assert!(int_store < double_store);
    assert_eq!(lines[int_store - 3], "i32.const -16");
    assert_eq!(lines[double_store - 3], "i32.const -8");

    codegen.finish().unwrap();
    assembler
        .begin_function(variadic("printf_like", vec![ValueType::pointer()], int()))
        .unwrap()
        .finish()
        .unwrap();
    finish_valid(assembler);
}

#[test]
fn too_many_arguments_for_a_fixed_prototype() {
    let mut assembler = new_assembler();
    assembler.declare_function(function("g", vec![int()], int())).unwrap();
    let mut codegen = assembler
        .begin_function(function("f", Vec::new(), ValueType::void()))
        .unwrap();

    codegen.push_function("g").unwrap();
    codegen.push_constant(Constant::Int(1), int()).unwrap();
    codegen.push_constant(Constant::Int(2), int()).unwrap();
    let error = codegen.call(2).expect_err("g takes one argument");
    assert_eq!(error.error_type, ErrorType::Compiler);
}

#[test]
fn indirect_calls_go_through_the_table() {
    let mut assembler = new_assembler();
    let target = function("target", vec![int()], int());
    let signature = Rc::clone(&target.signature);
    assembler.declare_function(target).unwrap();
    let mut codegen = assembler
        .begin_function(function("f", Vec::new(), int()))
        .unwrap();

    let slot = codegen.allocate_frame(4, 4);
    codegen.push_frame_variable(slot, ValueType::function(Rc::clone(&signature))).unwrap();
    codegen.push_function("target").unwrap();
    codegen.store().unwrap();
    codegen.pop().unwrap();

    codegen.push_frame_variable(slot, ValueType::function(signature)).unwrap();
    codegen.push_constant(Constant::Int(3), int()).unwrap();
    codegen.call(1).unwrap();
    codegen.gen_return().unwrap();

    let lines = body_text(&codegen.body);
    assert!(lines.contains(&String::from("<table target>")));
    assert!(lines.contains(&String::from("call_indirect (param i32) (result i32)")));

    codegen.finish().unwrap();
    assembler
        .begin_function(function("target", vec![int()], int()))
        .unwrap()
        .finish()
        .unwrap();
    let output = finish_valid(assembler);
    assert_eq!(output.layout.table_entries, vec![String::from("target")]);
}

#[test]
fn indirect_call_through_unprototyped_type_is_unsupported() {
    let mut assembler = new_assembler();
    let mut codegen = assembler
        .begin_function(function("f", vec![int()], ValueType::void()))
        .unwrap();

    let pointer_type = ValueType::function(Rc::new(Signature::unprototyped(int())));
    codegen.push_parameter(0).unwrap();
    codegen.convert(pointer_type).unwrap();
    let error = codegen.call(0).expect_err("no prototype");
    assert_eq!(error.error_type, ErrorType::Unsupported);
}

#[test]
fn structure_returns_use_a_caller_frame_slot() {
    let mut assembler = new_assembler();
    let pair = ValueType::aggregate(8, 4);
    assembler
        .declare_function(function("make_pair", Vec::new(), pair.to_owned()))
        .unwrap();
    let mut codegen = assembler
        .begin_function(function("f", Vec::new(), int()))
        .unwrap();

    codegen.push_function("make_pair").unwrap();
    codegen.call(0).unwrap();

    // The result is a location in the caller's frame, read its first field
    codegen.address_of().unwrap();
    codegen.deref(int()).unwrap();
    codegen.gen_return().unwrap();

    assert_eq!(codegen.frame_offset, -8);
    let lines = body_text(&codegen.body);
    let call = position(&lines, "call $make_pair");
    assert_eq!(lines[call - 3], "i32.const -8");
    assert_eq!(lines[call - 1], "<stack grow>");

    codegen.finish().unwrap();

    let mut callee = assembler
        .begin_function(function("make_pair", Vec::new(), pair.to_owned()))
        .unwrap();
    let local = callee.allocate_frame(8, 4);
    callee.push_frame_variable(local, pair).unwrap();
    callee.gen_return().unwrap();
    let callee_lines = body_text(&callee.body);
    assert!(callee_lines.contains(&String::from("local.get $sret")));
    assert!(callee_lines.contains(&String::from("memory.copy")));
    callee.finish().unwrap();

    finish_valid(assembler);
}

#[test]
fn returning_the_wrong_machine_type_is_a_compiler_error() {
    let mut assembler = new_assembler();
    let mut codegen = assembler
        .begin_function(function("f", Vec::new(), int()))
        .unwrap();

    codegen.push_constant(Constant::Float(1.0), ValueType::double()).unwrap();
    let error = codegen.gen_return().expect_err("f64 returned from i32 function");
    assert_eq!(error.error_type, ErrorType::Compiler);
}

//! Tests for module layout, symbol resolution and rendering.

use super::*;
use crate::backends::wasm::operand::Constant;
use crate::backends::wasm::test_support::{finish_valid, function, int, new_assembler};
use crate::compiler_messages::compiler_errors::ErrorType;

#[test]
fn data_is_aligned_on_absolute_addresses() {
    let mut assembler = new_assembler();
    assert_eq!(assembler.define_data("a", b"abc", 1).unwrap(), 0);
    assert_eq!(assembler.define_data("b", &[1, 2, 3, 4], 4).unwrap(), 4);
    assert_eq!(assembler.reserve_data("c", 8, 8).unwrap(), 8);

    assert_eq!(assembler.data_address("a"), Some(16));
    assert_eq!(assembler.data_address("b"), Some(20));
    assert_eq!(assembler.data_address("c"), Some(24));
    assert_eq!(assembler.data_address("missing"), None);
}

#[test]
fn duplicate_data_is_a_link_error() {
    let mut assembler = new_assembler();
    assembler.define_data("a", b"x", 1).unwrap();
    let error = assembler.define_data("a", b"y", 1).expect_err("duplicate");
    assert_eq!(error.error_type, ErrorType::Link);
}

#[test]
fn default_layout_reserves_the_stack_above_data() {
    let mut assembler = new_assembler();
    assembler.define_data("msg", b"hello", 1).unwrap();

    let output = finish_valid(assembler);
    let layout = output.layout;
    assert_eq!(layout.memory_base, 16);
    assert_eq!(layout.data_end, 21);
    assert_eq!(layout.stack_pointer, 24 + 65536);
    assert_eq!(layout.heap_base, layout.stack_pointer);
    assert_eq!(layout.memory_pages, 2);
    assert_eq!(layout.table_base, 1);
    assert_eq!(layout.table_size, 1);
    assert_eq!(
        layout.data_symbols,
        vec![DataSymbolLayout {
            name: String::from("msg"),
            address: 16,
            size: 5,
        }]
    );

    assert!(output.text.contains("(data (i32.const 16) \"\\68\\65\\6c\\6c\\6f\")"));
    assert!(output.text.contains("(global $__stack_pointer (export \"__stack_pointer\") (mut i32) (i32.const 65560))"));
    assert!(output.text.contains("(memory (export \"memory\") 2)"));
}

#[test]
fn large_stack_reserve_grows_the_memory() {
    let config = BackendConfig {
        heap_reserve: 3 * 65536,
        min_memory_pages: 1,
        ..BackendConfig::default()
    };
    let assembler = ModuleAssembler::new(&config);
    let output = finish_valid(assembler);

    // 16 bytes of base plus three pages of stack need a fourth page
    assert_eq!(output.layout.memory_pages, 4);
}

#[test]
fn module_sections_come_in_a_fixed_order() {
    let mut assembler = new_assembler();
    assembler
        .begin_function(function("main", Vec::new(), int()))
        .unwrap()
        .finish()
        .unwrap();
    let text = finish_valid(assembler).text;

    let order = [
        "(import \"wasi_unstable\" \"fd_write\" (func $__wasi_fd_write",
        "(memory (export \"memory\")",
        "(func $main (export \"main\") (result i32)",
        "(global $__memory_base",
        "(global $__data_end",
        "(global $__heap_base",
        "(global $__stack_pointer",
        "(global $__table_base",
        "(data (i32.const 16)",
        "(table $__indirect_function_table (export \"__indirect_function_table\")",
    ];
    let mut last = 0;
    for part in order {
        let Some(found) = text.find(part) else {
            panic!("'{part}' missing from:\n{text}");
        };
        assert!(found >= last, "'{part}' out of order in:\n{text}");
        last = found;
    }
}

#[test]
fn relocations_patch_data_with_addresses_and_table_indices() {
    let mut assembler = new_assembler();
    assembler.define_data("target", b"zz", 1).unwrap();
    assembler.reserve_data("pointers", 8, 4).unwrap();
    assembler.relocate("pointers", 0, "target").unwrap();
    assembler.relocate("pointers", 4, "callback").unwrap();

    assembler
        .begin_function(function("callback", Vec::new(), ValueType::void()))
        .unwrap()
        .finish()
        .unwrap();

    let output = finish_valid(assembler);
    assert_eq!(output.layout.table_entries, vec![String::from("callback")]);

    // target is at 16, callback gets table index 1
    assert!(output.text.contains("\\7a\\7a\\00\\00\\10\\00\\00\\00\\01\\00\\00\\00"));
    assert!(output.text.contains("(elem (i32.const 1) func $callback)"));
}

#[test]
fn relocation_outside_the_symbol_is_rejected() {
    let mut assembler = new_assembler();
    assembler.reserve_data("word", 4, 4).unwrap();
    assert_eq!(
        assembler.relocate("word", 2, "word").unwrap_err().error_type,
        ErrorType::Compiler
    );
    assert_eq!(
        assembler.relocate("nothing", 0, "word").unwrap_err().error_type,
        ErrorType::Link
    );
}

#[test]
fn unresolved_relocation_target_is_a_link_error() {
    let mut assembler = new_assembler();
    assembler.reserve_data("word", 4, 4).unwrap();
    assembler.relocate("word", 0, "nowhere").unwrap();
    let error = assembler.finish().expect_err("nowhere isn't defined");
    assert_eq!(error.error_type, ErrorType::Link);
}

#[test]
fn conflicting_declarations_are_a_link_error() {
    let mut assembler = new_assembler();
    assembler.declare_function(function("f", vec![int()], int())).unwrap();
    assembler.declare_function(function("f", vec![int()], int())).unwrap();
    let error = assembler
        .declare_function(function("f", Vec::new(), int()))
        .expect_err("different signature");
    assert_eq!(error.error_type, ErrorType::Link);
}

#[test]
fn defining_a_function_twice_is_a_link_error() {
    let mut assembler = new_assembler();
    assembler
        .begin_function(function("f", Vec::new(), ValueType::void()))
        .unwrap()
        .finish()
        .unwrap();
    let error = assembler
        .begin_function(function("f", Vec::new(), ValueType::void()))
        .err()
        .expect("second definition");
    assert_eq!(error.error_type, ErrorType::Link);
}

#[test]
fn the_write_import_is_predeclared() {
    let mut assembler = new_assembler();
    let declaration = assembler.declaration("__wasi_fd_write").expect("import declared");
    assert_eq!(declaration.signature.params.len(), 4);

    let error = assembler
        .begin_function(function("__wasi_fd_write", Vec::new(), ValueType::void()))
        .err()
        .expect("imports can't be defined");
    assert_eq!(error.error_type, ErrorType::Link);
}

#[test]
fn call_to_an_undefined_function_fails_at_finish() {
    let mut assembler = new_assembler();
    assembler
        .declare_function(function("elsewhere", Vec::new(), ValueType::void()))
        .unwrap();
    let mut codegen = assembler
        .begin_function(function("f", Vec::new(), ValueType::void()))
        .unwrap();
    codegen.push_function("elsewhere").unwrap();
    codegen.call(0).unwrap();
    codegen.finish().unwrap();

    let error = assembler.finish().expect_err("elsewhere is never defined");
    assert_eq!(error.error_type, ErrorType::Link);
    assert!(error.msg.contains("elsewhere"));
}

#[test]
fn data_referenced_before_it_is_defined_resolves() {
    let mut assembler = new_assembler();
    let mut codegen = assembler
        .begin_function(function("f", Vec::new(), ValueType::pointer()))
        .unwrap();
    codegen.push_data_address("later").unwrap();
    codegen.gen_return().unwrap();
    codegen.finish().unwrap();

    assembler.define_data("later", b"!", 1).unwrap();
    let output = finish_valid(assembler);
    assert!(output.text.contains("global.get $__memory_base\n    i32.const 0\n    i32.add"));
}

#[test]
fn internal_functions_are_not_exported() {
    let mut assembler = new_assembler();
    assembler
        .begin_function(FunctionDecl::new(
            "hidden",
            Signature::new(Vec::new(), ValueType::void(), false),
            true,
        ))
        .unwrap()
        .finish()
        .unwrap();

    let text = finish_valid(assembler).text;
    assert!(text.contains("(func $hidden\n"));
    assert!(!text.contains("(export \"hidden\")"));
}

#[test]
fn table_indices_follow_first_use() {
    let mut assembler = new_assembler();
    for name in ["first", "second"] {
        assembler
            .begin_function(function(name, Vec::new(), ValueType::void()))
            .unwrap()
            .finish()
            .unwrap();
    }

    let mut codegen = assembler
        .begin_function(function("user", Vec::new(), ValueType::void()))
        .unwrap();
    for name in ["second", "first", "second"] {
        codegen.push_function(name).unwrap();
        codegen.convert(ValueType::pointer()).unwrap();
        codegen.pop().unwrap();
    }
    codegen.finish().unwrap();

    let output = finish_valid(assembler);
    assert_eq!(
        output.layout.table_entries,
        vec![String::from("second"), String::from("first")]
    );
    assert_eq!(output.layout.table_size, 3);
}

#[test]
fn same_input_gives_identical_text() {
    let build = || {
        let mut assembler = new_assembler();
        assembler.define_data("a", b"1", 1).unwrap();
        assembler.define_data("b", b"22", 2).unwrap();
        for name in ["x", "y", "z"] {
            let mut codegen = assembler
                .begin_function(function(name, Vec::new(), int()))
                .unwrap();
            codegen.push_constant(Constant::Int(1), int()).unwrap();
            codegen.gen_return().unwrap();
            codegen.finish().unwrap();
        }
        finish_valid(assembler).text
    };

    assert_eq!(build(), build());
}

#[test]
fn layout_serializes_to_json() {
    let output = finish_valid(new_assembler());
    let json = output.layout.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["memory_base"], 16);
    assert_eq!(value["table_base"], 1);
}

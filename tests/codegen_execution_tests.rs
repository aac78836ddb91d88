//! Runs generated modules under wasmtime.
//!
//! Every script in `tests/cases` defines `main() -> i32` and its file name starts with
//! the value main is expected to return, e.g. `42_variadic_sum.wir`.

use proptest::prelude::*;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use wasmgen::backends::wasm::module_assembler::ModuleOutput;
use wasmgen::backends::wasm::validator::assemble_binary;
use wasmgen::ir_script::compile_source;
use wasmgen::settings::BackendConfig;
use wasmtime::{Caller, Engine, Extern, Instance, Linker, Module, Store};

#[derive(Default)]
struct Host {
    output: Vec<u8>,
}

fn compile(source: &str, file: Option<&Path>) -> ModuleOutput {
    match compile_source(source, file, &BackendConfig::default()) {
        Ok(output) => output,
        Err(e) => panic!("{}: {}", e.location, e),
    }
}

fn assemble(output: &ModuleOutput) -> Vec<u8> {
    match assemble_binary(&output.text) {
        Ok(bytes) => bytes,
        Err(e) => panic!("{e}\n{}", output.text),
    }
}

fn linker(engine: &Engine) -> Linker<Host> {
    let mut linker = Linker::new(engine);
    linker
        .func_wrap(
            "wasi_unstable",
            "fd_write",
            |mut caller: Caller<'_, Host>, _fd: i32, iovs: i32, iovs_len: i32, nwritten: i32| -> i32 {
                let Some(Extern::Memory(memory)) = caller.get_export("memory") else {
                    return 8;
                };

                let data = memory.data(&caller);
                let word = |address: usize| {
                    u32::from_le_bytes([
                        data[address],
                        data[address + 1],
                        data[address + 2],
                        data[address + 3],
                    ]) as usize
                };

                let mut written = Vec::new();
                for index in 0..iovs_len as usize {
                    let iov = iovs as usize + index * 8;
                    let start = word(iov);
                    let len = word(iov + 4);
                    written.extend_from_slice(&data[start..start + len]);
                }

                let count = (written.len() as u32).to_le_bytes();
                let at = nwritten as usize;
                memory.data_mut(&mut caller)[at..at + 4].copy_from_slice(&count);
                caller.data_mut().output.extend(written);
                0
            },
        )
        .expect("fd_write should be linked");
    linker
}

fn instantiate(engine: &Engine, module: &Module) -> (Store<Host>, Instance) {
    let mut store = Store::new(engine, Host::default());
    let instance = linker(engine)
        .instantiate(&mut store, module)
        .expect("module should instantiate");
    (store, instance)
}

/// Runs `main` and returns its result with everything written through fd_write
fn run_main(bytes: &[u8]) -> (i32, Vec<u8>) {
    let engine = Engine::default();
    let module = Module::new(&engine, bytes).expect("module should compile");
    let (mut store, instance) = instantiate(&engine, &module);

    let main = instance
        .get_typed_func::<(), i32>(&mut store, "main")
        .expect("main should be exported");
    let result = main.call(&mut store, ()).expect("main should not trap");
    (result, store.into_data().output)
}

fn expected_result(path: &Path) -> i32 {
    let stem = path.file_stem().and_then(|stem| stem.to_str()).unwrap_or_default();
    let number = stem.split('_').next().unwrap_or_default();
    number
        .parse()
        .unwrap_or_else(|_| panic!("{} should start with the expected result", path.display()))
}

#[test]
fn test_all_cases_in_folder() {
    let mut errors = Vec::new();
    let mut cases = 0;

    for entry in fs::read_dir("tests/cases").expect("cases folder should exist") {
        let path = entry.expect("entry should be readable").path();
        if path.extension().and_then(|s| s.to_str()) != Some("wir") {
            continue;
        }
        cases += 1;

        let source = fs::read_to_string(&path).expect("case should be readable");
        let output = compile(&source, Some(&path));
        let (got, _) = run_main(&assemble(&output));

        let expected = expected_result(&path);
        if got != expected {
            errors.push(format!("{}: got {got}, expected {expected}", path.display()));
        }
    }

    assert!(cases > 0, "no cases found");
    if !errors.is_empty() {
        panic!("Some cases failed:\n{}", errors.join("\n"));
    }
}

#[test]
fn hello_writes_through_the_host_import() {
    let source = fs::read_to_string("tests/cases/0_hello.wir").expect("case should be readable");
    let (result, output) = run_main(&assemble(&compile(&source, None)));
    assert_eq!(result, 0);
    assert_eq!(output, b"hi\n");
}

#[test]
fn cases_compile_deterministically() {
    for entry in fs::read_dir("tests/cases").expect("cases folder should exist") {
        let path = entry.expect("entry should be readable").path();
        let source = fs::read_to_string(&path).expect("case should be readable");
        let first = compile(&source, Some(&path));
        let second = compile(&source, Some(&path));
        assert_eq!(first.text, second.text, "{} changed between runs", path.display());
        assert_eq!(first.layout, second.layout);
    }
}

#[test]
fn table_indices_match_the_stored_pointers() {
    let source = fs::read_to_string("tests/cases/16_indirect_table.wir").expect("case should be readable");
    let output = compile(&source, None);

    assert_eq!(
        output.layout.table_entries,
        vec![String::from("add_one"), String::from("double")]
    );
    assert!(output.text.contains("(elem (i32.const 1) func $add_one)"));
    assert!(output.text.contains("(elem (i32.const 2) func $double)"));

    // The static pointer array holds exactly those indices
    let ops = output
        .layout
        .data_symbols
        .iter()
        .find(|symbol| symbol.name == "ops")
        .expect("ops should be laid out");
    assert_eq!(ops.size, 8);

    let engine = Engine::default();
    let module = Module::new(&engine, assemble(&output)).expect("module should compile");
    let (mut store, instance) = instantiate(&engine, &module);
    let memory = instance
        .get_memory(&mut store, "memory")
        .expect("memory should be exported");
    let data = memory.data(&store);
    let start = ops.address as usize;
    assert_eq!(&data[start..start + 8], &[1, 0, 0, 0, 2, 0, 0, 0]);

    // Internal functions stay out of the exports
    assert!(instance.get_func(&mut store, "apply").is_none());
}

#[test]
fn stack_pointer_is_restored_after_calls() {
    let source = fs::read_to_string("tests/cases/42_variadic_sum.wir").expect("case should be readable");
    let output = compile(&source, None);

    let engine = Engine::default();
    let module = Module::new(&engine, assemble(&output)).expect("module should compile");
    let (mut store, instance) = instantiate(&engine, &module);
    let main = instance
        .get_typed_func::<(), i32>(&mut store, "main")
        .expect("main should be exported");
    assert_eq!(main.call(&mut store, ()).expect("main should run"), 42);

    let stack_pointer = instance
        .get_global(&mut store, "__stack_pointer")
        .expect("stack pointer should be exported");
    assert_eq!(
        stack_pointer.get(&mut store).i32(),
        Some(output.layout.stack_pointer as i32)
    );
}

const CONVERSIONS: &str = "
func widen (i32)->i64
    param 0
    cvt i64
    return
endfunc
func widen_unsigned (u32)->u64
    param 0
    cvt u64
    return
endfunc
func narrow (i64)->i32
    param 0
    cvt i32
    return
endfunc
func through_double (i32)->i32
    param 0
    cvt f64
    cvt i32
    return
endfunc
func is_negative (i32)->i32
    param 0
    const i32 0
    cmp lt_s
    not
    not
    return
endfunc
";

fn conversions() -> &'static (Engine, Module) {
    static MODULE: OnceLock<(Engine, Module)> = OnceLock::new();
    MODULE.get_or_init(|| {
        let engine = Engine::default();
        let bytes = assemble(&compile(CONVERSIONS, None));
        let module = Module::new(&engine, bytes).expect("module should compile");
        (engine, module)
    })
}

proptest! {
    #[test]
    fn integer_conversions_keep_their_value(x in any::<i32>()) {
        let (engine, module) = conversions();
        let (mut store, instance) = instantiate(engine, module);

        let widen = instance.get_typed_func::<i32, i64>(&mut store, "widen").expect("widen");
        let widen_unsigned = instance
            .get_typed_func::<i32, i64>(&mut store, "widen_unsigned")
            .expect("widen_unsigned");
        let narrow = instance.get_typed_func::<i64, i32>(&mut store, "narrow").expect("narrow");
        let through_double = instance
            .get_typed_func::<i32, i32>(&mut store, "through_double")
            .expect("through_double");
        let is_negative = instance
            .get_typed_func::<i32, i32>(&mut store, "is_negative")
            .expect("is_negative");

        let wide = widen.call(&mut store, x).expect("widen runs");
        prop_assert_eq!(wide, x as i64);
        prop_assert_eq!(widen_unsigned.call(&mut store, x).expect("widen_unsigned runs"), x as u32 as i64);
        prop_assert_eq!(narrow.call(&mut store, wide).expect("narrow runs"), x);
        prop_assert_eq!(through_double.call(&mut store, x).expect("through_double runs"), x);
        prop_assert_eq!(is_negative.call(&mut store, x).expect("is_negative runs"), (x < 0) as i32);
    }
}

proptest! {
    #[test]
    fn narrowing_then_widening_sign_extends(v in any::<i64>()) {
        let (engine, module) = conversions();
        let (mut store, instance) = instantiate(engine, module);

        let widen = instance.get_typed_func::<i32, i64>(&mut store, "widen").expect("widen");
        let narrow = instance.get_typed_func::<i64, i32>(&mut store, "narrow").expect("narrow");

        let narrowed = narrow.call(&mut store, v).expect("narrow runs");
        prop_assert_eq!(narrowed, v as i32);
        prop_assert_eq!(widen.call(&mut store, narrowed).expect("widen runs"), v as i32 as i64);
    }
}

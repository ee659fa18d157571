//! End-to-end tests: assemble a module from text, compile it to native
//! code, and run it on the current thread.

use presto_runtime::{Instance, Value};

fn with_instance<R>(wat_src: &str, f: impl FnOnce(&Instance<'_>) -> R) -> R {
    tracing_subscriber::fmt::try_init().ok();
    let bytes = wat::parse_str(wat_src).unwrap();
    let md = presto_module::decode_module(&bytes).unwrap();
    let instance = Instance::new(md).unwrap();
    f(&instance)
}

fn run_i32(wat_src: &str, name: &str, args: &[Value]) -> i32 {
    with_instance(wat_src, |inst| {
        inst.invoke(name, args).unwrap().unwrap().unwrap_i32()
    })
}

#[test]
fn add_two_numbers() {
    let src = r#"(module (func (export "add") (param i32 i32) (result i32)
        local.get 0
        local.get 1
        i32.add))"#;
    with_instance(src, |inst| {
        let r = inst
            .invoke("add", &[Value::I32(2), Value::I32(3)])
            .unwrap()
            .unwrap();
        assert_eq!(r, Value::I32(5));
        // Arithmetic wraps around.
        let r = inst
            .invoke("add", &[Value::I32(i32::MAX), Value::I32(1)])
            .unwrap()
            .unwrap();
        assert_eq!(r, Value::I32(i32::MIN));
    });
}

#[test]
fn loop_sums_one_to_hundred() {
    let src = r#"(module (func (export "sum") (result i32)
        (local $i i32) (local $acc i32)
        (block
            (loop
                (local.set $i (i32.add (local.get $i) (i32.const 1)))
                (local.set $acc (i32.add (local.get $acc) (local.get $i)))
                (br_if 1 (i32.ge_s (local.get $i) (i32.const 100)))
                (br 0)))
        local.get $acc))"#;
    assert_eq!(run_i32(src, "sum", &[]), 5050);
}

#[test]
fn locals_start_zeroed() {
    let src = r#"(module (func (export "zeros") (result i32)
        (local i32 i64 i32)
        (i32.add
            (i32.add (local.get 0) (local.get 2))
            (i32.wrap_i64 (local.get 1)))))"#;
    assert_eq!(run_i32(src, "zeros", &[]), 0);
}

#[test]
fn deep_expressions_spill_to_the_evaluation_stack() {
    let src = r#"(module (func (export "deep") (result i32)
        i32.const 1
        i32.const 2
        i32.const 3
        i32.const 4
        i32.const 5
        i32.const 6
        i32.add
        i32.add
        i32.add
        i32.add
        i32.add))"#;
    assert_eq!(run_i32(src, "deep", &[]), 21);
}

#[test]
fn division_and_remainder() {
    let src = r#"(module
        (func (export "div_s") (param i32 i32) (result i32)
            (i32.div_s (local.get 0) (local.get 1)))
        (func (export "rem_u") (param i32 i32) (result i32)
            (i32.rem_u (local.get 0) (local.get 1))))"#;
    with_instance(src, |inst| {
        let div = |a, b| {
            inst.invoke("div_s", &[Value::I32(a), Value::I32(b)])
                .unwrap()
                .unwrap()
                .unwrap_i32()
        };
        assert_eq!(div(7, 2), 3);
        assert_eq!(div(-7, 2), -3);
        let rem = inst
            .invoke("rem_u", &[Value::I32(10), Value::I32(3)])
            .unwrap()
            .unwrap();
        assert_eq!(rem, Value::I32(1));
    });
}

#[test]
fn shift_counts_are_masked() {
    let src = r#"(module (func (export "shl") (param i32 i32) (result i32)
        (i32.shl (local.get 0) (local.get 1))))"#;
    with_instance(src, |inst| {
        let shl = |a, b| {
            inst.invoke("shl", &[Value::I32(a), Value::I32(b)])
                .unwrap()
                .unwrap()
                .unwrap_i32()
        };
        assert_eq!(shl(1, 4), 16);
        // The count is masked by 31.
        assert_eq!(shl(1, 33), 2);
    });
}

#[test]
fn i64_arithmetic() {
    let src = r#"(module (func (export "mix") (param i64 i64) (result i64)
        (i64.mul (i64.add (local.get 0) (local.get 1)) (i64.const 3))))"#;
    with_instance(src, |inst| {
        let r = inst
            .invoke("mix", &[Value::I64(1 << 40), Value::I64(2)])
            .unwrap()
            .unwrap();
        assert_eq!(r, Value::I64(((1i64 << 40) + 2) * 3));
    });
}

#[test]
fn float_arithmetic_and_conversions() {
    let src = r#"(module
        (func (export "fma") (param f64 f64 f64) (result f64)
            (f64.add (f64.mul (local.get 0) (local.get 1)) (local.get 2)))
        (func (export "to_int") (param f64) (result i32)
            (i32.trunc_f64_s (local.get 0)))
        (func (export "promote") (param f32) (result f64)
            (f64.promote_f32 (local.get 0))))"#;
    with_instance(src, |inst| {
        let r = inst
            .invoke(
                "fma",
                &[Value::F64(2.5), Value::F64(4.0), Value::F64(1.0)],
            )
            .unwrap()
            .unwrap();
        assert_eq!(r, Value::F64(11.0));
        let r = inst.invoke("to_int", &[Value::F64(-3.7)]).unwrap().unwrap();
        assert_eq!(r, Value::I32(-3));
        let r = inst.invoke("promote", &[Value::F32(1.5)]).unwrap().unwrap();
        assert_eq!(r, Value::F64(1.5));
    });
}

#[test]
fn float_comparisons_handle_nan() {
    let src = r#"(module
        (func (export "lt") (param f64 f64) (result i32)
            (f64.lt (local.get 0) (local.get 1)))
        (func (export "ne") (param f64 f64) (result i32)
            (f64.ne (local.get 0) (local.get 1))))"#;
    with_instance(src, |inst| {
        let call = |name: &str, a: f64, b: f64| {
            inst.invoke(name, &[Value::F64(a), Value::F64(b)])
                .unwrap()
                .unwrap()
                .unwrap_i32()
        };
        assert_eq!(call("lt", 1.0, 2.0), 1);
        assert_eq!(call("lt", 2.0, 1.0), 0);
        assert_eq!(call("lt", f64::NAN, 1.0), 0);
        assert_eq!(call("ne", 1.0, 1.0), 0);
        assert_eq!(call("ne", f64::NAN, f64::NAN), 1);
    });
}

#[test]
fn select_picks_by_condition() {
    let src = r#"(module (func (export "pick") (param i32) (result i32)
        (select (i32.const 10) (i32.const 20) (local.get 0))))"#;
    with_instance(src, |inst| {
        assert_eq!(
            inst.invoke("pick", &[Value::I32(1)]).unwrap().unwrap(),
            Value::I32(10)
        );
        assert_eq!(
            inst.invoke("pick", &[Value::I32(0)]).unwrap().unwrap(),
            Value::I32(20)
        );
    });
}

#[test]
fn if_else_joins_with_a_result() {
    let src = r#"(module (func (export "abs") (param i32) (result i32)
        (if (result i32) (i32.lt_s (local.get 0) (i32.const 0))
            (then (i32.sub (i32.const 0) (local.get 0)))
            (else (local.get 0)))))"#;
    with_instance(src, |inst| {
        assert_eq!(
            inst.invoke("abs", &[Value::I32(-5)]).unwrap().unwrap(),
            Value::I32(5)
        );
        assert_eq!(
            inst.invoke("abs", &[Value::I32(9)]).unwrap().unwrap(),
            Value::I32(9)
        );
    });
}

#[test]
fn globals_persist_between_calls() {
    let src = r#"(module
        (global $g (mut i32) (i32.const 40))
        (func (export "bump") (result i32)
            (global.set $g (i32.add (global.get $g) (i32.const 1)))
            global.get $g))"#;
    with_instance(src, |inst| {
        assert_eq!(inst.invoke("bump", &[]).unwrap().unwrap(), Value::I32(41));
        assert_eq!(inst.invoke("bump", &[]).unwrap().unwrap(), Value::I32(42));
    });
}

#[test]
fn linear_memory_loads_and_stores() {
    let src = r#"(module
        (memory 1)
        (data (i32.const 64) "\2a\00\00\00")
        (func (export "rd") (param i32) (result i32)
            (i32.load (local.get 0)))
        (func (export "wr") (param i32 i32)
            (i32.store (local.get 0) (local.get 1)))
        (func (export "rd8") (param i32) (result i32)
            (i32.load8_s (local.get 0))))"#;
    with_instance(src, |inst| {
        assert_eq!(
            inst.invoke("rd", &[Value::I32(64)]).unwrap().unwrap(),
            Value::I32(42)
        );
        inst.invoke("wr", &[Value::I32(128), Value::I32(-1)]).unwrap();
        assert_eq!(
            inst.invoke("rd", &[Value::I32(128)]).unwrap().unwrap(),
            Value::I32(-1)
        );
        assert_eq!(
            inst.invoke("rd8", &[Value::I32(128)]).unwrap().unwrap(),
            Value::I32(-1)
        );
    });
}

#[test]
fn memory_grow_follows_the_protocol() {
    let src = r#"(module
        (memory 1)
        (func (export "size") (result i32) memory.size)
        (func (export "grow") (param i32) (result i32)
            (memory.grow (local.get 0)))
        (func (export "poke") (param i32)
            (i32.store (local.get 0) (i32.const 7))))"#;
    with_instance(src, |inst| {
        assert_eq!(inst.invoke("size", &[]).unwrap().unwrap(), Value::I32(1));
        // Growing by zero only reports the current size.
        assert_eq!(
            inst.invoke("grow", &[Value::I32(0)]).unwrap().unwrap(),
            Value::I32(1)
        );
        assert_eq!(inst.invoke("size", &[]).unwrap().unwrap(), Value::I32(1));
        // Growing returns the old size and commits the new page.
        assert_eq!(
            inst.invoke("grow", &[Value::I32(1)]).unwrap().unwrap(),
            Value::I32(1)
        );
        assert_eq!(inst.invoke("size", &[]).unwrap().unwrap(), Value::I32(2));
        inst.invoke("poke", &[Value::I32(65536)]).unwrap();
    });
}

#[test]
fn direct_calls_and_recursion() {
    let src = r#"(module
        (func $fact (param i32) (result i32)
            (if (result i32) (i32.le_s (local.get 0) (i32.const 1))
                (then (i32.const 1))
                (else
                    (i32.mul
                        (local.get 0)
                        (call $fact (i32.sub (local.get 0) (i32.const 1)))))))
        (func (export "fact") (param i32) (result i32)
            (call $fact (local.get 0))))"#;
    with_instance(src, |inst| {
        assert_eq!(
            inst.invoke("fact", &[Value::I32(10)]).unwrap().unwrap(),
            Value::I32(3628800)
        );
    });
}

#[test]
fn call_indirect_dispatches_through_the_table() {
    let src = r#"(module
        (type $binop (func (param i32 i32) (result i32)))
        (table 2 2 funcref)
        (elem (i32.const 0) $add $sub)
        (func $add (type $binop)
            (i32.add (local.get 0) (local.get 1)))
        (func $sub (type $binop)
            (i32.sub (local.get 0) (local.get 1)))
        (func (export "apply") (param i32 i32 i32) (result i32)
            (call_indirect (type $binop)
                (local.get 1) (local.get 2) (local.get 0))))"#;
    with_instance(src, |inst| {
        let apply = |which, a, b| {
            inst.invoke("apply", &[Value::I32(which), Value::I32(a), Value::I32(b)])
                .unwrap()
                .unwrap()
                .unwrap_i32()
        };
        assert_eq!(apply(0, 30, 12), 42);
        assert_eq!(apply(1, 30, 12), 18);
    });
}

#[test]
fn br_table_clamps_out_of_range_to_the_default() {
    let src = r#"(module (func (export "classify") (param i32) (result i32)
        (block
            (block
                (block
                    local.get 0
                    br_table 0 1 2)
                (return (i32.const 100)))
            (return (i32.const 200)))
        i32.const 300))"#;
    with_instance(src, |inst| {
        let classify = |v| {
            inst.invoke("classify", &[Value::I32(v)])
                .unwrap()
                .unwrap()
                .unwrap_i32()
        };
        assert_eq!(classify(0), 100);
        assert_eq!(classify(1), 200);
        assert_eq!(classify(2), 300);
        // Out-of-range indices take the default case.
        assert_eq!(classify(7), 300);
        assert_eq!(classify(-1), 300);
    });
}

#[test]
fn block_results_cross_branches() {
    let src = r#"(module (func (export "clamp") (param i32) (result i32)
        (block (result i32)
            local.get 0
            local.get 0
            (i32.lt_s (i32.const 99))
            br_if 0
            drop
            i32.const 99)))"#;
    with_instance(src, |inst| {
        assert_eq!(
            inst.invoke("clamp", &[Value::I32(5)]).unwrap().unwrap(),
            Value::I32(5)
        );
        assert_eq!(
            inst.invoke("clamp", &[Value::I32(123)]).unwrap().unwrap(),
            Value::I32(99)
        );
    });
}

#[test]
fn many_arguments_cross_the_callee_frame() {
    let src = r#"(module
        (func $sum6 (param i32 i32 i32 i32 i32 i32) (result i32)
            (i32.add (local.get 0)
                (i32.add (local.get 1)
                    (i32.add (local.get 2)
                        (i32.add (local.get 3)
                            (i32.add (local.get 4) (local.get 5)))))))
        (func (export "go") (result i32)
            (call $sum6
                (i32.const 1) (i32.const 2) (i32.const 3)
                (i32.const 4) (i32.const 5) (i32.const 6))))"#;
    assert_eq!(run_i32(src, "go", &[]), 21);
}

#[test]
fn mixed_class_arguments() {
    let src = r#"(module
        (func $w (param f64 i32 f64) (result f64)
            (f64.add
                (f64.mul (local.get 0) (f64.convert_i32_s (local.get 1)))
                (local.get 2)))
        (func (export "go") (result f64)
            (call $w (f64.const 2.5) (i32.const 4) (f64.const 1.5))))"#;
    with_instance(src, |inst| {
        assert_eq!(inst.invoke("go", &[]).unwrap().unwrap(), Value::F64(11.5));
    });
}

#[test]
fn bit_counting_and_rotates() {
    let src = r#"(module
        (func (export "bits") (param i32) (result i32)
            (i32.add (i32.clz (local.get 0))
                (i32.add (i32.ctz (local.get 0)) (i32.popcnt (local.get 0)))))
        (func (export "rotl") (param i32 i32) (result i32)
            (i32.rotl (local.get 0) (local.get 1)))
        (func (export "eqz") (param i32) (result i32)
            (i32.eqz (local.get 0))))"#;
    with_instance(src, |inst| {
        assert_eq!(
            inst.invoke("bits", &[Value::I32(0xf0)]).unwrap().unwrap(),
            Value::I32(24 + 4 + 4)
        );
        assert_eq!(
            inst.invoke("rotl", &[Value::I32(0x8000_0001u32 as i32), Value::I32(1)])
                .unwrap()
                .unwrap(),
            Value::I32(3)
        );
        assert_eq!(inst.invoke("eqz", &[Value::I32(0)]).unwrap().unwrap(), Value::I32(1));
        assert_eq!(inst.invoke("eqz", &[Value::I32(3)]).unwrap().unwrap(), Value::I32(0));
    });
}

#[test]
fn sign_extension_and_reinterpret() {
    let src = r#"(module
        (func (export "ext8") (param i32) (result i32)
            (i32.extend8_s (local.get 0)))
        (func (export "bits_of") (param f64) (result i64)
            (i64.reinterpret_f64 (local.get 0))))"#;
    with_instance(src, |inst| {
        assert_eq!(
            inst.invoke("ext8", &[Value::I32(0x80)]).unwrap().unwrap(),
            Value::I32(-128)
        );
        assert_eq!(
            inst.invoke("bits_of", &[Value::F64(1.0)]).unwrap().unwrap(),
            Value::I64(0x3ff0_0000_0000_0000)
        );
    });
}

#[test]
fn unsigned_i64_comparisons() {
    let src = r#"(module (func (export "lt_u") (param i64 i64) (result i32)
        (i64.lt_u (local.get 0) (local.get 1))))"#;
    with_instance(src, |inst| {
        let lt = |a: u64, b: u64| {
            inst.invoke("lt_u", &[Value::I64(a as i64), Value::I64(b as i64)])
                .unwrap()
                .unwrap()
                .unwrap_i32()
        };
        assert_eq!(lt(1, 2), 1);
        assert_eq!(lt(u64::MAX, 1), 0);
        assert_eq!(lt(1, u64::MAX), 1);
    });
}

#[test]
fn block_result_spilled_across_a_call() {
    // The block's result is live across the call, so it is committed to
    // the evaluation stack at the block's end.
    let src = r#"(module
        (func $id (param i32) (result i32) (local.get 0))
        (func (export "tricky") (param i32) (result i32)
            (i32.add
                (block (result i32) (i32.add (local.get 0) (i32.const 1)))
                (call $id (i32.const 5)))))"#;
    with_instance(src, |inst| {
        assert_eq!(
            inst.invoke("tricky", &[Value::I32(10)]).unwrap().unwrap(),
            Value::I32(16)
        );
    });
}

#[test]
fn block_result_reloaded_after_an_interior_call() {
    // The value is spilled by the call boundary but the join point wants
    // it back in a register.
    let src = r#"(module
        (func $nop)
        (func (export "reload") (param i32) (result i32)
            (block (result i32)
                local.get 0
                call $nop)))"#;
    with_instance(src, |inst| {
        assert_eq!(
            inst.invoke("reload", &[Value::I32(9)]).unwrap().unwrap(),
            Value::I32(9)
        );
    });
}

#[test]
fn if_without_else() {
    let src = r#"(module (func (export "maybe") (param i32) (result i32)
        (local $r i32)
        (local.set $r (i32.const 5))
        (if (local.get 0)
            (then (local.set $r (i32.const 9))))
        local.get $r))"#;
    with_instance(src, |inst| {
        assert_eq!(
            inst.invoke("maybe", &[Value::I32(0)]).unwrap().unwrap(),
            Value::I32(5)
        );
        assert_eq!(
            inst.invoke("maybe", &[Value::I32(2)]).unwrap().unwrap(),
            Value::I32(9)
        );
    });
}

#[test]
fn wasi_fd_write_reaches_stdout() {
    let src = r#"(module
        (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
        (memory 1)
        (data (i32.const 16) "hi\n")
        (func (export "say") (result i32)
            (i32.store (i32.const 0) (i32.const 16))
            (i32.store (i32.const 4) (i32.const 3))
            (call $fd_write
                (i32.const 1)
                (i32.const 0)
                (i32.const 1)
                (i32.const 12))))"#;
    with_instance(src, |inst| {
        // Errno 0, and the bytes written counter updated in guest memory.
        assert_eq!(inst.invoke("say", &[]).unwrap().unwrap(), Value::I32(0));
    });
}

#[test]
fn unknown_imports_still_compile() {
    let src = r#"(module
        (import "made_up" "nope" (func $nope))
        (func (export "ok") (result i32)
            i32.const 1))"#;
    with_instance(src, |inst| {
        // The unknown import is reachable-but-trapping; calling around it
        // works fine.
        assert_eq!(inst.invoke("ok", &[]).unwrap().unwrap(), Value::I32(1));
    });
}

//! End-to-end tests: assemble small programs and run them on the machine.

use std::cell::RefCell;
use std::rc::Rc;

use stackvm::vm::{DebugEvent, StackFrame};
use stackvm::{
    ExitCode, Function, Machine, OutputBuffer, Program, ResourceLimits, Slot, Stdlib, Value,
    VmError,
};

/// Helper: build a machine over `functions` that captures its output.
fn machine(functions: Vec<Function>) -> (Machine, OutputBuffer) {
    let buffer = OutputBuffer::default();
    let program = Program::new(functions);
    let machine = Machine::with_builtins(
        &program,
        &ResourceLimits::default(),
        Box::new(Stdlib::capturing(buffer.clone())),
    )
    .expect("program should load");
    (machine, buffer)
}

/// Helper: run `_entry` to completion.
fn run_entry(source: &str) -> (Machine, OutputBuffer) {
    run_functions(vec![Function::new("_entry", source)])
}

fn run_functions(functions: Vec<Function>) -> (Machine, OutputBuffer) {
    let (mut vm, buffer) = machine(functions);
    vm.run().expect("program should run");
    (vm, buffer)
}

/// Helper: run and expect a fault.
fn run_err(functions: Vec<Function>) -> VmError {
    let (mut vm, _) = machine(functions);
    match vm.run() {
        Err(e) => e,
        Ok(()) => panic!("expected error, stack was {:?}", vm.stack()),
    }
}

fn run_entry_err(source: &str) -> VmError {
    run_err(vec![Function::new("_entry", source)])
}

fn int(n: i32) -> Slot {
    Slot::Value(Value::Int(n))
}

fn top(vm: &Machine) -> &Slot {
    vm.stack().last().expect("stack should not be empty")
}

// ─── Stack and literals ───

#[test]
fn e2e_literals_are_typed() {
    let (vm, _) = run_entry(r#"LOAD_CONST 1 LOAD_CONST 2.5 LOAD_CONST true LOAD_CONST "a b" LOAD_CONST NULL HALT"#);
    assert_eq!(
        vm.stack(),
        &[
            int(1),
            Slot::Value(Value::Double(2.5)),
            Slot::Value(Value::Bool(true)),
            Slot::Value(Value::String("a b".into())),
            Slot::Value(Value::Null),
        ]
    );
}

#[test]
fn e2e_dup_and_pop() {
    let (vm, _) = run_entry("LOAD_CONST 4 DUP DUP POP HALT");
    assert_eq!(vm.stack(), &[int(4), int(4)]);
}

#[test]
fn e2e_pop_on_empty_stack_is_operation_err() {
    let err = run_entry_err("POP HALT");
    assert_eq!(err.exit_code(), ExitCode::OperationErr);
    assert!(matches!(err.root(), VmError::StackUnderflow("POP")));
}

// ─── Arithmetic ───

#[test]
fn e2e_subtraction_pops_rhs_first() {
    let (vm, _) = run_entry("LOAD_CONST 7 LOAD_CONST 2 SUB HALT");
    assert_eq!(top(&vm), &int(5));
}

#[test]
fn e2e_int_and_double_promote() {
    let (vm, _) = run_entry("LOAD_CONST 1 LOAD_CONST 2.5 ADD HALT");
    assert_eq!(top(&vm), &Slot::Value(Value::Double(3.5)));
}

#[test]
fn e2e_power_and_remainder() {
    let (vm, _) = run_entry("LOAD_CONST 2 LOAD_CONST 10 POW LOAD_CONST 7 LOAD_CONST 3 REM HALT");
    assert_eq!(vm.stack(), &[int(1024), int(1)]);
}

#[test]
fn e2e_division_by_zero_is_operation_err() {
    for source in [
        "LOAD_CONST 1 LOAD_CONST 0 DIV HALT",
        "LOAD_CONST 1.5 LOAD_CONST 0.0 DIV HALT",
        "LOAD_CONST 1 LOAD_CONST 0.0 REM HALT",
        "LOAD_CONST 3 LOAD_CONST 0 REM HALT",
    ] {
        let err = run_entry_err(source);
        assert_eq!(err.exit_code(), ExitCode::OperationErr, "{}", source);
        assert!(matches!(err.root(), VmError::DivisionByZero), "{}", source);
    }
}

#[test]
fn e2e_int_overflow_is_operation_err() {
    let err = run_entry_err("LOAD_CONST 2147483647 LOAD_CONST 1 ADD HALT");
    assert!(matches!(err.root(), VmError::ArithmeticOverflow));
    assert_eq!(err.exit_code().code(), 1);
}

#[test]
fn e2e_adding_a_string_to_an_int_fails() {
    let err = run_entry_err(r#"LOAD_CONST "x" LOAD_CONST 1 ADD HALT"#);
    assert_eq!(err.exit_code(), ExitCode::OperationErr);
}

// ─── Comparison and logic ───

#[test]
fn e2e_comparisons() {
    let (vm, _) = run_entry(
        "LOAD_CONST 1 LOAD_CONST 5 LE LOAD_CONST 2 LOAD_CONST 2.0 EQ LOAD_CONST 3 LOAD_CONST 3 NE HALT",
    );
    assert_eq!(
        vm.stack(),
        &[
            Slot::Value(Value::Bool(true)),
            Slot::Value(Value::Bool(true)),
            Slot::Value(Value::Bool(false)),
        ]
    );
}

#[test]
fn e2e_boolean_logic() {
    let (vm, _) = run_entry(
        "LOAD_CONST true LOAD_CONST false OR LOAD_CONST true LOAD_CONST false AND LOAD_CONST false NOT HALT",
    );
    assert_eq!(
        vm.stack(),
        &[
            Slot::Value(Value::Bool(true)),
            Slot::Value(Value::Bool(false)),
            Slot::Value(Value::Bool(true)),
        ]
    );
}

#[test]
fn e2e_bitwise_accepts_ints_and_booleans() {
    let (vm, _) = run_entry("LOAD_CONST 6 LOAD_CONST 3 XOR LOAD_CONST true LOAD_CONST 3 B_AND HALT");
    assert_eq!(vm.stack(), &[int(5), int(1)]);
}

#[test]
fn e2e_bitwise_rejects_strings() {
    let err = run_entry_err(r#"LOAD_CONST "x" LOAD_CONST 1 XOR HALT"#);
    assert_eq!(err.exit_code(), ExitCode::OperationErr);
}

#[test]
fn e2e_select_keeps_one_of_two() {
    let (vm, _) = run_entry("LOAD_CONST 1 LOAD_CONST 2 LOAD_CONST true SELECT HALT");
    assert_eq!(vm.stack(), &[int(2)]);
    let (vm, _) = run_entry("LOAD_CONST 1 LOAD_CONST 2 LOAD_CONST false SELECT HALT");
    assert_eq!(vm.stack(), &[int(1)]);
}

// ─── Strings ───

#[test]
fn e2e_concat_strings() {
    let (_, out) = run_entry(r#"LOAD_CONST "foo" LOAD_CONST "bar" CONCAT CALL println 1 HALT"#);
    assert_eq!(out.stdout(), "foobar\n");
}

#[test]
fn e2e_repeat_string() {
    let (vm, _) = run_entry(r#"LOAD_CONST "ab" REPEATSTR 3 LOAD_CONST "z" REPEATSTR 0 HALT"#);
    assert_eq!(
        vm.stack(),
        &[
            Slot::Value(Value::String("ababab".into())),
            Slot::Value(Value::String(String::new())),
        ]
    );
}

// ─── Locals and globals ───

#[test]
fn e2e_store_appends_or_overwrites() {
    let (vm, _) = run_entry("LOAD_CONST 1 STORE LOAD_CONST 2 STORE LOAD_CONST 9 STORE 0 LOAD 0 HALT");
    assert_eq!(vm.locals(0), &[int(9), int(2)]);
    assert_eq!(vm.stack(), &[int(9)]);
}

#[test]
fn e2e_store_past_high_water_mark_is_memory_err() {
    let err = run_entry_err("LOAD_CONST 1 STORE 3 HALT");
    assert_eq!(err.exit_code(), ExitCode::MemoryErr);
}

#[test]
fn e2e_globals_append_and_overwrite() {
    let (vm, _) = run_entry("LOAD_CONST 5 GSTORE LOAD_CONST 6 GSTORE 0 GLOAD 0 HALT");
    assert_eq!(vm.globals(), &[int(6)]);
    assert_eq!(vm.stack(), &[int(6)]);
}

#[test]
fn e2e_load_of_missing_global_is_memory_err() {
    let err = run_entry_err("GLOAD 2 HALT");
    assert_eq!(err.exit_code(), ExitCode::MemoryErr);
}

// ─── Calls ───

#[test]
fn e2e_call_passes_arguments_in_pop_order() {
    let (_, out) = run_functions(vec![
        Function::new("sub", "LOAD 0 LOAD 1 SUB RET"),
        Function::new("_entry", "LOAD_CONST 2 LOAD_CONST 3 CALL sub 2 CALL println 1 HALT"),
    ]);
    assert_eq!(out.stdout(), "1\n");
}

#[test]
fn e2e_ret_from_entry_finishes_with_result() {
    let (vm, _) = run_entry("LOAD_CONST 42 RET");
    assert!(vm.is_finished());
    assert_eq!(vm.result(), Some(&Value::Int(42)));
}

#[test]
fn e2e_halt_inside_a_callee_stops_the_machine() {
    let (vm, _) = run_functions(vec![
        Function::new("stop", "LOAD_CONST 1 HALT"),
        Function::new("_entry", "CALL stop 0 LOAD_CONST 2 HALT"),
    ]);
    assert!(vm.is_finished());
    assert_eq!(vm.depth(), 2);
    assert_eq!(vm.stack(), &[int(1)]);
}

#[test]
fn e2e_recursive_factorial() {
    let (_, out) = run_functions(vec![
        Function::new(
            "fact",
            "LOAD 0 LOAD_CONST 1 LE JMPT .base LOAD 0 LOAD 0 LOAD_CONST 1 SUB CALL fact 1 MUL RET .base: LOAD_CONST 1 RET EJMP",
        )
        .with_block(".base", 20, 23),
        Function::new("_entry", "LOAD_CONST 5 CALL fact 1 CALL println 1 HALT"),
    ]);
    assert_eq!(out.stdout(), "120\n");
}

#[test]
fn e2e_unknown_function_is_unknown_bytecode() {
    let err = run_entry_err("CALL nope 0 HALT");
    assert_eq!(err.exit_code(), ExitCode::UnknownBytecode);
    assert_eq!(err.root().to_string(), "could not find function 'nope'");
}

#[test]
fn e2e_builtin_rejects_uninitialized_argument() {
    let err = run_entry_err("LOAD_CONST 1 BUILDARR 3 0 LOAD_CONST 2 AGET CALL println 1 HALT");
    assert_eq!(err.exit_code(), ExitCode::OperationErr);
}

// ─── Faults ───

#[test]
fn e2e_missing_entry_point() {
    let program = Program::new(vec![Function::new("main", "HALT")]);
    let err = Machine::new(&program, &ResourceLimits::default()).expect_err("should not load");
    assert_eq!(err.exit_code(), ExitCode::UnknownBytecode);
    assert_eq!(
        err.to_string(),
        "could not find entry point function label: '_entry'"
    );
}

#[test]
fn e2e_unknown_mnemonic_faults_only_when_reached() {
    let (vm, _) = run_entry("HALT FOO");
    assert!(vm.is_finished());

    let err = run_entry_err("FOO HALT");
    assert_eq!(err.exit_code().code(), 254);
    assert!(matches!(err.root(), VmError::UnknownBytecode(t) if t == "FOO"));
}

#[test]
fn e2e_malformed_operand_is_unknown_bytecode() {
    let err = run_entry_err("LOAD x HALT");
    assert_eq!(err.exit_code(), ExitCode::UnknownBytecode);
}

#[test]
fn e2e_running_off_the_end_is_vm_err() {
    let err = run_entry_err("LOAD_CONST 1");
    assert_eq!(err.exit_code(), ExitCode::VmErr);
    assert_eq!(err.exit_code().code(), 255);
}

#[test]
fn e2e_fault_carries_stack_trace() {
    let err = run_err(vec![
        Function::new("boom", "LOAD_CONST 1 LOAD_CONST 0 DIV RET"),
        Function::new("_entry", "CALL boom 0 HALT"),
    ]);
    assert_eq!(
        err.stack_frames(),
        &[
            StackFrame {
                function: "_entry".into(),
                pc: 0
            },
            StackFrame {
                function: "boom".into(),
                pc: 2
            },
        ]
    );
    let message = err.to_string();
    assert!(message.starts_with("division by zero"));
    assert!(message.contains("boom (instruction 2)"));
}

// ─── Stepping and tracing ───

#[test]
fn e2e_step_executes_one_instruction() {
    let (mut vm, _) = machine(vec![Function::new("_entry", "LOAD_CONST 1 LOAD_CONST 2 ADD HALT")]);
    vm.step().expect("step");
    assert_eq!(vm.stack(), &[int(1)]);
    vm.step().expect("step");
    vm.step().expect("step");
    assert_eq!(vm.stack(), &[int(3)]);
    assert!(!vm.is_finished());
    vm.step().expect("step");
    assert!(vm.is_finished());
    assert_eq!(vm.steps(), 4);
}

#[test]
fn e2e_dump_state_lists_frames() {
    let (vm, _) = run_entry("LOAD_CONST 1 STORE LOAD_CONST 7 HALT");
    let dump = vm.dump_state();
    assert!(dump.starts_with("---\n"));
    assert!(dump.contains("Frame 0 (_entry)"));
    assert!(dump.contains("\tStack: [7]"));
    assert!(dump.contains("\tLocals: [1]"));
}

#[test]
fn e2e_debug_callback_sees_steps_and_calls() {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    let (mut vm, _) = machine(vec![
        Function::new("one", "LOAD_CONST 1 RET"),
        Function::new("_entry", "CALL one 0 HALT"),
    ]);
    vm.debug_callback = Some(Box::new(move |event: &DebugEvent| {
        sink.borrow_mut().push(event.clone());
    }));
    vm.run().expect("program should run");

    let events = events.borrow();
    let steps = events
        .iter()
        .filter(|e| matches!(e, DebugEvent::Step { .. }))
        .count();
    assert_eq!(steps, 4);
    assert!(events
        .iter()
        .any(|e| matches!(e, DebugEvent::CallEnter { function, depth: 2 } if function == "one")));
    assert!(events.iter().any(|e| matches!(
        e,
        DebugEvent::CallExit { function, result: Some(Value::Int(1)) } if function == "one"
    )));
}

// ─── Program loading ───

#[test]
fn e2e_program_from_json() {
    let program = Program::from_json(
        r#"{"functions": [{"label": "_entry", "instructions": "LOAD_CONST \"hi there\" CALL println 1 HALT"}]}"#,
    )
    .expect("json should parse");
    let buffer = OutputBuffer::default();
    let mut vm = Machine::with_builtins(
        &program,
        &ResourceLimits::default(),
        Box::new(Stdlib::capturing(buffer.clone())),
    )
    .expect("program should load");
    vm.run().expect("program should run");
    assert_eq!(buffer.lines(), vec!["hi there".to_string()]);
}

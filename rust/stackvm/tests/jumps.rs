//! Jump-block resolution: taken jumps enter blocks, fallthrough skips them.

use std::cell::RefCell;
use std::rc::Rc;

use stackvm::vm::DebugEvent;
use stackvm::{
    ExitCode, Function, Machine, OutputBuffer, Program, ResourceLimits, Slot, Stdlib, Value,
    VmError,
};

/// Helper: attach a block for each `.label:` in `source`, spanning from the
/// token after the label to the next `EJMP` (or to the label's first
/// instruction when the block has no terminator).
fn with_blocks(label: &str, source: &str) -> Function {
    let mut function = Function::new(label, source);
    let labels: Vec<(String, usize)> = function
        .instructions
        .iter()
        .enumerate()
        .filter(|(_, t)| t.starts_with('.') && t.ends_with(':'))
        .map(|(i, t)| (t.trim_end_matches(':').to_string(), i + 1))
        .collect();
    for (name, start) in labels {
        let end = function.offset_of("EJMP", start).unwrap_or(start);
        function = function.with_block(name, start, end);
    }
    function
}

fn machine(source: &str) -> (Machine, OutputBuffer) {
    let buffer = OutputBuffer::default();
    let program = Program::new(vec![with_blocks("_entry", source)]);
    let vm = Machine::with_builtins(
        &program,
        &ResourceLimits::default(),
        Box::new(Stdlib::capturing(buffer.clone())),
    )
    .expect("program should load");
    (vm, buffer)
}

fn run(source: &str) -> (Machine, OutputBuffer) {
    let (mut vm, buffer) = machine(source);
    vm.run().expect("program should run");
    (vm, buffer)
}

fn run_err(source: &str) -> VmError {
    let (mut vm, _) = machine(source);
    vm.run().expect_err("program should fault")
}

// ─── Entering and skipping ───

#[test]
fn taken_jump_enters_block_without_reskipping() {
    let (vm, out) = run("LOAD_CONST 1 LOAD_CONST 5 LE JMPT .end LOAD_CONST 3 CALL println 1 .end: HALT");
    assert!(vm.is_finished());
    assert!(vm.stack().is_empty());
    assert!(out.stdout().is_empty());
}

#[test]
fn untaken_jump_falls_through_to_first_halt() {
    let (vm, _) = run(
        "LOAD_CONST 1 LOAD_CONST 5 GT JMPT .end LOAD_CONST 3 LOAD_CONST 4 LOAD_CONST 5 HALT .end: HALT EJMP",
    );
    assert_eq!(vm.stack().len(), 3);
    assert_eq!(vm.frames()[0].pc(), 8);
}

#[test]
fn terminated_block_is_entered_on_jump() {
    let (vm, _) = run(
        "LOAD_CONST 1 LOAD_CONST 5 LE JMPT .end LOAD_CONST 3 LOAD_CONST 4 LOAD_CONST 5 HALT .end: HALT EJMP",
    );
    assert!(vm.stack().is_empty());
    assert_eq!(vm.frames()[0].pc(), 9);
}

#[test]
fn short_circuit_jump_keeps_condition() {
    let (vm, _) = run(
        "LOAD_CONST 1 LOAD_CONST 5 GT SJMPF .end LOAD_CONST 3 LOAD_CONST 4 LOAD_CONST 5 HALT .end: HALT EJMP",
    );
    assert_eq!(vm.stack(), &[Slot::Value(Value::Bool(false))]);
}

#[test]
fn fallthrough_skips_block_body() {
    let (_, out) = run(
        "LOAD_CONST false JMPT .then .then: LOAD_CONST 1 CALL println 1 EJMP LOAD_CONST 2 CALL println 1 HALT",
    );
    assert_eq!(out.stdout(), "2\n");
}

#[test]
fn if_else_chain_runs_one_branch() {
    let source = "DUP JMPT .then .then: LOAD_CONST 1 CALL println 1 EJMP NOT JMPT .else .else: LOAD_CONST 2 CALL println 1 EJMP LOAD_CONST 3 CALL println 1 HALT";

    let (_, out) = run(&format!("LOAD_CONST true {}", source));
    assert_eq!(out.lines(), vec!["1", "3"]);

    let (_, out) = run(&format!("LOAD_CONST false {}", source));
    assert_eq!(out.lines(), vec!["2", "3"]);
}

#[test]
fn skipping_is_stable_across_repeated_fallthrough() {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    let (mut vm, out) = machine(
        "LOAD_CONST false JMPT .a .a: LOAD_CONST 1 CALL println 1 EJMP LOAD_CONST false JMPT .b .b: LOAD_CONST 2 CALL println 1 EJMP HALT",
    );
    vm.debug_callback = Some(Box::new(move |event: &DebugEvent| {
        if let DebugEvent::BlockSkipped { label, .. } = event {
            sink.borrow_mut().push(label.clone());
        }
    }));
    vm.run().expect("program should run");
    assert!(out.stdout().is_empty());
    assert_eq!(*events.borrow(), vec![".a".to_string(), ".b".to_string()]);
}

// ─── Exits ───

#[test]
fn exit_when_true_leaves_block_early() {
    let (_, out) = run(
        "LOAD_CONST true JMPT .b .b: LOAD_CONST 1 CALL println 1 LOAD_CONST true EJMPT LOAD_CONST 9 CALL println 1 EJMP LOAD_CONST 3 CALL println 1 HALT",
    );
    assert_eq!(out.lines(), vec!["1", "3"]);
}

#[test]
fn exit_when_false_continues_on_true() {
    let (_, out) = run(
        "LOAD_CONST true JMPT .b .b: LOAD_CONST true EJMPF LOAD_CONST 9 CALL println 1 EJMP LOAD_CONST 3 CALL println 1 HALT",
    );
    assert_eq!(out.lines(), vec!["9", "3"]);
}

#[test]
fn unconditional_jump_skips_intervening_code() {
    let (_, out) = run(
        "JMP .tail LOAD_CONST 1 CALL println 1 HALT .tail: LOAD_CONST 2 CALL println 1 HALT EJMP",
    );
    assert_eq!(out.stdout(), "2\n");
}

// ─── Faults ───

#[test]
fn unknown_jump_label_is_unknown_bytecode() {
    let err = run_err("JMP .next HALT");
    assert_eq!(err.exit_code(), ExitCode::UnknownBytecode);
    assert_eq!(err.root().to_string(), "could not find jump point '.next'");
}

#[test]
fn untaken_jump_to_unknown_label_is_harmless() {
    let (vm, _) = run("LOAD_CONST false JMPT .nowhere HALT");
    assert!(vm.is_finished());
}

#[test]
fn jump_condition_must_be_boolean() {
    let err = run_err("LOAD_CONST 1 JMPT .a .a: HALT EJMP");
    assert_eq!(err.exit_code(), ExitCode::OperationErr);
}

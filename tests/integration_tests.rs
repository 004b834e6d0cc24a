use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::{self, Command, Output};

use ls8::cpu::{FLAG_EQUAL, FLAG_GREATER, FLAG_LESS, SP, STACK_TOP};
use ls8::loader::parse_program;
use ls8::opcodes::*;
use ls8::{HaltReason, Machine, MachineError, MachineSnapshot, SharedOutput};

fn boot(program: &[u8]) -> (Machine, SharedOutput) {
    let output = SharedOutput::default();
    let mut machine = Machine::with_output(Box::new(output.clone()));
    machine.load(program).unwrap();
    (machine, output)
}

fn run_source(source: &str) -> (Machine, SharedOutput, HaltReason) {
    let program = parse_program(source).unwrap();
    let (mut machine, output) = boot(&program);
    let reason = machine.run().unwrap();
    (machine, output, reason)
}

#[test]
fn test_print8_program() {
    let (machine, output, reason) = run_source(include_str!("../programs/print8.ls8"));

    assert_eq!(reason, HaltReason::Halt);
    assert_eq!(output.contents(), "8\n");
    assert_eq!(machine.cpu.cycles, 3);
}

#[test]
fn test_mult_program() {
    let (_, output, reason) = run_source(include_str!("../programs/mult.ls8"));

    assert_eq!(reason, HaltReason::Halt);
    assert_eq!(output.contents(), "72\n");
}

#[test]
fn test_stack_program() {
    let (machine, output, _) = run_source(include_str!("../programs/stack.ls8"));

    assert_eq!(output.contents(), "2\n1\n");
    // every PUSH was matched by a POP
    assert_eq!(machine.cpu.sp(), STACK_TOP);
    // the pushed bytes are still in memory below the stack top
    assert_eq!(machine.ram_read(254).unwrap(), 1);
    assert_eq!(machine.ram_read(253).unwrap(), 2);
}

#[test]
fn test_call_program() {
    let (machine, output, reason) = run_source(include_str!("../programs/call.ls8"));

    assert_eq!(reason, HaltReason::Halt);
    assert_eq!(output.contents(), "42\n");
    assert_eq!(machine.cpu.sp(), STACK_TOP);
    // CALL at address 6 pushed the address of the following PRN
    assert_eq!(machine.ram_read(254).unwrap(), 8);
}

#[test]
fn test_compare_program() {
    let (machine, output, reason) = run_source(include_str!("../programs/compare.ls8"));

    assert_eq!(reason, HaltReason::Halt);
    assert_eq!(output.contents(), "1\n2\n");
    assert_eq!(machine.cpu.get_flags(), FLAG_EQUAL);
    assert_eq!(machine.cpu.get_pc(), 48);
}

#[test]
fn test_bitwise_program() {
    let (_, output, _) = run_source(include_str!("../programs/bitwise.ls8"));

    assert_eq!(output.contents(), "136\n16\n239\n");
}

#[test]
fn test_division_by_zero_program() {
    let (machine, output, reason) = run_source(include_str!("../programs/divzero.ls8"));

    assert_eq!(reason, HaltReason::DivisionByZero);
    assert_eq!(output.contents(), "");
    assert_eq!(machine.cpu.reg(0).unwrap(), 10);
    assert!(machine.cpu.is_halted());
}

#[test]
fn test_push_pop_is_a_no_op() {
    // LDI R0,v; PUSH R0; LDI R0,0; POP R0; HLT
    for value in [0u8, 1, 127, 128, 255] {
        let (mut machine, _) = boot(&[LDI, 0, value, PUSH, 0, LDI, 0, 0, POP, 0, HLT]);
        machine.run().unwrap();

        assert_eq!(machine.cpu.reg(0).unwrap(), value);
        assert_eq!(machine.cpu.reg(SP).unwrap(), STACK_TOP);
    }
}

#[test]
fn test_call_ret_resumes_after_call() {
    // LDI R1,9; CALL R1; HLT; .. ; RET at 9
    let mut program = vec![LDI, 1, 9, CALL, 1, HLT];
    program.resize(9, 0);
    program.push(RET);

    let (mut machine, _) = boot(&program);
    machine.step().unwrap(); // LDI
    machine.step().unwrap(); // CALL
    assert_eq!(machine.cpu.get_pc(), 9);
    assert_eq!(machine.cpu.sp(), STACK_TOP - 1);

    machine.step().unwrap(); // RET
    assert_eq!(machine.cpu.get_pc(), 5);
    assert_eq!(machine.cpu.sp(), STACK_TOP);

    assert_eq!(machine.run().unwrap(), HaltReason::Halt);
}

#[test]
fn test_ldi_every_register_and_value() {
    for reg in 0..7u8 {
        for value in 0..=255u8 {
            let (mut machine, _) = boot(&[LDI, reg, value, HLT]);
            machine.step().unwrap();

            assert_eq!(machine.cpu.reg(reg).unwrap(), value);
            assert_eq!(machine.cpu.get_pc(), 3);
        }
    }
}

#[test]
fn test_unknown_opcode_is_fatal() {
    let (mut machine, output) = boot(&[LDI, 2, 77, PRN, 2, 255]);
    let err = machine.run().unwrap_err();

    assert!(matches!(err, MachineError::UnknownOpcode { opcode: 255, pc: 5 }));
    assert_eq!(output.contents(), "77\n");
    assert_eq!(machine.cpu.get_pc(), 5);
    assert_eq!(machine.cpu.reg(2).unwrap(), 77);
    assert_eq!(machine.cpu.halt_reason(), Some(HaltReason::Fault));

    // a faulted machine stays halted
    assert!(!machine.step().unwrap());
}

#[test]
fn test_comparison_flags_are_exclusive() {
    for (a, b, flag) in [(3u8, 3u8, FLAG_EQUAL), (9, 3, FLAG_GREATER), (3, 9, FLAG_LESS)] {
        let (mut machine, _) = boot(&[LDI, 0, a, LDI, 1, b, CMP, 0, 1, HLT]);
        machine.run().unwrap();

        assert_eq!(machine.cpu.get_flags(), flag);
        // CMP leaves its operands alone
        assert_eq!(machine.cpu.reg(0).unwrap(), a);
        assert_eq!(machine.cpu.reg(1).unwrap(), b);
    }
}

#[test]
fn test_arithmetic_wraps_to_eight_bits() {
    // LDI R0,200; LDI R1,100; ADD R0,R1; PRN R0; MUL R0,R1; PRN R0; HLT
    let (mut machine, output) = boot(&[
        LDI, 0, 200, LDI, 1, 100, ADD, 0, 1, PRN, 0, MUL, 0, 1, PRN, 0, HLT,
    ]);
    machine.run().unwrap();

    // 300 & 0xFF = 44, 4400 & 0xFF = 48
    assert_eq!(output.contents(), "44\n48\n");
}

#[test]
fn test_runaway_program_hits_step_limit() {
    let (mut machine, _) = boot(&[LDI, 0, 0, JMP, 0]);
    let err = machine.run_with(100, |_| {}).unwrap_err();

    assert!(matches!(err, MachineError::StepLimitExceeded(100)));
    assert_eq!(machine.cpu.cycles, 100);
}

#[test]
fn test_trace_lines_follow_execution() {
    let program = parse_program(include_str!("../programs/print8.ls8")).unwrap();
    let (mut machine, _) = boot(&program);

    let mut lines = Vec::new();
    machine.run_with(0, |m| lines.push(m.trace())).unwrap();

    assert_eq!(
        lines,
        vec![
            "TRACE: 00 00 | 82 00 08 | 00 00 00 00 00 00 00 FF",
            "TRACE: 03 00 | 47 00 01 | 08 00 00 00 00 00 00 FF",
            "TRACE: 05 00 | 01 00 00 | 08 00 00 00 00 00 00 FF",
        ]
    );
}

#[test]
fn test_snapshot_rollback() {
    let program = parse_program(include_str!("../programs/stack.ls8")).unwrap();
    let (mut machine, output) = boot(&program);

    for _ in 0..4 {
        machine.step().unwrap();
    }
    let snapshot = MachineSnapshot::capture(&machine);
    machine.run().unwrap();
    assert_eq!(output.contents(), "2\n1\n");

    output.clear();
    snapshot.restore_to(&mut machine).unwrap();
    assert_eq!(machine.cpu.cycles, 4);
    assert_eq!(machine.cpu.sp(), STACK_TOP - 2);

    machine.run().unwrap();
    assert_eq!(output.contents(), "2\n1\n");
}

// The command-line binary

fn ls8(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ls8"))
        .args(args)
        .output()
        .expect("ls8 binary runs")
}

fn demo(name: &str) -> String {
    format!("{}/programs/{}", env!("CARGO_MANIFEST_DIR"), name)
}

fn scratch_program(name: &str, source: &str) -> PathBuf {
    let path = env::temp_dir().join(format!("ls8-{}-{}", process::id(), name));
    fs::write(&path, source).unwrap();
    path
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_cli_runs_print8() {
    let output = ls8(&[&demo("print8.ls8")]);

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "8\n");
}

#[test]
fn test_cli_division_by_zero_exits_cleanly() {
    let output = ls8(&[&demo("divzero.ls8")]);
    let stderr = stderr(&output);

    assert_eq!(output.status.code(), Some(0));
    assert!(output.stdout.is_empty());
    assert!(stderr.contains("Division by zero"), "{}", stderr);
    // the error event from the ALU reaches the default warn-level log
    assert!(stderr.contains("cannot divide by zero"), "{}", stderr);
}

#[test]
fn test_cli_unknown_opcode_fails() {
    let path = scratch_program("unknown.ls8", "11111111\n");
    let output = ls8(&[path.to_str().unwrap()]);
    let stderr = stderr(&output);

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr.contains("unknown instruction 255"), "{}", stderr);
}

#[test]
fn test_cli_load_failures() {
    let path = scratch_program("malformed.ls8", "10000010\n0000002 # not binary\n");
    let output = ls8(&[path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("line 2"), "{}", stderr(&output));

    let path = scratch_program("oversized.ls8", &"00000000\n".repeat(257));
    let output = ls8(&[path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));

    let output = ls8(&["/nonexistent/program.ls8"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_cli_usage_errors() {
    assert_eq!(ls8(&[]).status.code(), Some(1));

    let print8 = demo("print8.ls8");
    let output = ls8(&[&print8, &print8]);
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());

    assert_eq!(ls8(&["--help"]).status.code(), Some(0));
}

#[test]
fn test_cli_trace_and_step_limit() {
    let output = ls8(&["--trace", &demo("print8.ls8")]);
    assert_eq!(output.status.code(), Some(0));
    assert!(stderr(&output).contains("TRACE: 00 00 | 82 00 08 | 00 00 00 00 00 00 00 FF"));

    let output = ls8(&["--max-steps", "2", &demo("print8.ls8")]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("step limit of 2"));
}

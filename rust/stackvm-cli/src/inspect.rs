//! Human-readable listings of decoded programs.

use std::fmt::Write as _;

use stackvm::bytecode::{compile, Instruction};
use stackvm::program::ENTRY_LABEL;
use stackvm::Program;

use crate::colors::{bold, cyan, gray, red};

/// List every function with its decoded instructions and jump blocks.
///
/// Instructions that would fault with `unknown_bytecode` are flagged.
pub fn describe(program: &Program) -> String {
    let mut out = String::new();
    for function in &program.functions {
        let compiled = compile(function);
        let entry = if compiled.label == ENTRY_LABEL {
            gray(" (entry)")
        } else {
            String::new()
        };
        let _ = writeln!(
            out,
            "{}{} {}",
            bold(&compiled.label),
            entry,
            gray(&format!("{} instructions", compiled.code.len()))
        );
        for (pc, instruction) in compiled.code.iter().enumerate() {
            let marker = match instruction {
                Instruction::Unknown(_) | Instruction::Malformed { .. } => red("!"),
                _ => " ".to_string(),
            };
            let block = compiled
                .block_at(pc)
                .map(|b| format!("  {}", cyan(&format!("{}:", b.label))))
                .unwrap_or_default();
            let _ = writeln!(out, "{} {:>5}  {}{}", marker, pc, instruction, block);
        }
        for block in compiled.blocks.iter() {
            let _ = writeln!(
                out,
                "  block {} {}",
                cyan(&block.label),
                gray(&format!("{}..{}", block.start, block.end))
            );
        }
    }
    out
}

/// Labels of functions whose code contains undecodable instructions.
pub fn undecodable(program: &Program) -> Vec<String> {
    program
        .functions
        .iter()
        .map(compile)
        .filter(|f| {
            f.code
                .iter()
                .any(|i| matches!(i, Instruction::Unknown(_) | Instruction::Malformed { .. }))
        })
        .map(|f| f.label)
        .collect()
}

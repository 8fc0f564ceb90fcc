//! Stack machine dispatch loop.

mod arrays;
mod blocks;
mod frame;
mod ops;

pub use blocks::{BlockState, Fetch};
pub use frame::{Frame, OperandStack};

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::rc::Rc;

use thiserror::Error;

use crate::arena::Memory;
use crate::builtins::{BuiltinDispatcher, Stdlib};
use crate::bytecode::{compile, Block, CompiledFunction, Instruction, JumpKind};
use crate::config::ResourceLimits;
use crate::governor::{Limit, Resource};
use crate::program::{Program, ENTRY_LABEL};
use crate::values::{Slot, StoreId, Value};

/// Type alias for debug callback to simplify type signatures
pub type DebugCallback = Option<Box<dyn FnMut(&DebugEvent)>>;

/// Debug events emitted during execution.
#[derive(Debug, Clone)]
pub enum DebugEvent {
    /// About to execute `instruction` at `pc` in `function`.
    Step {
        function: String,
        pc: usize,
        instruction: String,
    },
    CallEnter { function: String, depth: usize },
    CallExit { function: String, result: Option<Value> },
    /// A taken jump reached its block.
    BlockEntered { label: String },
    /// A block start was reached without a jump; execution continues at `resume_at`.
    BlockSkipped { label: String, resume_at: usize },
}

/// Process exit status for a finished or failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitCode {
    Success,
    OperationErr,
    MemoryErr,
    FileErr,
    UnknownBytecode,
    VmErr,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::OperationErr => 1,
            ExitCode::MemoryErr => 2,
            ExitCode::FileErr => 3,
            ExitCode::UnknownBytecode => 254,
            ExitCode::VmErr => 255,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitCode::Success => "success",
            ExitCode::OperationErr => "operation_err",
            ExitCode::MemoryErr => "memory_err",
            ExitCode::FileErr => "file_err",
            ExitCode::UnknownBytecode => "unknown_bytecode",
            ExitCode::VmErr => "vm_err",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub function: String,
    pub pc: usize,
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("no value on the stack for {0}")]
    StackUnderflow(&'static str),
    #[error("type error at runtime: {0}")]
    TypeError(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("arithmetic overflow")]
    ArithmeticOverflow,
    #[error("builtin '{name}' expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: String,
        got: usize,
    },
    #[error("array index {index} out of range {capacity}")]
    IndexOutOfRange { index: i64, capacity: usize },
    #[error("cannot write to index {index} since previous index values are not initialized")]
    UninitializedWrite { index: i64 },
    #[error("attempted to build array of length {length} which exceeds capacity {capacity}")]
    ArrayExceedsCapacity { length: usize, capacity: usize },
    #[error("array size limit {capacity} reached")]
    ArrayFull { capacity: usize },
    #[error("slice [{start}, {end}) out of bounds for array of length {length}")]
    SliceOutOfRange { start: i64, end: i64, length: usize },
    #[error("address {index} out of range for {store} of size {len}")]
    AddressOutOfRange {
        store: StoreId,
        index: usize,
        len: usize,
    },
    #[error("array refers to {0}, which no longer exists")]
    DanglingArray(StoreId),
    #[error("{resource} exceeded hard maximum of {limit}")]
    ResourceExhausted { resource: Resource, limit: usize },
    #[error("array exceeded locals hard maximum of {locals} and globals hard maximum of {globals}")]
    HeapExhausted { locals: usize, globals: usize },
    #[error("builtin i/o failure: {0}")]
    FileError(String),
    #[error("unknown bytecode: '{0}'")]
    UnknownBytecode(String),
    #[error("malformed {mnemonic} instruction: {reason}")]
    Malformed { mnemonic: String, reason: String },
    #[error("could not find jump point '{0}'")]
    UnknownJumpLabel(String),
    #[error("could not find function '{0}'")]
    UnknownFunction(String),
    #[error("could not find entry point function label: '{0}'")]
    MissingEntryPoint(String),
    #[error("{0}")]
    Fault(String),
    #[error("{source}\nStack trace (most recent call last):{stack_trace}")]
    WithStackTrace {
        source: Box<VmError>,
        stack_trace: String,
        frames: Vec<StackFrame>,
    },
}

impl VmError {
    /// Status class reported to the host.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            VmError::StackUnderflow(_)
            | VmError::TypeError(_)
            | VmError::DivisionByZero
            | VmError::ArithmeticOverflow
            | VmError::Arity { .. } => ExitCode::OperationErr,
            VmError::IndexOutOfRange { .. }
            | VmError::UninitializedWrite { .. }
            | VmError::ArrayExceedsCapacity { .. }
            | VmError::ArrayFull { .. }
            | VmError::SliceOutOfRange { .. }
            | VmError::AddressOutOfRange { .. }
            | VmError::DanglingArray(_)
            | VmError::ResourceExhausted { .. }
            | VmError::HeapExhausted { .. } => ExitCode::MemoryErr,
            VmError::FileError(_) => ExitCode::FileErr,
            VmError::UnknownBytecode(_)
            | VmError::Malformed { .. }
            | VmError::UnknownJumpLabel(_)
            | VmError::UnknownFunction(_)
            | VmError::MissingEntryPoint(_) => ExitCode::UnknownBytecode,
            VmError::Fault(_) => ExitCode::VmErr,
            VmError::WithStackTrace { source, .. } => source.exit_code(),
        }
    }

    /// Attach a stack trace. If frames is empty, returns self unchanged.
    pub fn with_stack_trace(self, frames: Vec<StackFrame>) -> Self {
        if frames.is_empty() || matches!(self, VmError::WithStackTrace { .. }) {
            return self;
        }
        let mut trace = String::new();
        for (i, frame) in frames.iter().rev().enumerate() {
            let _ = write!(
                trace,
                "\n  #{}: {} (instruction {})",
                i, frame.function, frame.pc
            );
        }
        VmError::WithStackTrace {
            source: Box::new(self),
            stack_trace: trace,
            frames,
        }
    }

    /// The underlying fault, looking through a stack-trace wrapper.
    pub fn root(&self) -> &VmError {
        match self {
            VmError::WithStackTrace { source, .. } => source.root(),
            other => other,
        }
    }

    /// Stack frames from a `WithStackTrace` error, or empty for other variants.
    pub fn stack_frames(&self) -> &[StackFrame] {
        match self {
            VmError::WithStackTrace { frames, .. } => frames,
            _ => &[],
        }
    }
}

/// The virtual machine: decoded program, call stack, and arenas.
pub struct Machine {
    functions: Vec<CompiledFunction>,
    by_label: HashMap<String, usize>,
    frames: Vec<Frame>,
    memory: Memory,
    frame_limit: Limit,
    stack_limit: Limit,
    builtins: Box<dyn BuiltinDispatcher>,
    finished: bool,
    result: Option<Value>,
    steps: u64,
    /// Receives a [`DebugEvent`] for each step, call and block transition.
    pub debug_callback: DebugCallback,
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("depth", &self.frames.len())
            .field("finished", &self.finished)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

impl Machine {
    /// Build a machine running `program` with the standard builtins.
    pub fn new(program: &Program, limits: &ResourceLimits) -> Result<Self, VmError> {
        Self::with_builtins(program, limits, Box::new(Stdlib::new()))
    }

    pub fn with_builtins(
        program: &Program,
        limits: &ResourceLimits,
        builtins: Box<dyn BuiltinDispatcher>,
    ) -> Result<Self, VmError> {
        let functions: Vec<CompiledFunction> = program.functions.iter().map(compile).collect();
        let by_label = functions
            .iter()
            .enumerate()
            .map(|(i, f)| (f.label.clone(), i))
            .collect::<HashMap<_, _>>();
        let entry = *by_label
            .get(ENTRY_LABEL)
            .ok_or_else(|| VmError::MissingEntryPoint(ENTRY_LABEL.to_string()))?;

        let mut machine = Self {
            functions,
            by_label,
            frames: Vec::new(),
            memory: Memory::new(limits),
            frame_limit: Limit::from_limits(Resource::Frames, limits),
            stack_limit: Limit::from_limits(Resource::OperandStack, limits),
            builtins,
            finished: false,
            result: None,
            steps: 0,
            debug_callback: None,
        };
        machine.push_frame(entry, Vec::new(), 0)?;
        Ok(machine)
    }

    fn emit_debug_event(&mut self, event: DebugEvent) {
        if let Some(ref mut cb) = self.debug_callback {
            cb(&event);
        }
    }

    /// Run until `HALT`, a return from `_entry`, or a fault.
    pub fn run(&mut self) -> Result<(), VmError> {
        while !self.finished {
            if let Err(err) = self.step() {
                let frames = self.capture_stack_trace();
                return Err(err.with_stack_trace(frames));
            }
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Value returned from `_entry`, if it returned one.
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Instructions executed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Operand stack of the innermost frame.
    pub fn stack(&self) -> &[Slot] {
        self.frames.last().map(|f| f.stack()).unwrap_or(&[])
    }

    /// Locals of the frame at `depth` (0 is `_entry`).
    pub fn locals(&self, depth: usize) -> &[Slot] {
        self.memory.locals(depth).map(|s| s.slots()).unwrap_or(&[])
    }

    pub fn globals(&self) -> &[Slot] {
        self.memory.globals().slots()
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn capture_stack_trace(&self) -> Vec<StackFrame> {
        self.frames
            .iter()
            .map(|f| StackFrame {
                function: self.functions[f.function].label.clone(),
                pc: f.pc.saturating_sub(1),
            })
            .collect()
    }

    fn frame_mut(&mut self) -> Result<&mut Frame, VmError> {
        self.frames
            .last_mut()
            .ok_or_else(|| VmError::Fault("no active frame".to_string()))
    }

    fn stack_mut(&mut self) -> Result<&mut OperandStack, VmError> {
        Ok(&mut self.frame_mut()?.stack)
    }

    fn push_frame(&mut self, function: usize, args: Vec<Slot>, return_pc: usize) -> Result<(), VmError> {
        self.frame_limit.admit(self.frames.len() + 1)?;
        self.memory.push_frame(args)?;
        self.frames
            .push(Frame::new(function, return_pc, self.stack_limit));
        Ok(())
    }

    fn finish(&mut self, result: Option<Value>) {
        self.finished = true;
        self.result = result;
    }

    /// Execute one instruction, or perform one block skip.
    pub fn step(&mut self) -> Result<(), VmError> {
        if self.finished {
            return Ok(());
        }
        let (index, pc) = {
            let frame = self.frame_mut()?;
            (frame.function, frame.pc)
        };
        let function = &self.functions[index];
        let code = Rc::clone(&function.code);
        let blocks = Rc::clone(&function.blocks);
        let Some(instruction) = code.get(pc) else {
            return Err(VmError::Fault(format!(
                "reached the end of '{}' without HALT or RET",
                function.label
            )));
        };

        let frame = self.frame_mut()?;
        let pending = frame.blocks.label().map(str::to_string);
        let block = blocks
            .iter()
            .filter(|b| b.start == pc)
            .min_by_key(|b| pending.as_deref() != Some(b.label.as_str()));
        match frame.blocks.on_fetch(block, &code) {
            Fetch::Skip(resume_at) => {
                frame.pc = resume_at;
                if let Some(block) = block {
                    tracing::trace!(label = %block.label, resume_at, "skipping block");
                    self.emit_debug_event(DebugEvent::BlockSkipped {
                        label: block.label.clone(),
                        resume_at,
                    });
                }
                return Ok(());
            }
            Fetch::Execute => {
                frame.pc = pc + 1;
                let entered = matches!(frame.blocks, BlockState::Inside { .. });
                if let Some(block) = block.filter(|_| entered) {
                    self.emit_debug_event(DebugEvent::BlockEntered {
                        label: block.label.clone(),
                    });
                }
            }
        }

        self.steps += 1;
        if self.debug_callback.is_some() {
            let event = DebugEvent::Step {
                function: self.functions[index].label.clone(),
                pc,
                instruction: instruction.to_string(),
            };
            self.emit_debug_event(event);
        }
        self.dispatch(instruction, pc, &code, &blocks)
    }

    fn dispatch(
        &mut self,
        instruction: &Instruction,
        pc: usize,
        code: &[Instruction],
        blocks: &[Block],
    ) -> Result<(), VmError> {
        match instruction {
            Instruction::Halt => {
                tracing::debug!(steps = self.steps, "program halted");
                self.finish(None);
            }
            Instruction::LoadConst(literal) => self.stack_mut()?.push(literal.to_slot())?,
            Instruction::Dup => {
                let stack = self.stack_mut()?;
                let top = stack.peek("DUP")?.clone();
                stack.push(top)?;
            }
            Instruction::Pop => {
                self.stack_mut()?.pop("POP")?;
            }
            Instruction::Concat => self.concat()?,
            Instruction::RepeatStr(times) => self.repeat_string(*times)?,
            Instruction::Arith(op) => self.arith(*op)?,
            Instruction::Eq => self.equality(false)?,
            Instruction::Ne => self.equality(true)?,
            Instruction::Compare(op) => self.compare(*op)?,
            Instruction::Not => self.not()?,
            Instruction::Or => self.logic("OR", |a, b| a || b)?,
            Instruction::And => self.logic("AND", |a, b| a && b)?,
            Instruction::Xor => self.bitwise("XOR", |a, b| a ^ b)?,
            Instruction::BitAnd => self.bitwise("B_AND", |a, b| a & b)?,
            Instruction::Store(address) => {
                let slot = self.stack_mut()?.pop("STORE")?;
                let locals = self.memory.current_mut()?;
                match address {
                    Some(address) => locals.set(*address, slot)?,
                    None => {
                        locals.push(slot)?;
                    }
                }
            }
            Instruction::Load(address) => {
                let slot = self.memory.current_mut()?.get(*address)?.clone();
                self.stack_mut()?.push(slot)?;
            }
            Instruction::GStore(address) => self.global_store(*address)?,
            Instruction::GLoad(address) => {
                let slot = self.memory.globals().get(*address)?.clone();
                self.stack_mut()?.push(slot)?;
            }
            Instruction::Jump { kind, label, block } => {
                let stack = self.stack_mut()?;
                let taken = match kind {
                    JumpKind::Always => true,
                    JumpKind::IfTrue => stack.pop_bool("JMPT")?,
                    JumpKind::IfFalse => !stack.pop_bool("JMPF")?,
                    JumpKind::PeekTrue => stack.peek_bool("SJMPT")?,
                    JumpKind::PeekFalse => !stack.peek_bool("SJMPF")?,
                };
                if taken {
                    let target = block
                        .and_then(|i| blocks.get(i))
                        .ok_or_else(|| VmError::UnknownJumpLabel(label.clone()))?;
                    let frame = self.frame_mut()?;
                    frame.blocks.enter(label, pc + 1);
                    frame.pc = target.start;
                }
            }
            Instruction::EndBlock => {
                let frame = self.frame_mut()?;
                if let Some(resume) = frame.blocks.finish() {
                    frame.pc = resume;
                }
            }
            Instruction::ExitBlock { when } => {
                let op = if *when { "EJMPT" } else { "EJMPF" };
                let frame = self.frame_mut()?;
                let condition = frame.stack.pop_bool(op)?;
                if condition == *when {
                    let end = code[pc + 1..]
                        .iter()
                        .position(|i| matches!(i, Instruction::EndBlock))
                        .map(|p| pc + 1 + p)
                        .ok_or_else(|| {
                            VmError::Fault(format!("no EJMP follows the exit at {}", pc))
                        })?;
                    frame.pc = end + 1;
                    if let Some(resume) = frame.blocks.finish() {
                        frame.pc = resume;
                    }
                }
            }
            Instruction::Select => {
                let stack = self.stack_mut()?;
                if stack.pop_bool("SELECT")? {
                    let chosen = stack.pop("SELECT")?;
                    stack.pop("SELECT")?;
                    stack.push(chosen)?;
                } else {
                    stack.pop("SELECT")?;
                }
            }
            Instruction::Call { name, argc } => self.call(name, *argc)?,
            Instruction::Ret => self.ret()?,
            Instruction::BuildArr { capacity, count } => self.build_array(*capacity, *count)?,
            Instruction::CopyArr => self.copy_array()?,
            Instruction::AGet => self.array_get()?,
            Instruction::AStore => self.array_store()?,
            Instruction::Unknown(token) => return Err(VmError::UnknownBytecode(token.clone())),
            Instruction::Malformed { mnemonic, reason } => {
                return Err(VmError::Malformed {
                    mnemonic: mnemonic.clone(),
                    reason: reason.clone(),
                })
            }
        }
        Ok(())
    }

    fn call(&mut self, name: &str, argc: usize) -> Result<(), VmError> {
        let args = self.stack_mut()?.pop_many(argc, "CALL")?;

        if self.builtins.is_builtin(name) {
            let values = args
                .into_iter()
                .map(|slot| slot.into_value("a builtin argument"))
                .collect::<Result<Vec<_>, _>>()?;
            tracing::trace!(builtin = name, argc, "calling builtin");
            if let Some(result) = self.builtins.call(name, values, &mut self.memory)? {
                self.stack_mut()?.push_value(result)?;
            }
            return Ok(());
        }

        let function = *self
            .by_label
            .get(name)
            .ok_or_else(|| VmError::UnknownFunction(name.to_string()))?;
        let return_pc = self.frame_mut()?.pc;
        self.push_frame(function, args, return_pc)?;
        tracing::debug!(function = name, depth = self.frames.len(), "call");
        self.emit_debug_event(DebugEvent::CallEnter {
            function: name.to_string(),
            depth: self.frames.len(),
        });
        Ok(())
    }

    fn ret(&mut self) -> Result<(), VmError> {
        let slot = self.stack_mut()?.pop("RET")?;
        let callee = self.frames.len() - 1;
        let index = self.frame_mut()?.function;
        let function = self.functions[index].label.clone();

        if callee == 0 {
            let result = slot.as_value().cloned();
            tracing::debug!(function = %function, "returned from entry point");
            self.emit_debug_event(DebugEvent::CallExit {
                function,
                result: result.clone(),
            });
            self.finish(result);
            return Ok(());
        }

        let slot = match slot {
            Slot::Value(Value::Array(array)) if array.store == StoreId::Locals(callee) => {
                Slot::Value(Value::Array(self.relocate(array, callee)?))
            }
            other => other,
        };

        let frame = self.frames.pop().ok_or_else(|| VmError::Fault("no active frame".to_string()))?;
        self.memory.pop_frame();
        let caller = self.frame_mut()?;
        caller.pc = frame.return_pc;
        let result = slot.as_value().cloned();
        if let Slot::Value(value) = slot {
            caller.stack.push_value(value)?;
        }
        tracing::debug!(function = %function, depth = self.frames.len(), "return");
        self.emit_debug_event(DebugEvent::CallExit { function, result });
        Ok(())
    }

    /// Render frames, operand stacks, locals and globals for tracing.
    pub fn dump_state(&self) -> String {
        fn list(slots: &[Slot]) -> String {
            slots
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        }

        let mut out = String::from("---\n");
        let _ = writeln!(
            out,
            "frames: {}, globals: {}",
            self.frames.len(),
            self.memory.globals().len()
        );
        let _ = writeln!(out, "Globals: [{}]", list(self.globals()));
        let _ = writeln!(out, "Call Stack:");
        for (depth, frame) in self.frames.iter().enumerate() {
            let _ = writeln!(
                out,
                "Frame {} ({})",
                depth, self.functions[frame.function].label
            );
            let _ = writeln!(
                out,
                "\tsp: {}, pc: {}, returnAddr: {}",
                frame.stack.len(),
                frame.pc,
                frame.return_pc
            );
            let _ = writeln!(out, "\tStack: [{}]", list(frame.stack()));
            let _ = writeln!(out, "\tLocals: [{}]", list(self.locals(depth)));
        }
        out
    }
}

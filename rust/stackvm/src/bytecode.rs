//! Instruction set and the token-stream decoder.
//!
//! Functions are decoded once, when a machine is built. Mnemonics become a
//! closed [`Instruction`] enumeration, label tokens (`.name:`) disappear, and
//! jump-block token offsets are rebased onto instruction indices. Unknown or
//! malformed instructions decode to placeholders that fault only when
//! executed.

use std::fmt;
use std::iter::Peekable;
use std::rc::Rc;

use crate::program::Function;
use crate::values::{BinaryOp, CompareOp, Slot, Value};

/// Operand of `LOAD_CONST`.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i32),
    Double(f64),
    Bool(bool),
    String(String),
    Null,
    /// Pushes a vacant slot; used to return "no value".
    None,
}

impl Literal {
    pub fn parse(token: &str) -> Option<Literal> {
        match token {
            "NULL" => return Some(Literal::Null),
            "NONE" => return Some(Literal::None),
            "true" => return Some(Literal::Bool(true)),
            "false" => return Some(Literal::Bool(false)),
            _ => {}
        }
        if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
            return Some(Literal::String(unescape(&token[1..token.len() - 1])));
        }
        let digits = token.strip_prefix('-').unwrap_or(token);
        if digits.is_empty() {
            return None;
        }
        if digits.chars().all(|c| c.is_ascii_digit()) {
            return token.parse().ok().map(Literal::Int);
        }
        let dots = digits.chars().filter(|c| *c == '.').count();
        if dots == 1 && digits.chars().all(|c| c.is_ascii_digit() || c == '.') && digits.len() > 1 {
            return token.parse().ok().map(Literal::Double);
        }
        None
    }

    pub fn to_slot(&self) -> Slot {
        match self {
            Literal::Int(n) => Value::Int(*n).into(),
            Literal::Double(d) => Value::Double(*d).into(),
            Literal::Bool(b) => Value::Bool(*b).into(),
            Literal::String(s) => Value::String(s.clone()).into(),
            Literal::Null => Value::Null.into(),
            Literal::None => Slot::Vacant,
        }
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(n) => write!(f, "{}", n),
            Literal::Double(d) => write!(f, "{:?}", d),
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::String(s) => write!(f, "{:?}", s),
            Literal::Null => write!(f, "NULL"),
            Literal::None => write!(f, "NONE"),
        }
    }
}

/// Condition handling for the jump family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    /// `JMP`
    Always,
    /// `JMPT`: pop, jump when true.
    IfTrue,
    /// `JMPF`: pop, jump when false.
    IfFalse,
    /// `SJMPT`: peek, jump when true.
    PeekTrue,
    /// `SJMPF`: peek, jump when false.
    PeekFalse,
}

impl JumpKind {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            JumpKind::Always => "JMP",
            JumpKind::IfTrue => "JMPT",
            JumpKind::IfFalse => "JMPF",
            JumpKind::PeekTrue => "SJMPT",
            JumpKind::PeekFalse => "SJMPF",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Halt,
    LoadConst(Literal),
    Dup,
    Pop,
    Concat,
    RepeatStr(i32),
    Arith(BinaryOp),
    Eq,
    Ne,
    Compare(CompareOp),
    Not,
    Or,
    And,
    Xor,
    BitAnd,
    Store(Option<usize>),
    Load(usize),
    GStore(Option<usize>),
    GLoad(usize),
    Jump {
        kind: JumpKind,
        label: String,
        /// Index into the function's blocks, if the label resolved.
        block: Option<usize>,
    },
    /// `EJMP`
    EndBlock,
    /// `EJMPT` (`when = true`) and `EJMPF` (`when = false`).
    ExitBlock { when: bool },
    Select,
    Call { name: String, argc: usize },
    Ret,
    BuildArr { capacity: Option<usize>, count: usize },
    CopyArr,
    AGet,
    AStore,
    /// Unrecognized mnemonic.
    Unknown(String),
    /// Recognized mnemonic with missing or unusable operands.
    Malformed { mnemonic: String, reason: String },
}

impl Instruction {
    pub fn mnemonic(&self) -> &str {
        match self {
            Instruction::Halt => "HALT",
            Instruction::LoadConst(_) => "LOAD_CONST",
            Instruction::Dup => "DUP",
            Instruction::Pop => "POP",
            Instruction::Concat => "CONCAT",
            Instruction::RepeatStr(_) => "REPEATSTR",
            Instruction::Arith(op) => match op {
                BinaryOp::Add => "ADD",
                BinaryOp::Sub => "SUB",
                BinaryOp::Mul => "MUL",
                BinaryOp::Div => "DIV",
                BinaryOp::Rem => "REM",
                BinaryOp::Pow => "POW",
            },
            Instruction::Eq => "EQ",
            Instruction::Ne => "NE",
            Instruction::Compare(op) => match op {
                CompareOp::Lt => "LT",
                CompareOp::Le => "LE",
                CompareOp::Gt => "GT",
                CompareOp::Ge => "GE",
            },
            Instruction::Not => "NOT",
            Instruction::Or => "OR",
            Instruction::And => "AND",
            Instruction::Xor => "XOR",
            Instruction::BitAnd => "B_AND",
            Instruction::Store(_) => "STORE",
            Instruction::Load(_) => "LOAD",
            Instruction::GStore(_) => "GSTORE",
            Instruction::GLoad(_) => "GLOAD",
            Instruction::Jump { kind, .. } => kind.mnemonic(),
            Instruction::EndBlock => "EJMP",
            Instruction::ExitBlock { when: true } => "EJMPT",
            Instruction::ExitBlock { when: false } => "EJMPF",
            Instruction::Select => "SELECT",
            Instruction::Call { .. } => "CALL",
            Instruction::Ret => "RET",
            Instruction::BuildArr { .. } => "BUILDARR",
            Instruction::CopyArr => "COPYARR",
            Instruction::AGet => "AGET",
            Instruction::AStore => "ASTORE",
            Instruction::Unknown(token) => token,
            Instruction::Malformed { mnemonic, .. } => mnemonic,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())?;
        match self {
            Instruction::LoadConst(lit) => write!(f, " {}", lit),
            Instruction::RepeatStr(n) => write!(f, " {}", n),
            Instruction::Store(Some(addr)) | Instruction::GStore(Some(addr)) => {
                write!(f, " {}", addr)
            }
            Instruction::Load(addr) | Instruction::GLoad(addr) => write!(f, " {}", addr),
            Instruction::Jump { label, .. } => write!(f, " {}", label),
            Instruction::Call { name, argc } => write!(f, " {} {}", name, argc),
            Instruction::BuildArr {
                capacity: Some(cap),
                count,
            } => write!(f, " {} {}", cap, count),
            Instruction::BuildArr {
                capacity: None,
                count,
            } => write!(f, " {}", count),
            Instruction::Malformed { reason, .. } => write!(f, " <{}>", reason),
            _ => Ok(()),
        }
    }
}

/// A jump block rebased onto instruction indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub label: String,
    pub start: usize,
    pub end: usize,
}

/// A function ready for execution.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    pub label: String,
    pub code: Rc<[Instruction]>,
    pub blocks: Rc<[Block]>,
    /// Token offset each instruction was decoded from.
    pub offsets: Vec<usize>,
}

impl CompiledFunction {
    /// Block that starts at instruction `pc`, if any.
    pub fn block_at(&self, pc: usize) -> Option<&Block> {
        self.blocks.iter().find(|b| b.start == pc)
    }
}

fn is_label(token: &str) -> bool {
    token.len() > 2 && token.starts_with('.') && token.ends_with(':')
}

fn block_label(label: &str) -> &str {
    label.trim_end_matches(':')
}

struct Decoder<'a, I: Iterator<Item = (usize, &'a String)>> {
    tokens: Peekable<I>,
    mnemonic: &'a str,
}

impl<'a, I: Iterator<Item = (usize, &'a String)>> Decoder<'a, I> {
    fn operand(&mut self) -> Result<&'a str, String> {
        self.tokens
            .next()
            .map(|(_, t)| t.as_str())
            .ok_or_else(|| format!("{} expects an operand", self.mnemonic))
    }

    fn integer(&mut self) -> Result<i64, String> {
        let token = self.operand()?;
        token
            .parse()
            .map_err(|_| format!("expected an integer operand, found '{}'", token))
    }

    fn index(&mut self) -> Result<usize, String> {
        let n = self.integer()?;
        usize::try_from(n).map_err(|_| format!("operand {} must not be negative", n))
    }

    fn optional_index(&mut self) -> Result<Option<usize>, String> {
        match self.tokens.peek() {
            Some((_, t)) if t.parse::<i64>().is_ok() => self.index().map(Some),
            _ => Ok(None),
        }
    }
}

/// Decode a function's token stream and rebase its jump blocks.
pub fn compile(function: &Function) -> CompiledFunction {
    let source = function.instructions.iter().enumerate().filter(|(_, t)| !is_label(t));
    let mut decoder = Decoder {
        tokens: source.peekable(),
        mnemonic: "",
    };
    let labels: Vec<&str> = function
        .jump_blocks
        .iter()
        .map(|b| block_label(&b.label))
        .collect();

    let mut code = Vec::new();
    let mut offsets = Vec::new();
    while let Some((offset, token)) = decoder.tokens.next() {
        decoder.mnemonic = token.as_str();
        let decoded = decode_one(&mut decoder, &labels);
        offsets.push(offset);
        code.push(decoded.unwrap_or_else(|reason| Instruction::Malformed {
            mnemonic: token.clone(),
            reason,
        }));
    }

    let index_at = |token_offset: usize| offsets.partition_point(|&o| o < token_offset);
    let blocks: Vec<Block> = function
        .jump_blocks
        .iter()
        .map(|b| Block {
            label: block_label(&b.label).to_string(),
            start: index_at(b.start),
            end: index_at(b.end),
        })
        .collect();

    CompiledFunction {
        label: function.label.clone(),
        code: code.into(),
        blocks: blocks.into(),
        offsets,
    }
}

fn decode_one<'a, I>(d: &mut Decoder<'a, I>, labels: &[&str]) -> Result<Instruction, String>
where
    I: Iterator<Item = (usize, &'a String)>,
{
    let jump = |d: &mut Decoder<'a, I>, kind: JumpKind| -> Result<Instruction, String> {
        let label = block_label(d.operand()?).to_string();
        let block = labels.iter().position(|l| *l == label);
        Ok(Instruction::Jump { kind, label, block })
    };

    Ok(match d.mnemonic {
        "HALT" => Instruction::Halt,
        "LOAD_CONST" => {
            let token = d.operand()?;
            let literal =
                Literal::parse(token).ok_or_else(|| format!("invalid literal '{}'", token))?;
            Instruction::LoadConst(literal)
        }
        "DUP" => Instruction::Dup,
        "POP" => Instruction::Pop,
        "CONCAT" => Instruction::Concat,
        "REPEATSTR" => {
            let n = d.integer()?;
            Instruction::RepeatStr(i32::try_from(n).map_err(|_| format!("count {} out of range", n))?)
        }
        "ADD" => Instruction::Arith(BinaryOp::Add),
        "SUB" => Instruction::Arith(BinaryOp::Sub),
        "MUL" => Instruction::Arith(BinaryOp::Mul),
        "DIV" => Instruction::Arith(BinaryOp::Div),
        "REM" => Instruction::Arith(BinaryOp::Rem),
        "POW" => Instruction::Arith(BinaryOp::Pow),
        "EQ" => Instruction::Eq,
        "NE" => Instruction::Ne,
        "LT" => Instruction::Compare(CompareOp::Lt),
        "LE" => Instruction::Compare(CompareOp::Le),
        "GT" => Instruction::Compare(CompareOp::Gt),
        "GE" => Instruction::Compare(CompareOp::Ge),
        "NOT" => Instruction::Not,
        "OR" => Instruction::Or,
        "AND" => Instruction::And,
        "XOR" => Instruction::Xor,
        "B_AND" => Instruction::BitAnd,
        "STORE" => Instruction::Store(d.optional_index()?),
        "LOAD" => Instruction::Load(d.index()?),
        "GSTORE" => Instruction::GStore(d.optional_index()?),
        "GLOAD" => Instruction::GLoad(d.index()?),
        "JMP" => jump(d, JumpKind::Always)?,
        "JMPT" => jump(d, JumpKind::IfTrue)?,
        "JMPF" => jump(d, JumpKind::IfFalse)?,
        "SJMPT" => jump(d, JumpKind::PeekTrue)?,
        "SJMPF" => jump(d, JumpKind::PeekFalse)?,
        "EJMP" => Instruction::EndBlock,
        "EJMPT" => Instruction::ExitBlock { when: true },
        "EJMPF" => Instruction::ExitBlock { when: false },
        "SELECT" => Instruction::Select,
        "CALL" => {
            let name = d.operand()?.to_string();
            let argc = d.index()?;
            Instruction::Call { name, argc }
        }
        "RET" => Instruction::Ret,
        "BUILDARR" => {
            let first = d.index()?;
            match d.optional_index()? {
                Some(count) => Instruction::BuildArr {
                    capacity: Some(first),
                    count,
                },
                None => Instruction::BuildArr {
                    capacity: None,
                    count: first,
                },
            }
        }
        "COPYARR" => Instruction::CopyArr,
        "AGET" => Instruction::AGet,
        "ASTORE" => Instruction::AStore,
        other => Instruction::Unknown(other.to_string()),
    })
}

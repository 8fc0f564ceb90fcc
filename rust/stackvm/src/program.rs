//! Loader-facing program structure.
//!
//! A program is an ordered list of functions, each a flat token stream plus
//! the jump blocks the assembler resolved for it. Block offsets are token
//! offsets into that stream.

use serde::{Deserialize, Deserializer, Serialize};

/// Label of the mandatory entry-point function.
pub const ENTRY_LABEL: &str = "_entry";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub functions: Vec<Function>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub label: String,
    #[serde(deserialize_with = "tokens_or_text")]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub jump_blocks: Vec<JumpBlock>,
}

/// A labeled instruction range; `end` is the offset of its `EJMP`.
///
/// Offsets index the function's token list with `.label:` tokens and operands
/// counted, and `start` is the token after the block's own label. A producer
/// that drops label tokens before numbering must add them back first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpBlock {
    pub label: String,
    pub start: usize,
    pub end: usize,
}

impl Program {
    pub fn new(functions: Vec<Function>) -> Self {
        Self { functions }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn function(&self, label: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.label == label)
    }
}

impl Function {
    /// Build a function from assembly text.
    pub fn new(label: impl Into<String>, text: &str) -> Self {
        Self {
            label: label.into(),
            instructions: tokenize(text),
            jump_blocks: Vec::new(),
        }
    }

    pub fn with_block(mut self, label: impl Into<String>, start: usize, end: usize) -> Self {
        self.jump_blocks.push(JumpBlock {
            label: label.into(),
            start,
            end,
        });
        self
    }

    /// Token offset of the first occurrence of `token` at or after `from`.
    pub fn offset_of(&self, token: &str, from: usize) -> Option<usize> {
        self.instructions
            .iter()
            .skip(from)
            .position(|t| t == token)
            .map(|p| p + from)
    }
}

/// Split assembly text on whitespace, keeping double-quoted literals whole.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_quotes {
            current.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_quotes = false;
            }
            continue;
        }
        if ch.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            continue;
        }
        if ch == '"' {
            in_quotes = true;
        }
        current.push(ch);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn tokens_or_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Tokens(Vec<String>),
        Text(String),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::Tokens(tokens) => tokens,
        Repr::Text(text) => tokenize(&text),
    })
}

//! Resource limits: soft/hard ceilings for frames, operand stacks, locals
//! and globals, plus the growth and heap-backup switches.
//!
//! Sizes are stored in bytes. Each slot accounts for [`SLOT_BYTES`] bytes,
//! so a 1 KiB operand stack holds 32 values.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Bytes charged per arena or stack slot.
pub const SLOT_BYTES: u64 = 32;

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid character '{ch}' found at index {index} in size '{value}'")]
    InvalidSize {
        value: String,
        ch: char,
        index: usize,
    },
    #[error("size '{0}' is empty or too large")]
    SizeOverflow(String),
    #[error("{resource}: soft maximum {soft} exceeds hard maximum {hard}")]
    SoftExceedsHard {
        resource: &'static str,
        soft: u64,
        hard: u64,
    },
    #[error("{key} must be between {min} and {max}, got {value}")]
    OutOfRange {
        key: String,
        value: u64,
        min: u64,
        max: u64,
    },
}

/// Parse a size such as `4096`, `"64K"`, `"512M"` or `"1G"`.
pub fn parse_size(text: &str) -> Result<u64, ConfigError> {
    let trimmed = text.trim();
    let (digits, multiplier) = match trimmed.char_indices().last() {
        Some((i, 'K' | 'k')) => (&trimmed[..i], 1u64 << 10),
        Some((i, 'M' | 'm')) => (&trimmed[..i], 1u64 << 20),
        Some((i, 'G' | 'g')) => (&trimmed[..i], 1u64 << 30),
        _ => (trimmed, 1),
    };
    if let Some((index, ch)) = digits.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        return Err(ConfigError::InvalidSize {
            value: text.to_string(),
            ch,
            index,
        });
    }
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| ConfigError::SizeOverflow(text.to_string()))
}

mod byte_size {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Bytes(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Bytes(n) => Ok(n),
            Repr::Text(s) => super::parse_size(&s).map_err(serde::de::Error::custom),
        }
    }
}

/// A soft and a hard maximum for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ceiling {
    #[serde(with = "byte_size")]
    pub soft: u64,
    #[serde(with = "byte_size")]
    pub hard: u64,
}

impl Ceiling {
    pub const fn new(soft: u64, hard: u64) -> Self {
        Self { soft, hard }
    }

    /// Byte ceiling sized for the given number of slots.
    pub const fn slots(soft: u64, hard: u64) -> Self {
        Self::new(soft * SLOT_BYTES, hard * SLOT_BYTES)
    }

    /// Convert a byte ceiling to slot counts.
    pub fn in_slots(&self) -> Ceiling {
        Ceiling::new(self.soft / SLOT_BYTES, self.hard / SLOT_BYTES)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Grow from the soft to the hard ceiling on demand.
    pub dynamic_expansion: bool,
    /// Place arrays in globals when the frame's locals are exhausted.
    pub heap_storage_backup: bool,
    /// Number of frames on the call stack.
    pub frames: Ceiling,
    /// Operand stack bytes per frame.
    pub stack: Ceiling,
    /// Locals arena bytes per frame.
    pub locals: Ceiling,
    /// Globals arena bytes.
    pub globals: Ceiling,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            dynamic_expansion: true,
            heap_storage_backup: true,
            frames: Ceiling::new(512, 1024),
            stack: Ceiling::new(1 << 10, 1 << 13),
            locals: Ceiling::new(1 << 16, 1 << 17),
            globals: Ceiling::new(1 << 20, 1 << 29),
        }
    }
}

impl ResourceLimits {
    /// Check every ceiling, returning all problems found.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let checks: [(&'static str, Ceiling, u64, u64); 4] = [
            ("frames", self.frames, 1, 1 << 14),
            ("stack_size", self.stack, SLOT_BYTES, 1 << 20),
            ("locals", self.locals, SLOT_BYTES, 1 << 20),
            ("globals", self.globals, SLOT_BYTES, 1 << 32),
        ];
        for (resource, ceiling, min, max) in checks {
            for (suffix, value) in [("soft_max", ceiling.soft), ("hard_max", ceiling.hard)] {
                if value < min || value > max {
                    errors.push(ConfigError::OutOfRange {
                        key: format!("{}_{}", resource, suffix),
                        value,
                        min,
                        max,
                    });
                }
            }
            if ceiling.soft > ceiling.hard {
                errors.push(ConfigError::SoftExceedsHard {
                    resource,
                    soft: ceiling.soft,
                    hard: ceiling.hard,
                });
            }
        }
        errors
    }

    /// Validate, failing on the first problem.
    pub fn validated(self) -> Result<Self, ConfigError> {
        match self.validate().into_iter().next() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    /// Worst-case footprint in bytes: every frame full plus full globals.
    pub fn estimated_usage(&self, hard: bool) -> u64 {
        let pick = |c: Ceiling| if hard { c.hard } else { c.soft };
        pick(self.frames)
            .saturating_mul(pick(self.stack).saturating_add(pick(self.locals)))
            .saturating_add(pick(self.globals))
    }
}

fn switch(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

impl fmt::Display for ResourceLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DynamicResourceExpansion: {}", switch(self.dynamic_expansion))?;
        writeln!(f, "HeapStorageBackup: {}", switch(self.heap_storage_backup))?;
        writeln!(f, "frames_soft_max: {} frames", self.frames.soft)?;
        writeln!(f, "frames_hard_max: {} frames", self.frames.hard)?;
        for (name, ceiling) in [
            ("stack_size", self.stack),
            ("locals", self.locals),
            ("globals", self.globals),
        ] {
            writeln!(
                f,
                "{}_soft_max: {} B ({} values)",
                name,
                ceiling.soft,
                ceiling.soft / SLOT_BYTES
            )?;
            writeln!(
                f,
                "{}_hard_max: {} B ({} values)",
                name,
                ceiling.hard,
                ceiling.hard / SLOT_BYTES
            )?;
        }
        let hard = self.estimated_usage(true) as f64 / MIB;
        if self.dynamic_expansion {
            let soft = self.estimated_usage(false) as f64 / MIB;
            writeln!(
                f,
                "Estimated VM memory usage: {:.2} MB (soft limits) - {:.2} MB (hard limits)",
                soft, hard
            )
        } else {
            writeln!(f, "Estimated VM memory usage: {:.2} MB", hard)
        }
    }
}

//! Resource governor: enforces soft/hard ceilings with optional growth.

use std::fmt;

use crate::config::{Ceiling, ResourceLimits};
use crate::vm::VmError;

/// The four governed resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Frames,
    OperandStack,
    Locals,
    Globals,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Frames => "number of frames",
            Resource::OperandStack => "operand stack",
            Resource::Locals => "locals",
            Resource::Globals => "globals",
        };
        f.write_str(name)
    }
}

/// The effective ceiling for one resource instance, in slots (or frames).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    resource: Resource,
    current: usize,
    hard: usize,
    growable: bool,
}

impl Limit {
    /// With growth enabled the effective ceiling starts at `soft`;
    /// otherwise `hard` applies from the outset.
    pub fn new(resource: Resource, ceiling: Ceiling, growable: bool) -> Self {
        let hard = ceiling.hard as usize;
        let current = if growable {
            (ceiling.soft as usize).min(hard)
        } else {
            hard
        };
        Self {
            resource,
            current,
            hard,
            growable,
        }
    }

    /// Build the limit for `resource` from the configured ceilings.
    pub fn from_limits(resource: Resource, limits: &ResourceLimits) -> Self {
        let ceiling = match resource {
            Resource::Frames => limits.frames,
            Resource::OperandStack => limits.stack.in_slots(),
            Resource::Locals => limits.locals.in_slots(),
            Resource::Globals => limits.globals.in_slots(),
        };
        Self::new(resource, ceiling, limits.dynamic_expansion)
    }

    pub fn resource(&self) -> Resource {
        self.resource
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn hard(&self) -> usize {
        self.hard
    }

    /// Whether `needed` units fit under the hard ceiling, without growing.
    pub fn fits(&self, needed: usize) -> bool {
        needed <= self.current || (self.growable && needed <= self.hard)
    }

    /// Admit a demand of `needed` units, growing to the hard ceiling if it
    /// is allowed and required.
    pub fn admit(&mut self, needed: usize) -> Result<(), VmError> {
        if needed <= self.current {
            return Ok(());
        }
        if self.growable && needed <= self.hard {
            tracing::info!(
                resource = %self.resource,
                from = self.current,
                to = self.hard,
                "expanding resource to hard maximum"
            );
            self.current = self.hard;
            return Ok(());
        }
        Err(VmError::ResourceExhausted {
            resource: self.resource,
            limit: self.hard,
        })
    }
}

//! Jump-block resolution.
//!
//! Blocks are entered only through a taken jump. Reaching a block start any
//! other way skips the block. Each frame holds one pending resume point, so
//! a jump taken inside a block replaces the outer block's resume point.

use crate::bytecode::{Block, Instruction};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BlockState {
    #[default]
    Outside,
    /// A jump to `label` was taken; its start has not been reached yet.
    Entering { label: String, resume: usize },
    /// Executing inside `label`; `EJMP` continues at `resume`.
    Inside { label: String, resume: usize },
}

/// What to do at a fetch position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    Execute,
    /// Continue at this instruction index instead.
    Skip(usize),
}

impl BlockState {
    /// Decide whether the instruction at a block start runs or the block is skipped.
    pub fn on_fetch(&mut self, block: Option<&Block>, code: &[Instruction]) -> Fetch {
        let Some(block) = block else {
            return Fetch::Execute;
        };
        match std::mem::take(self) {
            BlockState::Entering { label, resume } if label == block.label => {
                *self = BlockState::Inside { label, resume };
                Fetch::Execute
            }
            other => {
                *self = other;
                // Step over the skipped block's own terminator.
                let past = match code.get(block.end) {
                    Some(Instruction::EndBlock) => block.end + 1,
                    _ => block.end,
                };
                // An empty body leaves nothing to skip.
                if past <= block.start {
                    Fetch::Execute
                } else {
                    Fetch::Skip(past)
                }
            }
        }
    }

    /// Record a taken jump to `label`, resuming at `resume` once the block ends.
    pub fn enter(&mut self, label: &str, resume: usize) {
        let resume = match self {
            BlockState::Entering { label: pending, resume: kept } if pending == label => *kept,
            _ => resume,
        };
        *self = BlockState::Entering {
            label: label.to_string(),
            resume,
        };
    }

    /// Leave the current block, returning the pending resume point.
    pub fn finish(&mut self) -> Option<usize> {
        match std::mem::take(self) {
            BlockState::Entering { resume, .. } | BlockState::Inside { resume, .. } => Some(resume),
            BlockState::Outside => None,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            BlockState::Entering { label, .. } | BlockState::Inside { label, .. } => Some(label),
            BlockState::Outside => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(label: &str, start: usize, end: usize) -> Block {
        Block {
            label: label.into(),
            start,
            end,
        }
    }

    #[test]
    fn outside_reaching_a_block_skips_past_its_terminator() {
        let code = [Instruction::Halt, Instruction::Dup, Instruction::EndBlock];
        let mut state = BlockState::Outside;
        assert_eq!(state.on_fetch(Some(&block(".a", 1, 2)), &code), Fetch::Skip(3));
        assert_eq!(state, BlockState::Outside);
        assert_eq!(state.on_fetch(None, &code), Fetch::Execute);
    }

    #[test]
    fn taken_jump_enters_then_finishes() {
        let code = [Instruction::Dup, Instruction::EndBlock];
        let mut state = BlockState::Outside;
        state.enter(".a", 7);
        assert_eq!(state.on_fetch(Some(&block(".a", 0, 1)), &code), Fetch::Execute);
        assert_eq!(
            state,
            BlockState::Inside {
                label: ".a".into(),
                resume: 7
            }
        );
        assert_eq!(state.finish(), Some(7));
        assert_eq!(state.finish(), None);
    }

    #[test]
    fn entering_a_different_block_skips_it() {
        let code = [Instruction::Dup, Instruction::EndBlock];
        let mut state = BlockState::Outside;
        state.enter(".b", 3);
        assert_eq!(state.on_fetch(Some(&block(".a", 0, 1)), &code), Fetch::Skip(2));
        assert_eq!(state.label(), Some(".b"));
    }

    #[test]
    fn empty_block_without_terminator_executes_in_place() {
        let code = [Instruction::Halt];
        let mut state = BlockState::Outside;
        assert_eq!(state.on_fetch(Some(&block(".end", 0, 0)), &code), Fetch::Execute);
        assert_eq!(state, BlockState::Outside);
    }

    #[test]
    fn nested_jump_replaces_outer_resume() {
        let mut state = BlockState::Inside {
            label: ".outer".into(),
            resume: 4,
        };
        state.enter(".inner", 9);
        assert_eq!(state.finish(), Some(9));
    }
}

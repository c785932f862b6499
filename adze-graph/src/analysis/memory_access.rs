//! Forward redundant memory-access analysis.
//!
//! Records, for each program point, the set of `[base + disp]` locations
//! known to have been accessed on every path reaching that point. Callers
//! use the result to skip instrumentation for accesses that are provably
//! redundant. Only simple dereferences through a 32-bit base register with
//! no symbolic reference are tracked; everything else is treated as
//! unknown memory.

use crate::analysis::liveness;
use crate::block::BasicBlock;
use crate::decoded::{Opcode, OperandKind};
use crate::instruction::Instruction;
use crate::subgraph::{BasicBlockId, Subgraph};
use adze_asm::RegisterId;

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

const GPR32: [RegisterId; 8] = [
    RegisterId::Eax,
    RegisterId::Ecx,
    RegisterId::Edx,
    RegisterId::Ebx,
    RegisterId::Esp,
    RegisterId::Ebp,
    RegisterId::Esi,
    RegisterId::Edi,
];

fn gpr_index(reg: RegisterId) -> Option<usize> {
    let ordinal = reg as usize;
    ordinal.checked_sub(RegisterId::Eax as usize)
}

/// The set of displacements known to have been accessed, per 32-bit base
/// register.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    accesses: [BTreeSet<i32>; 8],
}

impl State {
    /// Creates a state with no known accesses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets every known access.
    pub fn clear(&mut self) {
        for set in &mut self.accesses {
            set.clear();
        }
    }

    /// True iff `[base + disp]` is known to have been accessed.
    pub fn is_redundant(&self, base: RegisterId, disp: i32) -> bool {
        gpr_index(base)
            .map(|index| self.accesses[index].contains(&disp))
            .unwrap_or(false)
    }

    /// Records the simple memory dereferences performed by `instr`.
    ///
    /// `LEA` computes an address without touching memory and contributes
    /// nothing; operands carrying a symbolic reference are opaque.
    pub(crate) fn execute(&mut self, instr: &Instruction) {
        let repr = instr.decoded();

        if repr.prefixes.has_repeat() || repr.opcode == Opcode::Lea {
            return;
        }

        for (position, op) in repr.ops.iter().enumerate() {
            let OperandKind::IndirectBase(base) = op.kind else {
                continue;
            };
            let Some(index) = gpr_index(base) else {
                continue;
            };
            if instr.find_operand_reference(position).is_some() {
                continue;
            }
            self.accesses[index].insert(repr.disp as i32);
        }
    }

    /// True iff `instr` performs at least one memory access not present in
    /// this state.
    pub fn has_non_redundant_access(&self, instr: &Instruction) -> bool {
        let repr = instr.decoded();

        if repr.opcode == Opcode::Lea {
            return false;
        }
        if repr.prefixes.has_repeat() {
            return true;
        }

        for (position, op) in repr.ops.iter().enumerate() {
            match op.kind {
                OperandKind::AbsoluteDisplacement | OperandKind::IndirectScaled { .. } => {
                    return true;
                }
                OperandKind::IndirectBase(base) => {
                    let Some(index) = gpr_index(base) else {
                        return true;
                    };
                    if instr.find_operand_reference(position).is_some() {
                        return true;
                    }
                    if !self.accesses[index].contains(&(repr.disp as i32)) {
                        return true;
                    }
                }
                _ => {}
            }
        }

        false
    }
}

/// Applies one instruction forward to `state`.
///
/// Repeat-prefixed string instructions, calls, and control-flow
/// instructions wipe the state; writing a 32-bit register invalidates the
/// accesses based on it.
pub fn propagate_forward(instr: &Instruction, state: &mut State) {
    if instr.decoded().prefixes.has_repeat() {
        state.clear();
        return;
    }

    state.execute(instr);

    if instr.is_call() || instr.is_control_flow() {
        state.clear();
        return;
    }

    match liveness::defs_of(instr) {
        None => state.clear(),
        Some(defs) => {
            for (index, reg) in GPR32.iter().enumerate() {
                if defs.is_live(*reg) {
                    state.accesses[index].clear();
                }
            }
        }
    }
}

/// The forward fixpoint recording the accesses known at the entry of every
/// reachable code block.
#[derive(Debug, Default)]
pub struct MemoryAccessAnalysis {
    states: BTreeMap<BasicBlockId, State>,
}

impl MemoryAccessAnalysis {
    /// Creates an analysis with no recorded state.
    pub fn new() -> Self {
        Self::default()
    }

    /// The state at the entry of `block`. Unknown blocks yield the safe
    /// empty state.
    pub fn state_at_entry(&self, block: BasicBlockId) -> State {
        self.states.get(&block).cloned().unwrap_or_default()
    }

    /// Meets `state` into the recorded entry state of `block`: the first
    /// meet copies, later meets intersect per register. True iff the
    /// recorded state changed.
    fn intersect(&mut self, block: BasicBlockId, state: &State) -> bool {
        match self.states.entry(block) {
            Entry::Vacant(slot) => {
                slot.insert(state.clone());
                true
            }
            Entry::Occupied(mut slot) => {
                let mut changed = false;
                for (to, from) in slot.get_mut().accesses.iter_mut().zip(&state.accesses) {
                    let before = to.len();
                    to.retain(|disp| from.contains(disp));
                    changed |= to.len() != before;
                }
                changed
            }
        }
    }

    /// Runs the worklist fixpoint over `subgraph`, seeded with the entry
    /// block of every layout description. A non-code block on a followed
    /// path invalidates the whole analysis, leaving every state unknown.
    pub fn analyze(&mut self, subgraph: &Subgraph) {
        self.states.clear();

        let mut working: VecDeque<BasicBlockId> = VecDeque::new();
        let mut marked: BTreeSet<BasicBlockId> = BTreeSet::new();

        for description in subgraph.block_descriptions() {
            let Some(&head) = description.basic_block_order.first() else {
                continue;
            };
            if marked.insert(head) {
                working.push_back(head);
                self.intersect(head, &State::new());
            }
        }

        while let Some(block) = working.pop_front() {
            marked.remove(&block);

            let Some(code) = subgraph.block(block).and_then(BasicBlock::as_code) else {
                tracing::debug!(%block, "non-code block on a followed path; giving up");
                self.states.clear();
                return;
            };

            let mut state = self.state_at_entry(block);
            for instr in code.instructions() {
                propagate_forward(instr, &mut state);
            }

            for successor in code.successors() {
                let Some(target) = successor.reference().and_then(|r| r.basic_block()) else {
                    self.states.clear();
                    return;
                };
                if self.intersect(target, &state) && marked.insert(target) {
                    working.push_back(target);
                }
            }
        }
    }
}

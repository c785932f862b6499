//! Peephole simplification and liveness-driven dead code elimination.

use crate::analysis::liveness::{self, LivenessAnalysis};
use crate::block::BasicBlock;
use crate::decoded::{Opcode, OperandKind};
use crate::instruction::Instruction;
use crate::subgraph::{BasicBlockId, Subgraph};
use adze_asm::{RegisterId, RegisterSize};

use strum::IntoEnumIterator;

/// Iterates a small set of local rewrites, interleaved with a
/// liveness-driven dead code pass, until neither produces a change.
#[derive(Debug, Default)]
pub struct PeepholeTransform;

fn matches_reg(instr: &Instruction, opcode: Opcode, reg: RegisterId) -> bool {
    instr.opcode() == opcode && instr.decoded().ops[0].kind == OperandKind::Register(reg)
}

fn matches_reg_reg(instr: &Instruction, opcode: Opcode, reg1: RegisterId, reg2: RegisterId) -> bool {
    instr.opcode() == opcode
        && instr.decoded().ops[0].kind == OperandKind::Register(reg1)
        && instr.decoded().ops[1].kind == OperandKind::Register(reg2)
}

/// `mov r, r` with identical operands.
fn is_identity_mov(instr: &Instruction) -> bool {
    if instr.opcode() != Opcode::Mov {
        return false;
    }
    matches!(
        (instr.decoded().ops[0].kind, instr.decoded().ops[1].kind),
        (OperandKind::Register(a), OperandKind::Register(b)) if a == b
    )
}

/// The window `push ebp; mov ebp, esp; pop ebp` starting at `index`.
fn is_empty_prologue_epilogue(instructions: &[Instruction], index: usize) -> bool {
    let Some(window) = instructions.get(index..index + 3) else {
        return false;
    };
    matches_reg(&window[0], Opcode::Push, RegisterId::Ebp)
        && matches_reg_reg(&window[1], Opcode::Mov, RegisterId::Ebp, RegisterId::Esp)
        && matches_reg(&window[2], Opcode::Pop, RegisterId::Ebp)
}

/// Opcodes DCE is allowed to delete; everything else is assumed to carry a
/// side effect.
fn is_dce_candidate(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Add
            | Opcode::Cmp
            | Opcode::Sub
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Inc
            | Opcode::Dec
            | Opcode::Sar
            | Opcode::Shr
            | Opcode::Shl
            | Opcode::Lea
            | Opcode::Mov
    )
}

impl PeepholeTransform {
    /// Applies the pattern rewrites across the subgraph; true iff any
    /// instruction was rewritten.
    pub fn simplify(subgraph: &mut Subgraph) -> bool {
        let mut changed = false;

        for block in subgraph.block_ids() {
            if subgraph.block(block).and_then(BasicBlock::as_code).is_none() {
                continue;
            }

            let mut index = 0;
            loop {
                let code = subgraph
                    .block(block)
                    .and_then(BasicBlock::as_code)
                    .expect("the block set does not change");
                let instructions = code.instructions();
                if index >= instructions.len() {
                    break;
                }

                if is_empty_prologue_epilogue(instructions, index) {
                    for _ in 0..3 {
                        subgraph
                            .remove_instruction(block, index)
                            .expect("window bounds were checked");
                    }
                    changed = true;
                    continue;
                }

                if is_identity_mov(&instructions[index]) {
                    subgraph
                        .remove_instruction(block, index)
                        .expect("index bounds were checked");
                    changed = true;
                    continue;
                }

                index += 1;
            }
        }

        changed
    }

    /// Deletes instructions whose defined registers and flags are all dead
    /// at their program point; true iff anything was deleted.
    pub fn remove_dead_code(subgraph: &mut Subgraph) -> bool {
        let mut changed = false;

        let mut liveness_analysis = LivenessAnalysis::new();
        liveness_analysis.analyze(subgraph);

        for block in subgraph.block_ids() {
            let Some(code) = subgraph.block(block).and_then(BasicBlock::as_code) else {
                continue;
            };

            let mut state = liveness_analysis.state_at_exit(subgraph, block);
            let mut index = code.instructions().len();

            while index > 0 {
                index -= 1;

                let code = subgraph
                    .block(block)
                    .and_then(BasicBlock::as_code)
                    .expect("the block set does not change");
                let instr = &code.instructions()[index];

                if Self::has_side_effects(instr, &state) {
                    liveness::propagate_backward(instr, &mut state);
                } else {
                    subgraph
                        .remove_instruction(block, index)
                        .expect("index bounds were checked");
                    changed = true;
                    // The deleted instruction contributes nothing to the
                    // state; do not propagate through it.
                }
            }
        }

        changed
    }

    fn has_side_effects(instr: &Instruction, state: &liveness::State) -> bool {
        let Some(defs) = liveness::defs_of(instr) else {
            return true;
        };
        let Some(uses) = liveness::uses_of(instr) else {
            return true;
        };

        // The instruction may write a register read later on.
        for reg in RegisterId::iter() {
            if defs.is_live(reg) && state.is_live(reg) {
                return true;
            }
        }

        if defs.are_arithmetic_flags_live() && state.are_arithmetic_flags_live() {
            return true;
        }

        // Leave stack manipulation alone.
        for reg in [RegisterId::Ebp, RegisterId::Esp] {
            if defs.is_live(reg) || uses.is_live(reg) {
                return true;
            }
        }

        if instr.is_call() || instr.is_return() || instr.is_control_flow() {
            return true;
        }

        // Only plain writes to a 32-bit register are candidates.
        match instr.decoded().ops[0].kind {
            OperandKind::Register(reg) if reg.size() == RegisterSize::Size32 => {}
            _ => return true,
        }

        !is_dce_candidate(instr.opcode())
    }

    /// Alternates the pattern rewrites and dead code elimination until a
    /// full pass produces no change; true iff the subgraph was modified.
    pub fn transform(subgraph: &mut Subgraph) -> bool {
        let mut any = false;
        loop {
            let mut changed = false;
            if Self::simplify(subgraph) {
                changed = true;
            }
            if Self::remove_dead_code(subgraph) {
                changed = true;
            }
            if !changed {
                break;
            }
            any = true;
        }
        any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BasicBlockReference, Condition, ReferenceType, Successor};
    use crate::helpers;
    use crate::subgraph::BlockType;
    use RegisterId::*;

    fn opcodes(subgraph: &Subgraph, block: BasicBlockId) -> Vec<Opcode> {
        subgraph
            .block(block)
            .unwrap()
            .as_code()
            .unwrap()
            .instructions()
            .iter()
            .map(Instruction::opcode)
            .collect()
    }

    fn block_bytes(subgraph: &Subgraph, block: BasicBlockId) -> Vec<u8> {
        subgraph
            .block(block)
            .unwrap()
            .as_code()
            .unwrap()
            .instructions()
            .iter()
            .flat_map(|instr| instr.bytes().to_vec())
            .collect()
    }

    #[test]
    fn an_empty_prologue_epilogue_is_deleted() {
        // push ebp; mov ebp, esp; pop ebp; ret == 55 8B EC 5D C3.
        let mut subgraph = Subgraph::new();
        let block = subgraph.add_code_block("f");
        subgraph.append_instruction(block, helpers::push_r(Ebp)).unwrap();
        subgraph
            .append_instruction(block, helpers::mov_rr(Ebp, Esp))
            .unwrap();
        subgraph.append_instruction(block, helpers::pop_r(Ebp)).unwrap();
        subgraph.append_instruction(block, helpers::ret()).unwrap();
        subgraph.add_block_description("f", BlockType::Code, 1, vec![block]);
        assert_eq!(vec![0x55, 0x8B, 0xEC, 0x5D, 0xC3], block_bytes(&subgraph, block));

        assert!(PeepholeTransform::transform(&mut subgraph));

        assert_eq!(vec![0xC3], block_bytes(&subgraph, block));
        assert_eq!(vec![Opcode::Ret], opcodes(&subgraph, block));
    }

    #[test]
    fn an_identity_move_is_deleted() {
        // mov eax, eax; mov eax, 10 == 8B C0 B8 0A 00 00 00.
        let mut subgraph = Subgraph::new();
        let block = subgraph.add_code_block("f");
        subgraph
            .append_instruction(block, helpers::mov_rr(Eax, Eax))
            .unwrap();
        subgraph
            .append_instruction(block, helpers::mov_ri(Eax, 0x0A))
            .unwrap();
        subgraph.add_block_description("f", BlockType::Code, 1, vec![block]);
        assert_eq!(
            vec![0x8B, 0xC0, 0xB8, 0x0A, 0x00, 0x00, 0x00],
            block_bytes(&subgraph, block)
        );

        assert!(PeepholeTransform::simplify(&mut subgraph));

        assert_eq!(vec![0xB8, 0x0A, 0x00, 0x00, 0x00], block_bytes(&subgraph, block));
    }

    #[test]
    fn dead_arithmetic_is_eliminated() {
        let mut subgraph = Subgraph::new();
        let block = subgraph.add_code_block("f");
        // EBX is rewritten before any read; the ADD and its flags are dead
        // because CMP rewrites the flags before the conditional exit.
        subgraph
            .append_instruction(block, helpers::add_rr(Ebx, Ecx))
            .unwrap();
        subgraph
            .append_instruction(block, helpers::mov_ri(Ebx, 1))
            .unwrap();
        subgraph
            .append_instruction(block, helpers::cmp_rr(Eax, Ebx))
            .unwrap();
        let exit = subgraph.add_code_block("exit");
        subgraph.append_instruction(exit, helpers::ret()).unwrap();
        let other = subgraph.add_code_block("other");
        subgraph.append_instruction(other, helpers::ret()).unwrap();
        let reference = BasicBlockReference::to_basic_block(ReferenceType::Relative, 4, exit);
        subgraph
            .append_successor(block, Successor::new(Condition::Equal, reference, 6))
            .unwrap();
        let reference = BasicBlockReference::to_basic_block(ReferenceType::Relative, 4, other);
        subgraph
            .append_successor(block, Successor::new(Condition::NotEqual, reference, 5))
            .unwrap();
        subgraph.add_block_description("f", BlockType::Code, 1, vec![block]);

        assert!(PeepholeTransform::remove_dead_code(&mut subgraph));

        assert_eq!(vec![Opcode::Mov, Opcode::Cmp], opcodes(&subgraph, block));
    }

    #[test]
    fn live_defs_and_side_effects_survive() {
        let mut subgraph = Subgraph::new();
        let block = subgraph.add_code_block("f");
        subgraph
            .append_instruction(block, helpers::push_r(Ecx))
            .unwrap();
        subgraph
            .append_instruction(block, helpers::mov_ri(Eax, 7))
            .unwrap();
        subgraph.append_instruction(block, helpers::ret()).unwrap();
        subgraph.add_block_description("f", BlockType::Code, 1, vec![block]);

        // PUSH moves the stack; MOV defines EAX which RET makes live; RET
        // is control flow.
        assert!(!PeepholeTransform::remove_dead_code(&mut subgraph));
        assert_eq!(
            vec![Opcode::Push, Opcode::Mov, Opcode::Ret],
            opcodes(&subgraph, block)
        );
    }

    #[test]
    fn the_combined_pass_is_idempotent() {
        let mut subgraph = Subgraph::new();
        let block = subgraph.add_code_block("f");
        subgraph.append_instruction(block, helpers::push_r(Ebp)).unwrap();
        subgraph
            .append_instruction(block, helpers::mov_rr(Ebp, Esp))
            .unwrap();
        subgraph.append_instruction(block, helpers::pop_r(Ebp)).unwrap();
        subgraph
            .append_instruction(block, helpers::mov_rr(Edx, Edx))
            .unwrap();
        subgraph
            .append_instruction(block, helpers::add_rr(Ebx, Ecx))
            .unwrap();
        subgraph
            .append_instruction(block, helpers::mov_ri(Ebx, 1))
            .unwrap();
        subgraph
            .append_instruction(block, helpers::cmp_rr(Eax, Ebx))
            .unwrap();
        let exit = subgraph.add_code_block("exit");
        subgraph.append_instruction(exit, helpers::ret()).unwrap();
        let other = subgraph.add_code_block("other");
        subgraph.append_instruction(other, helpers::ret()).unwrap();
        let reference = BasicBlockReference::to_basic_block(ReferenceType::Relative, 4, exit);
        subgraph
            .append_successor(block, Successor::new(Condition::Equal, reference, 6))
            .unwrap();
        let reference = BasicBlockReference::to_basic_block(ReferenceType::Relative, 4, other);
        subgraph
            .append_successor(block, Successor::new(Condition::NotEqual, reference, 5))
            .unwrap();
        subgraph.add_block_description("f", BlockType::Code, 1, vec![block]);

        assert!(PeepholeTransform::transform(&mut subgraph));
        let after_first = block_bytes(&subgraph, block);

        // The prologue window, the identity move, and the dead ADD are all
        // gone; a second run finds nothing further.
        assert_eq!(vec![Opcode::Mov, Opcode::Cmp], opcodes(&subgraph, block));
        assert!(!PeepholeTransform::transform(&mut subgraph));
        assert_eq!(after_first, block_bytes(&subgraph, block));
    }
}

//! Backward liveness analysis of general purpose registers and arithmetic
//! flags.
//!
//! The register state packs one 4-bit lane per dword register so partial
//! accesses are modeled precisely: the low byte, the high byte, and the
//! word each have a bit, and a partial write leaves the untouched bits
//! live. Unknown instructions degrade to "everything live", which is always
//! safe.

use crate::analysis::control_flow::flatten_post_order;
use crate::block::{BasicBlock, Condition, Successor};
use crate::decoded::{EFlags, Opcode, OperandDesc, OperandKind};
use crate::instruction::Instruction;
use crate::subgraph::{BasicBlockId, Subgraph};
use adze_asm::RegisterId;

use std::collections::BTreeMap;

/// A packed register liveness mask: one 4-bit lane per dword register, in
/// the order EAX, EBX, ECX, EDX, ESI, EDI, ESP, EBP. Within a lane the low
/// bit is the low byte, the next bit the high byte, and the third bit the
/// upper half of the dword.
pub type RegisterMask = u32;

/// The lane mask for one register identifier.
const fn register_mask(reg: RegisterId) -> RegisterMask {
    use RegisterId::*;
    match reg {
        Al => 0x0000_0001,
        Ah => 0x0000_0002,
        Ax => 0x0000_0003,
        Eax => 0x0000_0007,
        Bl => 0x0000_0010,
        Bh => 0x0000_0020,
        Bx => 0x0000_0030,
        Ebx => 0x0000_0070,
        Cl => 0x0000_0100,
        Ch => 0x0000_0200,
        Cx => 0x0000_0300,
        Ecx => 0x0000_0700,
        Dl => 0x0000_1000,
        Dh => 0x0000_2000,
        Dx => 0x0000_3000,
        Edx => 0x0000_7000,
        Si => 0x0003_0000,
        Esi => 0x0007_0000,
        Di => 0x0030_0000,
        Edi => 0x0070_0000,
        Sp => 0x0300_0000,
        Esp => 0x0700_0000,
        Bp => 0x3000_0000,
        Ebp => 0x7000_0000,
    }
}

/// A liveness state: which register bits and which flags may be read on
/// some path from a program point to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    registers: RegisterMask,
    flags: EFlags,
}

impl State {
    /// The bottom state: nothing live.
    pub fn empty() -> Self {
        Self {
            registers: 0,
            flags: EFlags::empty(),
        }
    }

    /// The top state: everything live. This is the safe default for
    /// unknown program points.
    pub fn all() -> Self {
        Self {
            registers: u32::MAX,
            flags: EFlags::all(),
        }
    }

    /// Resets the state to nothing live.
    pub fn clear(&mut self) {
        *self = Self::empty();
    }

    /// Sets the state to everything live.
    pub fn set_all(&mut self) {
        *self = Self::all();
    }

    /// True iff any bit of `reg` may be live.
    pub fn is_live(&self, reg: RegisterId) -> bool {
        self.registers & register_mask(reg) != 0
    }

    /// True iff any of the six arithmetic flags may be live.
    pub fn are_arithmetic_flags_live(&self) -> bool {
        self.flags.intersects(EFlags::ARITHMETIC)
    }

    /// Merges `other` into this state; true iff the state grew.
    pub fn union(&mut self, other: &State) -> bool {
        let changed = (self.registers | other.registers) != self.registers
            || (self.flags | other.flags) != self.flags;
        self.registers |= other.registers;
        self.flags |= other.flags;
        changed
    }

    /// Removes everything live in `other` from this state.
    pub fn subtract(&mut self, other: &State) {
        self.registers &= !other.registers;
        self.flags &= !other.flags;
    }

    pub(crate) fn set_register(&mut self, reg: RegisterId) {
        self.registers |= register_mask(reg);
    }

    pub(crate) fn set_flags(&mut self, flags: EFlags) {
        self.flags |= flags;
    }
}

impl Default for State {
    /// Defaults to the safe top state.
    fn default() -> Self {
        Self::all()
    }
}

fn use_operand(op: &OperandDesc, state: &mut State) {
    match op.kind {
        OperandKind::Register(reg) | OperandKind::IndirectBase(reg) => state.set_register(reg),
        OperandKind::IndirectScaled { base, index, .. } => {
            state.set_register(index);
            if let Some(base) = base {
                state.set_register(base);
            }
        }
        _ => {}
    }
}

// A memory destination still evaluates its address registers, so the
// left-hand side of a store contributes uses unless it is a plain register.
fn use_operand_lhs(op: &OperandDesc, state: &mut State) {
    if matches!(op.kind, OperandKind::Register(_)) {
        return;
    }
    use_operand(op, state);
}

fn def_operand(op: &OperandDesc, state: &mut State) {
    if let OperandKind::Register(reg) = op.kind {
        state.set_register(reg);
    }
}

/// The registers and flags written by `instr`, or `None` when the
/// instruction is not modeled and must be treated conservatively.
pub(crate) fn defs_of(instr: &Instruction) -> Option<State> {
    use Opcode::*;

    let repr = instr.decoded();
    let mut state = State::empty();
    state.set_flags(repr.flags_modified | repr.flags_undefined);

    // String instructions with a repeat prefix run a counted loop over
    // ESI/EDI.
    if repr.prefixes.has_repeat() {
        return match repr.opcode {
            Movs => {
                state.set_register(RegisterId::Ecx);
                state.set_register(RegisterId::Esi);
                state.set_register(RegisterId::Edi);
                Some(state)
            }
            Stos => {
                state.set_register(RegisterId::Ecx);
                state.set_register(RegisterId::Edi);
                Some(state)
            }
            _ => None,
        };
    }

    match repr.opcode {
        Cmp | Test => Some(state),
        Add | Adc | And | Dec | Inc | Lea | Mov | Movzx | Movsx | Neg | Not | Or | Rol | Ror
        | Sar | Sbb | Shl | Shr | Sub | Xor => {
            def_operand(&repr.ops[0], &mut state);
            Some(state)
        }
        op if op.is_conditional_set() => {
            def_operand(&repr.ops[0], &mut state);
            Some(state)
        }
        Pop | Popf => {
            def_operand(&repr.ops[0], &mut state);
            state.set_register(RegisterId::Esp);
            Some(state)
        }
        Call | Push | Pushf | Ret => {
            state.set_register(RegisterId::Esp);
            Some(state)
        }
        Leave => {
            state.set_register(RegisterId::Ebp);
            state.set_register(RegisterId::Esp);
            Some(state)
        }
        Lahf => {
            state.set_register(RegisterId::Ah);
            Some(state)
        }
        Sahf => {
            state.set_flags(EFlags::AF | EFlags::CF | EFlags::PF | EFlags::SF | EFlags::ZF);
            Some(state)
        }
        Movs => {
            state.set_register(RegisterId::Esi);
            state.set_register(RegisterId::Edi);
            Some(state)
        }
        Stos => {
            state.set_register(RegisterId::Edi);
            Some(state)
        }
        Cwd => {
            state.set_register(RegisterId::Eax);
            Some(state)
        }
        Cdq => {
            state.set_register(RegisterId::Eax);
            state.set_register(RegisterId::Edx);
            Some(state)
        }
        Mul | Imul => {
            if matches!(repr.ops[1].kind, OperandKind::None) {
                // The destination is the implicit accumulator pair.
                match repr.ops[0].size_bits {
                    8 => state.set_register(RegisterId::Ax),
                    16 => {
                        state.set_register(RegisterId::Ax);
                        state.set_register(RegisterId::Dx);
                    }
                    32 => {
                        state.set_register(RegisterId::Eax);
                        state.set_register(RegisterId::Edx);
                    }
                    _ => return None,
                }
                Some(state)
            } else {
                // Explicit-destination IMUL is left to the conservative
                // path.
                None
            }
        }
        _ => None,
    }
}

/// The registers and flags read by `instr`, or `None` when the instruction
/// is not modeled and must be treated conservatively.
pub(crate) fn uses_of(instr: &Instruction) -> Option<State> {
    use Opcode::*;

    let repr = instr.decoded();
    let mut state = State::empty();
    state.set_flags(repr.flags_tested);

    // The xor-initialization idiom reads nothing.
    if repr.opcode == Xor {
        if let (OperandKind::Register(a), OperandKind::Register(b)) =
            (repr.ops[0].kind, repr.ops[1].kind)
        {
            if a == b {
                return Some(state);
            }
        }
    }

    if repr.prefixes.has_repeat() {
        return match repr.opcode {
            Movs => {
                state.set_register(RegisterId::Ecx);
                state.set_register(RegisterId::Esi);
                state.set_register(RegisterId::Edi);
                Some(state)
            }
            Stos => {
                state.set_register(RegisterId::Eax);
                state.set_register(RegisterId::Ecx);
                state.set_register(RegisterId::Edi);
                Some(state)
            }
            _ => None,
        };
    }

    match repr.opcode {
        Add | Adc | And | Cmp | Dec | Inc | Neg | Not | Rol | Ror | Or | Sbb | Sar | Shl | Shr
        | Sub | Test | Xor => {
            use_operand(&repr.ops[0], &mut state);
            use_operand(&repr.ops[1], &mut state);
            Some(state)
        }
        op if op.is_conditional_set() => Some(state),
        Lea | Mov | Movzx | Movsx => {
            use_operand_lhs(&repr.ops[0], &mut state);
            use_operand(&repr.ops[1], &mut state);
            Some(state)
        }
        Pushf => {
            state.set_flags(EFlags::all());
            state.set_register(RegisterId::Esp);
            Some(state)
        }
        Lahf => {
            state.set_flags(EFlags::AF | EFlags::CF | EFlags::PF | EFlags::SF | EFlags::ZF);
            Some(state)
        }
        Sahf => {
            state.set_register(RegisterId::Ah);
            Some(state)
        }
        Pop | Popf => {
            use_operand_lhs(&repr.ops[0], &mut state);
            state.set_register(RegisterId::Esp);
            Some(state)
        }
        Call | Push | Ret => {
            use_operand(&repr.ops[0], &mut state);
            state.set_register(RegisterId::Esp);
            Some(state)
        }
        Leave => {
            state.set_register(RegisterId::Ebp);
            state.set_register(RegisterId::Esp);
            Some(state)
        }
        Movs => {
            state.set_register(RegisterId::Esi);
            state.set_register(RegisterId::Edi);
            Some(state)
        }
        Stos => {
            state.set_register(RegisterId::Eax);
            state.set_register(RegisterId::Edi);
            Some(state)
        }
        Cwd => {
            state.set_register(RegisterId::Ax);
            Some(state)
        }
        Cdq => {
            state.set_register(RegisterId::Eax);
            Some(state)
        }
        Mul | Imul => {
            use_operand(&repr.ops[0], &mut state);
            use_operand(&repr.ops[1], &mut state);
            use_operand(&repr.ops[2], &mut state);

            if matches!(repr.ops[1].kind, OperandKind::None) {
                // The second factor is the implicit accumulator.
                match repr.ops[0].size_bits {
                    8 => state.set_register(RegisterId::Al),
                    16 => state.set_register(RegisterId::Ax),
                    32 => state.set_register(RegisterId::Eax),
                    _ => return None,
                }
            }
            Some(state)
        }
        _ => None,
    }
}

/// Applies one instruction backward to `state`: kill its defs, then add its
/// uses. Calls, returns, branches, interrupts, and unknown instructions
/// degrade to everything-live.
pub fn propagate_backward(instr: &Instruction, state: &mut State) {
    // A nop contributes nothing; skipping keeps it from pinning registers.
    if instr.is_nop() {
        return;
    }

    if let Some(defs) = defs_of(instr) {
        state.subtract(&defs);
    }

    if instr.is_call() || instr.is_return() {
        // The calling convention is not modeled.
        state.set_all();
    } else if instr.is_branch() || instr.is_interrupt() || instr.is_control_flow() {
        state.set_all();
    }

    match uses_of(instr) {
        Some(uses) => {
            state.union(&uses);
        }
        None => state.set_all(),
    }
}

/// The flags read by the implicit branch of a successor edge, or `None`
/// for conditions whose flag demand is unknown.
fn successor_uses(successor: &Successor) -> Option<State> {
    let mut state = State::empty();
    match successor.condition() {
        Condition::Above | Condition::BelowOrEqual => {
            state.set_flags(EFlags::CF | EFlags::ZF);
        }
        Condition::Below | Condition::AboveOrEqual => {
            state.set_flags(EFlags::CF);
        }
        Condition::Equal | Condition::NotEqual => {
            state.set_flags(EFlags::ZF);
        }
        Condition::Greater | Condition::LessOrEqual => {
            state.set_flags(EFlags::ZF | EFlags::SF | EFlags::OF);
        }
        Condition::Less | Condition::GreaterOrEqual => {
            state.set_flags(EFlags::SF | EFlags::OF);
        }
        Condition::Overflow | Condition::NotOverflow => {
            state.set_flags(EFlags::OF);
        }
        Condition::Parity | Condition::NotParity => {
            state.set_flags(EFlags::PF);
        }
        Condition::Signed | Condition::NotSigned => {
            state.set_flags(EFlags::SF);
        }
        Condition::True => {}
        _ => return None,
    }
    Some(state)
}

/// The backward register and flag liveness fixpoint over a subgraph.
#[derive(Debug, Default)]
pub struct LivenessAnalysis {
    live_in: BTreeMap<BasicBlockId, State>,
}

impl LivenessAnalysis {
    /// Creates an analysis with no recorded state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the fixpoint over `subgraph`, recording the live-in state of
    /// every code block. Each state only ever grows, so the iteration
    /// terminates.
    pub fn analyze(&mut self, subgraph: &Subgraph) {
        self.live_in.clear();

        let order = flatten_post_order(subgraph);
        for &block in &order {
            self.live_in.insert(block, State::empty());
        }

        let mut changed = true;
        while changed {
            changed = false;

            for &block in &order {
                let mut state = self.state_at_exit(subgraph, block);

                let code = subgraph
                    .block(block)
                    .and_then(BasicBlock::as_code)
                    .expect("post-order yields code blocks");
                for instr in code.instructions().iter().rev() {
                    propagate_backward(instr, &mut state);
                }

                let live_in = self
                    .live_in
                    .get_mut(&block)
                    .expect("every ordered block was seeded");
                if live_in.union(&state) {
                    changed = true;
                }
            }
        }
    }

    /// The state at the entry of `block`. Unknown blocks yield the safe
    /// top state.
    pub fn state_at_entry(&self, block: BasicBlockId) -> State {
        self.live_in.get(&block).copied().unwrap_or_else(State::all)
    }

    /// The state entering the outgoing edges of `block`: the union over its
    /// successors of the successor's entry state and the flags its
    /// condition reads. Blocks without in-graph successors, and non-code
    /// blocks, yield the safe top state.
    pub fn state_at_exit(&self, subgraph: &Subgraph, block: BasicBlockId) -> State {
        let Some(code) = subgraph.block(block).and_then(BasicBlock::as_code) else {
            return State::all();
        };
        if code.successors().is_empty() {
            return State::all();
        }

        let mut state = State::empty();
        for successor in code.successors() {
            let Some(target) = successor.reference().and_then(|r| r.basic_block()) else {
                // The successor leaves the subgraph; assume everything is
                // read over there.
                return State::all();
            };

            state.union(&self.state_at_entry(target));

            match successor_uses(successor) {
                Some(uses) => {
                    state.union(&uses);
                }
                None => state.set_all(),
            }
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BasicBlockReference, ReferenceType};
    use crate::helpers;
    use crate::subgraph::BlockType;
    use RegisterId::*;

    fn backward(instructions: &[Instruction], mut state: State) -> State {
        for instr in instructions.iter().rev() {
            propagate_backward(instr, &mut state);
        }
        state
    }

    #[test]
    fn top_is_a_fixed_point_of_the_conservative_transfers() {
        // Control flow, unmodeled instructions, and instructions whose
        // uses cover their defs leave the top state intact.
        let samples = [
            helpers::nop(),
            helpers::ret(),
            helpers::call_pc_relative(),
            helpers::int3(),
            helpers::jmp_indirect(Ebx),
            helpers::rep_movs(),
            helpers::rep_stos(),
            helpers::imul_rr(Eax, Ebx),
            helpers::push_r(Ebp),
        ];
        for instr in samples {
            let mut state = State::all();
            propagate_backward(&instr, &mut state);
            assert_eq!(State::all(), state, "{}", instr.name());
        }
    }

    #[test]
    fn a_move_kills_its_destination_and_uses_its_source() {
        let state = backward(
            &[helpers::mov_rr(Eax, Ebx)],
            State::empty(),
        );
        assert!(!state.is_live(Eax));
        assert!(state.is_live(Ebx));
    }

    #[test]
    fn ret_is_conservative() {
        // S3: at the entry of `mov eax, ebx; ret`, EAX is rewritten before
        // any read, EBX feeds the move, and the flags survive into the
        // caller.
        let state = backward(
            &[helpers::mov_rr(Eax, Ebx), helpers::ret()],
            State::empty(),
        );
        assert!(!state.is_live(Eax));
        assert!(state.is_live(Ebx));
        assert!(state.are_arithmetic_flags_live());
    }

    #[test]
    fn xor_initialization_has_no_uses() {
        let state = backward(&[helpers::xor_rr(Ecx, Ecx)], State::empty());
        assert!(!state.is_live(Ecx));

        // A real xor still uses both operands.
        let state = backward(&[helpers::xor_rr(Ecx, Edx)], State::empty());
        assert!(state.is_live(Ecx));
        assert!(state.is_live(Edx));
    }

    #[test]
    fn partial_writes_leave_the_rest_of_the_register_live() {
        // Writing AL leaves AH and the upper half live.
        let mut state = State::empty();
        state.set_register(Eax);
        propagate_backward(&helpers::mov_ri(Al, 1), &mut state);
        assert!(state.is_live(Eax));
        assert!(state.is_live(Ah));
        assert!(!state.is_live(Al));

        // Writing AX leaves only the upper half live.
        let mut state = State::empty();
        state.set_register(Eax);
        propagate_backward(&helpers::mov_ri(Ax, 1), &mut state);
        assert!(state.is_live(Eax));
        assert!(!state.is_live(Ax));
    }

    #[test]
    fn a_memory_destination_uses_its_base() {
        let state = backward(&[helpers::mov_mr(Ecx, 8, Eax)], State::empty());
        assert!(state.is_live(Ecx));
        assert!(state.is_live(Eax));
    }

    #[test]
    fn stack_instructions_def_and_use_esp() {
        let state = backward(&[helpers::push_r(Ebx)], State::empty());
        assert!(state.is_live(Esp));
        assert!(state.is_live(Ebx));

        let mut state = State::empty();
        state.set_register(Edi);
        propagate_backward(&helpers::pop_r(Edi), &mut state);
        assert!(!state.is_live(Edi));
        assert!(state.is_live(Esp));
    }

    #[test]
    fn repeated_string_instructions_use_the_counter() {
        let state = backward(&[helpers::rep_movs()], State::empty());
        assert!(state.is_live(Ecx));
        assert!(state.is_live(Esi));
        assert!(state.is_live(Edi));
        assert!(!state.is_live(Eax));

        let state = backward(&[helpers::rep_stos()], State::empty());
        assert!(state.is_live(Eax));
        assert!(state.is_live(Ecx));
        assert!(state.is_live(Edi));
    }

    #[test]
    fn multiply_defines_the_accumulator_pair() {
        let mut state = State::empty();
        state.set_register(Eax);
        state.set_register(Edx);
        propagate_backward(&helpers::mul_r(Ebx), &mut state);
        assert!(state.is_live(Eax)); // implicit source
        assert!(!state.is_live(Edx));
        assert!(state.is_live(Ebx));

        // Explicit-destination IMUL has no modeled defs, so nothing is
        // killed; both factors are used.
        let mut state = State::empty();
        propagate_backward(&helpers::imul_rr(Eax, Ebx), &mut state);
        assert!(state.is_live(Eax));
        assert!(state.is_live(Ebx));
    }

    #[test]
    fn conditional_set_reads_flags_and_defines_a_byte() {
        let mut state = State::empty();
        state.set_register(Ebx);
        propagate_backward(
            &helpers::setcc(Opcode::Setz, Bl, EFlags::ZF),
            &mut state,
        );
        assert!(!state.is_live(Bl));
        assert!(state.is_live(Bh)); // partial def
        assert!(state.are_arithmetic_flags_live());
    }

    #[test]
    fn string_instructions_use_both_pointers() {
        let state = backward(&[helpers::movs()], State::empty());
        assert!(state.is_live(Esi));
        assert!(state.is_live(Edi));
        assert!(!state.is_live(Ecx));

        let state = backward(&[helpers::stos()], State::empty());
        assert!(state.is_live(Eax));
        assert!(state.is_live(Edi));
    }

    #[test]
    fn leave_restores_the_frame_registers() {
        let state = backward(&[helpers::leave()], State::empty());
        assert!(state.is_live(Ebp));
        assert!(state.is_live(Esp));
    }

    #[test]
    fn sign_extensions_def_the_accumulator_pair() {
        let mut state = State::empty();
        state.set_register(Edx);
        propagate_backward(&helpers::cdq(), &mut state);
        assert!(!state.is_live(Edx));
        assert!(state.is_live(Eax));

        let mut state = State::empty();
        state.set_register(Eax);
        propagate_backward(&helpers::cwd(), &mut state);
        assert!(state.is_live(Ax));
    }

    #[test]
    fn flag_only_writers_keep_their_operands() {
        let state = backward(&[helpers::test_rr(Eax, Ebx)], State::empty());
        assert!(state.is_live(Eax));
        assert!(state.is_live(Ebx));

        let state = backward(&[helpers::cmp_rr(Ecx, Edx)], State::empty());
        assert!(state.is_live(Ecx));
        assert!(state.is_live(Edx));
    }

    #[test]
    fn arithmetic_reads_and_rewrites_its_destination() {
        let mut state = State::empty();
        state.set_register(Ebx);
        for instr in [
            helpers::and_rr(Ebx, Ecx),
            helpers::sub_rr(Ebx, Ecx),
            helpers::add_ri(Ebx, 4),
            helpers::shl_ri(Ebx, 2),
            helpers::dec_r(Ebx),
        ] {
            let mut state = state;
            propagate_backward(&instr, &mut state);
            // The destination is both read and rewritten, so it stays
            // live.
            assert!(state.is_live(Ebx), "{}", instr.name());
        }
    }

    #[test]
    fn adc_reads_the_carry_flag() {
        let mut state = State::empty();
        propagate_backward(&helpers::adc_rr(Eax, Ebx), &mut state);
        assert!(state.are_arithmetic_flags_live());
    }

    #[test]
    fn lahf_and_sahf_move_flags_through_ah() {
        let mut state = State::empty();
        state.set_register(Eax);
        propagate_backward(&helpers::lahf(), &mut state);
        assert!(!state.is_live(Ah));
        assert!(state.are_arithmetic_flags_live());

        let mut state = State::empty();
        state.set_flags(EFlags::ZF);
        propagate_backward(&helpers::sahf(), &mut state);
        assert!(state.is_live(Ah));
        assert!(!state.are_arithmetic_flags_live());
    }

    fn ret_block(subgraph: &mut Subgraph, name: &str) -> BasicBlockId {
        let block = subgraph.add_code_block(name);
        subgraph.append_instruction(block, helpers::ret()).unwrap();
        block
    }

    fn link(
        subgraph: &mut Subgraph,
        from: BasicBlockId,
        condition: Condition,
        to: BasicBlockId,
    ) {
        let reference = BasicBlockReference::to_basic_block(ReferenceType::Relative, 4, to);
        subgraph
            .append_successor(from, Successor::new(condition, reference, 6))
            .unwrap();
    }

    #[test]
    fn conditional_successors_keep_their_flags_live() {
        let mut subgraph = Subgraph::new();
        let entry = subgraph.add_code_block("entry");
        subgraph
            .append_instruction(entry, helpers::mov_rr(Eax, Ebx))
            .unwrap();
        let exit = ret_block(&mut subgraph, "exit");
        let other = ret_block(&mut subgraph, "other");
        link(&mut subgraph, entry, Condition::Equal, exit);
        link(&mut subgraph, entry, Condition::NotEqual, other);
        subgraph.add_block_description("f", BlockType::Code, 1, vec![entry]);

        let mut liveness = LivenessAnalysis::new();
        liveness.analyze(&subgraph);

        // The block reads ZF through its successors and EBX through the
        // move; RET makes everything live downstream.
        let entry_state = liveness.state_at_entry(entry);
        assert!(entry_state.is_live(Ebx));
        assert!(entry_state.are_arithmetic_flags_live());
    }

    #[test]
    fn analysis_is_stable_under_repetition() {
        let mut subgraph = Subgraph::new();
        let guard = subgraph.add_code_block("guard");
        subgraph
            .append_instruction(guard, helpers::cmp_rr(Eax, Ebx))
            .unwrap();
        let body = subgraph.add_code_block("body");
        subgraph
            .append_instruction(body, helpers::inc_r(Eax))
            .unwrap();
        let exit = ret_block(&mut subgraph, "exit");
        link(&mut subgraph, guard, Condition::Equal, body);
        link(&mut subgraph, guard, Condition::NotEqual, exit);
        link(&mut subgraph, body, Condition::True, guard);
        subgraph.add_block_description("f", BlockType::Code, 1, vec![guard]);

        let mut first = LivenessAnalysis::new();
        first.analyze(&subgraph);
        let mut second = LivenessAnalysis::new();
        second.analyze(&subgraph);
        // And re-running the same instance from scratch.
        let mut again = LivenessAnalysis::new();
        again.analyze(&subgraph);
        again.analyze(&subgraph);

        for block in [guard, body, exit] {
            assert_eq!(first.state_at_entry(block), second.state_at_entry(block));
            assert_eq!(first.state_at_entry(block), again.state_at_entry(block));
        }

        // The loop reads EAX and EBX at the guard.
        assert!(first.state_at_entry(guard).is_live(Eax));
        assert!(first.state_at_entry(guard).is_live(Ebx));
    }

    #[test]
    fn unknown_blocks_yield_the_top_state() {
        let liveness = LivenessAnalysis::new();
        let mut subgraph = Subgraph::new();
        let block = subgraph.add_code_block("orphan");
        assert_eq!(State::all(), liveness.state_at_entry(block));
        assert_eq!(State::all(), liveness.state_at_exit(&subgraph, block));
    }
}

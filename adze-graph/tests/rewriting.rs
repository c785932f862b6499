//! End-to-end scenarios: assemble, decompose, analyze, transform.

use adze_asm::{
    Assembler, ConditionCode, Immediate, InstructionSerializer, Mov, Pop, Push, ValueSize, EAX,
    EBP, ESP,
};
use adze_graph::analysis::{build_structural_tree, StructuralNode};
use adze_graph::helpers;
use adze_graph::transform::PeepholeTransform;
use adze_graph::{
    BasicBlockId, BasicBlockReference, BlockAttributes, BlockType, Condition, Error, Opcode,
    ReferenceType, Subgraph, Successor,
};

/// Collects raw bytes; references are irrelevant to these scenarios.
#[derive(Default)]
struct CodeSink {
    code: Vec<u8>,
}

impl InstructionSerializer for CodeSink {
    type Reference = ();

    fn append(&mut self, _location: u32, bytes: &[u8], _references: &[(usize, ())]) {
        self.code.extend_from_slice(bytes);
    }
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
fn the_assembler_and_the_decoded_records_agree_on_bytes() {
    // Assemble the empty-function idiom and compare against the canned
    // decoder records used to populate graphs in tests.
    let mut asm = Assembler::new(0, CodeSink::default());
    asm.push(EBP);
    asm.mov(EBP, ESP);
    asm.pop(EBP);
    asm.ret();

    let assembled = asm.into_serializer().code;
    let decomposed: Vec<u8> = [
        helpers::push_r(adze_asm::RegisterId::Ebp),
        helpers::mov_rr(adze_asm::RegisterId::Ebp, adze_asm::RegisterId::Esp),
        helpers::pop_r(adze_asm::RegisterId::Ebp),
        helpers::ret(),
    ]
    .iter()
    .flat_map(|instr| instr.bytes().to_vec())
    .collect();

    assert_eq!(vec![0x55, 0x8B, 0xEC, 0x5D, 0xC3], assembled);
    assert_eq!(assembled, decomposed);
}

#[test]
fn an_empty_function_reduces_to_its_return() {
    use adze_asm::RegisterId::*;

    let mut subgraph = Subgraph::new();
    let block = subgraph.add_code_block("f");
    subgraph.append_instruction(block, helpers::push_r(Ebp)).unwrap();
    subgraph
        .append_instruction(block, helpers::mov_rr(Ebp, Esp))
        .unwrap();
    subgraph.append_instruction(block, helpers::pop_r(Ebp)).unwrap();
    subgraph.append_instruction(block, helpers::ret()).unwrap();
    subgraph.add_block_description("f", BlockType::Code, 1, vec![block]);
    assert!(subgraph.is_valid());

    PeepholeTransform::transform(&mut subgraph);

    assert_eq!(vec![0xC3], block_bytes(&subgraph, block));
    assert!(subgraph.is_valid());

    // The surviving block assembles back to a bare return.
    let mut asm = Assembler::new(0, CodeSink::default());
    asm.ret();
    assert_eq!(asm.serializer().code, block_bytes(&subgraph, block));
}

#[test]
fn an_identity_move_is_rewritten_away() {
    use adze_asm::RegisterId::*;

    let mut subgraph = Subgraph::new();
    let block = subgraph.add_code_block("f");
    subgraph
        .append_instruction(block, helpers::mov_rr(Eax, Eax))
        .unwrap();
    subgraph
        .append_instruction(block, helpers::mov_ri(Eax, 0x0A))
        .unwrap();
    subgraph.add_block_description("f", BlockType::Code, 1, vec![block]);

    PeepholeTransform::simplify(&mut subgraph);

    assert_eq!(
        vec![0xB8, 0x0A, 0x00, 0x00, 0x00],
        block_bytes(&subgraph, block)
    );

    // The equivalent assembly.
    let mut asm = Assembler::new(0, CodeSink::default());
    asm.mov(EAX, Immediate::new(0x0A, ValueSize::Size32));
    assert_eq!(asm.serializer().code, block_bytes(&subgraph, block));
}

fn jump(subgraph: &mut Subgraph, from: BasicBlockId, to: BasicBlockId) {
    let reference = BasicBlockReference::to_basic_block(ReferenceType::Relative, 4, to);
    subgraph
        .append_successor(from, Successor::new(Condition::True, reference, 5))
        .unwrap();
}

fn branch(subgraph: &mut Subgraph, from: BasicBlockId, taken: BasicBlockId, other: BasicBlockId) {
    let reference = BasicBlockReference::to_basic_block(ReferenceType::Relative, 4, taken);
    subgraph
        .append_successor(from, Successor::new(Condition::Equal, reference, 6))
        .unwrap();
    let reference = BasicBlockReference::to_basic_block(ReferenceType::Relative, 4, other);
    subgraph
        .append_successor(from, Successor::new(Condition::NotEqual, reference, 5))
        .unwrap();
}

#[test]
fn the_textbook_graph_reduces_to_a_single_tree() {
    // The six-node graph: n0 -> n1; n1 -> {n2, n3}; both join at n4; n4
    // loops back to n0 or exits to n5.
    let mut subgraph = Subgraph::new();
    let n0 = subgraph.add_code_block("n0");
    let n1 = subgraph.add_code_block("n1");
    let n2 = subgraph.add_code_block("n2");
    let n3 = subgraph.add_code_block("n3");
    let n4 = subgraph.add_code_block("n4");
    let n5 = subgraph.add_code_block("n5");

    jump(&mut subgraph, n0, n1);
    branch(&mut subgraph, n1, n2, n3);
    jump(&mut subgraph, n2, n4);
    jump(&mut subgraph, n3, n4);
    branch(&mut subgraph, n4, n0, n5);
    subgraph.add_block_description("f", BlockType::Code, 1, vec![n0]);

    let tree = build_structural_tree(&subgraph).unwrap();

    // The exact shape is a repeat of the n0..n4 region followed by n5.
    match tree {
        StructuralNode::Sequence { entry, tail } => {
            assert!(matches!(*entry, StructuralNode::Repeat { .. }));
            assert_eq!(StructuralNode::Base(n5), *tail);
        }
        other => panic!("unexpected reduction:\n{other}"),
    }
}

#[test]
fn an_irreducible_graph_is_reported() {
    let mut subgraph = Subgraph::new();
    let entry = subgraph.add_code_block("entry");
    let left = subgraph.add_code_block("left");
    let right = subgraph.add_code_block("right");
    branch(&mut subgraph, entry, left, right);
    jump(&mut subgraph, left, right);
    jump(&mut subgraph, right, left);
    subgraph.add_block_description("f", BlockType::Code, 1, vec![entry]);

    assert_eq!(Err(Error::Irreducible), build_structural_tree(&subgraph));
}

#[test]
fn successor_shapes_gate_validity() {
    use adze_asm::RegisterId::*;

    let mut subgraph = Subgraph::new();

    // No successors: must end in RET or JMP.
    let returning = subgraph.add_code_block("returning");
    subgraph
        .append_instruction(returning, helpers::ret())
        .unwrap();
    assert!(subgraph.block(returning).unwrap().is_valid());

    let fallout = subgraph.add_code_block("fallout");
    subgraph
        .append_instruction(fallout, helpers::mov_rr(Eax, Ebx))
        .unwrap();
    assert!(!subgraph.block(fallout).unwrap().is_valid());

    let computed = subgraph.add_code_block("computed");
    subgraph
        .append_instruction(computed, helpers::jmp_indirect(Ecx))
        .unwrap();
    assert!(subgraph.block(computed).unwrap().is_valid());

    // A branch anywhere but the terminating slot is invalid.
    let split = subgraph.add_code_block("split");
    subgraph
        .append_instruction(split, helpers::jmp_indirect(Ecx))
        .unwrap();
    subgraph
        .append_instruction(split, helpers::mov_rr(Eax, Ebx))
        .unwrap();
    assert!(!subgraph.block(split).unwrap().is_valid());

    // One successor: must be unconditional.
    let fallthrough = subgraph.add_code_block("fallthrough");
    jump(&mut subgraph, fallthrough, returning);
    assert!(subgraph.block(fallthrough).unwrap().is_valid());

    let conditional = subgraph.add_code_block("conditional");
    let reference = BasicBlockReference::to_basic_block(ReferenceType::Relative, 4, returning);
    subgraph
        .append_successor(conditional, Successor::new(Condition::Equal, reference, 6))
        .unwrap();
    assert!(!subgraph.block(conditional).unwrap().is_valid());

    // Two successors: conditions must be exact inverses.
    let branching = subgraph.add_code_block("branching");
    branch(&mut subgraph, branching, returning, fallthrough);
    assert!(subgraph.block(branching).unwrap().is_valid());

    let skewed = subgraph.add_code_block("skewed");
    let reference = BasicBlockReference::to_basic_block(ReferenceType::Relative, 4, returning);
    subgraph
        .append_successor(skewed, Successor::new(Condition::Equal, reference, 6))
        .unwrap();
    let reference = BasicBlockReference::to_basic_block(ReferenceType::Relative, 4, fallthrough);
    subgraph
        .append_successor(skewed, Successor::new(Condition::Above, reference, 6))
        .unwrap();
    assert!(!subgraph.block(skewed).unwrap().is_valid());
}

#[test]
fn calls_into_non_returning_functions_are_recognized() {
    let mut subgraph = Subgraph::new();
    let block = subgraph.add_code_block("f");
    let abort = subgraph.add_external_block("abort", BlockAttributes::NON_RETURNING);
    let printf = subgraph.add_external_block("printf", BlockAttributes::empty());

    let mut call = helpers::call_pc_relative();
    call.set_reference(
        1,
        BasicBlockReference::to_external(ReferenceType::Relative, 4, abort, 0, 0),
    )
    .unwrap();
    let aborting = subgraph.append_instruction(block, call).unwrap();

    let mut call = helpers::call_pc_relative();
    call.set_reference(
        1,
        BasicBlockReference::to_external(ReferenceType::Relative, 4, printf, 0, 0),
    )
    .unwrap();
    let returning = subgraph.append_instruction(block, call).unwrap();

    let code = subgraph.block(block).unwrap().as_code().unwrap();
    assert!(code.instructions()[aborting].calls_non_returning_function(&subgraph));
    assert!(!code.instructions()[returning].calls_non_returning_function(&subgraph));
}

#[test]
fn branch_inversion_round_trips_where_supported() {
    use adze_graph::invert_conditional_branch_opcode as invert;

    assert_eq!(Ok(Opcode::Jbe), invert(Opcode::Ja));
    assert_eq!(Ok(Opcode::Ja), invert(Opcode::Jbe));
    assert_eq!(Ok(Opcode::Jz), invert(Opcode::Jnz));
    assert_eq!(Err(Error::Uninvertible(Opcode::Jecxz)), invert(Opcode::Jecxz));
    assert_eq!(Err(Error::Uninvertible(Opcode::Loop)), invert(Opcode::Loop));

    // The successor-level inversion agrees with the assembler's condition
    // negation.
    assert_eq!(
        Some(Condition::from_condition_code(ConditionCode::Above.negate())),
        Condition::Above.invert()
    );
}

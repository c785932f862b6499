//! The subgraph owning basic blocks and their reference bookkeeping.
//!
//! Blocks are owned by the subgraph and addressed by handle. Every mutation
//! that touches a reference goes through a subgraph helper so that the
//! forward reference (held by an instruction, successor, data block, or end
//! block) and the reverse referrer entry are always updated together.

use crate::block::{
    BasicBlock, BasicBlockReference, BlockAttributes, CodeBlock, DataBlock, EndBlock, Referrer,
    Successor,
};
use crate::instruction::Instruction;
use crate::Error;

use core::fmt;
use std::collections::{BTreeMap, BTreeSet};

/// Handle of a basic block inside its subgraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BasicBlockId(u32);

impl fmt::Display for BasicBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Handle of an external block registered with a subgraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExternalBlockId(u32);

/// The intended disposition of a described block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BlockType {
    /// The description lays out code.
    Code,
    /// The description lays out data.
    Data,
}

/// Describes one output block: its name, disposition, alignment, and the
/// ordered basic blocks forming its final layout.
#[derive(Debug, Clone)]
pub struct BlockDescription {
    /// Name of the described block.
    pub name: String,
    /// Disposition of the described block.
    pub block_type: BlockType,
    /// Alignment of the described block.
    pub alignment: u32,
    /// The basic blocks forming the block, in layout order.
    pub basic_block_order: Vec<BasicBlockId>,
}

/// A block outside the subgraph that references may point at.
#[derive(Debug, Clone)]
pub struct ExternalBlock {
    /// Name of the external block.
    pub name: String,
    /// Attributes of the external block.
    pub attributes: BlockAttributes,
}

/// Owns the basic blocks decomposed from one original block, the layout
/// descriptions, and the reverse referrer relation.
#[derive(Debug, Default)]
pub struct Subgraph {
    blocks: BTreeMap<BasicBlockId, BasicBlock>,
    descriptions: Vec<BlockDescription>,
    externals: BTreeMap<ExternalBlockId, ExternalBlock>,
    referrers: BTreeMap<BasicBlockId, BTreeSet<Referrer>>,
    next_block: u32,
    next_external: u32,
}

impl Subgraph {
    /// Creates an empty subgraph.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_block_id(&mut self) -> BasicBlockId {
        let id = BasicBlockId(self.next_block);
        self.next_block += 1;
        id
    }

    /// Adds an empty code block.
    pub fn add_code_block(&mut self, name: impl Into<String>) -> BasicBlockId {
        let id = self.next_block_id();
        self.blocks
            .insert(id, BasicBlock::Code(CodeBlock::new(id, name.into())));
        id
    }

    /// Adds a data block holding `data`; the buffer must not be empty.
    pub fn add_data_block(&mut self, name: impl Into<String>, data: Vec<u8>) -> BasicBlockId {
        let id = self.next_block_id();
        self.blocks
            .insert(id, BasicBlock::Data(DataBlock::new(id, name.into(), data)));
        id
    }

    /// Adds a zero-size end sentinel.
    pub fn add_end_block(&mut self) -> BasicBlockId {
        let id = self.next_block_id();
        self.blocks.insert(id, BasicBlock::End(EndBlock::new(id)));
        id
    }

    /// Registers an external block that references may target.
    pub fn add_external_block(
        &mut self,
        name: impl Into<String>,
        attributes: BlockAttributes,
    ) -> ExternalBlockId {
        let id = ExternalBlockId(self.next_external);
        self.next_external += 1;
        self.externals.insert(
            id,
            ExternalBlock {
                name: name.into(),
                attributes,
            },
        );
        id
    }

    /// Adds a layout description.
    pub fn add_block_description(
        &mut self,
        name: impl Into<String>,
        block_type: BlockType,
        alignment: u32,
        basic_block_order: Vec<BasicBlockId>,
    ) {
        self.descriptions.push(BlockDescription {
            name: name.into(),
            block_type,
            alignment,
            basic_block_order,
        });
    }

    /// The layout descriptions.
    pub fn block_descriptions(&self) -> &[BlockDescription] {
        &self.descriptions
    }

    /// Looks up a block by handle.
    pub fn block(&self, id: BasicBlockId) -> Option<&BasicBlock> {
        self.blocks.get(&id)
    }

    /// Looks up a block by handle, mutably.
    ///
    /// Reference-bearing fields must not be edited through this accessor;
    /// use the `set_*_reference` helpers so the referrer relation stays
    /// consistent.
    pub fn block_mut(&mut self, id: BasicBlockId) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(&id)
    }

    /// Iterates all blocks in handle order.
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.values()
    }

    /// All block handles, in handle order.
    pub fn block_ids(&self) -> Vec<BasicBlockId> {
        self.blocks.keys().copied().collect()
    }

    /// Looks up an external block by handle.
    pub fn external_block(&self, id: ExternalBlockId) -> Option<&ExternalBlock> {
        self.externals.get(&id)
    }

    /// Iterates the recorded referrers of `id`.
    pub fn referrers(&self, id: BasicBlockId) -> impl Iterator<Item = &Referrer> {
        self.referrers.get(&id).into_iter().flatten()
    }

    /// True iff every block satisfies its shape invariant.
    pub fn is_valid(&self) -> bool {
        self.blocks.values().all(BasicBlock::is_valid)
    }

    fn code_mut<'a>(
        blocks: &'a mut BTreeMap<BasicBlockId, BasicBlock>,
        id: BasicBlockId,
    ) -> Result<&'a mut CodeBlock, Error> {
        blocks
            .get_mut(&id)
            .ok_or(Error::UnknownBlock(id))?
            .as_code_mut()
            .ok_or(Error::InvariantViolated("expected a code block"))
    }

    fn register(
        referrers: &mut BTreeMap<BasicBlockId, BTreeSet<Referrer>>,
        reference: &BasicBlockReference,
        referrer: Referrer,
    ) {
        if let Some(target) = reference.basic_block() {
            referrers.entry(target).or_default().insert(referrer);
        }
    }

    fn unregister(
        referrers: &mut BTreeMap<BasicBlockId, BTreeSet<Referrer>>,
        reference: &BasicBlockReference,
        referrer: &Referrer,
    ) {
        if let Some(target) = reference.basic_block() {
            if let Some(set) = referrers.get_mut(&target) {
                set.remove(referrer);
                if set.is_empty() {
                    referrers.remove(&target);
                }
            }
        }
    }

    /// Appends an instruction to a code block, registering referrer entries
    /// for any references the instruction already carries. Returns the
    /// instruction's position.
    pub fn append_instruction(
        &mut self,
        block: BasicBlockId,
        instruction: Instruction,
    ) -> Result<usize, Error> {
        let code = Self::code_mut(&mut self.blocks, block)?;
        let index = code.instructions().len();
        let references: Vec<(usize, BasicBlockReference)> = instruction
            .references()
            .iter()
            .map(|(offset, reference)| (*offset, *reference))
            .collect();
        code.instructions_mut().push(instruction);
        for (offset, reference) in references {
            Self::register(
                &mut self.referrers,
                &reference,
                Referrer::Instruction {
                    block,
                    index,
                    offset,
                },
            );
        }
        Ok(index)
    }

    /// Removes the instruction at `index` from a code block, dropping its
    /// referrer entries and re-keying those of the instructions that shift
    /// down.
    pub fn remove_instruction(
        &mut self,
        block: BasicBlockId,
        index: usize,
    ) -> Result<Instruction, Error> {
        let code = Self::code_mut(&mut self.blocks, block)?;
        if index >= code.instructions().len() {
            return Err(Error::InvariantViolated("instruction index out of range"));
        }
        let removed = code.instructions_mut().remove(index);

        let shifted: Vec<(usize, usize, BasicBlockReference)> = code.instructions()[index..]
            .iter()
            .enumerate()
            .flat_map(|(relative, instr)| {
                instr
                    .references()
                    .iter()
                    .map(move |(offset, reference)| (index + relative, *offset, *reference))
            })
            .collect();

        for (offset, reference) in removed.references() {
            Self::unregister(
                &mut self.referrers,
                reference,
                &Referrer::Instruction {
                    block,
                    index,
                    offset: *offset,
                },
            );
        }
        for (new_index, offset, reference) in shifted {
            Self::unregister(
                &mut self.referrers,
                &reference,
                &Referrer::Instruction {
                    block,
                    index: new_index + 1,
                    offset,
                },
            );
            Self::register(
                &mut self.referrers,
                &reference,
                Referrer::Instruction {
                    block,
                    index: new_index,
                    offset,
                },
            );
        }
        Ok(removed)
    }

    /// Sets a reference at `offset` within the instruction at `index`,
    /// replacing and unregistering any reference previously at that offset.
    pub fn set_instruction_reference(
        &mut self,
        block: BasicBlockId,
        index: usize,
        offset: usize,
        reference: BasicBlockReference,
    ) -> Result<(), Error> {
        let code = Self::code_mut(&mut self.blocks, block)?;
        let instruction = code
            .instructions_mut()
            .get_mut(index)
            .ok_or(Error::InvariantViolated("instruction index out of range"))?;
        let old = instruction.set_reference(offset, reference)?;
        let referrer = Referrer::Instruction {
            block,
            index,
            offset,
        };
        if let Some(old) = old {
            Self::unregister(&mut self.referrers, &old, &referrer);
        }
        Self::register(&mut self.referrers, &reference, referrer);
        Ok(())
    }

    /// Removes the reference at `offset` within the instruction at `index`.
    pub fn remove_instruction_reference(
        &mut self,
        block: BasicBlockId,
        index: usize,
        offset: usize,
    ) -> Result<Option<BasicBlockReference>, Error> {
        let code = Self::code_mut(&mut self.blocks, block)?;
        let instruction = code
            .instructions_mut()
            .get_mut(index)
            .ok_or(Error::InvariantViolated("instruction index out of range"))?;
        let removed = instruction.remove_reference(offset);
        if let Some(reference) = &removed {
            Self::unregister(
                &mut self.referrers,
                reference,
                &Referrer::Instruction {
                    block,
                    index,
                    offset,
                },
            );
        }
        Ok(removed)
    }

    /// Appends a successor edge to a code block; at most two edges may be
    /// present. Returns the successor's position.
    pub fn append_successor(
        &mut self,
        block: BasicBlockId,
        successor: Successor,
    ) -> Result<usize, Error> {
        let code = Self::code_mut(&mut self.blocks, block)?;
        if code.successors().len() >= 2 {
            return Err(Error::InvariantViolated(
                "a code block has at most two successors",
            ));
        }
        let index = code.successors().len();
        let reference = successor.reference().copied();
        code.successors_mut().push(successor);
        if let Some(reference) = reference {
            Self::register(
                &mut self.referrers,
                &reference,
                Referrer::Successor { block, index },
            );
        }
        Ok(index)
    }

    /// Replaces the successor at `index` on a code block.
    pub fn replace_successor(
        &mut self,
        block: BasicBlockId,
        index: usize,
        successor: Successor,
    ) -> Result<Successor, Error> {
        let code = Self::code_mut(&mut self.blocks, block)?;
        let slot = code
            .successors_mut()
            .get_mut(index)
            .ok_or(Error::InvariantViolated("successor index out of range"))?;
        let old = std::mem::replace(slot, successor);
        let new_reference = code.successors()[index].reference().copied();
        let referrer = Referrer::Successor { block, index };
        if let Some(reference) = old.reference() {
            Self::unregister(&mut self.referrers, reference, &referrer);
        }
        if let Some(reference) = new_reference {
            Self::register(&mut self.referrers, &reference, referrer);
        }
        Ok(old)
    }

    /// Resolves the successor at `index` to `reference`.
    pub fn set_successor_reference(
        &mut self,
        block: BasicBlockId,
        index: usize,
        reference: BasicBlockReference,
    ) -> Result<(), Error> {
        let code = Self::code_mut(&mut self.blocks, block)?;
        let slot = code
            .successors_mut()
            .get_mut(index)
            .ok_or(Error::InvariantViolated("successor index out of range"))?;
        let old = slot.reference().copied();
        slot.set_reference(reference);
        let referrer = Referrer::Successor { block, index };
        if let Some(old) = old {
            Self::unregister(&mut self.referrers, &old, &referrer);
        }
        Self::register(&mut self.referrers, &reference, referrer);
        Ok(())
    }

    /// Sets a reference at `offset` within a data block, replacing any
    /// reference at that exact offset. The written reference must lie
    /// inside the buffer and must not overlap a neighboring reference.
    pub fn set_data_reference(
        &mut self,
        block: BasicBlockId,
        offset: usize,
        reference: BasicBlockReference,
    ) -> Result<Option<BasicBlockReference>, Error> {
        let data = self
            .blocks
            .get_mut(&block)
            .ok_or(Error::UnknownBlock(block))?
            .as_data_mut()
            .ok_or(Error::InvariantViolated("expected a data block"))?;

        let size = usize::from(reference.size());
        if offset + size > data.data().len() {
            return Err(Error::InvariantViolated(
                "reference extends past the data block",
            ));
        }
        if let Some((&prev_offset, prev)) = data.references().range(..offset).next_back() {
            if prev_offset + usize::from(prev.size()) > offset {
                return Err(Error::InvariantViolated(
                    "reference overlaps the previous reference",
                ));
            }
        }
        if let Some((&next_offset, _)) = data.references().range(offset + 1..).next() {
            if offset + size > next_offset {
                return Err(Error::InvariantViolated(
                    "reference overlaps the next reference",
                ));
            }
        }

        let old = data.references_mut().insert(offset, reference);
        let referrer = Referrer::Data { block, offset };
        if let Some(old) = old {
            Self::unregister(&mut self.referrers, &old, &referrer);
        }
        Self::register(&mut self.referrers, &reference, referrer);
        Ok(old)
    }

    /// Removes the reference at `offset` within a data block.
    pub fn remove_data_reference(
        &mut self,
        block: BasicBlockId,
        offset: usize,
    ) -> Result<Option<BasicBlockReference>, Error> {
        let data = self
            .blocks
            .get_mut(&block)
            .ok_or(Error::UnknownBlock(block))?
            .as_data_mut()
            .ok_or(Error::InvariantViolated("expected a data block"))?;
        let removed = data.references_mut().remove(&offset);
        if let Some(reference) = &removed {
            Self::unregister(
                &mut self.referrers,
                reference,
                &Referrer::Data { block, offset },
            );
        }
        Ok(removed)
    }

    /// Sets the single outgoing reference of an end block.
    pub fn set_end_reference(
        &mut self,
        block: BasicBlockId,
        reference: BasicBlockReference,
    ) -> Result<Option<BasicBlockReference>, Error> {
        let end = match self.blocks.get_mut(&block) {
            Some(BasicBlock::End(end)) => end,
            Some(_) => return Err(Error::InvariantViolated("expected an end block")),
            None => return Err(Error::UnknownBlock(block)),
        };
        let old = end.set_reference(reference);
        let referrer = Referrer::End { block };
        if let Some(old) = old {
            Self::unregister(&mut self.referrers, &old, &referrer);
        }
        Self::register(&mut self.referrers, &reference, referrer);
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Condition, ReferenceType};
    use crate::helpers;
    use adze_asm::RegisterId;

    fn reference(target: BasicBlockId) -> BasicBlockReference {
        BasicBlockReference::to_basic_block(ReferenceType::Relative, 4, target)
    }

    #[test]
    fn referrers_track_successor_references() {
        let mut subgraph = Subgraph::new();
        let b0 = subgraph.add_code_block("b0");
        let b1 = subgraph.add_code_block("b1");
        let b2 = subgraph.add_code_block("b2");

        subgraph
            .append_successor(b0, Successor::new(Condition::Equal, reference(b1), 2))
            .unwrap();
        subgraph
            .append_successor(b0, Successor::new(Condition::NotEqual, reference(b2), 2))
            .unwrap();

        assert_eq!(
            vec![&Referrer::Successor { block: b0, index: 0 }],
            subgraph.referrers(b1).collect::<Vec<_>>()
        );

        // Rebinding the first successor moves the back edge.
        subgraph.set_successor_reference(b0, 0, reference(b2)).unwrap();
        assert_eq!(0, subgraph.referrers(b1).count());
        assert_eq!(2, subgraph.referrers(b2).count());
    }

    #[test]
    fn referrers_track_instruction_references() {
        let mut subgraph = Subgraph::new();
        let code = subgraph.add_code_block("code");
        let data = subgraph.add_data_block("data", vec![0; 8]);

        let instr = helpers::mov_ri(RegisterId::Eax, 0);
        let index = subgraph.append_instruction(code, instr).unwrap();
        subgraph
            .set_instruction_reference(code, index, 1, reference(data))
            .unwrap();

        assert_eq!(
            vec![&Referrer::Instruction {
                block: code,
                index,
                offset: 1,
            }],
            subgraph.referrers(data).collect::<Vec<_>>()
        );

        // Replacing the reference at the same offset drops the old back
        // edge.
        let other = subgraph.add_data_block("other", vec![0; 8]);
        subgraph
            .set_instruction_reference(code, index, 1, reference(other))
            .unwrap();
        assert_eq!(0, subgraph.referrers(data).count());
        assert_eq!(1, subgraph.referrers(other).count());
    }

    #[test]
    fn removing_an_instruction_rekeys_later_referrers() {
        let mut subgraph = Subgraph::new();
        let code = subgraph.add_code_block("code");
        let target = subgraph.add_data_block("target", vec![0; 8]);

        subgraph
            .append_instruction(code, helpers::nop())
            .unwrap();
        let second = subgraph
            .append_instruction(code, helpers::mov_ri(RegisterId::Eax, 0))
            .unwrap();
        subgraph
            .set_instruction_reference(code, second, 1, reference(target))
            .unwrap();

        subgraph.remove_instruction(code, 0).unwrap();

        assert_eq!(
            vec![&Referrer::Instruction {
                block: code,
                index: 0,
                offset: 1,
            }],
            subgraph.referrers(target).collect::<Vec<_>>()
        );
    }

    #[test]
    fn data_references_reject_overlap() {
        let mut subgraph = Subgraph::new();
        let data = subgraph.add_data_block("table", vec![0; 8]);
        let target = subgraph.add_code_block("target");

        subgraph.set_data_reference(data, 0, reference(target)).unwrap();
        assert!(subgraph.set_data_reference(data, 2, reference(target)).is_err());
        assert!(subgraph.set_data_reference(data, 4, reference(target)).is_ok());
        assert!(subgraph.set_data_reference(data, 6, reference(target)).is_err());

        // Replacement at the same offset is allowed.
        assert!(subgraph.set_data_reference(data, 0, reference(target)).is_ok());
    }

    #[test]
    fn end_blocks_hold_a_single_reference() {
        let mut subgraph = Subgraph::new();
        let end = subgraph.add_end_block();
        let a = subgraph.add_code_block("a");
        let b = subgraph.add_code_block("b");

        subgraph.set_end_reference(end, reference(a)).unwrap();
        assert_eq!(1, subgraph.referrers(a).count());

        subgraph.set_end_reference(end, reference(b)).unwrap();
        assert_eq!(0, subgraph.referrers(a).count());
        assert_eq!(1, subgraph.referrers(b).count());
        assert_eq!(0, subgraph.block(end).unwrap().max_size());
    }

    #[test]
    fn max_size_budgets_successors() {
        let mut subgraph = Subgraph::new();
        let code = subgraph.add_code_block("code");
        let other = subgraph.add_code_block("other");

        subgraph
            .append_instruction(code, helpers::mov_rr(RegisterId::Eax, RegisterId::Ebx))
            .unwrap();
        subgraph
            .append_successor(code, Successor::new(Condition::True, reference(other), 2))
            .unwrap();

        // Two bytes of mov plus one long-branch budget.
        assert_eq!(2 + 6, subgraph.block(code).unwrap().max_size());
    }
}

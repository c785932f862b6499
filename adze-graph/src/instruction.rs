//! The instruction record stored inside code blocks.
//!
//! An instruction couples its decoded representation with the raw bytes it
//! was decoded from, a sparse side-table mapping byte offsets to outgoing
//! references, and optional source-range, label, and tag metadata.

use crate::block::BasicBlockReference;
use crate::decoded::{Decoded, InstructionClass, Opcode, OperandKind};
use crate::subgraph::Subgraph;
use crate::Error;
use adze_asm::MAX_INSTRUCTION_LENGTH;

use std::collections::{BTreeMap, BTreeSet};

/// The byte range in the original image an instruction was lifted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceRange {
    /// Start address in the original image.
    pub start: u32,
    /// Length in bytes.
    pub size: u32,
}

/// A decoded instruction plus its raw bytes and reference side-table.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    decoded: Decoded,
    bytes: [u8; MAX_INSTRUCTION_LENGTH],
    references: BTreeMap<usize, BasicBlockReference>,
    source_range: Option<SourceRange>,
    label: Option<String>,
    tags: BTreeSet<u64>,
}

impl Instruction {
    /// Wraps a decoded record together with its raw bytes. The byte slice
    /// must match the decoded size and fit the x86 length limit.
    pub fn new(decoded: Decoded, bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != decoded.size as usize || bytes.len() > MAX_INSTRUCTION_LENGTH {
            return Err(Error::InvariantViolated(
                "instruction bytes do not match the decoded size",
            ));
        }
        let mut buf = [0u8; MAX_INSTRUCTION_LENGTH];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            decoded,
            bytes: buf,
            references: BTreeMap::new(),
            source_range: None,
            label: None,
            tags: BTreeSet::new(),
        })
    }

    /// The decoded representation.
    pub const fn decoded(&self) -> &Decoded {
        &self.decoded
    }

    /// The decoded representation, mutably. Callers that rewrite the
    /// representation (e.g. branch inversion) must keep the raw bytes in
    /// sync themselves.
    pub fn decoded_mut(&mut self) -> &mut Decoded {
        &mut self.decoded
    }

    /// The mnemonic.
    pub const fn opcode(&self) -> Opcode {
        self.decoded.opcode
    }

    /// The encoded length in bytes.
    pub const fn size(&self) -> u8 {
        self.decoded.size
    }

    /// The raw instruction bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.decoded.size as usize]
    }

    /// The mnemonic name, for diagnostics.
    pub fn name(&self) -> String {
        self.decoded.opcode.to_string()
    }

    /// The reference side-table, keyed by byte offset within the
    /// instruction.
    pub fn references(&self) -> &BTreeMap<usize, BasicBlockReference> {
        &self.references
    }

    /// The source range, if the instruction was lifted from an image.
    pub const fn source_range(&self) -> Option<SourceRange> {
        self.source_range
    }

    /// Attaches a source range.
    pub fn set_source_range(&mut self, range: SourceRange) {
        self.source_range = Some(range);
    }

    /// The label, if any.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Attaches a label.
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = Some(label.into());
    }

    /// User-extensible tags.
    pub fn tags(&self) -> &BTreeSet<u64> {
        &self.tags
    }

    /// User-extensible tags, mutably.
    pub fn tags_mut(&mut self) -> &mut BTreeSet<u64> {
        &mut self.tags
    }

    /// Records a reference at `offset` within the instruction bytes,
    /// replacing any reference already at that exact offset.
    ///
    /// The offset must lie inside the encoded bytes and the written
    /// reference must not overlap a neighboring one. When the instruction
    /// is already part of a subgraph, use
    /// [`Subgraph::set_instruction_reference`](crate::Subgraph::set_instruction_reference)
    /// instead so the referrer side stays consistent.
    pub fn set_reference(
        &mut self,
        offset: usize,
        reference: BasicBlockReference,
    ) -> Result<Option<BasicBlockReference>, Error> {
        let size = usize::from(reference.size());
        if offset + size > self.decoded.size as usize {
            return Err(Error::InvariantViolated(
                "reference extends past the instruction bytes",
            ));
        }
        if let Some((&prev_offset, prev)) = self.references.range(..offset).next_back() {
            if prev_offset + usize::from(prev.size()) > offset {
                return Err(Error::InvariantViolated(
                    "reference overlaps the previous reference",
                ));
            }
        }
        if let Some((&next_offset, _)) = self.references.range(offset + 1..).next() {
            if offset + size > next_offset {
                return Err(Error::InvariantViolated(
                    "reference overlaps the next reference",
                ));
            }
        }
        Ok(self.references.insert(offset, reference))
    }

    pub(crate) fn remove_reference(&mut self, offset: usize) -> Option<BasicBlockReference> {
        self.references.remove(&offset)
    }

    /// Locates the reference attached to operand `operand_index`, by
    /// walking operand widths backwards from the end of the instruction to
    /// the byte offset where that operand's immediate or displacement is
    /// encoded.
    pub fn find_operand_reference(&self, operand_index: usize) -> Option<&BasicBlockReference> {
        let mut location = self.decoded.size as usize;
        for i in (operand_index..self.decoded.ops.len()).rev() {
            let op = &self.decoded.ops[i];
            match op.kind {
                OperandKind::None | OperandKind::Register(_) => {}
                OperandKind::Immediate | OperandKind::PcRelative => {
                    location -= usize::from(op.size_bits / 8);
                }
                OperandKind::IndirectBase(_)
                | OperandKind::IndirectScaled { .. }
                | OperandKind::AbsoluteDisplacement => {
                    location -= usize::from(self.decoded.disp_bits / 8);
                }
            }
            if i == operand_index {
                break;
            }
        }
        self.references.get(&location)
    }

    /// True iff this is a call.
    pub const fn is_call(&self) -> bool {
        matches!(self.decoded.class, InstructionClass::Call)
    }

    /// True iff this is a return.
    pub const fn is_return(&self) -> bool {
        matches!(self.decoded.class, InstructionClass::Return)
    }

    /// True iff this is a conditional branch.
    pub const fn is_conditional_branch(&self) -> bool {
        matches!(self.decoded.class, InstructionClass::ConditionalBranch)
    }

    /// True iff this is an unconditional branch.
    pub const fn is_unconditional_branch(&self) -> bool {
        matches!(self.decoded.class, InstructionClass::UnconditionalBranch)
    }

    /// True iff this is a conditional or unconditional branch.
    pub const fn is_branch(&self) -> bool {
        self.is_conditional_branch() || self.is_unconditional_branch()
    }

    /// True iff this instruction transfers control somewhere other than the
    /// next instruction; calls and returns are reported separately.
    pub const fn is_control_flow(&self) -> bool {
        self.is_branch()
    }

    /// True iff this is a software interrupt.
    pub const fn is_interrupt(&self) -> bool {
        matches!(self.decoded.class, InstructionClass::Interrupt)
    }

    /// True iff the instruction has no architectural effect: a `NOP` proper
    /// or an `XCHG` of a register with itself.
    pub fn is_nop(&self) -> bool {
        match self.decoded.opcode {
            Opcode::Nop => true,
            Opcode::Xchg => matches!(
                (self.decoded.ops[0].kind, self.decoded.ops[1].kind),
                (OperandKind::Register(a), OperandKind::Register(b)) if a == b
            ),
            _ => false,
        }
    }

    /// True iff the instruction is a `CALL` whose resolved target is an
    /// external block marked non-returning.
    pub fn calls_non_returning_function(&self, subgraph: &Subgraph) -> bool {
        if !self.is_call() {
            return false;
        }

        // Only direct and absolute-indirect targets can be followed.
        if !matches!(
            self.decoded.ops[0].kind,
            OperandKind::PcRelative | OperandKind::AbsoluteDisplacement
        ) {
            return false;
        }

        let Some((_, reference)) = self.references.iter().next() else {
            return false;
        };

        // A reference to another basic block is a recursive call into the
        // function being rewritten; those return.
        let Some(external) = reference.external_block() else {
            return false;
        };

        subgraph
            .external_block(external)
            .map(|block| {
                block
                    .attributes
                    .contains(crate::block::BlockAttributes::NON_RETURNING)
            })
            .unwrap_or(false)
    }
}

/// Maps a conditional branch opcode to its logical complement.
///
/// `JCXZ`/`JECXZ` and the `LOOP` family have no complement in the
/// instruction set and report [`Error::Uninvertible`]; callers wanting to
/// invert those must synthesize a trampoline instead.
pub fn invert_conditional_branch_opcode(opcode: Opcode) -> Result<Opcode, Error> {
    use Opcode::*;
    match opcode {
        Ja => Ok(Jbe),
        Jae => Ok(Jb),
        Jb => Ok(Jae),
        Jbe => Ok(Ja),
        Jg => Ok(Jle),
        Jge => Ok(Jl),
        Jl => Ok(Jge),
        Jle => Ok(Jg),
        Jno => Ok(Jo),
        Jnp => Ok(Jp),
        Jns => Ok(Js),
        Jnz => Ok(Jz),
        Jo => Ok(Jno),
        Jp => Ok(Jnp),
        Js => Ok(Jns),
        Jz => Ok(Jnz),
        Jcxz | Jecxz | Loop | Loopnz | Loopz => {
            tracing::warn!(%opcode, "opcode has no complementary branch");
            Err(Error::Uninvertible(opcode))
        }
        _ => {
            tracing::warn!(%opcode, "opcode is not a conditional branch");
            Err(Error::Uninvertible(opcode))
        }
    }
}

//! The decoded instruction record consumed from the external decoder.
//!
//! The graph IR does not decode machine code itself; it relies on a decoder
//! that, given a byte buffer, produces one [`Decoded`] record per
//! instruction. Only the fields the analyses consume are modeled: the
//! mnemonic, the operand descriptors, the displacement, the prefix and
//! EFLAGS masks, and the coarse control-flow class.

use adze_asm::RegisterId;
use core::fmt;

bitflags::bitflags! {
    /// EFLAGS bits, laid out as in the hardware FLAGS register.
    pub struct EFlags: u16 {
        /// Carry flag.
        const CF = 0x0001;
        /// Parity flag.
        const PF = 0x0004;
        /// Auxiliary carry flag.
        const AF = 0x0010;
        /// Zero flag.
        const ZF = 0x0040;
        /// Sign flag.
        const SF = 0x0080;
        /// Interrupt enable flag.
        const IF = 0x0200;
        /// Direction flag.
        const DF = 0x0400;
        /// Overflow flag.
        const OF = 0x0800;
    }
}

impl EFlags {
    /// The six flags written by the arithmetic and logic instructions.
    pub const ARITHMETIC: EFlags = EFlags::from_bits_truncate(
        EFlags::CF.bits()
            | EFlags::PF.bits()
            | EFlags::AF.bits()
            | EFlags::ZF.bits()
            | EFlags::SF.bits()
            | EFlags::OF.bits(),
    );
}

bitflags::bitflags! {
    /// Instruction prefixes the analyses care about.
    pub struct Prefixes: u8 {
        /// The `REP`/`REPE` prefix.
        const REP = 0x01;
        /// The `REPNZ` prefix.
        const REPNZ = 0x02;
        /// Any segment override prefix.
        const SEGMENT_OVERRIDE = 0x04;
        /// The operand size override prefix.
        const OPERAND_SIZE = 0x08;
        /// The `LOCK` prefix.
        const LOCK = 0x10;
    }
}

impl Prefixes {
    /// True iff either string-repeat prefix is present.
    pub const fn has_repeat(self) -> bool {
        self.bits() & (Prefixes::REP.bits() | Prefixes::REPNZ.bits()) != 0
    }
}

/// Coarse control-flow classification of an instruction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum InstructionClass {
    /// Straight-line instruction.
    #[default]
    None,
    /// A call.
    Call,
    /// A return.
    Return,
    /// An unconditional branch.
    UnconditionalBranch,
    /// A conditional branch.
    ConditionalBranch,
    /// A software interrupt.
    Interrupt,
}

/// Enumerated mnemonics.
///
/// The set covers the instructions the assembler emits and the analyses
/// reason about; a decoder adapter should map anything else to the closest
/// conservative treatment by leaving it out of the def/use tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[allow(missing_docs)]
pub enum Opcode {
    Adc,
    Add,
    And,
    Call,
    Cdq,
    Cmp,
    Cwd,
    Dec,
    Imul,
    Inc,
    Int,
    Int3,
    Ja,
    Jae,
    Jb,
    Jbe,
    Jcxz,
    Jecxz,
    Jg,
    Jge,
    Jl,
    Jle,
    Jmp,
    Jno,
    Jnp,
    Jns,
    Jnz,
    Jo,
    Jp,
    Js,
    Jz,
    Lahf,
    Lea,
    Leave,
    Loop,
    Loopnz,
    Loopz,
    Mov,
    Movs,
    Movsx,
    Movzx,
    Mul,
    Neg,
    Nop,
    Not,
    Or,
    Pop,
    Popa,
    Popf,
    Push,
    Pusha,
    Pushf,
    Ret,
    Rol,
    Ror,
    Sahf,
    Sar,
    Sbb,
    Seta,
    Setae,
    Setb,
    Setbe,
    Setg,
    Setge,
    Setl,
    Setle,
    Setno,
    Setnp,
    Setns,
    Setnz,
    Seto,
    Setp,
    Sets,
    Setz,
    Shl,
    Shr,
    Stos,
    Sub,
    Test,
    Xchg,
    Xor,
}

impl Opcode {
    /// True iff the opcode is one of the `Jcc` conditional branches,
    /// excluding the counter and loop branches.
    pub const fn is_conditional_branch(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Ja | Jae | Jb | Jbe | Jg | Jge | Jl | Jle | Jno | Jnp | Jns | Jnz | Jo | Jp | Js | Jz
        )
    }

    /// True iff the opcode is one of the `SETcc` instructions.
    pub const fn is_conditional_set(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Seta | Setae
                | Setb
                | Setbe
                | Setg
                | Setge
                | Setl
                | Setle
                | Setno
                | Setnp
                | Setns
                | Setnz
                | Seto
                | Setp
                | Sets
                | Setz
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = format!("{self:?}").to_uppercase();
        write!(f, "{name}")
    }
}

/// The addressing shape of one operand slot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OperandKind {
    /// Empty slot.
    #[default]
    None,
    /// A register operand.
    Register(RegisterId),
    /// An immediate; the value itself is not consumed by the analyses.
    Immediate,
    /// A PC-relative branch target.
    PcRelative,
    /// A simple memory dereference `[base + disp]`.
    IndirectBase(RegisterId),
    /// A full memory operand `[base + index * scale + disp]`.
    IndirectScaled {
        /// Optional base register.
        base: Option<RegisterId>,
        /// Index register.
        index: RegisterId,
        /// Scale applied to the index, 1/2/4/8.
        scale: u8,
    },
    /// An absolute memory dereference `[disp32]`.
    AbsoluteDisplacement,
}

/// One operand slot: its addressing shape and the width of the datum it
/// names, in bits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OperandDesc {
    /// The addressing shape.
    pub kind: OperandKind,
    /// The width of the accessed datum, in bits. Zero for empty slots.
    pub size_bits: u16,
}

impl OperandDesc {
    /// An empty slot.
    pub const fn none() -> Self {
        Self {
            kind: OperandKind::None,
            size_bits: 0,
        }
    }

    /// A register operand of the register's own width.
    pub const fn reg(id: RegisterId) -> Self {
        Self {
            kind: OperandKind::Register(id),
            size_bits: id.size().bits() as u16,
        }
    }

    /// An immediate operand of the given width.
    pub const fn imm(size_bits: u16) -> Self {
        Self {
            kind: OperandKind::Immediate,
            size_bits,
        }
    }

    /// A PC-relative operand of the given width.
    pub const fn pc_relative(size_bits: u16) -> Self {
        Self {
            kind: OperandKind::PcRelative,
            size_bits,
        }
    }

    /// A `[base + disp]` operand accessing a datum of the given width.
    pub const fn indirect_base(base: RegisterId, size_bits: u16) -> Self {
        Self {
            kind: OperandKind::IndirectBase(base),
            size_bits,
        }
    }

    /// A `[base + index * scale + disp]` operand accessing a datum of the
    /// given width.
    pub const fn indirect_scaled(
        base: Option<RegisterId>,
        index: RegisterId,
        scale: u8,
        size_bits: u16,
    ) -> Self {
        Self {
            kind: OperandKind::IndirectScaled { base, index, scale },
            size_bits,
        }
    }

    /// An absolute `[disp32]` operand accessing a datum of the given width.
    pub const fn absolute(size_bits: u16) -> Self {
        Self {
            kind: OperandKind::AbsoluteDisplacement,
            size_bits,
        }
    }
}

/// One decoded instruction, as delivered by the external decoder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Decoded {
    /// The mnemonic.
    pub opcode: Opcode,
    /// Encoded length in bytes.
    pub size: u8,
    /// Up to four operand slots, in operand order.
    pub ops: [OperandDesc; 4],
    /// The numeric displacement shared by the memory operands.
    pub disp: u32,
    /// Width of the encoded displacement, in bits. Zero when absent.
    pub disp_bits: u8,
    /// Prefix bytes present on the instruction.
    pub prefixes: Prefixes,
    /// Coarse control-flow class.
    pub class: InstructionClass,
    /// Flags written by the instruction.
    pub flags_modified: EFlags,
    /// Flags left undefined by the instruction.
    pub flags_undefined: EFlags,
    /// Flags read by the instruction.
    pub flags_tested: EFlags,
}

impl Decoded {
    /// Creates a record with empty operands, no prefixes, and no flag
    /// effects. Builder-style `with_*` methods fill in the rest.
    pub fn new(opcode: Opcode, size: u8) -> Self {
        Self {
            opcode,
            size,
            ops: [OperandDesc::none(); 4],
            disp: 0,
            disp_bits: 0,
            prefixes: Prefixes::empty(),
            class: InstructionClass::None,
            flags_modified: EFlags::empty(),
            flags_undefined: EFlags::empty(),
            flags_tested: EFlags::empty(),
        }
    }

    /// Sets the operand slot `index`.
    pub fn with_op(mut self, index: usize, op: OperandDesc) -> Self {
        self.ops[index] = op;
        self
    }

    /// Sets the displacement and its encoded width.
    pub fn with_disp(mut self, disp: u32, disp_bits: u8) -> Self {
        self.disp = disp;
        self.disp_bits = disp_bits;
        self
    }

    /// Sets the control-flow class.
    pub fn with_class(mut self, class: InstructionClass) -> Self {
        self.class = class;
        self
    }

    /// Sets the prefix mask.
    pub fn with_prefixes(mut self, prefixes: Prefixes) -> Self {
        self.prefixes = prefixes;
        self
    }

    /// Sets the modified, undefined, and tested flag masks.
    pub fn with_flags(mut self, modified: EFlags, undefined: EFlags, tested: EFlags) -> Self {
        self.flags_modified = modified;
        self.flags_undefined = undefined;
        self.flags_tested = tested;
        self
    }
}

/// The external decoder contract.
///
/// Given a byte buffer, yields the record for the instruction at its start,
/// or `None` when the buffer does not hold a decodable instruction.
pub trait Decoder {
    /// Decodes a single instruction from the front of `buf`.
    fn decode_one(&self, buf: &[u8]) -> Option<Decoded>;
}

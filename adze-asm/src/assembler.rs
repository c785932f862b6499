//! The x86-32 instruction assembler.
//!
//! The assembler maintains an output location and pushes a stream of encoded
//! instructions, together with the byte offsets of any symbolic references
//! embedded in their displacements and immediates, at an injected
//! [`InstructionSerializer`]. The API is intentionally close to the classic
//! one-method-per-mnemonic assembler shape; mnemonics with several operand
//! forms are exposed as traits implemented once per form.

use crate::cond::{ConditionCode, LoopCode};
use crate::operand::{Operand, ScaleFactor};
use crate::register::{Register16, Register32, Register8, RegisterSize, EAX, EBP, ESP};
use crate::value::{Immediate, Value, ValueSize};
use crate::Error;

/// The maximum length a single instruction will assemble to. No x86
/// instruction may exceed 15 bytes.
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// Size of the opcode of an 8-bit reach conditional branch.
pub const SHORT_BRANCH_OPCODE_SIZE: u32 = 1;
/// Size of an 8-bit reach conditional branch.
pub const SHORT_BRANCH_SIZE: u32 = SHORT_BRANCH_OPCODE_SIZE + 1;
/// Size of the opcode of a 32-bit reach conditional branch.
pub const LONG_BRANCH_OPCODE_SIZE: u32 = 2;
/// Size of a 32-bit reach conditional branch.
pub const LONG_BRANCH_SIZE: u32 = LONG_BRANCH_OPCODE_SIZE + 4;

/// Size of the opcode of an 8-bit reach jump.
pub const SHORT_JUMP_OPCODE_SIZE: u32 = 1;
/// Size of an 8-bit reach jump.
pub const SHORT_JUMP_SIZE: u32 = SHORT_JUMP_OPCODE_SIZE + 1;
/// Size of the opcode of a 32-bit reach jump.
pub const LONG_JUMP_OPCODE_SIZE: u32 = 1;
/// Size of a 32-bit reach jump.
pub const LONG_JUMP_SIZE: u32 = LONG_JUMP_OPCODE_SIZE + 4;

const TWO_BYTE_OPCODE_PREFIX: u8 = 0x0F;
const FS_SEGMENT_PREFIX: u8 = 0x64;
const OPERAND_SIZE_PREFIX: u8 = 0x66;
const NOP_OPCODE: u8 = 0x1F;

// The code shared by AL/AX/EAX. Arithmetic with an immediate and direct
// memory moves have shorter encodings when the destination is the
// accumulator.
const ACCUMULATOR_CODE: u8 = 0;

/// The mod field of a ModR/M byte.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum Mod {
    Indirect = 0,
    ByteDisp = 1,
    WordDisp = 2,
    Register = 3,
}

/// The sink the assembler pushes encoded instructions at.
///
/// `append` is called exactly once per emitted instruction, with the
/// location the instruction was assembled at, the encoded bytes, and one
/// `(offset, token)` pair per symbolic reference embedded in the bytes.
/// Offsets are relative to the start of the instruction.
pub trait InstructionSerializer {
    /// The opaque reference token threaded through values and operands.
    type Reference: Copy;

    /// Receives one encoded instruction.
    fn append(
        &mut self,
        location: u32,
        bytes: &[u8],
        references: &[(usize, Self::Reference)],
    );
}

/// Buffers a single instruction during its creation.
struct InstructionBuffer<R> {
    buf: [u8; MAX_INSTRUCTION_LENGTH],
    len: usize,
    references: Vec<(usize, R)>,
}

impl<R: Copy> InstructionBuffer<R> {
    fn new() -> Self {
        Self {
            buf: [0; MAX_INSTRUCTION_LENGTH],
            len: 0,
            references: Vec::new(),
        }
    }

    fn emit(&mut self, byte: u8) {
        debug_assert!(self.len < MAX_INSTRUCTION_LENGTH);
        self.buf[self.len] = byte;
        self.len += 1;
    }

    fn emit_opcode(&mut self, opcode: u8) {
        self.emit(opcode);
    }

    fn emit_operand_size_prefix(&mut self, count: usize) {
        for _ in 0..count {
            self.emit(OPERAND_SIZE_PREFIX);
        }
    }

    fn emit_mod_rm(&mut self, modifier: Mod, reg_op: u8, rm_code: u8) {
        debug_assert!(reg_op <= 7);
        debug_assert!(rm_code <= 7);
        self.emit(((modifier as u8) << 6) | (reg_op << 3) | rm_code);
    }

    fn emit_sib(&mut self, scale: ScaleFactor, index_code: u8, base_code: u8) {
        debug_assert!(index_code <= 7);
        debug_assert!(base_code <= 7);
        self.emit(((scale as u8) << 6) | (index_code << 3) | base_code);
    }

    fn add_reference(&mut self, reference: Option<&R>) {
        if let Some(reference) = reference {
            debug_assert!(self.references.len() < 2);
            self.references.push((self.len, *reference));
        }
    }

    fn emit_8bit_displacement(&mut self, disp: &Value<R>) {
        debug_assert_eq!(ValueSize::Size8, disp.size());
        self.add_reference(disp.reference());
        self.emit(disp.value() as u8);
    }

    fn emit_32bit_displacement(&mut self, disp: &Value<R>) {
        self.add_reference(disp.reference());
        let value = disp.value();
        self.emit(value as u8);
        self.emit((value >> 8) as u8);
        self.emit((value >> 16) as u8);
        self.emit((value >> 24) as u8);
    }

    /// Emits the given absolute target as a value relative to the end of the
    /// emitted constant. Fails when the target is out of 8-bit reach.
    fn emit_8bit_pc_relative(&mut self, location: u32, value: &Value<R>) -> Result<(), Error> {
        debug_assert_eq!(ValueSize::Size8, value.size());

        let target = value.value();
        let next = location.wrapping_add(self.len as u32).wrapping_add(1);
        let relative = target.wrapping_sub(next) as i32;
        let byte = i8::try_from(relative)
            .map_err(|_| Error::EncodingOutOfRange { location, target })?;

        self.add_reference(value.reference());
        self.emit(byte as u8);
        Ok(())
    }

    fn emit_32bit_pc_relative(&mut self, location: u32, value: &Value<R>) {
        debug_assert_eq!(ValueSize::Size32, value.size());
        self.add_reference(value.reference());

        let next = location.wrapping_add(self.len as u32).wrapping_add(4);
        let relative = value.value().wrapping_sub(next);
        self.emit(relative as u8);
        self.emit((relative >> 8) as u8);
        self.emit((relative >> 16) as u8);
        self.emit((relative >> 24) as u8);
    }

    fn emit_16bit_value(&mut self, value: u16) {
        self.emit(value as u8);
        self.emit((value >> 8) as u8);
    }

    /// Emits the ModR/M byte, SIB byte, and displacement selecting the
    /// memory operand, with `reg_op` in the reg field.
    ///
    /// ESP in the rm field of an indirect mode selects the SIB
    /// representation, so `[esp]`-based modes always carry a SIB byte.
    /// Likewise mod=00 rm=EBP is overloaded to mean `[disp32]`, so `[ebp]`
    /// without a displacement is encoded as `[ebp + 0i8]`; the same
    /// overload applies to the base field of the SIB byte.
    fn emit_operand(&mut self, reg_op: u8, op: &Operand<R>) {
        debug_assert!(reg_op <= 7);

        match (op.index(), op.base()) {
            (None, None) => {
                // Displacement only; encoded through the [EBP] overload.
                self.emit_mod_rm(Mod::Indirect, reg_op, EBP.code());
                self.emit_32bit_displacement(op.displacement().as_value());
            }
            (None, Some(base)) if base == ESP => {
                // [ESP] and [ESP + disp] cannot be encoded without a SIB.
                match op.displacement().size() {
                    ValueSize::None => {
                        self.emit_mod_rm(Mod::Indirect, reg_op, ESP.code());
                        self.emit_sib(ScaleFactor::Times1, ESP.code(), ESP.code());
                    }
                    ValueSize::Size8 => {
                        self.emit_mod_rm(Mod::ByteDisp, reg_op, ESP.code());
                        self.emit_sib(ScaleFactor::Times1, ESP.code(), ESP.code());
                        self.emit_8bit_displacement(op.displacement().as_value());
                    }
                    _ => {
                        self.emit_mod_rm(Mod::WordDisp, reg_op, ESP.code());
                        self.emit_sib(ScaleFactor::Times1, ESP.code(), ESP.code());
                        self.emit_32bit_displacement(op.displacement().as_value());
                    }
                }
            }
            (None, Some(base)) => match op.displacement().size() {
                ValueSize::None => {
                    if base == EBP {
                        self.emit_mod_rm(Mod::ByteDisp, reg_op, EBP.code());
                        self.emit_8bit_displacement(&Value::new(0, ValueSize::Size8));
                    } else {
                        self.emit_mod_rm(Mod::Indirect, reg_op, base.code());
                    }
                }
                ValueSize::Size8 => {
                    self.emit_mod_rm(Mod::ByteDisp, reg_op, base.code());
                    self.emit_8bit_displacement(op.displacement().as_value());
                }
                _ => {
                    self.emit_mod_rm(Mod::WordDisp, reg_op, base.code());
                    self.emit_32bit_displacement(op.displacement().as_value());
                }
            },
            (Some(index), None) => {
                // Base-less scaled index; this mode always has a 32-bit
                // displacement, via the SIB base=EBP overload.
                self.emit_mod_rm(Mod::Indirect, reg_op, ESP.code());
                self.emit_sib(op.scale(), index.code(), EBP.code());
                self.emit_32bit_displacement(op.displacement().as_value());
            }
            (Some(index), Some(base)) => match op.displacement().size() {
                ValueSize::None if base == EBP => {
                    // SIB base=EBP under mod=00 would decode as [disp32];
                    // force a zero byte displacement.
                    self.emit_mod_rm(Mod::ByteDisp, reg_op, ESP.code());
                    self.emit_sib(op.scale(), index.code(), EBP.code());
                    self.emit_8bit_displacement(&Value::new(0, ValueSize::Size8));
                }
                ValueSize::None => {
                    self.emit_mod_rm(Mod::Indirect, reg_op, ESP.code());
                    self.emit_sib(op.scale(), index.code(), base.code());
                }
                ValueSize::Size8 => {
                    self.emit_mod_rm(Mod::ByteDisp, reg_op, ESP.code());
                    self.emit_sib(op.scale(), index.code(), base.code());
                    self.emit_8bit_displacement(op.displacement().as_value());
                }
                _ => {
                    self.emit_mod_rm(Mod::WordDisp, reg_op, ESP.code());
                    self.emit_sib(op.scale(), index.code(), base.code());
                    self.emit_32bit_displacement(op.displacement().as_value());
                }
            },
        }
    }

    /// Register-register arithmetic; `reg` lands in the reg field and `rm`
    /// in the rm field.
    fn emit_arithmetic(&mut self, op: u8, reg_code: u8, rm_code: u8) {
        self.emit_opcode(op);
        self.emit_mod_rm(Mod::Register, reg_code, rm_code);
    }

    fn emit_arithmetic_to_reg32(
        &mut self,
        op_eax: u8,
        op_8: u8,
        op_32: u8,
        sub_op: u8,
        dst: Register32,
        src: &Immediate<R>,
    ) {
        if dst == EAX && src.size() == ValueSize::Size32 {
            // Special encoding for EAX.
            self.emit_opcode(op_eax);
            self.emit_32bit_displacement(src.as_value());
        } else if src.size() == ValueSize::Size8 {
            self.emit_opcode(op_8);
            self.emit_mod_rm(Mod::Register, sub_op, dst.code());
            self.emit_8bit_displacement(src.as_value());
        } else {
            self.emit_opcode(op_32);
            self.emit_mod_rm(Mod::Register, sub_op, dst.code());
            self.emit_32bit_displacement(src.as_value());
        }
    }

    fn emit_arithmetic_to_reg8(
        &mut self,
        op_eax: u8,
        op_8: u8,
        sub_op: u8,
        dst: Register8,
        src: &Immediate<R>,
    ) {
        debug_assert_eq!(ValueSize::Size8, src.size());
        if dst.code() == ACCUMULATOR_CODE {
            // Special encoding for AL.
            self.emit_opcode(op_eax);
        } else {
            self.emit_opcode(op_8);
            self.emit_mod_rm(Mod::Register, sub_op, dst.code());
        }
        self.emit_8bit_displacement(src.as_value());
    }

    fn emit_arithmetic_to_operand(
        &mut self,
        op_8: u8,
        op_32: u8,
        sub_op: u8,
        dst: &Operand<R>,
        src: &Immediate<R>,
    ) {
        if src.size() == ValueSize::Size8 {
            self.emit_opcode(op_8);
            self.emit_operand(sub_op, dst);
            self.emit_8bit_displacement(src.as_value());
        } else {
            self.emit_opcode(op_32);
            self.emit_operand(sub_op, dst);
            self.emit_32bit_displacement(src.as_value());
        }
    }

    fn emit_xchg(&mut self, size: RegisterSize, dst_code: u8, src_code: u8) {
        if size == RegisterSize::Size8 {
            self.emit_opcode(0x86);
            self.emit_mod_rm(Mod::Register, src_code, dst_code);
        } else {
            // 16-bit encodings are the 32-bit encodings behind an operand
            // size override prefix.
            if size == RegisterSize::Size16 {
                self.emit_operand_size_prefix(1);
            }

            // Exchanges involving the accumulator have a 1-byte encoding.
            if src_code == ACCUMULATOR_CODE || dst_code == ACCUMULATOR_CODE {
                let other = if dst_code == ACCUMULATOR_CODE {
                    src_code
                } else {
                    dst_code
                };
                self.emit_opcode(0x90 | other);
            } else {
                self.emit_opcode(0x87);
                self.emit_mod_rm(Mod::Register, src_code, dst_code);
            }
        }
    }
}

/// Assembles x86-32 instructions at a running output location, pushing the
/// encoded bytes and embedded references at an [`InstructionSerializer`].
pub struct Assembler<S: InstructionSerializer> {
    location: u32,
    serializer: S,
}

impl<S: InstructionSerializer> Assembler<S> {
    /// Constructs an assembler that assembles to `serializer` starting at
    /// `location`.
    pub fn new(location: u32, serializer: S) -> Self {
        Self {
            location,
            serializer,
        }
    }

    /// The address at which the next emitted instruction starts.
    pub fn location(&self) -> u32 {
        self.location
    }

    /// Repositions the output location.
    pub fn set_location(&mut self, location: u32) {
        self.location = location;
    }

    /// Borrows the serializer.
    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    /// Mutably borrows the serializer.
    pub fn serializer_mut(&mut self) -> &mut S {
        &mut self.serializer
    }

    /// Consumes the assembler, returning the serializer.
    pub fn into_serializer(self) -> S {
        self.serializer
    }

    fn output(&mut self, instr: InstructionBuffer<S::Reference>) {
        self.serializer
            .append(self.location, &instr.buf[..instr.len], &instr.references);
        self.location = self.location.wrapping_add(instr.len as u32);
    }

    /// Emits one or more NOP instructions with a total length of `size`
    /// bytes, using the multi-byte NOP forms recommended by the Intel
    /// architecture manual, chunked into instructions of at most 15 bytes.
    ///
    /// A single `nop(x + y)` call generally performs better than
    /// `nop(x)` followed by `nop(y)`.
    pub fn nop(&mut self, mut size: usize) {
        // Eat up the NOPs in chunks of 15 bytes: an 11-byte non-XCHG NOP
        // followed by a 4-byte prefixed XCHG NOP.
        while size >= 15 {
            self.nop8(3);
            self.nop1(3);
            size -= 15;
        }

        match size {
            0 => {}
            1..=3 => self.nop1(size - 1),
            4 => self.nop4(0),
            5 | 6 => self.nop5(size - 5),
            7 => self.nop7(0),
            8..=11 => self.nop8(size - 8),
            _ => {
                // 12 to 14 bytes: an 8- to 10-byte non-XCHG NOP plus a
                // 4-byte prefixed XCHG NOP.
                self.nop8(size - 12);
                self.nop1(3);
            }
        }
    }

    /// 1-byte XCHG NOP (`0x90`), extended by `prefix_count` operand size
    /// prefixes.
    fn nop1(&mut self, prefix_count: usize) {
        let mut instr = InstructionBuffer::new();
        instr.emit_operand_size_prefix(prefix_count);
        instr.emit_xchg(RegisterSize::Size32, EAX.code(), EAX.code());
        self.output(instr);
    }

    /// 4-byte NOP: `NOP DWORD PTR [EAX + 0]`, 8-bit offset.
    fn nop4(&mut self, prefix_count: usize) {
        let mut instr = InstructionBuffer::new();
        instr.emit_operand_size_prefix(prefix_count);
        instr.emit_opcode(TWO_BYTE_OPCODE_PREFIX);
        instr.emit_opcode(NOP_OPCODE);
        instr.emit_mod_rm(Mod::ByteDisp, 0, EAX.code());
        instr.emit_8bit_displacement(&Value::new(0, ValueSize::Size8));
        self.output(instr);
    }

    /// 5-byte NOP: `NOP DWORD PTR [EAX + EAX * 1 + 0]`, 8-bit offset.
    fn nop5(&mut self, prefix_count: usize) {
        let mut instr = InstructionBuffer::new();
        instr.emit_operand_size_prefix(prefix_count);
        instr.emit_opcode(TWO_BYTE_OPCODE_PREFIX);
        instr.emit_opcode(NOP_OPCODE);
        // ESP in the ModR/M byte indicates a SIB byte to follow.
        instr.emit_mod_rm(Mod::ByteDisp, 0, ESP.code());
        instr.emit_sib(ScaleFactor::Times1, EAX.code(), EAX.code());
        instr.emit_8bit_displacement(&Value::new(0, ValueSize::Size8));
        self.output(instr);
    }

    /// 7-byte NOP: `NOP DWORD PTR [EAX + 0]`, 32-bit offset.
    fn nop7(&mut self, prefix_count: usize) {
        let mut instr = InstructionBuffer::new();
        instr.emit_operand_size_prefix(prefix_count);
        instr.emit_opcode(TWO_BYTE_OPCODE_PREFIX);
        instr.emit_opcode(NOP_OPCODE);
        instr.emit_mod_rm(Mod::WordDisp, 0, EAX.code());
        instr.emit_32bit_displacement(&Value::new(0, ValueSize::Size32));
        self.output(instr);
    }

    /// 8-byte NOP: `NOP DWORD PTR [EAX + EAX * 1 + 0]`, 32-bit offset.
    fn nop8(&mut self, prefix_count: usize) {
        let mut instr = InstructionBuffer::new();
        instr.emit_operand_size_prefix(prefix_count);
        instr.emit_opcode(TWO_BYTE_OPCODE_PREFIX);
        instr.emit_opcode(NOP_OPCODE);
        // ESP in the ModR/M byte indicates a SIB byte to follow.
        instr.emit_mod_rm(Mod::WordDisp, 0, ESP.code());
        instr.emit_sib(ScaleFactor::Times1, EAX.code(), EAX.code());
        instr.emit_32bit_displacement(&Value::new(0, ValueSize::Size32));
        self.output(instr);
    }

    /// Emits a conditional branch to the absolute target in `dst`. The
    /// width of `dst` selects the short or long branch form; the short form
    /// fails with [`Error::EncodingOutOfRange`] when the target cannot be
    /// reached.
    pub fn j(&mut self, cc: ConditionCode, dst: Immediate<S::Reference>) -> Result<(), Error> {
        let mut instr = InstructionBuffer::new();
        match dst.size() {
            ValueSize::Size32 => {
                instr.emit_opcode(TWO_BYTE_OPCODE_PREFIX);
                instr.emit_opcode(0x80 | cc as u8);
                instr.emit_32bit_pc_relative(self.location, dst.as_value());
            }
            ValueSize::Size8 => {
                instr.emit_opcode(0x70 | cc as u8);
                instr.emit_8bit_pc_relative(self.location, dst.as_value())?;
            }
            _ => return Err(Error::InvalidOperand("branch targets are 8 or 32 bit")),
        }
        self.output(instr);
        Ok(())
    }

    /// Emits a `JECXZ` to the absolute 8-bit-reach target in `dst`.
    pub fn jecxz(&mut self, dst: Immediate<S::Reference>) -> Result<(), Error> {
        if dst.size() != ValueSize::Size8 {
            return Err(Error::InvalidOperand("jecxz targets are 8 bit"));
        }
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0xE3);
        instr.emit_8bit_pc_relative(self.location, dst.as_value())?;
        self.output(instr);
        Ok(())
    }

    /// Emits a loop instruction branching to the absolute 8-bit-reach
    /// target in `dst`.
    pub fn l(&mut self, lc: LoopCode, dst: Immediate<S::Reference>) -> Result<(), Error> {
        if dst.size() != ValueSize::Size8 {
            return Err(Error::InvalidOperand("loop targets are 8 bit"));
        }
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0xE0 | lc as u8);
        instr.emit_8bit_pc_relative(self.location, dst.as_value())?;
        self.output(instr);
        Ok(())
    }

    /// Emits `LOOP`.
    pub fn loop_(&mut self, dst: Immediate<S::Reference>) -> Result<(), Error> {
        self.l(LoopCode::Counter, dst)
    }

    /// Emits `LOOPE`.
    pub fn loope(&mut self, dst: Immediate<S::Reference>) -> Result<(), Error> {
        self.l(LoopCode::CounterAndZeroFlag, dst)
    }

    /// Emits `LOOPNE`.
    pub fn loopne(&mut self, dst: Immediate<S::Reference>) -> Result<(), Error> {
        self.l(LoopCode::CounterAndNotZeroFlag, dst)
    }

    /// Emits a near return.
    pub fn ret(&mut self) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0xC3);
        self.output(instr);
    }

    /// Emits a near return popping `n` bytes of arguments.
    pub fn ret_n(&mut self, n: u16) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0xC2);
        instr.emit_16bit_value(n);
        self.output(instr);
    }

    /// Emits `SETcc` on the low byte of `dst`.
    pub fn set(&mut self, cc: ConditionCode, dst: Register32) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(TWO_BYTE_OPCODE_PREFIX);
        instr.emit_opcode(0x90 | cc as u8);
        // The reg field of the ModR/M byte is unused by SETcc.
        instr.emit_mod_rm(Mod::Register, ACCUMULATOR_CODE, dst.code());
        self.output(instr);
    }

    /// Emits a byte move of an 8-bit immediate into a memory operand.
    pub fn mov_b(&mut self, dst: Operand<S::Reference>, src: Immediate<S::Reference>) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0xC6);
        instr.emit_operand(0, &dst);
        instr.emit_8bit_displacement(src.as_value());
        self.output(instr);
    }

    /// Emits a zero-extending byte load into a 32-bit register.
    pub fn movzx_b(&mut self, dst: Register32, src: Operand<S::Reference>) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(TWO_BYTE_OPCODE_PREFIX);
        instr.emit_opcode(0xB6);
        instr.emit_operand(dst.code(), &src);
        self.output(instr);
    }

    /// Emits a load of the effective address of `src` into `dst`.
    pub fn lea(&mut self, dst: Register32, src: Operand<S::Reference>) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0x8D);
        instr.emit_operand(dst.code(), &src);
        self.output(instr);
    }

    /// Emits `PUSHAD`.
    pub fn pushad(&mut self) {
        self.single_opcode(0x60);
    }

    /// Emits `POPAD`.
    pub fn popad(&mut self) {
        self.single_opcode(0x61);
    }

    /// Emits `PUSHFD`.
    pub fn pushfd(&mut self) {
        self.single_opcode(0x9C);
    }

    /// Emits `POPFD`.
    pub fn popfd(&mut self) {
        self.single_opcode(0x9D);
    }

    /// Emits `LAHF`.
    pub fn lahf(&mut self) {
        self.single_opcode(0x9F);
    }

    /// Emits `SAHF`.
    pub fn sahf(&mut self) {
        self.single_opcode(0x9E);
    }

    /// Emits a one-byte increment of a 32-bit register.
    pub fn inc(&mut self, dst: Register32) {
        self.single_opcode(0x40 | dst.code());
    }

    /// Emits a one-byte decrement of a 32-bit register.
    pub fn dec(&mut self, dst: Register32) {
        self.single_opcode(0x48 | dst.code());
    }

    /// Emits a byte-wide increment of a memory operand.
    pub fn inc_b(&mut self, dst: Operand<S::Reference>) {
        self.group_fe(0, dst);
    }

    /// Emits a byte-wide decrement of a memory operand.
    pub fn dec_b(&mut self, dst: Operand<S::Reference>) {
        self.group_fe(1, dst);
    }

    /// Emits a two's complement negation of a 32-bit register.
    pub fn neg(&mut self, dst: Register32) {
        self.group_f7(3, dst);
    }

    /// Emits a one's complement negation of a 32-bit register.
    pub fn not(&mut self, dst: Register32) {
        self.group_f7(2, dst);
    }

    /// Emits an unsigned multiply of EAX by `src` into EDX:EAX.
    pub fn mul(&mut self, src: Register32) {
        self.group_f7(4, src);
    }

    /// Emits the single-operand signed multiply of EAX by `src` into
    /// EDX:EAX.
    pub fn imul_acc(&mut self, src: Register32) {
        self.group_f7(5, src);
    }

    /// Emits a left shift of `dst` by an immediate count.
    pub fn shl(&mut self, dst: Register32, count: Immediate<S::Reference>) {
        self.shift(4, dst, count);
    }

    /// Emits a logical right shift of `dst` by an immediate count.
    pub fn shr(&mut self, dst: Register32, count: Immediate<S::Reference>) {
        self.shift(5, dst, count);
    }

    /// Emits an arithmetic right shift of `dst` by an immediate count.
    pub fn sar(&mut self, dst: Register32, count: Immediate<S::Reference>) {
        self.shift(7, dst, count);
    }

    /// Emits a left rotate of `dst` by an immediate count.
    pub fn rol(&mut self, dst: Register32, count: Immediate<S::Reference>) {
        self.shift(0, dst, count);
    }

    /// Emits a right rotate of `dst` by an immediate count.
    pub fn ror(&mut self, dst: Register32, count: Immediate<S::Reference>) {
        self.shift(1, dst, count);
    }

    /// Emits a three-operand signed multiply `dst = src * imm32`.
    pub fn imul_imm(
        &mut self,
        dst: Register32,
        src: Register32,
        imm: Immediate<S::Reference>,
    ) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0x69);
        instr.emit_mod_rm(Mod::Register, dst.code(), src.code());
        instr.emit_32bit_displacement(imm.as_value());
        self.output(instr);
    }

    fn single_opcode(&mut self, opcode: u8) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(opcode);
        self.output(instr);
    }

    fn group_fe(&mut self, sub_op: u8, dst: Operand<S::Reference>) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0xFE);
        instr.emit_operand(sub_op, &dst);
        self.output(instr);
    }

    fn group_f7(&mut self, sub_op: u8, dst: Register32) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0xF7);
        instr.emit_mod_rm(Mod::Register, sub_op, dst.code());
        self.output(instr);
    }

    fn shift(&mut self, sub_op: u8, dst: Register32, count: Immediate<S::Reference>) {
        let mut instr = InstructionBuffer::new();
        if count.value() == 1 {
            instr.emit_opcode(0xD1);
            instr.emit_mod_rm(Mod::Register, sub_op, dst.code());
        } else {
            instr.emit_opcode(0xC1);
            instr.emit_mod_rm(Mod::Register, sub_op, dst.code());
            instr.emit_8bit_displacement(count.as_value());
        }
        self.output(instr);
    }
}

/// The `CALL` mnemonic.
pub trait Call<T> {
    /// Emits a call to `dst`.
    fn call(&mut self, dst: T);
}

impl<S: InstructionSerializer> Call<Immediate<S::Reference>> for Assembler<S> {
    fn call(&mut self, dst: Immediate<S::Reference>) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0xE8);
        instr.emit_32bit_pc_relative(self.location, dst.as_value());
        self.output(instr);
    }
}

impl<S: InstructionSerializer> Call<Operand<S::Reference>> for Assembler<S> {
    fn call(&mut self, dst: Operand<S::Reference>) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0xFF);
        instr.emit_operand(0x2, &dst);
        self.output(instr);
    }
}

/// The `JMP` mnemonic.
pub trait Jmp<T> {
    /// Emits a jump to `dst`. Only the 8-bit-reach immediate form can fail.
    fn jmp(&mut self, dst: T) -> Result<(), Error>;
}

impl<S: InstructionSerializer> Jmp<Immediate<S::Reference>> for Assembler<S> {
    fn jmp(&mut self, dst: Immediate<S::Reference>) -> Result<(), Error> {
        let mut instr = InstructionBuffer::new();
        match dst.size() {
            ValueSize::Size32 => {
                instr.emit_opcode(0xE9);
                instr.emit_32bit_pc_relative(self.location, dst.as_value());
            }
            ValueSize::Size8 => {
                instr.emit_opcode(0xEB);
                instr.emit_8bit_pc_relative(self.location, dst.as_value())?;
            }
            _ => return Err(Error::InvalidOperand("jump targets are 8 or 32 bit")),
        }
        self.output(instr);
        Ok(())
    }
}

impl<S: InstructionSerializer> Jmp<Operand<S::Reference>> for Assembler<S> {
    fn jmp(&mut self, dst: Operand<S::Reference>) -> Result<(), Error> {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0xFF);
        instr.emit_operand(0x4, &dst);
        self.output(instr);
        Ok(())
    }
}

impl<S: InstructionSerializer> Jmp<Register32> for Assembler<S> {
    fn jmp(&mut self, dst: Register32) -> Result<(), Error> {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0xFF);
        instr.emit_mod_rm(Mod::Register, 0x4, dst.code());
        self.output(instr);
        Ok(())
    }
}

/// The `PUSH` mnemonic.
pub trait Push<T> {
    /// Emits a push of `src`.
    fn push(&mut self, src: T);
}

impl<S: InstructionSerializer> Push<Register32> for Assembler<S> {
    fn push(&mut self, src: Register32) {
        self.single_opcode(0x50 | src.code());
    }
}

impl<S: InstructionSerializer> Push<Immediate<S::Reference>> for Assembler<S> {
    fn push(&mut self, src: Immediate<S::Reference>) {
        debug_assert_eq!(ValueSize::Size32, src.size());
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0x68);
        instr.emit_32bit_displacement(src.as_value());
        self.output(instr);
    }
}

impl<S: InstructionSerializer> Push<Operand<S::Reference>> for Assembler<S> {
    fn push(&mut self, src: Operand<S::Reference>) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0xFF);
        instr.emit_operand(0x6, &src);
        self.output(instr);
    }
}

/// The `POP` mnemonic.
pub trait Pop<T> {
    /// Emits a pop into `dst`.
    fn pop(&mut self, dst: T);
}

impl<S: InstructionSerializer> Pop<Register32> for Assembler<S> {
    fn pop(&mut self, dst: Register32) {
        self.single_opcode(0x58 | dst.code());
    }
}

impl<S: InstructionSerializer> Pop<Operand<S::Reference>> for Assembler<S> {
    fn pop(&mut self, dst: Operand<S::Reference>) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0x8F);
        instr.emit_operand(0, &dst);
        self.output(instr);
    }
}

/// The `MOV` mnemonic.
pub trait Mov<D, Src> {
    /// Emits a move from `src` into `dst`.
    fn mov(&mut self, dst: D, src: Src);
}

impl<S: InstructionSerializer> Mov<Register32, Register32> for Assembler<S> {
    fn mov(&mut self, dst: Register32, src: Register32) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0x8B);
        instr.emit_mod_rm(Mod::Register, dst.code(), src.code());
        self.output(instr);
    }
}

impl<S: InstructionSerializer> Mov<Register32, Operand<S::Reference>> for Assembler<S> {
    fn mov(&mut self, dst: Register32, src: Operand<S::Reference>) {
        let mut instr = InstructionBuffer::new();
        if dst == EAX && src.is_displacement_only() {
            // Special encoding for a direct memory load into EAX.
            instr.emit_opcode(0xA1);
            instr.emit_32bit_displacement(src.displacement().as_value());
        } else {
            instr.emit_opcode(0x8B);
            instr.emit_operand(dst.code(), &src);
        }
        self.output(instr);
    }
}

impl<S: InstructionSerializer> Mov<Operand<S::Reference>, Register32> for Assembler<S> {
    fn mov(&mut self, dst: Operand<S::Reference>, src: Register32) {
        let mut instr = InstructionBuffer::new();
        if src == EAX && dst.is_displacement_only() {
            // Special encoding for a direct memory store from EAX.
            instr.emit_opcode(0xA3);
            instr.emit_32bit_displacement(dst.displacement().as_value());
        } else {
            instr.emit_opcode(0x89);
            instr.emit_operand(src.code(), &dst);
        }
        self.output(instr);
    }
}

impl<S: InstructionSerializer> Mov<Register32, Immediate<S::Reference>> for Assembler<S> {
    fn mov(&mut self, dst: Register32, src: Immediate<S::Reference>) {
        debug_assert_ne!(ValueSize::None, src.size());
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0xB8 | dst.code());
        instr.emit_32bit_displacement(src.as_value());
        self.output(instr);
    }
}

impl<S: InstructionSerializer> Mov<Operand<S::Reference>, Immediate<S::Reference>>
    for Assembler<S>
{
    fn mov(&mut self, dst: Operand<S::Reference>, src: Immediate<S::Reference>) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0xC7);
        instr.emit_operand(0, &dst);
        instr.emit_32bit_displacement(src.as_value());
        self.output(instr);
    }
}

/// The FS-segment-prefixed `MOV` forms.
pub trait MovFs<D, Src> {
    /// Emits an FS-relative move from `src` into `dst`.
    fn mov_fs(&mut self, dst: D, src: Src);
}

impl<S: InstructionSerializer> MovFs<Register32, Operand<S::Reference>> for Assembler<S> {
    fn mov_fs(&mut self, dst: Register32, src: Operand<S::Reference>) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(FS_SEGMENT_PREFIX);
        if dst == EAX && src.is_displacement_only() {
            instr.emit_opcode(0xA1);
            instr.emit_32bit_displacement(src.displacement().as_value());
        } else {
            instr.emit_opcode(0x8B);
            instr.emit_operand(dst.code(), &src);
        }
        self.output(instr);
    }
}

impl<S: InstructionSerializer> MovFs<Operand<S::Reference>, Register32> for Assembler<S> {
    fn mov_fs(&mut self, dst: Operand<S::Reference>, src: Register32) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(FS_SEGMENT_PREFIX);
        if src == EAX && dst.is_displacement_only() {
            instr.emit_opcode(0xA3);
            instr.emit_32bit_displacement(dst.displacement().as_value());
        } else {
            instr.emit_opcode(0x89);
            instr.emit_operand(src.code(), &dst);
        }
        self.output(instr);
    }
}

/// The two-operand `IMUL` forms.
pub trait Imul<D, Src> {
    /// Emits a signed multiply of `dst` by `src`.
    fn imul(&mut self, dst: D, src: Src);
}

impl<S: InstructionSerializer> Imul<Register32, Register32> for Assembler<S> {
    fn imul(&mut self, dst: Register32, src: Register32) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(TWO_BYTE_OPCODE_PREFIX);
        instr.emit_opcode(0xAF);
        instr.emit_mod_rm(Mod::Register, dst.code(), src.code());
        self.output(instr);
    }
}

impl<S: InstructionSerializer> Imul<Register32, Operand<S::Reference>> for Assembler<S> {
    fn imul(&mut self, dst: Register32, src: Operand<S::Reference>) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(TWO_BYTE_OPCODE_PREFIX);
        instr.emit_opcode(0xAF);
        instr.emit_operand(dst.code(), &src);
        self.output(instr);
    }
}

/// The `XCHG` mnemonic.
///
/// Exchanges involving the accumulator generate shorter byte code. There is
/// an implicit lock taken during execution, so the instruction can serve as
/// a primitive for synchronization mechanisms.
pub trait Xchg<D, Src> {
    /// Emits an exchange of `dst` and `src`.
    fn xchg(&mut self, dst: D, src: Src);
}

impl<S: InstructionSerializer> Xchg<Register32, Register32> for Assembler<S> {
    fn xchg(&mut self, dst: Register32, src: Register32) {
        let mut instr = InstructionBuffer::new();
        instr.emit_xchg(RegisterSize::Size32, dst.code(), src.code());
        self.output(instr);
    }
}

impl<S: InstructionSerializer> Xchg<Register16, Register16> for Assembler<S> {
    fn xchg(&mut self, dst: Register16, src: Register16) {
        let mut instr = InstructionBuffer::new();
        instr.emit_xchg(RegisterSize::Size16, dst.code(), src.code());
        self.output(instr);
    }
}

impl<S: InstructionSerializer> Xchg<Register8, Register8> for Assembler<S> {
    fn xchg(&mut self, dst: Register8, src: Register8) {
        let mut instr = InstructionBuffer::new();
        instr.emit_xchg(RegisterSize::Size8, dst.code(), src.code());
        self.output(instr);
    }
}

impl<S: InstructionSerializer> Xchg<Register32, Operand<S::Reference>> for Assembler<S> {
    fn xchg(&mut self, dst: Register32, src: Operand<S::Reference>) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0x87);
        instr.emit_operand(dst.code(), &src);
        self.output(instr);
    }
}

// The binary arithmetic mnemonics share their encoding shape; the macro
// stamps out the trait and the seven operand forms. `rr32` order differs
// between the add/sub/cmp column (reg field is the destination) and the
// and/or/xor column (reg field is the source).
macro_rules! arithmetic_mnemonic {
    (
        $(#[$docs:meta])*
        $Trait:ident, $method:ident,
        rr8: $rr8:expr, eax8: $eax8:expr,
        rr32: $rr32:expr, reg_is_dst: $reg_is_dst:expr,
        reg_op: $reg_op:expr, op_reg: $op_reg:expr,
        eax32: $eax32:expr, sub_op: $sub_op:expr
    ) => {
        $(#[$docs])*
        pub trait $Trait<D, Src> {
            /// Emits the operation applied to `dst` and `src`.
            fn $method(&mut self, dst: D, src: Src);
        }

        impl<S: InstructionSerializer> $Trait<Register8, Register8> for Assembler<S> {
            fn $method(&mut self, dst: Register8, src: Register8) {
                let mut instr = InstructionBuffer::new();
                instr.emit_arithmetic($rr8, dst.code(), src.code());
                self.output(instr);
            }
        }

        impl<S: InstructionSerializer> $Trait<Register8, Immediate<S::Reference>>
            for Assembler<S>
        {
            fn $method(&mut self, dst: Register8, src: Immediate<S::Reference>) {
                let mut instr = InstructionBuffer::new();
                instr.emit_arithmetic_to_reg8($eax8, 0x80, $sub_op, dst, &src);
                self.output(instr);
            }
        }

        impl<S: InstructionSerializer> $Trait<Register32, Register32> for Assembler<S> {
            fn $method(&mut self, dst: Register32, src: Register32) {
                let mut instr = InstructionBuffer::new();
                let (reg, rm) = if $reg_is_dst { (dst, src) } else { (src, dst) };
                instr.emit_arithmetic($rr32, reg.code(), rm.code());
                self.output(instr);
            }
        }

        impl<S: InstructionSerializer> $Trait<Register32, Operand<S::Reference>>
            for Assembler<S>
        {
            fn $method(&mut self, dst: Register32, src: Operand<S::Reference>) {
                let mut instr = InstructionBuffer::new();
                instr.emit_opcode($reg_op);
                instr.emit_operand(dst.code(), &src);
                self.output(instr);
            }
        }

        impl<S: InstructionSerializer> $Trait<Operand<S::Reference>, Register32>
            for Assembler<S>
        {
            fn $method(&mut self, dst: Operand<S::Reference>, src: Register32) {
                let mut instr = InstructionBuffer::new();
                instr.emit_opcode($op_reg);
                instr.emit_operand(src.code(), &dst);
                self.output(instr);
            }
        }

        impl<S: InstructionSerializer> $Trait<Register32, Immediate<S::Reference>>
            for Assembler<S>
        {
            fn $method(&mut self, dst: Register32, src: Immediate<S::Reference>) {
                let mut instr = InstructionBuffer::new();
                instr.emit_arithmetic_to_reg32($eax32, 0x83, 0x81, $sub_op, dst, &src);
                self.output(instr);
            }
        }

        impl<S: InstructionSerializer> $Trait<Operand<S::Reference>, Immediate<S::Reference>>
            for Assembler<S>
        {
            fn $method(&mut self, dst: Operand<S::Reference>, src: Immediate<S::Reference>) {
                let mut instr = InstructionBuffer::new();
                instr.emit_arithmetic_to_operand(0x83, 0x81, $sub_op, &dst, &src);
                self.output(instr);
            }
        }
    };
}

arithmetic_mnemonic! {
    /// The `ADD` mnemonic.
    Add, add,
    rr8: 0x02, eax8: 0x04,
    rr32: 0x03, reg_is_dst: true,
    reg_op: 0x03, op_reg: 0x01,
    eax32: 0x05, sub_op: 0
}

arithmetic_mnemonic! {
    /// The `SUB` mnemonic.
    Sub, sub,
    rr8: 0x2A, eax8: 0x2C,
    rr32: 0x2B, reg_is_dst: true,
    reg_op: 0x2B, op_reg: 0x29,
    eax32: 0x2D, sub_op: 5
}

arithmetic_mnemonic! {
    /// The `CMP` mnemonic.
    Cmp, cmp,
    rr8: 0x3A, eax8: 0x3C,
    rr32: 0x3B, reg_is_dst: true,
    reg_op: 0x3B, op_reg: 0x39,
    eax32: 0x3D, sub_op: 7
}

arithmetic_mnemonic! {
    /// The `AND` mnemonic.
    And, and,
    rr8: 0x22, eax8: 0x24,
    rr32: 0x21, reg_is_dst: false,
    reg_op: 0x23, op_reg: 0x21,
    eax32: 0x25, sub_op: 4
}

arithmetic_mnemonic! {
    /// The `OR` mnemonic.
    Or, or,
    rr8: 0x0A, eax8: 0x0C,
    rr32: 0x09, reg_is_dst: false,
    reg_op: 0x0B, op_reg: 0x09,
    eax32: 0x0D, sub_op: 1
}

arithmetic_mnemonic! {
    /// The `XOR` mnemonic.
    Xor, xor,
    rr8: 0x32, eax8: 0x34,
    rr32: 0x31, reg_is_dst: false,
    reg_op: 0x33, op_reg: 0x31,
    eax32: 0x35, sub_op: 6
}

/// The `TEST` mnemonic.
///
/// There is no encoding for an 8-bit immediate against a 32-bit register or
/// operand, so those requests are widened to the 32-bit immediate form, and
/// the register-against-memory form leans on commutativity for the shorter
/// encoding.
pub trait Test<D, Src> {
    /// Emits a bit test of `dst` against `src`.
    fn test(&mut self, dst: D, src: Src);
}

impl<S: InstructionSerializer> Test<Register8, Register8> for Assembler<S> {
    fn test(&mut self, dst: Register8, src: Register8) {
        let mut instr = InstructionBuffer::new();
        instr.emit_arithmetic(0x84, dst.code(), src.code());
        self.output(instr);
    }
}

impl<S: InstructionSerializer> Test<Register8, Immediate<S::Reference>> for Assembler<S> {
    fn test(&mut self, dst: Register8, src: Immediate<S::Reference>) {
        let mut instr = InstructionBuffer::new();
        instr.emit_arithmetic_to_reg8(0xA8, 0xF6, 0, dst, &src);
        self.output(instr);
    }
}

impl<S: InstructionSerializer> Test<Register32, Register32> for Assembler<S> {
    fn test(&mut self, dst: Register32, src: Register32) {
        let mut instr = InstructionBuffer::new();
        instr.emit_arithmetic(0x85, dst.code(), src.code());
        self.output(instr);
    }
}

impl<S: InstructionSerializer> Test<Register32, Operand<S::Reference>> for Assembler<S> {
    fn test(&mut self, dst: Register32, src: Operand<S::Reference>) {
        self.test(src, dst);
    }
}

impl<S: InstructionSerializer> Test<Operand<S::Reference>, Register32> for Assembler<S> {
    fn test(&mut self, dst: Operand<S::Reference>, src: Register32) {
        let mut instr = InstructionBuffer::new();
        instr.emit_opcode(0x85);
        instr.emit_operand(src.code(), &dst);
        self.output(instr);
    }
}

impl<S: InstructionSerializer> Test<Register32, Immediate<S::Reference>> for Assembler<S> {
    fn test(&mut self, dst: Register32, src: Immediate<S::Reference>) {
        if src.size() == ValueSize::Size8 {
            self.test(dst, Immediate::new(src.value(), ValueSize::Size32));
            return;
        }
        let mut instr = InstructionBuffer::new();
        instr.emit_arithmetic_to_reg32(0xA9, 0xF7, 0xF7, 0, dst, &src);
        self.output(instr);
    }
}

impl<S: InstructionSerializer> Test<Operand<S::Reference>, Immediate<S::Reference>>
    for Assembler<S>
{
    fn test(&mut self, dst: Operand<S::Reference>, src: Immediate<S::Reference>) {
        if src.size() == ValueSize::Size8 {
            self.test(dst, Immediate::new(src.value(), ValueSize::Size32));
            return;
        }
        let mut instr = InstructionBuffer::new();
        instr.emit_arithmetic_to_operand(0xF7, 0xF7, 0, &dst, &src);
        self.output(instr);
    }
}

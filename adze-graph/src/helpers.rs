//! Canned instruction constructors for tests.
//!
//! The graph IR consumes decoded records from an external decoder; these
//! constructors produce faithful records (bytes, operands, flag masks) for
//! the handful of instruction shapes the tests exercise, playing the role
//! the real decoder does in production.

use crate::decoded::{Decoded, EFlags, InstructionClass, Opcode, OperandDesc, Prefixes};
use crate::instruction::Instruction;
use adze_asm::{RegisterId, RegisterSize};

fn modrm(mod_bits: u8, reg: u8, rm: u8) -> u8 {
    (mod_bits << 6) | (reg << 3) | rm
}

fn build(decoded: Decoded, bytes: &[u8]) -> Instruction {
    Instruction::new(decoded, bytes).expect("helper bytes match the decoded size")
}

/// The six flags written by the plain arithmetic instructions.
const ARITH: EFlags = EFlags::ARITHMETIC;

fn logic_flags() -> (EFlags, EFlags) {
    // AND/OR/XOR/TEST clear CF and OF and leave AF undefined.
    (
        EFlags::CF | EFlags::OF | EFlags::PF | EFlags::SF | EFlags::ZF,
        EFlags::AF,
    )
}

/// `NOP`.
pub fn nop() -> Instruction {
    build(Decoded::new(Opcode::Nop, 1), &[0x90])
}

/// `RET`.
pub fn ret() -> Instruction {
    build(
        Decoded::new(Opcode::Ret, 1).with_class(InstructionClass::Return),
        &[0xC3],
    )
}

/// `INT3`.
pub fn int3() -> Instruction {
    build(
        Decoded::new(Opcode::Int3, 1).with_class(InstructionClass::Interrupt),
        &[0xCC],
    )
}

/// `LEAVE`.
pub fn leave() -> Instruction {
    build(Decoded::new(Opcode::Leave, 1), &[0xC9])
}

/// `PUSH reg32`.
pub fn push_r(reg: RegisterId) -> Instruction {
    debug_assert_eq!(RegisterSize::Size32, reg.size());
    build(
        Decoded::new(Opcode::Push, 1).with_op(0, OperandDesc::reg(reg)),
        &[0x50 | reg.code()],
    )
}

/// `POP reg32`.
pub fn pop_r(reg: RegisterId) -> Instruction {
    debug_assert_eq!(RegisterSize::Size32, reg.size());
    build(
        Decoded::new(Opcode::Pop, 1).with_op(0, OperandDesc::reg(reg)),
        &[0x58 | reg.code()],
    )
}

/// `MOV reg32, reg32`.
pub fn mov_rr(dst: RegisterId, src: RegisterId) -> Instruction {
    build(
        Decoded::new(Opcode::Mov, 2)
            .with_op(0, OperandDesc::reg(dst))
            .with_op(1, OperandDesc::reg(src)),
        &[0x8B, modrm(0b11, dst.code(), src.code())],
    )
}

/// `MOV reg, imm`, at the register's own width.
pub fn mov_ri(dst: RegisterId, imm: u32) -> Instruction {
    let [b0, b1, b2, b3] = imm.to_le_bytes();
    let (bytes, imm_bits): (Vec<u8>, u16) = match dst.size() {
        RegisterSize::Size8 => (vec![0xB0 | dst.code(), b0], 8),
        RegisterSize::Size16 => (vec![0x66, 0xB8 | dst.code(), b0, b1], 16),
        _ => (vec![0xB8 | dst.code(), b0, b1, b2, b3], 32),
    };
    build(
        Decoded::new(Opcode::Mov, bytes.len() as u8)
            .with_op(0, OperandDesc::reg(dst))
            .with_op(1, OperandDesc::imm(imm_bits)),
        &bytes,
    )
}

fn base_disp_bytes(opcode: u8, reg: RegisterId, base: RegisterId, disp: i32) -> Vec<u8> {
    debug_assert_ne!(RegisterId::Esp, base);
    if i8::try_from(disp).is_ok() {
        vec![opcode, modrm(0b01, reg.code(), base.code()), disp as u8]
    } else {
        let mut bytes = vec![opcode, modrm(0b10, reg.code(), base.code())];
        bytes.extend_from_slice(&disp.to_le_bytes());
        bytes
    }
}

/// `MOV reg32, [base + disp]`.
pub fn mov_rm(dst: RegisterId, base: RegisterId, disp: i32) -> Instruction {
    let bytes = base_disp_bytes(0x8B, dst, base, disp);
    let disp_bits = if bytes.len() == 3 { 8 } else { 32 };
    build(
        Decoded::new(Opcode::Mov, bytes.len() as u8)
            .with_op(0, OperandDesc::reg(dst))
            .with_op(1, OperandDesc::indirect_base(base, 32))
            .with_disp(disp as u32, disp_bits),
        &bytes,
    )
}

/// `MOV [base + disp], reg32`.
pub fn mov_mr(base: RegisterId, disp: i32, src: RegisterId) -> Instruction {
    let bytes = base_disp_bytes(0x89, src, base, disp);
    let disp_bits = if bytes.len() == 3 { 8 } else { 32 };
    build(
        Decoded::new(Opcode::Mov, bytes.len() as u8)
            .with_op(0, OperandDesc::indirect_base(base, 32))
            .with_op(1, OperandDesc::reg(src))
            .with_disp(disp as u32, disp_bits),
        &bytes,
    )
}

/// `LEA reg32, [base + disp]`.
pub fn lea_rm(dst: RegisterId, base: RegisterId, disp: i32) -> Instruction {
    let bytes = base_disp_bytes(0x8D, dst, base, disp);
    let disp_bits = if bytes.len() == 3 { 8 } else { 32 };
    build(
        Decoded::new(Opcode::Lea, bytes.len() as u8)
            .with_op(0, OperandDesc::reg(dst))
            .with_op(1, OperandDesc::indirect_base(base, 32))
            .with_disp(disp as u32, disp_bits),
        &bytes,
    )
}

/// `ADD reg32, reg32`.
pub fn add_rr(dst: RegisterId, src: RegisterId) -> Instruction {
    build(
        Decoded::new(Opcode::Add, 2)
            .with_op(0, OperandDesc::reg(dst))
            .with_op(1, OperandDesc::reg(src))
            .with_flags(ARITH, EFlags::empty(), EFlags::empty()),
        &[0x03, modrm(0b11, dst.code(), src.code())],
    )
}

/// `ADD reg32, imm32`.
pub fn add_ri(dst: RegisterId, imm: u32) -> Instruction {
    let [b0, b1, b2, b3] = imm.to_le_bytes();
    let (decoded, bytes) = if dst == RegisterId::Eax {
        (Decoded::new(Opcode::Add, 5), vec![0x05, b0, b1, b2, b3])
    } else {
        (
            Decoded::new(Opcode::Add, 6),
            vec![0x81, modrm(0b11, 0, dst.code()), b0, b1, b2, b3],
        )
    };
    build(
        decoded
            .with_op(0, OperandDesc::reg(dst))
            .with_op(1, OperandDesc::imm(32))
            .with_flags(ARITH, EFlags::empty(), EFlags::empty()),
        &bytes,
    )
}

/// `SUB reg32, reg32`.
pub fn sub_rr(dst: RegisterId, src: RegisterId) -> Instruction {
    build(
        Decoded::new(Opcode::Sub, 2)
            .with_op(0, OperandDesc::reg(dst))
            .with_op(1, OperandDesc::reg(src))
            .with_flags(ARITH, EFlags::empty(), EFlags::empty()),
        &[0x2B, modrm(0b11, dst.code(), src.code())],
    )
}

/// `ADC reg32, reg32`; reads the carry flag.
pub fn adc_rr(dst: RegisterId, src: RegisterId) -> Instruction {
    build(
        Decoded::new(Opcode::Adc, 2)
            .with_op(0, OperandDesc::reg(dst))
            .with_op(1, OperandDesc::reg(src))
            .with_flags(ARITH, EFlags::empty(), EFlags::CF),
        &[0x13, modrm(0b11, dst.code(), src.code())],
    )
}

/// `CMP reg32, reg32`.
pub fn cmp_rr(lhs: RegisterId, rhs: RegisterId) -> Instruction {
    build(
        Decoded::new(Opcode::Cmp, 2)
            .with_op(0, OperandDesc::reg(lhs))
            .with_op(1, OperandDesc::reg(rhs))
            .with_flags(ARITH, EFlags::empty(), EFlags::empty()),
        &[0x3B, modrm(0b11, lhs.code(), rhs.code())],
    )
}

/// `TEST reg32, reg32`.
pub fn test_rr(lhs: RegisterId, rhs: RegisterId) -> Instruction {
    let (modified, undefined) = logic_flags();
    build(
        Decoded::new(Opcode::Test, 2)
            .with_op(0, OperandDesc::reg(lhs))
            .with_op(1, OperandDesc::reg(rhs))
            .with_flags(modified, undefined, EFlags::empty()),
        &[0x85, modrm(0b11, lhs.code(), rhs.code())],
    )
}

/// `AND reg32, reg32`.
pub fn and_rr(dst: RegisterId, src: RegisterId) -> Instruction {
    let (modified, undefined) = logic_flags();
    build(
        Decoded::new(Opcode::And, 2)
            .with_op(0, OperandDesc::reg(dst))
            .with_op(1, OperandDesc::reg(src))
            .with_flags(modified, undefined, EFlags::empty()),
        &[0x21, modrm(0b11, src.code(), dst.code())],
    )
}

/// `XOR reg32, reg32`; with identical operands this is the
/// zero-initialization idiom.
pub fn xor_rr(dst: RegisterId, src: RegisterId) -> Instruction {
    let (modified, undefined) = logic_flags();
    build(
        Decoded::new(Opcode::Xor, 2)
            .with_op(0, OperandDesc::reg(dst))
            .with_op(1, OperandDesc::reg(src))
            .with_flags(modified, undefined, EFlags::empty()),
        &[0x31, modrm(0b11, src.code(), dst.code())],
    )
}

/// `INC reg32`; leaves the carry flag alone.
pub fn inc_r(dst: RegisterId) -> Instruction {
    build(
        Decoded::new(Opcode::Inc, 1)
            .with_op(0, OperandDesc::reg(dst))
            .with_flags(
                EFlags::OF | EFlags::SF | EFlags::ZF | EFlags::AF | EFlags::PF,
                EFlags::empty(),
                EFlags::empty(),
            ),
        &[0x40 | dst.code()],
    )
}

/// `DEC reg32`; leaves the carry flag alone.
pub fn dec_r(dst: RegisterId) -> Instruction {
    build(
        Decoded::new(Opcode::Dec, 1)
            .with_op(0, OperandDesc::reg(dst))
            .with_flags(
                EFlags::OF | EFlags::SF | EFlags::ZF | EFlags::AF | EFlags::PF,
                EFlags::empty(),
                EFlags::empty(),
            ),
        &[0x48 | dst.code()],
    )
}

/// `SHL reg32, imm8`.
pub fn shl_ri(dst: RegisterId, count: u8) -> Instruction {
    let (modified, undefined) = logic_flags();
    let bytes = if count == 1 {
        vec![0xD1, modrm(0b11, 4, dst.code())]
    } else {
        vec![0xC1, modrm(0b11, 4, dst.code()), count]
    };
    build(
        Decoded::new(Opcode::Shl, bytes.len() as u8)
            .with_op(0, OperandDesc::reg(dst))
            .with_op(1, OperandDesc::imm(8))
            .with_flags(modified, undefined, EFlags::empty()),
        &bytes,
    )
}

/// `MUL reg32`: EDX:EAX = EAX * reg.
pub fn mul_r(src: RegisterId) -> Instruction {
    build(
        Decoded::new(Opcode::Mul, 2)
            .with_op(0, OperandDesc::reg(src))
            .with_flags(
                EFlags::CF | EFlags::OF,
                EFlags::PF | EFlags::SF | EFlags::ZF | EFlags::AF,
                EFlags::empty(),
            ),
        &[0xF7, modrm(0b11, 4, src.code())],
    )
}

/// `IMUL reg32, reg32`: the explicit-destination form.
pub fn imul_rr(dst: RegisterId, src: RegisterId) -> Instruction {
    build(
        Decoded::new(Opcode::Imul, 3)
            .with_op(0, OperandDesc::reg(dst))
            .with_op(1, OperandDesc::reg(src))
            .with_flags(
                EFlags::CF | EFlags::OF,
                EFlags::PF | EFlags::SF | EFlags::ZF | EFlags::AF,
                EFlags::empty(),
            ),
        &[0x0F, 0xAF, modrm(0b11, dst.code(), src.code())],
    )
}

/// `XCHG reg32, reg32`.
pub fn xchg_rr(dst: RegisterId, src: RegisterId) -> Instruction {
    let bytes = if dst == RegisterId::Eax || src == RegisterId::Eax {
        let other = if dst == RegisterId::Eax { src } else { dst };
        vec![0x90 | other.code()]
    } else {
        vec![0x87, modrm(0b11, src.code(), dst.code())]
    };
    build(
        Decoded::new(Opcode::Xchg, bytes.len() as u8)
            .with_op(0, OperandDesc::reg(dst))
            .with_op(1, OperandDesc::reg(src)),
        &bytes,
    )
}

/// A `SETcc` on a byte register; `tested` names the flags the condition
/// reads.
pub fn setcc(opcode: Opcode, dst: RegisterId, tested: EFlags) -> Instruction {
    debug_assert!(opcode.is_conditional_set());
    debug_assert_eq!(RegisterSize::Size8, dst.size());
    // SETZ sits at 0x94; the table is laid out in condition-code order.
    let cc = match opcode {
        Opcode::Seto => 0x0,
        Opcode::Setno => 0x1,
        Opcode::Setb => 0x2,
        Opcode::Setae => 0x3,
        Opcode::Setz => 0x4,
        Opcode::Setnz => 0x5,
        Opcode::Setbe => 0x6,
        Opcode::Seta => 0x7,
        Opcode::Sets => 0x8,
        Opcode::Setns => 0x9,
        Opcode::Setp => 0xA,
        Opcode::Setnp => 0xB,
        Opcode::Setl => 0xC,
        Opcode::Setge => 0xD,
        Opcode::Setle => 0xE,
        _ => 0xF,
    };
    build(
        Decoded::new(opcode, 3)
            .with_op(0, OperandDesc::reg(dst))
            .with_flags(EFlags::empty(), EFlags::empty(), tested),
        &[0x0F, 0x90 | cc, modrm(0b11, 0, dst.code())],
    )
}

/// `CALL rel32` with a zero displacement.
pub fn call_pc_relative() -> Instruction {
    build(
        Decoded::new(Opcode::Call, 5)
            .with_op(0, OperandDesc::pc_relative(32))
            .with_class(InstructionClass::Call),
        &[0xE8, 0x00, 0x00, 0x00, 0x00],
    )
}

/// `JMP [base]`: a computed jump.
pub fn jmp_indirect(base: RegisterId) -> Instruction {
    build(
        Decoded::new(Opcode::Jmp, 2)
            .with_op(0, OperandDesc::indirect_base(base, 32))
            .with_class(InstructionClass::UnconditionalBranch),
        &[0xFF, modrm(0b00, 4, base.code())],
    )
}

/// `MOVSD`: copy a dword from `[ESI]` to `[EDI]`.
pub fn movs() -> Instruction {
    build(
        Decoded::new(Opcode::Movs, 1).with_flags(EFlags::empty(), EFlags::empty(), EFlags::DF),
        &[0xA5],
    )
}

/// `REP MOVSD`.
pub fn rep_movs() -> Instruction {
    build(
        Decoded::new(Opcode::Movs, 2)
            .with_prefixes(Prefixes::REP)
            .with_flags(EFlags::empty(), EFlags::empty(), EFlags::DF),
        &[0xF3, 0xA5],
    )
}

/// `STOSD`: store EAX to `[EDI]`.
pub fn stos() -> Instruction {
    build(
        Decoded::new(Opcode::Stos, 1).with_flags(EFlags::empty(), EFlags::empty(), EFlags::DF),
        &[0xAB],
    )
}

/// `REP STOSD`.
pub fn rep_stos() -> Instruction {
    build(
        Decoded::new(Opcode::Stos, 2)
            .with_prefixes(Prefixes::REP)
            .with_flags(EFlags::empty(), EFlags::empty(), EFlags::DF),
        &[0xF3, 0xAB],
    )
}

/// `LAHF`: load the status flags into AH.
pub fn lahf() -> Instruction {
    build(
        Decoded::new(Opcode::Lahf, 1).with_flags(
            EFlags::empty(),
            EFlags::empty(),
            EFlags::SF | EFlags::ZF | EFlags::AF | EFlags::PF | EFlags::CF,
        ),
        &[0x9F],
    )
}

/// `SAHF`: store AH into the status flags.
pub fn sahf() -> Instruction {
    build(
        Decoded::new(Opcode::Sahf, 1).with_flags(
            EFlags::SF | EFlags::ZF | EFlags::AF | EFlags::PF | EFlags::CF,
            EFlags::empty(),
            EFlags::empty(),
        ),
        &[0x9E],
    )
}

/// `CDQ`: sign-extend EAX into EDX:EAX.
pub fn cdq() -> Instruction {
    build(Decoded::new(Opcode::Cdq, 1), &[0x99])
}

/// `CWD`: sign-extend AX into DX:AX.
pub fn cwd() -> Instruction {
    build(Decoded::new(Opcode::Cwd, 2), &[0x66, 0x99])
}

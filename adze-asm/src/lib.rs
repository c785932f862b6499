//! An x86-32 instruction assembler.
//!
//! The crate models registers, immediates, displacements, and memory
//! operands, and encodes a practical subset of the IA-32 instruction set.
//! Displacements and immediates may carry an opaque reference token; the
//! assembler reports the byte offset of every such token alongside the
//! encoded bytes, so that a rewriter can rebind symbolic references after
//! the encoding choice has been made.

#![warn(missing_docs)]

mod assembler;
mod cond;
mod error;
mod operand;
mod register;
mod value;

pub use assembler::{
    Add, And, Assembler, Call, Cmp, Imul, InstructionSerializer, Jmp, Mov, MovFs, Or, Pop, Push,
    Sub, Test, Xchg, Xor, LONG_BRANCH_OPCODE_SIZE, LONG_BRANCH_SIZE, LONG_JUMP_OPCODE_SIZE,
    LONG_JUMP_SIZE, MAX_INSTRUCTION_LENGTH, SHORT_BRANCH_OPCODE_SIZE, SHORT_BRANCH_SIZE,
    SHORT_JUMP_OPCODE_SIZE, SHORT_JUMP_SIZE,
};
pub use cond::{
    ConditionCode, LoopCode, CARRY, NOT_CARRY, NOT_SIGN, NOT_ZERO, SIGN, ZERO,
};
pub use error::Error;
pub use operand::{Operand, ScaleFactor};
pub use register::{
    Register16, Register32, Register8, RegisterId, RegisterSize, AH, AL, AX, BH, BL, BP, BX, CH,
    CL, CX, DH, DI, DL, DX, EAX, EBP, EBX, ECX, EDI, EDX, ESI, ESP, REGISTERS_16, REGISTERS_32,
    REGISTERS_8, SI, SP,
};
pub use value::{Displacement, Immediate, Value, ValueSize};

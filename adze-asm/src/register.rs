//! General purpose x86 register identifiers.
//!
//! The identifier enum is laid out so that the low three bits of the ordinal
//! are the machine code used in ModR/M and SIB bytes, and so that the three
//! size classes occupy three consecutive blocks of eight: byte registers
//! first, then word registers, then dword registers.

use core::fmt;

/// Operand and register widths.
///
/// The discriminants double as the width in bits. `None` is only meaningful
/// for values (an immediate or displacement that is absent).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum RegisterSize {
    /// No width; used by empty values.
    #[default]
    None = 0,
    /// 8 bits.
    Size8 = 8,
    /// 16 bits.
    Size16 = 16,
    /// 32 bits.
    Size32 = 32,
}

impl RegisterSize {
    /// The width in bits.
    pub const fn bits(self) -> u32 {
        self as u32
    }

    /// The width in bytes.
    pub const fn bytes(self) -> u32 {
        self as u32 / 8
    }
}

/// A unique identifier for each register at each width.
///
/// The lower 3 bits of the discriminant are the register code used in ModR/M
/// and SIB encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum RegisterId {
    /// Low byte of EAX.
    Al = 0,
    /// Low byte of ECX.
    Cl = 1,
    /// Low byte of EDX.
    Dl = 2,
    /// Low byte of EBX.
    Bl = 3,
    /// High byte of AX.
    Ah = 4,
    /// High byte of CX.
    Ch = 5,
    /// High byte of DX.
    Dh = 6,
    /// High byte of BX.
    Bh = 7,
    /// Low word of EAX.
    Ax = 8,
    /// Low word of ECX.
    Cx = 9,
    /// Low word of EDX.
    Dx = 10,
    /// Low word of EBX.
    Bx = 11,
    /// Low word of ESP.
    Sp = 12,
    /// Low word of EBP.
    Bp = 13,
    /// Low word of ESI.
    Si = 14,
    /// Low word of EDI.
    Di = 15,
    /// Accumulator.
    Eax = 16,
    /// Counter.
    Ecx = 17,
    /// Data.
    Edx = 18,
    /// Base.
    Ebx = 19,
    /// Stack pointer.
    Esp = 20,
    /// Frame pointer.
    Ebp = 21,
    /// Source index.
    Esi = 22,
    /// Destination index.
    Edi = 23,
}

impl RegisterId {
    /// Total number of register identifiers.
    pub const COUNT: usize = 24;

    /// The 3-bit code used for this register in ModR/M and SIB bytes.
    ///
    /// The code is not unique; registers of different widths share codes.
    pub const fn code(self) -> u8 {
        self as u8 & 0x07
    }

    /// The width of the register.
    pub const fn size(self) -> RegisterSize {
        match (self as u8) >> 3 {
            0 => RegisterSize::Size8,
            1 => RegisterSize::Size16,
            _ => RegisterSize::Size32,
        }
    }
}

impl TryFrom<u8> for RegisterId {
    type Error = crate::Error;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        use RegisterId::*;
        const TABLE: [RegisterId; RegisterId::COUNT] = [
            Al, Cl, Dl, Bl, Ah, Ch, Dh, Bh, Ax, Cx, Dx, Bx, Sp, Bp, Si, Di, Eax, Ecx, Edx, Ebx,
            Esp, Ebp, Esi, Edi,
        ];
        TABLE
            .get(id as usize)
            .copied()
            .ok_or(crate::Error::InvalidOperand("register id out of range"))
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = format!("{self:?}");
        write!(f, "{}", name.to_lowercase())
    }
}

macro_rules! sized_register {
    ($(#[$docs:meta])* $name:ident, $size:ident) => {
        $(#[$docs])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $name(RegisterId);

        impl $name {
            /// The unique identifier of this register.
            pub const fn id(self) -> RegisterId {
                self.0
            }

            /// The 3-bit ModR/M and SIB code of this register.
            pub const fn code(self) -> u8 {
                self.0.code()
            }

            /// The width of this register.
            pub const fn size(self) -> RegisterSize {
                RegisterSize::$size
            }
        }

        impl From<$name> for RegisterId {
            fn from(reg: $name) -> RegisterId {
                reg.id()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

sized_register! {
    /// A byte-wide register. The type guarantees the width so that assembler
    /// methods taking a `Register8` cannot receive a wider register.
    Register8, Size8
}
sized_register! {
    /// A word-wide register.
    Register16, Size16
}
sized_register! {
    /// A dword-wide register.
    Register32, Size32
}

/// Low byte of EAX.
pub const AL: Register8 = Register8(RegisterId::Al);
/// Low byte of ECX.
pub const CL: Register8 = Register8(RegisterId::Cl);
/// Low byte of EDX.
pub const DL: Register8 = Register8(RegisterId::Dl);
/// Low byte of EBX.
pub const BL: Register8 = Register8(RegisterId::Bl);
/// High byte of AX.
pub const AH: Register8 = Register8(RegisterId::Ah);
/// High byte of CX.
pub const CH: Register8 = Register8(RegisterId::Ch);
/// High byte of DX.
pub const DH: Register8 = Register8(RegisterId::Dh);
/// High byte of BX.
pub const BH: Register8 = Register8(RegisterId::Bh);

/// Low word of EAX.
pub const AX: Register16 = Register16(RegisterId::Ax);
/// Low word of ECX.
pub const CX: Register16 = Register16(RegisterId::Cx);
/// Low word of EDX.
pub const DX: Register16 = Register16(RegisterId::Dx);
/// Low word of EBX.
pub const BX: Register16 = Register16(RegisterId::Bx);
/// Low word of ESP.
pub const SP: Register16 = Register16(RegisterId::Sp);
/// Low word of EBP.
pub const BP: Register16 = Register16(RegisterId::Bp);
/// Low word of ESI.
pub const SI: Register16 = Register16(RegisterId::Si);
/// Low word of EDI.
pub const DI: Register16 = Register16(RegisterId::Di);

/// Accumulator.
pub const EAX: Register32 = Register32(RegisterId::Eax);
/// Counter.
pub const ECX: Register32 = Register32(RegisterId::Ecx);
/// Data.
pub const EDX: Register32 = Register32(RegisterId::Edx);
/// Base.
pub const EBX: Register32 = Register32(RegisterId::Ebx);
/// Stack pointer.
pub const ESP: Register32 = Register32(RegisterId::Esp);
/// Frame pointer.
pub const EBP: Register32 = Register32(RegisterId::Ebp);
/// Source index.
pub const ESI: Register32 = Register32(RegisterId::Esi);
/// Destination index.
pub const EDI: Register32 = Register32(RegisterId::Edi);

/// All byte registers, in encoding order.
pub const REGISTERS_8: [Register8; 8] = [AL, CL, DL, BL, AH, CH, DH, BH];
/// All word registers, in encoding order.
pub const REGISTERS_16: [Register16; 8] = [AX, CX, DX, BX, SP, BP, SI, DI];
/// All dword registers, in encoding order.
pub const REGISTERS_32: [Register32; 8] = [EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI];

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn identifiers_partition_into_size_classes() {
        for (ordinal, id) in RegisterId::iter().enumerate() {
            assert_eq!(ordinal as u8, id as u8);
            let expected = match ordinal / 8 {
                0 => RegisterSize::Size8,
                1 => RegisterSize::Size16,
                _ => RegisterSize::Size32,
            };
            assert_eq!(expected, id.size());
            assert_eq!(ordinal as u8 & 0x07, id.code());
            assert_eq!(Ok(id), RegisterId::try_from(ordinal as u8));
        }
        assert!(RegisterId::try_from(RegisterId::COUNT as u8).is_err());
    }

    #[test]
    fn slices_cover_each_class_in_encoding_order() {
        for (code, reg) in REGISTERS_8.iter().enumerate() {
            assert_eq!(code as u8, reg.code());
            assert_eq!(RegisterSize::Size8, reg.size());
        }
        for (code, reg) in REGISTERS_16.iter().enumerate() {
            assert_eq!(code as u8, reg.code());
            assert_eq!(RegisterSize::Size16, reg.size());
        }
        for (code, reg) in REGISTERS_32.iter().enumerate() {
            assert_eq!(code as u8, reg.code());
            assert_eq!(RegisterSize::Size32, reg.size());
        }
    }

    #[test]
    fn display_uses_conventional_names() {
        assert_eq!("eax", EAX.to_string());
        assert_eq!("bh", BH.to_string());
        assert_eq!("si", SI.to_string());
    }
}

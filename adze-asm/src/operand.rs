//! Memory operands.
//!
//! An operand implies indirection to memory through one of the IA-32
//! addressing modes: `[base]`, `[base + disp]`, `[disp32]`,
//! `[base + index * scale]`, `[base + index * scale + disp]`, or
//! `[index * scale + disp32]`. All address computations are 32 bits wide.

use crate::register::{Register32, ESP};
use crate::value::{Displacement, ValueSize};
use crate::Error;

/// Scaling applied to the index register. The discriminants match the
/// scale field of the SIB byte.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ScaleFactor {
    /// Multiply the index by one.
    #[default]
    Times1 = 0,
    /// Multiply the index by two.
    Times2 = 1,
    /// Multiply the index by four.
    Times4 = 2,
    /// Multiply the index by eight.
    Times8 = 3,
}

/// A memory operand.
///
/// Structural rules are enforced at construction: ESP can never serve as
/// the index register, and modes without a base register require an
/// explicit displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Operand<R = ()> {
    base: Option<Register32>,
    index: Option<Register32>,
    scale: ScaleFactor,
    displacement: Displacement<R>,
}

impl<R> Operand<R> {
    /// The register-indirect mode `[base]`.
    pub fn with_base(base: Register32) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: ScaleFactor::Times1,
            displacement: Displacement::default(),
        }
    }

    /// The register-indirect-with-displacement mode `[base + disp]`.
    pub fn with_base_displacement(base: Register32, displacement: Displacement<R>) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: ScaleFactor::Times1,
            displacement,
        }
    }

    /// The displacement-only mode `[disp32]`.
    pub fn with_displacement(displacement: Displacement<R>) -> Result<Self, Error> {
        if matches!(displacement.size(), ValueSize::None) {
            return Err(Error::InvalidOperand(
                "displacement-only mode requires an explicit displacement",
            ));
        }
        Ok(Self {
            base: None,
            index: None,
            scale: ScaleFactor::Times1,
            displacement,
        })
    }

    /// The `[base + index * scale]` mode.
    pub fn with_base_index(
        base: Register32,
        index: Register32,
        scale: ScaleFactor,
    ) -> Result<Self, Error> {
        Self::check_index(index)?;
        Ok(Self {
            base: Some(base),
            index: Some(index),
            scale,
            displacement: Displacement::default(),
        })
    }

    /// The full `[base + index * scale + disp]` mode.
    pub fn with_base_index_displacement(
        base: Register32,
        index: Register32,
        scale: ScaleFactor,
        displacement: Displacement<R>,
    ) -> Result<Self, Error> {
        Self::check_index(index)?;
        if matches!(displacement.size(), ValueSize::None) {
            return Err(Error::InvalidOperand(
                "base-index-displacement mode requires an explicit displacement",
            ));
        }
        Ok(Self {
            base: Some(base),
            index: Some(index),
            scale,
            displacement,
        })
    }

    /// The base-less `[index * scale + disp32]` mode.
    ///
    /// This mode always encodes a 32-bit displacement, even when the given
    /// value is zero.
    pub fn with_index_displacement(
        index: Register32,
        scale: ScaleFactor,
        displacement: Displacement<R>,
    ) -> Result<Self, Error> {
        Self::check_index(index)?;
        if matches!(displacement.size(), ValueSize::None) {
            return Err(Error::InvalidOperand(
                "index-displacement mode requires an explicit displacement",
            ));
        }
        Ok(Self {
            base: None,
            index: Some(index),
            scale,
            displacement,
        })
    }

    fn check_index(index: Register32) -> Result<(), Error> {
        if index == ESP {
            return Err(Error::InvalidOperand("esp cannot be an index register"));
        }
        Ok(())
    }

    /// The base register, if any.
    pub const fn base(&self) -> Option<Register32> {
        self.base
    }

    /// The index register, if any.
    pub const fn index(&self) -> Option<Register32> {
        self.index
    }

    /// The scale applied to the index register. `Times1` when no index
    /// register is present.
    pub const fn scale(&self) -> ScaleFactor {
        self.scale
    }

    /// The displacement, possibly empty.
    pub const fn displacement(&self) -> &Displacement<R> {
        &self.displacement
    }

    /// True iff the operand specifies neither a base nor an index register.
    pub const fn is_displacement_only(&self) -> bool {
        self.base.is_none()
            && self.index.is_none()
            && !matches!(self.displacement.size(), ValueSize::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{EBP, ECX, EDI};

    #[test]
    fn accessors_reflect_the_mode() {
        let op: Operand = Operand::with_base(EDI);
        assert_eq!(Some(EDI), op.base());
        assert_eq!(None, op.index());
        assert_eq!(ScaleFactor::Times1, op.scale());
        assert_eq!(ValueSize::None, op.displacement().size());
        assert!(!op.is_displacement_only());

        let op: Operand =
            Operand::with_displacement(Displacement::new(0xCAFE_BABE, ValueSize::Size32)).unwrap();
        assert_eq!(None, op.base());
        assert!(op.is_displacement_only());

        let op: Operand = Operand::with_base_index_displacement(
            EBP,
            ECX,
            ScaleFactor::Times2,
            Displacement::new(0xCA, ValueSize::Size8),
        )
        .unwrap();
        assert_eq!(Some(EBP), op.base());
        assert_eq!(Some(ECX), op.index());
        assert_eq!(ScaleFactor::Times2, op.scale());
        assert_eq!(0xCA, op.displacement().value());
    }

    #[test]
    fn esp_is_rejected_as_index() {
        assert!(Operand::<()>::with_base_index(EBP, ESP, ScaleFactor::Times4).is_err());
        assert!(Operand::<()>::with_base_index_displacement(
            EBP,
            ESP,
            ScaleFactor::Times4,
            Displacement::new(0, ValueSize::Size32),
        )
        .is_err());
        assert!(Operand::<()>::with_index_displacement(
            ESP,
            ScaleFactor::Times1,
            Displacement::new(0, ValueSize::Size32),
        )
        .is_err());
    }

    #[test]
    fn baseless_modes_require_a_displacement() {
        assert!(Operand::<()>::with_displacement(Displacement::default()).is_err());
        assert!(
            Operand::<()>::with_index_displacement(ECX, ScaleFactor::Times1, Displacement::default())
                .is_err()
        );
    }
}

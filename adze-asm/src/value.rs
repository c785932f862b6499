//! Immediates and displacements.
//!
//! Both roles share one representation: a 32-bit number, an explicit width,
//! and an optional reference token that survives encoding. The token type is
//! a parameter so that callers can thread their own symbolic reference
//! handles through the assembler; it defaults to `()` for plain numeric use.

use crate::register::RegisterSize;
use crate::Error;

/// Width of an explicit value. Shares its representation with register
/// widths; `None` denotes an absent value.
pub type ValueSize = RegisterSize;

/// An explicit value, either an immediate or a displacement.
///
/// Two values are equal iff the number, the width, and the reference token
/// all match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Value<R = ()> {
    value: u32,
    size: ValueSize,
    reference: Option<R>,
}

impl<R> Value<R> {
    /// Creates a value without a reference token.
    pub const fn new(value: u32, size: ValueSize) -> Self {
        Self {
            value,
            size,
            reference: None,
        }
    }

    /// Creates a value carrying a reference token.
    ///
    /// A 16-bit width is rejected: no x86-32 addressing mode accepts a
    /// 16-bit symbolic reference.
    pub fn with_reference(value: u32, size: ValueSize, reference: R) -> Result<Self, Error> {
        if matches!(size, ValueSize::Size16) {
            return Err(Error::InvalidOperand(
                "a 16-bit value cannot carry a reference",
            ));
        }
        Ok(Self {
            value,
            size,
            reference: Some(reference),
        })
    }

    /// The numeric value.
    pub const fn value(&self) -> u32 {
        self.value
    }

    /// The width of the value.
    pub const fn size(&self) -> ValueSize {
        self.size
    }

    /// The reference token, if any.
    pub const fn reference(&self) -> Option<&R> {
        self.reference.as_ref()
    }
}

impl<R> Default for Value<R> {
    fn default() -> Self {
        Self::new(0, ValueSize::None)
    }
}

macro_rules! value_role {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $name<R = ()>(Value<R>);

        impl<R> $name<R> {
            /// Creates a value without a reference token.
            pub const fn new(value: u32, size: ValueSize) -> Self {
                Self(Value::new(value, size))
            }

            /// Creates a value carrying a reference token. Rejects a 16-bit
            /// width, which no addressing mode can host.
            pub fn with_reference(
                value: u32,
                size: ValueSize,
                reference: R,
            ) -> Result<Self, Error> {
                Value::with_reference(value, size, reference).map(Self)
            }

            /// The numeric value.
            pub const fn value(&self) -> u32 {
                self.0.value()
            }

            /// The width of the value.
            pub const fn size(&self) -> ValueSize {
                self.0.size()
            }

            /// The reference token, if any.
            pub const fn reference(&self) -> Option<&R> {
                self.0.reference()
            }

            /// The underlying role-free value.
            pub const fn as_value(&self) -> &Value<R> {
                &self.0
            }
        }

        impl<R> Default for $name<R> {
            fn default() -> Self {
                Self(Value::default())
            }
        }

        impl<R> From<Value<R>> for $name<R> {
            fn from(value: Value<R>) -> Self {
                Self(value)
            }
        }
    };
}

value_role! {
    /// An immediate operand. Immediates and displacements behave
    /// near-identically but are semantically distinct; the separate types
    /// keep them from being swapped at an assembler call site.
    Immediate
}
value_role! {
    /// A displacement inside a memory operand.
    Displacement
}

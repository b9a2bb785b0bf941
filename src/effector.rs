//! Effector ABI: built-in effectors, the host effector trait, and the
//! invocation context
//!
//! Built-ins are a closed enum dispatched inline by the transductor so the
//! hot path pays no virtual call; host-contributed effectors implement
//! [`Effector`] and occupy ordinals after the built-in prefix.

use std::fmt;
use std::io::{self, Write};

use crate::consts::Effect;
use crate::error::EffectorError;
use crate::target::Target;
use crate::token::Token;
use crate::transductor::fields::Fields;

/// The fixed built-in effector prefix. Ordinals are part of the model
/// contract and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Builtin {
    /// Raise the `nul` signal.
    Nul = 0,
    /// Advance silently.
    Nil = 1,
    /// Append the current byte, a literal, or a field to the selected field.
    Paste = 2,
    /// Change the selected field.
    Select = 3,
    /// Append the selected field's content to another field.
    Copy = 4,
    /// Move the selected field's content to another field.
    Cut = 5,
    /// Truncate a field, or all fields.
    Clear = 6,
    /// Push a field's content (or a literal) as a new input frame.
    In = 7,
    /// Write bytes to the bound output sink.
    Out = 8,
    /// Set the input mark.
    Mark = 9,
    /// Rewind input to the mark.
    Reset = 10,
    /// Push a transducer onto the transducer stack.
    Start = 11,
    /// Pause the transduction.
    Pause = 12,
    /// Pop the current transducer.
    Stop = 13,
    /// Arm or decrement the countdown on the current transducer frame.
    Count = 14,
    /// Raise a signal.
    Signal = 15,
    /// Fast-forward over a byte set.
    Msum = 16,
    /// Match a byte sequence verbatim.
    Mproduct = 17,
    /// Fast-forward until a byte is seen.
    Mscan = 18,
}

/// Count of built-in effectors; host effectors start at this ordinal.
pub const BUILTIN_EFFECTOR_COUNT: usize = 19;

impl Builtin {
    /// The effector's ordinal in the model's effector space.
    pub const fn ordinal(self) -> usize {
        self as usize
    }

    /// The effector's name as pattern text spells it.
    pub const fn name(self) -> &'static [u8] {
        match self {
            Builtin::Nul => b"nul",
            Builtin::Nil => b"nil",
            Builtin::Paste => b"paste",
            Builtin::Select => b"select",
            Builtin::Copy => b"copy",
            Builtin::Cut => b"cut",
            Builtin::Clear => b"clear",
            Builtin::In => b"in",
            Builtin::Out => b"out",
            Builtin::Mark => b"mark",
            Builtin::Reset => b"reset",
            Builtin::Start => b"start",
            Builtin::Pause => b"pause",
            Builtin::Stop => b"stop",
            Builtin::Count => b"count",
            Builtin::Signal => b"signal",
            Builtin::Msum => b"msum",
            Builtin::Mproduct => b"mproduct",
            Builtin::Mscan => b"mscan",
        }
    }

    /// Recover a built-in from its ordinal.
    pub const fn from_ordinal(ordinal: usize) -> Option<Self> {
        match ordinal {
            0 => Some(Builtin::Nul),
            1 => Some(Builtin::Nil),
            2 => Some(Builtin::Paste),
            3 => Some(Builtin::Select),
            4 => Some(Builtin::Copy),
            5 => Some(Builtin::Cut),
            6 => Some(Builtin::Clear),
            7 => Some(Builtin::In),
            8 => Some(Builtin::Out),
            9 => Some(Builtin::Mark),
            10 => Some(Builtin::Reset),
            11 => Some(Builtin::Start),
            12 => Some(Builtin::Pause),
            13 => Some(Builtin::Stop),
            14 => Some(Builtin::Count),
            15 => Some(Builtin::Signal),
            16 => Some(Builtin::Msum),
            17 => Some(Builtin::Mproduct),
            18 => Some(Builtin::Mscan),
            _ => None,
        }
    }

    /// Look a built-in up by name.
    pub fn from_name(name: &[u8]) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|b| b.name() == name)
    }
}

/// View of transductor state handed to host effectors.
///
/// Exposes the field set, the frame-local field selection, the output
/// sink, and the symbol whose transition triggered the invocation.
pub struct EffectorContext<'a> {
    pub(crate) fields: &'a mut Fields,
    pub(crate) selected: &'a mut usize,
    pub(crate) output: &'a mut Option<Box<dyn io::Write>>,
    pub(crate) symbol: usize,
}

impl<'a> EffectorContext<'a> {
    /// The symbol ordinal that triggered this invocation.
    pub fn symbol(&self) -> usize {
        self.symbol
    }

    /// Ordinal of the selected field.
    pub fn selected(&self) -> usize {
        *self.selected
    }

    /// Change the field selection.
    pub fn select(&mut self, field: usize) {
        *self.selected = field;
    }

    /// Content of a field, if the ordinal is in range.
    pub fn field(&self, field: usize) -> Option<&[u8]> {
        self.fields.get(field)
    }

    /// Append bytes to the selected field.
    pub fn paste(&mut self, bytes: &[u8]) {
        self.fields.append(*self.selected, bytes);
    }

    /// Write bytes to the bound output sink, if any.
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.output {
            Some(sink) => sink.write_all(bytes),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for EffectorContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectorContext")
            .field("selected", &self.selected)
            .field("symbol", &self.symbol)
            .finish_non_exhaustive()
    }
}

/// A host-contributed effector bound to a target of type `T`.
///
/// Scalar effectors implement `invoke` only; parameterised effectors also
/// implement the three parameter entry points. Parameter ordinals are
/// assigned by the model and passed back verbatim at invocation time.
pub trait Effector<T: Target> {
    /// The name patterns use to reference this effector.
    fn name(&self) -> &[u8];

    /// Scalar invocation.
    fn invoke(&mut self, target: &mut T, ctx: &mut EffectorContext<'_>)
        -> Result<Effect, EffectorError>;

    /// Reserve storage for `parameters` pre-compiled parameters.
    fn allocate_parameters(&mut self, _parameters: usize) {}

    /// Compile the token list for parameter `ordinal`.
    fn compile_parameter(
        &mut self,
        _ordinal: usize,
        _tokens: &[Token],
    ) -> Result<(), EffectorError> {
        Err(EffectorError::NotParameterised(
            String::from_utf8_lossy(self.name()).into_owned(),
        ))
    }

    /// Parameterised invocation with a previously compiled parameter.
    fn invoke_parameterised(
        &mut self,
        _target: &mut T,
        _ctx: &mut EffectorContext<'_>,
        _parameter: usize,
    ) -> Result<Effect, EffectorError> {
        Err(EffectorError::NotParameterised(
            String::from_utf8_lossy(self.name()).into_owned(),
        ))
    }

    /// Render parameter `ordinal` for diagnostics.
    fn show_parameter(&self, ordinal: usize) -> String {
        format!("{}[{ordinal}]", String::from_utf8_lossy(self.name()))
    }
}

/// One piece of a `paste`, `out` or `in` parameter: literal bytes or a
/// field dereferenced at invocation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Piece {
    Bytes(Box<[u8]>),
    Field(usize),
}

/// Scope of a `clear` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClearScope {
    One(usize),
    All,
}

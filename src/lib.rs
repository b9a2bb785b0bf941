//! Runtime and compiler for byte-oriented finite-state transduction
//! patterns.
//!
//! Patterns expressed as regular relations over three tapes — input bytes
//! or signals, effectors, and effector parameters — are compiled off-line
//! into a binary model; a [`transductor::Transductor`] then runs a stack
//! of compiled transducers against streaming byte input, pasting bytes
//! into fields and driving effectors on a host [`target::Target`].

#![warn(missing_docs)]

pub mod automaton;
pub mod bytes;
pub mod compiler;
pub mod consts;
pub mod effector;
pub mod error;
pub mod model;
pub mod target;
pub mod token;
pub mod transducer;
pub mod transductor;
pub mod util;

pub mod prelude {
    //! Re-exports covering the common compile-bind-run cycle.

    pub use crate::compiler::{Assembler, ModelCompiler};
    pub use crate::consts::{
        Effect, EFFECT_NONE, EFFECT_PAUSE, EFFECT_POP_INPUT, EFFECT_POP_TRANSDUCER,
        EFFECT_RESET_INPUT, EFFECT_SIGNAL, SIGNAL_BASE, SIGNAL_EOL, SIGNAL_EOS, SIGNAL_NIL,
        SIGNAL_NUL,
    };
    pub use crate::effector::{Builtin, Effector, EffectorContext};
    pub use crate::error::{
        BindError, CompileError, CompileErrors, EffectorError, ModelError, RunError,
    };
    pub use crate::model::Model;
    pub use crate::target::{BaseTarget, Target};
    pub use crate::transducer::Transducer;
    pub use crate::transductor::{Metrics, Status, Transductor};
}

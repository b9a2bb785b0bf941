//! Error types for model construction, binding and transduction

use std::fmt;
use std::io;

use thiserror::Error;

/// Model load or save failure. Always fatal for the operation.
#[derive(Debug, Error)]
pub enum ModelError {
    /// I/O and OS related errors on the model file.
    #[error("model file I/O failure: {0}")]
    Io(#[from] io::Error),
    /// The model file was produced by an incompatible engine version.
    #[error("model version mismatch: expected {expected:?}, found {found:?}")]
    VersionMismatch {
        /// Version this engine writes and accepts.
        expected: String,
        /// Version recorded in the file.
        found: String,
    },
    /// The model was compiled for a different target class.
    #[error("model was compiled for target {model:?}, not {requested:?}")]
    TargetMismatch {
        /// Target name recorded in the model.
        model: String,
        /// Target name presented at bind time.
        requested: String,
    },
    /// An ordinal recorded in the model does not resolve.
    #[error("unresolved {domain} ordinal {ordinal}")]
    UnresolvedOrdinal {
        /// Ordinal space the lookup failed in.
        domain: &'static str,
        /// The failing ordinal.
        ordinal: usize,
    },
    /// A symbolic name does not resolve against the model's ordinal maps.
    #[error("unknown {domain} {name:?}")]
    UnknownSymbol {
        /// Ordinal space the lookup failed in.
        domain: &'static str,
        /// The failing name.
        name: String,
    },
    /// The model file ended inside a structure.
    #[error("model file truncated reading {context}")]
    Truncated {
        /// Structure being decoded when input ran out.
        context: &'static str,
    },
    /// The model file violates the format contract.
    #[error("malformed model file: {0}")]
    Malformed(String),
}

/// Failure binding a loaded model to a live target instance. Fatal for
/// that target.
#[derive(Debug, Error)]
pub enum BindError {
    /// The model references an effector the target does not provide.
    #[error("effector {0:?} is not present on the target")]
    MissingEffector(String),
    /// A pre-compiled parameter was rejected by its effector.
    #[error("parameter {parameter} of effector {effector:?} failed to compile")]
    Parameter {
        /// Effector whose compile callback failed.
        effector: String,
        /// Parameter ordinal within that effector.
        parameter: usize,
        /// Underlying effector failure.
        #[source]
        source: EffectorError,
    },
    /// Model-level failure surfaced while binding.
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// A single compilation defect. Collected, not immediately fatal; the
/// build fails if any were recorded.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The automaton header line is not `INR<tapes> states symbols transitions`.
    #[error("automaton {automaton:?}: malformed header: {reason}")]
    Header {
        /// Automaton being parsed.
        automaton: String,
        /// What was wrong with the header.
        reason: String,
    },
    /// The automaton transition text is malformed.
    #[error("automaton {automaton:?}: malformed at byte {offset}: {reason}")]
    Malformed {
        /// Automaton being parsed.
        automaton: String,
        /// Byte offset of the defect.
        offset: usize,
        /// What was wrong.
        reason: String,
    },
    /// Two transitions from one state on one symbol disagree on target or
    /// effect.
    #[error("automaton {automaton:?}: duplicate transitions from state {state} on symbol {symbol} with distinct actions")]
    DuplicateTransition {
        /// Automaton being compiled.
        automaton: String,
        /// Source state of the conflicting transitions.
        state: u32,
        /// Symbol ordinal the transitions share.
        symbol: usize,
    },
    /// An effector chain branches, so invocation order is undefined.
    #[error("automaton {automaton:?}: ambiguous effector chain leaving state {state}")]
    AmbiguousChain {
        /// Automaton being compiled.
        automaton: String,
        /// State where the chain forks.
        state: u32,
    },
    /// An effector named on tape 1 is not registered.
    #[error("automaton {automaton:?}: unknown effector {effector:?}")]
    UnknownEffector {
        /// Automaton being compiled.
        automaton: String,
        /// The unrecognised effector name.
        effector: String,
    },
    /// A `@transducer` parameter names a transducer never compiled into
    /// the model.
    #[error("transducer {0:?} is referenced but was never compiled")]
    UnresolvedTransducer(String),
    /// An effector parameter is structurally invalid.
    #[error("automaton {automaton:?}: bad parameter for effector {effector:?}: {reason}")]
    BadParameter {
        /// Automaton being compiled.
        automaton: String,
        /// Effector the parameter belongs to.
        effector: String,
        /// What was wrong.
        reason: String,
    },
    /// Model codec failure while saving the compiled model.
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// The accumulated defects of a failed build.
#[derive(Debug, Default)]
pub struct CompileErrors(Vec<CompileError>);

impl CompileErrors {
    /// Record a defect.
    pub fn push(&mut self, error: CompileError) {
        self.0.push(error);
    }

    /// Flag whether any defect was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Count of recorded defects.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The recorded defects, in discovery order.
    pub fn errors(&self) -> &[CompileError] {
        &self.0
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "compilation failed with {} error(s):", self.0.len())?;
        for error in &self.0 {
            writeln!(f, "  {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}

impl From<CompileError> for CompileErrors {
    fn from(error: CompileError) -> Self {
        Self(vec![error])
    }
}

impl From<ModelError> for CompileErrors {
    fn from(error: ModelError) -> Self {
        Self(vec![CompileError::Model(error)])
    }
}

/// Failure raised by an effector invocation or parameter compilation.
#[derive(Debug, Error)]
pub enum EffectorError {
    /// A parameterised invocation reached an effector with no parameters.
    #[error("effector {0:?} takes no parameters")]
    NotParameterised(String),
    /// A scalar invocation reached an effector that requires a parameter.
    #[error("effector {0:?} requires a parameter")]
    RequiresParameter(String),
    /// A parameter token list does not fit the effector's contract.
    #[error("invalid parameter for effector {effector:?}: {reason}")]
    BadParameter {
        /// The rejecting effector.
        effector: String,
        /// What was wrong with the tokens.
        reason: String,
    },
    /// I/O failure, typically from the `out` sink.
    #[error("effector I/O failure: {0}")]
    Io(#[from] io::Error),
    /// Host-defined effector failure.
    #[error("{0}")]
    Failed(String),
}

/// Runtime transduction failure. Unwinds out of `run` with the partially
/// consumed input left on the stack for inspection.
#[derive(Debug, Error)]
pub enum RunError {
    /// Input was rejected and the injected `nul` signal was rejected too.
    #[error("domain error in transducer {transducer:?}: state {state} rejects symbol {symbol:#x} and has no nul handler")]
    Domain {
        /// Transducer whose matrix rejected the input.
        transducer: String,
        /// Rejecting state ordinal.
        state: usize,
        /// The rejected symbol ordinal.
        symbol: usize,
    },
    /// An effector failed; the transduction cannot continue.
    #[error("effector {effector:?} failed")]
    Effector {
        /// The failing effector's name.
        effector: String,
        /// Underlying failure.
        #[source]
        source: EffectorError,
    },
    /// The transducer stack exceeded its depth guard.
    #[error("transducer stack overflow past {0} frames")]
    StackOverflow(usize),
    /// The input stack exceeded its depth guard.
    #[error("input stack overflow past {0} frames")]
    InputOverflow(usize),
    /// A lazily materialised transducer blob failed to load.
    #[error(transparent)]
    Model(#[from] ModelError),
}

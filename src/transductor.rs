//! [`Transductor`] implementation: the VM that runs a stack of compiled
//! transducers against streaming byte input

use std::io;
use std::sync::Arc;

use crate::bytes::Bytes;
use crate::consts::{MAX_INPUT_STACK_DEPTH, MAX_TRANSDUCER_STACK_DEPTH};
use crate::effector::{Builtin, ClearScope, Effector, Piece, BUILTIN_EFFECTOR_COUNT};
use crate::error::{BindError, EffectorError, ModelError, RunError};
use crate::model::Model;
use crate::target::Target;
use crate::token::{Token, TokenKind};
use crate::transducer::Transducer;

pub(crate) mod fields;
mod input;
mod run;

use fields::Fields;
use input::InputStack;

/// Execution status of a transductor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Status {
    /// No transducer is stacked; the transductor is inert.
    Stopped,
    /// Transducers are stacked and input is available.
    Runnable,
    /// An effector requested a pause; `run` will resume.
    Paused,
    /// The input stack is exhausted; push more input or stop.
    Waiting,
}

/// Counters accumulated across `run` calls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Metrics {
    /// Input symbols consumed, superinstruction fast-forwarding included.
    pub bytes: u64,
    /// Input buffers newly allocated because no retired buffer could be
    /// reused.
    pub allocated: u64,
    /// Rejected symbols recovered by injecting `nul`, product mismatches
    /// included.
    pub traps: u64,
    /// `mscan` activations.
    pub scan: u64,
    /// `msum` activations.
    pub sum: u64,
    /// `mproduct` activations.
    pub product: u64,
    /// Fatal domain errors.
    pub errors: u64,
}

/// One frame of the transducer stack.
#[derive(Debug)]
struct TransducerFrame {
    transducer: Arc<Transducer>,
    /// Current state as a premultiplied matrix row base.
    row_base: usize,
    /// Armed countdown: remaining ticks and the signal raised at zero.
    countdown: (u64, usize),
    /// Frame-local field selection.
    selected: usize,
}

impl TransducerFrame {
    fn new(transducer: Arc<Transducer>) -> Self {
        Self {
            transducer,
            row_base: 0,
            countdown: (0, 0),
            selected: 0,
        }
    }
}

/// Pre-compiled parameters for the built-in effector prefix, indexed by
/// parameter ordinal per effector.
#[derive(Debug, Default)]
struct BuiltinParams {
    paste: Vec<Vec<Piece>>,
    select: Vec<usize>,
    copy: Vec<usize>,
    cut: Vec<usize>,
    clear: Vec<ClearScope>,
    input: Vec<Vec<Piece>>,
    out: Vec<Vec<Piece>>,
    start: Vec<usize>,
    count: Vec<(u64, usize)>,
    signal: Vec<usize>,
    msum: Vec<[u64; 4]>,
    mproduct: Vec<Box<[u8]>>,
    mscan: Vec<u8>,
}

/// Transduction VM.
///
/// A transductor owns its target, stacks and fields outright and shares
/// the loaded model by reference; any number of transductors can run
/// concurrently against one model as long as each has its own target.
pub struct Transductor<T: Target> {
    model: Arc<Model>,
    target: T,
    /// Host effectors by model ordinal; `None` marks a built-in slot.
    effectors: Vec<Option<Box<dyn Effector<T>>>>,
    params: BuiltinParams,
    fields: Fields,
    input: InputStack,
    stack: Vec<TransducerFrame>,
    output: Option<Box<dyn io::Write>>,
    status: Status,
    metrics: Metrics,
}

impl Model {
    /// Bind a target to this model, producing a transductor.
    ///
    /// Checks the target's name, matches the model's effector registry
    /// against the target's, and pre-compiles every effector parameter.
    pub fn transductor<T: Target>(
        self: &Arc<Self>,
        mut target: T,
    ) -> Result<Transductor<T>, BindError> {
        if target.name() != self.target_name() {
            return Err(BindError::Model(ModelError::TargetMismatch {
                model: self.target_name().to_owned(),
                requested: target.name().to_owned(),
            }));
        }

        let mut host: Vec<Box<dyn Effector<T>>> = target.effectors();
        let mut effectors: Vec<Option<Box<dyn Effector<T>>>> = Vec::new();
        for ordinal in 0..self.effector_count() {
            if ordinal < BUILTIN_EFFECTOR_COUNT {
                effectors.push(None);
                continue;
            }
            let name = &self.effector_names()[ordinal];
            let position = host
                .iter()
                .position(|e| e.name() == name.as_slice())
                .ok_or_else(|| BindError::MissingEffector(name.to_string_lossy()))?;
            effectors.push(Some(host.swap_remove(position)));
        }

        // host parameter compilation
        for (ordinal, slot) in effectors.iter_mut().enumerate() {
            let Some(effector) = slot else { continue };
            let Some(parameters) = self.parameters_for(ordinal) else {
                continue;
            };
            effector.allocate_parameters(parameters.len());
            for (parameter, raw_tokens) in parameters.iter().enumerate() {
                let tokens = resolve_tokens(self, raw_tokens).map_err(|source| {
                    BindError::Parameter {
                        effector: self.effector_name(ordinal),
                        parameter,
                        source,
                    }
                })?;
                effector
                    .compile_parameter(parameter, &tokens)
                    .map_err(|source| BindError::Parameter {
                        effector: self.effector_name(ordinal),
                        parameter,
                        source,
                    })?;
            }
        }

        let params = BuiltinParams::compile(self)?;
        let fields = Fields::new(self.field_count());

        Ok(Transductor {
            model: Arc::clone(self),
            target,
            effectors,
            params,
            fields,
            input: InputStack::new(),
            stack: Vec::new(),
            output: None,
            status: Status::Stopped,
            metrics: Metrics::default(),
        })
    }
}

impl<T: Target> Transductor<T> {
    /// Push a slice of stream input on top of the input stack.
    pub fn push(&mut self, data: Vec<u8>) -> Result<(), RunError> {
        self.input_guard()?;
        self.input.push(data);
        if self.status == Status::Waiting {
            self.status = Status::Runnable;
        }
        Ok(())
    }

    /// Inject a signal on top of the input stack.
    pub fn signal(&mut self, signal: usize) -> Result<(), RunError> {
        self.input_guard()?;
        self.input.push_signal(signal);
        if self.status == Status::Waiting {
            self.status = Status::Runnable;
        }
        Ok(())
    }

    /// Resolve a signal name against the model.
    pub fn signal_ordinal(&self, name: &[u8]) -> Option<usize> {
        self.model.signal_ordinal(name)
    }

    /// Load the named transducer and push it onto the transducer stack at
    /// state 0.
    pub fn start(&mut self, name: &str) -> Result<(), RunError> {
        let ordinal = self
            .model
            .transducer_ordinal(name.as_bytes())
            .ok_or_else(|| {
                RunError::Model(ModelError::UnknownSymbol {
                    domain: "transducer",
                    name: name.to_owned(),
                })
            })?;
        let transducer = self.model.transducer(ordinal)?;
        self.push_transducer(transducer)?;
        self.status = Status::Runnable;
        Ok(())
    }

    /// Bind the sink the `out` effector writes to.
    pub fn output<W: io::Write + 'static>(&mut self, sink: W) {
        self.output = Some(Box::new(sink));
    }

    /// Tear down both stacks; fields survive until the transductor drops.
    pub fn stop(&mut self) {
        self.stack.clear();
        self.input.clear();
        self.status = Status::Stopped;
    }

    /// Current execution status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Accumulated run counters.
    pub fn metrics(&self) -> Metrics {
        Metrics {
            allocated: self.input.allocated(),
            ..self.metrics
        }
    }

    /// The bound model.
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// The bound target.
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Mutable access to the bound target.
    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    /// Consume the transductor, returning its target.
    pub fn into_target(self) -> T {
        self.target
    }

    /// Content of a named field, for inspection between runs.
    pub fn field(&self, name: &[u8]) -> Option<&[u8]> {
        // the anonymous field answers to the empty name
        let ordinal = self.model.field_ordinal(name)?;
        self.fields.get(ordinal)
    }

    /// Count of unread symbols left on the input stack; after a fatal
    /// error this shows how far the transduction got.
    pub fn input_remaining(&self) -> usize {
        self.input.remaining()
    }

    /// Reclaim a retired input buffer, if one is free. A buffer is
    /// returned at most once and never while any live or archived frame
    /// still references it.
    pub fn recycle(&mut self) -> Option<Vec<u8>> {
        self.input.recycle()
    }

    /// Adjust the soft limit on the marked-frame archive.
    pub fn set_mark_limit(&mut self, frames: usize) {
        self.input.set_mark_limit(frames);
    }

    fn push_transducer(&mut self, transducer: Arc<Transducer>) -> Result<(), RunError> {
        if self.stack.len() >= MAX_TRANSDUCER_STACK_DEPTH {
            return Err(RunError::StackOverflow(MAX_TRANSDUCER_STACK_DEPTH));
        }
        self.stack.push(TransducerFrame::new(transducer));
        Ok(())
    }

    pub(crate) fn input_guard(&self) -> Result<(), RunError> {
        if self.input.depth() >= MAX_INPUT_STACK_DEPTH {
            return Err(RunError::InputOverflow(MAX_INPUT_STACK_DEPTH));
        }
        Ok(())
    }
}

impl<T: Target> std::fmt::Debug for Transductor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transductor")
            .field("target", &self.target.name())
            .field("status", &self.status)
            .field("stack", &self.stack.len())
            .field("input", &self.input.depth())
            .finish_non_exhaustive()
    }
}

fn resolve_tokens(model: &Model, raw: &[Bytes]) -> Result<Vec<Token>, EffectorError> {
    raw.iter()
        .map(|token| {
            model
                .resolve_token(token.as_slice())
                .map_err(|e| EffectorError::BadParameter {
                    effector: String::new(),
                    reason: e.to_string(),
                })
        })
        .collect()
}

impl BuiltinParams {
    /// Compile the model's parameter table for the built-in prefix.
    fn compile(model: &Model) -> Result<Self, BindError> {
        use strum::IntoEnumIterator;

        let mut params = Self::default();
        for builtin in Builtin::iter() {
            let Some(parameters) = model.parameters_for(builtin.ordinal()) else {
                continue;
            };
            for (ordinal, raw_tokens) in parameters.iter().enumerate() {
                params
                    .compile_one(model, builtin, raw_tokens)
                    .map_err(|source| BindError::Parameter {
                        effector: model.effector_name(builtin.ordinal()),
                        parameter: ordinal,
                        source,
                    })?;
            }
        }
        Ok(params)
    }

    fn compile_one(
        &mut self,
        model: &Model,
        builtin: Builtin,
        raw_tokens: &[Bytes],
    ) -> Result<(), EffectorError> {
        let bad = |reason: String| EffectorError::BadParameter {
            effector: String::from_utf8_lossy(builtin.name()).into_owned(),
            reason,
        };

        match builtin {
            Builtin::Paste => self.paste.push(pieces(model, builtin, raw_tokens)?),
            Builtin::In => self.input.push(pieces(model, builtin, raw_tokens)?),
            Builtin::Out => self.out.push(pieces(model, builtin, raw_tokens)?),
            Builtin::Select => self.select.push(field_ordinal(model, builtin, raw_tokens)?),
            Builtin::Copy => self.copy.push(field_ordinal(model, builtin, raw_tokens)?),
            Builtin::Cut => self.cut.push(field_ordinal(model, builtin, raw_tokens)?),
            Builtin::Clear => {
                let scope = match raw_tokens {
                    [token]
                        if matches!(
                            Token::classify(token.as_slice()),
                            (TokenKind::Field, b"*")
                        ) =>
                    {
                        ClearScope::All
                    }
                    _ => ClearScope::One(field_ordinal(model, builtin, raw_tokens)?),
                };
                self.clear.push(scope);
            }
            Builtin::Start => {
                let token = single(builtin, raw_tokens, TokenKind::Transducer, model)?;
                self.start.push(token.ordinal());
            }
            Builtin::Signal => {
                let token = single(builtin, raw_tokens, TokenKind::Signal, model)?;
                self.signal.push(token.ordinal());
            }
            Builtin::Count => {
                let [ticks, signal] = raw_tokens else {
                    return Err(bad(format!(
                        "expected a count and a signal, got {} tokens",
                        raw_tokens.len()
                    )));
                };
                let (kind, payload) = Token::classify(ticks.as_slice());
                if kind != TokenKind::Literal {
                    return Err(bad("countdown must be a decimal literal".to_owned()));
                }
                let ticks = std::str::from_utf8(payload)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| bad("countdown must be a decimal literal".to_owned()))?;
                let signal = resolve_one(model, builtin, signal)?;
                if signal.kind() != TokenKind::Signal {
                    return Err(bad("second token must be a signal".to_owned()));
                }
                self.count.push((ticks, signal.ordinal()));
            }
            Builtin::Msum => {
                let payload = literal_payload(builtin, raw_tokens)?;
                if payload.len() != 32 {
                    return Err(bad(format!(
                        "sum bitmap must be 32 bytes, got {}",
                        payload.len()
                    )));
                }
                let mut bitmap = [0u64; 4];
                for (word, chunk) in bitmap.iter_mut().zip(payload.chunks_exact(8)) {
                    *word = u64::from_le_bytes(chunk.try_into().expect("8-byte chunk"));
                }
                self.msum.push(bitmap);
            }
            Builtin::Mscan => {
                let payload = literal_payload(builtin, raw_tokens)?;
                let [byte] = payload else {
                    return Err(bad(format!(
                        "scan parameter must be one byte, got {}",
                        payload.len()
                    )));
                };
                self.mscan.push(*byte);
            }
            Builtin::Mproduct => {
                let payload = literal_payload(builtin, raw_tokens)?;
                if payload.len() < 2 {
                    return Err(bad("product sequence shorter than two bytes".to_owned()));
                }
                self.mproduct.push(payload.to_vec().into_boxed_slice());
            }
            Builtin::Nul
            | Builtin::Nil
            | Builtin::Mark
            | Builtin::Reset
            | Builtin::Pause
            | Builtin::Stop => {
                return Err(EffectorError::NotParameterised(
                    String::from_utf8_lossy(builtin.name()).into_owned(),
                ));
            }
        }
        Ok(())
    }
}

fn resolve_one(model: &Model, builtin: Builtin, raw: &Bytes) -> Result<Token, EffectorError> {
    model
        .resolve_token(raw.as_slice())
        .map_err(|e| EffectorError::BadParameter {
            effector: String::from_utf8_lossy(builtin.name()).into_owned(),
            reason: e.to_string(),
        })
}

fn single(
    builtin: Builtin,
    raw_tokens: &[Bytes],
    kind: TokenKind,
    model: &Model,
) -> Result<Token, EffectorError> {
    let [raw] = raw_tokens else {
        return Err(EffectorError::BadParameter {
            effector: String::from_utf8_lossy(builtin.name()).into_owned(),
            reason: format!("expected one token, got {}", raw_tokens.len()),
        });
    };
    let token = resolve_one(model, builtin, raw)?;
    if token.kind() != kind {
        return Err(EffectorError::BadParameter {
            effector: String::from_utf8_lossy(builtin.name()).into_owned(),
            reason: format!("expected a {kind:?} token, got {:?}", token.kind()),
        });
    }
    Ok(token)
}

fn field_ordinal(
    model: &Model,
    builtin: Builtin,
    raw_tokens: &[Bytes],
) -> Result<usize, EffectorError> {
    Ok(single(builtin, raw_tokens, TokenKind::Field, model)?.ordinal())
}

fn literal_payload<'a>(
    builtin: Builtin,
    raw_tokens: &'a [Bytes],
) -> Result<&'a [u8], EffectorError> {
    let [raw] = raw_tokens else {
        return Err(EffectorError::BadParameter {
            effector: String::from_utf8_lossy(builtin.name()).into_owned(),
            reason: format!("expected one literal token, got {}", raw_tokens.len()),
        });
    };
    match Token::classify(raw.as_slice()) {
        (TokenKind::Literal, payload) => Ok(payload),
        (kind, _) => Err(EffectorError::BadParameter {
            effector: String::from_utf8_lossy(builtin.name()).into_owned(),
            reason: format!("expected a literal token, got {kind:?}"),
        }),
    }
}

fn pieces(
    model: &Model,
    builtin: Builtin,
    raw_tokens: &[Bytes],
) -> Result<Vec<Piece>, EffectorError> {
    raw_tokens
        .iter()
        .map(|raw| {
            let token = resolve_one(model, builtin, raw)?;
            match token.kind() {
                TokenKind::Literal => Ok(Piece::Bytes(token.symbol().to_vec().into_boxed_slice())),
                TokenKind::Field => Ok(Piece::Field(token.ordinal())),
                kind => Err(EffectorError::BadParameter {
                    effector: String::from_utf8_lossy(builtin.name()).into_owned(),
                    reason: format!("{kind:?} token not meaningful here"),
                }),
            }
        })
        .collect()
}

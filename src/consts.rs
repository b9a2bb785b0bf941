//! Engine parameters, ordinal bases and action encoding

/// Number of distinct raw byte symbols; also the lowest signal ordinal.
///
/// Raw bytes `0..=255` and signal ordinals share one symbol axis, so every
/// signal ordinal is `SIGNAL_BASE` or above.
pub const SIGNAL_BASE: usize = 256;

/// The `nul` signal, injected on a domain error.
pub const SIGNAL_NUL: usize = SIGNAL_BASE;

/// The `nil` signal, a benign no-op event.
pub const SIGNAL_NIL: usize = SIGNAL_BASE + 1;

/// The `eol` signal, conventionally raised at end of line.
pub const SIGNAL_EOL: usize = SIGNAL_BASE + 2;

/// The `eos` signal, conventionally raised at end of stream.
pub const SIGNAL_EOS: usize = SIGNAL_BASE + 3;

/// Count of reserved built-in signals (`nul`, `nil`, `eol`, `eos`).
pub const BUILTIN_SIGNAL_COUNT: usize = 4;

/* ACTION ENCODING */

/// Action for a cell with no recorded transition; drives domain-error
/// handling in the transductor.
pub const ACTION_NUL: i32 = 0;

/// Action that advances input with no effector call.
pub const ACTION_NIL: i32 = 1;

/// Lowest action value carrying a packed `(effector, parameter)` pair.
pub const ACTION_PARAMETERISED: i32 = 0x10000;

/// Pack an effector ordinal with a parameter ordinal into a single action.
///
/// The parameter ordinal is biased by one so that every parameterised
/// action lands at or above [`ACTION_PARAMETERISED`].
pub const fn parameterised_action(effector: usize, parameter: usize) -> i32 {
    (effector as i32) | (((parameter as i32) + 1) << 16)
}

/// Split a packed parameterised action into `(effector, parameter)`.
pub const fn split_action(action: i32) -> (usize, usize) {
    ((action & 0xffff) as usize, ((action >> 16) - 1) as usize)
}

/* EFFECT MASK */

/// Effector invocation outcome bitmask.
pub type Effect = u32;

/// Proceed with the transduction.
pub const EFFECT_NONE: Effect = 0;

/// Return from the run loop with status `Paused`.
pub const EFFECT_PAUSE: Effect = 1 << 0;

/// Pop the top transducer frame.
pub const EFFECT_POP_TRANSDUCER: Effect = 1 << 1;

/// Pop the top input frame.
pub const EFFECT_POP_INPUT: Effect = 1 << 2;

/// Rewind the input stack to the live mark.
pub const EFFECT_RESET_INPUT: Effect = 1 << 3;

/// A transducer frame was pushed; the run loop must refetch its top frame.
pub const EFFECT_PUSH_TRANSDUCER: Effect = 1 << 4;

/// Inject the signal carried in the high bits of the mask.
pub const EFFECT_SIGNAL: Effect = 1 << 5;

/// Bit position of the signal ordinal inside a [`EFFECT_SIGNAL`] mask.
pub const EFFECT_SIGNAL_SHIFT: u32 = 16;

/// Build an effect mask requesting injection of `signal`.
pub const fn signal_effect(signal: usize) -> Effect {
    EFFECT_SIGNAL | ((signal as Effect) << EFFECT_SIGNAL_SHIFT)
}

/// Extract the signal ordinal from a mask with [`EFFECT_SIGNAL`] set.
pub const fn effect_signal(effect: Effect) -> usize {
    (effect >> EFFECT_SIGNAL_SHIFT) as usize
}

/* LIMITS */

/// Transducer stack depth guard; exceeding it fails the transduction.
pub const MAX_TRANSDUCER_STACK_DEPTH: usize = 64;

/// Input stack depth guard; a push past it fails the transduction. Bounds
/// runaway `in` injection chains.
pub const MAX_INPUT_STACK_DEPTH: usize = 256;

/// Default soft maximum for the marked-frame archive, in frames. The
/// archive warns and keeps growing past this watermark.
pub const DEFAULT_MARK_LIMIT: usize = 64;

/// Initial capacity of a field buffer.
pub const FIELD_INITIAL_CAPACITY: usize = 64;

/* TOKENS */

/// Escape byte prefixing a verbatim literal parameter token. Synthesised
/// superinstruction parameters use it so their payload bytes are never
/// mistaken for a symbolic sigil.
pub const TOKEN_ESCAPE: u8 = 0x1b;

/// Sigil introducing a signal reference token (`!name`).
pub const SIGIL_SIGNAL: u8 = b'!';

/// Sigil introducing a field reference token (`~name`).
pub const SIGIL_FIELD: u8 = b'~';

/// Sigil introducing a transducer reference token (`@name`).
pub const SIGIL_TRANSDUCER: u8 = b'@';

/// Version string recorded in, and required of, model files.
pub const MODEL_VERSION: &str = "ribose-0.1";

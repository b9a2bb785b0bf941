//! Run loop and effector dispatch

use std::io::Write;
use std::sync::Arc;

use crate::consts::{
    effect_signal, signal_effect, Effect, ACTION_NIL, ACTION_NUL, ACTION_PARAMETERISED,
    EFFECT_NONE, EFFECT_PAUSE, EFFECT_POP_INPUT, EFFECT_POP_TRANSDUCER, EFFECT_PUSH_TRANSDUCER,
    EFFECT_RESET_INPUT, EFFECT_SIGNAL, SIGNAL_NIL, SIGNAL_NUL,
};
use crate::effector::{Builtin, ClearScope, EffectorContext, Piece};
use crate::error::{EffectorError, RunError};
use crate::target::Target;
use crate::transducer::Transducer;

use super::{Status, Transductor};

impl<T: Target> Transductor<T> {
    /// Execute until an effector pauses the transduction, input runs dry,
    /// the transducer stack empties, or a fatal error unwinds.
    ///
    /// Each step consumes one symbol, dispatches the matrix cell it
    /// selects, and applies the resulting effect mask. A fatal error
    /// leaves the partially consumed input on the stack for inspection.
    pub fn run(&mut self) -> Result<Status, RunError> {
        if self.stack.is_empty() {
            self.status = Status::Stopped;
            return Ok(self.status);
        }
        self.status = Status::Runnable;

        'frames: while let Some(frame) = self.stack.last() {
            let transducer = Arc::clone(&frame.transducer);
            let mut row = frame.row_base;
            loop {
                let Some(symbol) = self.input.next_symbol() else {
                    self.save_row(row);
                    self.status = Status::Waiting;
                    break 'frames;
                };
                self.metrics.bytes += 1;

                // a symbol outside the filter's range is a domain error,
                // same as a recorded rejection
                let Some(class) = transducer.class_of(symbol) else {
                    self.metrics.traps += 1;
                    if let Err(error) = self.input_guard() {
                        self.save_row(row);
                        return Err(error);
                    }
                    self.input.push_signal(SIGNAL_NUL);
                    continue;
                };
                let cell = transducer.cell(row, class);
                let action = Transducer::action(cell);
                let next = Transducer::row_base(cell);

                let effect = match action {
                    ACTION_NIL => {
                        row = next;
                        continue;
                    }
                    ACTION_NUL => {
                        if symbol == SIGNAL_NUL {
                            // the injected nul was rejected too
                            self.metrics.errors += 1;
                            self.save_row(row);
                            return Err(RunError::Domain {
                                transducer: transducer.name().to_owned(),
                                state: transducer.state_of(row),
                                symbol,
                            });
                        }
                        self.metrics.traps += 1;
                        if let Err(error) = self.input_guard() {
                            self.save_row(row);
                            return Err(error);
                        }
                        self.input.push_signal(SIGNAL_NUL);
                        continue;
                    }
                    action if action >= ACTION_PARAMETERISED => {
                        self.save_row(next);
                        let (effector, parameter) = crate::consts::split_action(action);
                        self.invoke_parameterised(effector, parameter, symbol)?
                    }
                    action if action > ACTION_NIL => {
                        self.save_row(next);
                        self.invoke_scalar(action as usize, symbol)?
                    }
                    action => {
                        self.save_row(next);
                        self.invoke_vector(&transducer, (-action) as usize, symbol)?
                    }
                };
                row = next;

                if effect != EFFECT_NONE {
                    if effect & EFFECT_SIGNAL != 0 {
                        self.input_guard()?;
                        self.input.push_signal(effect_signal(effect));
                    }
                    if effect & EFFECT_RESET_INPUT != 0 {
                        self.input.reset();
                    }
                    if effect & EFFECT_POP_INPUT != 0 {
                        self.input.pop_top();
                    }
                    if effect & EFFECT_POP_TRANSDUCER != 0 {
                        self.stack.pop();
                        continue 'frames;
                    }
                    if effect & EFFECT_PUSH_TRANSDUCER != 0 {
                        continue 'frames;
                    }
                    if effect & EFFECT_PAUSE != 0 {
                        self.save_row(row);
                        self.status = Status::Paused;
                        break 'frames;
                    }
                }
            }
        }

        if self.stack.is_empty() {
            self.status = Status::Stopped;
        }
        Ok(self.status)
    }

    fn save_row(&mut self, row: usize) {
        if let Some(frame) = self.stack.last_mut() {
            frame.row_base = row;
        }
    }

    fn invoke_scalar(&mut self, ordinal: usize, symbol: usize) -> Result<Effect, RunError> {
        match Builtin::from_ordinal(ordinal) {
            Some(builtin) => self.builtin_scalar(builtin, symbol),
            None => self.invoke_host(ordinal, symbol, None),
        }
    }

    fn invoke_parameterised(
        &mut self,
        ordinal: usize,
        parameter: usize,
        symbol: usize,
    ) -> Result<Effect, RunError> {
        match Builtin::from_ordinal(ordinal) {
            Some(builtin) => self.builtin_parameterised(builtin, parameter, symbol),
            None => self.invoke_host(ordinal, symbol, Some(parameter)),
        }
    }

    /// Iterate a NUL-terminated effector-vector sequence, OR-ing the
    /// effect masks. A negative entry pairs with its successor as a
    /// parameterised invocation.
    fn invoke_vector(
        &mut self,
        transducer: &Transducer,
        offset: usize,
        symbol: usize,
    ) -> Result<Effect, RunError> {
        let mut effect = EFFECT_NONE;
        let mut index = offset;
        loop {
            // bounds and termination were validated at load time
            let entry = transducer.effector_vector()[index];
            if entry == 0 {
                return Ok(effect);
            }
            if entry < 0 {
                let parameter = transducer.effector_vector()[index + 1] as usize;
                effect |= self.invoke_parameterised((-entry) as usize, parameter, symbol)?;
                index += 2;
            } else {
                effect |= self.invoke_scalar(entry as usize, symbol)?;
                index += 1;
            }
        }
    }

    fn invoke_host(
        &mut self,
        ordinal: usize,
        symbol: usize,
        parameter: Option<usize>,
    ) -> Result<Effect, RunError> {
        let Self {
            model,
            target,
            effectors,
            fields,
            stack,
            output,
            ..
        } = self;
        let name = model.effector_name(ordinal);
        let selected = &mut stack.last_mut().expect("running frame").selected;
        let mut ctx = EffectorContext {
            fields,
            selected,
            output,
            symbol,
        };
        let effector = effectors
            .get_mut(ordinal)
            .and_then(Option::as_mut)
            .ok_or_else(|| RunError::Effector {
                effector: name.clone(),
                source: EffectorError::Failed("effector is not bound".to_owned()),
            })?;
        let result = match parameter {
            None => effector.invoke(target, &mut ctx),
            Some(parameter) => effector.invoke_parameterised(target, &mut ctx, parameter),
        };
        result.map_err(|source| RunError::Effector {
            effector: name,
            source,
        })
    }

    fn builtin_scalar(&mut self, builtin: Builtin, symbol: usize) -> Result<Effect, RunError> {
        let selected = self.selected();
        match builtin {
            Builtin::Nul => Ok(signal_effect(SIGNAL_NUL)),
            Builtin::Nil => Ok(EFFECT_NONE),
            Builtin::Paste => {
                self.fields.append_byte(selected, (symbol & 0xff) as u8);
                Ok(EFFECT_NONE)
            }
            Builtin::Select => {
                self.select(0);
                Ok(EFFECT_NONE)
            }
            Builtin::Copy => {
                self.fields.transfer(selected, 0, false);
                Ok(EFFECT_NONE)
            }
            Builtin::Cut => {
                self.fields.transfer(selected, 0, true);
                Ok(EFFECT_NONE)
            }
            Builtin::Clear => {
                self.fields.clear(selected);
                Ok(EFFECT_NONE)
            }
            Builtin::In => {
                self.input_guard()?;
                let bytes = self
                    .fields
                    .get(selected)
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default();
                self.input.push_field(&bytes);
                Ok(EFFECT_NONE)
            }
            Builtin::Out => {
                let Self { fields, output, .. } = self;
                if let (Some(bytes), Some(sink)) = (fields.get(selected), output.as_mut()) {
                    sink.write_all(bytes)
                        .map_err(|e| effector_failed(builtin, e.into()))?;
                }
                Ok(EFFECT_NONE)
            }
            Builtin::Mark => {
                self.input.mark();
                Ok(EFFECT_NONE)
            }
            Builtin::Reset => {
                self.input.reset();
                Ok(EFFECT_NONE)
            }
            Builtin::Pause => Ok(EFFECT_PAUSE),
            Builtin::Stop => Ok(EFFECT_POP_TRANSDUCER),
            Builtin::Count => {
                let frame = self.stack.last_mut().expect("running frame");
                let (ticks, signal) = &mut frame.countdown;
                if *ticks > 0 {
                    *ticks -= 1;
                    if *ticks == 0 {
                        return Ok(signal_effect(*signal));
                    }
                }
                Ok(EFFECT_NONE)
            }
            Builtin::Signal => Ok(signal_effect(SIGNAL_NIL)),
            Builtin::Start | Builtin::Msum | Builtin::Mproduct | Builtin::Mscan => {
                Err(effector_failed(
                    builtin,
                    EffectorError::RequiresParameter(
                        String::from_utf8_lossy(builtin.name()).into_owned(),
                    ),
                ))
            }
        }
    }

    fn builtin_parameterised(
        &mut self,
        builtin: Builtin,
        parameter: usize,
        _symbol: usize,
    ) -> Result<Effect, RunError> {
        let selected = self.selected();
        match builtin {
            Builtin::Paste => {
                self.paste_pieces(parameter, selected);
                Ok(EFFECT_NONE)
            }
            Builtin::Select => {
                let field = self.params.select[parameter];
                self.select(field);
                Ok(EFFECT_NONE)
            }
            Builtin::Copy => {
                self.fields
                    .transfer(selected, self.params.copy[parameter], false);
                Ok(EFFECT_NONE)
            }
            Builtin::Cut => {
                self.fields
                    .transfer(selected, self.params.cut[parameter], true);
                Ok(EFFECT_NONE)
            }
            Builtin::Clear => {
                match self.params.clear[parameter] {
                    ClearScope::One(field) => self.fields.clear(field),
                    ClearScope::All => self.fields.clear_all(),
                }
                Ok(EFFECT_NONE)
            }
            Builtin::In => {
                self.input_guard()?;
                let mut bytes = Vec::new();
                for piece in &self.params.input[parameter] {
                    match piece {
                        Piece::Bytes(literal) => bytes.extend_from_slice(literal),
                        Piece::Field(field) => {
                            if let Some(content) = self.fields.get(*field) {
                                bytes.extend_from_slice(content);
                            }
                        }
                    }
                }
                self.input.push_field(&bytes);
                Ok(EFFECT_NONE)
            }
            Builtin::Out => {
                let Self {
                    params,
                    fields,
                    output,
                    ..
                } = self;
                if let Some(sink) = output.as_mut() {
                    for piece in &params.out[parameter] {
                        let bytes = match piece {
                            Piece::Bytes(literal) => Some(&literal[..]),
                            Piece::Field(field) => fields.get(*field),
                        };
                        if let Some(bytes) = bytes {
                            sink.write_all(bytes)
                                .map_err(|e| effector_failed(builtin, e.into()))?;
                        }
                    }
                }
                Ok(EFFECT_NONE)
            }
            Builtin::Start => {
                let ordinal = self.params.start[parameter];
                let transducer = self.model.transducer(ordinal)?;
                self.push_transducer(transducer)?;
                Ok(EFFECT_PUSH_TRANSDUCER)
            }
            Builtin::Count => {
                let frame = self.stack.last_mut().expect("running frame");
                frame.countdown = self.params.count[parameter];
                Ok(EFFECT_NONE)
            }
            Builtin::Signal => Ok(signal_effect(self.params.signal[parameter])),
            Builtin::Msum => {
                let bitmap = self.params.msum[parameter];
                self.metrics.sum += 1;
                self.metrics.bytes += self.input.skip_sum(&bitmap);
                Ok(EFFECT_NONE)
            }
            Builtin::Mscan => {
                let byte = self.params.mscan[parameter];
                self.metrics.scan += 1;
                self.metrics.bytes += self.input.skip_scan(byte);
                Ok(EFFECT_NONE)
            }
            Builtin::Mproduct => {
                // the payload's first byte is the already-consumed trigger
                // and its last is left for the ordinary transition out of
                // the landing state
                let payload = &self.params.mproduct[parameter];
                let pattern = payload[1..payload.len() - 1].to_vec();
                self.metrics.product += 1;
                let (consumed, matched) = self.input.match_product(&pattern);
                self.metrics.bytes += consumed;
                if matched {
                    Ok(EFFECT_NONE)
                } else {
                    self.metrics.traps += 1;
                    Ok(signal_effect(SIGNAL_NUL))
                }
            }
            Builtin::Nul
            | Builtin::Nil
            | Builtin::Mark
            | Builtin::Reset
            | Builtin::Pause
            | Builtin::Stop => Err(effector_failed(
                builtin,
                EffectorError::NotParameterised(
                    String::from_utf8_lossy(builtin.name()).into_owned(),
                ),
            )),
        }
    }

    fn paste_pieces(&mut self, parameter: usize, selected: usize) {
        let Self { params, fields, .. } = self;
        for piece in &params.paste[parameter] {
            match piece {
                Piece::Bytes(literal) => fields.append(selected, literal),
                Piece::Field(field) => fields.transfer(*field, selected, false),
            }
        }
    }

    fn selected(&self) -> usize {
        self.stack.last().map(|f| f.selected).unwrap_or(0)
    }

    fn select(&mut self, field: usize) {
        if let Some(frame) = self.stack.last_mut() {
            frame.selected = field;
        }
    }
}

fn effector_failed(builtin: Builtin, source: EffectorError) -> RunError {
    RunError::Effector {
        effector: String::from_utf8_lossy(builtin.name()).into_owned(),
        source,
    }
}

//! Reader for the tab-delimited automaton text emitted by the FST tool
//!
//! The format is byte-oriented: a header line
//! `INR<tapes>\t<states>\t<symbols>\t<transitions>\n` followed by one line
//! per transition, `from\tto\ttape\tlen\t<len symbol bytes>\n`. Symbol
//! bytes are raw and may themselves contain tabs or newlines, so parsing
//! tracks explicit lengths instead of splitting lines.

use crate::error::CompileError;

/// One raw three-tape transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Source state.
    pub from: u32,
    /// Target state.
    pub to: u32,
    /// Tape the symbol is read from: 0 input, 1 effector, 2 parameter.
    pub tape: u32,
    /// Raw symbol bytes.
    pub symbol: Vec<u8>,
}

/// A parsed automaton: header counts, transitions and final states.
#[derive(Debug, Clone)]
pub struct Automaton {
    /// Tape count declared by the header.
    pub tapes: u32,
    /// State count declared by the header.
    pub states: u32,
    /// Symbol count declared by the header.
    pub symbols: u32,
    /// All non-marker transitions, in file order.
    pub transitions: Vec<Transition>,
    /// States flagged final by `(from, 1, 0, ε)` marker transitions.
    pub finals: Vec<u32>,
}

impl Automaton {
    /// Parse automaton text.
    pub fn parse(name: &str, text: &[u8]) -> Result<Self, CompileError> {
        let mut cursor = Cursor::new(name, text);

        let tag = cursor.take(3)?;
        if tag != b"INR" {
            return Err(CompileError::Header {
                automaton: name.to_owned(),
                reason: "missing INR tag".to_owned(),
            });
        }
        let tapes = cursor.number(b'\t')?;
        let states = cursor.number(b'\t')?;
        let symbols = cursor.number(b'\t')?;
        let count = cursor.number(b'\n')?;

        let mut transitions = Vec::with_capacity(count as usize);
        let mut finals = Vec::new();
        for _ in 0..count {
            let from = cursor.number(b'\t')?;
            let to = cursor.number(b'\t')?;
            let tape = cursor.number(b'\t')?;
            let len = cursor.number(b'\t')?;
            let symbol = cursor.take(len as usize)?.to_vec();
            cursor.expect(b'\n')?;

            if to == 1 && tape == 0 && symbol.is_empty() {
                finals.push(from);
            } else if tape >= tapes {
                return Err(cursor.malformed(format!(
                    "transition on tape {tape} but header declares {tapes} tapes"
                )));
            } else {
                transitions.push(Transition {
                    from,
                    to,
                    tape,
                    symbol,
                });
            }
        }

        Ok(Self {
            tapes,
            states,
            symbols,
            transitions,
            finals,
        })
    }
}

/// Byte cursor with positioned error reporting.
struct Cursor<'a> {
    name: &'a str,
    text: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(name: &'a str, text: &'a [u8]) -> Self {
        Self {
            name,
            text,
            offset: 0,
        }
    }

    fn malformed(&self, reason: String) -> CompileError {
        CompileError::Malformed {
            automaton: self.name.to_owned(),
            offset: self.offset,
            reason,
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CompileError> {
        if self.offset + len > self.text.len() {
            return Err(self.malformed(format!("wanted {len} bytes, input exhausted")));
        }
        let bytes = &self.text[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    fn expect(&mut self, byte: u8) -> Result<(), CompileError> {
        match self.text.get(self.offset) {
            Some(b) if *b == byte => {
                self.offset += 1;
                Ok(())
            }
            Some(b) => Err(self.malformed(format!("expected {byte:#04x}, found {b:#04x}"))),
            None => Err(self.malformed(format!("expected {byte:#04x}, input exhausted"))),
        }
    }

    /// Read an unsigned decimal up to and over the `delimiter`.
    fn number(&mut self, delimiter: u8) -> Result<u32, CompileError> {
        let start = self.offset;
        let mut value: u32 = 0;
        while let Some(digit) = self.text.get(self.offset) {
            if *digit == delimiter {
                if self.offset == start {
                    return Err(self.malformed("empty number field".to_owned()));
                }
                self.offset += 1;
                return Ok(value);
            }
            if !digit.is_ascii_digit() {
                return Err(self.malformed(format!("non-digit {digit:#04x} in number field")));
            }
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(u32::from(digit - b'0')))
                .ok_or_else(|| self.malformed("number field overflows u32".to_owned()))?;
            self.offset += 1;
        }
        Err(self.malformed("number field unterminated".to_owned()))
    }
}

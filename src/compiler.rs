//! Model compiler: aggregates three-tape automaton transitions into raw
//! transition matrices, allocates ordinals, and drives the assembler
//!
//! Compilation is collected-error: each automaton records its first defect
//! and compilation continues with the next, so a build surfaces as many
//! problems as it can before failing.

use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::path::Path;

use tracing::debug;

use crate::automaton::{Automaton, Transition};
use crate::bytes::Bytes;
use crate::consts::{
    parameterised_action, ACTION_NIL, MODEL_VERSION, SIGNAL_BASE, SIGNAL_EOL, SIGNAL_EOS,
    SIGNAL_NIL, SIGNAL_NUL,
};
use crate::effector::Builtin;
use crate::error::{CompileError, CompileErrors, ModelError};
use crate::model::codec::ModelWriter;
use crate::model::OrdinalMap;
use crate::target::Target;
use crate::token::{Token, TokenKind};
use crate::transducer::Cell;

mod assembler;

pub use assembler::Assembler;
use assembler::Assembly;

/// Deduplicating store of effector sequences referenced by compiled
/// actions. Ordinal 0 is reserved for the lone NUL sentinel.
#[derive(Debug)]
pub(crate) struct EffectVectors {
    index: HashMap<crate::bytes::Ints, usize>,
    list: Vec<Vec<i32>>,
}

impl EffectVectors {
    pub fn new() -> Self {
        let sentinel = vec![0i32];
        let mut index = HashMap::new();
        index.insert(key_of(&sentinel), 0);
        Self {
            index,
            list: vec![sentinel],
        }
    }

    /// Intern a NUL-terminated effector sequence.
    pub fn intern(&mut self, sequence: Vec<i32>) -> usize {
        let key = key_of(&sequence);
        if let Some(ordinal) = self.index.get(&key) {
            return *ordinal;
        }
        let ordinal = self.list.len();
        self.index.insert(key, ordinal);
        self.list.push(sequence);
        ordinal
    }

    pub fn get(&self, ordinal: usize) -> &[i32] {
        &self.list[ordinal]
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }
}

fn key_of(sequence: &[i32]) -> crate::bytes::Ints {
    crate::bytes::Ints::new(sequence.iter().map(|v| i64::from(*v)).collect::<Vec<_>>())
}

/// Per-effector deduplicating store of raw parameter token lists. Shared
/// by the whole model so that identical parameters, including the ones
/// the assembler synthesises, resolve to one ordinal.
#[derive(Debug)]
pub(crate) struct ParamTable {
    sets: Vec<ParamSet>,
}

#[derive(Debug, Default)]
struct ParamSet {
    index: HashMap<Vec<Bytes>, usize>,
    list: Vec<Vec<Bytes>>,
}

impl ParamTable {
    pub fn new(effectors: usize) -> Self {
        Self {
            sets: (0..effectors).map(|_| ParamSet::default()).collect(),
        }
    }

    /// Intern a token list for `effector`, returning its parameter
    /// ordinal.
    pub fn intern(&mut self, effector: usize, tokens: Vec<Vec<u8>>) -> usize {
        let tokens: Vec<Bytes> = tokens.into_iter().map(Bytes::new).collect();
        let set = &mut self.sets[effector];
        if let Some(ordinal) = set.index.get(&tokens) {
            return *ordinal;
        }
        let ordinal = set.list.len();
        set.index.insert(tokens.clone(), ordinal);
        set.list.push(tokens);
        ordinal
    }

    /// Token list of parameter `parameter` of `effector`.
    pub fn tokens(&self, effector: usize, parameter: usize) -> &[Bytes] {
        &self.sets[effector].list[parameter]
    }

    /// Count of parameters interned for `effector`.
    pub fn count(&self, effector: usize) -> usize {
        self.sets[effector].list.len()
    }
}

/// Compiles automaton text into a model file.
///
/// One compiler instance accumulates any number of transducers, a shared
/// signal/field/effector/transducer ordinal allocation, and a shared
/// parameter table, then saves them as one model.
#[derive(Debug)]
pub struct ModelCompiler {
    /// Assembler thresholds; adjust before the first `compile` call.
    pub assembler: Assembler,
    target_name: String,
    signals: OrdinalMap,
    fields: OrdinalMap,
    effectors: OrdinalMap,
    transducers: OrdinalMap,
    params: ParamTable,
    assemblies: Vec<Option<Assembly>>,
    errors: CompileErrors,
}

impl ModelCompiler {
    /// Create a compiler bound to `target`'s name and effector registry.
    pub fn new<T: Target>(target: &mut T) -> Self {
        use strum::IntoEnumIterator;

        let mut signals = OrdinalMap::with_base(SIGNAL_BASE);
        let nul = signals.insert(Bytes::from(&b"nul"[..]));
        let nil = signals.insert(Bytes::from(&b"nil"[..]));
        let eol = signals.insert(Bytes::from(&b"eol"[..]));
        let eos = signals.insert(Bytes::from(&b"eos"[..]));
        debug_assert_eq!(
            (nul, nil, eol, eos),
            (SIGNAL_NUL, SIGNAL_NIL, SIGNAL_EOL, SIGNAL_EOS)
        );

        let mut fields = OrdinalMap::with_base(0);
        // ordinal 0 is the anonymous field
        fields.insert(Bytes::from(&b""[..]));

        let mut effectors = OrdinalMap::with_base(0);
        for builtin in Builtin::iter() {
            effectors.insert(Bytes::from(builtin.name()));
        }
        for effector in target.effectors() {
            effectors.insert(Bytes::from(effector.name()));
        }

        let params = ParamTable::new(effectors.len());

        Self {
            assembler: Assembler::default(),
            target_name: target.name().to_owned(),
            signals,
            fields,
            effectors,
            transducers: OrdinalMap::with_base(0),
            params,
            assemblies: Vec::new(),
            errors: CompileErrors::default(),
        }
    }

    /// Compile one automaton under `name`. Defects are recorded; the
    /// build fails at `save` if any were.
    pub fn compile(&mut self, name: &str, text: &[u8]) {
        match self.compile_automaton(name, text) {
            Ok(states) => debug!(transducer = name, states, "compiled"),
            Err(error) => self.errors.push(error),
        }
    }

    /// Compile every `.inr` file in `directory`, using file stems as
    /// transducer names.
    pub fn compile_directory<P: AsRef<Path>>(&mut self, directory: P) -> Result<(), CompileErrors> {
        let mut paths: Vec<_> = fs::read_dir(directory.as_ref())
            .map_err(ModelError::from)
            .map_err(CompileErrors::from)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|e| e == "inr"))
            .collect();
        paths.sort();
        for path in paths {
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let text = fs::read(&path)
                .map_err(ModelError::from)
                .map_err(CompileErrors::from)?;
            self.compile(&name, &text);
        }
        Ok(())
    }

    /// Validate cross-references and write the model file.
    pub fn save<P: AsRef<Path>>(mut self, path: P) -> Result<(), CompileErrors> {
        for ordinal in 0..self.transducers.len() {
            if self.assemblies.get(ordinal).map(Option::is_some) != Some(true) {
                let name = self
                    .transducers
                    .name(ordinal)
                    .map(Bytes::to_string_lossy)
                    .unwrap_or_default();
                self.errors.push(CompileError::UnresolvedTransducer(name));
            }
        }
        if !self.errors.is_empty() {
            return Err(self.errors);
        }
        self.write(path.as_ref()).map_err(CompileErrors::from)
    }

    fn write(self, path: &Path) -> Result<(), ModelError> {
        let n_symbols = SIGNAL_BASE + self.signals.len();
        let mut writer = ModelWriter::new(File::create(path)?);

        writer.write_long(0)?;
        writer.write_string(MODEL_VERSION)?;
        writer.write_string(&self.target_name)?;

        let mut offsets = Vec::with_capacity(self.transducers.len());
        for ordinal in 0..self.transducers.len() {
            let assembly = self.assemblies[ordinal]
                .as_ref()
                .expect("save checked every transducer has an assembly");
            let name = self.transducers.name(ordinal).expect("interned name");
            offsets.push(writer.position()? as i64);

            writer.write_bytes(name.as_slice())?;
            writer.write_string(&self.target_name)?;
            let (filter, columns) = pad_filter(assembly, n_symbols);
            let filter: Vec<i32> = filter.iter().map(|c| *c as i32).collect();
            writer.write_int_array(&filter)?;
            writer.write_matrix(&assembly.rows, columns)?;
            writer.write_int_array(&assembly.vector)?;
        }

        let index_position = writer.position()? as i64;
        writer.write_bytes_array(self.signals.names())?;
        writer.write_bytes_array(self.fields.names())?;
        writer.write_bytes_array(self.effectors.names())?;
        writer.write_bytes_array(self.transducers.names())?;

        for (ordinal, offset) in offsets.iter().enumerate() {
            let name = self.transducers.name(ordinal).expect("interned name");
            writer.write_bytes(name.as_slice())?;
            writer.write_long(*offset)?;
        }

        for effector in 0..self.effectors.len() {
            let count = self.params.count(effector);
            if count == 0 {
                writer.write_int(-1)?;
                continue;
            }
            writer.write_int(count as i32)?;
            for parameter in 0..count {
                writer.write_bytes_array(self.params.tokens(effector, parameter))?;
            }
        }

        writer.seek(0)?;
        writer.write_long(index_position)?;
        writer.finish()?;

        debug!(
            path = %path.display(),
            transducers = offsets.len(),
            index_position,
            "model saved"
        );
        Ok(())
    }

    fn compile_automaton(&mut self, name: &str, text: &[u8]) -> Result<usize, CompileError> {
        let automaton = Automaton::parse(name, text)?;
        let graph = Graph::new(&automaton);
        let mut vectors = EffectVectors::new();

        // aggregate chains into per-input-state cells, assigning dense
        // ordinals in discovery order from the start state
        let mut dense: HashMap<u32, u32> = HashMap::new();
        let mut worklist: Vec<u32> = Vec::new();
        let mut cells: Vec<HashMap<usize, (u32, i32)>> = Vec::new();
        dense.insert(0, 0);
        cells.push(HashMap::new());
        worklist.push(0);

        while let Some(raw_state) = worklist.pop() {
            let from = dense[&raw_state];
            for transition in graph.tape(raw_state, 0) {
                let symbol = self.input_symbol(name, transition)?;
                let (raw_target, action) =
                    self.follow_chain(name, &graph, transition.to, &mut vectors)?;
                let next = dense.len() as u32;
                let to = *dense.entry(raw_target).or_insert_with(|| {
                    cells.push(HashMap::new());
                    worklist.push(raw_target);
                    next
                });
                match cells[from as usize].get(&symbol) {
                    None => {
                        cells[from as usize].insert(symbol, (to, action));
                    }
                    Some(existing) if *existing == (to, action) => {}
                    Some(_) => {
                        return Err(CompileError::DuplicateTransition {
                            automaton: name.to_owned(),
                            state: raw_state,
                            symbol,
                        })
                    }
                }
            }
        }

        // dense matrix over the full symbol axis
        let n_symbols = SIGNAL_BASE + self.signals.len();
        let matrix: Vec<Vec<Cell>> = cells
            .iter()
            .enumerate()
            .map(|(state, row)| {
                let mut dense_row = vec![Cell::default_for(state as u32); n_symbols];
                for (symbol, (to, action)) in row {
                    dense_row[*symbol] = Cell {
                        to: *to,
                        action: *action,
                    };
                }
                dense_row
            })
            .collect();

        let states = matrix.len();
        let assembly = self
            .assembler
            .assemble(name, matrix, &vectors, &mut self.params);

        let ordinal = self.transducers.insert(Bytes::from(name.as_bytes()));
        if self.assemblies.len() <= ordinal {
            self.assemblies.resize_with(ordinal + 1, || None);
        }
        self.assemblies[ordinal] = Some(assembly);
        Ok(states)
    }

    /// Resolve a tape-0 symbol to its ordinal on the shared symbol axis.
    fn input_symbol(
        &mut self,
        automaton: &str,
        transition: &Transition,
    ) -> Result<usize, CompileError> {
        let symbol = &transition.symbol;
        if symbol.len() == 1 {
            return Ok(symbol[0] as usize);
        }
        match Token::classify(symbol) {
            (TokenKind::Signal, payload) => Ok(self.signals.insert(Bytes::from(payload))),
            (TokenKind::Literal, payload) if payload.len() == 1 => Ok(payload[0] as usize),
            _ => Err(CompileError::Malformed {
                automaton: automaton.to_owned(),
                offset: 0,
                reason: format!(
                    "input symbol {:?} is neither a byte nor a signal",
                    String::from_utf8_lossy(symbol)
                ),
            }),
        }
    }

    /// Follow the effector/parameter chain from `start` to the next input
    /// state, encoding the collected invocations into an action.
    fn follow_chain(
        &mut self,
        automaton: &str,
        graph: &Graph<'_>,
        start: u32,
        vectors: &mut EffectVectors,
    ) -> Result<(u32, i32), CompileError> {
        let mut effects: Vec<(usize, Option<usize>)> = Vec::new();
        let mut current = start;

        loop {
            let tape1 = graph.tape(current, 1);
            let tape2 = graph.tape(current, 2);
            if tape1.is_empty() && tape2.is_empty() {
                break;
            }
            if tape1.len() != 1 || !tape2.is_empty() {
                return Err(CompileError::AmbiguousChain {
                    automaton: automaton.to_owned(),
                    state: current,
                });
            }
            let invocation = tape1[0];
            let effector = self.effectors.get(&invocation.symbol).ok_or_else(|| {
                CompileError::UnknownEffector {
                    automaton: automaton.to_owned(),
                    effector: String::from_utf8_lossy(&invocation.symbol).into_owned(),
                }
            })?;

            // gather this effector's parameter tokens, one per tape-2 edge
            let mut tokens: Vec<Vec<u8>> = Vec::new();
            current = invocation.to;
            loop {
                let tape1 = graph.tape(current, 1);
                let tape2 = graph.tape(current, 2);
                match (tape1.len(), tape2.len()) {
                    (_, 0) => break,
                    (0, 1) => {
                        let edge = tape2[0];
                        self.register_token(&edge.symbol);
                        tokens.push(edge.symbol.clone());
                        current = edge.to;
                    }
                    _ => {
                        return Err(CompileError::AmbiguousChain {
                            automaton: automaton.to_owned(),
                            state: current,
                        })
                    }
                }
            }

            let parameter = if tokens.is_empty() {
                None
            } else {
                Some(self.params.intern(effector, tokens))
            };
            effects.push((effector, parameter));
        }

        let action = match effects.as_slice() {
            [] => ACTION_NIL,
            [(effector, None)] => *effector as i32,
            [(effector, Some(parameter))] => parameterised_action(*effector, *parameter),
            _ => {
                let mut sequence = Vec::with_capacity(effects.len() * 2 + 1);
                for (effector, parameter) in &effects {
                    match parameter {
                        None => sequence.push(*effector as i32),
                        Some(parameter) => {
                            sequence.push(-(*effector as i32));
                            sequence.push(*parameter as i32);
                        }
                    }
                }
                sequence.push(0);
                -(vectors.intern(sequence) as i32)
            }
        };
        Ok((current, action))
    }

    /// Allocate ordinals for symbolic referents as parameter tokens are
    /// first seen.
    fn register_token(&mut self, raw: &[u8]) {
        match Token::classify(raw) {
            (TokenKind::Signal, payload) => {
                self.signals.insert(Bytes::from(payload));
            }
            (TokenKind::Field, payload) if payload != b"*" => {
                self.fields.insert(Bytes::from(payload));
            }
            (TokenKind::Transducer, payload) => {
                self.transducers.insert(Bytes::from(payload));
            }
            _ => {}
        }
    }
}

/// Pad an assembly's filter out to the model's final symbol axis, mapping
/// late-allocated signals onto a dead class.
fn pad_filter(assembly: &Assembly, n_symbols: usize) -> (Vec<u32>, usize) {
    if assembly.filter.len() >= n_symbols {
        return (assembly.filter.clone(), assembly.n_classes);
    }
    let dead = (0..assembly.n_classes).find(|class| {
        assembly
            .rows
            .iter()
            .enumerate()
            .all(|(state, row)| row[*class].is_default_for(state as u32))
    });
    let (dead, columns) = match dead {
        Some(class) => (class as u32, assembly.n_classes),
        None => (assembly.n_classes as u32, assembly.n_classes + 1),
    };
    let mut filter = assembly.filter.clone();
    filter.resize(n_symbols, dead);
    (filter, columns)
}

/// Per-state transition adjacency split by tape.
struct Graph<'a> {
    by_state: HashMap<u32, [Vec<&'a Transition>; 3]>,
    empty: [Vec<&'a Transition>; 3],
}

impl<'a> Graph<'a> {
    fn new(automaton: &'a Automaton) -> Self {
        let mut by_state: HashMap<u32, [Vec<&'a Transition>; 3]> = HashMap::new();
        for transition in &automaton.transitions {
            by_state.entry(transition.from).or_default()[transition.tape as usize]
                .push(transition);
        }
        Self {
            by_state,
            empty: Default::default(),
        }
    }

    fn tape(&self, state: u32, tape: usize) -> &[&'a Transition] {
        self.by_state
            .get(&state)
            .map(|tapes| tapes[tape].as_slice())
            .unwrap_or(self.empty[tape].as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::BaseTarget;

    /// Build automaton text from raw transition rows.
    fn inr(states: u32, transitions: &[(u32, u32, u32, &[u8])]) -> Vec<u8> {
        let mut text = format!("INR3\t{states}\t260\t{}\n", transitions.len()).into_bytes();
        for (from, to, tape, symbol) in transitions {
            text.extend_from_slice(format!("{from}\t{to}\t{tape}\t{}\t", symbol.len()).as_bytes());
            text.extend_from_slice(symbol);
            text.push(b'\n');
        }
        text
    }

    #[test]
    fn nil_chain_and_scalar_effector() {
        let mut target = BaseTarget;
        let mut compiler = ModelCompiler::new(&mut target);
        // 0 -a-> 2 (no effects), 2 -b-> 4 --paste--> 6
        let text = inr(
            8,
            &[
                (0, 2, 0, b"a"),
                (2, 4, 0, b"b"),
                (4, 6, 1, b"paste"),
            ],
        );
        compiler.compile("t", &text);
        assert!(compiler.errors.is_empty(), "{:?}", compiler.errors.errors());
    }

    #[test]
    fn unknown_effector_is_collected() {
        let mut target = BaseTarget;
        let mut compiler = ModelCompiler::new(&mut target);
        let text = inr(4, &[(0, 2, 0, b"a"), (2, 3, 1, b"nonesuch")]);
        compiler.compile("t", &text);
        assert_eq!(compiler.errors.len(), 1);
        assert!(matches!(
            compiler.errors.errors()[0],
            CompileError::UnknownEffector { .. }
        ));
    }

    #[test]
    fn branching_chain_is_ambiguous() {
        let mut target = BaseTarget;
        let mut compiler = ModelCompiler::new(&mut target);
        let text = inr(
            6,
            &[
                (0, 2, 0, b"a"),
                (2, 3, 1, b"paste"),
                (2, 4, 1, b"clear"),
            ],
        );
        compiler.compile("t", &text);
        assert!(matches!(
            compiler.errors.errors()[0],
            CompileError::AmbiguousChain { .. }
        ));
    }

    #[test]
    fn duplicate_symbol_with_distinct_actions() {
        let mut target = BaseTarget;
        let mut compiler = ModelCompiler::new(&mut target);
        let text = inr(
            6,
            &[
                (0, 2, 0, b"a"),
                (0, 3, 0, b"a"),
                (3, 4, 1, b"paste"),
            ],
        );
        compiler.compile("t", &text);
        assert!(matches!(
            compiler.errors.errors()[0],
            CompileError::DuplicateTransition { .. }
        ));
    }

    #[test]
    fn referencing_a_missing_transducer_fails_save() {
        let mut target = BaseTarget;
        let mut compiler = ModelCompiler::new(&mut target);
        // start[@other] where `other` is never compiled
        let text = inr(
            6,
            &[
                (0, 2, 0, b"a"),
                (2, 3, 1, b"start"),
                (3, 4, 2, b"@other"),
            ],
        );
        compiler.compile("t", &text);
        assert!(compiler.errors.is_empty(), "{:?}", compiler.errors.errors());

        let path = std::env::temp_dir().join(format!("ribose-test-{}.model", std::process::id()));
        let result = compiler.save(&path);
        let _ = std::fs::remove_file(&path);
        let errors = result.expect_err("save must fail");
        assert!(errors
            .errors()
            .iter()
            .any(|e| matches!(e, CompileError::UnresolvedTransducer(name) if name == "other")));
    }
}

//! Loaded model: ordinal maps, effector parameters and lazily
//! materialised transducer blobs

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::debug;

use crate::bytes::Bytes;
use crate::consts::{ACTION_NUL, MODEL_VERSION, SIGNAL_BASE};
use crate::effector::{Builtin, BUILTIN_EFFECTOR_COUNT};
use crate::error::ModelError;
use crate::token::{Token, TokenKind};
use crate::transducer::Transducer;

pub(crate) mod codec;

use codec::ModelReader;

/// Insertion-ordered name-to-ordinal map over one ordinal space.
#[derive(Debug, Default)]
pub(crate) struct OrdinalMap {
    base: usize,
    names: Vec<Bytes>,
    index: HashMap<Bytes, usize>,
}

impl OrdinalMap {
    pub fn with_base(base: usize) -> Self {
        Self {
            base,
            names: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Intern `name`, returning its ordinal; existing names keep theirs.
    pub fn insert(&mut self, name: Bytes) -> usize {
        if let Some(ordinal) = self.index.get(&name) {
            return *ordinal;
        }
        let ordinal = self.base + self.names.len();
        self.index.insert(name.clone(), ordinal);
        self.names.push(name);
        ordinal
    }

    pub fn get(&self, name: &[u8]) -> Option<usize> {
        self.index.get(&Bytes::from(name)).copied()
    }

    pub fn name(&self, ordinal: usize) -> Option<&Bytes> {
        ordinal
            .checked_sub(self.base)
            .and_then(|i| self.names.get(i))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn names(&self) -> &[Bytes] {
        &self.names
    }
}

const SLOT_EMPTY: u8 = 0;
const SLOT_LOADING: u8 = 1;
const SLOT_READY: u8 = 2;

/// Lazily materialised transducer slot.
///
/// The state word moves `EMPTY -> LOADING -> READY`; only the requester
/// that wins the CAS decodes the blob, and `LOADING` observers yield until
/// it publishes. A failed load returns the slot to `EMPTY`.
struct BlobSlot {
    state: AtomicU8,
    value: UnsafeCell<Option<Arc<Transducer>>>,
}

// Safety: `value` is written once by the thread that moved the state word
// to LOADING, and read only after observing READY via Acquire.
unsafe impl Sync for BlobSlot {}
unsafe impl Send for BlobSlot {}

impl BlobSlot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SLOT_EMPTY),
            value: UnsafeCell::new(None),
        }
    }

    fn get_or_load<F>(&self, load: F) -> Result<Arc<Transducer>, ModelError>
    where
        F: FnOnce() -> Result<Transducer, ModelError>,
    {
        loop {
            match self.state.compare_exchange(
                SLOT_EMPTY,
                SLOT_LOADING,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return match load() {
                        Ok(transducer) => {
                            let transducer = Arc::new(transducer);
                            unsafe { *self.value.get() = Some(Arc::clone(&transducer)) };
                            self.state.store(SLOT_READY, Ordering::Release);
                            Ok(transducer)
                        }
                        Err(error) => {
                            self.state.store(SLOT_EMPTY, Ordering::Release);
                            Err(error)
                        }
                    };
                }
                Err(SLOT_READY) => {
                    let value = unsafe { (*self.value.get()).as_ref() };
                    return Ok(Arc::clone(value.expect("ready slot holds a value")));
                }
                Err(_) => thread::yield_now(),
            }
        }
    }
}

impl std::fmt::Debug for BlobSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.load(Ordering::Relaxed) {
            SLOT_EMPTY => "empty",
            SLOT_LOADING => "loading",
            _ => "ready",
        };
        write!(f, "BlobSlot({state})")
    }
}

/// A loaded model: read-mostly, shared by reference across transductors.
#[derive(Debug)]
pub struct Model {
    version: String,
    target_name: String,
    signals: OrdinalMap,
    fields: OrdinalMap,
    effectors: OrdinalMap,
    transducers: OrdinalMap,
    offsets: Vec<u64>,
    /// Per effector: compiled parameter token lists, `None` when the
    /// effector takes no parameters.
    parameters: Vec<Option<Vec<Vec<Bytes>>>>,
    blobs: Vec<BlobSlot>,
    file: Mutex<File>,
}

impl Model {
    /// Load a model file, reading the header and trailing index; blobs
    /// stay on disk until first requested.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Arc<Self>, ModelError> {
        let file = File::open(path.as_ref())?;
        let mut reader = ModelReader::new(file);

        let index_position = reader.read_long("index position")?;
        if index_position < 0 {
            return Err(ModelError::Malformed(format!(
                "negative index position {index_position}"
            )));
        }
        let version = reader.read_string("model version")?;
        if version != MODEL_VERSION {
            return Err(ModelError::VersionMismatch {
                expected: MODEL_VERSION.to_owned(),
                found: version,
            });
        }
        let target_name = reader.read_string("target name")?;

        reader.seek(index_position as u64)?;
        let signals = Self::read_map(&mut reader, SIGNAL_BASE, "signal map")?;
        let fields = Self::read_map(&mut reader, 0, "field map")?;
        let effectors = Self::read_map(&mut reader, 0, "effector map")?;
        let transducers = Self::read_map(&mut reader, 0, "transducer map")?;

        for builtin in 0..BUILTIN_EFFECTOR_COUNT {
            let expected = Builtin::from_ordinal(builtin).expect("builtin ordinal");
            match effectors.name(builtin) {
                Some(name) if name.as_slice() == expected.name() => {}
                other => {
                    return Err(ModelError::Malformed(format!(
                        "effector ordinal {builtin} is {:?}, expected {:?}",
                        other.map(Bytes::to_string_lossy),
                        String::from_utf8_lossy(expected.name()),
                    )))
                }
            }
        }

        let mut offsets = Vec::with_capacity(transducers.len());
        for ordinal in 0..transducers.len() {
            let name = Bytes::new(reader.read_bytes("transducer offset table")?);
            if transducers.name(ordinal) != Some(&name) {
                return Err(ModelError::Malformed(format!(
                    "transducer offset table out of order at ordinal {ordinal}"
                )));
            }
            let offset = reader.read_long("transducer offset table")?;
            if offset < 0 {
                return Err(ModelError::Malformed(format!(
                    "negative blob offset for transducer {:?}",
                    name.to_string_lossy()
                )));
            }
            offsets.push(offset as u64);
        }

        let mut parameters = Vec::with_capacity(effectors.len());
        for _ in 0..effectors.len() {
            let count = reader.read_int("effector parameters")?;
            if count < 0 {
                parameters.push(None);
                continue;
            }
            let mut compiled = Vec::with_capacity(count as usize);
            for _ in 0..count {
                compiled.push(reader.read_bytes_array("parameter tokens")?);
            }
            parameters.push(Some(compiled));
        }

        let blobs = (0..transducers.len()).map(|_| BlobSlot::new()).collect();

        debug!(
            target = %target_name,
            signals = signals.len(),
            fields = fields.len(),
            effectors = effectors.len(),
            transducers = transducers.len(),
            "model loaded"
        );

        Ok(Arc::new(Self {
            version,
            target_name,
            signals,
            fields,
            effectors,
            transducers,
            offsets,
            parameters,
            blobs,
            file: Mutex::new(reader.into_inner()),
        }))
    }

    fn read_map(
        reader: &mut ModelReader<File>,
        base: usize,
        context: &'static str,
    ) -> Result<OrdinalMap, ModelError> {
        let mut map = OrdinalMap::with_base(base);
        for name in reader.read_bytes_array(context)? {
            map.insert(name);
        }
        Ok(map)
    }

    /// Version string recorded in the file.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Target class the model was compiled against.
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Count of declared fields, the anonymous field included.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Count of declared signals, built-ins included.
    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }

    /// Resolve a signal name to its ordinal.
    pub fn signal_ordinal(&self, name: &[u8]) -> Option<usize> {
        self.signals.get(name)
    }

    /// Resolve a field name to its ordinal; the anonymous field answers
    /// to the empty name.
    pub fn field_ordinal(&self, name: &[u8]) -> Option<usize> {
        self.fields.get(name)
    }

    /// Resolve a transducer name to its ordinal.
    pub fn transducer_ordinal(&self, name: &[u8]) -> Option<usize> {
        self.transducers.get(name)
    }

    /// Names of the model's transducers, in ordinal order.
    pub fn transducer_names(&self) -> impl Iterator<Item = &[u8]> {
        self.transducers.names().iter().map(Bytes::as_slice)
    }

    pub(crate) fn effector_count(&self) -> usize {
        self.effectors.len()
    }

    pub(crate) fn effector_name(&self, ordinal: usize) -> String {
        self.effectors
            .name(ordinal)
            .map(Bytes::to_string_lossy)
            .unwrap_or_else(|| format!("#{ordinal}"))
    }

    pub(crate) fn effector_names(&self) -> &[Bytes] {
        self.effectors.names()
    }

    pub(crate) fn parameters_for(&self, effector: usize) -> Option<&[Vec<Bytes>]> {
        self.parameters.get(effector)?.as_deref()
    }

    /// Materialise the blob for `ordinal`, loading it on first request.
    pub(crate) fn transducer(&self, ordinal: usize) -> Result<Arc<Transducer>, ModelError> {
        let offset = *self
            .offsets
            .get(ordinal)
            .ok_or(ModelError::UnresolvedOrdinal {
                domain: "transducer",
                ordinal,
            })?;
        self.blobs[ordinal].get_or_load(|| self.load_blob(ordinal, offset))
    }

    fn load_blob(&self, ordinal: usize, offset: u64) -> Result<Transducer, ModelError> {
        let mut file = self.file.lock().expect("model file lock");
        let mut reader = ModelReader::new(&mut *file);
        reader.seek(offset)?;

        let name = reader.read_string("blob name")?;
        let expected = self
            .transducers
            .name(ordinal)
            .map(Bytes::to_string_lossy)
            .unwrap_or_default();
        if name != expected {
            return Err(ModelError::Malformed(format!(
                "blob at offset {offset} is {name:?}, expected {expected:?}"
            )));
        }
        let target = reader.read_string("blob target")?;
        if target != self.target_name {
            return Err(ModelError::TargetMismatch {
                model: self.target_name.clone(),
                requested: target,
            });
        }

        let raw_filter = reader.read_int_array("input filter")?;
        if raw_filter.len() != SIGNAL_BASE + self.signals.len() {
            return Err(ModelError::Malformed(format!(
                "input filter covers {} symbols, model declares {}",
                raw_filter.len(),
                SIGNAL_BASE + self.signals.len()
            )));
        }
        let rows = reader.read_matrix("transition matrix")?;
        let n_classes = rows.first().map(Vec::len).unwrap_or(0);
        let mut filter = Vec::with_capacity(raw_filter.len());
        for class in raw_filter {
            if class < 0 || class as usize >= n_classes {
                return Err(ModelError::Malformed(format!(
                    "input filter class {class} out of range 0..{n_classes}"
                )));
            }
            filter.push(class as u32);
        }

        let vector = reader.read_int_array("effector vector")?;
        validate_vector_references(&rows, &vector)?;

        debug!(
            transducer = %name,
            states = rows.len(),
            classes = n_classes,
            vector = vector.len(),
            "transducer materialised"
        );

        Ok(Transducer::new(name, target, filter, rows, vector))
    }

    /// Classify and resolve a raw parameter token against the ordinal
    /// maps.
    pub(crate) fn resolve_token(&self, raw: &[u8]) -> Result<Token, ModelError> {
        let (kind, payload) = Token::classify(raw);
        let ordinal = match kind {
            TokenKind::Literal => 0,
            TokenKind::Signal => {
                self.signals
                    .get(payload)
                    .ok_or_else(|| ModelError::UnknownSymbol {
                        domain: "signal",
                        name: String::from_utf8_lossy(payload).into_owned(),
                    })?
            }
            TokenKind::Field => {
                self.fields
                    .get(payload)
                    .ok_or_else(|| ModelError::UnknownSymbol {
                        domain: "field",
                        name: String::from_utf8_lossy(payload).into_owned(),
                    })?
            }
            TokenKind::Transducer => {
                self.transducers
                    .get(payload)
                    .ok_or_else(|| ModelError::UnknownSymbol {
                        domain: "transducer",
                        name: String::from_utf8_lossy(payload).into_owned(),
                    })?
            }
        };
        Ok(Token::new(kind, payload.to_vec(), ordinal))
    }
}

/// Check that every negative action lands inside the effector vector on a
/// NUL-terminated sequence.
fn validate_vector_references(
    rows: &[Vec<crate::transducer::Cell>],
    vector: &[i32],
) -> Result<(), ModelError> {
    for row in rows {
        for cell in row {
            if cell.action >= ACTION_NUL {
                continue;
            }
            let offset = (-cell.action) as usize;
            if offset >= vector.len() {
                return Err(ModelError::Malformed(format!(
                    "action references vector offset {offset}, vector length {}",
                    vector.len()
                )));
            }
            let mut index = offset;
            loop {
                match vector.get(index) {
                    Some(0) => break,
                    Some(entry) => {
                        // a negative entry is a parameterised pair; skip
                        // its parameter
                        index += if *entry < 0 { 2 } else { 1 };
                    }
                    None => {
                        return Err(ModelError::Malformed(format!(
                            "vector sequence at offset {offset} is not NUL-terminated"
                        )))
                    }
                }
            }
        }
    }
    Ok(())
}

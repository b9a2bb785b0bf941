//! Assembler: input-equivalence reduction, state classification,
//! superinstruction injection, dead-state elimination and effector-vector
//! packing
//!
//! The compiler hands over a dense `state x symbol` matrix whose actions
//! reference effector-vector ordinals; the assembler reduces it to the
//! kernel form the transductor executes.

use std::collections::HashMap;

use itertools::Itertools;
use tracing::debug;

use crate::bytes::{Ints, Visits};
use crate::consts::{
    parameterised_action, ACTION_NIL, ACTION_NUL, SIGNAL_BASE, SIGNAL_NUL, TOKEN_ESCAPE,
};
use crate::effector::Builtin;
use crate::transducer::Cell;

use super::{EffectVectors, ParamTable};

/// Reduction and injection pass over one compiled transducer.
///
/// The thresholds gate superinstruction injection: `min_sum_size` is the
/// least idempotent-byte count worth an `msum`, `min_product_length` the
/// least byte-chain length worth an `mproduct`.
#[derive(Debug, Clone, Copy)]
pub struct Assembler {
    /// Least idempotent-byte count that classifies a state as Sum.
    pub min_sum_size: usize,
    /// Least walked byte-sequence length worth collapsing into `mproduct`.
    pub min_product_length: usize,
}

impl Default for Assembler {
    fn default() -> Self {
        Self {
            min_sum_size: 64,
            min_product_length: 4,
        }
    }
}

/// Assembled kernel form of one transducer.
#[derive(Debug)]
pub(crate) struct Assembly {
    /// Symbol ordinal to equivalence class.
    pub filter: Vec<u32>,
    /// Reduced matrix, `[state][class]`.
    pub rows: Vec<Vec<Cell>>,
    /// Packed effector vector.
    pub vector: Vec<i32>,
    /// Count of equivalence classes after secondary reduction.
    pub n_classes: usize,
}

/// Disjoint state kinds recognised by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    Plain,
    Scan,
    Sum,
    Product,
}

/// Per-state classification facts over the raw byte range.
#[derive(Debug, Clone, Copy)]
struct Shape {
    kind: Kind,
    /// Bytes that self-loop with NIL, one bit per byte value.
    idempotent: [u64; 4],
    /// The unique `(byte, target)` leaving the state with NIL, if any.
    /// Product walks follow it.
    outbound: Option<(u8, u32)>,
    /// For a Scan state, the single byte outside the idempotent set. Its
    /// transition dispatches normally after the scan, so its action is
    /// unconstrained.
    scan_byte: Option<u8>,
}

impl Assembler {
    /// Reduce, classify, inject, prune and pack one transducer matrix.
    ///
    /// `matrix` is `[state][symbol]` over the full symbol range; actions
    /// referencing effector-vector ordinals are negative. Synthesised
    /// superinstruction parameters are interned through `params` so
    /// repeated payloads share one ordinal.
    pub(crate) fn assemble(
        &self,
        name: &str,
        matrix: Vec<Vec<Cell>>,
        vectors: &EffectVectors,
        params: &mut ParamTable,
    ) -> Assembly {
        let n_states = matrix.len();
        let n_symbols = matrix.first().map(Vec::len).unwrap_or(SIGNAL_BASE);

        // primary reduction: group symbol columns by content
        let (filter, classes) = group_columns(n_symbols, |symbol| {
            column_key(matrix.iter().map(|row| row[symbol]))
        });
        let mut rows: Vec<Vec<Cell>> = matrix
            .iter()
            .map(|row| classes.iter().map(|members| row[members[0]]).collect())
            .collect();
        drop(matrix);

        let shapes = self.classify(&rows, &filter);
        let census = shapes.iter().counts_by(|shape| shape.kind);
        debug!(
            transducer = name,
            scan = census.get(&Kind::Scan).copied().unwrap_or(0),
            sum = census.get(&Kind::Sum).copied().unwrap_or(0),
            product = census.get(&Kind::Product).copied().unwrap_or(0),
            "classified"
        );
        let injected = self.inject(&mut rows, &filter, &classes, &shapes, params);

        let pruned = prune(rows);
        let before_secondary = pruned.first().map(Vec::len).unwrap_or(0);
        let (filter, mut rows, n_classes) = secondary(filter, pruned);
        let vector = pack_vectors(&mut rows, vectors);

        debug!(
            transducer = name,
            states_in = n_states,
            states_out = rows.len(),
            classes_in = classes.len(),
            classes_out = n_classes,
            merged = before_secondary - n_classes,
            scan = injected.0,
            sum = injected.1,
            product = injected.2,
            vector = vector.len(),
            "assembled"
        );

        Assembly {
            filter,
            rows,
            vector,
            n_classes,
        }
    }

    fn classify(&self, rows: &[Vec<Cell>], filter: &[u32]) -> Vec<Shape> {
        rows.iter()
            .enumerate()
            .map(|(state, row)| {
                let state = state as u32;
                let mut idempotent = [0u64; 4];
                let mut idempotent_count = 0usize;
                let mut nul_count = 0usize;
                let mut outbound = None;
                let mut outbound_count = 0usize;
                let mut scan_byte = None;
                for byte in 0..SIGNAL_BASE {
                    let cell = row[filter[byte] as usize];
                    if cell.action == ACTION_NIL && cell.to == state {
                        idempotent[byte >> 6] |= 1u64 << (byte & 63);
                        idempotent_count += 1;
                        continue;
                    }
                    scan_byte = Some(byte as u8);
                    if cell.action == ACTION_NUL {
                        nul_count += 1;
                    } else if cell.action == ACTION_NIL {
                        outbound = Some((byte as u8, cell.to));
                        outbound_count += 1;
                    }
                }
                if outbound_count != 1 {
                    outbound = None;
                }
                let kind = if idempotent_count == 255 {
                    Kind::Scan
                } else if nul_count == 255 && outbound.is_some() {
                    Kind::Product
                } else if idempotent_count >= self.min_sum_size && idempotent_count < 255 {
                    Kind::Sum
                } else {
                    Kind::Plain
                };
                Shape {
                    kind,
                    idempotent,
                    outbound,
                    scan_byte: (idempotent_count == 255).then(|| scan_byte).flatten(),
                }
            })
            .collect()
    }

    /// Rewrite NIL transitions into scan/sum/product superinstructions.
    /// Returns `(scan, sum, product)` injection counts.
    fn inject(
        &self,
        rows: &mut [Vec<Cell>],
        filter: &[u32],
        classes: &[Vec<usize>],
        shapes: &[Shape],
        params: &mut ParamTable,
    ) -> (usize, usize, usize) {
        let nul_class = filter.get(SIGNAL_NUL).map(|c| *c as usize);
        let mut absorbed = vec![false; rows.len()];
        let mut counts = (0usize, 0usize, 0usize);

        for state in 0..rows.len() {
            if absorbed[state] {
                continue;
            }
            for class in 0..classes.len() {
                let cell = rows[state][class];
                if cell.action != ACTION_NIL {
                    continue;
                }
                let target = cell.to as usize;
                match shapes[target].kind {
                    Kind::Scan => {
                        let byte = shapes[target].scan_byte.expect("scan has an exit byte");
                        let parameter =
                            params.intern(Builtin::Mscan.ordinal(), vec![vec![TOKEN_ESCAPE, byte]]);
                        rows[state][class].action =
                            parameterised_action(Builtin::Mscan.ordinal(), parameter);
                        counts.0 += 1;
                    }
                    Kind::Sum => {
                        let mut payload = Vec::with_capacity(33);
                        payload.push(TOKEN_ESCAPE);
                        for word in shapes[target].idempotent {
                            payload.extend_from_slice(&word.to_le_bytes());
                        }
                        let parameter = params.intern(Builtin::Msum.ordinal(), vec![payload]);
                        rows[state][class].action =
                            parameterised_action(Builtin::Msum.ordinal(), parameter);
                        counts.1 += 1;
                    }
                    Kind::Product => {
                        let Some(nul_class) = nul_class else { continue };
                        let Some(&trigger) = classes[class].iter().find(|&&s| s < SIGNAL_BASE)
                        else {
                            continue;
                        };
                        if let Some((last, walked)) =
                            self.walk(target, trigger as u8, rows, shapes, nul_class)
                        {
                            let mut payload = Vec::with_capacity(walked.1.len() + 1);
                            payload.push(TOKEN_ESCAPE);
                            payload.extend_from_slice(&walked.1);
                            let parameter =
                                params.intern(Builtin::Mproduct.ordinal(), vec![payload]);
                            rows[state][class] = Cell {
                                to: last as u32,
                                action: parameterised_action(
                                    Builtin::Mproduct.ordinal(),
                                    parameter,
                                ),
                            };
                            for absorbed_state in walked.0 {
                                absorbed[absorbed_state] = true;
                            }
                            counts.2 += 1;
                        }
                    }
                    Kind::Plain => {}
                }
            }
        }
        counts
    }

    /// Walk a product chain from `start`, collecting the byte sequence the
    /// chain accepts. Terminates on a non-product state, a revisit, or a
    /// `nul`-column mismatch between consecutive steps.
    fn walk(
        &self,
        start: usize,
        trigger: u8,
        rows: &[Vec<Cell>],
        shapes: &[Shape],
        nul_class: usize,
    ) -> Option<(usize, (Vec<usize>, Vec<u8>))> {
        let mut payload = vec![trigger];
        let mut walked: Vec<usize> = Vec::new();
        let mut nul_pattern: Option<Option<Cell>> = None;
        let mut current = start;

        loop {
            if shapes[current].kind != Kind::Product || walked.contains(&current) {
                break;
            }
            // a default nul cell means "no handler"; those are
            // interchangeable across the chain, explicit handlers must
            // match exactly
            let cell = rows[current][nul_class];
            let handler = (!cell.is_default_for(current as u32)).then_some(cell);
            match nul_pattern {
                None => nul_pattern = Some(handler),
                Some(pattern) if pattern == handler => {}
                Some(_) => break,
            }
            let (byte, to) = shapes[current].outbound.expect("product has outbound");
            payload.push(byte);
            walked.push(current);
            current = to as usize;
        }

        if payload.len() >= self.min_product_length.max(2) && !walked.is_empty() {
            let last = *walked.last().expect("walked is non-empty");
            Some((last, (walked, payload)))
        } else {
            None
        }
    }
}

/// Group `n` columns by content equality, returning the column-to-class
/// index and the member lists per class.
fn group_columns<F>(n: usize, column: F) -> (Vec<u32>, Vec<Vec<usize>>)
where
    F: Fn(usize) -> Ints,
{
    let mut index = Vec::with_capacity(n);
    let mut classes: Vec<Vec<usize>> = Vec::new();
    let mut map: HashMap<Ints, usize> = HashMap::new();
    for i in 0..n {
        let class = *map.entry(column(i)).or_insert_with(|| {
            classes.push(Vec::new());
            classes.len() - 1
        });
        index.push(class as u32);
        classes[class].push(i);
    }
    (index, classes)
}

fn column_key<I: Iterator<Item = Cell>>(cells: I) -> Ints {
    Ints::new(
        cells
            .map(|cell| ((cell.to as i64) << 32) | i64::from(cell.action as u32))
            .collect::<Vec<_>>(),
    )
}

/// Drop states unreachable from state 0 and renumber the survivors
/// densely, relabelling every transition target.
fn prune(rows: Vec<Vec<Cell>>) -> Vec<Vec<Cell>> {
    if rows.is_empty() {
        return rows;
    }
    let mut visits = Visits::new(rows.len());
    visits.push(0);
    while let Some(state) = visits.pop() {
        for cell in &rows[state as usize] {
            if cell.action != ACTION_NUL {
                visits.push(cell.to);
            }
        }
    }

    let mut remap = vec![u32::MAX; rows.len()];
    let mut next = 0u32;
    for (state, slot) in remap.iter_mut().enumerate() {
        if visits.visited(state as u32) {
            *slot = next;
            next += 1;
        }
    }

    rows.into_iter()
        .enumerate()
        .filter(|(state, _)| remap[*state] != u32::MAX)
        .map(|(state, row)| {
            let self_ordinal = remap[state];
            row.into_iter()
                .map(|cell| {
                    if cell.action == ACTION_NUL {
                        Cell::default_for(self_ordinal)
                    } else {
                        Cell {
                            to: remap[cell.to as usize],
                            action: cell.action,
                        }
                    }
                })
                .collect()
        })
        .collect()
}

/// Re-run equivalence grouping over the class axis; injection and pruning
/// can leave classes distinguishable only by dead edges.
fn secondary(filter: Vec<u32>, rows: Vec<Vec<Cell>>) -> (Vec<u32>, Vec<Vec<Cell>>, usize) {
    let n_classes = rows.first().map(Vec::len).unwrap_or(0);
    if n_classes == 0 {
        return (filter, rows, 0);
    }
    let (index, classes) = group_columns(n_classes, |class| {
        column_key(rows.iter().map(|row| row[class]))
    });
    let merged_rows: Vec<Vec<Cell>> = rows
        .iter()
        .map(|row| classes.iter().map(|members| row[members[0]]).collect())
        .collect();
    let merged_filter = filter
        .into_iter()
        .map(|class| index[class as usize])
        .collect();
    (merged_filter, merged_rows, classes.len())
}

/// Pack every referenced effector-vector sequence into one array and
/// rewrite ordinal references into negative byte offsets.
fn pack_vectors(rows: &mut [Vec<Cell>], vectors: &EffectVectors) -> Vec<i32> {
    let mut referenced = vec![false; vectors.len()];
    for row in rows.iter() {
        for cell in row {
            if cell.action < 0 {
                referenced[(-cell.action) as usize] = true;
            }
        }
    }

    // offset 0 is the NUL sentinel standing in for ordinal 0
    let mut packed = vec![0i32];
    let mut offsets = vec![0usize; vectors.len()];
    for (ordinal, slot) in offsets.iter_mut().enumerate().skip(1) {
        if referenced[ordinal] {
            *slot = packed.len();
            packed.extend_from_slice(vectors.get(ordinal));
        }
    }

    for row in rows.iter_mut() {
        for cell in row.iter_mut() {
            if cell.action < 0 {
                cell.action = -(offsets[(-cell.action) as usize] as i32);
            }
        }
    }
    packed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::Bytes;
    use crate::effector::BUILTIN_EFFECTOR_COUNT;

    fn nil(to: u32) -> Cell {
        Cell {
            to,
            action: ACTION_NIL,
        }
    }

    /// Full symbol axis with four built-in signal columns, all defaulted.
    fn raw_matrix(states: usize) -> Vec<Vec<Cell>> {
        (0..states)
            .map(|s| vec![Cell::default_for(s as u32); SIGNAL_BASE + 4])
            .collect()
    }

    fn assemble(assembler: &Assembler, matrix: Vec<Vec<Cell>>) -> (Assembly, ParamTable) {
        let vectors = EffectVectors::new();
        let mut params = ParamTable::new(BUILTIN_EFFECTOR_COUNT);
        let assembly = assembler.assemble("test", matrix, &vectors, &mut params);
        (assembly, params)
    }

    #[test]
    fn identical_columns_collapse_to_one_class() {
        let mut matrix = raw_matrix(2);
        for byte in 0..SIGNAL_BASE {
            matrix[0][byte] = nil(0);
        }
        matrix[0][b'x' as usize] = nil(1);

        let (assembly, _) = assemble(&Assembler::default(), matrix);
        // idempotent bytes, the outbound byte, and the defaulted signal
        // columns: three classes
        assert_eq!(assembly.n_classes, 3);
        assert_eq!(assembly.filter[b'a' as usize], assembly.filter[0xff]);
        assert_ne!(assembly.filter[b'a' as usize], assembly.filter[b'x' as usize]);
    }

    #[test]
    fn scan_state_gets_mscan_on_its_self_loop() {
        let mut matrix = raw_matrix(2);
        for byte in 0..SIGNAL_BASE {
            matrix[0][byte] = nil(0);
        }
        matrix[0][0xff] = nil(1);

        let (assembly, params) = assemble(&Assembler::default(), matrix);
        let class = assembly.filter[0x41] as usize;
        let action = assembly.rows[0][class].action;
        let (effector, parameter) = crate::consts::split_action(action);
        assert_eq!(effector, Builtin::Mscan.ordinal());
        assert_eq!(
            params.tokens(Builtin::Mscan.ordinal(), parameter),
            [Bytes::new(vec![TOKEN_ESCAPE, 0xff])]
        );
        // the outbound edge keeps its own action
        let outbound = assembly.rows[0][assembly.filter[0xff] as usize];
        assert_eq!(outbound.action, ACTION_NIL);
    }

    #[test]
    fn sum_state_gets_msum_bitmap() {
        let mut matrix = raw_matrix(2);
        // 128 idempotent bytes, everything else rejected
        for byte in 0..128 {
            matrix[0][byte] = nil(0);
        }
        matrix[0][200] = nil(1);

        let assembler = Assembler {
            min_sum_size: 64,
            min_product_length: 4,
        };
        let (assembly, params) = assemble(&assembler, matrix);
        let class = assembly.filter[5] as usize;
        let (effector, parameter) = crate::consts::split_action(assembly.rows[0][class].action);
        assert_eq!(effector, Builtin::Msum.ordinal());

        let payload = params.tokens(Builtin::Msum.ordinal(), parameter)[0].as_slice();
        assert_eq!(payload[0], TOKEN_ESCAPE);
        assert_eq!(payload.len(), 33);
        // bytes 0..128 set, 128..256 clear
        assert!(payload[1..17].iter().all(|b| *b == 0xff));
        assert!(payload[17..33].iter().all(|b| *b == 0));
    }

    #[test]
    fn product_chain_collapses_to_second_to_last_state() {
        // 0 -a-> 1 -b-> 2 -c-> 3, every other byte rejected
        let mut matrix = raw_matrix(4);
        matrix[0][b'a' as usize] = nil(1);
        matrix[1][b'b' as usize] = nil(2);
        matrix[2][b'c' as usize] = nil(3);

        let assembler = Assembler {
            min_sum_size: 64,
            min_product_length: 2,
        };
        let (assembly, params) = assemble(&assembler, matrix);

        let class = assembly.filter[b'a' as usize] as usize;
        let cell = assembly.rows[0][class];
        let (effector, parameter) = crate::consts::split_action(cell.action);
        assert_eq!(effector, Builtin::Mproduct.ordinal());
        assert_eq!(
            params.tokens(Builtin::Mproduct.ordinal(), parameter),
            [Bytes::new(vec![TOKEN_ESCAPE, b'a', b'b', b'c'])]
        );
        // rewritten edge targets the state the final byte leaves
        let landing = cell.to as usize;
        let final_class = assembly.filter[b'c' as usize] as usize;
        assert_eq!(assembly.rows[landing][final_class].action, ACTION_NIL);
    }

    #[test]
    fn unreachable_states_are_pruned() {
        let mut matrix = raw_matrix(3);
        matrix[0][b'a' as usize] = nil(1);
        // state 2 is never targeted
        matrix[2][b'z' as usize] = nil(0);

        let (assembly, _) = assemble(&Assembler::default(), matrix);
        assert_eq!(assembly.rows.len(), 2);
        for row in &assembly.rows {
            for cell in row {
                assert!((cell.to as usize) < assembly.rows.len());
            }
        }
    }

    #[test]
    fn rebuilding_from_classes_reproduces_the_matrix() {
        // equivalence stability: expanding the reduced matrix through the
        // filter gives back the original columns
        let mut matrix = raw_matrix(2);
        for byte in (0..SIGNAL_BASE).step_by(2) {
            matrix[0][byte] = nil(1);
        }
        matrix[1][7] = nil(0);
        let original = matrix.clone();

        let assembler = Assembler {
            // thresholds high enough that nothing is injected
            min_sum_size: 256,
            min_product_length: 256,
        };
        let (assembly, _) = assemble(&assembler, matrix);
        for (symbol, class) in assembly.filter.iter().enumerate() {
            for state in 0..original.len() {
                assert_eq!(
                    assembly.rows[state][*class as usize],
                    original[state][symbol],
                    "column {symbol} state {state}"
                );
            }
        }
    }

    #[test]
    fn unreferenced_vectors_are_elided_and_offsets_resolve() {
        let mut vectors = EffectVectors::new();
        let sequences: Vec<Vec<i32>> = (0..10).map(|i| vec![2, 3 + i, 0]).collect();
        let ordinals: Vec<usize> = sequences
            .iter()
            .map(|seq| vectors.intern(seq.clone()))
            .collect();

        let mut matrix = raw_matrix(2);
        let referenced = [(b'a', 1usize), (b'b', 4), (b'c', 7)];
        for (byte, ordinal) in referenced {
            matrix[0][byte as usize] = Cell {
                to: 1,
                action: -(ordinals[ordinal] as i32),
            };
        }

        let assembler = Assembler {
            min_sum_size: 256,
            min_product_length: 256,
        };
        let mut params = ParamTable::new(BUILTIN_EFFECTOR_COUNT);
        let assembly = assembler.assemble("test", matrix, &vectors, &mut params);

        // the sentinel plus the three kept sequences, nothing else
        assert_eq!(assembly.vector.len(), 1 + 3 * 3);
        assert_eq!(assembly.vector[0], 0);
        assert_eq!(assembly.vector.last(), Some(&0));
        for (byte, ordinal) in referenced {
            let cell = assembly.rows[0][assembly.filter[byte as usize] as usize];
            assert!(cell.action < 0);
            let offset = (-cell.action) as usize;
            assert_eq!(&assembly.vector[offset..offset + 3], sequences[ordinal]);
        }
    }

    #[quickcheck_macros::quickcheck]
    fn reduction_preserves_every_column(seed: u64) -> bool {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(seed);
        let states = rng.gen_range(2..6u32);
        let mut matrix: Vec<Vec<Cell>> = (0..states)
            .map(|state| {
                (0..SIGNAL_BASE + 4)
                    .map(|_| {
                        if rng.gen_bool(0.7) {
                            Cell::default_for(state)
                        } else {
                            Cell {
                                to: rng.gen_range(0..states),
                                action: *[ACTION_NIL, 2, 3, 4]
                                    .get(rng.gen_range(0..4usize))
                                    .unwrap(),
                            }
                        }
                    })
                    .collect()
            })
            .collect();
        // chain the states so every one is reachable, and keep self-NIL
        // cells out so no state classifies as scan or sum
        for state in 0..states {
            for cell in matrix[state as usize].iter_mut() {
                if cell.action == ACTION_NIL && cell.to == state {
                    *cell = Cell::default_for(state);
                }
            }
            if state + 1 < states {
                matrix[state as usize][state as usize] = nil(state + 1);
            }
        }
        let original = matrix.clone();

        let assembler = Assembler {
            min_sum_size: 999,
            min_product_length: 999,
        };
        let mut params = ParamTable::new(BUILTIN_EFFECTOR_COUNT);
        let vectors = EffectVectors::new();
        let assembly = assembler.assemble("prop", matrix, &vectors, &mut params);

        assembly.rows.len() == original.len()
            && assembly.filter.iter().enumerate().all(|(symbol, class)| {
                (0..original.len()).all(|state| {
                    assembly.rows[state][*class as usize] == original[state][symbol]
                })
            })
    }

    #[test]
    fn shared_payloads_intern_to_one_parameter() {
        // two scan states with the same outbound byte
        let mut matrix = raw_matrix(4);
        for byte in 0..SIGNAL_BASE {
            matrix[0][byte] = nil(0);
            matrix[2][byte] = nil(2);
        }
        matrix[0][0x7f] = nil(2);
        matrix[2][0x7f] = nil(3);
        matrix[1][b'q' as usize] = nil(0);

        let (assembly, params) = assemble(&Assembler::default(), matrix);
        let mut ordinals = Vec::new();
        for row in &assembly.rows {
            for cell in row {
                if cell.action >= crate::consts::ACTION_PARAMETERISED {
                    let (effector, parameter) = crate::consts::split_action(cell.action);
                    if effector == Builtin::Mscan.ordinal() {
                        ordinals.push(parameter);
                    }
                }
            }
        }
        assert!(ordinals.len() >= 2);
        assert!(ordinals.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(params.count(Builtin::Mscan.ordinal()), 1);
    }
}

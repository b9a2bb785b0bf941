//! Test and tooling helpers

/// Builders for hand-written automata, used by the test suites and handy
/// for experimenting without the external FST tool.
pub mod test_helpers {
    use std::ops::RangeInclusive;

    /// Accumulates three-tape transitions and renders them in the
    /// tab-delimited automaton text format.
    #[derive(Debug, Default, Clone)]
    pub struct AutomatonBuilder {
        transitions: Vec<(u32, u32, u32, Vec<u8>)>,
    }

    impl AutomatonBuilder {
        /// Start an empty automaton.
        pub fn new() -> Self {
            Self::default()
        }

        /// Input-tape transition on one byte.
        pub fn byte(mut self, from: u32, to: u32, byte: u8) -> Self {
            self.transitions.push((from, to, 0, vec![byte]));
            self
        }

        /// Input-tape transitions on every byte in `range`, all from
        /// `from` to `to`.
        pub fn byte_range(mut self, from: u32, to: u32, range: RangeInclusive<u8>) -> Self {
            for byte in range {
                self.transitions.push((from, to, 0, vec![byte]));
            }
            self
        }

        /// Input-tape transition on a symbolic token such as `!nul`.
        pub fn symbol(mut self, from: u32, to: u32, symbol: &[u8]) -> Self {
            self.transitions.push((from, to, 0, symbol.to_vec()));
            self
        }

        /// Effector-tape transition.
        pub fn effect(mut self, from: u32, to: u32, effector: &[u8]) -> Self {
            self.transitions.push((from, to, 1, effector.to_vec()));
            self
        }

        /// Parameter-tape transition carrying one token.
        pub fn param(mut self, from: u32, to: u32, token: &[u8]) -> Self {
            self.transitions.push((from, to, 2, token.to_vec()));
            self
        }

        /// Mark a state final.
        pub fn fin(mut self, state: u32) -> Self {
            self.transitions.push((state, 1, 0, Vec::new()));
            self
        }

        /// Render the automaton text.
        pub fn build(self) -> Vec<u8> {
            let states = self
                .transitions
                .iter()
                .map(|(from, to, _, _)| (*from).max(*to) + 1)
                .max()
                .unwrap_or(1);
            let symbols = 260;
            let mut text =
                format!("INR3\t{states}\t{symbols}\t{}\n", self.transitions.len()).into_bytes();
            for (from, to, tape, symbol) in &self.transitions {
                text.extend_from_slice(
                    format!("{from}\t{to}\t{tape}\t{}\t", symbol.len()).as_bytes(),
                );
                text.extend_from_slice(symbol);
                text.push(b'\n');
            }
            text
        }
    }
}

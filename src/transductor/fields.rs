//! Named byte-accumulator fields

use crate::consts::FIELD_INITIAL_CAPACITY;

/// The transductor's field set, one growable byte buffer per declared
/// field ordinal. Allocated at construction, cleared on demand, disposed
/// with the transductor.
#[derive(Debug)]
pub(crate) struct Fields {
    fields: Vec<Vec<u8>>,
}

impl Fields {
    pub fn new(count: usize) -> Self {
        Self {
            fields: (0..count)
                .map(|_| Vec::with_capacity(FIELD_INITIAL_CAPACITY))
                .collect(),
        }
    }

    pub fn get(&self, ordinal: usize) -> Option<&[u8]> {
        self.fields.get(ordinal).map(Vec::as_slice)
    }

    pub fn append(&mut self, ordinal: usize, bytes: &[u8]) {
        if let Some(field) = self.fields.get_mut(ordinal) {
            field.extend_from_slice(bytes);
        }
    }

    pub fn append_byte(&mut self, ordinal: usize, byte: u8) {
        if let Some(field) = self.fields.get_mut(ordinal) {
            field.push(byte);
        }
    }

    pub fn clear(&mut self, ordinal: usize) {
        if let Some(field) = self.fields.get_mut(ordinal) {
            field.clear();
        }
    }

    pub fn clear_all(&mut self) {
        for field in &mut self.fields {
            field.clear();
        }
    }

    /// Append `from`'s content to `to`; `cut` empties the source as well.
    pub fn transfer(&mut self, from: usize, to: usize, cut: bool) {
        if from == to || from >= self.fields.len() || to >= self.fields.len() {
            return;
        }
        let source = std::mem::take(&mut self.fields[from]);
        self.fields[to].extend_from_slice(&source);
        if !cut {
            self.fields[from] = source;
        } else {
            // keep the allocation for reuse
            let mut source = source;
            source.clear();
            self.fields[from] = source;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_clear() {
        let mut fields = Fields::new(2);
        fields.append(0, b"ab");
        fields.append_byte(0, b'c');
        fields.append(1, b"xy");
        assert_eq!(fields.get(0), Some(&b"abc"[..]));

        fields.clear(0);
        assert_eq!(fields.get(0), Some(&b""[..]));
        assert_eq!(fields.get(1), Some(&b"xy"[..]));

        fields.clear_all();
        assert_eq!(fields.get(1), Some(&b""[..]));
    }

    #[test]
    fn copy_keeps_source_cut_empties_it() {
        let mut fields = Fields::new(2);
        fields.append(0, b"seed");
        fields.transfer(0, 1, false);
        assert_eq!(fields.get(0), Some(&b"seed"[..]));
        assert_eq!(fields.get(1), Some(&b"seed"[..]));

        fields.transfer(0, 1, true);
        assert_eq!(fields.get(0), Some(&b""[..]));
        assert_eq!(fields.get(1), Some(&b"seedseed"[..]));
    }

    #[test]
    fn out_of_range_ordinals_are_ignored() {
        let mut fields = Fields::new(1);
        fields.append(3, b"zz");
        assert_eq!(fields.get(3), None);
    }
}

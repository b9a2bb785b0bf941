//! Random-access binary codec for model files
//!
//! All integers are big-endian. Byte arrays and integer arrays are
//! length-prefixed with an `i32`; array-of-array structures prefix a
//! count. The transition matrix is written sparsely, one row at a time,
//! recording only cells that differ from the implicit default
//! `(current_row, NUL)`.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::bytes::Bytes;
use crate::error::ModelError;
use crate::transducer::Cell;

fn truncated(context: &'static str) -> impl FnOnce(io::Error) -> ModelError {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ModelError::Truncated { context }
        } else {
            ModelError::Io(e)
        }
    }
}

/// Sequential writer over a seekable sink.
#[derive(Debug)]
pub(crate) struct ModelWriter<W> {
    sink: W,
}

impl<W: Write + Seek> ModelWriter<W> {
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    pub fn position(&mut self) -> Result<u64, ModelError> {
        Ok(self.sink.stream_position()?)
    }

    pub fn seek(&mut self, position: u64) -> Result<(), ModelError> {
        self.sink.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<W, ModelError> {
        self.sink.flush()?;
        Ok(self.sink)
    }

    pub fn write_int(&mut self, value: i32) -> Result<(), ModelError> {
        self.sink.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    pub fn write_long(&mut self, value: i64) -> Result<(), ModelError> {
        self.sink.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ModelError> {
        self.write_int(bytes.len() as i32)?;
        self.sink.write_all(bytes)?;
        Ok(())
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), ModelError> {
        self.write_bytes(value.as_bytes())
    }

    pub fn write_int_array(&mut self, values: &[i32]) -> Result<(), ModelError> {
        self.write_int(values.len() as i32)?;
        for value in values {
            self.write_int(*value)?;
        }
        Ok(())
    }

    pub fn write_bytes_array(&mut self, values: &[Bytes]) -> Result<(), ModelError> {
        self.write_int(values.len() as i32)?;
        for value in values {
            self.write_bytes(value.as_slice())?;
        }
        Ok(())
    }

    /// Sparse row-major matrix: `rows`, `columns`, then per row a count
    /// and that many `(column, to, effect)` triples.
    pub fn write_matrix(&mut self, rows: &[Vec<Cell>], columns: usize) -> Result<(), ModelError> {
        self.write_int(rows.len() as i32)?;
        self.write_int(columns as i32)?;
        for (state, row) in rows.iter().enumerate() {
            let state = state as u32;
            let explicit = row.iter().filter(|c| !c.is_default_for(state)).count();
            self.write_int(explicit as i32)?;
            for (column, cell) in row.iter().enumerate() {
                if !cell.is_default_for(state) {
                    self.write_int(column as i32)?;
                    self.write_int(cell.to as i32)?;
                    self.write_int(cell.action)?;
                }
            }
        }
        Ok(())
    }
}

/// Sequential reader over a seekable source.
#[derive(Debug)]
pub(crate) struct ModelReader<R> {
    source: R,
}

impl<R: Read + Seek> ModelReader<R> {
    pub fn new(source: R) -> Self {
        Self { source }
    }

    pub fn into_inner(self) -> R {
        self.source
    }

    pub fn seek(&mut self, position: u64) -> Result<(), ModelError> {
        self.source.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    pub fn read_int(&mut self, context: &'static str) -> Result<i32, ModelError> {
        let mut buf = [0u8; 4];
        self.source.read_exact(&mut buf).map_err(truncated(context))?;
        Ok(i32::from_be_bytes(buf))
    }

    pub fn read_long(&mut self, context: &'static str) -> Result<i64, ModelError> {
        let mut buf = [0u8; 8];
        self.source.read_exact(&mut buf).map_err(truncated(context))?;
        Ok(i64::from_be_bytes(buf))
    }

    fn read_len(&mut self, context: &'static str) -> Result<usize, ModelError> {
        let len = self.read_int(context)?;
        if len < 0 {
            return Err(ModelError::Malformed(format!(
                "negative length {len} reading {context}"
            )));
        }
        Ok(len as usize)
    }

    pub fn read_bytes(&mut self, context: &'static str) -> Result<Vec<u8>, ModelError> {
        let len = self.read_len(context)?;
        let mut buf = vec![0u8; len];
        self.source.read_exact(&mut buf).map_err(truncated(context))?;
        Ok(buf)
    }

    pub fn read_string(&mut self, context: &'static str) -> Result<String, ModelError> {
        let bytes = self.read_bytes(context)?;
        String::from_utf8(bytes)
            .map_err(|e| ModelError::Malformed(format!("non-UTF-8 string in {context}: {e}")))
    }

    pub fn read_int_array(&mut self, context: &'static str) -> Result<Vec<i32>, ModelError> {
        let len = self.read_len(context)?;
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            values.push(self.read_int(context)?);
        }
        Ok(values)
    }

    pub fn read_bytes_array(&mut self, context: &'static str) -> Result<Vec<Bytes>, ModelError> {
        let len = self.read_len(context)?;
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            values.push(Bytes::new(self.read_bytes(context)?));
        }
        Ok(values)
    }

    /// Read a sparse matrix back into dense rows with defaults filled in.
    pub fn read_matrix(&mut self, context: &'static str) -> Result<Vec<Vec<Cell>>, ModelError> {
        let rows = self.read_len(context)?;
        let columns = self.read_len(context)?;
        let mut matrix = Vec::with_capacity(rows);
        for state in 0..rows {
            let state = state as u32;
            let mut row = vec![Cell::default_for(state); columns];
            let explicit = self.read_len(context)?;
            for _ in 0..explicit {
                let column = self.read_len(context)?;
                let to = self.read_int(context)?;
                let action = self.read_int(context)?;
                if column >= columns || to < 0 || to as usize >= rows {
                    return Err(ModelError::Malformed(format!(
                        "matrix cell ({state}, {column}) -> {to} out of bounds in {context}"
                    )));
                }
                row[column] = Cell {
                    to: to as u32,
                    action,
                };
            }
            matrix.push(row);
        }
        Ok(matrix)
    }
}

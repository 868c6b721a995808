// embed-core/src/npy.rs

//! Minimal NPY v1.0 encoding for dense `f32` matrices.
//!
//! Only what the shard writer produces is supported: little-endian `<f4`,
//! C order, two-dimensional shape.

use crate::error::{EmbedError, Result};

/// Magic string at the start of every NPY file.
pub const MAGIC: &[u8] = b"\x93NUMPY";

/// Preamble plus header are padded to a multiple of this.
const ALIGNMENT: usize = 64;

/// Length of magic, version and header-length fields in v1.0.
const PREAMBLE_LEN: usize = MAGIC.len() + 2 + 2;

/// Builds the preamble and header for a `(rows, cols)` `<f4` array.
pub fn header(rows: u64, cols: usize) -> Vec<u8> {
    let dict = format!("{{'descr': '<f4', 'fortran_order': False, 'shape': ({rows}, {cols}), }}");

    // Header text ends with a newline and is space-padded to the alignment.
    let unpadded = PREAMBLE_LEN + dict.len() + 1;
    let padding = (ALIGNMENT - unpadded % ALIGNMENT) % ALIGNMENT;
    let header_len = dict.len() + padding + 1;

    let mut out = Vec::with_capacity(PREAMBLE_LEN + header_len);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header_len as u16).to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    out.resize(out.len() + padding, b' ');
    out.push(b'\n');
    out
}

/// Appends `row` as little-endian `f32` values.
pub fn extend_row(buf: &mut Vec<u8>, row: &[f32]) {
    buf.reserve(row.len() * 4);
    for value in row {
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

/// A decoded two-dimensional `f32` array.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    /// Row-major values.
    pub data: Vec<f32>,
}

impl Matrix {
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Encodes the matrix as a complete NPY file.
    pub fn to_npy(&self) -> Vec<u8> {
        let mut out = header(self.rows as u64, self.cols);
        for row in self.data.chunks(self.cols.max(1)) {
            extend_row(&mut out, row);
        }
        out
    }

    /// Decodes an NPY v1.0/v2.0 file holding a 2-D `<f4` C-order array.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the bytes are not such a file.
    pub fn from_npy(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PREAMBLE_LEN || !bytes.starts_with(MAGIC) {
            return Err(EmbedError::serialization("not an NPY file"));
        }

        let major = bytes[MAGIC.len()];
        let (header_len, header_start) = match major {
            1 => (
                u16::from_le_bytes([bytes[8], bytes[9]]) as usize,
                PREAMBLE_LEN,
            ),
            2 if bytes.len() >= 12 => (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12,
            ),
            v => {
                return Err(EmbedError::serialization(format!(
                    "unsupported NPY version {v}"
                )))
            }
        };

        let data_start = header_start + header_len;
        let header = bytes
            .get(header_start..data_start)
            .ok_or_else(|| EmbedError::serialization("truncated NPY header"))?;
        let header = std::str::from_utf8(header)
            .map_err(|_| EmbedError::serialization("NPY header is not ASCII"))?;

        if !header.contains("'descr': '<f4'") {
            return Err(EmbedError::serialization("NPY dtype is not <f4"));
        }
        if !header.contains("'fortran_order': False") {
            return Err(EmbedError::serialization("NPY array is not C-ordered"));
        }
        let (rows, cols) = parse_shape(header)?;

        let payload = &bytes[data_start..];
        if payload.len() != rows * cols * 4 {
            return Err(EmbedError::serialization(format!(
                "NPY payload has {} bytes, shape ({rows}, {cols}) needs {}",
                payload.len(),
                rows * cols * 4
            )));
        }

        let data = payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self { rows, cols, data })
    }
}

fn parse_shape(header: &str) -> Result<(usize, usize)> {
    let invalid = || EmbedError::serialization("NPY header has no valid 2-D shape");

    let start = header.find("'shape': (").ok_or_else(invalid)? + "'shape': (".len();
    let end = start + header[start..].find(')').ok_or_else(invalid)?;

    let dims = header[start..end]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>>>()?;

    match dims.as_slice() {
        [rows, cols] => Ok((*rows, *cols)),
        _ => Err(invalid()),
    }
}

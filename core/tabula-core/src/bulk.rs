//! Binary COPY decoding.
//!
//! Decodes the output of `COPY (<query>) TO STDOUT WITH (FORMAT binary)`.
//! The server sends one length-prefixed message per chunk:
//!
//! ```text
//! first chunk:  | signature + flags (15 B) | ext len: i32 | ext bytes | row frame? |
//! row frame:    | field count: i16 | (len: i32, payload[len])* |
//! trailer:      | -1: i16 |
//! ```
//!
//! All integers are big-endian. A field length of `-1` is NULL. Only three
//! column types are supported: 64-bit integers, 32-bit integers and opaque
//! bytes.

use crate::error::{TabulaError, TabulaResult};

/// Offset of the header-extension length in the first chunk.
pub const HEADER_PREFIX_LEN: usize = 15;

const END_OF_STREAM: i16 = -1;
const NULL_LENGTH: i32 = -1;

/// Expected type of one exported column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkType {
    Int64,
    Int32,
    Bytes,
}

impl BulkType {
    fn fixed_width(self) -> Option<usize> {
        match self {
            BulkType::Int64 => Some(8),
            BulkType::Int32 => Some(4),
            BulkType::Bytes => None,
        }
    }
}

/// One raw decoded field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkValue {
    Null,
    Int64(i64),
    Int32(i32),
    Bytes(Vec<u8>),
}

impl BulkValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            BulkValue::Int64(v) => Some(*v),
            BulkValue::Int32(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            BulkValue::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BulkValue::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, BulkValue::Null)
    }
}

/// Decoder for one export with a fixed column layout.
#[derive(Debug, Clone)]
pub struct BulkDecoder {
    types: Vec<BulkType>,
}

impl BulkDecoder {
    pub fn new(types: impl Into<Vec<BulkType>>) -> Self {
        Self {
            types: types.into(),
        }
    }

    pub fn types(&self) -> &[BulkType] {
        &self.types
    }

    /// Wraps a query for binary export.
    pub fn wrap_query(query: &str) -> String {
        format!("COPY ({query}) TO STDOUT WITH (FORMAT binary)")
    }

    /// Decodes every chunk, handing each row to `mapper`.
    pub fn decode<I, F, R>(&self, chunks: I, mut mapper: F) -> TabulaResult<Vec<R>>
    where
        I: IntoIterator<Item = TabulaResult<Vec<u8>>>,
        F: FnMut(&[BulkValue]) -> TabulaResult<R>,
    {
        let mut out = Vec::new();
        self.for_each(chunks, |row| {
            out.push(mapper(row)?);
            Ok(())
        })?;
        Ok(out)
    }

    /// Streaming form of [`decode`](Self::decode); returns the number of rows.
    pub fn for_each<I, F>(&self, chunks: I, mut visit: F) -> TabulaResult<u64>
    where
        I: IntoIterator<Item = TabulaResult<Vec<u8>>>,
        F: FnMut(&[BulkValue]) -> TabulaResult<()>,
    {
        let mut rows = 0u64;
        let mut first = true;

        for chunk in chunks {
            let chunk = chunk?;
            let frame = if first {
                first = false;
                let body = Self::skip_header(&chunk)?;
                if body.is_empty() {
                    continue;
                }
                body
            } else {
                &chunk[..]
            };

            if let Some(row) = self.decode_frame(frame)? {
                visit(&row).map_err(|e| {
                    TabulaError::decode(format!("row mapper failed: {e}"), frame)
                })?;
                rows += 1;
            }
        }

        if first {
            return Err(TabulaError::decode("export produced no header", &[]));
        }
        Ok(rows)
    }

    /// Returns the part of the first chunk following the header extension.
    fn skip_header(chunk: &[u8]) -> TabulaResult<&[u8]> {
        let mut reader = FrameReader::new(chunk);
        reader.skip(HEADER_PREFIX_LEN)?;
        let ext_len = reader.read_i32()?;
        let ext_len = usize::try_from(ext_len).map_err(|_| {
            TabulaError::decode(format!("negative header extension length {ext_len}"), chunk)
        })?;
        reader.skip(ext_len)?;
        Ok(reader.rest())
    }

    /// Decodes one row frame. The end-of-stream trailer yields `None`.
    pub fn decode_frame(&self, frame: &[u8]) -> TabulaResult<Option<Vec<BulkValue>>> {
        let mut reader = FrameReader::new(frame);
        let count = reader.read_i16()?;
        if count == END_OF_STREAM {
            return Ok(None);
        }
        if usize::try_from(count).ok() != Some(self.types.len()) {
            return Err(TabulaError::decode(
                format!(
                    "frame declares {count} fields, expected {}",
                    self.types.len()
                ),
                frame,
            ));
        }

        let mut row = Vec::with_capacity(self.types.len());
        for (idx, ty) in self.types.iter().enumerate() {
            let len = reader.read_i32()?;
            if len == NULL_LENGTH {
                row.push(BulkValue::Null);
                continue;
            }
            let len = usize::try_from(len).map_err(|_| {
                TabulaError::decode(format!("field {idx} has invalid length {len}"), frame)
            })?;
            if let Some(width) = ty.fixed_width()
                && width != len
            {
                return Err(TabulaError::decode(
                    format!("field {idx} ({ty:?}) has length {len}, expected {width}"),
                    frame,
                ));
            }
            let payload = reader.take(len)?;
            row.push(match ty {
                BulkType::Int64 => BulkValue::Int64(i64::from_be_bytes(fixed(payload))),
                BulkType::Int32 => BulkValue::Int32(i32::from_be_bytes(fixed(payload))),
                BulkType::Bytes => BulkValue::Bytes(payload.to_vec()),
            });
        }

        if !reader.rest().is_empty() {
            return Err(TabulaError::decode(
                format!(
                    "{} trailing bytes after {} fields",
                    reader.rest().len(),
                    self.types.len()
                ),
                frame,
            ));
        }
        Ok(Some(row))
    }
}

fn fixed<const N: usize>(payload: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(payload);
    buf
}

struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> TabulaResult<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let out = &self.buf[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(TabulaError::decode(
                format!(
                    "truncated frame: need {len} bytes at offset {}, have {}",
                    self.pos,
                    self.buf.len() - self.pos
                ),
                self.buf,
            )),
        }
    }

    fn skip(&mut self, len: usize) -> TabulaResult<()> {
        self.take(len).map(|_| ())
    }

    fn read_i16(&mut self) -> TabulaResult<i16> {
        Ok(i16::from_be_bytes(fixed(self.take(2)?)))
    }

    fn read_i32(&mut self) -> TabulaResult<i32> {
        Ok(i32::from_be_bytes(fixed(self.take(4)?)))
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

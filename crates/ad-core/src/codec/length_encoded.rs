//! Length-encoded record format used on the native process's stdin.
//!
//! Each record is written as:
//!
//! ```text
//! [field_count: i32 BE] ([len: i32 BE][utf8 bytes])*
//! ```
//!
//! The native side reads records until end-of-input, so closing the stream
//! is the only end-of-data signal.

use std::io::{self, BufWriter, Read, Write};

/// Upper bound on a single decoded field, to reject corrupt length prefixes.
pub const MAX_FIELD_BYTES: usize = 16 * 1024 * 1024;

/// Upper bound on the number of fields in a decoded record.
pub const MAX_FIELDS: usize = 65_536;

/// Writes length-encoded records to an underlying stream.
#[derive(Debug)]
pub struct LengthEncodedWriter<W: Write> {
    out: BufWriter<W>,
}

impl<W: Write> LengthEncodedWriter<W> {
    /// Wrap a raw output stream.
    pub fn new(out: W) -> Self {
        Self {
            out: BufWriter::new(out),
        }
    }

    /// Write one complete record.
    pub fn write_record<S: AsRef<str>>(&mut self, fields: &[S]) -> io::Result<()> {
        self.write_num_fields(fields.len())?;
        for field in fields {
            self.write_field(field.as_ref())?;
        }
        Ok(())
    }

    /// Write the field-count prefix of a record.
    pub fn write_num_fields(&mut self, count: usize) -> io::Result<()> {
        let count = i32::try_from(count).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "too many fields in record")
        })?;
        self.out.write_all(&count.to_be_bytes())
    }

    /// Write one length-prefixed field.
    pub fn write_field(&mut self, field: &str) -> io::Result<()> {
        let bytes = field.as_bytes();
        let len = i32::try_from(bytes.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "field too long"))?;
        self.out.write_all(&len.to_be_bytes())?;
        self.out.write_all(bytes)
    }

    /// Flush buffered records to the underlying stream.
    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    /// Flush and return the underlying stream.
    pub fn into_inner(self) -> io::Result<W> {
        self.out.into_inner().map_err(|e| e.into_error())
    }

    /// Flush and drop the stream, signalling end-of-input to the reader.
    pub fn close(self) -> io::Result<()> {
        let inner = self.into_inner()?;
        drop(inner);
        Ok(())
    }
}

/// Reads length-encoded records written by [`LengthEncodedWriter`].
#[derive(Debug)]
pub struct LengthEncodedReader<R: Read> {
    input: R,
}

impl<R: Read> LengthEncodedReader<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }

    /// Read the next record.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream between records; a
    /// stream that ends mid-record is an `UnexpectedEof` error.
    pub fn read_record(&mut self) -> io::Result<Option<Vec<String>>> {
        let mut prefix = [0u8; 4];
        match read_exact_or_eof(&mut self.input, &mut prefix)? {
            false => return Ok(None),
            true => {}
        }
        let count = decode_len(prefix, MAX_FIELDS, "field count")?;

        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            self.input.read_exact(&mut prefix)?;
            let len = decode_len(prefix, MAX_FIELD_BYTES, "field length")?;
            let mut buf = vec![0u8; len];
            self.input.read_exact(&mut buf)?;
            let field = String::from_utf8(buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            fields.push(field);
        }
        Ok(Some(fields))
    }
}

impl<R: Read> Iterator for LengthEncodedReader<R> {
    type Item = io::Result<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}

fn decode_len(prefix: [u8; 4], max: usize, what: &str) -> io::Result<usize> {
    let raw = i32::from_be_bytes(prefix);
    let len = usize::try_from(raw).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, format!("negative {}: {}", what, raw))
    })?;
    if len > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} {} exceeds limit {}", what, len, max),
        ));
    }
    Ok(len)
}

/// Fill `buf` completely, or report a clean EOF if no byte was available.
fn read_exact_or_eof<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a record prefix",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

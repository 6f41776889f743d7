// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Writers that map a logical byte stream onto a list of extents. The
//! variants compose by wrapping: a decompressing writer feeds a zero-padding
//! writer, which feeds the direct writer that performs the actual I/O.

use std::{
    io::{self, Write},
    thread,
};

use bzip2::{Decompress, Status};
use flate2::write::GzDecoder;
use thiserror::Error;
use tracing::error;

use crate::{
    format::extent::{self, SPARSE_HOLE},
    protobuf::chromeos_update_engine::Extent,
    stream::WriteAt,
    util,
};

/// Size of the buffer that decompressed data is staged in before being passed
/// to the inner writer.
const OUTPUT_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Extents are full, but {0} bytes remain to be written")]
    ExtentsExhausted(usize),
    #[error("Extent byte offset overflow: block {start_block} with size {block_size}")]
    Overflow { start_block: u64, block_size: u32 },
    #[error("Writer was already ended")]
    AlreadyEnded,
    #[error("{0} bytes of compressed input were not consumed")]
    TrailingData(usize),
    #[error("Compressed stream ended prematurely")]
    TruncatedStream,
    #[error("Failed to decompress bzip2 data")]
    Bzip2(#[from] bzip2::Error),
    #[error("Failed to decompress gzip data")]
    Gzip(#[source] io::Error),
    #[error("Failed to write to partition at offset {offset}")]
    Write {
        offset: u64,
        #[source]
        source: io::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// A sink for a logical byte stream. [`ExtentWriter::end`] must be called
/// exactly once after the last write. Dropping a writer before that is a bug
/// that is reported via the log.
pub trait ExtentWriter {
    fn write(&mut self, data: &[u8]) -> Result<()>;

    fn end(&mut self) -> Result<()>;
}

fn report_not_ended(name: &str, ended: bool) {
    if !ended && !thread::panicking() {
        error!("{name} dropped without end() being called");
    }
}

/// Writes data as-is. Sparse hole extents consume data without doing any I/O.
pub struct DirectExtentWriter<'a, F: ?Sized> {
    file: &'a F,
    extents: Vec<Extent>,
    block_size: u32,
    extent_index: usize,
    extent_written: u64,
    ended: bool,
}

impl<'a, F: WriteAt + ?Sized> DirectExtentWriter<'a, F> {
    pub fn new(file: &'a F, extents: &[Extent], block_size: u32) -> Self {
        Self {
            file,
            extents: extents.to_vec(),
            block_size,
            extent_index: 0,
            extent_written: 0,
            ended: false,
        }
    }

    fn byte_offset(&self, block: u64) -> Result<u64> {
        block
            .checked_mul(u64::from(self.block_size))
            .ok_or(Error::Overflow {
                start_block: block,
                block_size: self.block_size,
            })
    }
}

impl<F: WriteAt + ?Sized> ExtentWriter for DirectExtentWriter<'_, F> {
    fn write(&mut self, mut data: &[u8]) -> Result<()> {
        if self.ended {
            return Err(Error::AlreadyEnded);
        }

        while !data.is_empty() {
            let Some(extent) = self.extents.get(self.extent_index) else {
                return Err(Error::ExtentsExhausted(data.len()));
            };
            let start_block = extent.start_block();
            let extent_size = self.byte_offset(extent.num_blocks())?;

            let n = (extent_size - self.extent_written).min(data.len() as u64) as usize;

            if start_block != SPARSE_HOLE {
                let offset = self
                    .byte_offset(start_block)?
                    .checked_add(self.extent_written)
                    .ok_or(Error::Overflow {
                        start_block,
                        block_size: self.block_size,
                    })?;

                self.file
                    .write_all_at(&data[..n], offset)
                    .map_err(|e| Error::Write { offset, source: e })?;
            }

            self.extent_written += n as u64;
            data = &data[n..];

            if self.extent_written == extent_size {
                self.extent_index += 1;
                self.extent_written = 0;
            }
        }

        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        if self.ended {
            return Err(Error::AlreadyEnded);
        }

        self.ended = true;

        Ok(())
    }
}

impl<F: ?Sized> Drop for DirectExtentWriter<'_, F> {
    fn drop(&mut self) {
        report_not_ended("DirectExtentWriter", self.ended);
    }
}

/// Pads the output with zeros up to the next block boundary when ended.
pub struct ZeroPadExtentWriter<W> {
    inner: W,
    block_size: u32,
    block_offset: u64,
    ended: bool,
}

impl<W: ExtentWriter> ZeroPadExtentWriter<W> {
    pub fn new(inner: W, block_size: u32) -> Self {
        Self {
            inner,
            block_size,
            block_offset: 0,
            ended: false,
        }
    }
}

impl<W: ExtentWriter> ExtentWriter for ZeroPadExtentWriter<W> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.ended {
            return Err(Error::AlreadyEnded);
        }

        self.inner.write(data)?;
        self.block_offset = (self.block_offset + data.len() as u64) % u64::from(self.block_size);

        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        if self.ended {
            return Err(Error::AlreadyEnded);
        }

        self.ended = true;

        if self.block_offset != 0 {
            let mut remaining = u64::from(self.block_size) - self.block_offset;

            while remaining > 0 {
                let n = remaining.min(util::ZEROS.len() as u64) as usize;
                self.inner.write(&util::ZEROS[..n])?;
                remaining -= n as u64;
            }

            self.block_offset = 0;
        }

        self.inner.end()
    }
}

impl<W> Drop for ZeroPadExtentWriter<W> {
    fn drop(&mut self) {
        report_not_ended("ZeroPadExtentWriter", self.ended);
    }
}

/// Decompresses a bzip2 stream. Compressed input that the decoder could not
/// consume yet is carried over to the next write.
pub struct BzipExtentWriter<W> {
    inner: W,
    decoder: Decompress,
    input: Vec<u8>,
    output: Vec<u8>,
    stream_ended: bool,
    ended: bool,
}

impl<W: ExtentWriter> BzipExtentWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            decoder: Decompress::new(false),
            input: vec![],
            output: vec![0u8; OUTPUT_BUFFER_SIZE],
            stream_ended: false,
            ended: false,
        }
    }
}

impl<W: ExtentWriter> ExtentWriter for BzipExtentWriter<W> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.ended {
            return Err(Error::AlreadyEnded);
        }

        self.input.extend_from_slice(data);

        let mut consumed = 0;

        while !self.stream_ended {
            let before_in = self.decoder.total_in();
            let before_out = self.decoder.total_out();

            let status = self
                .decoder
                .decompress(&self.input[consumed..], &mut self.output)?;

            let n_in = (self.decoder.total_in() - before_in) as usize;
            let n_out = (self.decoder.total_out() - before_out) as usize;

            consumed += n_in;

            if n_out > 0 {
                self.inner.write(&self.output[..n_out])?;
            }

            if matches!(status, Status::StreamEnd) {
                self.stream_ended = true;
            } else if n_in == 0 && n_out == 0 {
                // Needs more input.
                break;
            }
        }

        self.input.drain(..consumed);

        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        if self.ended {
            return Err(Error::AlreadyEnded);
        }

        self.ended = true;

        if !self.input.is_empty() {
            return Err(Error::TrailingData(self.input.len()));
        } else if !self.stream_ended {
            return Err(Error::TruncatedStream);
        }

        self.inner.end()
    }
}

impl<W> Drop for BzipExtentWriter<W> {
    fn drop(&mut self) {
        report_not_ended("BzipExtentWriter", self.ended);
    }
}

/// Adapter to let flate2 push decompressed data into an [`ExtentWriter`].
struct Sink<W>(W);

impl<W: ExtentWriter> Write for Sink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Decompresses a gzip stream.
pub struct GzipExtentWriter<W: ExtentWriter> {
    decoder: Option<GzDecoder<Sink<W>>>,
}

impl<W: ExtentWriter> GzipExtentWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            decoder: Some(GzDecoder::new(Sink(inner))),
        }
    }
}

impl<W: ExtentWriter> ExtentWriter for GzipExtentWriter<W> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let decoder = self.decoder.as_mut().ok_or(Error::AlreadyEnded)?;

        // The decoder refuses input past the end of the gzip trailer.
        decoder.write_all(data).map_err(|e| match e.kind() {
            io::ErrorKind::WriteZero => Error::TrailingData(data.len()),
            _ => Error::Gzip(e),
        })
    }

    fn end(&mut self) -> Result<()> {
        let decoder = self.decoder.take().ok_or(Error::AlreadyEnded)?;

        let Sink(mut inner) = decoder.finish().map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::TruncatedStream,
            _ => Error::Gzip(e),
        })?;

        inner.end()
    }
}

impl<W: ExtentWriter> Drop for GzipExtentWriter<W> {
    fn drop(&mut self) {
        report_not_ended("GzipExtentWriter", self.decoder.is_none());
    }
}

/// Write all of `data` and end the writer.
pub fn write_all(mut writer: impl ExtentWriter, data: &[u8]) -> Result<()> {
    writer.write(data)?;
    writer.end()
}

/// Number of bytes a list of extents can hold.
pub fn extents_capacity(extents: &[Extent], block_size: u32) -> u64 {
    extent::total_blocks(extents).saturating_mul(u64::from(block_size))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use crate::{format::extent::new_extent, stream::MutexFile};

    use super::*;

    fn device(size: usize) -> MutexFile<Cursor<Vec<u8>>> {
        MutexFile::new(Cursor::new(vec![0xffu8; size]))
    }

    #[test]
    fn direct_splits_across_extents() {
        let file = device(16);
        let extents = [new_extent(3, 1), new_extent(SPARSE_HOLE, 1), new_extent(0, 2)];

        let mut writer = DirectExtentWriter::new(&file, &extents, 2);
        writer.write(b"ab").unwrap();
        writer.write(b"cdef").unwrap();
        writer.write(b"g").unwrap();
        writer.end().unwrap();
        drop(writer);

        let data = file.into_inner().into_inner();
        assert_eq!(&data[..8], b"efg\xff\xff\xffab");
    }

    #[test]
    fn direct_rejects_overflowing_write() {
        let file = device(8);
        let extents = [new_extent(0, 1)];

        let mut writer = DirectExtentWriter::new(&file, &extents, 4);
        assert_matches!(writer.write(b"abcdef"), Err(Error::ExtentsExhausted(2)));
        writer.end().unwrap();
        assert_matches!(writer.end(), Err(Error::AlreadyEnded));
    }

    #[test]
    fn zero_pad_fills_last_block() {
        let file = device(8);
        let extents = [new_extent(0, 2)];

        let direct = DirectExtentWriter::new(&file, &extents, 4);
        write_all(ZeroPadExtentWriter::new(direct, 4), b"abcde").unwrap();

        assert_eq!(file.into_inner().into_inner(), b"abcde\0\0\0");
    }

    #[test]
    fn zero_pad_aligned_is_untouched() {
        let file = device(8);
        let extents = [new_extent(1, 1)];

        let direct = DirectExtentWriter::new(&file, &extents, 4);
        write_all(ZeroPadExtentWriter::new(direct, 4), b"abcd").unwrap();

        assert_eq!(file.into_inner().into_inner(), b"\xff\xff\xff\xffabcd");
    }

    #[test]
    fn bzip_truncated_stream() {
        let data = {
            use bzip2::{Compression, write::BzEncoder};

            let mut encoder = BzEncoder::new(vec![], Compression::best());
            encoder.write_all(b"foobar").unwrap();
            encoder.finish().unwrap()
        };

        let file = device(8);
        let extents = [new_extent(0, 1)];
        let direct = DirectExtentWriter::new(&file, &extents, 8);

        let mut writer = BzipExtentWriter::new(direct);
        writer.write(&data[..data.len() - 4]).unwrap();
        assert_matches!(writer.end(), Err(Error::TruncatedStream));
    }

    #[test]
    fn bzip_trailing_garbage() {
        let mut data = {
            use bzip2::{Compression, write::BzEncoder};

            let mut encoder = BzEncoder::new(vec![], Compression::best());
            encoder.write_all(b"foobar").unwrap();
            encoder.finish().unwrap()
        };
        data.extend_from_slice(b"junk");

        let file = device(8);
        let extents = [new_extent(0, 1)];
        let direct = DirectExtentWriter::new(&file, &extents, 8);

        let mut writer = BzipExtentWriter::new(direct);
        writer.write(&data).unwrap();
        assert_matches!(writer.end(), Err(Error::TrailingData(4)));
    }
}

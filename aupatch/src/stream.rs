// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use ring::digest::Context;

use crate::util;

/// Extensions for readers to read fixed-size buffers.
pub trait ReadFixedSizeExt {
    /// Read fixed-size array.
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]>;

    /// Read fixed-sized [`Vec`].
    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>>;
}

impl<R: Read> ReadFixedSizeExt for R {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Big-endian integer helpers for the payload header.
pub trait ReadBigEndianExt {
    fn read_u64_be(&mut self) -> io::Result<u64>;
}

impl<R: Read> ReadBigEndianExt for R {
    fn read_u64_be(&mut self) -> io::Result<u64> {
        self.read_array_exact().map(u64::from_be_bytes)
    }
}

pub trait WriteBigEndianExt {
    fn write_u64_be(&mut self, value: u64) -> io::Result<()>;
}

impl<W: Write> WriteBigEndianExt for W {
    fn write_u64_be(&mut self, value: u64) -> io::Result<()> {
        self.write_all(&value.to_be_bytes())
    }
}

/// Extensions for file-like types to query the file size. No guarantees are
/// made about the state of the underlying file position after performing any
/// operation.
pub trait FileLen {
    fn file_len(&self) -> io::Result<u64>;
}

macro_rules! file_len_blanket_impl {
    ($type:ty) => {
        impl<F: ?Sized + FileLen> FileLen for $type {
            fn file_len(&self) -> io::Result<u64> {
                (**self).file_len()
            }
        }
    };
}

file_len_blanket_impl!(&F);
file_len_blanket_impl!(Arc<F>);
file_len_blanket_impl!(Box<F>);

/// Positional reads. Partition devices are only ever accessed through this
/// and [`WriteAt`], so the file position is irrelevant.
pub trait ReadAt: FileLen {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        let size = buf.len();

        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "Expected to read {size} bytes at {}, but reached EOF after {} bytes",
                            offset - (size - buf.len()) as u64,
                            size - buf.len(),
                        ),
                    ));
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

macro_rules! read_at_blanket_impl {
    ($type:ty) => {
        impl<R: ?Sized + ReadAt> ReadAt for $type {
            fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
                (**self).read_at(buf, offset)
            }

            fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
                (**self).read_exact_at(buf, offset)
            }
        }
    };
}

read_at_blanket_impl!(&R);
read_at_blanket_impl!(Arc<R>);
read_at_blanket_impl!(Box<R>);

/// Positional writes. The behavior is unspecified if writes overlap.
pub trait WriteAt: FileLen {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("Failed to write {} bytes at {offset}", buf.len()),
                    ));
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Write `size` zero bytes starting at `offset`.
    fn write_zeros_at(&self, mut offset: u64, mut size: u64) -> io::Result<()> {
        while size > 0 {
            let n = size.min(util::ZEROS.len() as u64) as usize;
            self.write_all_at(&util::ZEROS[..n], offset)?;

            offset += n as u64;
            size -= n as u64;
        }

        Ok(())
    }

    fn file_flush(&self) -> io::Result<()>;
}

macro_rules! write_at_blanket_impl {
    ($type:ty) => {
        impl<W: ?Sized + WriteAt> WriteAt for $type {
            fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
                (**self).write_at(buf, offset)
            }

            fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
                (**self).write_all_at(buf, offset)
            }

            fn write_zeros_at(&self, offset: u64, size: u64) -> io::Result<()> {
                (**self).write_zeros_at(offset, size)
            }

            fn file_flush(&self) -> io::Result<()> {
                (**self).file_flush()
            }
        }
    };
}

write_at_blanket_impl!(&W);
write_at_blanket_impl!(Arc<W>);
write_at_blanket_impl!(Box<W>);

/// This is only needed because `dyn ReadAt + WriteAt` is not a valid construct
/// in Rust yet.
pub trait ReadWriteAt: ReadAt + WriteAt {}

impl<F: ReadAt + WriteAt> ReadWriteAt for F {}

/// A reader wrapper that hashes everything that is read.
pub struct HashingReader<R> {
    inner: R,
    context: Context,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R, context: Context) -> Self {
        Self { inner, context }
    }

    pub fn finish(self) -> (R, Context) {
        (self.inner, self.context)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.context.update(&buf[..n]);
        Ok(n)
    }
}

impl ReadAt for File {
    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        FileExt::seek_read(self, buf, offset)
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        FileExt::read_at(self, buf, offset)
    }
}

impl WriteAt for File {
    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        FileExt::seek_write(self, buf, offset)
    }

    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        FileExt::write_at(self, buf, offset)
    }

    /// Block devices keep written data in the page cache, so this syncs
    /// instead of just flushing userspace buffers.
    fn file_flush(&self) -> io::Result<()> {
        self.sync_data()
    }
}

impl FileLen for File {
    fn file_len(&self) -> io::Result<u64> {
        // Block devices report a zero size in their metadata.
        (&*self).seek(SeekFrom::End(0))
    }
}

/// A file wrapper that implements [`ReadAt`] and [`WriteAt`] on top of
/// [`Read`], [`Write`], and [`Seek`] via a mutex. This is mostly useful for
/// using in-memory buffers as partitions.
pub struct MutexFile<F>(Mutex<F>);

impl<F> MutexFile<F> {
    pub fn new(file: F) -> Self {
        Self(Mutex::new(file))
    }

    pub fn into_inner(self) -> F {
        self.0.into_inner().unwrap()
    }

    /// Run a function with the inner file locked.
    pub fn with_inner<T>(&self, f: impl FnOnce(&mut F) -> T) -> T {
        let mut inner = self.0.lock().unwrap();
        f(&mut inner)
    }
}

impl<F: Seek> FileLen for MutexFile<F> {
    fn file_len(&self) -> io::Result<u64> {
        let mut inner = self.0.lock().unwrap();
        inner.seek(SeekFrom::End(0))
    }
}

impl<F: Read + Seek> ReadAt for MutexFile<F> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut inner = self.0.lock().unwrap();
        inner.seek(SeekFrom::Start(offset))?;
        inner.read(buf)
    }
}

impl<F: Write + Seek> WriteAt for MutexFile<F> {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut inner = self.0.lock().unwrap();
        inner.seek(SeekFrom::Start(offset))?;
        inner.write(buf)
    }

    fn file_flush(&self) -> io::Result<()> {
        let mut inner = self.0.lock().unwrap();
        inner.flush()
    }
}

/// A [`Read`] adapter over a [`ReadAt`] with its own file position.
pub struct UserPosFile<F> {
    file: F,
    offset: u64,
}

impl<F> UserPosFile<F> {
    pub fn new(file: F) -> Self {
        Self { file, offset: 0 }
    }
}

impl<F: ReadAt> Read for UserPosFile<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read_at(buf, self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }
}

/// Returns an I/O error with the [`io::ErrorKind::Interrupted`] type if
/// `cancel_signal` is true. This should be called frequently in I/O loops for
/// cancellation to be responsive.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}

/// Copy exactly `size` bytes from `reader` to `writer`, invoking `inspect`
/// after every buffer read iteration. If `reader` reaches EOF early, an error
/// is returned.
pub fn copy_n_inspect(
    mut reader: impl Read,
    mut writer: impl Write,
    mut size: u64,
    mut inspect: impl FnMut(&[u8]),
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let mut buf = [0u8; 16384];

    while size > 0 {
        check_cancel(cancel_signal)?;

        let to_read = size.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..to_read])?;

        inspect(&buf[..to_read]);

        writer.write_all(&buf[..to_read])?;

        size -= to_read as u64;
    }

    Ok(())
}

/// Read exactly `size` bytes from `reader` and discard them.
pub fn drain_n(reader: impl Read, size: u64, cancel_signal: &AtomicBool) -> io::Result<()> {
    copy_n_inspect(reader, io::sink(), size, |_| {}, cancel_signal)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use ring::digest::SHA256;

    use super::*;

    const FOOBAR_SHA256: [u8; 32] = [
        0xc3, 0xab, 0x8f, 0xf1, 0x37, 0x20, 0xe8, 0xad, 0x90, 0x47, 0xdd, 0x39, 0x46, 0x6b, 0x3c,
        0x89, 0x74, 0xe5, 0x92, 0xc2, 0xfa, 0x38, 0x3d, 0x4a, 0x39, 0x60, 0x71, 0x4c, 0xae, 0xf0,
        0xc4, 0xf2,
    ];

    #[test]
    fn big_endian_helpers() {
        let mut data = vec![];
        data.write_u64_be(0x0102030405060708).unwrap();
        assert_eq!(data, [1, 2, 3, 4, 5, 6, 7, 8]);

        let mut reader = Cursor::new(&data);
        assert_eq!(reader.read_u64_be().unwrap(), 0x0102030405060708);
        assert_eq!(
            reader.read_u64_be().unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof,
        );
    }

    #[test]
    fn mutex_file_positional_io() {
        let file = MutexFile::new(Cursor::new(vec![0u8; 8]));

        file.write_all_at(b"bar", 3).unwrap();
        file.write_zeros_at(4, 1).unwrap();

        let mut buf = [0u8; 4];
        file.read_exact_at(&mut buf, 2).unwrap();
        assert_eq!(&buf, b"\0b\0r");

        assert_eq!(
            file.read_exact_at(&mut buf, 6).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof,
        );
        assert_eq!(file.file_len().unwrap(), 8);
    }

    #[test]
    fn hashing_reader() {
        let reader = UserPosFile::new(MutexFile::new(Cursor::new(b"foobar".to_vec())));
        let mut reader = HashingReader::new(reader, Context::new(&SHA256));

        let mut buf = vec![];
        reader.read_to_end(&mut buf).unwrap();

        let (_, context) = reader.finish();
        assert_eq!(buf, b"foobar");
        assert_eq!(context.finish().as_ref(), FOOBAR_SHA256);
    }

    #[test]
    fn copy_with_cancel() {
        let cancel_signal = AtomicBool::new(false);
        let mut writer = vec![];

        copy_n_inspect(Cursor::new(b"foobar"), &mut writer, 3, |_| {}, &cancel_signal).unwrap();
        assert_eq!(writer, b"foo");

        cancel_signal.store(true, Ordering::SeqCst);
        let err = drain_n(Cursor::new(b"foobar"), 6, &cancel_signal).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}

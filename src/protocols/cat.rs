//! Cat handler.
//!
//! Streams a file to the client in bounded chunks. Each writable turn reads
//! at most `chunk_size` bytes at the current cursor directly into the
//! outbound buffer, so a large file never holds the reactor for longer than
//! one small positional read.

use super::parser::tokenize;
use super::{Response, Step};
use bytes::BytesMut;
use std::ffi::OsStr;
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use tracing::debug;

/// An open file being streamed to one connection.
///
/// Dropping the stream closes the file.
#[derive(Debug)]
pub struct CatStream {
    file: File,
    /// Bytes of the file already copied to the outbound buffer.
    emitted: u64,
    /// Length of a regular file at open time. `None` streams to end of file,
    /// for files that report no size (procfs and the like).
    length: Option<u64>,
}

impl CatStream {
    /// Open `path` read-only. Directories are rejected up front.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        if metadata.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "is a directory",
            ));
        }
        let length = (metadata.is_file() && metadata.len() > 0).then_some(metadata.len());
        Ok(Self {
            file,
            emitted: 0,
            length,
        })
    }

    /// Bytes emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Append the next chunk of the file to `out`.
    ///
    /// A regular file is streamed up to its length at open time; bytes
    /// appended later are not sent. At the end the trailing newline is
    /// appended and `Step::Done` returned. On error `out` is left as it was.
    pub fn produce(&mut self, out: &mut BytesMut, chunk_size: usize) -> io::Result<Step> {
        let want = match self.length {
            Some(length) => length.saturating_sub(self.emitted).min(chunk_size as u64) as usize,
            None => chunk_size,
        };
        if want == 0 {
            out.extend_from_slice(b"\n");
            return Ok(Step::Done);
        }

        let start = out.len();
        out.resize(start + want, 0);

        let n = loop {
            match self.file.read_at(&mut out[start..], self.emitted) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    out.truncate(start);
                    return Err(e);
                }
            }
        };
        out.truncate(start + n);

        // Truncated underneath us.
        if n == 0 {
            out.extend_from_slice(b"\n");
            return Ok(Step::Done);
        }

        self.emitted += n as u64;
        Ok(Step::Continue)
    }
}

impl AsRawFd for CatStream {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Start a cat command from its argument bytes.
///
/// Writes the success marker and returns the stream when the file opens;
/// otherwise writes the error response and returns `None`.
pub fn begin(args: &[u8], out: &mut BytesMut) -> Option<CatStream> {
    let tokens = tokenize(args);
    let Some(name) = tokens.first() else {
        out.extend_from_slice(Response::file_name_required());
        return None;
    };

    let path = Path::new(OsStr::from_bytes(name));
    match CatStream::open(path) {
        Ok(stream) => {
            out.extend_from_slice(Response::success());
            Some(stream)
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "cat open failed");
            out.extend_from_slice(Response::no_such_file());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("cat-{}-{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn drain(stream: &mut CatStream, chunk_size: usize) -> (Vec<u8>, usize) {
        let mut out = BytesMut::new();
        let mut turns = 0;
        loop {
            turns += 1;
            if stream.produce(&mut out, chunk_size).unwrap() == Step::Done {
                return (out.to_vec(), turns);
            }
        }
    }

    #[test]
    fn test_streams_in_chunks() {
        let contents: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let path = temp_file("chunks", &contents);

        for chunk_size in [1, 7, 256, 4096] {
            let mut stream = CatStream::open(&path).unwrap();
            let (out, turns) = drain(&mut stream, chunk_size);

            let mut expected = contents.clone();
            expected.push(b'\n');
            assert_eq!(out, expected);
            assert_eq!(stream.emitted(), contents.len() as u64);
            assert_eq!(turns, contents.len().div_ceil(chunk_size) + 1);
        }

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_empty_file() {
        let path = temp_file("empty", b"");
        let mut stream = CatStream::open(&path).unwrap();
        let (out, turns) = drain(&mut stream, 256);
        assert_eq!(out, b"\n");
        assert_eq!(turns, 1);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_begin_success_marker() {
        let path = temp_file("begin", b"hello");
        let args = format!(" {}", path.display());
        let mut out = BytesMut::new();

        let stream = begin(args.as_bytes(), &mut out);
        assert!(stream.is_some());
        assert_eq!(&out[..], b"S ");
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_begin_missing_file() {
        let mut out = BytesMut::new();
        assert!(begin(b"/definitely/not/here.txt", &mut out).is_none());
        assert_eq!(&out[..], b"E No such file\n");
    }

    /// Descriptors of this process that currently point at `path`.
    #[cfg(target_os = "linux")]
    fn descriptors_for(path: &Path) -> usize {
        let target = path.canonicalize().unwrap();
        std::fs::read_dir("/proc/self/fd")
            .unwrap()
            .filter_map(|entry| std::fs::read_link(entry.ok()?.path()).ok())
            .filter(|link| *link == target)
            .count()
    }

    #[test]
    fn test_length_fixed_at_open() {
        let path = temp_file("growing", b"abcd");
        let mut stream = CatStream::open(&path).unwrap();
        let mut out = BytesMut::new();
        assert_eq!(stream.produce(&mut out, 2).unwrap(), Step::Continue);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut file, b"EXTRA").unwrap();
        drop(file);

        while stream.produce(&mut out, 2).unwrap() == Step::Continue {}
        assert_eq!(&out[..], b"abcd\n");
        assert_eq!(stream.emitted(), 4);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_truncated_mid_stream_ends_early() {
        let path = temp_file("shrinking", b"abcdefgh");
        let mut stream = CatStream::open(&path).unwrap();
        let mut out = BytesMut::new();
        assert_eq!(stream.produce(&mut out, 3).unwrap(), Step::Continue);

        std::fs::write(&path, b"ab").unwrap();
        while stream.produce(&mut out, 3).unwrap() == Step::Continue {}
        assert_eq!(&out[..], b"abc\n");
        std::fs::remove_file(path).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_streams_files_without_size() {
        let mut stream = CatStream::open(Path::new("/proc/self/stat")).unwrap();
        let (out, _) = drain(&mut stream, 16);
        assert!(out.len() > 1);
        assert_eq!(out.last(), Some(&b'\n'));
    }

    #[test]
    fn test_begin_directory() {
        let dir = std::env::temp_dir().join(format!("cat-{}-dir", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        #[cfg(target_os = "linux")]
        let before = descriptors_for(&dir);

        let mut out = BytesMut::new();
        assert!(begin(dir.as_os_str().as_bytes(), &mut out).is_none());
        assert_eq!(&out[..], b"E No such file\n");

        #[cfg(target_os = "linux")]
        assert_eq!(descriptors_for(&dir), before);

        std::fs::remove_dir(dir).unwrap();
    }

    #[test]
    fn test_begin_without_file_name() {
        let mut out = BytesMut::new();
        assert!(begin(b"  \r", &mut out).is_none());
        assert_eq!(&out[..], b"E file name is required.\n");
    }
}

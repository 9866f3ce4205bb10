//! Byte store mapping the contiguous swarm byte space onto disk.
//!
//! Three shapes, decided by the first chunk that passes through:
//!
//! - **Single file**: offsets map 1:1 into one OS file.
//! - **Multi file**: the swarm starts with a UTF-8 spec under the pseudo
//!   filename `META-INF-multifilespec.txt` listing `path size` pairs; the
//!   swarm bytes are the spec followed by the files' concatenation. Reads
//!   and writes binary-search an ordered `(start, end)` table and recurse
//!   across file boundaries.
//! - **Live wrap**: a fixed-size ring holding just the live discard window;
//!   offsets wrap modulo the ring. Whether a wrapped position still holds
//!   live bytes is the hash tree's business, not ours.
//!
//! Until the spec prefix is complete a multi-file store answers `NotReady`
//! for anything but the next spec bytes.

use crate::error::StorageError;

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Pseudo filename that opens a multi-file spec.
pub const MULTIFILE_PATHNAME: &str = "META-INF-multifilespec.txt";

const MULTIFILE_MAX_PATH: usize = 2048;
const MULTIFILE_MAX_LINE: usize = MULTIFILE_MAX_PATH + 1 + 32 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    SpecSizeKnown,
    SpecComplete,
    SingleFile,
    LiveWrap,
}

/// One file of a multi-file swarm, pinned to its slice of the byte space.
struct StorageFile {
    spec_path: String,
    start: u64,
    /// Inclusive.
    end: u64,
    file: fs::File,
}

impl StorageFile {
    fn open(spec_path: &str, os_path: &Path, start: u64, size: u64) -> io::Result<StorageFile> {
        if let Some(dir) = os_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(os_path)?;
        Ok(StorageFile {
            spec_path: spec_path.to_string(),
            start,
            end: start + size.max(1) - 1,
            file,
        })
    }

    fn size(&self) -> u64 {
        self.end + 1 - self.start
    }
}

pub struct Storage {
    state: State,
    os_path: PathBuf,
    dest_dir: PathBuf,
    spec_size: u64,
    files: Vec<StorageFile>,
    single: Option<fs::File>,
    ring_bytes: u64,
}

fn pread(file: &mut fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn pwrite(file: &mut fs::File, buf: &[u8], offset: u64) -> io::Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)?;
    Ok(buf.len())
}

impl Storage {
    /// Open the store for `os_path`. Multi-file swarms resolve their member
    /// paths relative to `dest_dir`. `live_wrap_bytes != 0` selects the
    /// live ring shape.
    pub fn open(
        os_path: &Path,
        dest_dir: &Path,
        live_wrap_bytes: u64,
    ) -> Result<Storage, StorageError> {
        let mut storage = Storage {
            state: State::Init,
            os_path: os_path.to_path_buf(),
            dest_dir: dest_dir.to_path_buf(),
            spec_size: 0,
            files: Vec::new(),
            single: None,
            ring_bytes: live_wrap_bytes,
        };
        if live_wrap_bytes != 0 {
            storage.open_single()?;
            storage.state = State::LiveWrap;
            return Ok(storage);
        }
        if os_path.exists() {
            // Restart: a spec magic at the front reopens the file table,
            // anything else is plain single-file content.
            let mut head = vec![0u8; MULTIFILE_PATHNAME.len()];
            let mut f = fs::File::open(os_path)?;
            let n = pread(&mut f, &mut head, 0)?;
            if n == head.len() && head == MULTIFILE_PATHNAME.as_bytes() {
                storage.reopen_spec()?;
            } else {
                storage.open_single()?;
                storage.state = State::SingleFile;
            }
        }
        Ok(storage)
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            self.state,
            State::SingleFile | State::SpecComplete | State::LiveWrap
        )
    }

    /// Swarm size according to the multi-file spec; `None` for single file
    /// or while the spec is incomplete.
    pub fn size_from_spec(&self) -> Option<u64> {
        if self.state != State::SpecComplete {
            return None;
        }
        self.files.last().map(|sf| sf.end + 1)
    }

    /// Bytes currently on disk behind this store.
    pub fn physical_size(&self) -> u64 {
        match self.state {
            State::SingleFile | State::LiveWrap => self
                .single
                .as_ref()
                .and_then(|f| f.metadata().ok())
                .map(|m| m.len())
                .unwrap_or(0),
            State::SpecComplete => self.files.last().map(|sf| sf.end + 1).unwrap_or(0),
            _ => 0,
        }
    }

    pub fn os_path(&self) -> &Path {
        &self.os_path
    }

    /// Remove the content backing this store from disk.
    pub fn remove_content(self) -> io::Result<()> {
        for sf in &self.files {
            let os = self.dest_dir.join(&sf.spec_path);
            let _ = fs::remove_file(os);
        }
        if self.os_path.exists() {
            fs::remove_file(&self.os_path)?;
        }
        Ok(())
    }

    fn open_single(&mut self) -> Result<(), StorageError> {
        if let Some(dir) = self.os_path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(StorageError::Io)?;
            }
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.os_path)
            .map_err(StorageError::Io)?;
        self.single = Some(file);
        Ok(())
    }

    /// Rebuild the file table from an on-disk spec file (restart path).
    fn reopen_spec(&mut self) -> Result<(), StorageError> {
        let text = fs::read_to_string(&self.os_path).map_err(StorageError::Io)?;
        let first = text.lines().next().ok_or(StorageError::NotReady)?;
        let spec_size = parse_spec_header(first).ok_or(StorageError::NotReady)?;
        self.spec_size = spec_size;
        let spec_os = self.os_path.clone();
        self.files.push(
            StorageFile::open(MULTIFILE_PATHNAME, &spec_os, 0, spec_size)
                .map_err(StorageError::Io)?,
        );
        self.parse_spec(&text[..spec_size.min(text.len() as u64) as usize])?;
        self.state = State::SpecComplete;
        Ok(())
    }

    /*
     * Reading
     */

    pub fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        match self.state {
            State::SingleFile => {
                let f = self.single.as_mut().ok_or(StorageError::NotReady)?;
                pread(f, buf, offset).map_err(StorageError::Io)
            }
            State::LiveWrap => self.ring_read(buf, offset),
            State::SpecComplete => {
                let idx = self.find_file(offset).ok_or(StorageError::OutOfRange(offset))?;
                let (start, end) = (self.files[idx].start, self.files[idx].end);
                let within = (offset - start) as usize;
                let avail = (end + 1 - offset) as usize;
                let head = buf.len().min(avail);
                let n = pread(&mut self.files[idx].file, &mut buf[..head], within as u64)
                    .map_err(StorageError::Io)?;
                if n < head || head == buf.len() || idx + 1 >= self.files.len() {
                    return Ok(n);
                }
                // Continue into the next file.
                let more = self.read(&mut buf[head..], offset + head as u64)?;
                Ok(head + more)
            }
            _ => Err(StorageError::NotReady),
        }
    }

    /*
     * Writing
     */

    pub fn write(&mut self, buf: &[u8], offset: u64) -> Result<usize, StorageError> {
        match self.state {
            State::SingleFile => {
                let f = self.single.as_mut().ok_or(StorageError::NotReady)?;
                pwrite(f, buf, offset).map_err(StorageError::Io)
            }
            State::LiveWrap => self.ring_io_write(buf, offset),
            State::Init => {
                if offset != 0 {
                    // Mode is decided by the swarm's first bytes.
                    return Err(StorageError::NotReady);
                }
                if buf.starts_with(MULTIFILE_PATHNAME.as_bytes()) {
                    let header_end = buf
                        .iter()
                        .position(|&b| b == b'\n')
                        .unwrap_or(buf.len().min(MULTIFILE_MAX_LINE));
                    let header = std::str::from_utf8(&buf[..header_end])
                        .ok()
                        .and_then(parse_spec_header)
                        .ok_or(StorageError::NotReady)?;
                    self.spec_size = header;
                    debug!(spec_size = header, "storage: multi-file spec detected");
                    let spec_os = self.os_path.clone();
                    self.files.push(
                        StorageFile::open(MULTIFILE_PATHNAME, &spec_os, 0, self.spec_size)
                            .map_err(StorageError::Io)?,
                    );
                    self.state = State::SpecSizeKnown;
                    self.write_spec_part(buf, offset)
                } else {
                    self.open_single()?;
                    self.state = State::SingleFile;
                    self.write(buf, offset)
                }
            }
            State::SpecSizeKnown => self.write_spec_part(buf, offset),
            State::SpecComplete => {
                let idx = self.find_file(offset).ok_or(StorageError::OutOfRange(offset))?;
                let (head, tail) = self.write_buffer(idx, buf, offset)?;
                if tail > 0 {
                    let more = self.write(&buf[head..], offset + head as u64)?;
                    Ok(head + more)
                } else {
                    Ok(head)
                }
            }
        }
    }

    /// Write into the spec prefix; completing it parses the file table and
    /// pushes any remaining bytes through the normal path.
    fn write_spec_part(&mut self, buf: &[u8], offset: u64) -> Result<usize, StorageError> {
        if offset >= self.spec_size {
            return Err(StorageError::NotReady);
        }
        let (head, tail) = self.write_buffer(0, buf, offset)?;
        if offset + head as u64 == self.spec_size {
            let text = fs::read_to_string(&self.os_path).map_err(StorageError::Io)?;
            self.parse_spec(&text)?;
            self.state = State::SpecComplete;
            debug!(files = self.files.len(), "storage: multi-file spec complete");
            if tail > 0 {
                let more = self.write(&buf[head..], offset + head as u64)?;
                return Ok(head + more);
            }
        }
        Ok(head)
    }

    /// Write the part of `buf` that fits into file `idx`; returns
    /// (bytes written, bytes left for the next file).
    fn write_buffer(
        &mut self,
        idx: usize,
        buf: &[u8],
        offset: u64,
    ) -> Result<(usize, usize), StorageError> {
        let sf = &mut self.files[idx];
        let within = offset - sf.start;
        if offset + buf.len() as u64 <= sf.end + 1 {
            pwrite(&mut sf.file, buf, within).map_err(StorageError::Io)?;
            Ok((buf.len(), 0))
        } else {
            let head = (sf.end + 1 - offset) as usize;
            pwrite(&mut sf.file, &buf[..head], within).map_err(StorageError::Io)?;
            Ok((head, buf.len() - head))
        }
    }

    /// Binary search for the file owning `offset`.
    fn find_file(&self, offset: u64) -> Option<usize> {
        let mut lo = 0isize;
        let mut hi = self.files.len() as isize - 1;
        while hi >= lo {
            let mid = (lo + hi) / 2;
            let sf = &self.files[mid as usize];
            if offset >= sf.end + 1 {
                lo = mid + 1;
            } else if offset < sf.start {
                hi = mid - 1;
            } else {
                return Some(mid as usize);
            }
        }
        None
    }

    /// Parse the completed spec text and open every listed file.
    fn parse_spec(&mut self, text: &str) -> Result<(), StorageError> {
        let mut offset = 0u64;
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            if line.len() > MULTIFILE_MAX_LINE {
                return Err(StorageError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "multi-file spec line too long",
                )));
            }
            let (path, size) = split_spec_line(line).ok_or_else(|| {
                StorageError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "malformed multi-file spec line",
                ))
            })?;
            if offset == 0 {
                // First line is the spec's own entry.
                offset += self.spec_size;
                continue;
            }
            let rel = sanitize_spec_path(path).ok_or_else(|| {
                StorageError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "multi-file spec path escapes destination",
                ))
            })?;
            let os = self.dest_dir.join(rel);
            if size == 0 {
                // Materialise the empty file but give it no byte space.
                StorageFile::open(path, &os, offset, 0).map_err(StorageError::Io)?;
                continue;
            }
            let sf = StorageFile::open(path, &os, offset, size).map_err(StorageError::Io)?;
            debug!(path, start = offset, size, "storage: spec file");
            self.files.push(sf);
            offset += size;
        }
        if self.files.len() < 2 {
            return Err(StorageError::NotReady);
        }
        Ok(())
    }

    /*
     * Live ring
     */

    fn ring_io_write(&mut self, buf: &[u8], offset: u64) -> Result<usize, StorageError> {
        let ring = self.ring_bytes;
        let file = self.single.as_mut().ok_or(StorageError::NotReady)?;
        let pos = offset % ring;
        if pos + buf.len() as u64 <= ring {
            pwrite(file, buf, pos).map_err(StorageError::Io)
        } else {
            let head = (ring - pos) as usize;
            pwrite(file, &buf[..head], pos).map_err(StorageError::Io)?;
            pwrite(file, &buf[head..], 0).map_err(StorageError::Io)?;
            Ok(buf.len())
        }
    }

    fn ring_read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        let ring = self.ring_bytes;
        let file = self.single.as_mut().ok_or(StorageError::NotReady)?;
        let pos = offset % ring;
        if pos + buf.len() as u64 <= ring {
            pread(file, buf, pos).map_err(StorageError::Io)
        } else {
            let head = (ring - pos) as usize;
            let a = pread(file, &mut buf[..head], pos).map_err(StorageError::Io)?;
            let b = pread(file, &mut buf[head..], 0).map_err(StorageError::Io)?;
            Ok(a + b)
        }
    }
}

/// `META-INF-multifilespec.txt <specsize>` -> specsize.
fn parse_spec_header(line: &str) -> Option<u64> {
    let rest = line.strip_prefix(MULTIFILE_PATHNAME)?.trim_start();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// `path size` with the size in the last space-separated token.
fn split_spec_line(line: &str) -> Option<(&str, u64)> {
    let idx = line.rfind(' ')?;
    let (path, sizestr) = line.split_at(idx);
    let size = sizestr.trim().parse().ok()?;
    if path.is_empty() {
        return None;
    }
    Some((path, size))
}

/// Reject spec paths that would escape the destination directory.
fn sanitize_spec_path(path: &str) -> Option<PathBuf> {
    if path.len() > MULTIFILE_MAX_PATH {
        return None;
    }
    let p = Path::new(path);
    if p.is_absolute() {
        return None;
    }
    for comp in p.components() {
        match comp {
            std::path::Component::Normal(_) => {}
            _ => return None,
        }
    }
    Some(p.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tswift_storage_{tag}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_single_file_roundtrip() {
        let dir = temp_dir("single");
        let path = dir.join("content.dat");
        let mut s = Storage::open(&path, &dir, 0).unwrap();
        assert_eq!(s.write(b"hello world", 0).unwrap(), 11);
        assert_eq!(s.write(b"WORLD", 6).unwrap(), 5);
        let mut buf = [0u8; 11];
        assert_eq!(s.read(&mut buf, 0).unwrap(), 11);
        assert_eq!(&buf, b"hello WORLD");
    }

    #[test]
    fn test_spec_header_parse() {
        assert_eq!(
            parse_spec_header("META-INF-multifilespec.txt 113"),
            Some(113)
        );
        assert_eq!(parse_spec_header("some-other-file.txt 113"), None);
        assert_eq!(split_spec_line("seeder/bunny.ogg 166825767"),
            Some(("seeder/bunny.ogg", 166825767)));
    }

    #[test]
    fn test_init_rejects_mid_swarm_write() {
        let dir = temp_dir("init");
        let path = dir.join("content.dat");
        let mut s = Storage::open(&path, &dir, 0).unwrap();
        assert!(matches!(
            s.write(b"xyz", 100),
            Err(StorageError::NotReady)
        ));
    }

    #[test]
    fn test_live_ring_wraps() {
        let dir = temp_dir("ring");
        let path = dir.join("live.dat");
        let mut s = Storage::open(&path, &dir, 16).unwrap();
        s.write(b"0123456789", 0).unwrap();
        s.write(b"ABCDEFGH", 12).unwrap(); // wraps after 4 bytes
        let mut buf = [0u8; 4];
        s.read(&mut buf, 12).unwrap();
        assert_eq!(&buf, b"ABCD");
        let mut buf = [0u8; 4];
        s.read(&mut buf, 16).unwrap(); // maps to ring start
        assert_eq!(&buf, b"EFGH");
    }

    #[test]
    fn test_path_sanitizer() {
        assert!(sanitize_spec_path("a/b/c.dat").is_some());
        assert!(sanitize_spec_path("/etc/passwd").is_none());
        assert!(sanitize_spec_path("../up.dat").is_none());
    }
}

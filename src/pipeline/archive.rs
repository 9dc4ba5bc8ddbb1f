//! Archive entry writer shared by the streaming and staging producers.

use super::hash::{ChecksumType, HashingReader};
use crate::snapshot::{EntryKind, SourceEntry};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use tar::{Builder, EntryType, Header, HeaderMode};

/// A writer that knows how many bytes went through it.
pub trait Positioned {
    fn position(&self) -> u64;
}

impl Positioned for crate::flow::BufferWriter {
    fn position(&self) -> u64 {
        crate::flow::BufferWriter::position(self)
    }
}

/// Byte-counting writer for the staged archive file.
pub struct CountingWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Positioned for CountingWriter<W> {
    fn position(&self) -> u64 {
        self.count
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub type StagingWriter = CountingWriter<BufWriter<File>>;

/// Where one entry landed in the archive stream.
#[derive(Debug, Clone)]
pub struct Appended {
    pub header_offset: u64,
    pub end_offset: u64,
    pub size: u64,
    pub checksum: Option<String>,
}

#[derive(Debug)]
pub enum EntryError {
    /// The source could not be opened or changed under us. Nothing, or a
    /// complete and consistent entry, was written to the stream.
    Source(io::Error),
    /// Writing to the archive failed mid-entry; the stream is unusable.
    Stream(io::Error),
}

/// Append one source entry to `builder`.
pub fn append_entry<W: Write + Positioned>(
    builder: &mut Builder<W>,
    entry: &SourceEntry,
    checksum: ChecksumType,
) -> std::result::Result<Appended, EntryError> {
    let header_offset = builder.get_ref().position();

    match &entry.kind {
        EntryKind::File => {
            let file = File::open(&entry.path).map_err(EntryError::Source)?;
            let metadata = file.metadata().map_err(EntryError::Source)?;
            let size = metadata.len();

            let mut header = Header::new_gnu();
            header.set_metadata_in_mode(&metadata, HeaderMode::Complete);
            header.set_size(size);

            let mut reader = HashingReader::new(file.take(size), size, checksum);
            builder
                .append_data(&mut header, &entry.name, &mut reader)
                .map_err(EntryError::Stream)?;
            let digest = reader.checksum();

            // the entry is complete, but a file still growing was captured mid-write
            let mut extra = [0u8; 1];
            let mut file = reader.into_inner().into_inner();
            if file.read(&mut extra).map_err(EntryError::Source)? > 0 {
                return Err(EntryError::Source(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{}: file changed as we read it", entry.path.display()),
                )));
            }

            Ok(Appended {
                header_offset,
                end_offset: builder.get_ref().position(),
                size,
                checksum: digest,
            })
        }
        EntryKind::Symlink { target } => {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_mtime((entry.mtime.max(0) / 1_000_000_000) as u64);
            builder
                .append_link(&mut header, &entry.name, target)
                .map_err(EntryError::Stream)?;

            Ok(Appended {
                header_offset,
                end_offset: builder.get_ref().position(),
                size: 0,
                checksum: None,
            })
        }
    }
}

//! Archive codec.
//!
//! An archive is a gzip stream wrapping a small framed container: the magic
//! bytes `CBKA`, a version byte, then a sequence of sections. A section is a
//! tag byte followed by length-prefixed chunks (u32 big-endian) and a zero
//! length terminator. Tag 0 ends the archive. Sections are written as
//! metadata, image (Full only), filesystem, then the optional container log
//! tail. Framing lets the exporter stream sections of unknown length
//! without buffering them.
//!
//! The BLAKE3 checksum covers the *compressed* bytes and is computed while
//! they are produced, so the source streams are read exactly once.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio_util::io::SyncIoBridge;
use uuid::Uuid;

use super::models::{BackupKind, ContainerSnapshot};
use crate::storage::ByteStream;

pub const ARCHIVE_EXTENSION: &str = "cbk.gz";
pub const FORMAT_VERSION: u8 = 1;

const MAGIC: &[u8; 4] = b"CBKA";
const CHUNK_SIZE: usize = 128 * 1024;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("compression level {0} out of range 0-9")]
    InvalidLevel(u32),
    #[error("not a cbkd archive")]
    BadMagic,
    #[error("unsupported archive version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown section tag {0}")]
    UnknownSection(u8),
    #[error("archive frame of {0} bytes exceeds limit")]
    FrameTooLarge(u32),
    #[error("archive has no {0} section")]
    MissingSection(&'static str),
    #[error("archive is malformed: {0}")]
    Malformed(String),
    #[error("invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Errors from the decompressor mean the payload itself is bad.
    fn from_read(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::InvalidData
            | io::ErrorKind::InvalidInput => CodecError::Malformed(err.to_string()),
            _ => CodecError::Io(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Section {
    Metadata = 1,
    Image = 2,
    Filesystem = 3,
    /// Container log tail, when captured.
    Logs = 4,
}

impl Section {
    fn from_tag(tag: u8) -> Result<Option<Section>, CodecError> {
        match tag {
            0 => Ok(None),
            1 => Ok(Some(Section::Metadata)),
            2 => Ok(Some(Section::Image)),
            3 => Ok(Some(Section::Filesystem)),
            4 => Ok(Some(Section::Logs)),
            other => Err(CodecError::UnknownSection(other)),
        }
    }
}

/// Checksum and size of an encoded archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub checksum: String,
    pub size_bytes: u64,
}

pub fn format_checksum(hash: &blake3::Hash) -> String {
    format!("blake3:{}", hash.to_hex())
}

/// Metadata section contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub format_version: u8,
    pub backup_id: Uuid,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub snapshot: ContainerSnapshot,
    pub image_ref: Option<String>,
}

/// Pass-through writer that hashes and counts everything written.
pub struct HashingWriter<W> {
    inner: W,
    hasher: blake3::Hasher,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            written: 0,
        }
    }

    pub fn finish(self) -> (W, Digest) {
        let digest = Digest {
            checksum: format_checksum(&self.hasher.finalize()),
            size_bytes: self.written,
        };
        (self.inner, digest)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct ArchiveWriter<W: Write> {
    encoder: GzEncoder<HashingWriter<W>>,
    buf: Vec<u8>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(out: W, level: u32) -> Result<Self, CodecError> {
        if level > 9 {
            return Err(CodecError::InvalidLevel(level));
        }

        let mut encoder = GzEncoder::new(HashingWriter::new(out), Compression::new(level));
        encoder.write_all(MAGIC)?;
        encoder.write_all(&[FORMAT_VERSION])?;

        Ok(Self {
            encoder,
            buf: vec![0u8; CHUNK_SIZE],
        })
    }

    /// Copy `source` into a new section until EOF. Returns the uncompressed byte count.
    pub fn write_section<R: Read + ?Sized>(
        &mut self,
        section: Section,
        source: &mut R,
    ) -> Result<u64, CodecError> {
        self.encoder.write_all(&[section as u8])?;

        let mut total = 0u64;
        loop {
            let n = match source.read(&mut self.buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.encoder.write_all(&(n as u32).to_be_bytes())?;
            self.encoder.write_all(&self.buf[..n])?;
            total += n as u64;
        }

        self.encoder.write_all(&0u32.to_be_bytes())?;
        Ok(total)
    }

    pub fn finish(mut self) -> Result<(W, Digest), CodecError> {
        self.encoder.write_all(&[0])?;
        let hashing = self.encoder.finish()?;
        Ok(hashing.finish())
    }
}

pub struct ArchiveReader<R: Read> {
    decoder: GzDecoder<R>,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(input: R) -> Result<Self, CodecError> {
        let mut decoder = GzDecoder::new(input);

        let mut header = [0u8; 5];
        decoder
            .read_exact(&mut header)
            .map_err(CodecError::from_read)?;
        if &header[..4] != MAGIC {
            return Err(CodecError::BadMagic);
        }
        if header[4] != FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion(header[4]));
        }

        Ok(Self { decoder })
    }

    /// Next section tag, or None at the end marker.
    pub fn next_section(&mut self) -> Result<Option<Section>, CodecError> {
        let mut tag = [0u8; 1];
        self.decoder
            .read_exact(&mut tag)
            .map_err(CodecError::from_read)?;
        Section::from_tag(tag[0])
    }

    /// Copy the current section's payload into `out`.
    pub fn copy_section<W: Write + ?Sized>(&mut self, out: &mut W) -> Result<u64, CodecError> {
        let mut total = 0u64;
        loop {
            let mut len = [0u8; 4];
            self.decoder
                .read_exact(&mut len)
                .map_err(CodecError::from_read)?;
            let len = u32::from_be_bytes(len);
            if len == 0 {
                return Ok(total);
            }
            if len > MAX_FRAME_LEN {
                return Err(CodecError::FrameTooLarge(len));
            }

            let copied = io::copy(&mut (&mut self.decoder).take(len as u64), out)
                .map_err(CodecError::from_read)?;
            if copied != len as u64 {
                return Err(CodecError::Malformed("truncated frame".into()));
            }
            total += copied;
        }
    }
}

/// Encode an archive into `out` on a blocking worker.
///
/// `out` is typically one half of a `tokio::io::duplex` whose other half is
/// handed to a storage backend, so compression and upload overlap.
pub async fn encode_archive<W>(
    out: W,
    level: u32,
    manifest: &ArchiveManifest,
    image: Option<ByteStream>,
    filesystem: ByteStream,
    logs: Option<ByteStream>,
) -> Result<Digest, CodecError>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let manifest = serde_json::to_vec(manifest)?;
    let out = SyncIoBridge::new(out);
    let image = image.map(SyncIoBridge::new);
    let mut filesystem = SyncIoBridge::new(filesystem);
    let logs = logs.map(SyncIoBridge::new);

    tokio::task::spawn_blocking(move || {
        let mut writer = ArchiveWriter::new(out, level)?;
        writer.write_section(Section::Metadata, &mut manifest.as_slice())?;
        if let Some(mut image) = image {
            writer.write_section(Section::Image, &mut image)?;
        }
        writer.write_section(Section::Filesystem, &mut filesystem)?;
        if let Some(mut logs) = logs {
            writer.write_section(Section::Logs, &mut logs)?;
        }

        let (mut out, digest) = writer.finish()?;
        out.flush()?;
        Ok(digest)
    })
    .await
    .map_err(|e| CodecError::Io(io::Error::other(e)))?
}

/// Sections of a decoded archive, spilled to files under a staging directory.
#[derive(Debug)]
pub struct DecodedArchive {
    pub manifest: ArchiveManifest,
    pub image: Option<PathBuf>,
    pub filesystem: PathBuf,
    pub logs: Option<PathBuf>,
}

/// Decode an archive file into `out_dir`. Blocking.
pub fn decode_archive(archive: &Path, out_dir: &Path) -> Result<DecodedArchive, CodecError> {
    let file = File::open(archive)?;
    let mut reader = ArchiveReader::new(BufReader::with_capacity(CHUNK_SIZE, file))?;

    let mut manifest: Option<ArchiveManifest> = None;
    let mut image = None;
    let mut filesystem = None;
    let mut logs = None;

    while let Some(section) = reader.next_section()? {
        match section {
            Section::Metadata => {
                let mut buf = Vec::new();
                reader.copy_section(&mut buf)?;
                manifest = Some(serde_json::from_slice(&buf)?);
            }
            Section::Image => {
                let path = out_dir.join("image.tar");
                let mut out = File::create(&path)?;
                reader.copy_section(&mut out)?;
                image = Some(path);
            }
            Section::Filesystem => {
                let path = out_dir.join("filesystem.tar");
                let mut out = File::create(&path)?;
                reader.copy_section(&mut out)?;
                filesystem = Some(path);
            }
            Section::Logs => {
                let path = out_dir.join("container.log");
                let mut out = File::create(&path)?;
                reader.copy_section(&mut out)?;
                logs = Some(path);
            }
        }
    }

    let manifest = manifest.ok_or(CodecError::MissingSection("metadata"))?;
    let filesystem = filesystem.ok_or(CodecError::MissingSection("filesystem"))?;
    if manifest.kind == BackupKind::Full && image.is_none() {
        return Err(CodecError::MissingSection("image"));
    }

    Ok(DecodedArchive {
        manifest,
        image,
        filesystem,
        logs,
    })
}

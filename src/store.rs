//! FileStore capability: the only filesystem access the protocol engine has
//!
//! Names passed in are plain file names; every implementation confines them
//! under its own root. All I/O errors come back as `FilesystemFailure`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol_core::{ensure_dir_exists, resolve_under_root};

const STAGING_PREFIX: &str = ".cv-upload-";

pub trait FileStore {
    type Reader;
    type Writer;

    fn exists(&self, name: &str) -> ProtocolResult<bool>;
    fn size(&self, name: &str) -> ProtocolResult<u64>;

    fn open_for_chunked_read(&self, name: &str) -> ProtocolResult<Self::Reader>;
    /// Create `name`; fails if it already exists.
    fn open_for_chunked_write(&self, name: &str) -> ProtocolResult<Self::Writer>;
    /// Hidden temporary file that only becomes `name` on `commit`.
    fn open_staged_write(&self, name: &str) -> ProtocolResult<Self::Writer>;

    /// Read exactly `n` bytes.
    fn read_chunk(&self, reader: &mut Self::Reader, n: usize) -> ProtocolResult<Vec<u8>>;
    fn write_chunk(&self, writer: &mut Self::Writer, data: &[u8]) -> ProtocolResult<()>;

    /// Flush and sync a writer opened with `open_for_chunked_write`.
    fn finish(&self, writer: Self::Writer) -> ProtocolResult<()>;
    /// Flush a staged writer and move it into place as `name`. Never
    /// replaces an existing `name`.
    fn commit(&self, writer: Self::Writer, name: &str) -> ProtocolResult<()>;
    /// Drop a staged writer and remove its temporary file.
    fn discard(&self, writer: Self::Writer);

    /// Regular files, sorted, staging files excluded.
    fn list(&self) -> ProtocolResult<Vec<String>>;
    /// Fails without touching either file if `to` already exists.
    fn rename(&self, from: &str, to: &str) -> ProtocolResult<()>;
    fn remove(&self, name: &str) -> ProtocolResult<()>;
}

pub struct ChunkReader {
    inner: BufReader<File>,
    path: PathBuf,
}

pub struct ChunkWriter {
    inner: BufWriter<File>,
    path: PathBuf,
}

/// FileStore over one directory on local disk.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<data_root>/<username>`, created on first use.
    pub fn for_user(data_root: &Path, username: &str) -> ProtocolResult<Self> {
        let root = resolve_under_root(data_root, username)?;
        ensure_dir_exists(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> ProtocolResult<PathBuf> {
        resolve_under_root(&self.root, name)
    }

    fn create(&self, path: PathBuf) -> ProtocolResult<ChunkWriter> {
        let f = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| ProtocolError::filesystem(&path, e))?;
        Ok(ChunkWriter {
            inner: BufWriter::new(f),
            path,
        })
    }

    fn flush(writer: &mut ChunkWriter) -> ProtocolResult<()> {
        let path = writer.path.clone();
        writer
            .inner
            .flush()
            .map_err(|e| ProtocolError::filesystem(&path, e))?;
        writer
            .inner
            .get_ref()
            .sync_all()
            .map_err(|e| ProtocolError::filesystem(&path, e))
    }
}

impl FileStore for DiskStore {
    type Reader = ChunkReader;
    type Writer = ChunkWriter;

    fn exists(&self, name: &str) -> ProtocolResult<bool> {
        Ok(self.path(name)?.is_file())
    }

    fn size(&self, name: &str) -> ProtocolResult<u64> {
        let path = self.path(name)?;
        let md = fs::metadata(&path).map_err(|e| ProtocolError::filesystem(&path, e))?;
        Ok(md.len())
    }

    fn open_for_chunked_read(&self, name: &str) -> ProtocolResult<ChunkReader> {
        let path = self.path(name)?;
        let f = File::open(&path).map_err(|e| ProtocolError::filesystem(&path, e))?;
        Ok(ChunkReader {
            inner: BufReader::new(f),
            path,
        })
    }

    fn open_for_chunked_write(&self, name: &str) -> ProtocolResult<ChunkWriter> {
        let path = self.path(name)?;
        self.create(path)
    }

    fn open_staged_write(&self, _name: &str) -> ProtocolResult<ChunkWriter> {
        let temp = format!("{}{}", STAGING_PREFIX, uuid::Uuid::new_v4().simple());
        let path = self.root.join(temp);
        self.create(path)
    }

    fn read_chunk(&self, reader: &mut ChunkReader, n: usize) -> ProtocolResult<Vec<u8>> {
        let mut buf = vec![0u8; n];
        reader
            .inner
            .read_exact(&mut buf)
            .map_err(|e| ProtocolError::filesystem(&reader.path, e))?;
        Ok(buf)
    }

    fn write_chunk(&self, writer: &mut ChunkWriter, data: &[u8]) -> ProtocolResult<()> {
        writer
            .inner
            .write_all(data)
            .map_err(|e| ProtocolError::filesystem(&writer.path, e))
    }

    fn finish(&self, mut writer: ChunkWriter) -> ProtocolResult<()> {
        Self::flush(&mut writer)
    }

    fn commit(&self, mut writer: ChunkWriter, name: &str) -> ProtocolResult<()> {
        let dest = self.path(name)?;
        if let Err(e) = Self::flush(&mut writer) {
            self.discard(writer);
            return Err(e);
        }
        let temp = writer.path.clone();
        drop(writer);
        // link fails with AlreadyExists where rename would replace
        let linked = fs::hard_link(&temp, &dest).map_err(|e| ProtocolError::filesystem(&dest, e));
        let _ = fs::remove_file(&temp);
        linked
    }

    fn discard(&self, writer: ChunkWriter) {
        let path = writer.path.clone();
        drop(writer);
        let _ = fs::remove_file(path);
    }

    fn list(&self) -> ProtocolResult<Vec<String>> {
        let rd = fs::read_dir(&self.root).map_err(|e| ProtocolError::filesystem(&self.root, e))?;
        let mut names = Vec::new();
        for entry in rd {
            let entry = entry.map_err(|e| ProtocolError::filesystem(&self.root, e))?;
            let ft = entry
                .file_type()
                .map_err(|e| ProtocolError::filesystem(entry.path(), e))?;
            if !ft.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with(STAGING_PREFIX) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn rename(&self, from: &str, to: &str) -> ProtocolResult<()> {
        let src = self.path(from)?;
        let dst = self.path(to)?;
        fs::hard_link(&src, &dst).map_err(|e| ProtocolError::filesystem(&dst, e))?;
        if let Err(e) = fs::remove_file(&src) {
            let _ = fs::remove_file(&dst);
            return Err(ProtocolError::filesystem(&src, e));
        }
        Ok(())
    }

    fn remove(&self, name: &str) -> ProtocolResult<()> {
        let path = self.path(name)?;
        fs::remove_file(&path).map_err(|e| ProtocolError::filesystem(&path, e))
    }
}

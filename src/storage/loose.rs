//! Loose-object filesystem store.
//!
//! Objects live in their canonical form (`"<kind> <len>\0"` + body) under
//! `<root>/xx/yyyy…`, sharded on the first two hex characters of the id.
//! Writes stream into a temp file in `<root>/tmp`, hash as they go, and
//! atomically rename into place; a second write of the same object is a
//! no-op, which is what makes quarantine promotion and racing pushes safe.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::ZetaError;
use crate::hash::{HashKind, Hasher, ObjectHash};
use crate::internal::object::types::ObjectType;
use crate::internal::object::{AnyObject, ObjectTrait};

/// Buffer size for streamed writes.
const COPY_BUF: usize = 64 << 10;

#[derive(Debug, Clone)]
pub struct LooseStore {
    root: PathBuf,
    hash_kind: HashKind,
}

/// An open blob body with its declared length.
#[derive(Debug)]
pub struct SizedReader {
    pub size: u64,
    pub reader: fs::File,
}

impl LooseStore {
    pub fn open(root: impl Into<PathBuf>, hash_kind: HashKind) -> Result<LooseStore, ZetaError> {
        let root = root.into();
        fs::create_dir_all(root.join("tmp"))?;
        Ok(LooseStore { root, hash_kind })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hash_kind(&self) -> HashKind {
        self.hash_kind
    }

    fn object_path(&self, id: &ObjectHash) -> PathBuf {
        let hex = id.to_string();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    pub fn contains(&self, id: &ObjectHash) -> bool {
        self.object_path(id).is_file()
    }

    /// Read the full canonical form.
    pub fn read_canonical(&self, id: &ObjectHash) -> Result<Vec<u8>, ZetaError> {
        match fs::read(self.object_path(id)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ZetaError::not_found(format!("object {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read and parse an object.
    pub fn read_object(&self, id: &ObjectHash) -> Result<AnyObject, ZetaError> {
        let bytes = self.read_canonical(id)?;
        let object = AnyObject::parse_canonical(&bytes, self.hash_kind)?;
        if object.id() != *id {
            return Err(ZetaError::integrity(format!(
                "loose object {id} hashes to {}",
                object.id()
            )));
        }
        Ok(object)
    }

    /// Open a blob body for reading at `start`. Returns the remaining
    /// length so callers can declare a size to the wire.
    pub fn open_blob(&self, id: &ObjectHash, start: u64) -> Result<SizedReader, ZetaError> {
        let mut file = match fs::File::open(self.object_path(id)) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ZetaError::not_found(format!("object {id}")));
            }
            Err(e) => return Err(e.into()),
        };
        let (kind, body_len, body_offset) = read_header(&mut file)?;
        if kind != ObjectType::Blob {
            return Err(ZetaError::integrity(format!(
                "object {id} is a {kind}, not a blob"
            )));
        }
        if start > body_len {
            return Err(ZetaError::malformed(format!(
                "offset {start} beyond blob of {body_len} bytes"
            )));
        }
        file.seek(SeekFrom::Start(body_offset + start))?;
        Ok(SizedReader {
            size: body_len - start,
            reader: file,
        })
    }

    /// Locate a blob's file together with its body offset and length, for
    /// upload paths that stream straight from disk.
    pub fn blob_location(&self, id: &ObjectHash) -> Result<(PathBuf, u64, u64), ZetaError> {
        let path = self.object_path(id);
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ZetaError::not_found(format!("object {id}")));
            }
            Err(e) => return Err(e.into()),
        };
        let (kind, body_len, body_offset) = read_header(&mut file)?;
        if kind != ObjectType::Blob {
            return Err(ZetaError::integrity(format!(
                "object {id} is a {kind}, not a blob"
            )));
        }
        Ok((path, body_offset, body_len))
    }

    /// Store a canonical byte form under its computed id. Idempotent.
    pub fn write_canonical(&self, bytes: &[u8]) -> Result<ObjectHash, ZetaError> {
        let id = ObjectHash::new(self.hash_kind, bytes);
        let target = self.object_path(&id);
        if target.is_file() {
            return Ok(id);
        }
        let mut tmp = tempfile::NamedTempFile::new_in(self.root.join("tmp"))?;
        tmp.write_all(bytes)?;
        self.commit_tmp(tmp, &target)?;
        Ok(id)
    }

    /// Serialize and store a parsed object.
    pub fn write_object(&self, object: &AnyObject) -> Result<ObjectHash, ZetaError> {
        self.write_canonical(&object.to_canonical()?)
    }

    /// Stream a blob of known size into the store, hashing on write.
    /// Returns the computed id; duplicate content is a no-op.
    pub fn write_blob_stream(
        &self,
        reader: &mut impl Read,
        size: u64,
    ) -> Result<ObjectHash, ZetaError> {
        let mut hasher = Hasher::new_for_object(self.hash_kind, ObjectType::Blob, size);
        let mut tmp = tempfile::NamedTempFile::new_in(self.root.join("tmp"))?;
        tmp.write_all(ObjectType::Blob.to_bytes())?;
        write!(tmp, " {size}\0")?;

        let mut remaining = size;
        let mut buf = vec![0u8; COPY_BUF];
        while remaining > 0 {
            let want = remaining.min(COPY_BUF as u64) as usize;
            let n = reader.read(&mut buf[..want])?;
            if n == 0 {
                return Err(ZetaError::malformed(format!(
                    "blob stream ended {remaining} bytes early"
                )));
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
            remaining -= n as u64;
        }

        let id = hasher.finalize();
        let target = self.object_path(&id);
        if target.is_file() {
            return Ok(id);
        }
        self.commit_tmp(tmp, &target)?;
        Ok(id)
    }

    fn commit_tmp(&self, tmp: tempfile::NamedTempFile, target: &Path) -> Result<(), ZetaError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        match tmp.persist(target) {
            Ok(_) => Ok(()),
            // A concurrent writer finished first; identical content, so
            // losing the race is success.
            Err(e) if target.is_file() => {
                drop(e);
                Ok(())
            }
            Err(e) => Err(e.error.into()),
        }
    }

    /// Every object id currently stored. Used by quarantine promotion.
    pub fn list(&self) -> Result<Vec<ObjectHash>, ZetaError> {
        let mut ids = Vec::new();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            let name = shard.file_name();
            let prefix = name.to_string_lossy();
            if prefix.len() != 2 || !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let rest = entry.file_name().to_string_lossy().to_string();
                if let Ok(id) = format!("{prefix}{rest}").parse::<ObjectHash>() {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    /// Move or copy an object file from another store into this one.
    pub fn adopt(&self, other: &LooseStore, id: &ObjectHash) -> Result<(), ZetaError> {
        let target = self.object_path(id);
        if target.is_file() {
            // Already present; promotion is idempotent.
            fs::remove_file(other.object_path(id)).ok();
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let source = other.object_path(id);
        match fs::rename(&source, &target) {
            Ok(()) => Ok(()),
            // Cross-device fallback.
            Err(_) => {
                fs::copy(&source, &target)?;
                fs::remove_file(&source).ok();
                Ok(())
            }
        }
    }
}

/// Parse the `"<kind> <len>\0"` prefix from an open file, returning the
/// kind, body length and body offset.
fn read_header(file: &mut fs::File) -> Result<(ObjectType, u64, u64), ZetaError> {
    let mut head = [0u8; 32];
    let mut filled = 0;
    let nul = loop {
        let n = file.read(&mut head[filled..])?;
        if n == 0 {
            return Err(ZetaError::malformed("object file shorter than its header"));
        }
        filled += n;
        if let Some(pos) = head[..filled].iter().position(|b| *b == 0) {
            break pos;
        }
        if filled == head.len() {
            return Err(ZetaError::malformed("object header exceeds 32 bytes"));
        }
    };
    let header = &head[..nul];
    let sp = header
        .iter()
        .position(|b| *b == b' ')
        .ok_or_else(|| ZetaError::malformed("object header missing space"))?;
    let kind = ObjectType::from_token(&header[..sp])?;
    let len: u64 = std::str::from_utf8(&header[sp + 1..])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ZetaError::malformed("object header length"))?;
    Ok((kind, len, nul as u64 + 1))
}

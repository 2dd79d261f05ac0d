use std::collections::VecDeque;
use std::fmt;
use std::fmt::{Debug, Formatter};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use bytes::Bytes;
use strum::Display;

use crate::beamline::beam::ProxyChunk;
use crate::beamline::common::{Error, Result};
use crate::beamline::scope::{Scope, ScopeId};

/// An ordered sequence of chunks. send() consumes from the front and leaves
/// unadmitted chunks in place; receive() appends to the back.
pub type Brigade = VecDeque<Chunk>;

/// A source of bytes living in memory owned by the sending side. It must
/// never be read from the receiving thread, so the beam materializes it
/// into a heap chunk on admission.
pub trait ExternalSource: Send {
    /// The number of bytes this source will produce, if known up front.
    fn len(&self) -> Option<u64>;

    /// Materialize the bytes. May block. On error the chunk is left in the
    /// sender's input and must be readable again on a later attempt.
    fn read_all(&mut self) -> Result<Bytes>;
}

/// An opaque chunk the beam cannot translate natively. The beamer registry
/// is consulted for these at receive time.
pub trait CustomChunk: Send {
    fn name(&self) -> &'static str;

    fn len(&self) -> Option<u64>;

    fn as_any(&self) -> &dyn std::any::Any;
}

/// Payload of a metadata/error chunk: a status code plus an optional
/// diagnostic payload, both preserved across the beam.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMeta {
    pub status: u32,
    pub payload: Option<Bytes>,
}

/// A reference to an open file region. Cloning shares the file handle;
/// refcount() reports how many clones exist. The scope id records which
/// lifecycle scope may use the handle, re-homing rebinds it.
#[derive(Clone)]
pub struct FileRef {
    file: Arc<File>,
    offset: u64,
    len: u64,
    scope: ScopeId,
    mmap_allowed: bool,
}

impl FileRef {
    pub fn new(file: Arc<File>, offset: u64, len: u64, scope: &Scope) -> Self {
        FileRef {
            file,
            offset,
            len,
            scope: scope.id(),
            mmap_allowed: true,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn mmap_allowed(&self) -> bool {
        self.mmap_allowed
    }

    /// Memory-mapped access must stay off for handles borrowed across
    /// threads, a stale mapping outlives a changing backing file.
    pub fn disable_mmap(&mut self) {
        self.mmap_allowed = false;
    }

    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.file)
    }

    pub fn rehome(&mut self, scope: &Scope) {
        self.scope = scope.id();
    }

    /// Read the whole referenced region into memory.
    pub fn read(&self) -> Result<Bytes> {
        self.read_range(0, self.len)
    }

    /// Read len bytes starting at rel_offset within the referenced region.
    pub fn read_range(&self, rel_offset: u64, len: u64) -> Result<Bytes> {
        debug_assert!(rel_offset + len <= self.len);
        let mut buf = vec![0u8; len as usize];
        self.file
            .read_exact_at(&mut buf, self.offset + rel_offset)
            .map_err(Error::from)?;
        Ok(Bytes::from(buf))
    }

    fn split_to(&mut self, n: u64) -> FileRef {
        debug_assert!(n <= self.len);
        let mut front = self.clone();
        front.len = n;
        self.offset += n;
        self.len -= n;
        front
    }
}

impl Debug for FileRef {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "FileRef[{}+{}]", self.offset, self.len)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ChunkKind {
    Heap,
    File,
    Mmap,
    External,
    Custom,
    Proxy,
    Eos,
    Flush,
    Error,
}

/// One unit flowing through a beam: opaque data bytes in one of several
/// ownership shapes, or a metadata marker carrying no payload.
pub enum Chunk {
    /// Owns its bytes, safely readable from any thread.
    Heap(Bytes),
    /// References an open file region.
    File(FileRef),
    /// Like File, but the region is memory-mapped by its users.
    Mmap(FileRef),
    /// Bytes pinned in sender-owned memory, materialized on admission.
    External(Box<dyn ExternalSource>),
    /// Extension chunk, translated only by the beamer registry.
    Custom(Box<dyn CustomChunk>),
    /// Receiver-side handle borrowing a sender-side chunk.
    Proxy(ProxyChunk),
    /// End-of-stream marker.
    Eos,
    /// Boundary marker.
    Flush,
    /// Error marker with status and optional diagnostic payload.
    Error(ErrorMeta),
}

impl Chunk {
    pub fn kind(&self) -> ChunkKind {
        match self {
            Chunk::Heap(_) => ChunkKind::Heap,
            Chunk::File(_) => ChunkKind::File,
            Chunk::Mmap(_) => ChunkKind::Mmap,
            Chunk::External(_) => ChunkKind::External,
            Chunk::Custom(_) => ChunkKind::Custom,
            Chunk::Proxy(_) => ChunkKind::Proxy,
            Chunk::Eos => ChunkKind::Eos,
            Chunk::Flush => ChunkKind::Flush,
            Chunk::Error(_) => ChunkKind::Error,
        }
    }

    pub fn is_metadata(&self) -> bool {
        matches!(self, Chunk::Eos | Chunk::Flush | Chunk::Error(_))
    }

    /// The chunk's data length. None until first read for external data
    /// of unknown size. Metadata chunks have length 0.
    pub fn len(&self) -> Option<u64> {
        match self {
            Chunk::Heap(b) => Some(b.len() as u64),
            Chunk::File(f) | Chunk::Mmap(f) => Some(f.len()),
            Chunk::External(src) => src.len(),
            Chunk::Custom(c) => c.len(),
            Chunk::Proxy(p) => Some(p.len()),
            Chunk::Eos | Chunk::Flush | Chunk::Error(_) => Some(0),
        }
    }

    /// The memory footprint this chunk adds to a buffer. File-backed chunks
    /// hold no bytes in memory and count as 0.
    pub fn mem_used(&self) -> u64 {
        match self {
            Chunk::File(_) | Chunk::Mmap(_) => 0,
            other => other.len().unwrap_or(0),
        }
    }

    pub fn can_split(&self) -> bool {
        matches!(
            self,
            Chunk::Heap(_) | Chunk::File(_) | Chunk::Mmap(_) | Chunk::Proxy(_)
        )
    }

    /// Split off the first n bytes as a new chunk, leaving the remainder
    /// in self. Zero-copy for every splittable kind.
    /// Panics if the chunk kind cannot be split (see can_split.)
    pub fn split_to(&mut self, n: u64) -> Chunk {
        match self {
            Chunk::Heap(b) => Chunk::Heap(b.split_to(n as usize)),
            Chunk::File(f) => Chunk::File(f.split_to(n)),
            Chunk::Mmap(f) => Chunk::Mmap(f.split_to(n)),
            Chunk::Proxy(p) => Chunk::Proxy(p.split_to(n)),
            other => panic!("cannot split a {} chunk", other.kind()),
        }
    }

    /// Migrate ownership to another lifecycle scope. Only chunks referencing
    /// kernel objects track a scope; everything else owns its data outright.
    pub fn rehome(&mut self, scope: &Scope) {
        match self {
            Chunk::File(f) | Chunk::Mmap(f) => f.rehome(scope),
            _ => {}
        }
    }
}

impl Debug for Chunk {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.len() {
            Some(len) => write!(f, "{}({})", self.kind(), len),
            None => write!(f, "{}(?)", self.kind()),
        }
    }
}

/// Sum of the determinate data lengths in a brigade.
pub fn brigade_data_len(brigade: &Brigade) -> u64 {
    brigade.iter().filter_map(|c| c.len()).sum()
}

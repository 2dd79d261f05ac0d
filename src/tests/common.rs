use std::fs::File;
use std::io::Write;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use bytes::Bytes;

use crate::beamline::beam::{Beam, BeamOpts, EndpointId};
use crate::beamline::chunk::{Brigade, Chunk, ChunkKind};
use crate::beamline::scope::Scope;

pub const SENDER: EndpointId = EndpointId(1);
pub const RECEIVER: EndpointId = EndpointId(2);

pub fn beam_with(scope: &Scope, max_buf_size: u64) -> Beam {
    let opts = BeamOpts {
        max_buf_size,
        ..BeamOpts::default()
    };
    Beam::new(scope, SENDER, 1, "test", opts)
}

pub fn heap(data: &'static [u8]) -> Chunk {
    Chunk::Heap(Bytes::from_static(data))
}

pub fn brigade(chunks: Vec<Chunk>) -> Brigade {
    chunks.into_iter().collect()
}

pub fn kinds_of(out: &Brigade) -> Vec<ChunkKind> {
    out.iter().map(|c| c.kind()).collect()
}

/// Concatenate the data bytes of a received brigade, reading proxies and
/// file references. Metadata chunks contribute nothing.
pub fn data_of(out: &Brigade) -> Vec<u8> {
    let mut v = Vec::new();
    for c in out {
        match c {
            Chunk::Heap(b) => v.extend_from_slice(&b[..]),
            Chunk::Proxy(p) => v.extend_from_slice(&p.read().unwrap()[..]),
            Chunk::File(f) => v.extend_from_slice(&f.read().unwrap()[..]),
            _ => {}
        }
    }
    v
}

/// Take every proxy chunk out of a brigade, in order. Everything else is
/// dropped.
pub fn proxies_of(out: Brigade) -> Vec<crate::beamline::beam::ProxyChunk> {
    out.into_iter()
        .filter_map(|c| match c {
            Chunk::Proxy(p) => Some(p),
            _ => None,
        })
        .collect()
}

pub fn temp_file(content: &[u8]) -> Arc<File> {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "beamline-test-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Relaxed)
    ));
    let mut f = File::create(&path).unwrap();
    f.write_all(content).unwrap();
    let f = File::open(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    Arc::new(f)
}

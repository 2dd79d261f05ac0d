mod proxy;
mod registry;

pub use proxy::ProxyChunk;
pub use registry::{register_beamer, BeamerFn};
#[cfg(test)]
pub(crate) use registry::clear_beamers as registry_test_reset;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use crate::beamline::chunk::{Brigade, Chunk};
use crate::beamline::common::{Error, Result};
use crate::beamline::config::Settings;
use crate::beamline::scope::{CleanupToken, Scope, WeakScope};

/// Opaque identity of one side of a beam. The beam records the sender's
/// identity at creation and validates it on every role-bound call.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct EndpointId(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockMode {
    /// Suspend until the operation can make progress (bounded by the beam
    /// timeout if one is set.)
    Block,
    /// Fail with a would-block error instead of suspending.
    NonBlock,
}

/// Per-beam options. Usually derived from the process Settings and adjusted
/// per stream with the setters on Beam.
#[derive(Clone, Copy, Debug)]
pub struct BeamOpts {
    /// Send-buffer memory bound in bytes, 0 means unbounded.
    pub max_buf_size: u64,
    /// Bounds each blocking wait, None means wait forever.
    pub timeout: Option<Duration>,
    /// Copy file chunks instead of borrowing the handle across threads.
    pub copy_files: bool,
    /// Account transferred chunks by memory footprint instead of length.
    pub tx_mem_limits: bool,
}

impl Default for BeamOpts {
    fn default() -> Self {
        BeamOpts {
            max_buf_size: 0,
            timeout: None,
            copy_files: false,
            tx_mem_limits: false,
        }
    }
}

impl From<&Settings> for BeamOpts {
    fn from(settings: &Settings) -> Self {
        BeamOpts {
            max_buf_size: settings.max_buf_size(),
            timeout: match settings.timeout_ms() {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            copy_files: settings.copy_files(),
            tx_mem_limits: settings.tx_mem_limits(),
        }
    }
}

/// Snapshot of the beam's transfer counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BeamStats {
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub cons_bytes_reported: u64,
    pub buckets_sent: u64,
}

pub type IoCallback = Arc<dyn Fn(u64) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    consumed_bytes: Option<IoCallback>,
    consumed: Option<EventCallback>,
    was_empty: Option<EventCallback>,
    send_block: Option<EventCallback>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum HoldProxy {
    /// No proxy was created for this entry (metadata, zero-length data,
    /// re-homed files, registry-translated chunks.)
    None,
    /// A proxy is outstanding on the receiver side.
    Live,
    /// The proxy dropped but a live predecessor blocks the release.
    Dropped,
}

struct Held {
    seq: u64,
    chunk: Chunk,
    proxy: HoldProxy,
}

struct BeamState {
    max_buf_size: u64,
    timeout: Option<Duration>,
    copy_files: bool,
    tx_mem_limits: bool,
    /// Chunks handed to the beam, not yet consumed by the receiver.
    send: VecDeque<Chunk>,
    /// Sender-owned chunks whose ownership the receiver borrowed.
    hold: VecDeque<Held>,
    /// Sender-owned chunks ready to be destroyed on the sender thread.
    purge: Vec<Chunk>,
    /// Translated receiver-side overflow from a previous receive.
    recv: VecDeque<Chunk>,
    next_seq: u64,
    sent_bytes: u64,
    received_bytes: u64,
    cons_bytes_reported: u64,
    closed: bool,
    aborted: bool,
    close_sent: bool,
    shutdown: bool,
    hook: Option<(WeakScope, CleanupToken)>,
    cb: Callbacks,
}

impl BeamState {
    fn new(opts: BeamOpts) -> Self {
        BeamState {
            max_buf_size: opts.max_buf_size,
            timeout: opts.timeout,
            copy_files: opts.copy_files,
            tx_mem_limits: opts.tx_mem_limits,
            send: VecDeque::new(),
            hold: VecDeque::new(),
            purge: Vec::new(),
            recv: VecDeque::new(),
            next_seq: 0,
            sent_bytes: 0,
            received_bytes: 0,
            cons_bytes_reported: 0,
            closed: false,
            aborted: false,
            close_sent: false,
            shutdown: false,
            hook: None,
            cb: Callbacks::default(),
        }
    }

    fn is_empty(&self) -> bool {
        self.send.is_empty() && self.recv.is_empty()
    }

    fn buffered_data_len(&self) -> u64 {
        self.send.iter().filter_map(|c| c.len()).sum()
    }

    fn mem_used(&self) -> u64 {
        self.send.iter().map(|c| c.mem_used()).sum()
    }

    fn space_left(&self) -> u64 {
        if self.max_buf_size == 0 {
            u64::MAX
        } else {
            self.max_buf_size.saturating_sub(self.mem_used())
        }
    }

    /// Purged chunks are collected into a graveyard the caller drops after
    /// releasing the lock. A chunk destructor may re-enter a beam.
    fn drain_purge(&mut self, graveyard: &mut Vec<Chunk>) {
        graveyard.append(&mut self.purge);
    }

    fn to_hold(&mut self, chunk: Chunk, proxy: HoldProxy) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.hold.push_back(Held { seq, chunk, proxy });
        seq
    }

    /// Late or aborted writes are absorbed into hold so the chunks are
    /// destroyed on the sender thread at teardown.
    fn absorb(&mut self, chunks: &mut Brigade) {
        while let Some(c) = chunks.pop_front() {
            self.to_hold(c, HoldProxy::None);
        }
    }

    /// Place one chunk into the send queue such that the receiver can
    /// consume it without touching sender-thread-only resources.
    fn admit(
        &mut self,
        mut chunk: Chunk,
        space_left: &mut u64,
        rest: &mut Brigade,
        beam_scope: &Scope,
        graveyard: &mut Vec<Chunk>,
    ) -> Result<()> {
        if chunk.is_metadata() {
            chunk.rehome(beam_scope);
            self.send.push_back(chunk);
            return Ok(());
        }
        if chunk.len() == Some(0) && !matches!(chunk, Chunk::Custom(_)) {
            graveyard.push(chunk);
            return Ok(());
        }
        // files and mmaps the receiver may borrow transfer at zero memory cost
        let borrowable = match &chunk {
            Chunk::File(f) => !self.copy_files && f.refcount() == 1,
            Chunk::Mmap(_) => !self.copy_files,
            _ => false,
        };
        if borrowable {
            chunk.rehome(beam_scope);
            self.sent_bytes += chunk.len().unwrap_or(0);
            self.send.push_back(chunk);
            return Ok(());
        }
        // sender-pinned bytes must be materialized, the receiver never reads them
        chunk = match chunk {
            Chunk::External(mut src) => match src.read_all() {
                Ok(bytes) => {
                    graveyard.push(Chunk::External(src));
                    Chunk::Heap(bytes)
                }
                Err(e) => {
                    rest.push_front(Chunk::External(src));
                    return Err(e);
                }
            },
            other => other,
        };
        if matches!(&chunk, Chunk::Heap(b) if b.is_empty()) {
            graveyard.push(chunk);
            return Ok(());
        }
        let len = chunk.len().unwrap_or(0);
        if len > *space_left && chunk.can_split() {
            let front = chunk.split_to(*space_left);
            rest.push_front(chunk);
            chunk = front;
        }
        let len = chunk.len().unwrap_or(0);
        *space_left = space_left.saturating_sub(len);
        self.sent_bytes += len;
        self.send.push_back(chunk);
        Ok(())
    }

    /// Splits the surplus chunk so out fits the budget and parks the
    /// remainder (and everything after it) for the next receive call.
    fn trim_overflow(&mut self, out: &mut Brigade, start: usize, budget: u64) {
        let mut acc = 0u64;
        let mut boundary = None;
        for (i, c) in out.iter().enumerate().skip(start) {
            let cost = if self.tx_mem_limits {
                c.mem_used()
            } else {
                c.len().unwrap_or(0)
            };
            if acc + cost > budget {
                boundary = Some((i, budget - acc));
                break;
            }
            acc += cost;
        }
        let (i, keep) = match boundary {
            Some(b) => b,
            None => return,
        };
        let mut tail: VecDeque<Chunk> = out.drain(i..).collect();
        if keep > 0 {
            let mut first = tail.pop_front().unwrap();
            if first.can_split() {
                out.push_back(first.split_to(keep));
                tail.push_front(first);
            } else {
                // unsplittable chunks are delivered whole
                out.push_back(first);
            }
        }
        for c in tail.into_iter().rev() {
            self.recv.push_front(c);
        }
    }
}

pub(crate) struct BeamCore {
    id: u64,
    tag: String,
    sender: EndpointId,
    /// The beam's own lifecycle scope. Chunks the receiver may borrow are
    /// re-homed here on admission.
    scope: Scope,
    state: Mutex<BeamState>,
    cond: Condvar,
}

impl BeamCore {
    fn lock(&self) -> Result<MutexGuard<BeamState>> {
        self.state.lock().map_err(Error::from)
    }

    /// Wait on the condvar until pred holds. Each wait is bounded by the
    /// beam's configured timeout. The predicate is re-checked on every wake.
    fn wait_on<'a>(
        &'a self,
        mut st: MutexGuard<'a, BeamState>,
        pred: impl Fn(&BeamState) -> bool,
    ) -> Result<MutexGuard<'a, BeamState>> {
        let deadline = st.timeout.map(|t| Instant::now() + t);
        while !pred(&st) {
            match deadline {
                None => {
                    st = self.cond.wait(st).map_err(Error::from)?;
                }
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Error::timeout());
                    }
                    let (guard, result) = self
                        .cond
                        .wait_timeout(st, d - now)
                        .map_err(Error::from)?;
                    st = guard;
                    if result.timed_out() && !pred(&st) {
                        return Err(Error::timeout());
                    }
                }
            }
        }
        Ok(st)
    }

    /// Report consumed-but-unreported bytes to the sender. The lock is
    /// released around the callback and reacquired to advance the counter.
    fn report_consumption_locked<'a>(
        &'a self,
        mut st: MutexGuard<'a, BeamState>,
    ) -> Result<MutexGuard<'a, BeamState>> {
        let len = st.received_bytes - st.cons_bytes_reported;
        if len > 0 {
            if let Some(cb) = st.cb.consumed_bytes.clone() {
                drop(st);
                cb(len);
                st = self.lock()?;
            }
            st.cons_bytes_reported += len;
        }
        Ok(st)
    }

    /// Read the bytes of a borrowed chunk still pinned in hold.
    pub(crate) fn proxy_bytes(&self, seq: u64, offset: u64, len: u64) -> Result<Bytes> {
        let st = self.lock()?;
        if st.aborted {
            return Err(Error::reset());
        }
        let held = match st.hold.iter().find(|h| h.seq == seq) {
            Some(h) => h,
            None => return Err(Error::reset()),
        };
        match &held.chunk {
            Chunk::Heap(b) => Ok(b.slice(offset as usize..(offset + len) as usize)),
            Chunk::File(f) | Chunk::Mmap(f) => {
                let f = f.clone();
                drop(st);
                f.read_range(offset, len)
            }
            _ => Err(Error::reset()),
        }
    }

    /// Invoked from the receiver thread when the last share of a proxy
    /// drops. Marks the borrowed chunk released and sweeps the released
    /// prefix of hold into purge. Data never purges past a live predecessor,
    /// metadata moves along with the boundary that releases it.
    pub(crate) fn proxy_dropped(&self, seq: u64) {
        let mut st = match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if st.shutdown {
            return;
        }
        match st.hold.iter_mut().find(|h| h.seq == seq) {
            Some(h) => h.proxy = HoldProxy::Dropped,
            None => {
                error!(id = self.id, tag = %self.tag, seq, "dropped proxy has no chunk in hold");
                return;
            }
        }
        while matches!(st.hold.front(), Some(h) if h.proxy != HoldProxy::Live) {
            let h = st.hold.pop_front().unwrap();
            trace!(id = self.id, tag = %self.tag, seq = h.seq, chunk = ?h.chunk, "released to purge");
            st.purge.push(h.chunk);
        }
        self.cond.notify_all();
    }

    fn clear_callbacks(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.cb = Callbacks::default();
        }
    }

    /// Drains purge and send and reclaims every held chunk on the calling
    /// (sender) thread. Outstanding proxies are neutralized: they report
    /// reset on read and no-op on drop from now on.
    fn sender_cleanup(&self) {
        let mut graveyard: Vec<Chunk> = Vec::new();
        if let Ok(mut st) = self.state.lock() {
            if st.shutdown {
                return;
            }
            debug!(id = self.id, tag = %self.tag, held = st.hold.len(), "sender cleanup");
            st.shutdown = true;
            st.closed = true;
            st.aborted = true;
            st.hook = None;
            graveyard.extend(st.send.drain(..));
            graveyard.append(&mut st.purge);
            graveyard.extend(st.hold.drain(..).map(|h| h.chunk));
            self.cond.notify_all();
        }
        drop(graveyard);
    }
}

/// A single-producer, single-consumer conduit moving data and metadata
/// chunks from a sender thread to a receiver thread under a bounded-buffer
/// backpressure discipline. Cheap to clone, all handles share the beam.
#[derive(Clone)]
pub struct Beam {
    core: Arc<BeamCore>,
}

impl Beam {
    /// Create a beam owned by the sender endpoint. A pre-cleanup hook on the
    /// sender's scope reclaims all sender-owned chunks when that scope ends.
    pub fn new(sender_scope: &Scope, sender: EndpointId, id: u64, tag: &str, opts: BeamOpts) -> Beam {
        let core = Arc::new(BeamCore {
            id,
            tag: tag.to_string(),
            sender,
            scope: Scope::new("beam"),
            state: Mutex::new(BeamState::new(opts)),
            cond: Condvar::new(),
        });
        let hook_core = core.clone();
        let token = sender_scope.register_cleanup(move || {
            // no re-entry into user code while the scope is being torn down
            hook_core.clear_callbacks();
            hook_core.sender_cleanup();
        });
        if let Ok(mut st) = core.state.lock() {
            st.hook = Some((sender_scope.downgrade(), token));
        }
        debug!(id, tag, "created beam");
        Beam { core }
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn tag(&self) -> &str {
        &self.core.tag
    }

    pub fn sender_endpoint(&self) -> EndpointId {
        self.core.sender
    }

    pub fn set_buffer_size(&self, max_buf_size: u64) {
        if let Ok(mut st) = self.core.state.lock() {
            st.max_buf_size = max_buf_size;
        }
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        if let Ok(mut st) = self.core.state.lock() {
            st.timeout = timeout;
        }
    }

    pub fn set_copy_files(&self, copy_files: bool) {
        if let Ok(mut st) = self.core.state.lock() {
            st.copy_files = copy_files;
        }
    }

    pub fn set_tx_mem_limits(&self, tx_mem_limits: bool) {
        if let Ok(mut st) = self.core.state.lock() {
            st.tx_mem_limits = tx_mem_limits;
        }
    }

    /// Sender notification of bytes consumed since the last report.
    pub fn on_consumed_bytes(&self, cb: Option<IoCallback>) {
        if let Ok(mut st) = self.core.state.lock() {
            st.cb.consumed_bytes = cb;
        }
    }

    /// Sender notification that chunks were just handed to the receiver.
    pub fn on_consumed(&self, cb: Option<EventCallback>) {
        if let Ok(mut st) = self.core.state.lock() {
            st.cb.consumed = cb;
        }
    }

    /// Sender notification that the beam went from empty to non-empty.
    pub fn on_was_empty(&self, cb: Option<EventCallback>) {
        if let Ok(mut st) = self.core.state.lock() {
            st.cb.was_empty = cb;
        }
    }

    /// Invoked just before the sender blocks waiting for buffer space.
    pub fn on_send_block(&self, cb: Option<EventCallback>) {
        if let Ok(mut st) = self.core.state.lock() {
            st.cb.send_block = cb;
        }
    }

    /// Hand an ordered sequence of chunks to the beam. Chunks are admitted
    /// front to back; on a would-block or timeout failure the unadmitted
    /// chunks remain in the brigade.
    pub fn send(&self, from: EndpointId, chunks: &mut Brigade, block: BlockMode) -> Result<()> {
        if from != self.core.sender {
            return Err(Error::new("send from an endpoint that is not the beam's sender"));
        }
        let mut graveyard: Vec<Chunk> = Vec::new();
        let result = self.send_inner(chunks, block, &mut graveyard);
        // destructors run outside the lock, they may re-enter a beam
        drop(graveyard);
        result
    }

    fn send_inner(
        &self,
        chunks: &mut Brigade,
        block: BlockMode,
        graveyard: &mut Vec<Chunk>,
    ) -> Result<()> {
        let core = &self.core;
        let mut st = core.lock()?;
        st.drain_purge(graveyard);
        if st.aborted {
            st.absorb(chunks);
            return Err(Error::aborted());
        }
        if st.closed {
            debug!(id = core.id, tag = %core.tag, n = chunks.len(), "send after close, absorbing");
            st.absorb(chunks);
            return Ok(());
        }
        let was_empty = st.is_empty();
        let mut notified_empty = false;
        let mut space_left = st.space_left();
        while !chunks.is_empty() {
            if space_left > 0 {
                let chunk = chunks.pop_front().unwrap();
                if let Err(e) = st.admit(chunk, &mut space_left, chunks, &core.scope, graveyard) {
                    core.cond.notify_all();
                    return Err(e);
                }
                continue;
            }
            // buffer full
            st.drain_purge(graveyard);
            if was_empty && !notified_empty {
                notified_empty = true;
                if let Some(cb) = st.cb.was_empty.clone() {
                    core.cond.notify_all();
                    drop(st);
                    cb();
                    st = core.lock()?;
                    if st.aborted {
                        return Err(Error::aborted());
                    }
                    space_left = st.space_left();
                    continue;
                }
            }
            if block == BlockMode::NonBlock {
                core.cond.notify_all();
                return Err(Error::would_block());
            }
            if let Some(cb) = st.cb.send_block.clone() {
                core.cond.notify_all();
                drop(st);
                cb();
                st = core.lock()?;
                if st.aborted {
                    return Err(Error::aborted());
                }
                if st.space_left() > 0 {
                    space_left = st.space_left();
                    continue;
                }
            }
            trace!(id = core.id, tag = %core.tag, buffered = st.mem_used(), "sender waiting for space");
            st = core.wait_on(st, |s| s.aborted || s.space_left() > 0)?;
            if st.aborted {
                return Err(Error::aborted());
            }
            space_left = st.space_left();
        }
        let fire_empty = was_empty && !notified_empty && !st.is_empty();
        core.cond.notify_all();
        st = core.report_consumption_locked(st)?;
        let cb = if fire_empty {
            st.cb.was_empty.clone()
        } else {
            None
        };
        drop(st);
        if let Some(cb) = cb {
            cb();
        }
        Ok(())
    }

    /// Transfer chunks to the receiver endpoint, translating sender chunks
    /// into receiver-owned ones (borrowed data becomes proxy chunks.) At
    /// most readbytes data bytes are delivered, 0 means unlimited. Returns
    /// whether the beam is closed.
    pub fn receive(
        &self,
        to: EndpointId,
        out: &mut Brigade,
        dest: &Scope,
        block: BlockMode,
        readbytes: u64,
    ) -> Result<bool> {
        if to == self.core.sender {
            return Err(Error::new("receive from the beam's sending endpoint"));
        }
        let mut graveyard: Vec<Chunk> = Vec::new();
        let result = self.receive_inner(out, dest, block, readbytes, &mut graveyard);
        drop(graveyard);
        result
    }

    fn receive_inner(
        &self,
        out: &mut Brigade,
        dest: &Scope,
        block: BlockMode,
        readbytes: u64,
        graveyard: &mut Vec<Chunk>,
    ) -> Result<bool> {
        let core = &self.core;
        let mut st = core.lock()?;
        let mut remain = if readbytes == 0 { u64::MAX } else { readbytes };
        let out_start = out.len();
        let mut transferred = false;
        let mut moved_to_hold = false;
        loop {
            if st.aborted {
                graveyard.extend(std::mem::take(&mut st.recv));
                let cb = if moved_to_hold { st.cb.consumed.clone() } else { None };
                drop(st);
                if let Some(cb) = cb {
                    cb();
                }
                return Err(Error::aborted());
            }
            // receiver overflow from a previous call goes out first
            while let Some(front) = st.recv.front() {
                let len = front.len().unwrap_or(0);
                if len > 0 && remain == 0 {
                    break;
                }
                let c = st.recv.pop_front().unwrap();
                remain = remain.saturating_sub(len);
                out.push_back(c);
                transferred = true;
            }
            // translate sender chunks
            while let Some(front) = st.send.front() {
                let chunk_len = front.len();
                let len = chunk_len.unwrap_or(0);
                if len > 0 && remain == 0 {
                    break;
                }
                let b = st.send.pop_front().unwrap();
                if b.is_metadata() {
                    let fresh = match &b {
                        Chunk::Eos => {
                            st.close_sent = true;
                            Chunk::Eos
                        }
                        Chunk::Flush => Chunk::Flush,
                        Chunk::Error(m) => Chunk::Error(m.clone()),
                        _ => unreachable!(),
                    };
                    out.push_back(fresh);
                    st.to_hold(b, HoldProxy::None);
                    transferred = true;
                    moved_to_hold = true;
                    continue;
                }
                // an unknown length is not zero, it still goes to dispatch
                if chunk_len == Some(0) {
                    st.to_hold(b, HoldProxy::None);
                    moved_to_hold = true;
                    continue;
                }
                // files not borrowed into the beam scope become fresh
                // receiver-owned references instead of proxies
                let foreign_file =
                    matches!(&b, Chunk::File(f) | Chunk::Mmap(f) if f.scope() != core.scope.id());
                if foreign_file {
                    let (mut f, mmap) = match b {
                        Chunk::File(f) => (f, false),
                        Chunk::Mmap(f) => (f, true),
                        _ => unreachable!(),
                    };
                    if f.scope() != dest.id() {
                        f.rehome(dest);
                    }
                    let mut out_ref = f.clone();
                    out_ref.disable_mmap();
                    out.push_back(Chunk::File(out_ref));
                    let held = if mmap { Chunk::Mmap(f) } else { Chunk::File(f) };
                    st.to_hold(held, HoldProxy::None);
                    st.received_bytes += len;
                    remain = remain.saturating_sub(len);
                    transferred = true;
                    moved_to_hold = true;
                    continue;
                }
                match &b {
                    Chunk::Heap(_) | Chunk::File(_) | Chunk::Mmap(_) => {
                        let seq = st.next_seq;
                        let p = ProxyChunk::new(Arc::downgrade(core), seq, len);
                        out.push_back(Chunk::Proxy(p));
                        st.to_hold(b, HoldProxy::Live);
                        st.received_bytes += len;
                        remain = remain.saturating_sub(len);
                        transferred = true;
                        moved_to_hold = true;
                    }
                    _ => {
                        // no native transfer, ask the beamer registry.
                        // beamers are user code and may re-enter the beam,
                        // so the lock is released around the consult
                        drop(st);
                        let before = out.len();
                        let translated = registry::run_beamers(out, &b);
                        st = core.lock()?;
                        match translated {
                            Some(n) => {
                                st.received_bytes += n;
                                remain = remain.saturating_sub(n);
                                if out.len() > before {
                                    transferred = true;
                                }
                            }
                            None => {
                                warn!(id = core.id, tag = %core.tag, chunk = ?b, "no beamer for chunk, dropping");
                            }
                        }
                        st.to_hold(b, HoldProxy::None);
                        moved_to_hold = true;
                    }
                }
            }
            if readbytes > 0 {
                st.trim_overflow(out, out_start, readbytes);
            }
            // a terminal eos is synthesized once if the sender never sent one
            if st.closed && !st.close_sent && st.send.is_empty() && st.recv.is_empty() {
                trace!(id = core.id, tag = %core.tag, "synthesizing eos");
                out.push_back(Chunk::Eos);
                st.close_sent = true;
                transferred = true;
            }
            if transferred {
                core.cond.notify_all();
                let closed = st.closed;
                let cb = if moved_to_hold { st.cb.consumed.clone() } else { None };
                drop(st);
                if let Some(cb) = cb {
                    cb();
                }
                return Ok(closed);
            }
            if st.closed {
                let cb = if moved_to_hold { st.cb.consumed.clone() } else { None };
                drop(st);
                if let Some(cb) = cb {
                    cb();
                }
                return Err(Error::eof());
            }
            if block == BlockMode::NonBlock {
                let cb = if moved_to_hold { st.cb.consumed.clone() } else { None };
                drop(st);
                if let Some(cb) = cb {
                    cb();
                }
                return Err(Error::would_block());
            }
            trace!(id = core.id, tag = %core.tag, "receiver waiting for chunks");
            st = core.wait_on(st, |s| s.aborted || s.closed || !s.send.is_empty())?;
        }
    }

    /// Sender-side close: pending chunks stay deliverable, the receiver
    /// drains them and then sees end-of-stream. Receiver-side close aborts.
    pub fn close(&self, from: EndpointId) -> Result<()> {
        let core = &self.core;
        if from != core.sender {
            return self.abort(from);
        }
        let mut graveyard: Vec<Chunk> = Vec::new();
        let mut st = core.lock()?;
        if st.aborted {
            return Err(Error::aborted());
        }
        if st.closed {
            return Ok(());
        }
        debug!(id = core.id, tag = %core.tag, buffered = st.buffered_data_len(), "sender closed beam");
        let was_empty = st.is_empty();
        st.closed = true;
        st.drain_purge(&mut graveyard);
        st = core.report_consumption_locked(st)?;
        core.cond.notify_all();
        let cb = if was_empty {
            st.cb.was_empty.clone()
        } else {
            None
        };
        drop(st);
        if let Some(cb) = cb {
            cb();
        }
        drop(graveyard);
        Ok(())
    }

    /// Abort the conduit. Sender aborts drop all undelivered chunks and
    /// silence the consumption hooks; receiver aborts also close the beam.
    /// Idempotent, waiters wake and observe the flag.
    pub fn abort(&self, from: EndpointId) -> Result<()> {
        let core = &self.core;
        let mut graveyard: Vec<Chunk> = Vec::new();
        {
            let mut st = core.lock()?;
            if !st.aborted {
                if from == core.sender {
                    debug!(id = core.id, tag = %core.tag, "sender aborted beam");
                    st.cb.consumed_bytes = None;
                    st.cb.consumed = None;
                    st.aborted = true;
                    graveyard.extend(st.send.drain(..));
                    st.drain_purge(&mut graveyard);
                    // flush consumption silently, the hooks are gone
                    st.cons_bytes_reported = st.received_bytes;
                } else {
                    debug!(id = core.id, tag = %core.tag, "receiver aborted beam");
                    st.aborted = true;
                    st.closed = true;
                    graveyard.extend(std::mem::take(&mut st.recv));
                }
                core.cond.notify_all();
            }
        }
        drop(graveyard);
        Ok(())
    }

    /// Block until every buffered chunk has been consumed by the receiver.
    pub fn wait_empty(&self, block: BlockMode) -> Result<()> {
        let core = &self.core;
        let mut st = core.lock()?;
        if block == BlockMode::NonBlock && !st.is_empty() {
            return Err(Error::would_block());
        }
        st = core.wait_on(st, |s| s.aborted || s.is_empty())?;
        if !st.is_empty() && st.aborted {
            return Err(Error::aborted());
        }
        Ok(())
    }

    /// Sum of the determinate data lengths buffered in the send queue.
    pub fn buffered_data_len(&self) -> u64 {
        self.core.lock().map(|st| st.buffered_data_len()).unwrap_or(0)
    }

    /// Memory footprint of the send queue. File-backed chunks count as 0.
    pub fn mem_used(&self) -> u64 {
        self.core.lock().map(|st| st.mem_used()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.core.lock().map(|st| st.is_empty()).unwrap_or(true)
    }

    pub fn is_closed(&self) -> bool {
        self.core.lock().map(|st| st.closed).unwrap_or(true)
    }

    pub fn is_aborted(&self) -> bool {
        self.core.lock().map(|st| st.aborted).unwrap_or(true)
    }

    pub fn stats(&self) -> BeamStats {
        self.core
            .lock()
            .map(|st| BeamStats {
                sent_bytes: st.sent_bytes,
                received_bytes: st.received_bytes,
                cons_bytes_reported: st.cons_bytes_reported,
                buckets_sent: st.next_seq,
            })
            .unwrap_or_default()
    }

    /// Report bytes consumed since the last report to the sender hook.
    pub fn report_consumption(&self) -> Result<()> {
        let st = self.core.lock()?;
        let _guard = self.core.report_consumption_locked(st)?;
        Ok(())
    }

    /// Snapshot of the four queues for assertions: (send, hold, purge, recv.)
    #[cfg(test)]
    pub(crate) fn debug_queues(&self) -> (Vec<String>, Vec<String>, Vec<String>, Vec<String>) {
        let st = self.core.state.lock().unwrap();
        (
            st.send.iter().map(|c| format!("{:?}", c)).collect(),
            st.hold.iter().map(|h| format!("{:?}", h.chunk)).collect(),
            st.purge.iter().map(|c| format!("{:?}", c)).collect(),
            st.recv.iter().map(|c| format!("{:?}", c)).collect(),
        )
    }

    /// Explicitly destroy the beam: the scope hook is unregistered, then
    /// sender cleanup reclaims all chunks on the calling thread.
    pub fn destroy(&self) {
        let core = &self.core;
        let hook = match core.state.lock() {
            Ok(mut st) => st.hook.take(),
            Err(_) => None,
        };
        if let Some((weak, token)) = hook {
            if let Some(scope) = weak.upgrade() {
                scope.unregister_cleanup(token);
            }
        }
        core.sender_cleanup();
    }
}

#[cfg(test)]
mod tests {
    use test_env_log::test;

    use super::*;

    const SND: EndpointId = EndpointId(1);
    const RCV: EndpointId = EndpointId(2);

    fn beam(scope: &Scope) -> Beam {
        Beam::new(scope, SND, 7, "unit", BeamOpts::default())
    }

    #[test]
    fn test_endpoint_validation() {
        let scope = Scope::new("sender");
        let b = beam(&scope);
        let mut chunks = Brigade::new();
        chunks.push_back(Chunk::Heap(Bytes::from_static(b"x")));
        let err = b.send(RCV, &mut chunks, BlockMode::NonBlock).unwrap_err();
        assert_eq!(err, Error::new("send from an endpoint that is not the beam's sender"));
        assert_eq!(chunks.len(), 1);

        let mut out = Brigade::new();
        let rscope = Scope::new("receiver");
        assert!(b.receive(SND, &mut out, &rscope, BlockMode::NonBlock, 0).is_err());
    }

    #[test]
    fn test_empty_nonblocking_receive() {
        let scope = Scope::new("sender");
        let b = beam(&scope);
        let rscope = Scope::new("receiver");
        let mut out = Brigade::new();
        let err = b
            .receive(RCV, &mut out, &rscope, BlockMode::NonBlock, 0)
            .unwrap_err();
        assert_eq!(err, Error::would_block());
    }

    #[test]
    fn test_setters_are_idempotent() {
        let scope = Scope::new("sender");
        let b = beam(&scope);
        b.set_buffer_size(1024);
        b.set_buffer_size(1024);
        b.set_timeout(Some(Duration::from_millis(5)));
        b.set_timeout(Some(Duration::from_millis(5)));
        b.set_copy_files(true);
        b.set_copy_files(true);
        b.set_tx_mem_limits(true);
        assert!(!b.is_closed());
        assert!(b.is_empty());
    }

    #[test]
    fn test_opts_from_settings() {
        let s: Settings = serde_yaml::from_str("max_buf_size: 128\ntimeout_ms: 10\n").unwrap();
        let opts = BeamOpts::from(&s);
        assert_eq!(opts.max_buf_size, 128);
        assert_eq!(opts.timeout, Some(Duration::from_millis(10)));
        let scope = Scope::new("sender");
        let b = Beam::new(&scope, SND, 9, "cfg", opts);
        assert!(b.is_empty());
    }

    #[test]
    fn test_send_after_close_is_absorbed() {
        let scope = Scope::new("sender");
        let b = beam(&scope);
        b.close(SND).unwrap();
        let mut chunks = Brigade::new();
        chunks.push_back(Chunk::Heap(Bytes::from_static(b"late")));
        b.send(SND, &mut chunks, BlockMode::Block).unwrap();
        assert!(chunks.is_empty());
        assert!(b.is_empty()); // absorbed, not deliverable
    }
}

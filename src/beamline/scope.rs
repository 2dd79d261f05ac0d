use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex, Weak};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies the lifecycle scope a chunk currently belongs to.
/// Chunks that reference kernel objects (files) record the scope that
/// may safely use them; re-homing rebinds this id.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct ScopeId(u64);

/// A token returned by register_cleanup, used to unregister the hook again.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CleanupToken(u64);

/// A lifecycle scope with registered cleanup hooks, run in reverse
/// registration order when the last handle is dropped. Cheap to clone,
/// all handles share the same scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

/// A non-owning handle to a Scope. Used where holding a Scope would keep
/// it alive past its owner (the beam keeps one for hook unregistration.)
#[derive(Clone)]
pub struct WeakScope {
    inner: Weak<ScopeInner>,
}

struct ScopeInner {
    id: ScopeId,
    name: &'static str,
    next_token: AtomicU64,
    cleanups: Mutex<Vec<(CleanupToken, Box<dyn FnOnce() + Send>)>>,
}

impl Scope {
    pub fn new(name: &'static str) -> Self {
        Scope {
            inner: Arc::new(ScopeInner {
                id: ScopeId(NEXT_SCOPE_ID.fetch_add(1, Relaxed)),
                name,
                next_token: AtomicU64::new(1),
                cleanups: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Register a hook that runs before the scope's contents are released.
    /// Hooks run in reverse registration order.
    pub fn register_cleanup(&self, f: impl FnOnce() + Send + 'static) -> CleanupToken {
        let token = CleanupToken(self.inner.next_token.fetch_add(1, Relaxed));
        let mut cleanups = self.inner.cleanups.lock().unwrap_or_else(|e| e.into_inner());
        cleanups.push((token, Box::new(f)));
        token
    }

    /// Remove a previously registered hook so it never runs.
    /// Returns false if the token was not found (hook already ran or removed.)
    pub fn unregister_cleanup(&self, token: CleanupToken) -> bool {
        let mut cleanups = self.inner.cleanups.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(i) = cleanups.iter().position(|(t, _)| *t == token) {
            cleanups.remove(i);
            true
        } else {
            false
        }
    }

    pub fn downgrade(&self) -> WeakScope {
        WeakScope {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl WeakScope {
    pub fn upgrade(&self) -> Option<Scope> {
        self.inner.upgrade().map(|inner| Scope { inner })
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        let cleanups = self.cleanups.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, f) in cleanups.drain(..).rev() {
            f();
        }
    }
}

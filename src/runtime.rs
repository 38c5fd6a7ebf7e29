//! Process-wide crypto backend state.
//!
//! The backend keeps a few process-global tables: the ex-data slot used to
//! find our session tag from inside callbacks, and (optionally) the locks
//! that serialize context construction across OS threads. Instead of
//! hiding those in mutable globals, they are owned by a reference counted
//! [`CryptoRuntime`] handle that is passed to every context and session.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use once_cell::sync::{Lazy, OnceCell};
use openssl::error::ErrorStack;
use openssl::ex_data::Index;
use openssl::ssl::Ssl;

use crate::session::SessionTag;
use crate::Error;

/// Size of the per-thread buffer [`last_error`] drains into.
pub const ERROR_BUFFER_LEN: usize = 512;

static SESSION_TAG: OnceCell<Index<Ssl, Arc<SessionTag>>> = OnceCell::new();

static RUNTIME: Lazy<Mutex<Weak<CryptoRuntime>>> = Lazy::new(|| Mutex::new(Weak::new()));

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ERROR_BUFFER: RefCell<String> = RefCell::new(String::with_capacity(ERROR_BUFFER_LEN));
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Backend state guarded by a lock once thread safety is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockSlot {
    /// Context construction (file loading, trust store setup).
    Context = 0,
    /// Engine allocation for new sessions.
    Session = 1,
}

impl LockSlot {
    const COUNT: usize = 2;
}

struct LockTable {
    slots: Vec<Mutex<()>>,
}

/// Handle to the initialized crypto backend.
pub struct CryptoRuntime {
    session_tag: Index<Ssl, Arc<SessionTag>>,
    initialized: AtomicBool,
    locks: Mutex<Option<Arc<LockTable>>>,
    active_sessions: AtomicUsize,
}

impl CryptoRuntime {
    /// Initialize the backend.
    ///
    /// Idempotent: while a handle is alive, every call returns that same
    /// handle. Fails if the session tag slot can't be registered.
    pub fn init() -> Result<Arc<CryptoRuntime>, Error> {
        let mut current = lock(&RUNTIME);

        if let Some(runtime) = current.upgrade() {
            runtime.initialized.store(true, Ordering::Release);
            return Ok(runtime);
        }

        openssl::init();

        let session_tag = *SESSION_TAG
            .get_or_try_init(Ssl::new_ex_index::<Arc<SessionTag>>)
            .map_err(|e| Error::Runtime(format!("No session tag slot: {}", e)))?;

        let runtime = Arc::new(CryptoRuntime::with_tag(session_tag));
        *current = Arc::downgrade(&runtime);

        debug!("Crypto runtime initialized: {}", openssl::version::version());

        Ok(runtime)
    }

    fn with_tag(session_tag: Index<Ssl, Arc<SessionTag>>) -> Self {
        CryptoRuntime {
            session_tag,
            initialized: AtomicBool::new(true),
            locks: Mutex::new(None),
            active_sessions: AtomicUsize::new(0),
        }
    }

    /// Install one lock per lock slot.
    ///
    /// Needed when contexts are built from several OS threads. Does
    /// nothing on a torn down runtime or if already installed.
    pub fn init_thread_safety(&self) {
        if !self.is_initialized() {
            return;
        }

        let mut locks = lock(&self.locks);
        if locks.is_some() {
            return;
        }

        let slots = (0..LockSlot::COUNT).map(|_| Mutex::new(())).collect();
        *locks = Some(Arc::new(LockTable { slots }));

        debug!("Crypto runtime thread safety installed");
    }

    /// Release the locks and mark the runtime uninitialized.
    ///
    /// Calling it again, or on a runtime that never installed locks, is
    /// fine. Refuses while sessions are alive.
    pub fn teardown(&self) -> Result<(), Error> {
        let active = self.active_sessions();
        if active > 0 {
            return Err(Error::RuntimeBusy(active));
        }

        if self.initialized.swap(false, Ordering::AcqRel) {
            lock(&self.locks).take();
            debug!("Crypto runtime torn down");
        }

        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_thread_safe(&self) -> bool {
        lock(&self.locks).is_some()
    }

    /// Number of sessions currently bound to this runtime.
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    /// Run `f` holding the lock for `slot`, if thread safety is installed.
    pub fn with_lock<R>(&self, slot: LockSlot, f: impl FnOnce() -> R) -> R {
        let table = lock(&self.locks).clone();
        match table {
            Some(table) => {
                let _guard = lock(&table.slots[slot as usize]);
                f()
            }
            None => f(),
        }
    }

    pub(crate) fn ensure_initialized(&self) -> Result<(), Error> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::Runtime("Runtime has been torn down".to_string()))
        }
    }

    pub(crate) fn session_tag(&self) -> Index<Ssl, Arc<SessionTag>> {
        self.session_tag
    }

    pub(crate) fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Drain the calling thread's pending backend errors.
///
/// The text is kept in a bounded thread-local buffer and a copy returned.
/// Empty when nothing was pending.
pub fn last_error() -> String {
    let stack = ErrorStack::get();

    ERROR_BUFFER.with(|buffer| {
        let mut buffer = buffer.borrow_mut();
        buffer.clear();
        for e in stack.errors() {
            if !buffer.is_empty() {
                push_bounded(&mut buffer, "\n");
            }
            push_bounded(&mut buffer, &e.to_string());
        }
        buffer.clone()
    })
}

/// Stable numeric id of the calling thread, never 0.
pub fn thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// Discard whatever errors a previous call left behind.
pub(crate) fn clear_error_queue() {
    let _ = ErrorStack::get();
}

fn push_bounded(buffer: &mut String, s: &str) {
    let room = ERROR_BUFFER_LEN.saturating_sub(buffer.len());
    let mut end = s.len().min(room);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    buffer.push_str(&s[..end]);
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

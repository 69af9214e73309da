//! Resource tracking and forced stop for in-process test execution.
//!
//! Test code creates threads and sockets through a shared
//! [`ResourceTracker`]. Every thread running on behalf of a case carries
//! that case's [`CaseScope`]; once the scope is stopped, the thread unwinds
//! at its next safepoint (a probe hit or a tracked blocking call).
//!
//! After a stop, the executor asks the tracker to close every socket opened
//! since the case's [`Checkpoint`] and to wake every thread spawned since,
//! until nothing is left alive.

use std::any::Any;
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

use tracing::debug;

/// Longest single park inside a tracked sleep
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Timeout of the self-connect used to wake a closed listener
const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_millis(200);

/// Unwind payload of a thread stopped at a safepoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForcedStop;

/// Whether an unwind payload is a forced stop
#[must_use]
pub fn is_forced_stop(payload: &(dyn Any + Send)) -> bool {
    payload.is::<ForcedStop>()
}

/// Stop flag shared by every thread running one case
#[derive(Debug)]
pub struct CaseScope {
    case: String,
    stop: AtomicBool,
}

impl CaseScope {
    /// Create a running scope for `case`
    #[must_use]
    pub fn new(case: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            case: case.into(),
            stop: AtomicBool::new(false),
        })
    }

    /// Case identifier
    #[must_use]
    pub fn case(&self) -> &str {
        &self.case
    }

    /// Ask every thread of this case to stop at its next safepoint
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Make this the current scope of the calling thread until the guard drops
    #[must_use]
    pub fn enter(self: &Arc<Self>) -> ScopeGuard {
        let previous = CURRENT_CASE.with(|current| current.replace(Some(Arc::clone(self))));
        ScopeGuard { previous }
    }
}

thread_local! {
    static CURRENT_CASE: RefCell<Option<Arc<CaseScope>>> = const { RefCell::new(None) };
}

/// Restores the previous scope of a thread on drop
#[derive(Debug)]
pub struct ScopeGuard {
    previous: Option<Arc<CaseScope>>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        // try_with: the thread-local may already be gone during thread teardown
        let _ = CURRENT_CASE.try_with(|current| current.replace(previous));
    }
}

/// Scope of the calling thread, if it runs on behalf of a case
#[must_use]
pub fn current_scope() -> Option<Arc<CaseScope>> {
    CURRENT_CASE.try_with(|c| c.borrow().clone()).ok().flatten()
}

/// Whether the calling thread's case has been stopped
#[must_use]
pub fn is_stop_requested() -> bool {
    CURRENT_CASE
        .try_with(|c| c.borrow().as_ref().is_some_and(|scope| scope.is_stopped()))
        .unwrap_or(false)
}

/// Unwind with [`ForcedStop`] if the calling thread's case has been stopped
#[inline]
pub fn safepoint() {
    if is_stop_requested() {
        panic::resume_unwind(Box::new(ForcedStop));
    }
}

/// Sleep that wakes early on unpark and stops at safepoints
pub fn interruptible_sleep(duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        safepoint();
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::park_timeout((deadline - now).min(SLEEP_SLICE));
    }
}

/// Position in the tracker's history, taken when a case starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    socket_seq: u64,
    thread_seq: u64,
}

#[derive(Debug)]
enum SocketHandle {
    Stream(Weak<TcpStream>),
    Listener {
        listener: Weak<TcpListener>,
        closed: Arc<AtomicBool>,
        wake_addr: SocketAddr,
    },
}

#[derive(Debug)]
struct SocketRecord {
    seq: u64,
    closed: bool,
    handle: SocketHandle,
}

impl SocketRecord {
    fn is_open(&self) -> bool {
        if self.closed {
            return false;
        }
        match &self.handle {
            SocketHandle::Stream(stream) => stream.strong_count() > 0,
            SocketHandle::Listener { listener, .. } => listener.strong_count() > 0,
        }
    }

    /// Mark the socket closed; a live listener returns the address to wake it on
    fn close(&mut self) -> Option<SocketAddr> {
        self.closed = true;
        match &self.handle {
            SocketHandle::Stream(stream) => {
                if let Some(stream) = stream.upgrade() {
                    let _ = stream.shutdown(Shutdown::Both);
                }
                None
            }
            SocketHandle::Listener {
                listener,
                closed,
                wake_addr,
            } => {
                closed.store(true, Ordering::SeqCst);
                (listener.strong_count() > 0).then_some(*wake_addr)
            }
        }
    }
}

#[derive(Debug)]
struct ThreadRecord {
    seq: u64,
    thread: Thread,
    done: Arc<AtomicBool>,
}

impl ThreadRecord {
    fn describe(&self) -> String {
        self.thread
            .name()
            .map_or_else(|| format!("{:?}", self.thread.id()), str::to_string)
    }
}

/// Sets the done flag of a tracked thread when it exits, even by unwinding
struct DoneGuard(Arc<AtomicBool>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Registry of the threads and sockets created by test code
#[derive(Debug, Default)]
pub struct ResourceTracker {
    next_seq: AtomicU64,
    sockets: Mutex<Vec<SocketRecord>>,
    threads: Mutex<Vec<ThreadRecord>>,
}

impl ResourceTracker {
    /// Create a tracker. One tracker serves every executor of a run.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Mark the current position; later resources belong to the new case
    pub fn checkpoint(&self) -> Checkpoint {
        let seq = self.seq();
        Checkpoint {
            socket_seq: seq,
            thread_seq: seq,
        }
    }

    /// Spawn a thread that inherits the caller's case scope
    pub fn spawn<F, T>(&self, name: Option<String>, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        safepoint();
        let scope = current_scope();
        let done = Arc::new(AtomicBool::new(false));
        let guard = DoneGuard(Arc::clone(&done));
        let mut builder = thread::Builder::new();
        if let Some(name) = name {
            builder = builder.name(name);
        }
        let handle = builder.spawn(move || {
            let _done = guard;
            let _scope = scope.as_ref().map(CaseScope::enter);
            f()
        })?;
        let record = ThreadRecord {
            seq: self.seq(),
            thread: handle.thread().clone(),
            done,
        };
        debug!(thread = %record.describe(), "tracked thread spawned");
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(handle)
    }

    /// Open a tracked TCP connection
    pub fn connect(&self, addr: impl ToSocketAddrs) -> io::Result<TrackedStream> {
        safepoint();
        let stream = Arc::new(TcpStream::connect(addr)?);
        self.push_socket(SocketHandle::Stream(Arc::downgrade(&stream)));
        safepoint();
        Ok(TrackedStream { inner: stream })
    }

    /// Bind a tracked TCP listener
    pub fn bind(self: &Arc<Self>, addr: impl ToSocketAddrs) -> io::Result<TrackedListener> {
        safepoint();
        let listener = Arc::new(TcpListener::bind(addr)?);
        let mut wake_addr = listener.local_addr()?;
        if wake_addr.ip().is_unspecified() {
            wake_addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        let closed = Arc::new(AtomicBool::new(false));
        self.push_socket(SocketHandle::Listener {
            listener: Arc::downgrade(&listener),
            closed: Arc::clone(&closed),
            wake_addr,
        });
        Ok(TrackedListener {
            inner: listener,
            closed,
            tracker: Arc::clone(self),
        })
    }

    fn push_socket(&self, handle: SocketHandle) {
        let record = SocketRecord {
            seq: self.seq(),
            closed: false,
            handle,
        };
        self.sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    fn register_stream(&self, stream: TcpStream) -> TrackedStream {
        let stream = Arc::new(stream);
        self.push_socket(SocketHandle::Stream(Arc::downgrade(&stream)));
        TrackedStream { inner: stream }
    }

    /// Sockets opened since `checkpoint` that are still open
    #[must_use]
    pub fn open_sockets_since(&self, checkpoint: Checkpoint) -> usize {
        self.sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.seq >= checkpoint.socket_seq && s.is_open())
            .count()
    }

    /// Close every open socket opened since `checkpoint`; returns how many
    pub fn close_sockets_since(&self, checkpoint: Checkpoint) -> usize {
        let mut closed = 0;
        let mut wake = Vec::new();
        {
            let mut sockets = self.sockets.lock().unwrap_or_else(PoisonError::into_inner);
            for record in sockets.iter_mut() {
                if record.seq >= checkpoint.socket_seq && record.is_open() {
                    wake.extend(record.close());
                    closed += 1;
                }
            }
        }
        // A blocked accept returns once someone connects
        for addr in &wake {
            let _ = TcpStream::connect_timeout(addr, WAKE_CONNECT_TIMEOUT);
        }
        closed
    }

    /// Names of tracked threads spawned since `checkpoint` that have not exited
    #[must_use]
    pub fn leaked_threads(&self, checkpoint: Checkpoint) -> Vec<String> {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| t.seq >= checkpoint.thread_seq && !t.done.load(Ordering::SeqCst))
            .map(ThreadRecord::describe)
            .collect()
    }

    /// Wake every live tracked thread spawned since `checkpoint`
    pub fn interrupt_threads_since(&self, checkpoint: Checkpoint) -> usize {
        let threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        let mut woken = 0;
        for record in threads.iter() {
            if record.seq >= checkpoint.thread_seq && !record.done.load(Ordering::SeqCst) {
                record.thread.unpark();
                woken += 1;
            }
        }
        woken
    }

    /// Drop records of exited threads and released sockets
    pub fn prune(&self) {
        self.sockets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(SocketRecord::is_open);
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|t| !t.done.load(Ordering::SeqCst));
    }

    /// Number of records currently held (threads, sockets)
    #[must_use]
    pub fn record_counts(&self) -> (usize, usize) {
        let threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner).len();
        let sockets = self.sockets.lock().unwrap_or_else(PoisonError::into_inner).len();
        (threads, sockets)
    }
}

/// TCP stream created through a [`ResourceTracker`]
#[derive(Debug, Clone)]
pub struct TrackedStream {
    inner: Arc<TcpStream>,
}

impl TrackedStream {
    /// Underlying stream
    #[must_use]
    pub fn get_ref(&self) -> &TcpStream {
        &self.inner
    }
}

impl Read for TrackedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        safepoint();
        let read = (&*self.inner).read(buf);
        safepoint();
        read
    }
}

impl Write for TrackedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        safepoint();
        let written = (&*self.inner).write(buf);
        safepoint();
        written
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.inner).flush()
    }
}

/// TCP listener created through a [`ResourceTracker`]
#[derive(Debug)]
pub struct TrackedListener {
    inner: Arc<TcpListener>,
    closed: Arc<AtomicBool>,
    tracker: Arc<ResourceTracker>,
}

impl TrackedListener {
    /// Accept a connection; the accepted stream is tracked too
    pub fn accept(&self) -> io::Result<(TrackedStream, SocketAddr)> {
        safepoint();
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_listener());
        }
        let (stream, peer) = self.inner.accept()?;
        safepoint();
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_listener());
        }
        Ok((self.tracker.register_stream(stream), peer))
    }

    /// Local address
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

fn closed_listener() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "listener closed by reclamation")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn test_safepoint_without_scope_is_noop() {
        safepoint();
        assert!(!is_stop_requested());
    }

    #[test]
    fn test_safepoint_unwinds_stopped_scope() {
        let scope = CaseScope::new("c1");
        let _guard = scope.enter();
        scope.request_stop();
        let result = catch_unwind(AssertUnwindSafe(safepoint));
        let payload = result.unwrap_err();
        assert!(is_forced_stop(payload.as_ref()));
    }

    #[test]
    fn test_scope_guard_restores_previous() {
        let outer = CaseScope::new("outer");
        let _outer = outer.enter();
        {
            let inner = CaseScope::new("inner");
            let _inner = inner.enter();
            assert_eq!(current_scope().unwrap().case(), "inner");
        }
        assert_eq!(current_scope().unwrap().case(), "outer");
    }

    #[test]
    fn test_spawned_thread_inherits_scope() {
        let tracker = ResourceTracker::new();
        let scope = CaseScope::new("c2");
        let _guard = scope.enter();
        let handle = tracker
            .spawn(Some("child".into()), || current_scope().map(|s| s.case().to_string()))
            .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("c2"));
    }

    #[test]
    fn test_stopped_sleeper_exits_and_is_not_leaked() {
        let tracker = ResourceTracker::new();
        let checkpoint = tracker.checkpoint();
        let scope = CaseScope::new("c3");
        let guard = scope.enter();
        let handle = tracker
            .spawn(Some("sleeper".into()), || interruptible_sleep(Duration::from_secs(60)))
            .unwrap();
        drop(guard);
        assert_eq!(tracker.leaked_threads(checkpoint), vec!["sleeper".to_string()]);

        scope.request_stop();
        tracker.interrupt_threads_since(checkpoint);
        assert!(handle.join().is_err());
        assert!(tracker.leaked_threads(checkpoint).is_empty());
    }

    #[test]
    fn test_checkpoint_excludes_earlier_threads() {
        let tracker = ResourceTracker::new();
        let early = tracker
            .spawn(None, || interruptible_sleep(Duration::from_millis(300)))
            .unwrap();
        let checkpoint = tracker.checkpoint();
        assert!(tracker.leaked_threads(checkpoint).is_empty());
        early.join().unwrap();
    }

    #[test]
    fn test_close_sockets_since_checkpoint() {
        let tracker = ResourceTracker::new();
        let before = tracker.bind("127.0.0.1:0").unwrap();
        let checkpoint = tracker.checkpoint();
        let listener = tracker.bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = tracker.connect(addr).unwrap();

        assert_eq!(tracker.open_sockets_since(checkpoint), 2);
        assert_eq!(tracker.close_sockets_since(checkpoint), 2);
        assert_eq!(tracker.open_sockets_since(checkpoint), 0);

        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(before.local_addr().is_ok());
    }

    #[test]
    fn test_blocked_accept_is_woken_by_close() {
        let tracker = ResourceTracker::new();
        let checkpoint = tracker.checkpoint();
        let worker_tracker = Arc::clone(&tracker);
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let listener = worker_tracker.bind("0.0.0.0:0").unwrap();
            tx.send(()).unwrap();
            listener.accept().map(|_| ()).map_err(|e| e.kind())
        });
        rx.recv().unwrap();
        tracker.close_sockets_since(checkpoint);
        assert_eq!(handle.join().unwrap(), Err(io::ErrorKind::ConnectionAborted));
    }

    #[test]
    fn test_prune_drops_finished_records() {
        let tracker = ResourceTracker::new();
        tracker.spawn(None, || ()).unwrap().join().unwrap();
        drop(tracker.bind("127.0.0.1:0").unwrap());
        tracker.prune();
        assert_eq!(tracker.record_counts(), (0, 0));
    }
}

//! Multi-threaded readiness-event dispatcher
//!
//! Each worker owns a private `mio::Poll` plus a `Waker`-backed command
//! queue. A file descriptor is pinned to exactly one worker for its lifetime
//! (`fd % worker_count`), so per-connection handlers run serially without
//! locking the event path.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use tracing::{error, trace, warn};

/// Token reserved for each worker's wakeup descriptor.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Handle for an interval timer running on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerId {
    worker: usize,
    key: usize,
}

/// Decoded readiness bits for one event.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) error: bool,
    pub(crate) hangup: bool,
}

impl Readiness {
    /// A peer FIN arrives as read-closed alongside any buffered payload;
    /// routing it through the read path lets the drain observe the final
    /// zero-length read after consuming the payload. Only a full hangup
    /// (both directions closed) short-circuits to the hangup handler.
    fn from_event(event: &Event) -> Self {
        let error = event.is_error();
        let hangup = event.is_read_closed() && event.is_write_closed();
        Self {
            readable: event.is_readable() || (event.is_read_closed() && !hangup),
            writable: event.is_writable(),
            error,
            hangup,
        }
    }

    pub(crate) fn readable() -> Self {
        Self {
            readable: true,
            writable: false,
            error: false,
            hangup: false,
        }
    }

    pub(crate) fn writable() -> Self {
        Self {
            readable: false,
            writable: true,
            error: false,
            hangup: false,
        }
    }

    pub(crate) fn hangup() -> Self {
        Self {
            readable: false,
            writable: false,
            error: false,
            hangup: true,
        }
    }
}

/// Callbacks driven by the dispatcher on its worker threads.
///
/// For every event the pipeline is: `before_process_io`; if it allows, exactly
/// one of `on_error`/`on_hungup`/`on_ready_write`/`on_ready_read` (in that
/// priority); then `after_process_io` with the handler's verdict.
pub(crate) trait DispatchHandler: Send + Sync + 'static {
    /// Payload carried by [`Dispatcher::send_command_by_fd`].
    type Command: Send + 'static;

    fn before_process_io(&self, ctx: &DispatchContext<'_, Self>, token: Token, ready: Readiness) -> bool
    where
        Self: Sized,
    {
        let _ = (ctx, token, ready);
        true
    }

    fn on_error(&self, ctx: &DispatchContext<'_, Self>, token: Token, ready: Readiness) -> bool
    where
        Self: Sized;

    fn on_hungup(&self, ctx: &DispatchContext<'_, Self>, token: Token, ready: Readiness) -> bool
    where
        Self: Sized;

    fn on_ready_write(&self, ctx: &DispatchContext<'_, Self>, token: Token, ready: Readiness) -> bool
    where
        Self: Sized;

    fn on_ready_read(&self, ctx: &DispatchContext<'_, Self>, token: Token, ready: Readiness) -> bool
    where
        Self: Sized;

    fn after_process_io(&self, ctx: &DispatchContext<'_, Self>, token: Token, ready: Readiness, result: bool)
    where
        Self: Sized,
    {
        let _ = (ctx, token, ready, result);
    }

    fn on_command(&self, ctx: &DispatchContext<'_, Self>, command: Self::Command)
    where
        Self: Sized,
    {
        let _ = (ctx, command);
    }

    fn on_timer(&self, ctx: &DispatchContext<'_, Self>, timer: TimerId)
    where
        Self: Sized,
    {
        let _ = (ctx, timer);
    }
}

/// Worker-side view handed to every handler invocation.
pub(crate) struct DispatchContext<'a, H: DispatchHandler> {
    handler: &'a H,
    registry: &'a Registry,
    worker_index: usize,
}

impl<'a, H: DispatchHandler> DispatchContext<'a, H> {
    pub(crate) fn worker_index(&self) -> usize {
        self.worker_index
    }

    /// The owning worker's registry, for rearming interest from handlers.
    pub(crate) fn registry(&self) -> &Registry {
        self.registry
    }

    /// This backend registers edge-triggered; I/O drains must run to
    /// `WouldBlock` rather than a bounded iteration count.
    pub(crate) fn edge_triggered(&self) -> bool {
        true
    }

    /// Runs the full before/route/after pipeline for a synthesized event on
    /// the current worker. Command handlers use this so their I/O shares the
    /// rearm logic of real readiness events.
    pub(crate) fn process_io(&self, token: Token, ready: Readiness) {
        dispatch_one(self.handler, self, token, ready);
    }
}

fn dispatch_one<H: DispatchHandler>(
    handler: &H,
    ctx: &DispatchContext<'_, H>,
    token: Token,
    ready: Readiness,
) {
    if !handler.before_process_io(ctx, token, ready) {
        return;
    }
    let result = if ready.error {
        handler.on_error(ctx, token, ready)
    } else if ready.hangup {
        handler.on_hungup(ctx, token, ready)
    } else if ready.writable {
        handler.on_ready_write(ctx, token, ready)
    } else if ready.readable {
        handler.on_ready_read(ctx, token, ready)
    } else {
        true
    };
    handler.after_process_io(ctx, token, ready, result);
}

enum WorkerMsg<C> {
    Command(C),
    AddTimer {
        interval: Duration,
        reply: Sender<TimerId>,
    },
    Shutdown,
}

struct WorkerHandle<C> {
    registry: Registry,
    waker: Arc<Waker>,
    tx: Sender<WorkerMsg<C>>,
    thread: Option<JoinHandle<()>>,
}

/// Pool of poll-owning worker threads.
pub(crate) struct Dispatcher<C: Send + 'static> {
    workers: Vec<WorkerHandle<C>>,
}

impl<C: Send + 'static> Dispatcher<C> {
    /// Spawns `worker_count` workers, each waiting on up to `max_events`
    /// readiness notifications per wake.
    pub(crate) fn start<H>(
        handler: Arc<H>,
        max_events: usize,
        worker_count: usize,
    ) -> io::Result<Self>
    where
        H: DispatchHandler<Command = C>,
    {
        debug_assert!(worker_count > 0);
        let mut dispatcher = Self {
            workers: Vec::with_capacity(worker_count),
        };

        for index in 0..worker_count {
            match spawn_worker(index, Arc::clone(&handler), max_events) {
                Ok(worker) => dispatcher.workers.push(worker),
                Err(err) => {
                    dispatcher.stop();
                    return Err(err);
                }
            }
        }
        Ok(dispatcher)
    }

    fn worker_for_fd(&self, fd: RawFd) -> &WorkerHandle<C> {
        &self.workers[fd as usize % self.workers.len()]
    }

    /// Registers `source` with the worker that owns `fd`.
    pub(crate) fn register_fd<S>(
        &self,
        source: &mut S,
        fd: RawFd,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.worker_for_fd(fd).registry.register(source, token, interest)
    }

    pub(crate) fn deregister_fd<S>(&self, source: &mut S, fd: RawFd) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.worker_for_fd(fd).registry.deregister(source)
    }

    /// Posts a command to the worker that owns `fd`. Delivery is FIFO per
    /// caller; fails only when the wakeup channel is broken.
    pub(crate) fn send_command_by_fd(&self, fd: RawFd, command: C) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid fd"));
        }
        let worker = self.worker_for_fd(fd);
        worker
            .tx
            .send(WorkerMsg::Command(command))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker queue closed"))?;
        worker.waker.wake()
    }

    /// Installs an interval timer on `worker_index`; the worker raises
    /// `on_timer` every `interval` from now on.
    pub(crate) fn add_timer(&self, worker_index: usize, interval: Duration) -> io::Result<TimerId> {
        let worker = self
            .workers
            .get(worker_index)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no such worker"))?;

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        worker
            .tx
            .send(WorkerMsg::AddTimer {
                interval,
                reply: reply_tx,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker queue closed"))?;
        worker.waker.wake()?;

        reply_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "worker did not ack timer"))
    }

    /// Signals every worker and joins them. Idempotent.
    pub(crate) fn stop(&mut self) {
        for worker in &self.workers {
            let _ = worker.tx.send(WorkerMsg::Shutdown);
            let _ = worker.waker.wake();
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    error!("dispatcher worker panicked");
                }
            }
        }
    }
}

impl<C: Send + 'static> Drop for Dispatcher<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_worker<H: DispatchHandler>(
    index: usize,
    handler: Arc<H>,
    max_events: usize,
) -> io::Result<WorkerHandle<H::Command>> {
    let poll = Poll::new()?;
    let registry = poll.registry().try_clone()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    let (tx, rx) = crossbeam_channel::unbounded();

    let thread = thread::Builder::new()
        .name(format!("drover-worker-{index}"))
        .spawn(move || worker_loop(index, handler, poll, rx, max_events))?;

    Ok(WorkerHandle {
        registry,
        waker,
        tx,
        thread: Some(thread),
    })
}

struct IntervalTimer {
    interval: Duration,
    deadline: Instant,
}

fn worker_loop<H: DispatchHandler>(
    index: usize,
    handler: Arc<H>,
    mut poll: Poll,
    rx: Receiver<WorkerMsg<H::Command>>,
    max_events: usize,
) {
    let mut events = Events::with_capacity(max_events);
    let mut timers: Slab<IntervalTimer> = Slab::new();
    trace!(worker = index, "dispatch worker started");

    'outer: loop {
        let timeout = timers
            .iter()
            .map(|(_, timer)| timer.deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));

        if let Err(err) = poll.poll(&mut events, timeout) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(worker = index, error = %err, "poll failed, worker exiting");
            return;
        }

        let ctx = DispatchContext {
            handler: &*handler,
            registry: poll.registry(),
            worker_index: index,
        };

        let now = Instant::now();
        let due: Vec<usize> = timers
            .iter()
            .filter(|(_, timer)| timer.deadline <= now)
            .map(|(key, _)| key)
            .collect();
        for key in due {
            let interval = timers[key].interval;
            timers[key].deadline = now + interval;
            handler.on_timer(&ctx, TimerId { worker: index, key });
        }

        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                // drain everything posted since the last wake; readiness of
                // the wakeup descriptor is coalesced, the queue is not
                while let Ok(msg) = rx.try_recv() {
                    match msg {
                        WorkerMsg::Command(command) => handler.on_command(&ctx, command),
                        WorkerMsg::AddTimer { interval, reply } => {
                            let key = timers.insert(IntervalTimer {
                                interval,
                                deadline: Instant::now() + interval,
                            });
                            if reply.send(TimerId { worker: index, key }).is_err() {
                                warn!(worker = index, "timer registrant went away");
                                timers.remove(key);
                            }
                        }
                        WorkerMsg::Shutdown => break 'outer,
                    }
                }
            } else {
                dispatch_one(&*handler, &ctx, event.token(), Readiness::from_event(event));
            }
        }
    }

    trace!(worker = index, "dispatch worker stopped");
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingHandler {
        commands: Mutex<Vec<u32>>,
        timer_ticks: AtomicUsize,
        writables: AtomicUsize,
    }

    impl DispatchHandler for CountingHandler {
        type Command = u32;

        fn on_error(&self, _: &DispatchContext<'_, Self>, _: Token, _: Readiness) -> bool {
            true
        }

        fn on_hungup(&self, _: &DispatchContext<'_, Self>, _: Token, _: Readiness) -> bool {
            true
        }

        fn on_ready_write(&self, _: &DispatchContext<'_, Self>, _: Token, _: Readiness) -> bool {
            self.writables.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn on_ready_read(&self, _: &DispatchContext<'_, Self>, _: Token, _: Readiness) -> bool {
            true
        }

        fn on_command(&self, _: &DispatchContext<'_, Self>, command: u32) {
            self.commands.lock().unwrap().push(command);
        }

        fn on_timer(&self, _: &DispatchContext<'_, Self>, _: TimerId) {
            self.timer_ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn commands_reach_the_pinned_worker_in_order() {
        let handler = Arc::new(CountingHandler::default());
        let mut dispatcher = Dispatcher::start(Arc::clone(&handler), 64, 2).unwrap();

        for n in 0..16u32 {
            dispatcher.send_command_by_fd(7, n).unwrap();
        }

        assert!(wait_until(Duration::from_secs(1), || {
            handler.commands.lock().unwrap().len() == 16
        }));
        let seen = handler.commands.lock().unwrap().clone();
        assert_eq!((0..16).collect::<Vec<u32>>(), seen);

        dispatcher.stop();
    }

    #[test]
    fn interval_timer_keeps_firing() {
        let handler = Arc::new(CountingHandler::default());
        let mut dispatcher = Dispatcher::start(Arc::clone(&handler), 64, 1).unwrap();

        dispatcher.add_timer(0, Duration::from_millis(20)).unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            handler.timer_ticks.load(Ordering::SeqCst) >= 3
        }));

        dispatcher.stop();
    }

    #[test]
    fn add_timer_rejects_unknown_worker() {
        let handler = Arc::new(CountingHandler::default());
        let mut dispatcher = Dispatcher::start(Arc::clone(&handler), 64, 1).unwrap();
        assert!(dispatcher.add_timer(5, Duration::from_millis(20)).is_err());
        dispatcher.stop();
    }

    #[test]
    fn registered_stream_raises_writable_readiness() {
        use std::os::fd::AsRawFd;

        let handler = Arc::new(CountingHandler::default());
        let mut dispatcher = Dispatcher::start(Arc::clone(&handler), 64, 2).unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut stream = mio::net::TcpStream::connect(addr).unwrap();
        let fd = stream.as_raw_fd();

        dispatcher
            .register_fd(&mut stream, fd, Token(1), Interest::WRITABLE)
            .unwrap();

        assert!(wait_until(Duration::from_secs(1), || {
            handler.writables.load(Ordering::SeqCst) >= 1
        }));

        dispatcher.deregister_fd(&mut stream, fd).unwrap();
        dispatcher.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let handler = Arc::new(CountingHandler::default());
        let mut dispatcher = Dispatcher::<u32>::start(handler, 64, 2).unwrap();
        dispatcher.stop();
        dispatcher.stop();
    }
}

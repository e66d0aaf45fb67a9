//! Single-threaded cooperative event loop.
//!
//! Sources are file descriptors (polled for readability) and timers. A
//! callback runs to completion; it may add or remove sources, including its
//! own, and may call back into anything that holds a clone of the loop.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::trace;

/// Identifier of a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(u64);

/// Dispatch priority. Among ready sources only the highest priority group
/// is dispatched in one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    High,
    Default,
    Low,
}

/// What a callback wants to happen to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Remove,
}

/// Poll result handed to descriptor callbacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub hangup: bool,
    pub error: bool,
}

type FdCallback = Box<dyn FnMut(Readiness) -> Dispatch>;
type TimerCallback = Box<dyn FnMut() -> Dispatch>;

enum Callback {
    Fd(FdCallback),
    Timer(TimerCallback),
}

enum Trigger {
    Fd(RawFd),
    Timer { interval: Duration, deadline: Instant },
}

struct Source {
    trigger: Trigger,
    priority: Priority,
    /// `None` while the callback is running.
    callback: Option<Callback>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    sources: BTreeMap<SourceId, Source>,
    quit: bool,
}

/// Cloneable handle to one event loop.
#[derive(Clone, Default)]
pub struct EventLoop {
    inner: Rc<RefCell<Inner>>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("sources", &self.source_count())
            .finish()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `fd` for readability. The descriptor must stay open until the
    /// source is removed.
    pub fn add_fd(
        &self,
        fd: RawFd,
        priority: Priority,
        callback: impl FnMut(Readiness) -> Dispatch + 'static,
    ) -> SourceId {
        self.insert(Source {
            trigger: Trigger::Fd(fd),
            priority,
            callback: Some(Callback::Fd(Box::new(callback))),
        })
    }

    /// Call `callback` every `interval` until it returns [`Dispatch::Remove`].
    pub fn add_timeout(
        &self,
        interval: Duration,
        callback: impl FnMut() -> Dispatch + 'static,
    ) -> SourceId {
        self.insert(Source {
            trigger: Trigger::Timer {
                interval,
                deadline: Instant::now() + interval,
            },
            priority: Priority::Default,
            callback: Some(Callback::Timer(Box::new(callback))),
        })
    }

    fn insert(&self, source: Source) -> SourceId {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let id = SourceId(inner.next_id);
        inner.sources.insert(id, source);
        id
    }

    /// Remove a source. Returns false if it was already gone.
    pub fn remove(&self, id: SourceId) -> bool {
        self.inner.borrow_mut().sources.remove(&id).is_some()
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.inner.borrow().sources.contains_key(&id)
    }

    pub fn source_count(&self) -> usize {
        self.inner.borrow().sources.len()
    }

    /// Ask [`EventLoop::run`] to return after the current iteration.
    pub fn quit(&self) {
        self.inner.borrow_mut().quit = true;
    }

    /// Run until [`EventLoop::quit`] is called or no sources remain.
    pub fn run(&self) -> io::Result<()> {
        self.inner.borrow_mut().quit = false;
        loop {
            {
                let inner = self.inner.borrow();
                if inner.quit || inner.sources.is_empty() {
                    break;
                }
            }
            self.iterate(None)?;
        }
        self.inner.borrow_mut().quit = false;
        Ok(())
    }

    /// Wait at most `timeout` (forever for `None`) for a source to become
    /// ready and dispatch the highest-priority ready group.
    ///
    /// Returns whether any callback ran.
    pub fn iterate(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let (mut pollfds, fd_ids, next_deadline) = self.prepare();
        if pollfds.is_empty() && next_deadline.is_none() && timeout.is_none() {
            return Ok(false);
        }

        let now = Instant::now();
        let until_timer = next_deadline.map(|d| d.saturating_duration_since(now));
        let wait = match (timeout, until_timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        if poll(&mut pollfds, wait)? == PollOutcome::Interrupted {
            return Ok(false);
        }

        let mut ready: Vec<(Priority, SourceId, Option<Readiness>)> = Vec::new();
        {
            let inner = self.inner.borrow();
            for (pfd, id) in pollfds.iter().zip(&fd_ids) {
                if pfd.revents == 0 {
                    continue;
                }
                if let Some(source) = inner.sources.get(id) {
                    let readiness = Readiness {
                        readable: pfd.revents & libc::POLLIN != 0,
                        hangup: pfd.revents & libc::POLLHUP != 0,
                        error: pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
                    };
                    ready.push((source.priority, *id, Some(readiness)));
                }
            }
            let now = Instant::now();
            for (id, source) in &inner.sources {
                if let Trigger::Timer { deadline, .. } = source.trigger {
                    if deadline <= now {
                        ready.push((source.priority, *id, None));
                    }
                }
            }
        }

        let Some(best) = ready.iter().map(|(p, _, _)| *p).min() else {
            return Ok(false);
        };
        ready.retain(|(p, _, _)| *p == best);
        ready.sort_by_key(|(_, id, _)| *id);

        let mut dispatched = false;
        for (_, id, readiness) in ready {
            dispatched |= self.dispatch(id, readiness);
        }
        Ok(dispatched)
    }

    fn prepare(&self) -> (Vec<libc::pollfd>, Vec<SourceId>, Option<Instant>) {
        let inner = self.inner.borrow();
        let mut pollfds = Vec::new();
        let mut ids = Vec::new();
        let mut next_deadline: Option<Instant> = None;
        for (id, source) in &inner.sources {
            match source.trigger {
                Trigger::Fd(fd) => {
                    pollfds.push(libc::pollfd {
                        fd,
                        events: libc::POLLIN,
                        revents: 0,
                    });
                    ids.push(*id);
                }
                Trigger::Timer { deadline, .. } => {
                    next_deadline = Some(next_deadline.map_or(deadline, |d| d.min(deadline)));
                }
            }
        }
        (pollfds, ids, next_deadline)
    }

    /// Run one source's callback with the loop unborrowed.
    fn dispatch(&self, id: SourceId, readiness: Option<Readiness>) -> bool {
        let callback = {
            let mut inner = self.inner.borrow_mut();
            match inner.sources.get_mut(&id) {
                Some(source) => source.callback.take(),
                None => None,
            }
        };
        let Some(mut callback) = callback else {
            return false;
        };

        trace!(source = id.0, "dispatching");
        let outcome = match (&mut callback, readiness) {
            (Callback::Fd(cb), Some(r)) => cb(r),
            (Callback::Timer(cb), None) => cb(),
            _ => Dispatch::Continue,
        };

        let mut inner = self.inner.borrow_mut();
        match outcome {
            Dispatch::Continue => {
                if let Some(source) = inner.sources.get_mut(&id) {
                    if let Trigger::Timer { interval, deadline } = &mut source.trigger {
                        *deadline = Instant::now() + *interval;
                    }
                    source.callback = Some(callback);
                }
            }
            Dispatch::Remove => {
                inner.sources.remove(&id);
            }
        }
        true
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PollOutcome {
    Ready,
    Interrupted,
}

fn poll(fds: &mut [libc::pollfd], wait: Option<Duration>) -> io::Result<PollOutcome> {
    let timeout_ms: libc::c_int = match wait {
        None => -1,
        Some(d) => {
            let ms = d.as_millis() + u128::from(d.subsec_nanos() % 1_000_000 != 0);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    };
    // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd structs
    // and its length is passed alongside the pointer.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(PollOutcome::Interrupted);
        }
        return Err(err);
    }
    Ok(PollOutcome::Ready)
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn timer_fires_and_removes_itself() {
        let ev = EventLoop::new();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        ev.add_timeout(Duration::from_millis(1), move || {
            h.set(h.get() + 1);
            if h.get() == 3 {
                Dispatch::Remove
            } else {
                Dispatch::Continue
            }
        });
        ev.run().unwrap();
        assert_eq!(hits.get(), 3);
        assert_eq!(ev.source_count(), 0);
    }

    #[test]
    fn fd_source_sees_readable_data() {
        let ev = EventLoop::new();
        let (mut tx, rx) = std::os::unix::net::UnixStream::pair().unwrap();
        let seen = Rc::new(Cell::new(false));
        let s = Rc::clone(&seen);
        let id = ev.add_fd(rx.as_raw_fd(), Priority::Default, move |r| {
            s.set(r.readable);
            Dispatch::Remove
        });

        assert!(!ev.iterate(Some(Duration::from_millis(5))).unwrap());
        tx.write_all(b"x").unwrap();
        assert!(ev.iterate(Some(Duration::from_secs(1))).unwrap());
        assert!(seen.get());
        assert!(!ev.contains(id));
        drop(rx);
    }

    #[test]
    fn high_priority_group_runs_first() {
        let ev = EventLoop::new();
        let (mut tx_a, rx_a) = std::os::unix::net::UnixStream::pair().unwrap();
        let (mut tx_b, rx_b) = std::os::unix::net::UnixStream::pair().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = Rc::clone(&order);
        ev.add_fd(rx_a.as_raw_fd(), Priority::Low, move |_| {
            o.borrow_mut().push("low");
            Dispatch::Remove
        });
        let o = Rc::clone(&order);
        ev.add_fd(rx_b.as_raw_fd(), Priority::High, move |_| {
            o.borrow_mut().push("high");
            Dispatch::Remove
        });

        tx_a.write_all(b"a").unwrap();
        tx_b.write_all(b"b").unwrap();
        ev.iterate(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(*order.borrow(), vec!["high"]);
        ev.iterate(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(*order.borrow(), vec!["high", "low"]);
    }

    #[test]
    fn callbacks_may_touch_the_loop() {
        let ev = EventLoop::new();
        let fired = Rc::new(Cell::new(false));
        let inner_ev = ev.clone();
        let f = Rc::clone(&fired);
        ev.add_timeout(Duration::from_millis(1), move || {
            let f = Rc::clone(&f);
            inner_ev.add_timeout(Duration::from_millis(1), move || {
                f.set(true);
                Dispatch::Remove
            });
            Dispatch::Remove
        });
        ev.run().unwrap();
        assert!(fired.get());
    }

    #[test]
    fn quit_stops_run() {
        let ev = EventLoop::new();
        let handle = ev.clone();
        let ticks = Rc::new(Cell::new(0));
        let t = Rc::clone(&ticks);
        ev.add_timeout(Duration::from_millis(1), move || {
            t.set(t.get() + 1);
            handle.quit();
            Dispatch::Continue
        });
        ev.run().unwrap();
        assert_eq!(ticks.get(), 1);
        assert_eq!(ev.source_count(), 1);
    }

    #[test]
    fn empty_loop_does_not_block() {
        let ev = EventLoop::new();
        assert!(!ev.iterate(None).unwrap());
        ev.run().unwrap();
    }
}

//! Event Loop Module
//!
//! Single-threaded cooperative reactor built on `mio`: one `Poll` blocks on
//! registered fd sources with a timeout bounded by the next timer deadline,
//! then each iteration fires due timers, runs idle callbacks when nothing
//! else was pending, and hands drained flip completions to the caller's
//! draw phase. Token 0 is reserved for the waker that the flip worker (or a
//! [`QuitSignal`] from another thread) rings to interrupt a blocked poll.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::screen::kms::{FlipComplete, FlipNotifier};

/// Token reserved for the cross-thread waker
const WAKER: Token = Token(0);

/// Poll timeout ceiling; a quit or waker interrupts it early
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopped,
}

/// Handle to a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Cross-thread quit request
///
/// Cloneable flag plus waker, the same shape the flip worker uses: raising
/// it marks the loop for termination and interrupts a blocked poll. The
/// current iteration still runs to completion.
#[derive(Clone)]
pub struct QuitSignal {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl QuitSignal {
    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake event loop for quit: {}", e);
        }
    }

    pub fn raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

struct TimerEntry {
    deadline: Instant,
    id: TimerId,
    period: Option<Duration>,
    callback: Box<dyn FnMut()>,
}

// Min-deadline ordering for the max-heap; ties break on the older id so
// timers scheduled for the same instant fire in creation order.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

pub struct EventLoop {
    /// `None` after `close()`; using the loop past that point is a
    /// debug-asserted programming error
    poll: Option<Poll>,
    events: Events,
    waker: Arc<Waker>,
    state: LoopState,
    quit: Arc<AtomicBool>,
    notifier: FlipNotifier,
    timers: BinaryHeap<TimerEntry>,
    canceled: HashSet<TimerId>,
    next_timer: u64,
    sources: HashMap<Token, Box<dyn FnMut()>>,
    next_token: usize,
    idle: Vec<Box<dyn FnMut()>>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let poll = Poll::new().map_err(Error::Loop)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(Error::Loop)?);
        let notifier = FlipNotifier::new();
        notifier.attach_waker(waker.clone());
        debug!("Event loop created");
        Ok(Self {
            poll: Some(poll),
            events: Events::with_capacity(64),
            waker,
            state: LoopState::Idle,
            quit: Arc::new(AtomicBool::new(false)),
            notifier,
            timers: BinaryHeap::new(),
            canceled: HashSet::new(),
            next_timer: 0,
            sources: HashMap::new(),
            next_token: 1,
            idle: Vec::new(),
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Flip-completion channel wired to this loop's waker; clone it into
    /// every plane device so completions interrupt a blocked poll
    pub fn notifier(&self) -> FlipNotifier {
        self.notifier.clone()
    }

    /// Drain completions without polling, for manually driven draw cycles
    pub fn drain_flips(&self) -> Vec<FlipComplete> {
        self.notifier.drain()
    }

    pub fn quit_signal(&self) -> QuitSignal {
        QuitSignal { flag: self.quit.clone(), waker: self.waker.clone() }
    }

    /// Request termination; the current iteration runs to completion
    pub fn quit(&mut self) {
        self.quit.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake event loop for quit: {}", e);
        }
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Register an fd source; its callback runs whenever the fd is ready
    /// and must read until `WouldBlock`
    pub fn register<S, F>(&mut self, source: &mut S, interests: Interest, callback: F) -> Result<Token>
    where
        S: Source + ?Sized,
        F: FnMut() + 'static,
    {
        debug_assert!(self.state != LoopState::Stopped, "event loop used after close");
        let Some(poll) = self.poll.as_ref() else {
            return Err(Error::Loop(io::Error::from(io::ErrorKind::NotConnected)));
        };
        let token = Token(self.next_token);
        self.next_token += 1;
        poll.registry()
            .register(source, token, interests)
            .map_err(Error::Loop)?;
        self.sources.insert(token, Box::new(callback));
        debug!("Registered source on token {:?}", token);
        Ok(token)
    }

    pub fn deregister<S: Source + ?Sized>(&mut self, source: &mut S, token: Token) -> Result<()> {
        if let Some(poll) = self.poll.as_ref() {
            poll.registry().deregister(source).map_err(Error::Loop)?;
        }
        self.sources.remove(&token);
        Ok(())
    }

    /// Schedule a one-shot timer
    pub fn add_timer<F: FnMut() + 'static>(&mut self, delay: Duration, callback: F) -> TimerId {
        self.schedule(delay, None, Box::new(callback))
    }

    /// Schedule a timer that rearms itself every `period`
    pub fn add_periodic_timer<F: FnMut() + 'static>(&mut self, period: Duration, callback: F) -> TimerId {
        self.schedule(period, Some(period), Box::new(callback))
    }

    fn schedule(&mut self, delay: Duration, period: Option<Duration>, callback: Box<dyn FnMut()>) -> TimerId {
        debug_assert!(self.state != LoopState::Stopped, "event loop used after close");
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        self.timers.push(TimerEntry {
            deadline: Instant::now() + delay,
            id,
            period,
            callback,
        });
        trace!("Timer {:?} scheduled in {:?}", id, delay);
        id
    }

    /// Cancel a timer; a canceled timer never fires again, even if its
    /// deadline already passed
    ///
    /// Canceling an id that already fired (or was never issued) is a no-op,
    /// so stale ids leave no trace behind.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if self.timers.iter().any(|entry| entry.id == id) {
            self.canceled.insert(id);
        }
    }

    /// Register a callback run once per iteration in which no fd readiness
    /// or timer fired, in registration order
    pub fn add_idle_callback<F: FnMut() + 'static>(&mut self, callback: F) {
        self.idle.push(Box::new(callback));
    }

    /// One bounded loop iteration: poll, dispatch sources, fire timers,
    /// idle callbacks; returns the flip completions drained this iteration
    pub fn wait(&mut self) -> Result<Vec<FlipComplete>> {
        debug_assert!(self.state != LoopState::Stopped, "event loop used after close");
        let timeout = self.next_timeout();
        let Some(poll) = self.poll.as_mut() else {
            return Ok(Vec::new());
        };

        self.events.clear();
        if let Err(e) = poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(Error::Loop(e));
            }
        }

        let fired: Vec<Token> = self
            .events
            .iter()
            .map(|event| event.token())
            .filter(|token| *token != WAKER)
            .collect();
        for token in &fired {
            if let Some(callback) = self.sources.get_mut(token) {
                callback();
            }
        }

        let timers_fired = self.fire_due_timers();

        if fired.is_empty() && timers_fired == 0 {
            for callback in &mut self.idle {
                callback();
            }
        }

        Ok(self.notifier.drain())
    }

    /// Block until [`quit`](Self::quit) is requested, handing each
    /// iteration's flip completions to `phase` for the draw cycle
    pub fn run_with(
        &mut self,
        phase: &mut dyn FnMut(&mut EventLoop, &[FlipComplete]),
    ) -> Result<()> {
        self.mark_running();
        while !self.quit_requested() {
            let completions = self.wait()?;
            phase(self, &completions);
        }
        self.mark_idle();
        debug!("Event loop exited");
        Ok(())
    }

    /// Release the poll; every later call on this loop is a programming
    /// error caught by debug assertions
    pub fn close(&mut self) {
        debug!("Event loop closed");
        self.poll = None;
        self.sources.clear();
        self.timers.clear();
        self.idle.clear();
        self.state = LoopState::Stopped;
    }

    pub(crate) fn mark_running(&mut self) {
        debug_assert!(self.state != LoopState::Stopped, "event loop used after close");
        self.state = LoopState::Running;
    }

    // Returning to Idle acknowledges the quit request, so the loop can be
    // run again.
    pub(crate) fn mark_idle(&mut self) {
        if self.state == LoopState::Running {
            self.state = LoopState::Idle;
            self.quit.store(false, Ordering::SeqCst);
        }
    }

    #[cfg(test)]
    pub(crate) fn canceled_count(&self) -> usize {
        self.canceled.len()
    }

    fn next_timeout(&self) -> Duration {
        match self.timers.peek() {
            Some(entry) => entry
                .deadline
                .saturating_duration_since(Instant::now())
                .min(POLL_TIMEOUT),
            None => POLL_TIMEOUT,
        }
    }

    fn fire_due_timers(&mut self) -> usize {
        let now = Instant::now();
        let mut fired = 0;
        loop {
            match self.timers.peek() {
                Some(entry) if entry.deadline <= now => {}
                _ => break,
            }
            let Some(mut entry) = self.timers.pop() else { break };
            if self.canceled.remove(&entry.id) {
                continue;
            }
            trace!("Timer {:?} fired", entry.id);
            (entry.callback)();
            fired += 1;
            if let Some(period) = entry.period {
                entry.deadline = now + period;
                self.timers.push(entry);
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::screen::kms::PlaneId;

    #[test]
    fn test_one_shot_timer_fires_once() {
        let mut event_loop = EventLoop::new().unwrap();
        let hits = Rc::new(RefCell::new(0u32));
        {
            let hits = hits.clone();
            event_loop.add_timer(Duration::ZERO, move || *hits.borrow_mut() += 1);
        }
        event_loop.wait().unwrap();
        assert_eq!(*hits.borrow(), 1);
        event_loop.wait().unwrap();
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn test_canceled_timer_never_fires() {
        let mut event_loop = EventLoop::new().unwrap();
        let hits = Rc::new(RefCell::new(0u32));
        let id = {
            let hits = hits.clone();
            event_loop.add_timer(Duration::ZERO, move || *hits.borrow_mut() += 1)
        };
        // Canceling after the deadline passed still suppresses the fire.
        event_loop.cancel_timer(id);
        event_loop.wait().unwrap();
        assert_eq!(*hits.borrow(), 0);
    }

    #[test]
    fn test_cancel_of_fired_timer_leaves_no_residue() {
        let mut event_loop = EventLoop::new().unwrap();
        let id = event_loop.add_timer(Duration::ZERO, || {});
        event_loop.wait().unwrap();
        // The one-shot already fired; its id has no live entry to mark.
        event_loop.cancel_timer(id);
        assert_eq!(event_loop.canceled_count(), 0);
        // A live cancel is tracked until its entry pops, then dropped.
        let live = event_loop.add_timer(Duration::from_secs(60), || {});
        event_loop.cancel_timer(live);
        assert_eq!(event_loop.canceled_count(), 1);
    }

    #[test]
    fn test_periodic_timer_rearms() {
        let mut event_loop = EventLoop::new().unwrap();
        let hits = Rc::new(RefCell::new(0u32));
        {
            let hits = hits.clone();
            event_loop.add_periodic_timer(Duration::from_millis(1), move || {
                *hits.borrow_mut() += 1
            });
        }
        for _ in 0..3 {
            event_loop.wait().unwrap();
        }
        assert!(*hits.borrow() >= 2);
    }

    #[test]
    fn test_same_deadline_fires_in_creation_order() {
        let mut event_loop = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            event_loop.add_timer(Duration::ZERO, move || order.borrow_mut().push(i));
        }
        event_loop.wait().unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_idle_runs_only_when_nothing_fired() {
        let mut event_loop = EventLoop::new().unwrap();
        let idle_hits = Rc::new(RefCell::new(0u32));
        {
            let idle_hits = idle_hits.clone();
            event_loop.add_idle_callback(move || *idle_hits.borrow_mut() += 1);
        }
        event_loop.add_timer(Duration::ZERO, || {});
        // A due timer preempts the idle pass.
        event_loop.wait().unwrap();
        assert_eq!(*idle_hits.borrow(), 0);
        // Nothing pending: idle runs exactly once for the iteration.
        event_loop.wait().unwrap();
        assert_eq!(*idle_hits.borrow(), 1);
    }

    #[test]
    fn test_quit_finishes_current_iteration() {
        let mut event_loop = EventLoop::new().unwrap();
        let mut phases = 0u32;
        event_loop
            .run_with(&mut |event_loop, _| {
                phases += 1;
                event_loop.quit();
            })
            .unwrap();
        // The iteration that requested quit still ran its draw phase.
        assert_eq!(phases, 1);
        assert_eq!(event_loop.state(), LoopState::Idle);
    }

    #[test]
    fn test_quit_signal_interrupts_from_another_thread() {
        let mut event_loop = EventLoop::new().unwrap();
        let signal = event_loop.quit_signal();
        let handle = std::thread::spawn(move || signal.raise());
        event_loop.run_with(&mut |_, _| {}).unwrap();
        handle.join().unwrap();
        assert_eq!(event_loop.state(), LoopState::Idle);
    }

    #[test]
    fn test_loop_can_run_again_after_quit() {
        let mut event_loop = EventLoop::new().unwrap();
        let mut phases = 0u32;
        let mut phase = |event_loop: &mut EventLoop, _: &[FlipComplete]| {
            phases += 1;
            event_loop.quit();
        };
        event_loop.run_with(&mut phase).unwrap();
        // Exiting acknowledged the quit; a second run loops again instead
        // of returning immediately.
        assert!(!event_loop.quit_requested());
        event_loop.run_with(&mut phase).unwrap();
        assert_eq!(phases, 2);
    }

    #[test]
    fn test_wait_returns_posted_flip_completions() {
        let mut event_loop = EventLoop::new().unwrap();
        let notifier = event_loop.notifier();
        notifier.post(FlipComplete { plane: PlaneId(7) });
        let completions = event_loop.wait().unwrap();
        assert_eq!(completions, vec![FlipComplete { plane: PlaneId(7) }]);
        assert!(event_loop.drain_flips().is_empty());
    }

    #[test]
    fn test_close_stops_the_loop() {
        let mut event_loop = EventLoop::new().unwrap();
        event_loop.close();
        assert_eq!(event_loop.state(), LoopState::Stopped);
    }
}

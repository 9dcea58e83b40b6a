//! Monotonic time source and cancellable sleeps, injectable so tests can
//! drive a monitor's timer deterministically instead of sleeping in real
//! time.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

pub type BoxSleep = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Contract: `sleep` resolves at-least-once after `duration` elapses on
/// this clock. Callers race it against a command channel in a `select!` to
/// get reset/cancel semantics, rather than this trait exposing a Go-style
/// timer handle directly.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;

    /// Wall-clock seconds used to stamp persisted records (`KeepaliveRecord`,
    /// `Entity.last_seen`, event timestamps) — distinct from the monotonic
    /// `now()` used purely for scheduling, since persisted timestamps must
    /// stay comparable across process restarts (a monotonic `Instant`
    /// doesn't). [`VirtualClock`] ties this to the same counter `advance`
    /// moves, so test scenarios can assert on it directly.
    fn unix_now(&self) -> i64;

    fn sleep(&self, duration: Duration) -> BoxSleep;
}

/// Production clock backed by `tokio::time` and the real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_now(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn sleep(&self, duration: Duration) -> BoxSleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[derive(Debug, Default)]
struct VirtualClockInner {
    elapsed: Duration,
    waiters: VecDeque<(Duration, Waker)>,
}

/// Test clock. `now()` is anchored to a fixed epoch captured at
/// construction; time only advances when [`VirtualClock::advance`] is
/// called, in the calling thread, so tests can assert state between ticks
/// with no races against real wall-clock time.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    epoch: Instant,
    inner: Arc<Mutex<VirtualClockInner>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            inner: Arc::new(Mutex::new(VirtualClockInner::default())),
        }
    }

    /// Moves the clock forward by `delta`, waking any sleep whose deadline
    /// has now elapsed. Wakers run synchronously on the caller but actual
    /// polling of the woken futures happens on whatever executor they were
    /// spawned on.
    pub fn advance(&self, delta: Duration) {
        let mut guard = self.inner.lock().expect("virtual clock poisoned");
        guard.elapsed += delta;
        let now = guard.elapsed;
        let mut still_waiting = VecDeque::with_capacity(guard.waiters.len());
        while let Some((deadline, waker)) = guard.waiters.pop_front() {
            if deadline <= now {
                waker.wake();
            } else {
                still_waiting.push_back((deadline, waker));
            }
        }
        guard.waiters = still_waiting;
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.lock().expect("virtual clock poisoned").elapsed
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.epoch + self.elapsed()
    }

    fn unix_now(&self) -> i64 {
        self.elapsed().as_secs() as i64
    }

    fn sleep(&self, duration: Duration) -> BoxSleep {
        let deadline = self.elapsed() + duration;
        Box::pin(VirtualSleep {
            inner: self.inner.clone(),
            deadline,
        })
    }
}

struct VirtualSleep {
    inner: Arc<Mutex<VirtualClockInner>>,
    deadline: Duration,
}

impl Future for VirtualSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut guard = self.inner.lock().expect("virtual clock poisoned");
        if guard.elapsed >= self.deadline {
            Poll::Ready(())
        } else {
            guard.waiters.push_back((self.deadline, cx.waker().clone()));
            Poll::Pending
        }
    }
}

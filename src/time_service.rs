//! The association does not run timers itself. It asks a [TimeService] for timers, and when a
//!  timer expires, the embedding code calls `Association::handle_timeout` with the expired
//!  timer's [TimerId] on the same logical thread that makes all other calls into the
//!  association.
//!
//! Two implementations are provided: [ManualTimeService] is a clock that only moves when told
//!  to, which makes it useful for deterministic tests and for embeddings that have their own
//!  event loop, and [TokioTimeService] which reports expired timers through a channel.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

/// Identifies the protocol timer that expired
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum TimerId {
    /// T1-init: retransmission of INIT
    InitRetransmit,
    /// T1-cookie: retransmission of COOKIE ECHO
    CookieRetransmit,
    /// delayed acknowledgement of received DATA
    DelayedSack,
    /// T3-rtx: retransmission of unacknowledged DATA
    DataRetransmit,
}

pub trait Timer: Send {
    /// Removes a pending expiry. This is safe to call if the timer already expired or was
    ///  cancelled before.
    fn cancel(&mut self);

    /// (Re)schedules the timer to expire `delay` from now, replacing any pending expiry
    fn again(&mut self, delay: Duration);

    fn is_scheduled(&self) -> bool;
}

pub trait TimeService: Send + Sync {
    /// monotonic time since some arbitrary, fixed starting point
    fn now(&self) -> Duration;

    /// Creates a timer that expires after `delay`, and then every `repeat` if that is set.
    fn create_timer(&self, delay: Duration, repeat: Option<Duration>, id: TimerId) -> Box<dyn Timer>;
}

struct ScheduledTimer {
    deadline: Duration,
    repeat: Option<Duration>,
    id: TimerId,
}

#[derive(Default)]
struct ManualTimeServiceInner {
    now: Duration,
    next_key: u64,
    scheduled: BTreeMap<u64, ScheduledTimer>,
}

/// A [TimeService] whose clock advances only through [ManualTimeService::advance] or
///  [ManualTimeService::set_now]. Clones share the same clock.
#[derive(Clone, Default)]
pub struct ManualTimeService {
    inner: Arc<Mutex<ManualTimeServiceInner>>,
}

fn lock(inner: &Mutex<ManualTimeServiceInner>) -> MutexGuard<'_, ManualTimeServiceInner> {
    // the inner state is consistent after every single operation, so a panic while holding
    //  the lock leaves nothing to repair
    inner.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ManualTimeService {
    pub fn new() -> ManualTimeService {
        Self::default()
    }

    pub fn advance(&self, delta: Duration) -> Vec<TimerId> {
        let now = lock(&self.inner).now;
        self.set_now(now + delta)
    }

    /// Moves the clock forward to `now`, returning the ids of all timers that expired on the way
    ///  in the order of their expiry. Repeating timers can show up several times.
    pub fn set_now(&self, now: Duration) -> Vec<TimerId> {
        let mut inner = lock(&self.inner);
        let mut expired = Vec::new();

        loop {
            let next = inner.scheduled.iter()
                .filter(|(_, t)| t.deadline <= now)
                .min_by_key(|(key, t)| (t.deadline, **key))
                .map(|(key, _)| *key);

            let Some(key) = next else {
                break;
            };

            let deadline = inner.scheduled[&key].deadline;
            inner.now = inner.now.max(deadline);

            let repeat = inner.scheduled[&key].repeat;
            let id = inner.scheduled[&key].id;
            match repeat {
                Some(repeat) if !repeat.is_zero() => {
                    if let Some(t) = inner.scheduled.get_mut(&key) {
                        t.deadline = deadline + repeat;
                    }
                }
                _ => {
                    inner.scheduled.remove(&key);
                }
            }

            trace!("timer {:?} expired at {:?}", id, deadline);
            expired.push(id);
        }

        inner.now = inner.now.max(now);
        expired
    }
}

impl TimeService for ManualTimeService {
    fn now(&self) -> Duration {
        lock(&self.inner).now
    }

    fn create_timer(&self, delay: Duration, repeat: Option<Duration>, id: TimerId) -> Box<dyn Timer> {
        let mut inner = lock(&self.inner);
        let key = inner.next_key;
        inner.next_key += 1;

        let deadline = inner.now + delay;
        inner.scheduled.insert(key, ScheduledTimer { deadline, repeat, id });

        Box::new(ManualTimer {
            inner: self.inner.clone(),
            key,
            repeat,
            id,
        })
    }
}

struct ManualTimer {
    inner: Arc<Mutex<ManualTimeServiceInner>>,
    key: u64,
    repeat: Option<Duration>,
    id: TimerId,
}

impl Timer for ManualTimer {
    fn cancel(&mut self) {
        lock(&self.inner).scheduled.remove(&self.key);
    }

    fn again(&mut self, delay: Duration) {
        let mut inner = lock(&self.inner);
        let deadline = inner.now + delay;
        inner.scheduled.insert(self.key, ScheduledTimer { deadline, repeat: self.repeat, id: self.id });
    }

    fn is_scheduled(&self) -> bool {
        lock(&self.inner).scheduled.contains_key(&self.key)
    }
}

impl Drop for ManualTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A [TimeService] on top of tokio's timer. Every scheduled timer is a task that sends its
///  [TimerId] to a channel on expiry. The embedding event loop receives from that channel and
///  passes the ids on to the association.
///
/// NB: A timer can expire while the event loop is busy, so a cancelled timer's id can still be
///      in the channel. The association treats expiries that do not fit its state as no-ops.
pub struct TokioTimeService {
    start: Instant,
    expired: mpsc::UnboundedSender<TimerId>,
}

impl TokioTimeService {
    /// must be called from inside a tokio runtime
    pub fn new() -> (TokioTimeService, mpsc::UnboundedReceiver<TimerId>) {
        let (send, recv) = mpsc::unbounded_channel();
        let time_service = TokioTimeService {
            start: Instant::now(),
            expired: send,
        };
        (time_service, recv)
    }
}

impl TimeService for TokioTimeService {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn create_timer(&self, delay: Duration, repeat: Option<Duration>, id: TimerId) -> Box<dyn Timer> {
        let mut timer = TokioTimer {
            id,
            repeat,
            expired: self.expired.clone(),
            handle: None,
        };
        timer.again(delay);
        Box::new(timer)
    }
}

struct TokioTimer {
    id: TimerId,
    repeat: Option<Duration>,
    expired: mpsc::UnboundedSender<TimerId>,
    handle: Option<JoinHandle<()>>,
}

impl Timer for TokioTimer {
    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    fn again(&mut self, delay: Duration) {
        self.cancel();

        let id = self.id;
        let repeat = self.repeat.filter(|r| !r.is_zero());
        let expired = self.expired.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if expired.send(id).is_err() {
                return;
            }
            if let Some(repeat) = repeat {
                let mut interval = tokio::time::interval_at(Instant::now() + repeat, repeat);
                loop {
                    interval.tick().await;
                    if expired.send(id).is_err() {
                        return;
                    }
                }
            }
        }));
    }

    fn is_scheduled(&self) -> bool {
        self.handle.as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use TimerId::*;

    #[test]
    fn test_manual_timer_expires_once() {
        let time_service = ManualTimeService::new();
        let timer = time_service.create_timer(Duration::from_millis(100), None, InitRetransmit);

        assert!(time_service.advance(Duration::from_millis(99)).is_empty());
        assert!(timer.is_scheduled());
        assert_eq!(time_service.advance(Duration::from_millis(1)), vec![InitRetransmit]);
        assert!(!timer.is_scheduled());
        assert!(time_service.advance(Duration::from_secs(10)).is_empty());
        assert_eq!(time_service.now(), Duration::from_millis(10_100));
    }

    #[test]
    fn test_manual_timer_repeats() {
        let time_service = ManualTimeService::new();
        let _timer = time_service.create_timer(Duration::from_millis(100), Some(Duration::from_millis(50)), DelayedSack);

        assert_eq!(time_service.advance(Duration::from_millis(200)), vec![DelayedSack, DelayedSack, DelayedSack]);
    }

    #[test]
    fn test_manual_timers_expire_in_deadline_order() {
        let time_service = ManualTimeService::new();
        let _a = time_service.create_timer(Duration::from_millis(300), None, DataRetransmit);
        let _b = time_service.create_timer(Duration::from_millis(100), None, DelayedSack);
        let _c = time_service.create_timer(Duration::from_millis(200), None, CookieRetransmit);

        assert_eq!(time_service.set_now(Duration::from_secs(1)), vec![DelayedSack, CookieRetransmit, DataRetransmit]);
    }

    #[rstest]
    #[case::cancel_before_expiry(true)]
    #[case::drop_before_expiry(false)]
    fn test_manual_timer_cancel(#[case] explicit_cancel: bool) {
        let time_service = ManualTimeService::new();
        let mut timer = time_service.create_timer(Duration::from_millis(100), None, InitRetransmit);

        if explicit_cancel {
            timer.cancel();
            timer.cancel();
            assert!(!timer.is_scheduled());
        }
        else {
            drop(timer);
        }
        assert!(time_service.advance(Duration::from_millis(100)).is_empty());
    }

    #[test]
    fn test_manual_timer_again() {
        let time_service = ManualTimeService::new();
        let mut timer = time_service.create_timer(Duration::from_millis(100), None, DataRetransmit);

        time_service.advance(Duration::from_millis(80));
        timer.again(Duration::from_millis(100));
        assert!(time_service.advance(Duration::from_millis(80)).is_empty());
        assert_eq!(time_service.advance(Duration::from_millis(20)), vec![DataRetransmit]);

        // rescheduling an expired timer
        timer.again(Duration::from_millis(10));
        assert!(timer.is_scheduled());
        assert_eq!(time_service.advance(Duration::from_millis(10)), vec![DataRetransmit]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_expires() {
        let (time_service, mut expired) = TokioTimeService::new();
        let timer = time_service.create_timer(Duration::from_millis(100), None, InitRetransmit);
        assert!(timer.is_scheduled());

        let before = Instant::now();
        assert_eq!(expired.recv().await, Some(InitRetransmit));
        assert_eq!(before.elapsed(), Duration::from_millis(100));
        assert_eq!(time_service.now(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_cancel() {
        let (time_service, mut expired) = TokioTimeService::new();
        let mut cancelled = time_service.create_timer(Duration::from_millis(100), None, InitRetransmit);
        let _other = time_service.create_timer(Duration::from_millis(200), None, DelayedSack);

        cancelled.cancel();
        assert!(!cancelled.is_scheduled());
        assert_eq!(expired.recv().await, Some(DelayedSack));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_again_and_repeat() {
        let (time_service, mut expired) = TokioTimeService::new();
        let mut timer = time_service.create_timer(Duration::from_millis(100), Some(Duration::from_millis(30)), DataRetransmit);

        tokio::time::sleep(Duration::from_millis(50)).await;
        timer.again(Duration::from_millis(100));

        let before = Instant::now();
        assert_eq!(expired.recv().await, Some(DataRetransmit));
        assert_eq!(before.elapsed(), Duration::from_millis(100));
        assert_eq!(expired.recv().await, Some(DataRetransmit));
        assert_eq!(before.elapsed(), Duration::from_millis(130));
    }
}

//! Notification queue shared between a backend's producers and its poll.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{EventPoll, Notification};
use crate::BackendError;

/// Handle that interrupts an [`EventPoll::wait`] from any thread.
#[derive(Clone)]
pub struct PollWaker(Arc<dyn Fn() + Send + Sync>);

impl PollWaker {
    /// Creates a waker from a wake function.
    pub fn new(wake: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(wake))
    }

    /// Wakes the poll.
    pub fn wake(&self) {
        (self.0)();
    }
}

impl fmt::Debug for PollWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollWaker").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct QueueState {
    pending: Vec<Notification>,
    woken: bool,
}

/// Queue of pending notifications for one connection.
///
/// Producers (server threads, device callbacks) push notifications; the
/// event loop waits on the queue through a [`QueuePoll`] and drains it from
/// [`Connection::dispatch`](super::Connection::dispatch).
#[derive(Default)]
pub struct NotificationQueue {
    state: Mutex<QueueState>,
    activity: Condvar,
}

impl NotificationQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a notification and wakes the poll.
    pub fn push(&self, notification: Notification) {
        self.state.lock().pending.push(notification);
        self.activity.notify_one();
    }

    /// Wakes the poll without queueing anything.
    pub fn wake(&self) {
        self.state.lock().woken = true;
        self.activity.notify_one();
    }

    /// Takes every pending notification, oldest first.
    pub fn drain(&self) -> Vec<Notification> {
        std::mem::take(&mut self.state.lock().pending)
    }

    /// Returns the number of pending notifications.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Returns `true` if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until something is pending, the queue is woken, or `timeout`
    /// elapses. Consumes the wake flag.
    pub fn wait(&self, timeout: Duration) {
        let mut state = self.state.lock();
        if state.pending.is_empty() && !state.woken {
            let _ = self.activity.wait_for(&mut state, timeout);
        }
        state.woken = false;
    }
}

impl fmt::Debug for NotificationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NotificationQueue")
            .field("pending", &state.pending.len())
            .field("woken", &state.woken)
            .finish()
    }
}

/// [`EventPoll`] that waits on a [`NotificationQueue`].
#[derive(Debug, Clone)]
pub struct QueuePoll {
    queue: Arc<NotificationQueue>,
}

impl QueuePoll {
    /// Creates a poll for the given queue.
    pub fn new(queue: Arc<NotificationQueue>) -> Self {
        Self { queue }
    }
}

impl EventPoll for QueuePoll {
    fn wait(&mut self, timeout: Duration) -> Result<(), BackendError> {
        self.queue.wait(timeout);
        Ok(())
    }

    fn waker(&self) -> PollWaker {
        let queue = Arc::clone(&self.queue);
        PollWaker::new(move || queue.wake())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_queue_drain_order() {
        let queue = NotificationQueue::new();
        queue.push(Notification::LatencyUpdate);
        queue.push(Notification::ReadReady { bytes: 4 });

        assert_eq!(queue.len(), 2);
        assert_eq!(
            queue.drain(),
            vec![
                Notification::LatencyUpdate,
                Notification::ReadReady { bytes: 4 }
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wait_returns_immediately_when_pending() {
        let queue = NotificationQueue::new();
        queue.push(Notification::LatencyUpdate);

        let start = Instant::now();
        queue.wait(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_times_out() {
        let queue = NotificationQueue::new();
        let start = Instant::now();
        queue.wait(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_waker_interrupts_wait() {
        let queue = Arc::new(NotificationQueue::new());
        let mut poll = QueuePoll::new(Arc::clone(&queue));
        let waker = poll.waker();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake();
        });

        let start = Instant::now();
        poll.wait(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}

//! Background event loop thread.
//!
//! The loop waits for backend activity without holding the monitor lock,
//! then takes the lock and dispatches every pending notification. Handlers
//! never block and never perform I/O; they only wake callers parked on the
//! monitor's condition variable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backend::{Connection, ContextState, EventPoll, Notification, PollWaker, StreamState};

use super::Shared;

/// Handle to a running event loop thread.
pub(crate) struct EventLoop {
    running: Arc<AtomicBool>,
    waker: PollWaker,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    /// Spawns the event loop for `shared`, driven by `poll`.
    pub(crate) fn spawn<C, P>(
        shared: Arc<Shared<C>>,
        poll: P,
        poll_interval: Duration,
    ) -> std::io::Result<Self>
    where
        C: Connection,
        P: EventPoll,
    {
        let running = Arc::new(AtomicBool::new(true));
        let waker = poll.waker();

        let thread = std::thread::Builder::new()
            .name("stream-monitor-loop".to_string())
            .spawn({
                let running = Arc::clone(&running);
                move || run(&shared, poll, &running, poll_interval)
            })?;

        Ok(Self {
            running,
            waker,
            thread: Some(thread),
        })
    }

    /// Stops the loop and waits for the thread to exit.
    ///
    /// No notification is dispatched once this returns.
    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.waker.wake();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("event loop thread panicked");
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<C: Connection, P: EventPoll>(
    shared: &Shared<C>,
    mut poll: P,
    running: &AtomicBool,
    poll_interval: Duration,
) {
    tracing::debug!("event loop started");

    while running.load(Ordering::Acquire) {
        if let Err(error) = poll.wait(poll_interval) {
            tracing::error!(%error, "event loop poll failed");
            break;
        }

        let mut state = shared.state.lock();
        let Some(connection) = state.connection.as_mut() else {
            continue;
        };
        for notification in connection.dispatch() {
            shared.on_notification(notification);
        }
    }

    // Blocked callers must not wait for notifications that will never come
    shared.state.lock().loop_alive = false;
    shared.ready.notify_all();

    tracing::debug!("event loop stopped");
}

impl<C: Connection> Shared<C> {
    /// Dispatches one notification. Called with the monitor lock held.
    fn on_notification(&self, notification: Notification) {
        tracing::trace!(?notification, "dispatching notification");

        match notification {
            Notification::ContextState(state) => self.on_context_state(state),
            Notification::StreamState(state) => self.on_stream_state(state),
            Notification::WriteReady { .. } => self.on_write_ready(),
            Notification::ReadReady { .. } => self.on_read_ready(),
            Notification::LatencyUpdate => self.on_latency_update(),
        }
    }

    fn on_context_state(&self, state: ContextState) {
        match state {
            ContextState::Ready | ContextState::Failed | ContextState::Terminated => {
                self.ready.notify_all();
            }
            ContextState::Unconnected
            | ContextState::Connecting
            | ContextState::Authorizing
            | ContextState::SettingName => {}
        }
    }

    fn on_stream_state(&self, state: StreamState) {
        match state {
            StreamState::Ready | StreamState::Failed | StreamState::Terminated => {
                self.ready.notify_all();
            }
            StreamState::Unconnected | StreamState::Creating => {}
        }
    }

    fn on_write_ready(&self) {
        self.ready.notify_all();
    }

    fn on_read_ready(&self) {
        self.ready.notify_all();
    }

    // Capacity and availability can change along with timing updates
    fn on_latency_update(&self) {
        self.ready.notify_all();
    }
}

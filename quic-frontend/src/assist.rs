use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Weak,
    },
    thread::{self, JoinHandle},
};

use tracing::{debug, trace};

use crate::{connection::ConnState, mutex::Mutex, reactor::tick_reactor};

/// Background thread driving a connection's reactor whenever its deadline expires
///
/// Lets timers fire while the application is not calling into the connection. The thread only
/// holds a weak reference, so it never keeps the connection alive on its own. It sleeps until
/// the reactor deadline, a forced wake, or a stop request.
pub(crate) struct ThreadAssist {
    conn: Weak<Mutex<ConnState>>,
    stop: Arc<AtomicBool>,
    wake: Arc<Condvar>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadAssist {
    pub(crate) fn start(conn: Weak<Mutex<ConnState>>) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        // Separate from the connection's progress condvar, which every tick signals
        let wake = Arc::new(Condvar::new());
        let thread = thread::Builder::new().name("quic-assist".into()).spawn({
            let conn = conn.clone();
            let stop = stop.clone();
            let wake = wake.clone();
            move || run(conn, stop, wake)
        })?;
        debug!("assist thread started");
        Ok(Self {
            conn,
            stop,
            wake,
            thread: Some(thread),
        })
    }

    /// Make the thread recompute its deadline
    pub(crate) fn notify(&self) {
        self.wake.notify_all();
    }

    /// Ask the thread to exit and wait for it
    ///
    /// Must not be called with the connection lock held.
    pub(crate) fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        match self.conn.upgrade() {
            Some(shared) => {
                // Set under the lock so the thread cannot miss it between its check and its wait
                let _guard = shared.lock("assist stop");
                self.stop.store(true, Ordering::Release);
                self.wake.notify_all();
            }
            None => self.stop.store(true, Ordering::Release),
        }
        if thread.join().is_err() {
            debug!("assist thread panicked");
        }
        debug!("assist thread stopped");
    }
}

impl Drop for ThreadAssist {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(conn: Weak<Mutex<ConnState>>, stop: Arc<AtomicBool>, wake: Arc<Condvar>) {
    loop {
        let Some(shared) = conn.upgrade() else {
            break;
        };
        let mut state = shared.lock("assist");
        if stop.load(Ordering::Acquire) || state.freed || state.channel().is_terminated() {
            break;
        }

        tick_reactor(&mut state);

        let deadline = state.channel().reactor().tick_deadline();
        let timeout = deadline.map(|d| d.saturating_duration_since(state.now()));
        trace!(?timeout, "assist thread waiting");
        state.wait_timeout(&wake, timeout);
    }
    trace!("assist thread exiting");
}

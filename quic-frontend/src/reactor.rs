use std::{io, time::Duration};

use tracing::{debug, trace};

use crate::{
    connection::{ConnGuard, ConnState},
    endpoint::PollDescriptor,
    error::Error,
};

/// Options for [`block_until_pred`]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BlockFlags {
    /// Evaluate the predicate before the first tick
    pub(crate) skip_first_tick: bool,
}

/// Tick the connection's reactor and wake anything waiting on its progress
pub(crate) fn tick_reactor(state: &mut ConnState) {
    if let Err(e) = state.channel().reactor().tick() {
        debug!(error = %e, "reactor tick failed");
    }
    state.notify_progress();
}

/// Repeatedly tick the reactor until `pred` holds
///
/// Each round ticks, evaluates `pred`, and if it is not yet satisfied releases the lock and
/// waits for network readiness or the reactor's next deadline. Errors returned by `pred` end the
/// wait and are passed through unchanged. This is the only place a dispatched operation
/// suspends.
///
/// If the connection is freed during a wait, this fails without touching the channel again;
/// callers must check `freed` before using the channel after an error.
pub(crate) fn block_until_pred<F>(
    conn: &mut ConnGuard<'_>,
    flags: BlockFlags,
    mut pred: F,
) -> Result<(), Error>
where
    F: FnMut(&mut ConnState) -> Result<bool, Error>,
{
    let mut skip_tick = flags.skip_first_tick;
    loop {
        if !skip_tick {
            tick_reactor(conn);
        }
        skip_tick = false;

        if pred(&mut **conn)? {
            return Ok(());
        }

        wait_for_progress(conn)?;

        // The connection may have been freed while the lock was released
        if conn.freed {
            return Err(Error::Internal("connection has been freed"));
        }
    }
}

fn wait_for_progress(conn: &mut ConnGuard<'_>) -> Result<(), Error> {
    let rd = conn
        .net_rbio
        .as_ref()
        .map_or(PollDescriptor::None, |e| e.poll_descriptor());
    let wd = conn
        .net_wbio
        .as_ref()
        .map_or(PollDescriptor::None, |e| e.poll_descriptor());
    let reactor = conn.channel().reactor();
    let rd = if reactor.net_read_desired() { rd } else { PollDescriptor::None };
    let wd = if reactor.net_write_desired() { wd } else { PollDescriptor::None };
    let deadline = reactor.tick_deadline();
    let timeout = deadline.map(|d| d.saturating_duration_since(conn.now()));

    if rd.is_pollable() || wd.is_pollable() {
        trace!(?timeout, "polling network endpoints");
        return conn.unlocked(|| poll_descriptors(rd, wd, timeout)).map_err(|e| {
            debug!(error = %e, "poll failed");
            Error::Internal("poll failed")
        });
    }

    if timeout.is_some() || conn.thread_assisted {
        // Woken by the assist thread or any other thread ticking the reactor
        trace!(?timeout, "waiting for connection progress");
        let wake = conn.wake.clone();
        conn.wait_timeout(&wake, timeout);
        return Ok(());
    }

    Err(Error::Internal("nothing to wait for"))
}

#[cfg(unix)]
fn poll_descriptors(
    rd: PollDescriptor,
    wd: PollDescriptor,
    timeout: Option<Duration>,
) -> io::Result<()> {
    let mut fds = Vec::with_capacity(2);
    if let PollDescriptor::Socket(fd) = rd {
        fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
    }
    if let PollDescriptor::Socket(fd) = wd {
        match fds.iter_mut().find(|p| p.fd == fd) {
            Some(p) => p.events |= libc::POLLOUT,
            None => fds.push(libc::pollfd {
                fd,
                events: libc::POLLOUT,
                revents: 0,
            }),
        }
    }

    let timeout_ms = match timeout {
        // Round up so that a short timeout does not become a busy loop
        Some(t) => ((t.as_nanos() + 999_999) / 1_000_000).min(i32::MAX as u128) as libc::c_int,
        None => -1,
    };

    loop {
        // SAFETY: `fds` is a live, correctly sized array of initialized pollfd structures
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn poll_descriptors(
    _rd: PollDescriptor,
    _wd: PollDescriptor,
    timeout: Option<Duration>,
) -> io::Result<()> {
    // No portable readiness API; wait out the deadline in short slices instead
    let slice = Duration::from_millis(10);
    std::thread::sleep(timeout.map_or(slice, |t| t.min(slice)));
    Ok(())
}

use tracing::trace;

use crate::{
    config::Mode,
    connection::{do_handshake, ConnGuard, ConnState},
    dispatch::Ctx,
    error::Error,
    reactor::{block_until_pred, tick_reactor, BlockFlags},
    stream::{AonState, BufferIdentity, XsoId},
    stream_map::{StreamError, StreamId},
};

/// Write `buf` to the addressed stream with the strategy its modes select
pub(crate) fn write(
    ctx: &mut Ctx<'_>,
    buf: &[u8],
    identity: BufferIdentity,
) -> Result<usize, Error> {
    let id = ctx.expect_stream()?;
    let conn = &mut ctx.conn;

    if conn.channel().is_term_any() {
        return Err(conn.raise(Error::ProtocolIsShutdown));
    }

    // Writes are refused until the handshake has completed
    do_handshake(conn)?;

    let xso = conn.xsos[&id];
    let has_sstream = conn
        .channel()
        .stream_map()
        .get(xso.stream)
        .map_or(false, |r| r.send_buffer().is_some());
    if !has_sstream {
        return Err(conn.raise(Error::Internal("stream has no sending part")));
    }

    if conn.xso_blocking_mode(&xso) {
        // An all-or-nothing write begun in non-blocking mode continues where it left off
        let pos = aon_resume_pos(conn, id, buf, identity)?;
        set_aon(conn, id, AonState::Inactive);
        write_blocking(conn, xso.stream, buf, pos)
    } else if xso.mode.contains(Mode::ENABLE_PARTIAL_WRITE) {
        write_partial(conn, xso.stream, buf)
    } else {
        write_aon(conn, id, buf, identity)
    }
}

/// Append as much of `data` as the send buffer has room for
fn append(state: &mut ConnState, stream: StreamId, data: &[u8]) -> Result<usize, StreamError> {
    state
        .channel()
        .stream_map()
        .get_mut(stream)
        .and_then(|r| r.sstream.as_mut())
        .ok_or(StreamError::Finished)?
        .append(data)
}

/// Let the stream map reschedule the stream after new data, then optionally try to send it
pub(crate) fn post_write(state: &mut ConnState, stream: StreamId, did_append: bool, do_tick: bool) {
    if did_append {
        state.channel().stream_map().update_state(stream);
    }
    if do_tick {
        tick_reactor(state);
    }
}

/// Blocking write of `buf[pos..]`, reporting the whole of `buf` once done
fn write_blocking(
    conn: &mut ConnGuard<'_>,
    stream: StreamId,
    buf: &[u8],
    pos: usize,
) -> Result<usize, Error> {
    let remaining = &buf[pos..];
    let written = match append(conn, stream, remaining) {
        Ok(n) => n,
        Err(e) => return Err(conn.raise_with(Error::Internal("append failed"), e)),
    };
    post_write(conn, stream, written > 0, true);
    if written == remaining.len() {
        return Ok(buf.len());
    }

    // The send buffer is full; wait for transmission to free up space. The reactor was just
    // ticked, so the first round only re-checks.
    trace!(%stream, written, len = buf.len(), "blocking for send buffer space");
    let mut rest = &remaining[written..];
    let flags = BlockFlags {
        skip_first_tick: true,
    };
    let result = block_until_pred(conn, flags, |state| {
        if !state.channel().is_active() {
            return Err(Error::ProtocolIsShutdown);
        }
        let n = append(state, stream, rest).map_err(|_| Error::Internal("append failed"))?;
        post_write(state, stream, n > 0, false);
        rest = &rest[n..];
        Ok(rest.is_empty())
    });

    match result {
        Ok(()) => Ok(buf.len()),
        Err(e) if conn.freed => Err(conn.raise(e)),
        Err(_) if !conn.channel().is_active() => Err(conn.raise(Error::ProtocolIsShutdown)),
        Err(e) => Err(conn.raise_with(Error::Internal("write wait failed"), e)),
    }
}

fn write_partial(conn: &mut ConnGuard<'_>, stream: StreamId, buf: &[u8]) -> Result<usize, Error> {
    let written = match append(conn, stream, buf) {
        Ok(n) => n,
        Err(e) => return Err(conn.raise_with(Error::Internal("append failed"), e)),
    };
    post_write(conn, stream, written > 0, true);
    Ok(written)
}

/// All-or-nothing write
///
/// A write that cannot be buffered in full reports [`Error::WantWrite`] and nothing written.
/// The caller retries with the same buffer and length until the whole buffer has been taken,
/// at which point the full length is reported. Data buffered by earlier attempts is not
/// appended again.
fn write_aon(
    conn: &mut ConnGuard<'_>,
    id: XsoId,
    buf: &[u8],
    identity: BufferIdentity,
) -> Result<usize, Error> {
    let xso = conn.xsos[&id];
    let pos = aon_resume_pos(conn, id, buf, identity)?;

    let remaining = &buf[pos..];
    let written = match append(conn, xso.stream, remaining) {
        Ok(n) => n,
        Err(e) => return Err(conn.raise_with(Error::Internal("append failed"), e)),
    };
    post_write(conn, xso.stream, written > 0, true);

    if written == remaining.len() {
        if xso.aon != AonState::Inactive {
            trace!(stream = %xso.stream, len = buf.len(), "all-or-nothing write complete");
            set_aon(conn, id, AonState::Inactive);
        }
        return Ok(buf.len());
    }

    match xso.aon {
        AonState::InProgress { buf, len, pos } => {
            let aon = AonState::InProgress {
                buf,
                len,
                pos: pos + written,
            };
            set_aon(conn, id, aon);
        }
        // Nothing to resume if nothing was taken
        AonState::Inactive if written > 0 => {
            trace!(stream = %xso.stream, written, len = buf.len(), "all-or-nothing write begun");
            let aon = AonState::InProgress {
                buf: identity,
                len: buf.len(),
                pos: written,
            };
            set_aon(conn, id, aon);
        }
        AonState::Inactive => {}
    }

    // Partial progress stays hidden until the whole buffer has been taken
    Err(conn.raise(Error::WantWrite))
}

/// Where a retried all-or-nothing write resumes, or 0 if none is in progress
///
/// A retry must pass the same length, and the same buffer unless
/// [`Mode::ACCEPT_MOVING_WRITE_BUFFER`] is set.
fn aon_resume_pos(
    conn: &mut ConnGuard<'_>,
    id: XsoId,
    buf: &[u8],
    identity: BufferIdentity,
) -> Result<usize, Error> {
    let xso = conn.xsos[&id];
    match xso.aon {
        AonState::InProgress { buf: orig, len, pos } => {
            let accept_moving = xso.mode.contains(Mode::ACCEPT_MOVING_WRITE_BUFFER);
            if (!accept_moving && orig != identity) || buf.len() != len {
                return Err(conn.raise(Error::BadWriteRetry));
            }
            Ok(pos)
        }
        AonState::Inactive => Ok(0),
    }
}

fn set_aon(state: &mut ConnState, id: XsoId, aon: AonState) {
    if let Some(xso) = state.xsos.get_mut(&id) {
        xso.aon = aon;
    }
}

/// Finish the sending part of the addressed stream
///
/// Does nothing if there is no sending part, the connection is no longer active, or the stream
/// was already finished.
pub(crate) fn conclude(ctx: &mut Ctx<'_>) -> Result<(), Error> {
    let id = ctx.expect_stream()?;
    let conn = &mut ctx.conn;
    let stream = conn.xsos[&id].stream;
    let active = conn.channel().is_active();

    let Some(sstream) = conn
        .channel()
        .stream_map()
        .get_mut(stream)
        .and_then(|r| r.sstream.as_mut())
    else {
        return Ok(());
    };
    if !active || sstream.final_size().is_some() {
        return Ok(());
    }

    sstream.fin();
    trace!(%stream, "concluded");
    post_write(conn, stream, true, true);
    Ok(())
}

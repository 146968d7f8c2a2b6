use tracing::{debug, trace};

use crate::{
    connection::{do_handshake, ConnState},
    dispatch::Ctx,
    error::Error,
    reactor::{block_until_pred, tick_reactor, BlockFlags},
    stream_map::StreamId,
};

/// Single attempt at reading from `stream`
///
/// Returns how many bytes were copied out and whether this read consumed the end of the
/// stream. Consuming reads retire the bytes with the flow controller; once the end of the
/// stream has been consumed every later attempt fails with [`Error::ZeroReturn`].
///
/// Errors are returned without being raised.
fn read_actual(
    state: &mut ConnState,
    stream: StreamId,
    buf: &mut [u8],
    peek: bool,
) -> Result<(usize, bool), Error> {
    let smoothed_rtt = state.channel().rtt_info().smoothed_rtt;
    let now = state.now();
    let map = state.channel().stream_map();
    let record = map
        .get_mut(stream)
        .ok_or(Error::Internal("stream record missing"))?;

    if record.recv_fin_retired {
        return Err(Error::ZeroReturn);
    }
    let rstream = record
        .rstream
        .as_mut()
        .ok_or(Error::Internal("stream has no receiving part"))?;

    if peek {
        let (n, _) = rstream.peek(buf);
        return Ok((n, false));
    }

    let (n, fin) = rstream.read(buf);
    if n > 0 {
        // May make the flow controller want to extend credit to the peer
        if let Err(e) = record.rxfc.on_retire(n as u64, smoothed_rtt, now) {
            debug!(%stream, error = %e, "retiring received data failed");
            return Err(Error::Internal("flow control retirement failed"));
        }
    }
    if fin {
        trace!(%stream, "end of stream consumed");
        record.recv_fin_retired = true;
    }
    if n > 0 {
        map.update_state(stream);
    }
    Ok((n, fin))
}

/// Read or peek from the addressed stream
pub(crate) fn read(ctx: &mut Ctx<'_>, buf: &mut [u8], peek: bool) -> Result<usize, Error> {
    let id = ctx.expect_stream()?;
    let conn = &mut ctx.conn;

    if conn.channel().is_term_any() {
        return Err(conn.raise(Error::ProtocolIsShutdown));
    }

    // Reads are refused until the handshake has completed
    do_handshake(conn)?;

    let xso = conn.xsos[&id];
    let (n, eof) = match read_actual(conn, xso.stream, buf, peek) {
        Ok(r) => r,
        Err(e) => return Err(conn.raise(e)),
    };

    if n > 0 {
        // Keep the rest of the connection moving
        tick_reactor(conn);
        return Ok(n);
    }

    // The end of the stream surfaces once as an empty read; the next read reports it
    if eof || peek {
        return Ok(0);
    }

    if !conn.xso_blocking_mode(&xso) {
        return Err(conn.raise(Error::WantRead));
    }

    let mut n_read = 0;
    let result = block_until_pred(conn, BlockFlags::default(), |state| {
        if !state.channel().is_active() {
            return Err(Error::ProtocolIsShutdown);
        }
        let (n, eof) = read_actual(state, xso.stream, &mut *buf, false)?;
        n_read = n;
        Ok(n > 0 || eof)
    });

    match result {
        Ok(()) => Ok(n_read),
        Err(e) => Err(conn.raise(e)),
    }
}

/// Bytes of the addressed stream that can be read without blocking
pub(crate) fn pending(ctx: &mut Ctx<'_>) -> Result<usize, Error> {
    let id = ctx.expect_stream()?;
    let stream = ctx.conn.xsos[&id].stream;
    Ok(ctx
        .conn
        .channel()
        .stream_map()
        .get(stream)
        .and_then(|r| r.recv_buffer())
        .map_or(0, |r| r.available().0))
}

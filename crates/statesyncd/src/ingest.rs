//! TCP ingest: newline-delimited JSON messages published to the sync subject.
//!
//! Lines are forwarded as raw bytes; validation happens in the dispatcher,
//! so a malformed line (invalid UTF-8 included) is dropped and reported
//! there like any other message. Lines longer than `max_line` are discarded
//! without being buffered whole.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use statesync_bus::MessageSink;

/// Accept connections until shutdown.
pub async fn serve(
    listener: TcpListener,
    sink: Arc<dyn MessageSink>,
    subject: String,
    max_line: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, %subject, max_line, "ingest listener started"),
        Err(e) => warn!(error = %e, "ingest listener address unavailable"),
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        sink.clone(),
                        subject.clone(),
                        max_line,
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "failed to accept ingest connection"),
            },
            _ = shutdown.changed() => {
                info!("ingest listener shutting down");
                break;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    sink: Arc<dyn MessageSink>,
    subject: String,
    max_line: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%peer, "ingest connection opened");
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let mut published = 0u64;

    loop {
        line.clear();
        let read = tokio::select! {
            read = read_line(&mut reader, &mut line, max_line) => read,
            _ = shutdown.changed() => break,
        };
        match read {
            Ok(Line::Complete) => {
                let payload = line.trim_ascii();
                if payload.is_empty() {
                    continue;
                }
                match sink.publish(&subject, payload.to_vec()).await {
                    Ok(()) => published += 1,
                    Err(e) => warn!(%peer, error = %e, "ingest publish failed"),
                }
            }
            Ok(Line::TooLong) => warn!(%peer, max_line, "ingest line too long, discarded"),
            Ok(Line::Eof) => break,
            Err(e) => {
                warn!(%peer, error = %e, "ingest connection failed");
                break;
            }
        }
    }
    debug!(%peer, published, "ingest connection closed");
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Complete,
    TooLong,
    Eof,
}

/// Read one line into `buf`, holding at most `max + 1` bytes of it.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let limit = max as u64 + 1;
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(Line::Eof);
    }
    if buf.last() == Some(&b'\n') || buf.len() <= max {
        return Ok(Line::Complete);
    }

    // Skip the rest of the oversized line.
    loop {
        buf.clear();
        let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
        if n == 0 || buf.last() == Some(&b'\n') {
            buf.clear();
            return Ok(Line::TooLong);
        }
    }
}

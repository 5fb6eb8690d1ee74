//! Line reader task.
//!
//! One reader runs per open link and is the only consumer of the read half.
//! It splits incoming bytes on `\n` and forwards each complete line to the
//! session runtime. It never touches session state.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use super::LinkEvent;

/// Initial capacity of the receive buffer
const READ_BUFFER_SIZE: usize = 1024;

/// Longest line accepted before the buffer is discarded as noise
pub const MAX_LINE_LENGTH: usize = 4096;

/// Read newline-terminated lines until the link is closed or faults
///
/// # Arguments
///
/// * `reader` - Read half of the link
/// * `link_id` - Id stamped on every emitted event
/// * `open` - Flips to `false` (or is dropped) when the link is closed
/// * `events` - Channel into the session runtime
///
/// Bytes still buffered when the link closes are discarded. EOF and read
/// errors are reported once as [`LinkEvent::Closed`]; a user-initiated close
/// is not reported.
pub async fn read_lines<R>(
    mut reader: R,
    link_id: u64,
    mut open: watch::Receiver<bool>,
    events: mpsc::Sender<LinkEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        if !*open.borrow() {
            break;
        }

        tokio::select! {
            biased;

            changed = open.changed() => {
                if changed.is_err() || !*open.borrow() {
                    break;
                }
            }

            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    let _ = events
                        .send(LinkEvent::Closed { link_id, reason: "end of stream".to_string() })
                        .await;
                    return;
                }
                Ok(_) => {
                    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        let raw = buf.split_to(pos + 1);
                        let line = String::from_utf8_lossy(&raw).trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        trace!("link {} rx: {}", link_id, line);
                        if events.send(LinkEvent::Line { link_id, line }).await.is_err() {
                            debug!("Session runtime gone, stopping reader for link {}", link_id);
                            return;
                        }
                    }

                    if buf.len() > MAX_LINE_LENGTH {
                        warn!("Discarding {} bytes without a line terminator", buf.len());
                        buf.clear();
                    }
                }
                Err(e) => {
                    let _ = events
                        .send(LinkEvent::Closed { link_id, reason: e.to_string() })
                        .await;
                    return;
                }
            }
        }
    }

    debug!("Reader for link {} closed, discarding {} buffered bytes", link_id, buf.len());
}

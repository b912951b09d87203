use std::io;
use std::sync::atomic::Ordering;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::state::{ClientParams, Test};

/// Stream `buffer_size`-byte frames for as long as the peer keeps the
/// connection. Direction follows the negotiated `reverse` flag: the server
/// writes in reverse mode and drains otherwise. Each full frame adds
/// `buffer_size` to the test's byte counter.
pub(crate) async fn serve_bandwidth(
    test: &Test,
    params: &ClientParams,
    stream: &mut TcpStream,
) -> io::Result<()> {
    let size = params.buffer_size as usize;
    let mut buffer = vec![0u8; size];
    // Deterministic ramp so reverse-mode payloads are recognisable on the wire
    for (i, byte) in buffer.iter_mut().enumerate() {
        *byte = (i & 0xFF) as u8;
    }

    loop {
        if params.reverse {
            tokio::select! {
                _ = test.done.cancelled() => return Ok(()),
                res = stream.write_all(&buffer) => res?,
            }
        } else {
            tokio::select! {
                _ = test.done.cancelled() => return Ok(()),
                res = stream.read_exact(&mut buffer) => {
                    res?;
                }
            }
        }

        test.result.bw.fetch_add(size as u64, Ordering::Relaxed);
        test.touch();
    }
}

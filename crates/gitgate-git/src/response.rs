//! Framing of the outgoing response body.
//!
//! Pack binaries end their output with a flush packet. The session may need
//! to place more packets after that output, so a flush arriving as its own
//! chunk is dropped and [`ResponseStream::finalize`] writes the one terminator
//! the client sees.

use crate::pktline::{is_flush_chunk, pkt_line, Band, PktLine, FLUSH_PKT};
use crate::{GitError, Result};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

/// Read size used when relaying subprocess output.
const RELAY_CHUNK: usize = 64 * 1024;

struct Framing<W> {
    sink: W,
    finalized: bool,
}

/// Shared handle to the response body sink of one session.
///
/// Clones refer to the same sink. Writes are serialized, so chunks reach the
/// sink in the order they were relayed.
pub struct ResponseStream<W> {
    inner: Arc<Mutex<Framing<W>>>,
}

impl<W> Clone for ResponseStream<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: AsyncWrite + Unpin> ResponseStream<W> {
    /// Wraps the response body sink.
    pub fn new(sink: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Framing {
                sink,
                finalized: false,
            })),
        }
    }

    /// Returns true once the terminating flush has been written.
    pub async fn is_finalized(&self) -> bool {
        self.inner.lock().await.finalized
    }

    /// Forwards `chunk` to the sink unless it is a lone flush packet.
    ///
    /// Fails with [`GitError::Finalized`] after [`finalize`](Self::finalize).
    pub async fn relay(&self, chunk: &[u8]) -> Result<()> {
        let mut framing = self.inner.lock().await;
        if framing.finalized {
            return Err(GitError::Finalized);
        }
        if is_flush_chunk(chunk) {
            debug!("dropping upstream flush packet");
            return Ok(());
        }
        framing.sink.write_all(chunk).await?;
        Ok(())
    }

    /// Relays everything `reader` produces, one read at a time.
    ///
    /// Returns the number of bytes read.
    pub async fn pipe<R: AsyncRead + Unpin>(&self, mut reader: R) -> Result<u64> {
        let mut buf = vec![0u8; RELAY_CHUNK];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            total += n as u64;
            self.relay(&buf[..n]).await?;
        }
    }

    /// Writes `message` as a progress line on sideband 2.
    ///
    /// Does nothing and returns false once the stream is finalized.
    pub async fn progress(&self, message: &str) -> Result<bool> {
        self.sideband_line(Band::Progress, message).await
    }

    /// Writes `message` as a fatal error line on sideband 3.
    ///
    /// Clients print it and abort. Does nothing and returns false once the
    /// stream is finalized.
    pub async fn fatal(&self, message: &str) -> Result<bool> {
        self.sideband_line(Band::Error, message).await
    }

    async fn sideband_line(&self, band: Band, message: &str) -> Result<bool> {
        let mut framing = self.inner.lock().await;
        if framing.finalized {
            return Ok(false);
        }

        let mut line = message.as_bytes().to_vec();
        line.push(b'\n');
        framing
            .sink
            .write_all(&PktLine::sideband(band, &line).encode())
            .await?;
        Ok(true)
    }

    /// Writes the terminating flush packet and closes the sink.
    ///
    /// Only the first call writes; later calls return false.
    pub async fn finalize(&self) -> Result<bool> {
        let mut framing = self.inner.lock().await;
        if framing.finalized {
            return Ok(false);
        }
        framing.finalized = true;

        framing.sink.write_all(FLUSH_PKT).await?;
        framing.sink.shutdown().await?;
        debug!("response finalized");
        Ok(true)
    }
}

/// Builds the report-status rejection carried on sideband 1.
///
/// The report lists `unpack <message>`, then `ng <ref> <message>` when a ref
/// is known, then a flush. The whole report is the payload of one sideband
/// packet.
///
/// No flush follows that packet. [`ResponseStream::finalize`] writes the one
/// terminator, and appending another here would put two `0000` on the wire.
pub fn rejection_report(reference: Option<&str>, message: &str) -> Vec<u8> {
    let mut report = pkt_line(format!("unpack {}\n", message));
    if let Some(reference) = reference {
        report.extend(pkt_line(format!("ng {} {}\n", reference, message)));
    }
    report.extend_from_slice(FLUSH_PKT);

    PktLine::sideband(Band::Data, &report).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktline::PktLineReader;
    use proptest::prelude::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::duplex;

    async fn collect(mut reader: tokio::io::DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_relay_drops_lone_flush() {
        let (writer, reader) = duplex(1024);
        let stream = ResponseStream::new(writer);

        stream.relay(b"0008NAK\n").await.unwrap();
        stream.relay(b"0000").await.unwrap();
        stream.relay(b"0009done\n").await.unwrap();
        stream.finalize().await.unwrap();

        assert_eq!(collect(reader).await, b"0008NAK\n0009done\n0000");
    }

    #[tokio::test]
    async fn test_relay_keeps_flush_inside_larger_chunk() {
        let (writer, reader) = duplex(1024);
        let stream = ResponseStream::new(writer);

        stream.relay(b"0008NAK\n0000").await.unwrap();
        stream.finalize().await.unwrap();

        assert_eq!(collect(reader).await, b"0008NAK\n00000000");
    }

    #[tokio::test]
    async fn test_finalize_once() {
        let (writer, reader) = duplex(1024);
        let stream = ResponseStream::new(writer);

        assert!(!stream.is_finalized().await);
        assert!(stream.finalize().await.unwrap());
        assert!(!stream.finalize().await.unwrap());
        assert!(stream.is_finalized().await);

        assert_eq!(collect(reader).await, b"0000");
    }

    #[tokio::test]
    async fn test_relay_after_finalize_fails_closed() {
        let (writer, reader) = duplex(1024);
        let stream = ResponseStream::new(writer);
        stream.finalize().await.unwrap();

        assert!(matches!(
            stream.relay(b"0008NAK\n").await,
            Err(GitError::Finalized)
        ));
        assert_eq!(collect(reader).await, b"0000");
    }

    #[tokio::test]
    async fn test_progress_is_sideband_two() {
        let (writer, reader) = duplex(1024);
        let stream = ResponseStream::new(writer);

        assert!(stream.progress("resolving deltas").await.unwrap());
        stream.finalize().await.unwrap();
        assert!(!stream.progress("too late").await.unwrap());

        let out = collect(reader).await;
        let packets = PktLineReader::new(Cursor::new(out)).read_all().unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(
            packets[0].band(),
            Some((2, b"resolving deltas\n".as_slice()))
        );
        assert!(packets[1].is_flush());
    }

    #[tokio::test]
    async fn test_fatal_is_sideband_three() {
        let (writer, reader) = duplex(1024);
        let stream = ResponseStream::new(writer);

        assert!(stream.fatal("cannot run upload-pack").await.unwrap());
        stream.finalize().await.unwrap();
        assert!(!stream.fatal("too late").await.unwrap());

        let mut expected = pkt_line(b"\x03cannot run upload-pack\n");
        expected.extend_from_slice(FLUSH_PKT);
        assert_eq!(collect(reader).await, expected);
    }

    #[tokio::test]
    async fn test_pipe_honors_backpressure() {
        const SOURCE_CAPACITY: usize = 4096;
        const SINK_CAPACITY: usize = 4096;

        let data: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
        let (mut producer, source) = duplex(SOURCE_CAPACITY);
        let (sink, mut client) = duplex(SINK_CAPACITY);
        let stream = ResponseStream::new(sink);
        let produced = Arc::new(AtomicUsize::new(0));

        let writer = {
            let data = data.clone();
            let produced = Arc::clone(&produced);
            tokio::spawn(async move {
                for chunk in data.chunks(4096) {
                    producer.write_all(chunk).await.unwrap();
                    produced.fetch_add(chunk.len(), Ordering::SeqCst);
                }
            })
        };
        let relay = {
            let stream = stream.clone();
            tokio::spawn(async move {
                let n = stream.pipe(source).await.unwrap();
                stream.finalize().await.unwrap();
                n
            })
        };

        // A slow client: the relay may run ahead of it by at most what the
        // two pipes and one relay buffer hold.
        let mut received = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = client.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            let ahead = produced
                .load(Ordering::SeqCst)
                .saturating_sub(received.len());
            assert!(
                ahead <= SOURCE_CAPACITY + RELAY_CHUNK + SINK_CAPACITY,
                "{ahead} bytes buffered"
            );
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        writer.await.unwrap();
        assert_eq!(relay.await.unwrap(), data.len() as u64);
        let mut expected = data;
        expected.extend_from_slice(FLUSH_PKT);
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_pipe_relays_reader() {
        let (writer, reader) = duplex(1024);
        let stream = ResponseStream::new(writer);

        let n = stream
            .pipe(Cursor::new(b"0008NAK\n".to_vec()))
            .await
            .unwrap();
        stream.finalize().await.unwrap();

        assert_eq!(n, 8);
        assert_eq!(collect(reader).await, b"0008NAK\n0000");
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let (writer, reader) = duplex(1024);
        let stream = ResponseStream::new(writer);
        let other = stream.clone();

        other.finalize().await.unwrap();
        assert!(stream.is_finalized().await);
        drop(stream);
        drop(other);
        assert_eq!(collect(reader).await, b"0000");
    }

    #[test]
    fn test_rejection_report_bytes() {
        let report = rejection_report(Some("refs/heads/main"), "pre-receive hook declined");

        let mut inner = pkt_line("unpack pre-receive hook declined\n");
        inner.extend(pkt_line("ng refs/heads/main pre-receive hook declined\n"));
        inner.extend_from_slice(b"0000");
        let mut payload = vec![1u8];
        payload.extend(inner);

        assert_eq!(report, pkt_line(payload));
    }

    #[test]
    fn test_rejection_report_without_ref() {
        let report = rejection_report(None, "denied");
        let mut payload = vec![1u8];
        payload.extend(pkt_line("unpack denied\n"));
        payload.extend_from_slice(b"0000");
        assert_eq!(report, pkt_line(payload));
    }

    proptest! {
        /// Property: lone flushes are never forwarded and exactly one terminator follows.
        #[test]
        fn prop_single_terminator(chunks in prop::collection::vec(
            prop_oneof![
                Just(b"0000".to_vec()),
                "[a-z]{1,12}".prop_map(|s| pkt_line(s)),
            ],
            0..20,
        )) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let out = rt.block_on(async {
                let (writer, reader) = duplex(64 * 1024);
                let stream = ResponseStream::new(writer);
                for chunk in &chunks {
                    stream.relay(chunk).await.unwrap();
                }
                stream.finalize().await.unwrap();
                drop(stream);
                collect(reader).await
            });

            let expected: Vec<u8> = chunks
                .iter()
                .filter(|c| c.as_slice() != b"0000")
                .flatten()
                .copied()
                .chain(b"0000".iter().copied())
                .collect();
            prop_assert_eq!(out, expected);
        }
    }
}

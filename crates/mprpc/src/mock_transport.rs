//! Scripted peers for testing.
//!
//! These are used internally by the test suite and are not part of the public API.

use std::time::Duration;

use mpwire::Envelope;
use mpwire::StreamDecoder;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::DuplexStream;

/// The far end of an in-memory pipe, driven by hand from a test.
///
/// Envelopes written here arrive at whatever owns the other end, and
/// envelopes that end writes can be read back one at a time.
pub struct ScriptedPeer {
    stream: DuplexStream,
    decoder: StreamDecoder,
}

impl ScriptedPeer {
    /// Creates a connected pair: the stream to hand to a session, and its peer.
    pub fn pair() -> (DuplexStream, Self) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let peer = Self {
            stream: remote,
            decoder: StreamDecoder::new(),
        };
        (local, peer)
    }

    pub async fn send(&mut self, envelope: impl Into<Envelope>) {
        let bytes = mpwire::encode(&envelope.into()).expect("Failed to encode envelope");
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("Failed to write to pipe");
    }

    /// Reads the next envelope, failing the test after a few seconds.
    pub async fn recv(&mut self) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), self.recv_inner())
            .await
            .expect("Timed out waiting for an envelope")
    }

    async fn recv_inner(&mut self) -> Envelope {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(envelope) = self.decoder.try_next().expect("Peer sent invalid bytes") {
                return envelope;
            }
            let n = self.stream.read(&mut buf).await.expect("Failed to read from pipe");
            assert!(n > 0, "Pipe closed while waiting for an envelope");
            self.decoder.feed(&buf[..n]);
        }
    }

    /// True once the other end has closed the pipe.
    pub async fn closed(&mut self) -> bool {
        let mut buf = [0u8; 4096];
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(n)) => self.decoder.feed(&buf[..n]),
                Err(_) => return false,
            }
        }
    }
}

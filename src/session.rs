//! Per-connection session handling.
//!
//! A session reads newline-terminated lines, records each one in the
//! client's transcript, runs it through the command interpreter and writes
//! the response back. It ends when the peer closes, when no line arrives
//! within the idle timeout, when the client asks to quit, or on I/O error.

use crate::clock::SharedClock;
use crate::command;
use crate::transcript::Transcript;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf,
};
use tokio::time::timeout;
use tracing::{debug, info};

/// Sent when a client stays silent past the idle timeout.
pub const TIMEOUT_NOTICE: &str = "Connection timed out due to inactivity\n";

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sliding window, reset after every line received.
    pub idle_timeout: Duration,
    /// Maximum bytes in one line, terminator included.
    pub max_line_length: usize,
    /// How long to wait for the peer to close after a client-requested
    /// shutdown.
    pub linger: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            max_line_length: 1024,
            linger: Duration::from_secs(1),
        }
    }
}

/// Why a session ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// End of stream from the client.
    PeerClosed,
    /// No line within the idle timeout; the notice was sent.
    IdleTimeout,
    /// The client asked to quit and received the goodbye.
    ClientQuit,
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::PeerClosed => write!(f, "closed by client"),
            SessionEnd::IdleTimeout => write!(f, "timed out"),
            SessionEnd::ClientQuit => write!(f, "client quit"),
        }
    }
}

/// Session-terminating I/O failures.
#[derive(Debug)]
pub enum SessionError {
    Read(io::Error),
    Write(io::Error),
    /// No line terminator within the framing limit.
    LineTooLong(usize),
    Transcript(io::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Read(e) => write!(f, "Read error: {e}"),
            SessionError::Write(e) => write!(f, "Write error: {e}"),
            SessionError::LineTooLong(limit) => {
                write!(f, "Line exceeds {limit} bytes without terminator")
            }
            SessionError::Transcript(e) => write!(f, "Transcript write error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Read(e) | SessionError::Write(e) | SessionError::Transcript(e) => {
                Some(e)
            }
            SessionError::LineTooLong(_) => None,
        }
    }
}

/// One client connection, from first read to close.
pub struct Session<S, W> {
    peer: SocketAddr,
    reader: ReadHalf<S>,
    writer: BufWriter<WriteHalf<S>>,
    buffer: BytesMut,
    transcript: Transcript<W>,
    clock: SharedClock,
    config: SessionConfig,
}

impl<S, W> Session<S, W>
where
    S: AsyncRead + AsyncWrite,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        transcript: Transcript<W>,
        clock: SharedClock,
        config: SessionConfig,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            peer,
            reader,
            writer: BufWriter::new(writer),
            buffer: BytesMut::with_capacity(config.max_line_length),
            transcript,
            clock,
            config,
        }
    }

    /// Drive the session to completion. The connection is half-closed or
    /// dropped by the time this returns.
    pub async fn run(mut self) -> Result<SessionEnd, SessionError> {
        let result = self.serve().await;
        debug!(
            peer = %self.peer,
            lines = self.transcript.entries(),
            "Session finished"
        );
        result
    }

    async fn serve(&mut self) -> Result<SessionEnd, SessionError> {
        loop {
            let line = match timeout(self.config.idle_timeout, self.read_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => return Ok(SessionEnd::PeerClosed),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    self.send_timeout_notice().await;
                    return Ok(SessionEnd::IdleTimeout);
                }
            };

            let text = String::from_utf8_lossy(&line);
            let message = text.trim();
            info!(peer = %self.peer, message, "Received");

            self.transcript
                .append(self.clock.now(), message)
                .await
                .map_err(SessionError::Transcript)?;

            let result = command::interpret(message, self.clock.as_ref());
            self.writer
                .write_all(result.response.as_bytes())
                .await
                .map_err(SessionError::Write)?;
            self.writer.flush().await.map_err(SessionError::Write)?;

            if result.terminate {
                self.close_gracefully().await;
                return Ok(SessionEnd::ClientQuit);
            }
        }
    }

    /// Read up to and including the next `\n`. `None` means end of stream;
    /// an unterminated tail before end of stream is dropped.
    async fn read_line(&mut self) -> Result<Option<BytesMut>, SessionError> {
        let limit = self.config.max_line_length;
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                if pos >= limit {
                    return Err(SessionError::LineTooLong(limit));
                }
                return Ok(Some(self.buffer.split_to(pos + 1)));
            }
            if self.buffer.len() >= limit {
                return Err(SessionError::LineTooLong(limit));
            }

            let n = self
                .reader
                .read_buf(&mut self.buffer)
                .await
                .map_err(SessionError::Read)?;
            if n == 0 {
                if !self.buffer.is_empty() {
                    debug!(
                        peer = %self.peer,
                        bytes = self.buffer.len(),
                        "Discarding unterminated line at end of stream"
                    );
                }
                return Ok(None);
            }
        }
    }

    async fn send_timeout_notice(&mut self) {
        let sent = match self.writer.write_all(TIMEOUT_NOTICE.as_bytes()).await {
            Ok(()) => self.writer.shutdown().await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            debug!(peer = %self.peer, error = %e, "Failed to deliver timeout notice");
        }
    }

    /// Half-close the send side, then wait for the peer to close so the
    /// final response is not lost to a reset.
    async fn close_gracefully(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!(peer = %self.peer, error = %e, "Shutdown failed");
            return;
        }

        let reader = &mut self.reader;
        let drain = async move {
            let mut scratch = [0u8; 512];
            while let Ok(n) = reader.read(&mut scratch).await {
                if n == 0 {
                    break;
                }
            }
        };
        if timeout(self.config.linger, drain).await.is_err() {
            debug!(peer = %self.peer, "Peer did not close within linger period");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::{at, SteppingClock};
    use crate::command::GOODBYE;
    use std::sync::Arc;
    use tokio::io::duplex;
    use tokio::time::{sleep, Instant};

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn clock() -> SharedClock {
        Arc::new(SteppingClock::new(at(12, 0, 0), chrono::Duration::seconds(1)))
    }

    fn session<S>(stream: S, log: &mut Vec<u8>) -> Session<S, &mut Vec<u8>>
    where
        S: AsyncRead + AsyncWrite,
    {
        session_with(stream, log, SessionConfig::default())
    }

    fn session_with<S>(
        stream: S,
        log: &mut Vec<u8>,
        config: SessionConfig,
    ) -> Session<S, &mut Vec<u8>>
    where
        S: AsyncRead + AsyncWrite,
    {
        Session::new(stream, peer(), Transcript::new(log), clock(), config)
    }

    fn logged_messages(log: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(log)
            .lines()
            .map(|l| l.split_once("] ").unwrap().1.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_hello_then_eof() {
        let stream = tokio_test::io::Builder::new()
            .read(b"hello\n")
            .write(b"Hi there!\n\n")
            .build();
        let mut log = Vec::new();

        let end = session(stream, &mut log).run().await.unwrap();
        assert_eq!(end, SessionEnd::PeerClosed);
        assert_eq!(logged_messages(&log), ["hello"]);
    }

    #[tokio::test]
    async fn test_pipelined_lines_answered_in_order() {
        let stream = tokio_test::io::Builder::new()
            .read(b"hello\r\n/echo ping\n\nRANDOM TEXT\n")
            .write(b"Hi there!\n\n")
            .write(b"ping\n\n")
            .write(b"Say something...\n\n")
            .write(b"RANDOM TEXT\n\n")
            .build();
        let mut log = Vec::new();

        let end = session(stream, &mut log).run().await.unwrap();
        assert_eq!(end, SessionEnd::PeerClosed);
        assert_eq!(
            logged_messages(&log),
            ["hello", "/echo ping", "", "RANDOM TEXT"]
        );
    }

    #[tokio::test]
    async fn test_line_split_across_reads() {
        let stream = tokio_test::io::Builder::new()
            .read(b"/ec")
            .read(b"ho split")
            .read(b"\n")
            .write(b"split\n\n")
            .build();
        let mut log = Vec::new();

        session(stream, &mut log).run().await.unwrap();
        assert_eq!(logged_messages(&log), ["/echo split"]);
    }

    #[tokio::test]
    async fn test_quit_stops_processing() {
        // "hello" after "bye" is never answered.
        let stream = tokio_test::io::Builder::new()
            .read(b"bye\nhello\n")
            .write(GOODBYE.as_bytes())
            .build();
        let mut log = Vec::new();

        let end = session(stream, &mut log).run().await.unwrap();
        assert_eq!(end, SessionEnd::ClientQuit);
        assert_eq!(logged_messages(&log), ["bye"]);
    }

    #[tokio::test]
    async fn test_unterminated_tail_is_dropped() {
        let stream = tokio_test::io::Builder::new().read(b"partial").build();
        let mut log = Vec::new();

        let end = session(stream, &mut log).run().await.unwrap();
        assert_eq!(end, SessionEnd::PeerClosed);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_read_error_is_terminal() {
        let stream = tokio_test::io::Builder::new()
            .read(b"hello\n")
            .write(b"Hi there!\n\n")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut log = Vec::new();

        let err = session(stream, &mut log).run().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Read(ref e) if e.kind() == io::ErrorKind::ConnectionReset
        ));
        assert_eq!(logged_messages(&log), ["hello"]);
    }

    #[tokio::test]
    async fn test_transcript_timestamps_follow_receipt_order() {
        let stream = tokio_test::io::Builder::new()
            .read(b"one\ntwo\nthree\n")
            .write(b"one\n\n")
            .write(b"two\n\n")
            .write(b"three\n\n")
            .build();
        let mut log = Vec::new();

        session(stream, &mut log).run().await.unwrap();

        let text = String::from_utf8(log).unwrap();
        let stamps: Vec<_> = text
            .lines()
            .map(|l| {
                let stamp = &l[1..l.find(']').unwrap()];
                chrono::DateTime::parse_from_rfc3339(stamp).unwrap()
            })
            .collect();
        assert_eq!(stamps.len(), 3);
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let stream = tokio_test::io::Builder::new()
            .read(b"\xff\xfehi\n")
            .write("\u{fffd}\u{fffd}hi\n\n".as_bytes())
            .build();
        let mut log = Vec::new();

        let end = session(stream, &mut log).run().await.unwrap();
        assert_eq!(end, SessionEnd::PeerClosed);
        assert_eq!(logged_messages(&log), ["\u{fffd}\u{fffd}hi"]);
    }

    #[tokio::test]
    async fn test_line_at_exact_limit_is_accepted() {
        // 1023 bytes of text plus the terminator fill the 1024-byte limit.
        let mut line = vec![b'a'; 1023];
        line.push(b'\n');
        let mut reply = vec![b'a'; 1023];
        reply.extend_from_slice(b"\n\n");

        let stream = tokio_test::io::Builder::new()
            .read(&line)
            .write(&reply)
            .build();
        let mut log = Vec::new();

        let end = session(stream, &mut log).run().await.unwrap();
        assert_eq!(end, SessionEnd::PeerClosed);
        assert_eq!(logged_messages(&log), ["a".repeat(1023)]);
    }

    #[tokio::test]
    async fn test_line_one_past_limit_is_rejected() {
        let (mut client, server) = duplex(8192);
        let mut log = Vec::new();

        let mut line = vec![b'a'; 1024];
        line.push(b'\n');
        client.write_all(&line).await.unwrap();
        let err = session(server, &mut log).run().await.unwrap_err();
        assert!(matches!(err, SessionError::LineTooLong(1024)));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_terminator_at_limit_after_pipelined_line() {
        // The second line's terminator sits exactly at the limit once the
        // first line has been split off the buffer.
        let config = SessionConfig {
            max_line_length: 4,
            ..SessionConfig::default()
        };
        let stream = tokio_test::io::Builder::new()
            .read(b"ab\nabcd\n")
            .write(b"ab\n\n")
            .build();
        let mut log = Vec::new();

        let err = session_with(stream, &mut log, config).run().await.unwrap_err();
        assert!(matches!(err, SessionError::LineTooLong(4)));
        assert_eq!(logged_messages(&log), ["ab"]);
    }

    #[tokio::test]
    async fn test_oversized_line_closes_session() {
        let (mut client, server) = duplex(8192);
        let mut log = Vec::new();

        client.write_all(&[b'a'; 2048]).await.unwrap();
        let err = session(server, &mut log).run().await.unwrap_err();
        assert!(matches!(err, SessionError::LineTooLong(1024)));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_terminator_past_limit_is_rejected() {
        let (mut client, server) = duplex(8192);
        let mut log = Vec::new();

        let mut line = vec![b'a'; 1500];
        line.push(b'\n');
        client.write_all(&line).await.unwrap();
        let err = session(server, &mut log).run().await.unwrap_err();
        assert!(matches!(err, SessionError::LineTooLong(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_sends_notice_and_closes() {
        let (mut client, server) = duplex(4096);
        let mut log = Vec::new();
        let start = Instant::now();

        let client_side = async move {
            let mut received = Vec::new();
            client.read_to_end(&mut received).await.unwrap();
            received
        };
        let (end, received) = tokio::join!(session(server, &mut log).run(), client_side);

        assert_eq!(end.unwrap(), SessionEnd::IdleTimeout);
        assert_eq!(received, TIMEOUT_NOTICE.as_bytes());
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(log.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_slides_on_each_line() {
        let (mut client, server) = duplex(4096);
        let mut log = Vec::new();
        let start = Instant::now();

        let client_side = async move {
            sleep(Duration::from_secs(20)).await;
            client.write_all(b"hello\n").await.unwrap();
            let mut reply = [0u8; 11];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"Hi there!\n\n");

            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
            (rest, start.elapsed())
        };
        let (end, (rest, elapsed)) =
            tokio::join!(session(server, &mut log).run(), client_side);

        assert_eq!(end.unwrap(), SessionEnd::IdleTimeout);
        assert_eq!(rest, TIMEOUT_NOTICE.as_bytes());
        assert!(elapsed >= Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_goodbye_delivered_before_eof() {
        let (mut client, server) = duplex(4096);
        let mut log = Vec::new();

        let client_side = async move {
            client.write_all(b"/quit\n").await.unwrap();
            let mut received = Vec::new();
            client.read_to_end(&mut received).await.unwrap();
            received
        };
        let (end, received) = tokio::join!(session(server, &mut log).run(), client_side);

        assert_eq!(end.unwrap(), SessionEnd::ClientQuit);
        assert_eq!(received, GOODBYE.as_bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn test_linger_is_bounded() {
        // Client never closes its side; the session still finishes.
        let (mut client, server) = duplex(4096);
        let mut log = Vec::new();

        client.write_all(b"bye\n").await.unwrap();
        let end = session(server, &mut log).run().await.unwrap();
        assert_eq!(end, SessionEnd::ClientQuit);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, GOODBYE.as_bytes());
    }
}

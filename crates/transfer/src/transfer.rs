//! Single-connection, non-blocking transfer state machine.
//!
//! A transfer first writes its request head, then (uploads only) the body,
//! then reads the response head and (downloads only) the body. The socket is
//! therefore only ever wanted for reading or for writing, never both, except
//! while the TCP connect is still in flight.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use ::http::StatusCode;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::body::{BodySink, BodySource};
use crate::http::{self, MAX_HEAD_LEN, ResponseHead, Target};
use crate::{
    Body, DEFAULT_BLOCK_SIZE, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT, Direction,
    SpeedCalculator, TransferError,
};

/// Socket state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Finished, failed, timed out or closed. The socket is gone.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SendHead,
    SendBody,
    RecvHead,
    RecvBody,
}

/// Everything needed to open a transfer.
#[derive(Debug, Clone)]
pub struct TransferSpec {
    pub target: Target,
    pub direction: Direction,
    pub body: Body,
    /// Upper bound on bytes moved by one `do_transfer` call.
    pub block_size: usize,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl TransferSpec {
    pub fn download(target: Target, body: Body) -> Self {
        Self::new(target, Direction::Download, body)
    }

    pub fn upload(target: Target, body: Body) -> Self {
        Self::new(target, Direction::Upload, body)
    }

    fn new(target: Target, direction: Direction, body: Body) -> Self {
        Self {
            target,
            direction,
            body,
            block_size: DEFAULT_BLOCK_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, idle: Duration) -> Self {
        self.connect_timeout = connect;
        self.idle_timeout = idle;
        self
    }
}

/// Final result of a transfer, handed to its owner once it is done.
#[derive(Debug)]
pub struct TransferOutcome {
    pub result: Result<(), TransferError>,
    /// Body bytes moved during this session.
    pub bytes_transferred: u64,
    /// Absolute body position reached (resume offset included).
    pub position: u64,
    pub http_status: Option<u16>,
    /// Received body of an in-memory download.
    pub output: Option<Vec<u8>>,
}

/// One non-blocking HTTP transfer over one TCP connection.
pub struct Transfer {
    spec: TransferSpec,
    stream: Option<TcpStream>,
    state: ConnectionState,
    phase: Phase,
    error: Option<TransferError>,
    source: Option<BodySource>,
    sink: Option<BodySink>,
    output: Option<Vec<u8>>,
    /// Pending outbound bytes: the request head, then read-ahead body blocks.
    out_buf: Vec<u8>,
    out_pos: usize,
    read_buf: Vec<u8>,
    head_buf: Vec<u8>,
    http_status: Option<u16>,
    /// Body bytes still expected from the server, when announced.
    body_expected: Option<u64>,
    body_total: Option<u64>,
    bytes_transferred: u64,
    start_time: Option<Instant>,
    last_activity: Option<Instant>,
    speed: SpeedCalculator,
}

impl Transfer {
    /// Stores the configuration. No I/O happens until [`connect`](Self::connect).
    pub fn open(spec: TransferSpec) -> Self {
        Self {
            spec,
            stream: None,
            state: ConnectionState::Disconnected,
            phase: Phase::SendHead,
            error: None,
            source: None,
            sink: None,
            output: None,
            out_buf: Vec::new(),
            out_pos: 0,
            read_buf: Vec::new(),
            head_buf: Vec::new(),
            http_status: None,
            body_expected: None,
            body_total: None,
            bytes_transferred: 0,
            start_time: None,
            last_activity: None,
            speed: SpeedCalculator::default(),
        }
    }

    /// Opens the body and starts a non-blocking TCP connect.
    ///
    /// Name resolution is synchronous. Must be called from within a tokio
    /// runtime. On failure the transfer stays `Disconnected`.
    pub fn connect(&mut self, now: Instant) -> Result<(), TransferError> {
        if self.state != ConnectionState::Disconnected {
            return Ok(());
        }

        let head = match self.spec.direction {
            Direction::Download => {
                let sink = BodySink::open(&self.spec.body)?;
                let head = http::download_request(&self.spec.target, sink.offset());
                self.sink = Some(sink);
                head
            }
            Direction::Upload => {
                let source = BodySource::open(&self.spec.body)?;
                let head = http::upload_request(&self.spec.target, source.offset(), source.len());
                self.body_total = Some(source.len());
                self.source = Some(source);
                head
            }
        };

        let stream = start_connect(&self.spec.target).map_err(|source| TransferError::Connect {
            host: self.spec.target.host.clone(),
            port: self.spec.target.port,
            source,
        })?;

        self.out_buf = head;
        self.out_pos = 0;
        self.read_buf = vec![0u8; self.spec.block_size];
        self.stream = Some(stream);
        self.state = ConnectionState::Connecting;
        self.start_time = Some(now);
        self.last_activity = Some(now);
        debug!(target_url = %self.spec.target, direction = %self.spec.direction, "connecting");
        Ok(())
    }

    /// Readiness the transfer is waiting for, if any.
    pub fn interest(&self) -> Option<Interest> {
        match self.state {
            ConnectionState::Connecting => Some(Interest::READABLE | Interest::WRITABLE),
            ConnectionState::Connected => match self.phase {
                Phase::SendHead | Phase::SendBody => Some(Interest::WRITABLE),
                Phase::RecvHead | Phase::RecvBody => Some(Interest::READABLE),
            },
            ConnectionState::Disconnected | ConnectionState::Done => None,
        }
    }

    /// Direction of the socket I/O wanted next, `None` while not moving data.
    ///
    /// This is what the bandwidth quota is charged against.
    pub fn io_direction(&self) -> Option<Direction> {
        match self.state {
            ConnectionState::Connected => match self.phase {
                Phase::SendHead | Phase::SendBody => Some(Direction::Upload),
                Phase::RecvHead | Phase::RecvBody => Some(Direction::Download),
            },
            _ => None,
        }
    }

    pub(crate) fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Performs one non-blocking read or write of at most
    /// `min(block_size, grant)` bytes.
    ///
    /// Returns the socket bytes moved (0 when the socket was not actually
    /// ready). Errors leave the transfer untouched; the caller records them
    /// with [`fail`](Self::fail).
    pub fn do_transfer(&mut self, now: Instant, grant: usize) -> Result<usize, TransferError> {
        match self.state {
            ConnectionState::Connecting => {
                self.finish_connect(now)?;
                Ok(0)
            }
            ConnectionState::Connected => {
                let limit = grant.min(self.spec.block_size);
                if limit == 0 {
                    return Ok(0);
                }
                match self.phase {
                    Phase::SendHead | Phase::SendBody => self.write_step(now, limit),
                    Phase::RecvHead | Phase::RecvBody => self.read_step(now, limit),
                }
            }
            ConnectionState::Disconnected | ConnectionState::Done => Ok(0),
        }
    }

    fn finish_connect(&mut self, now: Instant) -> Result<(), TransferError> {
        let Some(stream) = self.stream.as_ref() else {
            return Ok(());
        };
        let connect_err = |source| TransferError::Connect {
            host: self.spec.target.host.clone(),
            port: self.spec.target.port,
            source,
        };
        if let Some(err) = stream.take_error().map_err(connect_err)? {
            return Err(connect_err(err));
        }
        match stream.peer_addr() {
            Ok(peer) => {
                debug!(%peer, "connected");
                self.state = ConnectionState::Connected;
                self.last_activity = Some(now);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(connect_err(e)),
        }
    }

    fn write_step(&mut self, now: Instant, limit: usize) -> Result<usize, TransferError> {
        if self.out_pos == self.out_buf.len() {
            self.refill_out(limit)?;
        }
        let Some(stream) = self.stream.as_ref() else {
            return Ok(0);
        };
        let end = self.out_buf.len().min(self.out_pos + limit);
        let n = match stream.try_write(&self.out_buf[self.out_pos..end]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) => return Err(TransferError::Io(e)),
        };
        self.out_pos += n;

        if self.phase == Phase::SendBody {
            self.record_body(now, n as u64);
        } else if n > 0 {
            self.last_activity = Some(now);
        }

        if self.out_pos == self.out_buf.len() {
            let body_left = self.source.as_ref().is_some_and(|s| s.remaining() > 0);
            self.phase = match (self.phase, body_left) {
                (Phase::SendHead, true) | (Phase::SendBody, true) => Phase::SendBody,
                _ => Phase::RecvHead,
            };
        }
        Ok(n)
    }

    /// Reads the next body block into the outbound buffer.
    fn refill_out(&mut self, limit: usize) -> Result<(), TransferError> {
        self.out_buf.clear();
        self.out_pos = 0;
        if self.phase != Phase::SendBody {
            return Ok(());
        }
        let Some(source) = self.source.as_mut() else {
            return Ok(());
        };
        self.out_buf.resize(limit, 0);
        let n = source.read(&mut self.out_buf)?;
        self.out_buf.truncate(n);
        Ok(())
    }

    fn read_step(&mut self, now: Instant, limit: usize) -> Result<usize, TransferError> {
        let Some(stream) = self.stream.as_ref() else {
            return Ok(0);
        };
        let mut buf = std::mem::take(&mut self.read_buf);
        let limit = limit.min(buf.len());
        let result = match stream.try_read(&mut buf[..limit]) {
            Ok(0) => self.on_eof(now).map(|()| 0),
            Ok(n) => {
                self.last_activity = Some(now);
                self.on_data(now, &buf[..n]).map(|()| n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(TransferError::Io(e)),
        };
        self.read_buf = buf;
        result
    }

    fn on_data(&mut self, now: Instant, data: &[u8]) -> Result<(), TransferError> {
        match self.phase {
            Phase::RecvHead => {
                self.head_buf.extend_from_slice(data);
                let Some((head, end)) = http::parse_response_head(&self.head_buf)? else {
                    if self.head_buf.len() > MAX_HEAD_LEN {
                        return Err(TransferError::Protocol("response head too large".into()));
                    }
                    return Ok(());
                };
                let head_buf = std::mem::take(&mut self.head_buf);
                self.on_head(now, head)?;
                let rest = &head_buf[end..];
                if self.phase == Phase::RecvBody && !rest.is_empty() {
                    self.on_body(now, rest)?;
                }
                Ok(())
            }
            Phase::RecvBody => self.on_body(now, data),
            // Unsolicited bytes while sending are left for the response read.
            Phase::SendHead | Phase::SendBody => Ok(()),
        }
    }

    fn on_head(&mut self, now: Instant, head: ResponseHead) -> Result<(), TransferError> {
        let status = head.status.as_u16();
        self.http_status = Some(status);
        debug!(status, content_length = ?head.content_length, "response head");

        match self.spec.direction {
            Direction::Upload => {
                if !head.status.is_success() {
                    return Err(TransferError::Http(status));
                }
                self.complete(now)
            }
            Direction::Download => {
                let Some(sink) = self.sink.as_mut() else {
                    return Err(TransferError::Protocol("download without sink".into()));
                };
                let offset = sink.offset();
                let complete = head.content_range.and_then(|range| range.complete);
                match head.status {
                    StatusCode::OK => {
                        if offset > 0 {
                            debug!(offset, "server ignored range, restarting");
                            sink.restart()?;
                        }
                    }
                    StatusCode::PARTIAL_CONTENT => {
                        let first = head.content_range.and_then(|range| range.first);
                        if first != Some(offset) {
                            return Err(TransferError::Protocol(format!(
                                "asked for bytes from {offset}, got range starting at {first:?}"
                            )));
                        }
                    }
                    StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                        return self.on_range_past_end(now, offset, complete);
                    }
                    _ => return Err(TransferError::Http(status)),
                }
                let offset = self.sink.as_ref().map_or(0, BodySink::offset);
                self.body_expected = head.content_length;
                self.body_total = complete.or(head.content_length.map(|len| offset + len));
                self.phase = Phase::RecvBody;
                if self.body_expected == Some(0) {
                    self.complete(now)?;
                }
                Ok(())
            }
        }
    }

    /// Handles a 416 answer to `Range: bytes=<offset>-`.
    ///
    /// The local file already holds every byte when the server's length
    /// matches it (or is not given). Otherwise the partial file is stale and
    /// the next attempt starts from zero.
    fn on_range_past_end(
        &mut self,
        now: Instant,
        offset: u64,
        complete: Option<u64>,
    ) -> Result<(), TransferError> {
        match complete {
            Some(len) if len != offset => {
                debug!(offset, remote_len = len, "partial file does not match remote, discarding");
                if let Some(sink) = self.sink.as_mut() {
                    sink.restart()?;
                }
                Err(TransferError::Http(StatusCode::RANGE_NOT_SATISFIABLE.as_u16()))
            }
            _ => {
                debug!(offset, "local file already complete");
                self.body_expected = Some(0);
                self.body_total = Some(offset);
                self.complete(now)
            }
        }
    }

    fn on_body(&mut self, now: Instant, data: &[u8]) -> Result<(), TransferError> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        let take = match self.body_expected {
            Some(expected) => (expected as usize).min(data.len()),
            None => data.len(),
        };
        sink.write(&data[..take])?;
        if let Some(expected) = self.body_expected.as_mut() {
            *expected -= take as u64;
        }
        self.record_body(now, take as u64);
        if self.body_expected == Some(0) {
            self.complete(now)?;
        }
        Ok(())
    }

    fn on_eof(&mut self, now: Instant) -> Result<(), TransferError> {
        match (self.phase, self.body_expected) {
            (Phase::RecvBody, None) => self.complete(now),
            (Phase::RecvBody, Some(left)) => Err(TransferError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection closed with {left} body bytes outstanding"),
            ))),
            _ => Err(TransferError::Protocol(
                "connection closed before response".into(),
            )),
        }
    }

    fn record_body(&mut self, now: Instant, n: u64) {
        if n == 0 {
            return;
        }
        self.bytes_transferred += n;
        self.last_activity = Some(now);
        self.speed.add_sample(n, now);
    }

    fn complete(&mut self, now: Instant) -> Result<(), TransferError> {
        if let Some(sink) = self.sink.take() {
            let position = sink.offset();
            self.output = sink.finish()?;
            self.body_total.get_or_insert(position);
        }
        self.stream = None;
        self.state = ConnectionState::Done;
        let elapsed = self
            .start_time
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default();
        info!(
            target_url = %self.spec.target,
            direction = %self.spec.direction,
            bytes = self.bytes_transferred,
            elapsed_secs = format_args!("{:.1}", elapsed.as_secs_f64()),
            "transfer finished"
        );
        Ok(())
    }

    /// Marks the transfer done with `err` and releases the socket.
    pub fn fail(&mut self, err: TransferError) {
        if self.state == ConnectionState::Done {
            return;
        }
        debug!(target_url = %self.spec.target, error = %err, "transfer failed");
        self.error = Some(err);
        self.stream = None;
        self.state = ConnectionState::Done;
    }

    /// Times the transfer out after too long without progress.
    ///
    /// While connecting the connect budget applies. `quiesce` suspends the
    /// idle check (and restarts its clock) during deliberate pauses such as
    /// an exhausted bandwidth quota. Returns `true` if it timed out now.
    pub fn check_timeout(&mut self, now: Instant, quiesce: bool) -> bool {
        let (since, budget) = match self.state {
            ConnectionState::Connecting => (self.start_time, self.spec.connect_timeout),
            ConnectionState::Connected => {
                if quiesce {
                    self.last_activity = Some(now);
                    return false;
                }
                (self.last_activity, self.spec.idle_timeout)
            }
            ConnectionState::Disconnected | ConnectionState::Done => return false,
        };
        let Some(since) = since else {
            return false;
        };
        if now.saturating_duration_since(since) < budget {
            return false;
        }
        self.fail(TransferError::Timeout(budget));
        true
    }

    /// Releases the socket. A transfer closed before finishing is recorded
    /// as cancelled. Idempotent.
    pub fn close(&mut self) {
        if self.state != ConnectionState::Done {
            self.fail(TransferError::Cancelled);
        }
        self.stream = None;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns `true` once no further I/O will be attempted.
    pub fn is_done(&self) -> bool {
        self.state == ConnectionState::Done
    }

    pub fn error(&self) -> Option<&TransferError> {
        self.error.as_ref()
    }

    pub fn direction(&self) -> Direction {
        self.spec.direction
    }

    pub fn target(&self) -> &Target {
        &self.spec.target
    }

    pub fn block_size(&self) -> usize {
        self.spec.block_size
    }

    /// Body bytes moved so far in this session.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Absolute body position: resume offset plus bytes moved.
    pub fn position(&self) -> u64 {
        if let Some(sink) = &self.sink {
            return sink.offset();
        }
        if let Some(source) = &self.source {
            // Bytes still in the outbound buffer have not reached the socket.
            let unsent = if self.phase == Phase::SendBody {
                (self.out_buf.len() - self.out_pos) as u64
            } else {
                0
            };
            return source.offset() - unsent;
        }
        self.body_total.unwrap_or(self.spec.body.offset() + self.bytes_transferred)
    }

    /// Full body size, once known.
    pub fn body_total(&self) -> Option<u64> {
        self.body_total
    }

    /// Recent throughput in bytes per second.
    pub fn transfer_speed(&self) -> f64 {
        self.speed.bytes_per_second()
    }

    /// Time left at the current speed, once the body size is known.
    pub fn eta(&self) -> Option<Duration> {
        let remaining = self.body_total?.saturating_sub(self.position());
        self.speed.eta(remaining)
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    pub fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    /// Consumes the transfer into its outcome.
    pub fn into_outcome(mut self) -> TransferOutcome {
        if !self.is_done() {
            self.close();
        }
        let position = self.position();
        TransferOutcome {
            result: match self.error.take() {
                Some(err) => Err(err),
                None => Ok(()),
            },
            bytes_transferred: self.bytes_transferred,
            position,
            http_status: self.http_status,
            output: self.output.take(),
        }
    }
}

/// Resolves `target` and issues a non-blocking connect to the first address.
fn start_connect(target: &Target) -> io::Result<TcpStream> {
    let addr: SocketAddr = (target.host.as_str(), target.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host has no addresses"))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if connect_in_progress(&e) => {}
        Err(e) => return Err(e),
    }
    TcpStream::from_std(socket.into())
}

fn connect_in_progress(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    err.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn target(port: u16, path: &str) -> Target {
        Target::parse(&format!("http://127.0.0.1:{port}{path}")).unwrap()
    }

    /// Drives a single transfer by hand until it is done.
    async fn drive(transfer: &mut Transfer, grant: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !transfer.is_done() {
            assert!(Instant::now() < deadline, "transfer did not finish");
            if let (Some(stream), Some(interest)) = (transfer.stream(), transfer.interest()) {
                let _ = tokio::time::timeout(Duration::from_millis(50), stream.ready(interest)).await;
            }
            let now = Instant::now();
            if let Err(e) = transfer.do_transfer(now, grant) {
                transfer.fail(e);
            }
            transfer.check_timeout(now, false);
        }
    }

    /// Accepts one connection, returns the request text and replies with `reply`.
    async fn serve_once(listener: TcpListener, reply: Vec<u8>) -> String {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = sock.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        sock.write_all(&reply).await.unwrap();
        sock.shutdown().await.unwrap();
        String::from_utf8_lossy(&request).into_owned()
    }

    #[test]
    fn open_does_no_io() {
        let spec = TransferSpec::download(target(1, "/f"), Body::Memory(Vec::new()));
        let transfer = Transfer::open(spec);
        assert_eq!(transfer.state(), ConnectionState::Disconnected);
        assert!(transfer.interest().is_none());
        assert!(transfer.io_direction().is_none());
        assert!(transfer.eta().is_none());
    }

    #[tokio::test]
    async fn memory_download_completes() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(serve_once(
            listener,
            b"HTTP/1.0 200 OK\r\nContent-Length: 11\r\n\r\nhello world".to_vec(),
        ));

        let spec = TransferSpec::download(target(port, "/sched_reply"), Body::Memory(Vec::new()))
            .with_block_size(4);
        let mut transfer = Transfer::open(spec);
        transfer.connect(Instant::now()).unwrap();
        drive(&mut transfer, usize::MAX).await;

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /sched_reply HTTP/1.0\r\n"));
        let outcome = transfer.into_outcome();
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.http_status, Some(200));
        assert_eq!(outcome.bytes_transferred, 11);
        assert_eq!(outcome.output.as_deref(), Some(&b"hello world"[..]));
    }

    #[tokio::test]
    async fn grant_caps_each_read() {
        let (listener, port) = listener().await;
        let body = vec![7u8; 64];
        let mut reply = b"HTTP/1.0 200 OK\r\n\r\n".to_vec();
        reply.extend_from_slice(&body);
        tokio::spawn(serve_once(listener, reply));

        let spec = TransferSpec::download(target(port, "/f"), Body::Memory(Vec::new()));
        let mut transfer = Transfer::open(spec);
        transfer.connect(Instant::now()).unwrap();

        let mut previous = 0;
        let deadline = Instant::now() + Duration::from_secs(10);
        while !transfer.is_done() {
            assert!(Instant::now() < deadline);
            if let (Some(stream), Some(interest)) = (transfer.stream(), transfer.interest()) {
                let _ = tokio::time::timeout(Duration::from_millis(50), stream.ready(interest)).await;
            }
            let moved = transfer.do_transfer(Instant::now(), 5).unwrap();
            assert!(moved <= 5);
            assert!(transfer.bytes_transferred() >= previous);
            previous = transfer.bytes_transferred();
        }
        let outcome = transfer.into_outcome();
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.output.unwrap(), body);
    }

    #[tokio::test]
    async fn upload_sends_body_and_reads_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.out");
        std::fs::write(&path, b"0123456789").unwrap();

        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.ends_with(b"\r\n\r\n6789") {
                let n = sock.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed early");
                request.extend_from_slice(&buf[..n]);
            }
            sock.write_all(b"HTTP/1.0 201 Created\r\n\r\n").await.unwrap();
            String::from_utf8(request).unwrap()
        });

        let spec = TransferSpec::upload(
            target(port, "/upload/result.out"),
            Body::File { path, offset: 6 },
        )
        .with_block_size(3);
        let mut transfer = Transfer::open(spec);
        transfer.connect(Instant::now()).unwrap();
        drive(&mut transfer, usize::MAX).await;

        let request = server.await.unwrap();
        assert!(request.starts_with("PUT /upload/result.out HTTP/1.0\r\n"));
        assert!(request.contains("Content-Range: bytes 6-9/10\r\n"));
        let outcome = transfer.into_outcome();
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.http_status, Some(201));
        assert_eq!(outcome.bytes_transferred, 4);
        assert_eq!(outcome.position, 10);
    }

    #[tokio::test]
    async fn http_error_status_fails() {
        let (listener, port) = listener().await;
        tokio::spawn(serve_once(
            listener,
            b"HTTP/1.0 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec(),
        ));

        let spec = TransferSpec::download(target(port, "/missing"), Body::Memory(Vec::new()));
        let mut transfer = Transfer::open(spec);
        transfer.connect(Instant::now()).unwrap();
        drive(&mut transfer, usize::MAX).await;

        assert!(matches!(transfer.error(), Some(TransferError::Http(404))));
        assert!(transfer.stream().is_none());
    }

    fn resume_spec(port: u16, path: &std::path::Path) -> TransferSpec {
        let offset = crate::existing_len(path);
        TransferSpec::download(
            target(port, "/input.dat"),
            Body::File {
                path: path.to_path_buf(),
                offset,
            },
        )
    }

    #[tokio::test]
    async fn unsatisfiable_range_at_end_completes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.dat");
        std::fs::write(&path, b"hello").unwrap();

        let (listener, port) = listener().await;
        let server = tokio::spawn(serve_once(
            listener,
            b"HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */5\r\nContent-Length: 13\r\n\r\nout of range\n"
                .to_vec(),
        ));

        let mut transfer = Transfer::open(resume_spec(port, &path));
        transfer.connect(Instant::now()).unwrap();
        drive(&mut transfer, usize::MAX).await;

        assert!(server.await.unwrap().contains("Range: bytes=5-\r\n"));
        let outcome = transfer.into_outcome();
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.http_status, Some(416));
        assert_eq!(outcome.bytes_transferred, 0);
        assert_eq!(outcome.position, 5);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn unsatisfiable_range_with_other_length_discards_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.dat");
        std::fs::write(&path, b"stale and too long").unwrap();

        let (listener, port) = listener().await;
        tokio::spawn(serve_once(
            listener,
            b"HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */5\r\n\r\n".to_vec(),
        ));

        let mut transfer = Transfer::open(resume_spec(port, &path));
        transfer.connect(Instant::now()).unwrap();
        drive(&mut transfer, usize::MAX).await;

        assert!(matches!(transfer.error(), Some(TransferError::Http(416))));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn partial_content_must_start_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.dat");
        std::fs::write(&path, b"01234").unwrap();

        let (listener, port) = listener().await;
        tokio::spawn(serve_once(
            listener,
            b"HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 0-9/10\r\nContent-Length: 10\r\n\r\n0123456789"
                .to_vec(),
        ));

        let mut transfer = Transfer::open(resume_spec(port, &path));
        transfer.connect(Instant::now()).unwrap();
        drive(&mut transfer, usize::MAX).await;

        assert!(matches!(transfer.error(), Some(TransferError::Protocol(_))));
        assert_eq!(std::fs::read(&path).unwrap(), b"01234");
    }

    #[tokio::test]
    async fn short_body_is_io_error() {
        let (listener, port) = listener().await;
        tokio::spawn(serve_once(
            listener,
            b"HTTP/1.0 200 OK\r\nContent-Length: 100\r\n\r\nonly a bit".to_vec(),
        ));

        let spec = TransferSpec::download(target(port, "/f"), Body::Memory(Vec::new()));
        let mut transfer = Transfer::open(spec);
        transfer.connect(Instant::now()).unwrap();
        drive(&mut transfer, usize::MAX).await;

        assert!(matches!(transfer.error(), Some(TransferError::Io(_))));
        assert_eq!(transfer.bytes_transferred(), 10);
    }

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        let (listener, port) = listener().await;
        drop(listener);

        let spec = TransferSpec::download(target(port, "/f"), Body::Memory(Vec::new()));
        let mut transfer = Transfer::open(spec);
        match transfer.connect(Instant::now()) {
            Err(err) => {
                assert!(matches!(err, TransferError::Connect { .. }));
                assert_eq!(transfer.state(), ConnectionState::Disconnected);
            }
            Ok(()) => {
                drive(&mut transfer, usize::MAX).await;
                assert!(matches!(transfer.error(), Some(TransferError::Connect { .. })));
            }
        }
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let (listener, port) = listener().await;
        let _server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(sock);
        });

        let spec = TransferSpec::download(target(port, "/f"), Body::Memory(Vec::new()))
            .with_timeouts(Duration::from_secs(5), Duration::from_millis(300));
        let mut transfer = Transfer::open(spec);
        transfer.connect(Instant::now()).unwrap();
        drive(&mut transfer, usize::MAX).await;

        assert!(matches!(transfer.error(), Some(TransferError::Timeout(_))));
    }

    #[tokio::test]
    async fn quiesce_suspends_idle_check() {
        let (listener, port) = listener().await;
        let _server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(sock);
        });

        let spec = TransferSpec::download(target(port, "/f"), Body::Memory(Vec::new()))
            .with_timeouts(Duration::from_secs(5), Duration::from_secs(1));
        let mut transfer = Transfer::open(spec);
        let t0 = Instant::now();
        transfer.connect(t0).unwrap();
        while transfer.state() == ConnectionState::Connecting {
            if let (Some(stream), Some(interest)) = (transfer.stream(), transfer.interest()) {
                let _ = stream.ready(interest).await;
            }
            transfer.do_transfer(Instant::now(), usize::MAX).unwrap();
        }

        let later = Instant::now() + Duration::from_secs(10);
        assert!(!transfer.check_timeout(later, true));
        assert!(!transfer.is_done());
        assert!(transfer.check_timeout(later + Duration::from_secs(2), false));
        assert!(transfer.is_done());
    }

    #[test]
    fn close_is_idempotent() {
        let spec = TransferSpec::download(target(1, "/f"), Body::Memory(Vec::new()));
        let mut transfer = Transfer::open(spec);
        transfer.close();
        transfer.close();
        assert!(transfer.is_done());
        assert!(matches!(transfer.error(), Some(TransferError::Cancelled)));
    }
}

//! Per-connection request lifecycle.
//!
//! Every accepted socket is driven by one `Client`, which walks the
//! connection through authentication, header parsing, optional body
//! buffering, session checkout, header dispatch and bidirectional
//! forwarding. Each await point corresponds to one readiness event of the
//! connection: readable/writable on either socket, a spill-pipe commit, a
//! drained output pipe, a completed checkout, or a deadline.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::http::error_page;
use crate::http::header_buffer::HeaderBufferer;
use crate::http::response::{rewrite_response_header, RewriteError};
use crate::http::scgi::{HeaderBlock, ScgiError, ScgiParser};
use crate::io::{spill_pipe, BufferedInput, PipeReader, PipeWriter};
use crate::proxy::pool::{CheckoutError, PoolOptions, SessionSource, SpawnFailure};
use crate::proxy::session::build_dispatch_frame;

const MAX_CHECKOUT_ATTEMPTS: u32 = 10;

/// Lifecycle phase of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    BeginReadPassword,
    ReadPassword,
    ReadHeader,
    BufferBody,
    CheckoutSession,
    SendHeaderToApp,
    ForwardBody,
    WriteSimpleResponse,
    Disconnected,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::BeginReadPassword => "BeginReadPassword",
            Phase::ReadPassword => "ReadPassword",
            Phase::ReadHeader => "ReadHeader",
            Phase::BufferBody => "BufferBody",
            Phase::CheckoutSession => "CheckoutSession",
            Phase::SendHeaderToApp => "SendHeaderToApp",
            Phase::ForwardBody => "ForwardBody",
            Phase::WriteSimpleResponse => "WriteSimpleResponse",
            Phase::Disconnected => "Disconnected",
        }
    }
}

/// Shared view of a client's phase, kept in the registry for inspection.
pub type PhaseCell = Arc<Mutex<Phase>>;

/// Why a client connection ended.
#[derive(Debug)]
pub enum Disconnect {
    /// Clean end: client hung up, or the response was fully delivered
    Normal,
    /// Client vanished mid-response; not worth a warning
    Quiet,
    WrongPassword,
    PasswordTimeout,
    Timeout(&'static str),
    Protocol(String),
    /// Worker response had no `Status` header; answered with a 500 page
    MissingStatus,
    SessionInitiate,
    ClientRead(std::io::Error),
    ClientWrite(std::io::Error),
    WorkerRead(std::io::Error),
    WorkerWrite(std::io::Error),
    Pipe(std::io::Error),
}

impl Disconnect {
    /// Whether this termination should be logged as an error.
    pub fn is_error(&self) -> bool {
        !matches!(self, Disconnect::Normal | Disconnect::Quiet)
    }
}

impl std::fmt::Display for Disconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disconnect::Normal => write!(f, "client disconnected"),
            Disconnect::Quiet => write!(f, "client hung up during response"),
            Disconnect::WrongPassword => write!(f, "wrong connect password"),
            Disconnect::PasswordTimeout => {
                write!(f, "no connect password received within timeout")
            }
            Disconnect::Timeout(message) => write!(f, "{message}"),
            Disconnect::Protocol(message) => write!(f, "{message}"),
            Disconnect::MissingStatus => write!(
                f,
                "application sent a malformed response: it didn't send a Status header"
            ),
            Disconnect::SessionInitiate => write!(f, "could not initiate a session"),
            Disconnect::ClientRead(e) => write!(f, "client socket read error: {e}"),
            Disconnect::ClientWrite(e) => write!(f, "client socket write error: {e}"),
            Disconnect::WorkerRead(e) => write!(f, "app socket read error: {e}"),
            Disconnect::WorkerWrite(e) => write!(f, "app socket write error: {e}"),
            Disconnect::Pipe(e) => write!(f, "spill pipe error: {e}"),
        }
    }
}

struct ParsedRequest {
    /// Serialized header block for dispatch; rebuilt iff normalization
    /// changed the parsed mapping
    raw_block: Bytes,
    headers: HeaderBlock,
}

/// Source of request body bytes during forwarding: the client socket
/// directly, or the spill pipe the body was buffered into.
enum BodySource<R> {
    Direct(BufferedInput<R>),
    Buffered(PipeReader),
}

impl<R: AsyncRead + Unpin> BodySource<R> {
    async fn next(&mut self) -> Result<Option<Bytes>, Disconnect> {
        match self {
            BodySource::Direct(input) => {
                input.next_chunk().await.map_err(Disconnect::ClientRead)
            }
            BodySource::Buffered(reader) => reader.next().await.map_err(Disconnect::Pipe),
        }
    }
}

pub struct Client<P> {
    id: i32,
    config: Arc<Config>,
    pool: Arc<P>,
    phase: PhaseCell,
}

impl<P: SessionSource> Client<P> {
    pub fn new(id: i32, config: Arc<Config>, pool: Arc<P>, phase: PhaseCell) -> Self {
        *phase.lock().unwrap() = Phase::BeginReadPassword;
        Self {
            id,
            config,
            pool,
            phase,
        }
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap() = phase;
        debug!(client = self.id, phase = phase.name(), "Phase transition");
    }

    /// Drives the connection from authentication to disconnect. The
    /// returned reason is terminal; the socket is dropped afterwards.
    pub async fn run<S>(self, socket: S) -> Disconnect
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (read_half, write_half) = tokio::io::split(socket);
        let input = BufferedInput::new(read_half);
        let mut client_write = write_half;

        let reason = self.lifecycle(input, &mut client_write).await;
        self.set_phase(Phase::Disconnected);
        reason
    }

    async fn lifecycle<R, W>(&self, mut input: BufferedInput<R>, client_write: &mut W) -> Disconnect
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        // Connect password, under its deadline.
        match timeout(
            self.config.connect_password_timeout(),
            self.read_connect_password(&mut input),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return reason,
            Err(_) => return Disconnect::PasswordTimeout,
        }

        // Request header.
        let parsed = match maybe_timeout(
            self.config.header_timeout(),
            self.read_request_header(&mut input),
        )
        .await
        {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(reason)) => return reason,
            Err(()) => return Disconnect::Timeout("timeout reading request header"),
        };
        let ParsedRequest { raw_block, headers } = parsed;

        // Optional body buffering before the session is checked out.
        let mut body_pipe = None;
        if headers.bool_option(b"PASSENGER_BUFFERING", false) {
            match self.buffer_request_body(&mut input).await {
                Ok(reader) => body_pipe = Some(reader),
                Err(reason) => return reason,
            }
        }

        // Session checkout, with bounded initiation retries.
        self.set_phase(Phase::CheckoutSession);
        let options = PoolOptions::from_headers(&headers);
        let mut attempts: u32 = 0;
        let (worker_io, worker_password) = loop {
            let checked_out = match maybe_timeout(
                self.config.checkout_timeout(),
                self.pool.checkout(&options),
            )
            .await
            {
                Ok(result) => result,
                Err(()) => return Disconnect::Timeout("timeout checking out a session"),
            };

            let session = match checked_out {
                Ok(session) => session,
                Err(error) => {
                    warn!(
                        client = self.id,
                        "Cannot check out session: {}",
                        error.message()
                    );
                    let (message, failure) = match &error {
                        CheckoutError::SpawnFailed(failure) => (
                            failure
                                .error_page
                                .clone()
                                .unwrap_or_else(|| failure.message.clone()),
                            Some(failure),
                        ),
                        CheckoutError::Other(message) => (message.clone(), None),
                    };
                    return self
                        .write_error_page(client_write, &headers, &options, &message, failure)
                        .await;
                }
            };

            attempts += 1;
            let worker_name = session.worker_name.clone();
            let password = session.connect_password.clone();
            match session.initiate().await {
                Ok(io) => {
                    self.pool.report(&worker_name, true);
                    break (io, password);
                }
                Err(error) if attempts < MAX_CHECKOUT_ATTEMPTS => {
                    self.pool.report(&worker_name, false);
                    debug!(
                        client = self.id,
                        attempt = attempts,
                        error = %error,
                        "Session initiation failed; retrying"
                    );
                }
                Err(error) => {
                    self.pool.report(&worker_name, false);
                    warn!(client = self.id, error = %error, "Session initiation failed");
                    return Disconnect::SessionInitiate;
                }
            }
        };

        // Dispatch the header frame, then forward in both directions until
        // the response is fully delivered. The frame write shares the
        // request-forward flow so a worker that answers before draining the
        // frame cannot wedge the connection.
        self.set_phase(Phase::SendHeaderToApp);
        let frame = build_dispatch_frame(&raw_block, &worker_password);
        let (worker_read, worker_write) = tokio::io::split(worker_io);
        let print_status_line = headers.bool_option(b"PASSENGER_PRINT_STATUS_LINE", true);
        let (out_writer, mut out_reader) = spill_pipe(
            &self.config.buffers.temp_dir,
            self.config.buffers.spill_watermark,
        );

        let reason = {
            // Leftover bytes already read past the header become the first
            // body chunk when forwarding straight from the client.
            let source = match body_pipe.take() {
                Some(reader) => BodySource::Buffered(reader),
                None => BodySource::Direct(input),
            };

            let updown = async {
                tokio::try_join!(
                    forward_request(frame, source, worker_write, &self.phase, self.id),
                    forward_response(
                        worker_read,
                        out_writer,
                        print_status_line,
                        self.config.buffers.max_header_size,
                        self.id,
                    ),
                )
                .map(|_| ())
            };
            tokio::pin!(updown);
            let drain = drain_output(&mut out_reader, client_write, self.id);
            tokio::pin!(drain);

            tokio::select! {
                result = &mut drain => match result {
                    Ok(()) => Disconnect::Normal,
                    Err(reason) => reason,
                },
                result = &mut updown => match result {
                    Ok(()) => match drain.await {
                        Ok(()) => Disconnect::Normal,
                        Err(reason) => reason,
                    },
                    Err(reason) => reason,
                },
            }
        };

        // A missing Status header is caught before anything reaches the
        // client, so it can still be answered with a proper error page.
        if matches!(reason, Disconnect::MissingStatus) {
            warn!(client = self.id, "{reason}");
            return self
                .write_error_page(
                    client_write,
                    &headers,
                    &options,
                    &reason.to_string(),
                    None,
                )
                .await;
        }
        reason
    }

    async fn read_connect_password<R>(&self, input: &mut BufferedInput<R>) -> Result<(), Disconnect>
    where
        R: AsyncRead + Unpin,
    {
        let expected = self.config.server.connect_password.as_bytes();
        let mut buffered = BytesMut::new();

        loop {
            let chunk = match input.next_chunk().await {
                Err(e) => return Err(Disconnect::ClientRead(e)),
                Ok(None) => return Err(Disconnect::Normal),
                Ok(Some(chunk)) => chunk,
            };

            if buffered.is_empty() && chunk.len() >= expected.len() {
                // The whole password arrived in one piece.
                if &chunk[..expected.len()] == expected {
                    trace!(client = self.id, "Connect password is correct");
                    input.unread(chunk.slice(expected.len()..));
                    return Ok(());
                }
                return Err(Disconnect::WrongPassword);
            }

            self.set_phase(Phase::ReadPassword);
            let want = expected.len() - buffered.len();
            let take = want.min(chunk.len());
            buffered.extend_from_slice(&chunk[..take]);
            if buffered.len() == expected.len() {
                if buffered[..] == *expected {
                    trace!(client = self.id, "Connect password is correct");
                    input.unread(chunk.slice(take..));
                    return Ok(());
                }
                return Err(Disconnect::WrongPassword);
            }
        }
    }

    async fn read_request_header<R>(
        &self,
        input: &mut BufferedInput<R>,
    ) -> Result<ParsedRequest, Disconnect>
    where
        R: AsyncRead + Unpin,
    {
        self.set_phase(Phase::ReadHeader);
        let mut parser = ScgiParser::new(self.config.buffers.max_header_size);

        loop {
            let chunk = match input.next_chunk().await {
                Err(e) => return Err(Disconnect::ClientRead(e)),
                Ok(None) => return Err(Disconnect::Normal),
                Ok(Some(chunk)) => chunk,
            };

            let consumed = parser.feed(&chunk);
            if parser.accepting_input() {
                continue;
            }
            if let Some(error) = parser.error() {
                return Err(match error {
                    ScgiError::TooLarge => {
                        Disconnect::Protocol("SCGI header too large".to_string())
                    }
                    ScgiError::Malformed => {
                        Disconnect::Protocol("invalid SCGI header".to_string())
                    }
                });
            }

            input.unread(chunk.slice(consumed..));
            let mut headers = parser.take_block();
            let modified = headers.normalize();
            let raw_block = if modified {
                headers.serialize()
            } else {
                parser.header_data()
            };
            return Ok(ParsedRequest { raw_block, headers });
        }
    }

    /// Streams the request body into a spill pipe until client EOF. While
    /// the pipe is committing to disk the client read is held back, which
    /// is what bounds memory use for large uploads.
    async fn buffer_request_body<R>(
        &self,
        input: &mut BufferedInput<R>,
    ) -> Result<PipeReader, Disconnect>
    where
        R: AsyncRead + Unpin,
    {
        self.set_phase(Phase::BufferBody);
        let (mut writer, reader) = spill_pipe(
            &self.config.buffers.temp_dir,
            self.config.buffers.spill_watermark,
        );

        loop {
            match input.next_chunk().await {
                Err(e) => return Err(Disconnect::ClientRead(e)),
                Ok(None) => {
                    trace!(client = self.id, "Done buffering request body");
                    writer.end();
                    return Ok(reader);
                }
                Ok(Some(chunk)) => match writer.write(chunk) {
                    Err(e) => return Err(Disconnect::Pipe(e)),
                    Ok(true) => {}
                    Ok(false) => {
                        trace!(client = self.id, "Body pipe committing to disk; pausing client input");
                        if let Err(e) = writer.committed().await {
                            return Err(Disconnect::Pipe(e));
                        }
                    }
                },
            }
        }
    }

    /// Renders the 500 page and schedules it as the sole response.
    async fn write_error_page<W>(
        &self,
        client_write: &mut W,
        headers: &HeaderBlock,
        options: &PoolOptions,
        message: &str,
        failure: Option<&SpawnFailure>,
    ) -> Disconnect
    where
        W: AsyncWrite + Unpin,
    {
        self.set_phase(Phase::WriteSimpleResponse);
        let friendly = headers.bool_option(b"PASSENGER_FRIENDLY_ERROR_PAGES", true);
        let print_status_line = headers.bool_option(b"PASSENGER_PRINT_STATUS_LINE", true);
        let app_root = options.app_root.as_deref().unwrap_or("(unknown)");
        let environment = options.environment.as_deref().unwrap_or("production");

        let body = error_page::render_error_body(message, app_root, environment, failure, friendly);
        let response = error_page::build_error_response(&body, print_status_line);

        let (mut writer, mut reader) = spill_pipe(
            &self.config.buffers.temp_dir,
            self.config.buffers.spill_watermark,
        );
        match writer.write(response) {
            Err(e) => return Disconnect::Pipe(e),
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = writer.committed().await {
                    return Disconnect::Pipe(e);
                }
            }
        }
        writer.end();

        match drain_output(&mut reader, client_write, self.id).await {
            Ok(()) => Disconnect::Normal,
            Err(reason) => reason,
        }
    }
}

/// Flushes the header frame to the worker, then forwards request body
/// bytes. Client/pipe EOF half-closes the worker's write side; a worker
/// EPIPE stops the request side but keeps the response flowing.
async fn forward_request<R, W>(
    frame: Bytes,
    mut source: BodySource<R>,
    mut worker_write: W,
    phase: &PhaseCell,
    client: i32,
) -> Result<(), Disconnect>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Err(e) = worker_write.write_all(&frame).await {
        if e.kind() != std::io::ErrorKind::BrokenPipe {
            return Err(Disconnect::WorkerWrite(e));
        }
        // A dead worker surfaces on the response side; nothing more to
        // send from here.
        return Ok(());
    }

    *phase.lock().unwrap() = Phase::ForwardBody;
    debug!(client, phase = Phase::ForwardBody.name(), "Phase transition");

    loop {
        let chunk = match source.next().await? {
            Some(chunk) => chunk,
            None => {
                trace!(client, "End of request body; half-closing worker write side");
                let _ = worker_write.shutdown().await;
                return Ok(());
            }
        };
        if let Err(e) = worker_write.write_all(&chunk).await {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                // Worker stopped reading; drop the request side and let
                // the response keep flowing.
                trace!(client, "Worker closed its read side; discarding request body");
                return Ok(());
            }
            return Err(Disconnect::WorkerWrite(e));
        }
    }
}

/// Forwards the worker's response into the client output pipe, rewriting
/// the header block first and passing everything after it through.
async fn forward_response<R>(
    worker_read: R,
    mut out: PipeWriter,
    print_status_line: bool,
    header_limit: usize,
    client: i32,
) -> Result<(), Disconnect>
where
    R: AsyncRead + Unpin,
{
    let mut input = BufferedInput::new(worker_read);
    let mut bufferer = HeaderBufferer::new(header_limit);

    // Buffer until end-of-headers, then rewrite.
    loop {
        let chunk = match input.next_chunk().await {
            Err(e) => return Err(Disconnect::WorkerRead(e)),
            Ok(None) => {
                // Worker went away before completing a header; there is
                // nothing to salvage, deliver whatever was scheduled.
                out.end();
                return Ok(());
            }
            Ok(Some(chunk)) => chunk,
        };

        let consumed = bufferer.feed(&chunk);
        if bufferer.has_error() {
            return Err(Disconnect::Protocol(
                "application response format error (invalid header)".to_string(),
            ));
        }
        if bufferer.is_complete() {
            let rest = chunk.slice(consumed..);
            let rewritten = rewrite_response_header(bufferer.data(), print_status_line)
                .map_err(|_: RewriteError| Disconnect::MissingStatus)?;
            write_to_output(&mut out, Bytes::from(rewritten)).await?;
            if !rest.is_empty() {
                write_to_output(&mut out, rest).await?;
            }
            break;
        }
    }

    // Header processed; everything else passes through unmodified.
    loop {
        match input.next_chunk().await {
            Err(e) => return Err(Disconnect::WorkerRead(e)),
            Ok(None) => {
                trace!(client, "Worker sent EOF");
                out.end();
                return Ok(());
            }
            Ok(Some(chunk)) => write_to_output(&mut out, chunk).await?,
        }
    }
}

/// Writes into the client output pipe, pausing the worker read while the
/// pipe commits to disk.
async fn write_to_output(out: &mut PipeWriter, data: Bytes) -> Result<(), Disconnect> {
    match out.write(data) {
        Err(e) => Err(Disconnect::Pipe(e)),
        Ok(true) => Ok(()),
        Ok(false) => out.committed().await.map_err(Disconnect::Pipe),
    }
}

/// Runs `fut` under a deadline when one is configured.
async fn maybe_timeout<F: Future>(limit: Option<Duration>, fut: F) -> Result<F::Output, ()> {
    match limit {
        Some(duration) => timeout(duration, fut).await.map_err(|_| ()),
        None => Ok(fut.await),
    }
}

/// Drains the client output pipe into the client socket. An EPIPE here
/// means the client went away mid-response; that disconnect is quiet.
async fn drain_output<W>(
    reader: &mut PipeReader,
    client_write: &mut W,
    client: i32,
) -> Result<(), Disconnect>
where
    W: AsyncWrite + Unpin,
{
    loop {
        match reader.next().await {
            Err(e) => return Err(Disconnect::Pipe(e)),
            Ok(None) => {
                let _ = client_write.flush().await;
                trace!(client, "Client output pipe drained");
                return Ok(());
            }
            Ok(Some(chunk)) => {
                if let Err(e) = client_write.write_all(&chunk).await {
                    if e.kind() == std::io::ErrorKind::BrokenPipe {
                        return Err(Disconnect::Quiet);
                    }
                    return Err(Disconnect::ClientWrite(e));
                }
            }
        }
    }
}

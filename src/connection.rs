//! A single connection to a beanstalkd server.
//!
//! Each [`Connection`] is a cheap handle onto a driver task that owns the
//! socket. Callers hand commands to the driver over a channel and suspend on
//! a oneshot until their response is decoded. The driver keeps a FIFO queue
//! and puts exactly one command on the wire at a time, so responses always
//! come back in submission order.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, instrument, trace, warn, Instrument};

use crate::codec::{decode_block, Response};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::parser::validate_tube_name;
use crate::reader::ResponseReader;
use crate::types::job::{Job, JobId, Reservation};
use crate::types::protocol::{BeanstalkCommand, ResponseLine};
use crate::types::serialisable::BeanstalkSerialisable;
use crate::types::stats::{from_yaml, JobStats, ServerStats, TubeStats};
use crate::util::bytes_to_human_str;

/// The most urgent priority is 0; this is the least urgent.
pub const DEFAULT_PRIORITY: u32 = u32::MAX;
/// Seconds a reserved job may be held before the server releases it.
pub const DEFAULT_TTR: u32 = 10;
/// The tube every connection uses and watches when it's opened.
pub const DEFAULT_TUBE: &str = "default";
/// The largest job body the client will send, in bytes.
pub const MAX_JOB_SIZE: usize = 65536;

/// Sent on connect: a server speaking the protocol must reject it with
/// `UNKNOWN_COMMAND`.
const HANDSHAKE_PROBE: &[u8] = b"A\r\n";

/// A command waiting for (or awaiting the response to) its turn on the wire.
struct Pending {
    command: BeanstalkCommand,
    reply: oneshot::Sender<Result<Response>>,
}

#[derive(Clone, Debug)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Pending>,
    closed: CancellationToken,
    peer: Arc<str>,
}

impl Connection {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let config = Config::builder().host(host).port(port).build();
        Self::with_config(&config).await
    }

    /// Connects, verifies the peer speaks the protocol, and starts the
    /// driver task. Fails with [`Error::Connection`] on timeout, refusal or
    /// a handshake mismatch.
    #[instrument(
        name = "connect",
        err,
        fields(addr = %config.addr()),
        skip_all
    )]
    pub async fn with_config(config: &Config) -> Result<Self> {
        let addr = config.addr();

        let stream = timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                Error::Connection(format!("timed out connecting to {addr}"))
            })??;
        stream.set_nodelay(true)?;

        Self::establish(stream, addr, config.connect_timeout).await
    }

    pub(crate) async fn establish<S>(
        stream: S,
        peer: impl Into<Arc<str>>,
        handshake_timeout: Duration,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = peer.into();
        let (r, mut writer) = tokio::io::split(stream);
        let mut reader: ResponseReader<_> = r.into();

        timeout(handshake_timeout, handshake(&mut reader, &mut writer))
            .await
            .map_err(|_| {
                Error::Connection("timed out awaiting handshake".to_owned())
            })??;

        let (commands, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let driver = Driver {
            reader,
            writer,
            commands: rx,
            closed: closed.clone(),
            queue: VecDeque::new(),
            in_flight: None,
        };
        tokio::spawn(
            driver
                .run()
                .instrument(info_span!("connection", peer = %peer)),
        );

        debug!(%peer, "connected");

        Ok(Self {
            commands,
            closed,
            peer,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether this connection has been closed, locally or by a failure.
    /// A closed connection never reopens.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.commands.is_closed()
    }

    /// Closes the connection. Every command in flight or queued fails with
    /// [`Error::Connection`]. Calling this more than once is harmless.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Queues `command` and waits for its response. Responses that signal
    /// failure are returned as-is; the typed operations below interpret
    /// them.
    pub async fn execute(&self, command: BeanstalkCommand) -> Result<Response> {
        if self.closed.is_cancelled() {
            return Err(Error::closed());
        }

        let (reply, response) = oneshot::channel();
        self.commands
            .send(Pending { command, reply })
            .map_err(|_| Error::closed())?;

        response.await.map_err(|_| Error::closed())?
    }

    /// Maps a response that doesn't answer the command issued to an error.
    /// Server-side error lines leave the stream in sync; anything else means
    /// it isn't, so the connection is closed.
    fn reject(&self, line: ResponseLine) -> Error {
        match line {
            ResponseLine::OutOfMemory => Error::OutOfMemory,
            ResponseLine::InternalError => Error::InternalError,
            ResponseLine::BadFormat => Error::BadFormat,
            ResponseLine::UnknownCommand => Error::UnknownCommand,
            ResponseLine::Draining => Error::Draining,
            ResponseLine::JobTooBig => Error::JobTooBig,
            other => {
                warn!(
                    peer = %self.peer,
                    response = ?other,
                    "unexpected response, closing"
                );
                self.close();
                Error::UnexpectedResponse(format!("{other:?}"))
            },
        }
    }

    /// As [`Self::reject`] for a data block that failed to parse.
    fn reject_payload(&self, error: Error) -> Error {
        warn!(peer = %self.peer, %error, "malformed data block, closing");
        self.close();
        error
    }

    /// Selects the tube subsequent `put`s go to, returning the tube the
    /// server reports it's now using.
    pub async fn use_tube(&self, tube: &str) -> Result<String> {
        validate_tube_name(tube)?;

        let response = self
            .execute(BeanstalkCommand::Use {
                tube: tube.to_owned(),
            })
            .await?;

        match response.line {
            ResponseLine::Using { tube } => Ok(tube),
            other => Err(self.reject(other)),
        }
    }

    /// The tube this connection is using, as reported by the server.
    pub async fn current_tube(&self) -> Result<String> {
        let response = self.execute(BeanstalkCommand::ListTubeUsed).await?;

        match response.line {
            ResponseLine::Using { tube } => Ok(tube),
            other => Err(self.reject(other)),
        }
    }

    /// Puts a job into the tube in use. A job the server had to bury for
    /// lack of memory still reports its ID.
    pub async fn put(
        &self,
        data: impl Into<Bytes>,
        pri: u32,
        delay: u32,
        ttr: u32,
    ) -> Result<JobId> {
        let data = data.into();
        if data.len() > MAX_JOB_SIZE {
            return Err(Error::JobTooBig);
        }

        let response = self
            .execute(BeanstalkCommand::Put {
                pri,
                delay,
                ttr,
                data,
            })
            .await?;

        match response.line {
            ResponseLine::Inserted { id } | ResponseLine::BuriedId { id } => {
                Ok(id)
            },
            other => Err(self.reject(other)),
        }
    }

    /// Selects `tube`, then puts a job into it.
    pub async fn put_in(
        &self,
        tube: &str,
        data: impl Into<Bytes>,
        pri: u32,
        delay: u32,
        ttr: u32,
    ) -> Result<JobId> {
        self.use_tube(tube).await?;
        self.put(data, pri, delay, ttr).await
    }

    /// Reserves a job from the watched tubes. With no timeout this waits as
    /// long as the server does; `Some(0)` returns immediately.
    pub async fn reserve(&self, timeout: Option<u32>) -> Result<Reservation> {
        let command = match timeout {
            Some(timeout) => BeanstalkCommand::ReserveWithTimeout { timeout },
            None => BeanstalkCommand::Reserve,
        };

        let Response { line, payload } = self.execute(command).await?;

        match line {
            ResponseLine::Reserved { id, .. } => Ok(Reservation::Reserved(
                Job::new(id, payload.unwrap_or_default()),
            )),
            ResponseLine::DeadlineSoon => Ok(Reservation::DeadlineSoon),
            ResponseLine::TimedOut => Ok(Reservation::TimedOut),
            other => Err(self.reject(other)),
        }
    }

    pub async fn delete(&self, id: JobId) -> Result<bool> {
        let response = self.execute(BeanstalkCommand::Delete { id }).await?;

        match response.line {
            ResponseLine::Deleted => Ok(true),
            ResponseLine::NotFound => Ok(false),
            other => Err(self.reject(other)),
        }
    }

    /// Returns a reserved job to the ready (or, with a delay, delayed) queue.
    /// `BURIED` counts as success: the server took the job back but had no
    /// memory to queue it.
    pub async fn release(
        &self,
        id: JobId,
        pri: u32,
        delay: u32,
    ) -> Result<bool> {
        let response = self
            .execute(BeanstalkCommand::Release { id, pri, delay })
            .await?;

        match response.line {
            ResponseLine::Released | ResponseLine::Buried => Ok(true),
            ResponseLine::NotFound => Ok(false),
            other => Err(self.reject(other)),
        }
    }

    pub async fn bury(&self, id: JobId, pri: u32) -> Result<bool> {
        let response = self.execute(BeanstalkCommand::Bury { id, pri }).await?;

        match response.line {
            ResponseLine::Buried => Ok(true),
            ResponseLine::NotFound => Ok(false),
            other => Err(self.reject(other)),
        }
    }

    pub async fn touch(&self, id: JobId) -> Result<bool> {
        let response = self.execute(BeanstalkCommand::Touch { id }).await?;

        match response.line {
            ResponseLine::Touched => Ok(true),
            ResponseLine::NotFound => Ok(false),
            other => Err(self.reject(other)),
        }
    }

    /// Adds `tube` to the watch list, returning how many tubes are watched.
    pub async fn watch(&self, tube: &str) -> Result<u32> {
        validate_tube_name(tube)?;

        let response = self
            .execute(BeanstalkCommand::Watch {
                tube: tube.to_owned(),
            })
            .await?;

        match response.line {
            ResponseLine::Watching { count } => Ok(count),
            other => Err(self.reject(other)),
        }
    }

    /// Removes `tube` from the watch list. Returns false if the server
    /// refused because it's the last tube watched.
    pub async fn ignore(&self, tube: &str) -> Result<bool> {
        validate_tube_name(tube)?;

        let response = self
            .execute(BeanstalkCommand::Ignore {
                tube: tube.to_owned(),
            })
            .await?;

        match response.line {
            ResponseLine::Watching { .. } => Ok(true),
            ResponseLine::NotIgnored => Ok(false),
            other => Err(self.reject(other)),
        }
    }

    /// The watched tubes, in the order the server lists them.
    pub async fn watch_list(&self) -> Result<Vec<String>> {
        let response = self.execute(BeanstalkCommand::ListTubesWatched).await?;
        self.tube_list(response)
    }

    /// Every tube that currently exists on the server.
    pub async fn list_tubes(&self) -> Result<Vec<String>> {
        let response = self.execute(BeanstalkCommand::ListTubes).await?;
        self.tube_list(response)
    }

    fn tube_list(&self, response: Response) -> Result<Vec<String>> {
        match response.line {
            ResponseLine::Ok { .. } => {
                let block = decode_block(&response.payload.unwrap_or_default())
                    .map_err(|error| self.reject_payload(error))?;
                Ok(block.into_keys().collect())
            },
            other => Err(self.reject(other)),
        }
    }

    pub async fn peek(&self, id: JobId) -> Result<Option<Job>> {
        self.peek_with(BeanstalkCommand::Peek { id }).await
    }

    /// The next ready job in the tube in use.
    pub async fn peek_ready(&self) -> Result<Option<Job>> {
        self.peek_with(BeanstalkCommand::PeekReady).await
    }

    /// The delayed job in the tube in use that will become ready soonest.
    pub async fn peek_delayed(&self) -> Result<Option<Job>> {
        self.peek_with(BeanstalkCommand::PeekDelayed).await
    }

    /// The next buried job in the tube in use.
    pub async fn peek_buried(&self) -> Result<Option<Job>> {
        self.peek_with(BeanstalkCommand::PeekBuried).await
    }

    async fn peek_with(
        &self,
        command: BeanstalkCommand,
    ) -> Result<Option<Job>> {
        let Response { line, payload } = self.execute(command).await?;

        match line {
            ResponseLine::Found { id, .. } => {
                Ok(Some(Job::new(id, payload.unwrap_or_default())))
            },
            ResponseLine::NotFound => Ok(None),
            other => Err(self.reject(other)),
        }
    }

    /// Moves up to `bound` buried jobs (or, if there are none, delayed jobs)
    /// in the tube in use back to ready, returning how many moved.
    pub async fn kick(&self, bound: u64) -> Result<u64> {
        let response = self.execute(BeanstalkCommand::Kick { bound }).await?;

        match response.line {
            ResponseLine::KickedCount { count } => Ok(count),
            other => Err(self.reject(other)),
        }
    }

    pub async fn kick_job(&self, id: JobId) -> Result<bool> {
        let response = self.execute(BeanstalkCommand::KickJob { id }).await?;

        match response.line {
            ResponseLine::Kicked => Ok(true),
            ResponseLine::NotFound => Ok(false),
            other => Err(self.reject(other)),
        }
    }

    pub async fn stats_job(&self, id: JobId) -> Result<Option<JobStats>> {
        let response = self.execute(BeanstalkCommand::StatsJob { id }).await?;
        self.stats_record(response)
    }

    pub async fn stats_tube(&self, tube: &str) -> Result<Option<TubeStats>> {
        validate_tube_name(tube)?;

        let response = self
            .execute(BeanstalkCommand::StatsTube {
                tube: tube.to_owned(),
            })
            .await?;
        self.stats_record(response)
    }

    pub async fn stats(&self) -> Result<ServerStats> {
        let response = self.execute(BeanstalkCommand::StatsServer).await?;

        match self.stats_record(response)? {
            Some(stats) => Ok(stats),
            None => Err(self.reject(ResponseLine::NotFound)),
        }
    }

    fn stats_record<T>(&self, response: Response) -> Result<Option<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        match response.line {
            ResponseLine::Ok { .. } => {
                from_yaml(&response.payload.unwrap_or_default())
                    .map(Some)
                    .map_err(|error| self.reject_payload(error))
            },
            ResponseLine::NotFound => Ok(None),
            other => Err(self.reject(other)),
        }
    }

    /// Stops jobs in `tube` being reserved for `delay` seconds. Returns false
    /// if the tube doesn't exist.
    pub async fn pause_tube(&self, tube: &str, delay: u32) -> Result<bool> {
        validate_tube_name(tube)?;

        let response = self
            .execute(BeanstalkCommand::PauseTube {
                tube: tube.to_owned(),
                delay,
            })
            .await?;

        match response.line {
            ResponseLine::Paused => Ok(true),
            ResponseLine::NotFound => Ok(false),
            other => Err(self.reject(other)),
        }
    }
}

async fn handshake<R, W>(
    reader: &mut ResponseReader<R>,
    writer: &mut W,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(HANDSHAKE_PROBE).await?;
    writer.flush().await?;

    match reader.read_line().await? {
        Some(line) if &line[..] == b"UNKNOWN_COMMAND" => Ok(()),
        Some(line) => Err(Error::Connection(format!(
            "handshake rejected: {}",
            bytes_to_human_str(&line)
        ))),
        None => Err(Error::Connection(
            "connection closed during handshake".to_owned(),
        )),
    }
}

/// Owns the socket. All decoder state lives here, so nothing else can
/// observe a half-parsed response.
struct Driver<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> {
    reader: ResponseReader<R>,
    writer: W,
    commands: mpsc::UnboundedReceiver<Pending>,
    closed: CancellationToken,
    queue: VecDeque<Pending>,
    /// The only command whose bytes are on the wire without a complete
    /// response.
    in_flight: Option<Pending>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Driver<R, W> {
    async fn run(mut self) {
        let _closed = self.closed.clone().drop_guard();

        let error = match self.drive().await {
            Ok(()) => Error::closed(),
            Err(error) => {
                warn!(%error, "connection failed");
                error
            },
        };

        self.closed.cancel();
        self.commands.close();

        // The in-flight command learns the actual cause; everything behind it
        // only that the connection is gone.
        if let Some(pending) = self.in_flight.take() {
            let _ = pending.reply.send(Err(error));
        }
        while let Ok(pending) = self.commands.try_recv() {
            self.queue.push_back(pending);
        }
        for pending in self.queue.drain(..) {
            let _ = pending.reply.send(Err(Error::closed()));
        }

        if let Err(error) = self.writer.shutdown().await {
            trace!(%error, "during shutdown");
        }

        debug!("connection closed");
    }

    /// Runs until the connection is closed (`Ok`) or fails (`Err`).
    async fn drive(&mut self) -> Result<()> {
        loop {
            select! {
                _ = self.closed.cancelled() => return Ok(()),
                pending = self.commands.recv() => match pending {
                    Some(pending) => {
                        self.queue.push_back(pending);
                        self.advance().await?;
                    },
                    // Every handle has been dropped.
                    None => return Ok(()),
                },
                n_bytes_read = self.reader.fill() => {
                    if n_bytes_read? == 0 {
                        return Err(Error::Connection(
                            "connection closed by server".to_owned(),
                        ));
                    }
                    self.process().await?;
                },
            }
        }
    }

    /// Puts the head of the queue on the wire if nothing is in flight.
    async fn advance(&mut self) -> Result<()> {
        if self.in_flight.is_some() {
            return Ok(());
        }

        while let Some(pending) = self.queue.pop_front() {
            // The caller stopped waiting before its command was sent.
            if pending.reply.is_closed() {
                continue;
            }

            let bytes = pending.command.serialise_beanstalk();
            let line_len = bytes
                .iter()
                .position(|c| *c == b'\r')
                .unwrap_or(bytes.len());
            let request = bytes_to_human_str(&bytes[..line_len]);
            trace!(%request, "sending");

            self.in_flight = Some(pending);
            self.writer.write_all(&bytes).await?;
            self.writer.flush().await?;
            break;
        }

        Ok(())
    }

    /// Completes as many in-flight commands as the buffered bytes allow.
    async fn process(&mut self) -> Result<()> {
        loop {
            let Some(pending) = &self.in_flight else {
                if self.reader.has_buffered() {
                    return Err(Error::UnexpectedResponse(
                        "data received with no command in flight".to_owned(),
                    ));
                }
                return Ok(());
            };

            let Some(response) = self.reader.decode(&pending.command)? else {
                return Ok(());
            };
            trace!(response = ?response.line, "received");

            if let Some(pending) = self.in_flight.take() {
                let _ = pending.reply.send(Ok(response));
            }

            self.advance().await?;
        }
    }
}

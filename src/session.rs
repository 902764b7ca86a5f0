//! A client that survives connection loss.
//!
//! [`ReconnectingClient`] wraps a [`Connection`] and remembers the tube in use
//! and the watch list. When an operation fails with a connection error it
//! opens a fresh connection, restores that state, and retries the operation
//! once.
use std::future::Future;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::Config;
use crate::connection::{Connection, DEFAULT_TUBE};
use crate::error::Result;
use crate::types::job::{Job, JobId, Reservation};
use crate::types::stats::{JobStats, ServerStats, TubeStats};

/// The subscription state a logical session expects its connection to hold.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionState {
    current_tube: String,
    watch_list: Vec<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            current_tube: DEFAULT_TUBE.to_owned(),
            watch_list: vec![DEFAULT_TUBE.to_owned()],
        }
    }
}

impl SessionState {
    pub fn current_tube(&self) -> &str {
        &self.current_tube
    }

    /// Watched tubes, in the order they were added.
    pub fn watch_list(&self) -> &[String] {
        &self.watch_list
    }

    /// Whether this state watches exactly the tubes in `tubes`, in any order.
    pub fn watches_same(&self, tubes: &[String]) -> bool {
        self.watch_list.len() == tubes.len()
            && tubes.iter().all(|tube| self.watches(tube))
    }

    pub fn watches(&self, tube: &str) -> bool {
        self.watch_list.iter().any(|t| t == tube)
    }

    fn record_watch(&mut self, tube: &str) {
        if !self.watches(tube) {
            self.watch_list.push(tube.to_owned());
        }
    }

    fn record_ignore(&mut self, tube: &str) {
        self.watch_list.retain(|t| t != tube);
    }
}

/// Not safe for concurrent use: operations take `&mut self`, so one logical
/// session owns each client.
#[derive(Debug)]
pub struct ReconnectingClient {
    config: Config,
    conn: Option<Connection>,
    state: SessionState,
}

impl ReconnectingClient {
    /// Creates a client that connects on first use.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            conn: None,
            state: SessionState::default(),
        }
    }

    /// Creates a client and connects it immediately.
    pub async fn connect(config: Config) -> Result<Self> {
        let mut client = Self::new(config);
        client.connection().await?;
        Ok(client)
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.conn.as_ref().is_some_and(|conn| !conn.is_closed())
    }

    /// Closes the current connection, if any. The next operation reconnects.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
    }

    /// Returns the live connection, opening and restoring a new one if there
    /// isn't one.
    async fn connection(&mut self) -> Result<Connection> {
        if let Some(conn) = &self.conn {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }
        self.conn = None;

        let conn = Connection::with_config(&self.config).await?;
        if let Err(error) = self.restore(&conn).await {
            conn.close();
            return Err(error);
        }

        debug!(peer = conn.peer(), state = ?self.state, "session restored");
        self.conn = Some(conn.clone());
        Ok(conn)
    }

    async fn restore(&self, conn: &Connection) -> Result<()> {
        for tube in &self.state.watch_list {
            conn.watch(tube).await?;
        }
        if !self.state.watches(DEFAULT_TUBE) {
            conn.ignore(DEFAULT_TUBE).await?;
        }
        if self.state.current_tube != DEFAULT_TUBE {
            conn.use_tube(&self.state.current_tube).await?;
        }
        Ok(())
    }

    /// Runs `op` against the live connection. A connection error on the
    /// first attempt, including failing to connect, discards the connection
    /// and runs `op` once more on a new one.
    async fn dispatch<T, F, Fut>(&mut self, op: F) -> Result<T>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let first = match self.connection().await {
            Ok(conn) => op(conn).await,
            Err(error) => Err(error),
        };

        match first {
            Err(error) if error.is_connection_error() => {
                warn!(%error, "connection lost, reconnecting");
                self.close();
                let conn = self.connection().await?;
                op(conn).await
            },
            res => res,
        }
    }

    pub async fn use_tube(&mut self, tube: &str) -> Result<String> {
        let using = self
            .dispatch(|conn| {
                let tube = tube.to_owned();
                async move { conn.use_tube(&tube).await }
            })
            .await?;

        self.state.current_tube.clone_from(&using);
        Ok(using)
    }

    /// The tube in use as reported by the server.
    pub async fn current_tube(&mut self) -> Result<String> {
        self.dispatch(|conn| async move { conn.current_tube().await })
            .await
    }

    pub async fn put(
        &mut self,
        data: impl Into<Bytes>,
        pri: u32,
        delay: u32,
        ttr: u32,
    ) -> Result<JobId> {
        let data = data.into();
        self.dispatch(|conn| {
            let data = data.clone();
            async move { conn.put(data, pri, delay, ttr).await }
        })
        .await
    }

    pub async fn put_in(
        &mut self,
        tube: &str,
        data: impl Into<Bytes>,
        pri: u32,
        delay: u32,
        ttr: u32,
    ) -> Result<JobId> {
        self.use_tube(tube).await?;
        self.put(data, pri, delay, ttr).await
    }

    pub async fn reserve(
        &mut self,
        timeout: Option<u32>,
    ) -> Result<Reservation> {
        self.dispatch(|conn| async move { conn.reserve(timeout).await })
            .await
    }

    pub async fn delete(&mut self, id: JobId) -> Result<bool> {
        self.dispatch(|conn| async move { conn.delete(id).await })
            .await
    }

    pub async fn release(
        &mut self,
        id: JobId,
        pri: u32,
        delay: u32,
    ) -> Result<bool> {
        self.dispatch(|conn| async move { conn.release(id, pri, delay).await })
            .await
    }

    pub async fn bury(&mut self, id: JobId, pri: u32) -> Result<bool> {
        self.dispatch(|conn| async move { conn.bury(id, pri).await })
            .await
    }

    pub async fn touch(&mut self, id: JobId) -> Result<bool> {
        self.dispatch(|conn| async move { conn.touch(id).await })
            .await
    }

    pub async fn watch(&mut self, tube: &str) -> Result<u32> {
        let count = self
            .dispatch(|conn| {
                let tube = tube.to_owned();
                async move { conn.watch(&tube).await }
            })
            .await?;

        self.state.record_watch(tube);
        Ok(count)
    }

    pub async fn ignore(&mut self, tube: &str) -> Result<bool> {
        let ignored = self
            .dispatch(|conn| {
                let tube = tube.to_owned();
                async move { conn.ignore(&tube).await }
            })
            .await?;

        if ignored {
            self.state.record_ignore(tube);
        }
        Ok(ignored)
    }

    /// The watch list as reported by the server.
    pub async fn watch_list(&mut self) -> Result<Vec<String>> {
        self.dispatch(|conn| async move { conn.watch_list().await })
            .await
    }

    pub async fn peek(&mut self, id: JobId) -> Result<Option<Job>> {
        self.dispatch(|conn| async move { conn.peek(id).await })
            .await
    }

    pub async fn peek_ready(&mut self) -> Result<Option<Job>> {
        self.dispatch(|conn| async move { conn.peek_ready().await })
            .await
    }

    pub async fn peek_delayed(&mut self) -> Result<Option<Job>> {
        self.dispatch(|conn| async move { conn.peek_delayed().await })
            .await
    }

    pub async fn peek_buried(&mut self) -> Result<Option<Job>> {
        self.dispatch(|conn| async move { conn.peek_buried().await })
            .await
    }

    pub async fn kick(&mut self, bound: u64) -> Result<u64> {
        self.dispatch(|conn| async move { conn.kick(bound).await })
            .await
    }

    pub async fn kick_job(&mut self, id: JobId) -> Result<bool> {
        self.dispatch(|conn| async move { conn.kick_job(id).await })
            .await
    }

    pub async fn stats_job(&mut self, id: JobId) -> Result<Option<JobStats>> {
        self.dispatch(|conn| async move { conn.stats_job(id).await })
            .await
    }

    pub async fn stats_tube(
        &mut self,
        tube: &str,
    ) -> Result<Option<TubeStats>> {
        self.dispatch(|conn| {
            let tube = tube.to_owned();
            async move { conn.stats_tube(&tube).await }
        })
        .await
    }

    pub async fn stats(&mut self) -> Result<ServerStats> {
        self.dispatch(|conn| async move { conn.stats().await })
            .await
    }

    pub async fn list_tubes(&mut self) -> Result<Vec<String>> {
        self.dispatch(|conn| async move { conn.list_tubes().await })
            .await
    }

    pub async fn pause_tube(&mut self, tube: &str, delay: u32) -> Result<bool> {
        self.dispatch(|conn| {
            let tube = tube.to_owned();
            async move { conn.pause_tube(&tube, delay).await }
        })
        .await
    }
}

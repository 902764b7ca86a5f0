//! A pool of reconnecting clients shared by many logical sessions.
//!
//! Each [`PoolSession`] holds its own tube and watch list. Operations check out
//! a pooled client whose remembered state already matches, or adapt one that
//! doesn't, and return it to the pool when done. A checked-out client belongs
//! to exactly one operation, so sessions never see each other's tube
//! selections.
use std::collections::VecDeque;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::DEFAULT_TUBE;
use crate::error::{Error, Result};
use crate::parser::validate_tube_name;
use crate::session::ReconnectingClient;
use crate::types::job::{Job, JobId, Reservation};
use crate::types::stats::{JobStats, ServerStats, TubeStats};

#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    state: Mutex<PoolState>,
}

struct PoolState {
    /// Idle clients, least recently returned first.
    entries: VecDeque<PoolEntry>,
    last_sweep: Instant,
    closed: bool,
}

/// An idle client. Its tags are the tube and watch list the client remembers.
struct PoolEntry {
    client: ReconnectingClient,
    last_used: Instant,
}

/// What a checkout needs the client's session state to be.
#[derive(Clone, Copy, Debug)]
enum Need<'a> {
    Producer(&'a str),
    Consumer(&'a [String]),
    Any,
}

impl Pool {
    pub fn new(config: Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PoolState {
                    entries: VecDeque::new(),
                    last_sweep: Instant::now(),
                    closed: false,
                }),
            }),
        }
    }

    /// Starts a new logical session using tube `default` and watching only
    /// `default`.
    pub fn session(&self) -> PoolSession {
        PoolSession {
            pool: self.clone(),
            current_tube: DEFAULT_TUBE.to_owned(),
            watch_list: vec![DEFAULT_TUBE.to_owned()],
        }
    }

    /// The number of clients sitting idle in the pool.
    pub fn idle_count(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// Closes every idle client. Clients checked out at the time are closed
    /// as they come back, and any further checkout fails.
    pub fn shutdown(&self) {
        let entries = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            mem::take(&mut state.entries)
        };

        debug!(closing = entries.len(), "pool shut down");
        for mut entry in entries {
            entry.client.close();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Takes the best idle client for `need`, or creates one. No IO happens
    /// here; new clients connect on first use.
    fn take(&self, need: Need) -> Result<Checkout> {
        let reused = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(Error::Connection("pool is shut down".to_owned()));
            }

            let matching = state.entries.iter().position(|entry| {
                let tags = entry.client.state();
                match need {
                    Need::Producer(tube) => tags.current_tube() == tube,
                    Need::Consumer(tubes) => tags.watches_same(tubes),
                    Need::Any => false,
                }
            });

            match matching {
                Some(idx) => state.entries.remove(idx),
                None => state.entries.pop_front(),
            }
        };

        let client = match reused {
            Some(entry) => {
                debug!(?need, tags = ?entry.client.state(), "checked out");
                entry.client
            },
            None => {
                debug!(?need, "pool empty, creating client");
                ReconnectingClient::new(self.shared.config.clone())
            },
        };

        Ok(Checkout {
            pool: self.clone(),
            client: Some(client),
            keep: false,
        })
    }

    /// Checks out a client using `tube`.
    async fn producer(&self, tube: &str) -> Result<Checkout> {
        let mut checkout = self.take(Need::Producer(tube))?;
        if checkout.state().current_tube() == tube {
            return Ok(checkout);
        }

        // Any early return drops the checkout unfinished, which closes the
        // client.
        let using = checkout.use_tube(tube).await?;
        if using != tube {
            warn!(requested = tube, %using, "server selected the wrong tube");
            return Err(Error::UnexpectedResponse(format!("USING {using}")));
        }
        Ok(checkout)
    }

    /// Checks out a client watching exactly `tubes`.
    async fn consumer(&self, tubes: &[String]) -> Result<Checkout> {
        let mut checkout = self.take(Need::Consumer(tubes))?;
        if checkout.state().watches_same(tubes) {
            return Ok(checkout);
        }

        reconcile_watch_list(&mut checkout, tubes).await?;
        Ok(checkout)
    }

    /// Checks out any client, for operations that don't depend on the tube in
    /// use or the watch list.
    fn any(&self) -> Result<Checkout> {
        self.take(Need::Any)
    }

    fn checkin(&self, mut client: ReconnectingClient) {
        let now = Instant::now();

        let evicted = {
            let mut state = self.shared.state.lock();
            if state.closed {
                drop(state);
                client.close();
                return;
            }

            state.entries.push_back(PoolEntry {
                client,
                last_used: now,
            });

            let since_sweep = now.duration_since(state.last_sweep);
            if since_sweep < self.shared.config.sweep_interval {
                return;
            }
            state.last_sweep = now;

            let idle_timeout = self.shared.config.idle_timeout;
            let (kept, evicted): (VecDeque<_>, VecDeque<_>) =
                state.entries.drain(..).partition(|entry| {
                    now.duration_since(entry.last_used) <= idle_timeout
                });
            state.entries = kept;
            evicted
        };

        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "closed idle connections");
        }
        for mut entry in evicted {
            entry.client.close();
        }
    }
}

/// Watches missing tubes before ignoring extra ones, so the server is never
/// asked to ignore the last tube watched.
async fn reconcile_watch_list(
    client: &mut ReconnectingClient,
    tubes: &[String],
) -> Result<()> {
    for tube in tubes {
        if !client.state().watches(tube) {
            client.watch(tube).await?;
        }
    }

    let extra: Vec<String> = client
        .state()
        .watch_list()
        .iter()
        .filter(|tube| !tubes.contains(tube))
        .cloned()
        .collect();
    for tube in extra {
        client.ignore(&tube).await?;
    }

    if client.state().watches_same(tubes) {
        Ok(())
    } else {
        Err(Error::UnexpectedResponse(format!(
            "watch list {:?} could not be changed to {tubes:?}",
            client.state().watch_list()
        )))
    }
}

/// A client checked out of a [`Pool`].
///
/// Only a checkout passed through [`Checkout::finish`] goes back to the pool.
/// One dropped any other way, such as a cancelled operation, may have a
/// command still on the wire or a session state its tags don't record, so
/// its client is closed instead.
struct Checkout {
    pool: Pool,
    /// `None` only once dropped.
    client: Option<ReconnectingClient>,
    keep: bool,
}

impl Checkout {
    /// Passes `res` through, keeping the client unless it misbehaved.
    fn finish<T>(mut self, res: Result<T>) -> Result<T> {
        match &res {
            Err(error @ Error::UnexpectedResponse(_)) => {
                warn!(%error, "discarding pooled client");
            },
            _ => self.keep = true,
        }
        res
    }
}

impl Deref for Checkout {
    type Target = ReconnectingClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref().expect("client is only taken on drop")
    }
}

impl DerefMut for Checkout {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client.as_mut().expect("client is only taken on drop")
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        let Some(mut client) = self.client.take() else {
            return;
        };

        if self.keep {
            self.pool.checkin(client);
        } else {
            debug!(tags = ?client.state(), "closing unfinished checkout");
            client.close();
        }
    }
}

/// One caller's view of a [`Pool`]. The tube and watch list live here, not on
/// any connection: selecting a tube or changing the watch list is purely
/// local, and takes effect on the next operation that needs it.
#[derive(Clone)]
pub struct PoolSession {
    pool: Pool,
    current_tube: String,
    watch_list: Vec<String>,
}

impl PoolSession {
    pub fn current_tube(&self) -> &str {
        &self.current_tube
    }

    pub fn use_tube(&mut self, tube: &str) -> Result<String> {
        validate_tube_name(tube)?;
        self.current_tube = tube.to_owned();
        Ok(self.current_tube.clone())
    }

    /// Adds `tube` to this session's watch list, returning how many tubes
    /// are watched.
    pub fn watch(&mut self, tube: &str) -> Result<u32> {
        validate_tube_name(tube)?;
        if !self.watch_list.iter().any(|t| t == tube) {
            self.watch_list.push(tube.to_owned());
        }
        Ok(self.watch_list.len() as u32)
    }

    /// Removes `tube` from this session's watch list. Returns false, leaving
    /// the list as it was, if the tube isn't watched or is the only one.
    pub fn ignore(&mut self, tube: &str) -> Result<bool> {
        validate_tube_name(tube)?;
        let watched = self.watch_list.iter().any(|t| t == tube);
        if !watched || self.watch_list.len() == 1 {
            return Ok(false);
        }
        self.watch_list.retain(|t| t != tube);
        Ok(true)
    }

    /// A copy of this session's watch list.
    pub fn watch_list(&self) -> Vec<String> {
        self.watch_list.clone()
    }

    pub async fn put(
        &self,
        data: impl Into<Bytes>,
        pri: u32,
        delay: u32,
        ttr: u32,
    ) -> Result<JobId> {
        let mut checkout = self.pool.producer(&self.current_tube).await?;
        let res = checkout.put(data, pri, delay, ttr).await;
        checkout.finish(res)
    }

    /// Puts a job into `tube` without changing this session's tube.
    pub async fn put_in(
        &self,
        tube: &str,
        data: impl Into<Bytes>,
        pri: u32,
        delay: u32,
        ttr: u32,
    ) -> Result<JobId> {
        validate_tube_name(tube)?;
        let mut checkout = self.pool.producer(tube).await?;
        let res = checkout.put(data, pri, delay, ttr).await;
        checkout.finish(res)
    }

    pub async fn reserve(&self, timeout: Option<u32>) -> Result<Reservation> {
        let mut checkout = self.pool.consumer(&self.watch_list).await?;
        let res = checkout.reserve(timeout).await;
        checkout.finish(res)
    }

    pub async fn delete(&self, id: JobId) -> Result<bool> {
        let mut checkout = self.pool.any()?;
        let res = checkout.delete(id).await;
        checkout.finish(res)
    }

    pub async fn release(
        &self,
        id: JobId,
        pri: u32,
        delay: u32,
    ) -> Result<bool> {
        let mut checkout = self.pool.any()?;
        let res = checkout.release(id, pri, delay).await;
        checkout.finish(res)
    }

    pub async fn bury(&self, id: JobId, pri: u32) -> Result<bool> {
        let mut checkout = self.pool.any()?;
        let res = checkout.bury(id, pri).await;
        checkout.finish(res)
    }

    pub async fn touch(&self, id: JobId) -> Result<bool> {
        let mut checkout = self.pool.any()?;
        let res = checkout.touch(id).await;
        checkout.finish(res)
    }

    pub async fn peek(&self, id: JobId) -> Result<Option<Job>> {
        let mut checkout = self.pool.any()?;
        let res = checkout.peek(id).await;
        checkout.finish(res)
    }

    // The server answers peek-ready/-delayed/-buried and kick from the tube
    // in use, so these need a producer checkout.

    pub async fn peek_ready(&self) -> Result<Option<Job>> {
        let mut checkout = self.pool.producer(&self.current_tube).await?;
        let res = checkout.peek_ready().await;
        checkout.finish(res)
    }

    pub async fn peek_delayed(&self) -> Result<Option<Job>> {
        let mut checkout = self.pool.producer(&self.current_tube).await?;
        let res = checkout.peek_delayed().await;
        checkout.finish(res)
    }

    pub async fn peek_buried(&self) -> Result<Option<Job>> {
        let mut checkout = self.pool.producer(&self.current_tube).await?;
        let res = checkout.peek_buried().await;
        checkout.finish(res)
    }

    pub async fn kick(&self, bound: u64) -> Result<u64> {
        let mut checkout = self.pool.producer(&self.current_tube).await?;
        let res = checkout.kick(bound).await;
        checkout.finish(res)
    }

    pub async fn kick_job(&self, id: JobId) -> Result<bool> {
        let mut checkout = self.pool.any()?;
        let res = checkout.kick_job(id).await;
        checkout.finish(res)
    }

    pub async fn stats_job(&self, id: JobId) -> Result<Option<JobStats>> {
        let mut checkout = self.pool.any()?;
        let res = checkout.stats_job(id).await;
        checkout.finish(res)
    }

    pub async fn stats_tube(&self, tube: &str) -> Result<Option<TubeStats>> {
        let mut checkout = self.pool.any()?;
        let res = checkout.stats_tube(tube).await;
        checkout.finish(res)
    }

    pub async fn stats(&self) -> Result<ServerStats> {
        let mut checkout = self.pool.any()?;
        let res = checkout.stats().await;
        checkout.finish(res)
    }

    pub async fn list_tubes(&self) -> Result<Vec<String>> {
        let mut checkout = self.pool.any()?;
        let res = checkout.list_tubes().await;
        checkout.finish(res)
    }

    pub async fn pause_tube(&self, tube: &str, delay: u32) -> Result<bool> {
        let mut checkout = self.pool.any()?;
        let res = checkout.pause_tube(tube, delay).await;
        checkout.finish(res)
    }
}

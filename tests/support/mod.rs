//! An in-process stand-in for beanstalkd, covering the commands the client
//! sends. Jobs live in memory; delays, TTRs and pauses run on wall-clock time.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use enchanted_beans_client::Config;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::Level;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub struct FakeServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    stop: CancellationToken,
}

struct Shared {
    store: Mutex<Store>,
    /// Cancelled to drop every open connection; replaced straight after so
    /// new connections survive.
    sever: Mutex<CancellationToken>,
    /// Request lines (without CRLF) answered out of the ordinary.
    scripted: Mutex<HashMap<String, Scripted>>,
}

#[derive(Clone, Default)]
struct Scripted {
    delay: Duration,
    reply: Option<String>,
}

impl FakeServer {
    pub async fn start() -> anyhow::Result<Self> {
        init_tracing();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            store: Mutex::new(Store::new()),
            sever: Mutex::new(CancellationToken::new()),
            scripted: Mutex::new(HashMap::new()),
        });
        let stop = CancellationToken::new();

        {
            let shared = shared.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    let stream = select! {
                        _ = stop.cancelled() => return,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => stream,
                            Err(_) => return,
                        },
                    };

                    let sever = shared.sever.lock().clone();
                    let conn_id = {
                        let mut store = shared.store.lock();
                        store.total_connections += 1;
                        store.current_connections += 1;
                        store.total_connections as u64
                    };
                    tokio::spawn(serve(stream, shared.clone(), conn_id, sever));
                }
            });
        }

        Ok(Self { addr, shared, stop })
    }

    pub fn config(&self) -> Config {
        Config::builder()
            .host(self.addr.ip().to_string())
            .port(self.addr.port())
            .connect_timeout(Duration::from_secs(2))
            .build()
    }

    /// Drops every connection currently open.
    pub fn sever_all(&self) {
        let mut sever = self.shared.sever.lock();
        sever.cancel();
        *sever = CancellationToken::new();
    }

    pub fn total_connections(&self) -> usize {
        self.shared.store.lock().total_connections
    }

    pub fn current_connections(&self) -> usize {
        self.shared.store.lock().current_connections
    }

    pub fn set_draining(&self, draining: bool) {
        self.shared.store.lock().draining = draining;
    }

    /// Holds back the reply to `request` (e.g. `use slow`) for `delay`. The
    /// command still takes effect once the delay is over.
    pub fn delay_reply(&self, request: &str, delay: Duration) {
        self.shared
            .scripted
            .lock()
            .entry(request.to_owned())
            .or_default()
            .delay = delay;
    }

    /// Answers `request` with `reply` instead of carrying it out.
    pub fn override_reply(&self, request: &str, reply: &str) {
        self.shared
            .scripted
            .lock()
            .entry(request.to_owned())
            .or_default()
            .reply = Some(reply.to_owned());
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.stop.cancel();
        self.shared.sever.lock().cancel();
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Ready,
    Delayed,
    Reserved,
    Buried,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Delayed => "delayed",
            Self::Reserved => "reserved",
            Self::Buried => "buried",
        }
    }
}

struct StoredJob {
    id: u64,
    tube: String,
    pri: u32,
    delay: u32,
    ttr: u32,
    data: Bytes,
    state: State,
    created: Instant,
    ready_at: Instant,
    deadline: Instant,
    reserved_by: Option<u64>,
    reserves: u64,
    timeouts: u64,
    releases: u64,
    buries: u64,
    kicks: u64,
}

struct Store {
    next_id: u64,
    jobs: BTreeMap<u64, StoredJob>,
    tubes: BTreeSet<String>,
    paused: HashMap<String, Instant>,
    draining: bool,
    current_connections: usize,
    total_connections: usize,
}

impl Store {
    fn new() -> Self {
        Self {
            next_id: 1,
            jobs: BTreeMap::new(),
            tubes: BTreeSet::from(["default".to_owned()]),
            paused: HashMap::new(),
            draining: false,
            current_connections: 0,
            total_connections: 0,
        }
    }

    /// Applies every delay and TTR expiry due by `now`.
    fn tick(&mut self, now: Instant) {
        for job in self.jobs.values_mut() {
            match job.state {
                State::Delayed if job.ready_at <= now => {
                    job.state = State::Ready;
                },
                State::Reserved if job.deadline <= now => {
                    job.state = State::Ready;
                    job.reserved_by = None;
                    job.timeouts += 1;
                },
                _ => {},
            }
        }
    }

    fn is_paused(&self, tube: &str, now: Instant) -> bool {
        self.paused.get(tube).is_some_and(|until| *until > now)
    }

    fn owned_by(&mut self, id: u64, conn_id: u64) -> Option<&mut StoredJob> {
        self.jobs.get_mut(&id).filter(|job| {
            job.state == State::Reserved && job.reserved_by == Some(conn_id)
        })
    }

    fn try_reserve(
        &mut self,
        client: &ClientState,
        now: Instant,
    ) -> Option<(u64, Bytes)> {
        self.tick(now);

        let id = self
            .jobs
            .values()
            .filter(|job| {
                job.state == State::Ready
                    && client.watching.contains(&job.tube)
                    && !self.is_paused(&job.tube, now)
            })
            .min_by_key(|job| (job.pri, job.id))?
            .id;

        let job = self.jobs.get_mut(&id)?;
        job.state = State::Reserved;
        job.reserved_by = Some(client.id);
        job.deadline = now + Duration::from_secs(job.ttr.max(1).into());
        job.reserves += 1;
        Some((job.id, job.data.clone()))
    }

    fn release_all(&mut self, conn_id: u64) {
        for job in self.jobs.values_mut() {
            if job.reserved_by == Some(conn_id) {
                job.state = State::Ready;
                job.reserved_by = None;
            }
        }
    }

    /// Jobs in `state` in the tube `client` is using.
    fn in_use<'a>(
        &'a self,
        client: &'a ClientState,
        state: State,
    ) -> impl Iterator<Item = &'a StoredJob> {
        self.jobs
            .values()
            .filter(move |job| job.tube == client.using && job.state == state)
    }

    fn count(&self, tube: &str, state: State) -> usize {
        self.jobs
            .values()
            .filter(|job| job.tube == tube && job.state == state)
            .count()
    }
}

struct ClientState {
    id: u64,
    using: String,
    watching: Vec<String>,
}

async fn serve(
    stream: TcpStream,
    shared: Arc<Shared>,
    conn_id: u64,
    sever: CancellationToken,
) {
    let (r, mut w) = stream.into_split();
    let mut r = BufReader::new(r);
    let mut client = ClientState {
        id: conn_id,
        using: "default".to_owned(),
        watching: vec!["default".to_owned()],
    };

    loop {
        let step = next_reply(&mut r, &shared, &mut client);
        let reply = select! {
            _ = sever.cancelled() => break,
            reply = step => match reply {
                Some(reply) => reply,
                None => break,
            },
        };

        if w.write_all(&reply).await.is_err() {
            break;
        }
    }

    let mut store = shared.store.lock();
    store.current_connections -= 1;
    store.release_all(conn_id);
}

/// Reads one command and computes its reply. `None` means the client has
/// gone away.
async fn next_reply(
    r: &mut BufReader<OwnedReadHalf>,
    shared: &Shared,
    client: &mut ClientState,
) -> Option<Vec<u8>> {
    let mut raw = Vec::new();
    if r.read_until(b'\n', &mut raw).await.ok()? == 0 {
        return None;
    }
    let text = String::from_utf8_lossy(&raw);
    let Some(text) = text.strip_suffix("\r\n") else {
        return Some(line("BAD_FORMAT"));
    };

    let scripted = shared.scripted.lock().get(text).cloned();
    if let Some(scripted) = scripted {
        tokio::time::sleep(scripted.delay).await;
        if let Some(reply) = scripted.reply {
            return Some(line(reply));
        }
    }

    let parts: Vec<&str> = text.split(' ').collect();
    let args = &parts[1..];

    match parts[0] {
        "put" => {
            let Some([pri, delay, ttr, len]) = numbers::<4>(args) else {
                return Some(line("BAD_FORMAT"));
            };
            let mut data = vec![0u8; len as usize + 2];
            r.read_exact(&mut data).await.ok()?;
            if &data[len as usize..] != b"\r\n" {
                return Some(line("EXPECTED_CRLF"));
            }
            data.truncate(len as usize);
            let (pri, delay, ttr) = (pri as u32, delay as u32, ttr as u32);
            Some(put(shared, client, pri, delay, ttr, data))
        },
        "reserve" if args.is_empty() => {
            Some(reserve(shared, client, None).await)
        },
        "reserve-with-timeout" => match numbers::<1>(args) {
            Some([timeout]) => {
                Some(reserve(shared, client, Some(timeout)).await)
            },
            None => Some(line("BAD_FORMAT")),
        },
        _ => Some(command(shared, client, parts[0], args)),
    }
}

fn put(
    shared: &Shared,
    client: &ClientState,
    pri: u32,
    delay: u32,
    ttr: u32,
    data: Vec<u8>,
) -> Vec<u8> {
    let mut store = shared.store.lock();
    if data.len() > 65536 {
        return line("JOB_TOO_BIG");
    }
    if store.draining {
        return line("DRAINING");
    }

    let now = Instant::now();
    let id = store.next_id;
    store.next_id += 1;
    store.jobs.insert(
        id,
        StoredJob {
            id,
            tube: client.using.clone(),
            pri,
            delay,
            ttr,
            data: data.into(),
            state: if delay > 0 { State::Delayed } else { State::Ready },
            created: now,
            ready_at: now + Duration::from_secs(delay.into()),
            deadline: now,
            reserved_by: None,
            reserves: 0,
            timeouts: 0,
            releases: 0,
            buries: 0,
            kicks: 0,
        },
    );
    line(format!("INSERTED {id}"))
}

async fn reserve(
    shared: &Shared,
    client: &ClientState,
    timeout: Option<u64>,
) -> Vec<u8> {
    let give_up =
        timeout.map(|secs| Instant::now() + Duration::from_secs(secs));

    loop {
        let now = Instant::now();
        let reserved = shared.store.lock().try_reserve(client, now);
        if let Some((id, data)) = reserved {
            return with_data(format!("RESERVED {id}"), &data);
        }
        if give_up.is_some_and(|give_up| give_up <= now) {
            return line("TIMED_OUT");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn command(
    shared: &Shared,
    client: &mut ClientState,
    name: &str,
    args: &[&str],
) -> Vec<u8> {
    let now = Instant::now();
    let mut store = shared.store.lock();
    store.tick(now);

    match (name, args) {
        ("use", [tube]) => {
            store.tubes.insert(tube.to_string());
            client.using = tube.to_string();
            line(format!("USING {tube}"))
        },
        ("list-tube-used", []) => line(format!("USING {}", client.using)),
        ("watch", [tube]) => {
            store.tubes.insert(tube.to_string());
            if !client.watching.iter().any(|t| t == tube) {
                client.watching.push(tube.to_string());
            }
            line(format!("WATCHING {}", client.watching.len()))
        },
        ("ignore", [tube]) => {
            let watched = client.watching.iter().any(|t| t == tube);
            if watched && client.watching.len() < 2 {
                return line("NOT_IGNORED");
            }
            client.watching.retain(|t| t != tube);
            line(format!("WATCHING {}", client.watching.len()))
        },
        ("list-tubes-watched", []) => yaml_list(&client.watching),
        ("list-tubes", []) => {
            let tubes: Vec<String> = store.tubes.iter().cloned().collect();
            yaml_list(&tubes)
        },
        ("delete", [id]) => {
            let Ok(id) = id.parse::<u64>() else {
                return line("BAD_FORMAT");
            };
            let deletable = store.jobs.get(&id).is_some_and(|job| {
                job.state != State::Reserved
                    || job.reserved_by == Some(client.id)
            });
            if deletable {
                store.jobs.remove(&id);
                line("DELETED")
            } else {
                line("NOT_FOUND")
            }
        },
        ("release", [id, pri, delay]) => {
            let (Ok(id), Ok(pri), Ok(delay)) =
                (id.parse::<u64>(), pri.parse::<u32>(), delay.parse::<u32>())
            else {
                return line("BAD_FORMAT");
            };
            let Some(job) = store.owned_by(id, client.id) else {
                return line("NOT_FOUND");
            };
            job.pri = pri;
            job.delay = delay;
            job.reserved_by = None;
            job.releases += 1;
            if delay > 0 {
                job.state = State::Delayed;
                job.ready_at = now + Duration::from_secs(delay.into());
            } else {
                job.state = State::Ready;
            }
            line("RELEASED")
        },
        ("bury", [id, pri]) => {
            let (Ok(id), Ok(pri)) = (id.parse::<u64>(), pri.parse::<u32>())
            else {
                return line("BAD_FORMAT");
            };
            let Some(job) = store.owned_by(id, client.id) else {
                return line("NOT_FOUND");
            };
            job.pri = pri;
            job.state = State::Buried;
            job.reserved_by = None;
            job.buries += 1;
            line("BURIED")
        },
        ("touch", [id]) => {
            let Ok(id) = id.parse::<u64>() else {
                return line("BAD_FORMAT");
            };
            let Some(job) = store.owned_by(id, client.id) else {
                return line("NOT_FOUND");
            };
            job.deadline = now + Duration::from_secs(job.ttr.max(1).into());
            line("TOUCHED")
        },
        ("peek", [id]) => {
            let Ok(id) = id.parse::<u64>() else {
                return line("BAD_FORMAT");
            };
            match store.jobs.get(&id) {
                Some(job) => with_data(format!("FOUND {id}"), &job.data),
                None => line("NOT_FOUND"),
            }
        },
        ("peek-ready", []) => found(
            store
                .in_use(client, State::Ready)
                .min_by_key(|job| (job.pri, job.id)),
        ),
        ("peek-delayed", []) => found(
            store
                .in_use(client, State::Delayed)
                .min_by_key(|job| (job.ready_at, job.id)),
        ),
        ("peek-buried", []) => {
            found(store.in_use(client, State::Buried).next())
        },
        ("kick", [bound]) => {
            let Ok(bound) = bound.parse::<usize>() else {
                return line("BAD_FORMAT");
            };
            let from = if store.count(&client.using, State::Buried) > 0 {
                State::Buried
            } else {
                State::Delayed
            };
            let mut kicked = 0;
            for job in store.jobs.values_mut() {
                if kicked == bound {
                    break;
                }
                if job.tube == client.using && job.state == from {
                    job.state = State::Ready;
                    job.kicks += 1;
                    kicked += 1;
                }
            }
            line(format!("KICKED {kicked}"))
        },
        ("kick-job", [id]) => {
            let Ok(id) = id.parse::<u64>() else {
                return line("BAD_FORMAT");
            };
            match store.jobs.get_mut(&id) {
                Some(job)
                    if matches!(job.state, State::Buried | State::Delayed) =>
                {
                    job.state = State::Ready;
                    job.kicks += 1;
                    line("KICKED")
                },
                _ => line("NOT_FOUND"),
            }
        },
        ("stats-job", [id]) => {
            let Ok(id) = id.parse::<u64>() else {
                return line("BAD_FORMAT");
            };
            let Some(job) = store.jobs.get(&id) else {
                return line("NOT_FOUND");
            };
            let time_left = match job.state {
                State::Reserved => job.deadline.saturating_duration_since(now),
                State::Delayed => job.ready_at.saturating_duration_since(now),
                _ => Duration::ZERO,
            };
            yaml_dict(&[
                ("id", job.id.to_string()),
                ("tube", format!("\"{}\"", job.tube)),
                ("state", job.state.name().to_owned()),
                ("pri", job.pri.to_string()),
                ("age", now.duration_since(job.created).as_secs().to_string()),
                ("delay", job.delay.to_string()),
                ("ttr", job.ttr.to_string()),
                ("time-left", time_left.as_secs().to_string()),
                ("file", "0".to_owned()),
                ("reserves", job.reserves.to_string()),
                ("timeouts", job.timeouts.to_string()),
                ("releases", job.releases.to_string()),
                ("buries", job.buries.to_string()),
                ("kicks", job.kicks.to_string()),
            ])
        },
        ("stats-tube", [tube]) => {
            if !store.tubes.contains(*tube) {
                return line("NOT_FOUND");
            }
            let pause_time_left = store
                .paused
                .get(*tube)
                .map(|until| until.saturating_duration_since(now).as_secs())
                .unwrap_or(0);
            let count = |state| store.count(tube, state).to_string();
            yaml_dict(&[
                ("name", format!("\"{tube}\"")),
                ("current-jobs-ready", count(State::Ready)),
                ("current-jobs-reserved", count(State::Reserved)),
                ("current-jobs-delayed", count(State::Delayed)),
                ("current-jobs-buried", count(State::Buried)),
                ("pause-time-left", pause_time_left.to_string()),
            ])
        },
        ("stats", []) => {
            let ready = store
                .jobs
                .values()
                .filter(|job| job.state == State::Ready)
                .count();
            yaml_dict(&[
                ("current-jobs-ready", ready.to_string()),
                ("total-jobs", (store.next_id - 1).to_string()),
                ("current-tubes", store.tubes.len().to_string()),
                ("current-connections", store.current_connections.to_string()),
                ("total-connections", store.total_connections.to_string()),
                ("version", "\"fake\"".to_owned()),
                ("draining", store.draining.to_string()),
            ])
        },
        ("pause-tube", [tube, delay]) => {
            let Ok(delay) = delay.parse::<u64>() else {
                return line("BAD_FORMAT");
            };
            if !store.tubes.contains(*tube) {
                return line("NOT_FOUND");
            }
            let until = now + Duration::from_secs(delay);
            store.paused.insert(tube.to_string(), until);
            line("PAUSED")
        },
        _ => line("UNKNOWN_COMMAND"),
    }
}

fn numbers<const N: usize>(args: &[&str]) -> Option<[u64; N]> {
    if args.len() != N {
        return None;
    }
    let mut out = [0u64; N];
    for (slot, arg) in out.iter_mut().zip(args) {
        *slot = arg.parse().ok()?;
    }
    Some(out)
}

fn found(job: Option<&StoredJob>) -> Vec<u8> {
    match job {
        Some(job) => with_data(format!("FOUND {}", job.id), &job.data),
        None => line("NOT_FOUND"),
    }
}

fn line(text: impl Display) -> Vec<u8> {
    format!("{text}\r\n").into_bytes()
}

fn with_data(head: String, data: &[u8]) -> Vec<u8> {
    let mut out = format!("{head} {}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

fn yaml_list(items: &[String]) -> Vec<u8> {
    let mut body = String::from("---\n");
    for item in items {
        body.push_str(&format!("- {item}\n"));
    }
    with_data("OK".to_owned(), body.as_bytes())
}

fn yaml_dict(pairs: &[(&str, String)]) -> Vec<u8> {
    let mut body = String::from("---\n");
    for (key, value) in pairs {
        body.push_str(&format!("{key}: {value}\n"));
    }
    with_data("OK".to_owned(), body.as_bytes())
}

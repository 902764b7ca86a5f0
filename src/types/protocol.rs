use bytes::Bytes;

use super::job::JobId;
use super::serialisable::BeanstalkSerialisable;

/// A request the client sends. Serialised with [`BeanstalkSerialisable`];
/// the comment on each variant gives its wire form and the replies it can get
/// besides the generic server errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BeanstalkCommand {
    /// `put <pri> <delay> <ttr> <n_bytes>`, then the body and a CRLF. Goes to
    /// the tube in use.
    ///
    /// Replies: `INSERTED <id>`, `BURIED <id>`, `JOB_TOO_BIG`, `DRAINING`,
    /// `EXPECTED_CRLF`.
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        data: Bytes,
    },
    /// `reserve`: waits as long as it takes for a job on a watched tube.
    ///
    /// Replies: `RESERVED <id> <n_bytes>` plus body, `DEADLINE_SOON`.
    Reserve,
    /// `reserve-with-timeout <seconds>`: zero polls without waiting.
    ///
    /// Replies: as `reserve`, or `TIMED_OUT`.
    ReserveWithTimeout { timeout: u32 },
    /// `release <id> <pri> <delay>`, for a job this connection reserved.
    ///
    /// Replies: `RELEASED`, `BURIED` (no memory to requeue), `NOT_FOUND`.
    Release { id: JobId, pri: u32, delay: u32 },
    /// `delete <id>`. Reserved jobs can only be deleted by their reserver.
    ///
    /// Replies: `DELETED`, `NOT_FOUND`.
    Delete { id: JobId },
    /// `bury <id> <pri>`, for a job this connection reserved.
    ///
    /// Replies: `BURIED`, `NOT_FOUND`.
    Bury { id: JobId, pri: u32 },
    /// `touch <id>`: restarts the TTR of a job this connection reserved.
    ///
    /// Replies: `TOUCHED`, `NOT_FOUND`.
    Touch { id: JobId },
    /// `watch <tube>`. Replies `WATCHING <count>`.
    Watch { tube: String },
    /// `ignore <tube>`.
    ///
    /// Replies: `WATCHING <count>`, or `NOT_IGNORED` for the last tube
    /// watched.
    Ignore { tube: String },
    /// `peek <id>`: any job, whatever its state.
    ///
    /// Replies: `FOUND <id> <n_bytes>` plus body, `NOT_FOUND`. The same goes
    /// for the rest of the peek family, which look only at the tube in use.
    Peek { id: JobId },
    /// `peek-ready`
    PeekReady,
    /// `peek-delayed`
    PeekDelayed,
    /// `peek-buried`
    PeekBuried,
    /// `kick <bound>`: readies up to `bound` buried jobs in the tube in use,
    /// or delayed ones if none are buried. Replies `KICKED <count>`.
    Kick { bound: u64 },
    /// `kick-job <id>`
    ///
    /// Replies: `KICKED`, `NOT_FOUND`.
    KickJob { id: JobId },
    /// `stats-job <id>`
    ///
    /// Replies: `OK <n_bytes>` plus a YAML dictionary, `NOT_FOUND`.
    StatsJob { id: JobId },
    /// `stats-tube <tube>`
    ///
    /// Replies: `OK <n_bytes>` plus a YAML dictionary, `NOT_FOUND`.
    StatsTube { tube: String },
    /// `stats`. Replies `OK <n_bytes>` plus a YAML dictionary.
    StatsServer,
    /// `list-tubes`. Replies `OK <n_bytes>` plus a YAML list.
    ListTubes,
    /// `list-tube-used`. Replies `USING <tube>`.
    ListTubeUsed,
    /// `list-tubes-watched`. Replies `OK <n_bytes>` plus a YAML list.
    ListTubesWatched,
    /// `pause-tube <tube> <delay>`: no reservations from `tube` for `delay`
    /// seconds.
    ///
    /// Replies: `PAUSED`, `NOT_FOUND`.
    PauseTube { tube: String, delay: u32 },
    /// `use <tube>`. Replies `USING <tube>`.
    Use { tube: String },
}

impl BeanstalkCommand {
    /// Decides whether `line`, received in reply to this command, is followed
    /// by a data block.
    pub fn expects_payload(&self, line: &ResponseLine) -> bool {
        use BeanstalkCommand::*;

        match self {
            Reserve | ReserveWithTimeout { .. } => {
                matches!(line, ResponseLine::Reserved { .. })
            },
            Peek { .. } | PeekReady | PeekDelayed | PeekBuried => {
                matches!(line, ResponseLine::Found { .. })
            },
            StatsJob { .. }
            | StatsTube { .. }
            | StatsServer
            | ListTubes
            | ListTubesWatched => matches!(line, ResponseLine::Ok { .. }),
            _ => false,
        }
    }
}

impl BeanstalkSerialisable for BeanstalkCommand {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        use BeanstalkCommand::*;

        match self {
            Put {
                pri,
                delay,
                ttr,
                data,
            } => [
                format!("put {pri} {delay} {ttr} {}\r\n", data.len())
                    .as_bytes(),
                &data[..],
                &b"\r\n"[..],
            ]
            .concat(),
            Reserve => b"reserve\r\n".to_vec(),
            ReserveWithTimeout { timeout } => {
                format!("reserve-with-timeout {timeout}\r\n").into()
            },
            Release { id, pri, delay } => {
                format!("release {id} {pri} {delay}\r\n").into()
            },
            Delete { id } => format!("delete {id}\r\n").into(),
            Bury { id, pri } => format!("bury {id} {pri}\r\n").into(),
            Touch { id } => format!("touch {id}\r\n").into(),
            Watch { tube } => format!("watch {tube}\r\n").into(),
            Ignore { tube } => format!("ignore {tube}\r\n").into(),
            Peek { id } => format!("peek {id}\r\n").into(),
            PeekReady => b"peek-ready\r\n".to_vec(),
            PeekDelayed => b"peek-delayed\r\n".to_vec(),
            PeekBuried => b"peek-buried\r\n".to_vec(),
            Kick { bound } => format!("kick {bound}\r\n").into(),
            KickJob { id } => format!("kick-job {id}\r\n").into(),
            StatsJob { id } => format!("stats-job {id}\r\n").into(),
            StatsTube { tube } => format!("stats-tube {tube}\r\n").into(),
            StatsServer => b"stats\r\n".to_vec(),
            ListTubes => b"list-tubes\r\n".to_vec(),
            ListTubeUsed => b"list-tube-used\r\n".to_vec(),
            ListTubesWatched => b"list-tubes-watched\r\n".to_vec(),
            PauseTube { tube, delay } => {
                format!("pause-tube {tube} {delay}\r\n").into()
            },
            Use { tube } => format!("use {tube}\r\n").into(),
        }
    }
}

/// A status line sent by the server, parsed from the bytes before the CRLF.
/// Data blocks that follow `RESERVED`, `FOUND` and `OK` are carried
/// separately in a [`crate::codec::Response`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResponseLine {
    /// On the wire: `OUT_OF_MEMORY`.
    OutOfMemory,
    /// On the wire: `INTERNAL_ERROR`.
    InternalError,
    /// On the wire: `BAD_FORMAT`.
    BadFormat,
    /// On the wire: `UNKNOWN_COMMAND`.
    UnknownCommand,
    /// In response to a `put`, indicates a job was created with the given ID.
    ///
    /// On the wire: `INSERTED <id>`.
    Inserted { id: JobId },
    /// In response to a `put`, indicates the job couldn't be handled due to
    /// memory pressure and so was immediately buried.
    ///
    /// On the wire: `BURIED <id>`.
    BuriedId { id: JobId },
    /// On the wire: `EXPECTED_CRLF`.
    ExpectedCrlf,
    /// On the wire: `JOB_TOO_BIG`.
    JobTooBig,
    /// On the wire: `DRAINING`.
    Draining,
    /// In response to a `use` or `list-tube-used`.
    ///
    /// On the wire: `USING <tube>`.
    Using { tube: String },
    /// On the wire: `DEADLINE_SOON`.
    DeadlineSoon,
    /// On the wire: `TIMED_OUT`.
    TimedOut,
    /// On the wire: `RESERVED <id> <n_bytes>` plus data.
    Reserved { id: JobId, n_bytes: usize },
    /// On the wire: `NOT_FOUND`.
    NotFound,
    /// On the wire: `DELETED`.
    Deleted,
    /// On the wire: `RELEASED`.
    Released,
    /// In response to a `release`, the job was buried for lack of memory; in
    /// response to a `bury`, success.
    ///
    /// On the wire: `BURIED`.
    Buried,
    /// On the wire: `TOUCHED`.
    Touched,
    /// On the wire: `WATCHING <count>`.
    Watching { count: u32 },
    /// On the wire: `NOT_IGNORED`.
    NotIgnored,
    /// On the wire: `FOUND <id> <n_bytes>` plus data.
    Found { id: JobId, n_bytes: usize },
    /// In response to a `kick`.
    ///
    /// On the wire: `KICKED <count>`.
    KickedCount { count: u64 },
    /// In response to a `kick-job`.
    ///
    /// On the wire: `KICKED`.
    Kicked,
    /// On the wire: `OK <n_bytes>` plus data.
    Ok { n_bytes: usize },
    /// On the wire: `PAUSED`.
    Paused,
}

impl ResponseLine {
    /// The length of the data block announced by the trailing token of this
    /// line, if it announces one.
    pub fn payload_len(&self) -> Option<usize> {
        match self {
            Self::Reserved { n_bytes, .. }
            | Self::Found { n_bytes, .. }
            | Self::Ok { n_bytes } => Some(*n_bytes),
            _ => None,
        }
    }
}

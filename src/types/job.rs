use bytes::Bytes;

/// Server-assigned job identifier.
pub type JobId = u64;

/// A job as returned by `reserve` or one of the `peek` family. Jobs are
/// immutable snapshots: deleting, releasing or burying one is a server-side
/// transition acknowledged by a boolean result.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Job {
    id: JobId,
    data: Bytes,
}

impl Job {
    pub fn new(id: JobId, data: Bytes) -> Self {
        Self { id, data }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }
}

/// The outcome of a `reserve` or `reserve-with-timeout`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reservation {
    Reserved(Job),
    /// A job reserved by this client is about to exceed its TTR.
    DeadlineSoon,
    /// No job became ready before the timeout expired.
    TimedOut,
}

impl Reservation {
    pub fn into_job(self) -> Option<Job> {
        match self {
            Self::Reserved(job) => Some(job),
            _ => None,
        }
    }
}

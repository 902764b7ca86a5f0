use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::job::JobId;
use super::states::JobStatus;
use crate::error::{Error, Result};

/// Parses the YAML dictionary carried by an `OK <n_bytes>` response into one
/// of the stats records below.
pub(crate) fn from_yaml<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_yaml::from_slice(data)
        .map_err(|error| Error::UnexpectedResponse(error.to_string()))
}

/// Reply to `stats-job`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct JobStats {
    pub id: JobId,
    pub tube: String,
    pub state: JobStatus,
    /// Priority as of the most recent put, release or bury.
    #[serde(default)]
    pub pri: u32,

    // Durations, all in whole seconds.
    #[serde(default)]
    pub age: u64,
    /// Left before a delayed job becomes ready.
    #[serde(default)]
    pub delay: u64,
    #[serde(default)]
    pub ttr: u64,
    /// Left before a reserved or delayed job changes state on its own.
    #[serde(default, rename = "time-left")]
    pub time_left: u64,

    /// Oldest binlog file that still holds this job, or 0 without a binlog.
    #[serde(default)]
    pub file: u64,

    // How often the job went through each transition.
    #[serde(default)]
    pub reserves: u64,
    #[serde(default)]
    pub timeouts: u64,
    #[serde(default)]
    pub releases: u64,
    #[serde(default)]
    pub buries: u64,
    #[serde(default)]
    pub kicks: u64,
}

/// Reply to `stats-tube`. Keys the server leaves out read as zero.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct TubeStats {
    pub name: String,
    /// Ready jobs with a priority below 1024.
    pub current_jobs_urgent: u64,
    pub current_jobs_ready: u64,
    pub current_jobs_reserved: u64,
    pub current_jobs_delayed: u64,
    pub current_jobs_buried: u64,
    /// Every job ever put into the tube, deleted ones included.
    pub total_jobs: u64,
    /// Connections whose current tube this is.
    pub current_using: u64,
    /// Watchers blocked in a reserve right now.
    pub current_waiting: u64,
    pub current_watching: u64,
    /// Length in seconds of the current or most recent pause.
    pub pause: u64,
    pub cmd_delete: u64,
    pub cmd_pause_tube: u64,
    pub pause_time_left: u64,
}

/// Reply to `stats`: server-wide counters.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerStats {
    // Jobs currently held, by state.
    pub current_jobs_urgent: u64,
    pub current_jobs_ready: u64,
    pub current_jobs_reserved: u64,
    pub current_jobs_delayed: u64,
    pub current_jobs_buried: u64,

    // Commands received since startup.
    pub cmd_put: u64,
    pub cmd_peek: u64,
    pub cmd_peek_ready: u64,
    pub cmd_peek_delayed: u64,
    pub cmd_peek_buried: u64,
    pub cmd_reserve: u64,
    pub cmd_reserve_with_timeout: u64,
    pub cmd_touch: u64,
    pub cmd_use: u64,
    pub cmd_watch: u64,
    pub cmd_ignore: u64,
    pub cmd_delete: u64,
    pub cmd_release: u64,
    pub cmd_bury: u64,
    pub cmd_kick: u64,
    pub cmd_stats: u64,
    pub cmd_stats_job: u64,
    pub cmd_stats_tube: u64,
    pub cmd_list_tubes: u64,
    pub cmd_list_tube_used: u64,
    pub cmd_list_tubes_watched: u64,
    pub cmd_pause_tube: u64,

    pub job_timeouts: u64,
    pub total_jobs: u64,
    /// Largest body the server accepts from a put.
    pub max_job_size: u64,
    pub current_tubes: u64,

    // Connections. Producers have sent at least one put, workers at least one
    // reserve, and waiting ones are blocked in a reserve.
    pub current_connections: u64,
    pub current_producers: u64,
    pub current_workers: u64,
    pub current_waiting: u64,
    pub total_connections: u64,

    pub pid: u64,
    pub version: String,
    /// CPU seconds spent in user mode.
    pub rusage_utime: f64,
    /// CPU seconds spent in the kernel.
    pub rusage_stime: f64,
    pub uptime: u64,

    // Zero throughout when the server runs without a binlog.
    pub binlog_oldest_index: u64,
    pub binlog_current_index: u64,
    pub binlog_max_size: u64,
    pub binlog_records_written: u64,
    pub binlog_records_migrated: u64,

    /// Set while the server refuses new puts.
    pub draining: bool,
    /// Random per-process identifier.
    pub id: String,
    pub hostname: String,
    pub os: String,
    pub platform: String,
}

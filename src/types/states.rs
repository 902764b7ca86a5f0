use serde::Deserialize;

/// A job's state, as reported by `stats-job`. Never cached client-side.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Ready,
    Delayed,
    Reserved,
    Buried,
}

use thiserror::Error;

/// Errors that can be returned from the construction surface of the simulator.
///
/// Runtime anomalies (a dropped message, a node that refuses a vote) are not
/// errors in this taxonomy — they are normal outcomes reported on the
/// observer bus. Only configuration mistakes and internal plumbing failures
/// are represented here.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid cluster configuration: {0}")]
    InvalidConfiguration(String),

    #[error("node id {0} is out of range for a cluster of this size")]
    UnknownNode(usize),

    #[error("observer callback panicked: {0}")]
    ObserverFault(String),
}

pub type Result<T> = std::result::Result<T, Error>;

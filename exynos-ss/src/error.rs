use std::io;

use thiserror::Error;

/// Failures surfaced by the snapshot engine.
///
/// Hot-path recorders and control-surface stores never return these; they
/// degrade to no-ops instead.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no base address given")]
    NoBaseAddress,

    #[error("invalid base address {0:?}")]
    InvalidBaseAddress(String),

    #[error("failed to reserve {size:#x} bytes at {paddr:#x}: {reason}")]
    Reservation {
        paddr: u64,
        size: usize,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown item or category {0:?}")]
    UnknownName(String),

    #[error("category {0} is not laid out in this region")]
    CategoryAbsent(&'static str),

    #[error("cpu {cpu} out of range (have {nr_cpus})")]
    CpuOutOfRange { cpu: usize, nr_cpus: usize },

    #[error("snapshot framework is disabled")]
    Disabled,

    #[error("malformed snapshot image: {0}")]
    MalformedImage(String),

    #[error("platform halt returned on cpu {0}")]
    HaltReturned(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

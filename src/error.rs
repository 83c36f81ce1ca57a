use thiserror::Error;

// Recoverable failures surface only from explicit operations: machine
// construction, disk insertion, checkpoint save/restore. Scheduler and device
// callbacks are total and never return errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("ROM size {size:#x} does not fit model {model}")]
    RomSize { model: &'static str, size: usize },
    #[error("disk image {filename} has unsupported size {size}")]
    DiskFormat { filename: String, size: usize },
    #[error("drive {0} already holds a disk")]
    DriveOccupied(usize),
    #[error("SCSI target {0} out of range or occupied")]
    ScsiTarget(u8),
    #[error("checkpoint was written by build {found}, this is {expected}")]
    BuildMismatch { expected: String, found: String },
    #[error("checkpoint record {record} failed to restore: {reason}")]
    BadRecord { record: &'static str, reason: String },
    #[error("checkpoint event {source_id}/{event} is not registered")]
    UnknownEvent { source_id: String, event: String },
    #[error("checkpoint truncated or malformed: {0}")]
    Encoding(#[from] bincode::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

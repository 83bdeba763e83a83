// SPDX-License-Identifier: Apache-2.0 OR MIT
// Error surface for configuration and dispatch operations

use std::time::Duration;
use thiserror::Error;

/// Errors reported by the configuration engine, the dispatch queue and
/// the erasure cells.
///
/// Emission itself never returns errors to a call site: a message that
/// cannot be delivered is dropped (best-effort logging). These values
/// surface only from the configuration/dispatch control surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("priority {0} is already occupied by another policy")]
    PriorityOccupied(i32),

    #[error("no policy is registered at priority {0}")]
    UnknownPriority(i32),

    #[error("the policy at priority {0} is not the instance given")]
    PolicyMismatch(i32),

    #[error("queue insert timed out after {0:?}")]
    InsertTimeout(Duration),

    #[error("reader head {0} is already driven by another worker")]
    HeadBusy(usize),

    #[error("failed to spawn dispatch worker: {0}")]
    WorkerSpawn(String),

    #[error("captured value of type `{0}` does not support cloning")]
    CloneUnsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

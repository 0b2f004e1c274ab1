use std::borrow::Cow;

use thiserror::Error;

/// Errors raised while configuring a [`Universe`](crate::universe::Universe)
/// or a [`World`](crate::world::World).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown id")]
    NotFound,
    #[error("entry is already registered")]
    Duplicate,
    #[error("configuration would deadlock: {0}")]
    Deadlock(&'static str),
    #[error("entry is still referenced")]
    InUse,
}

/// Failure reported by a system factory.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SystemInitError {
    message: Cow<'static, str>,
}

impl SystemInitError {
    pub fn new(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors raised by [`SystemGroup::add_systems`](crate::group::SystemGroup::add_systems).
///
/// A failed call leaves the group exactly as it was: every system added by
/// the same call is removed again before the error is returned.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("unknown system id")]
    NotFound,
    #[error("system is already part of the group")]
    Duplicate,
    #[error("system initialization failed: {0}")]
    SystemInit(#[from] SystemInitError),
}

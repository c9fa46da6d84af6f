//! Logical queue addresses.
//!
//! An address names a queue and, optionally, the machine hosting it. The
//! textual form is `queue@machine`; an address without a machine renders as
//! just `queue`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Logical address of a queue or endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    queue: String,
    machine: Option<String>,
}

impl Address {
    /// Create an address for `queue` hosted on `machine`.
    pub fn new(queue: impl Into<String>, machine: impl Into<String>) -> Self {
        let machine = machine.into();
        Self {
            queue: queue.into(),
            machine: if machine.is_empty() {
                None
            } else {
                Some(machine)
            },
        }
    }

    /// Create an address with no machine part.
    pub fn local(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            machine: None,
        }
    }

    /// Parse `queue@machine` or `queue`.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidAddress("empty address".to_string()));
        }

        match s.split_once('@') {
            Some((queue, _)) if queue.is_empty() => {
                Err(Error::InvalidAddress(format!("missing queue name: {s}")))
            }
            Some((queue, machine)) if machine.contains('@') => Err(Error::InvalidAddress(
                format!("more than one '@' in address: {queue}@{machine}"),
            )),
            Some((queue, machine)) => Ok(Self::new(queue, machine)),
            None => Ok(Self::local(s)),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn machine(&self) -> Option<&str> {
        self.machine.as_deref()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.machine {
            Some(machine) => write!(f, "{}@{}", self.queue, machine),
            None => f.write_str(&self.queue),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// Serialized as the textual form so stored envelopes stay readable.
impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

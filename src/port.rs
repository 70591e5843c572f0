//! Port access boundary
//!
//! Platform enumeration, open/close and raw I/O live behind [`PortAccess`].
//! Slots receive an explicitly constructed instance at construction time, so
//! tests can substitute an in-memory backend.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Direction of a single transport endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => f.write_str("input"),
            PortDirection::Output => f.write_str("output"),
        }
    }
}

/// Identity and description of an enumerated port
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PortDescriptor {
    pub id: String,
    pub name: String,
    pub manufacturer: String,
    pub version: String,
}

impl PortDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = manufacturer.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

impl fmt::Display for PortDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) | Manufacturer: {} | Version: {}",
            self.name, self.id, self.manufacturer, self.version
        )
    }
}

/// Raw-bytes callback, invoked on a backend-owned thread
pub type InputCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// An open input port. Dropping or closing it stops the callback.
pub trait InputHandle: Send {
    fn close(self: Box<Self>) {}
}

/// An open output port
pub trait OutputHandle: Send {
    /// Blocking write of one contiguous run of bytes
    fn send(&mut self, bytes: &[u8], timestamp: u64) -> Result<()>;

    fn close(self: Box<Self>) {}
}

/// Platform MIDI capability consumed by connection slots
pub trait PortAccess: Send + Sync {
    /// Ports currently present for `direction`
    fn enumerate(&self, direction: PortDirection) -> Result<Vec<PortDescriptor>>;

    fn open_input(&self, id: &str, on_bytes: InputCallback) -> Result<Box<dyn InputHandle>>;

    fn open_output(&self, id: &str) -> Result<Box<dyn OutputHandle>>;
}

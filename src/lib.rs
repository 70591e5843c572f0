//! midi-link - resilient MIDI 1.0 device connections
//!
//! Keeps a logical connection to an external controller alive across
//! hot-plugging and slow enumeration: [`framer`] turns chunked input into
//! messages, [`slot`] discovers, opens, watches and re-opens ports, and
//! [`pipeline`] moves outbound writes onto a dedicated writer thread.
//! [`device::MidiDevice`] ties one input slot, one output slot and one
//! pipeline together.

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod framer;
pub mod midi;
pub mod pipeline;
pub mod port;
pub mod router;
pub mod search;
pub mod slot;

pub use device::MidiDevice;
pub use error::{Error, Result};
pub use framer::MessageFramer;
pub use midi::{Message, MessageKind, MidiMessage, StatusByte};
pub use pipeline::{OverflowPolicy, PipelineOptions, SendPipeline};
pub use port::{PortAccess, PortDescriptor, PortDirection};
pub use search::{DeviceSearchTerm, SearchField};
pub use slot::{ConnectionSlot, ConnectionState, MidiInputSlot, MidiOutputSlot, SlotOptions};

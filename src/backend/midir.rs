//! midir-backed port access
//!
//! midir consumes its client object on connect, so every enumeration and open
//! creates a fresh client. Port identity comes from midir's stable port ids;
//! manufacturer and version are not exposed by midir and stay empty.

use ::midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tracing::debug;

use crate::error::{Error, Result};
use crate::port::{InputCallback, InputHandle, OutputHandle, PortAccess, PortDescriptor, PortDirection};

/// [`PortAccess`] over the system MIDI API via midir
#[derive(Debug, Clone)]
pub struct MidirAccess {
    client_name: String,
}

impl Default for MidirAccess {
    fn default() -> Self {
        Self::new("midi-link")
    }
}

impl MidirAccess {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }

    fn input_client(&self, suffix: &str) -> Result<MidiInput> {
        let mut midi_in = MidiInput::new(&format!("{}-{}", self.client_name, suffix))?;
        midi_in.ignore(Ignore::None);
        Ok(midi_in)
    }

    fn output_client(&self, suffix: &str) -> Result<MidiOutput> {
        Ok(MidiOutput::new(&format!("{}-{}", self.client_name, suffix))?)
    }
}

impl PortAccess for MidirAccess {
    fn enumerate(&self, direction: PortDirection) -> Result<Vec<PortDescriptor>> {
        let mut found = Vec::new();
        match direction {
            PortDirection::Input => {
                let midi_in = self.input_client("scanner")?;
                for port in midi_in.ports() {
                    // Ports can vanish between listing and naming
                    if let Ok(name) = midi_in.port_name(&port) {
                        found.push(PortDescriptor::new(port.id(), name));
                    }
                }
            }
            PortDirection::Output => {
                let midi_out = self.output_client("scanner")?;
                for port in midi_out.ports() {
                    if let Ok(name) = midi_out.port_name(&port) {
                        found.push(PortDescriptor::new(port.id(), name));
                    }
                }
            }
        }
        Ok(found)
    }

    fn open_input(&self, id: &str, mut on_bytes: InputCallback) -> Result<Box<dyn InputHandle>> {
        let midi_in = self.input_client("input")?;
        let port = midi_in.find_port_by_id(id.to_string()).ok_or_else(|| Error::PortOpenFailed {
            id: id.to_string(),
            reason: "port not present".to_string(),
        })?;

        let connection = midi_in
            .connect(&port, &self.client_name, move |_stamp, data, _| on_bytes(data), ())
            .map_err(|e| Error::PortOpenFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        debug!("midir input connection opened for {}", id);
        Ok(Box::new(MidirInput { connection }))
    }

    fn open_output(&self, id: &str) -> Result<Box<dyn OutputHandle>> {
        let midi_out = self.output_client("output")?;
        let port = midi_out.find_port_by_id(id.to_string()).ok_or_else(|| Error::PortOpenFailed {
            id: id.to_string(),
            reason: "port not present".to_string(),
        })?;

        let connection = midi_out
            .connect(&port, &self.client_name)
            .map_err(|e| Error::PortOpenFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        debug!("midir output connection opened for {}", id);
        Ok(Box::new(MidirOutput { connection }))
    }
}

struct MidirInput {
    connection: MidiInputConnection<()>,
}

impl InputHandle for MidirInput {
    fn close(self: Box<Self>) {
        let _ = self.connection.close();
    }
}

struct MidirOutput {
    connection: MidiOutputConnection,
}

impl OutputHandle for MidirOutput {
    /// Some midir backends encode a single event per call, so a buffer of
    /// concatenated messages is split at each status byte
    fn send(&mut self, bytes: &[u8], _timestamp: u64) -> Result<()> {
        let mut start = 0;
        for end in 1..=bytes.len() {
            if end == bytes.len() || bytes[end] & 0x80 != 0 {
                self.connection.send(&bytes[start..end])?;
                start = end;
            }
        }
        Ok(())
    }

    fn close(self: Box<Self>) {
        let _ = self.connection.close();
    }
}

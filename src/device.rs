//! One named device: an input slot, an output slot and a send pipeline

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::AppConfig;
use crate::error::Result;
use crate::midi::Message;
use crate::pipeline::{PipelineOptions, SendPipeline};
use crate::port::{PortAccess, PortDescriptor, PortDirection};
use crate::router::{EventRouter, ListenerId};
use crate::search::DeviceSearchTerm;
use crate::slot::{ConnectionState, MidiInputSlot, MidiOutputSlot, SlotOptions};

#[derive(Default)]
struct Links {
    input: bool,
    output: bool,
}

impl Links {
    fn both(&self) -> bool {
        self.input && self.output
    }
}

/// Tracks both slots' open flags and reports edges of "both open"
struct Connectivity {
    device: String,
    links: Mutex<Links>,
    listeners: EventRouter<bool>,
}

impl Connectivity {
    fn update(&self, direction: PortDirection, open: bool) {
        let edge = {
            let mut links = self.links.lock();
            let before = links.both();
            match direction {
                PortDirection::Input => links.input = open,
                PortDirection::Output => links.output = open,
            }
            let after = links.both();
            (before != after).then_some(after)
        };

        if let Some(connected) = edge {
            if connected {
                info!("✅ Device '{}' connected", self.device);
            } else {
                info!("Device '{}' disconnected", self.device);
            }
            self.listeners.dispatch(&connected);
        }
    }
}

/// Input slot, output slot and send pipeline for a single controller
pub struct MidiDevice {
    name: String,
    input: MidiInputSlot,
    output: MidiOutputSlot,
    pipeline: SendPipeline,
    connectivity: Arc<Connectivity>,
}

impl MidiDevice {
    pub fn new(
        name: impl Into<String>,
        access: Arc<dyn PortAccess>,
        input_term: DeviceSearchTerm,
        output_term: DeviceSearchTerm,
        slot_options: SlotOptions,
        pipeline_options: PipelineOptions,
    ) -> Result<Self> {
        let name = name.into();
        let input = MidiInputSlot::new(access.clone(), input_term, slot_options.clone());
        let output = MidiOutputSlot::new(access, output_term, slot_options);
        let pipeline = SendPipeline::new(name.clone(), output.sink(), pipeline_options)?;

        let connectivity = Arc::new(Connectivity {
            device: name.clone(),
            links: Mutex::new(Links::default()),
            listeners: EventRouter::new("device-connected"),
        });
        let c = connectivity.clone();
        input.subscribe_state(move |open| c.update(PortDirection::Input, *open));
        let c = connectivity.clone();
        output.subscribe_state(move |open| c.update(PortDirection::Output, *open));

        Ok(Self {
            name,
            input,
            output,
            pipeline,
            connectivity,
        })
    }

    /// Build from a loaded configuration
    pub fn from_config(access: Arc<dyn PortAccess>, config: &AppConfig) -> Result<Self> {
        Self::new(
            config.device.name.clone(),
            access,
            config.device.input.clone(),
            config.device.output.clone(),
            config.slot_options(),
            config.pipeline_options(),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> &MidiInputSlot {
        &self.input
    }

    pub fn output(&self) -> &MidiOutputSlot {
        &self.output
    }

    pub fn pipeline(&self) -> &SendPipeline {
        &self.pipeline
    }

    /// Start both connection threads
    pub fn begin_connect(&self) -> Result<()> {
        self.input.begin_connect()?;
        self.output.begin_connect()
    }

    /// Open only when both slots are open, Closed when both are closed
    pub fn connection_state(&self) -> ConnectionState {
        match (self.input.state(), self.output.state()) {
            (ConnectionState::Open, ConnectionState::Open) => ConnectionState::Open,
            (ConnectionState::Closed, ConnectionState::Closed) => ConnectionState::Closed,
            _ => ConnectionState::Connecting,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Open
    }

    /// Descriptor of the connected input port
    pub fn details(&self) -> Option<PortDescriptor> {
        self.input.slot().details()
    }

    /// Replace both search terms; open ports stay open
    pub fn change_search_terms(&self, input: DeviceSearchTerm, output: DeviceSearchTerm) {
        self.input.change_search_term(input);
        self.output.change_search_term(output);
    }

    pub fn commit(&self, message: Message) -> Result<()> {
        self.pipeline.commit(message)
    }

    pub fn commit_control_changes(&self, channel: u8, changes: &[(u8, u8)]) -> Result<()> {
        self.pipeline.commit_control_changes(channel, changes)
    }

    pub fn commit_nrpn(&self, channel: u8, parameter: u16, value: u16) -> Result<()> {
        self.pipeline.commit_nrpn(channel, parameter, value)
    }

    pub fn push(&self) -> Result<()> {
        self.pipeline.push()
    }

    pub fn subscribe_messages<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[Message]) + Send + Sync + 'static,
    {
        self.input.subscribe_messages(listener)
    }

    pub fn unsubscribe_messages(&self, id: ListenerId) -> bool {
        self.input.unsubscribe_messages(id)
    }

    /// `true` when both ports become open, `false` when either one drops
    pub fn subscribe_connected<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.connectivity.listeners.subscribe(listener)
    }

    pub fn unsubscribe_connected(&self, id: ListenerId) -> bool {
        self.connectivity.listeners.unsubscribe(id)
    }

    /// Drain queued output, then close both slots. Idempotent.
    pub fn close(&self) {
        self.pipeline.shutdown();
        self.input.close();
        self.output.close();
    }
}

impl Drop for MidiDevice {
    fn drop(&mut self) {
        self.close();
    }
}

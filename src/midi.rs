//! MIDI 1.0 wire types
//!
//! Status bytes, the compact channel-voice [`Message`] produced by the framer
//! and committed to the send pipeline, plus a typed [`MidiMessage`] view for
//! display and pattern matching.

use std::fmt;

/// Channel-voice message types (high nibble of the status byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    NoteOff = 0x80,
    NoteOn = 0x90,
    PolyPressure = 0xA0,
    ControlChange = 0xB0,
    ProgramChange = 0xC0,
    ChannelPressure = 0xD0,
    PitchBend = 0xE0,
}

impl MessageKind {
    /// Map a status byte's high nibble to a kind. System bytes (0xF_) have none.
    pub fn from_status(byte: u8) -> Option<Self> {
        match byte & 0xF0 {
            0x80 => Some(Self::NoteOff),
            0x90 => Some(Self::NoteOn),
            0xA0 => Some(Self::PolyPressure),
            0xB0 => Some(Self::ControlChange),
            0xC0 => Some(Self::ProgramChange),
            0xD0 => Some(Self::ChannelPressure),
            0xE0 => Some(Self::PitchBend),
            _ => None,
        }
    }

    /// Number of data bytes that follow a status byte of this kind
    pub fn data_len(self) -> u8 {
        match self {
            Self::ProgramChange | Self::ChannelPressure => 1,
            _ => 2,
        }
    }
}

/// A MIDI status byte. The high bit is always set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusByte(u8);

impl StatusByte {
    /// Returns `None` for data bytes (high bit clear)
    pub const fn new(byte: u8) -> Option<Self> {
        if byte & 0x80 != 0 {
            Some(Self(byte))
        } else {
            None
        }
    }

    /// Build a channel-voice status byte. `channel` is masked to 0-15.
    pub const fn channel_voice(kind: MessageKind, channel: u8) -> Self {
        Self(kind as u8 | (channel & 0x0F))
    }

    pub const fn value(self) -> u8 {
        self.0
    }

    pub fn kind(self) -> Option<MessageKind> {
        MessageKind::from_status(self.0)
    }

    /// Low nibble. Only meaningful for channel-voice status bytes.
    pub const fn channel(self) -> u8 {
        self.0 & 0x0F
    }

    /// System Real-Time (0xF8-0xFF): single byte, may appear anywhere, never
    /// touches running status
    pub const fn is_real_time(self) -> bool {
        self.0 >= 0xF8
    }

    /// System Common (0xF0-0xF7), including SysEx start and end
    pub const fn is_system_common(self) -> bool {
        self.0 >= 0xF0 && self.0 < 0xF8
    }

    /// Data bytes required after this status, `None` for system messages
    pub fn data_len(self) -> Option<u8> {
        self.kind().map(MessageKind::data_len)
    }
}

/// A parsed or outgoing channel-voice message.
///
/// `data_count` is determined by the status byte's kind. Data bytes always
/// have their high bit clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Message {
    status: StatusByte,
    data: [u8; 2],
    data_count: u8,
}

impl Message {
    /// Largest encoded size of a channel-voice message
    pub const MAX_LEN: usize = 3;

    /// Build a message from a channel-voice status byte. Data bytes are
    /// masked to 7 bits; `data1` is ignored for one-data-byte kinds.
    /// Returns `None` for system status bytes.
    pub fn new(status: StatusByte, data0: u8, data1: u8) -> Option<Self> {
        let data_count = status.data_len()?;
        let data1 = if data_count == 2 { data1 & 0x7F } else { 0 };
        Some(Self {
            status,
            data: [data0 & 0x7F, data1],
            data_count,
        })
    }

    fn voice(kind: MessageKind, channel: u8, data0: u8, data1: u8) -> Self {
        let data_count = kind.data_len();
        Self {
            status: StatusByte::channel_voice(kind, channel),
            data: [data0 & 0x7F, if data_count == 2 { data1 & 0x7F } else { 0 }],
            data_count,
        }
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::voice(MessageKind::NoteOn, channel, note, velocity)
    }

    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        Self::voice(MessageKind::NoteOff, channel, note, velocity)
    }

    pub fn poly_pressure(channel: u8, note: u8, pressure: u8) -> Self {
        Self::voice(MessageKind::PolyPressure, channel, note, pressure)
    }

    pub fn control_change(channel: u8, controller: u8, value: u8) -> Self {
        Self::voice(MessageKind::ControlChange, channel, controller, value)
    }

    pub fn program_change(channel: u8, program: u8) -> Self {
        Self::voice(MessageKind::ProgramChange, channel, program, 0)
    }

    pub fn channel_pressure(channel: u8, pressure: u8) -> Self {
        Self::voice(MessageKind::ChannelPressure, channel, pressure, 0)
    }

    /// Pitch bend from a 14-bit value (8192 = center)
    pub fn pitch_bend(channel: u8, value: u16) -> Self {
        let (msb, lsb) = convert::split_14bit(value);
        Self::voice(MessageKind::PitchBend, channel, lsb, msb)
    }

    pub fn status(&self) -> StatusByte {
        self.status
    }

    pub fn kind(&self) -> MessageKind {
        // Construction guarantees a channel-voice status
        self.status.kind().unwrap_or(MessageKind::NoteOff)
    }

    pub fn channel(&self) -> u8 {
        self.status.channel()
    }

    pub fn data0(&self) -> u8 {
        self.data[0]
    }

    pub fn data1(&self) -> u8 {
        self.data[1]
    }

    pub fn data_count(&self) -> u8 {
        self.data_count
    }

    /// Encoded length in bytes (status + data)
    pub fn len(&self) -> usize {
        1 + self.data_count as usize
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// NoteOff, or NoteOn with velocity 0
    pub fn is_note_off(&self) -> bool {
        match self.kind() {
            MessageKind::NoteOff => true,
            MessageKind::NoteOn => self.data[1] == 0,
            _ => false,
        }
    }

    /// Write the full encoding (never running-status compressed) into `out`.
    /// Returns the number of bytes written, or `None` if `out` is too short.
    pub fn write_to(&self, out: &mut [u8]) -> Option<usize> {
        let len = self.len();
        let out = out.get_mut(..len)?;
        out[0] = self.status.value();
        out[1..].copy_from_slice(&self.data[..self.data_count as usize]);
        Some(len)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.len()];
        let _ = self.write_to(&mut bytes);
        bytes
    }

    /// Typed view of this message
    pub fn typed(&self) -> MidiMessage {
        MidiMessage::from(*self)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.typed().fmt(f)
    }
}

/// Typed channel-voice message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    /// Note Off: channel (0-15), note (0-127), velocity (0-127)
    NoteOff { channel: u8, note: u8, velocity: u8 },

    /// Note On: channel (0-15), note (0-127), velocity (0-127)
    NoteOn { channel: u8, note: u8, velocity: u8 },

    /// Polyphonic Key Pressure: channel (0-15), note (0-127), pressure (0-127)
    PolyPressure { channel: u8, note: u8, pressure: u8 },

    /// Control Change: channel (0-15), cc (0-127), value (0-127)
    ControlChange { channel: u8, cc: u8, value: u8 },

    /// Program Change: channel (0-15), program (0-127)
    ProgramChange { channel: u8, program: u8 },

    /// Channel Pressure: channel (0-15), pressure (0-127)
    ChannelPressure { channel: u8, pressure: u8 },

    /// Pitch Bend: channel (0-15), value (0-16383, 14-bit)
    PitchBend { channel: u8, value: u16 },
}

impl From<Message> for MidiMessage {
    fn from(msg: Message) -> Self {
        let channel = msg.channel();
        let (d0, d1) = (msg.data0(), msg.data1());
        match msg.kind() {
            MessageKind::NoteOff => MidiMessage::NoteOff { channel, note: d0, velocity: d1 },
            MessageKind::NoteOn => MidiMessage::NoteOn { channel, note: d0, velocity: d1 },
            MessageKind::PolyPressure => MidiMessage::PolyPressure { channel, note: d0, pressure: d1 },
            MessageKind::ControlChange => MidiMessage::ControlChange { channel, cc: d0, value: d1 },
            MessageKind::ProgramChange => MidiMessage::ProgramChange { channel, program: d0 },
            MessageKind::ChannelPressure => MidiMessage::ChannelPressure { channel, pressure: d0 },
            MessageKind::PitchBend => MidiMessage::PitchBend {
                channel,
                value: convert::value_14bit(d1, d0),
            },
        }
    }
}

impl From<MidiMessage> for Message {
    fn from(msg: MidiMessage) -> Self {
        match msg {
            MidiMessage::NoteOff { channel, note, velocity } => Message::note_off(channel, note, velocity),
            MidiMessage::NoteOn { channel, note, velocity } => Message::note_on(channel, note, velocity),
            MidiMessage::PolyPressure { channel, note, pressure } => {
                Message::poly_pressure(channel, note, pressure)
            }
            MidiMessage::ControlChange { channel, cc, value } => Message::control_change(channel, cc, value),
            MidiMessage::ProgramChange { channel, program } => Message::program_change(channel, program),
            MidiMessage::ChannelPressure { channel, pressure } => Message::channel_pressure(channel, pressure),
            MidiMessage::PitchBend { channel, value } => Message::pitch_bend(channel, value),
        }
    }
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MidiMessage::NoteOff { channel, note, velocity } => {
                write!(f, "NoteOff ch:{} n:{} v:{}", channel + 1, note, velocity)
            }
            MidiMessage::NoteOn { channel, note, velocity } => {
                write!(f, "NoteOn ch:{} n:{} v:{}", channel + 1, note, velocity)
            }
            MidiMessage::PolyPressure { channel, note, pressure } => {
                write!(f, "PolyPressure ch:{} n:{} p:{}", channel + 1, note, pressure)
            }
            MidiMessage::ControlChange { channel, cc, value } => {
                write!(f, "CC ch:{} cc:{} v:{}", channel + 1, cc, value)
            }
            MidiMessage::ProgramChange { channel, program } => {
                write!(f, "ProgramChange ch:{} p:{}", channel + 1, program)
            }
            MidiMessage::ChannelPressure { channel, pressure } => {
                write!(f, "ChannelPressure ch:{} p:{}", channel + 1, pressure)
            }
            MidiMessage::PitchBend { channel, value } => {
                write!(f, "PitchBend ch:{} v:{}", channel + 1, value)
            }
        }
    }
}

/// Controller numbers used by the NRPN helpers
pub mod cc {
    pub const DATA_ENTRY_MSB: u8 = 6;
    pub const DATA_ENTRY_LSB: u8 = 38;
    pub const NRPN_LSB: u8 = 98;
    pub const NRPN_MSB: u8 = 99;
}

/// MIDI value conversion utilities
pub mod convert {
    /// Combine two 7-bit halves into a 14-bit value
    pub fn value_14bit(msb: u8, lsb: u8) -> u16 {
        (((msb & 0x7F) as u16) << 7) | (lsb & 0x7F) as u16
    }

    /// Split a 14-bit value into (msb, lsb). Values above 16383 are clamped.
    pub fn split_14bit(value: u16) -> (u8, u8) {
        let value = value.min(0x3FFF);
        (((value >> 7) & 0x7F) as u8, (value & 0x7F) as u8)
    }

    /// Convert 14-bit value (0-16383) to 7-bit value (0-127)
    pub fn to_7bit(value_14bit: u16) -> u8 {
        ((value_14bit >> 7) & 0x7F) as u8
    }

    /// Normalize a 7-bit value to 0.0..=1.0
    pub fn normalized_7bit(value: u8) -> f32 {
        (value & 0x7F) as f32 / 127.0
    }
}

/// Format MIDI bytes as hex string for debugging
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_byte_rejects_data_bytes() {
        assert!(StatusByte::new(0x7F).is_none());
        assert!(StatusByte::new(0x00).is_none());

        let status = StatusByte::new(0x93).unwrap();
        assert_eq!(status.kind(), Some(MessageKind::NoteOn));
        assert_eq!(status.channel(), 3);
        assert_eq!(status.data_len(), Some(2));
    }

    #[test]
    fn test_system_status_classes() {
        let clock = StatusByte::new(0xF8).unwrap();
        assert!(clock.is_real_time());
        assert_eq!(clock.data_len(), None);

        let sysex = StatusByte::new(0xF0).unwrap();
        assert!(sysex.is_system_common());
        assert!(!sysex.is_real_time());
    }

    #[test]
    fn test_data_counts_by_kind() {
        assert_eq!(Message::program_change(0, 5).data_count(), 1);
        assert_eq!(Message::channel_pressure(0, 5).data_count(), 1);
        assert_eq!(Message::note_on(0, 60, 100).data_count(), 2);
        assert_eq!(Message::pitch_bend(0, 8192).data_count(), 2);
    }

    #[test]
    fn test_data_bytes_are_masked() {
        let msg = Message::control_change(17, 0xFF, 0x80);
        assert_eq!(msg.channel(), 1);
        assert_eq!(msg.data0(), 0x7F);
        assert_eq!(msg.data1(), 0x00);
    }

    #[test]
    fn test_encode_note_on() {
        let msg = Message::note_on(0, 60, 100);
        assert_eq!(msg.to_bytes(), vec![0x90, 60, 100]);
    }

    #[test]
    fn test_encode_program_change_is_two_bytes() {
        let msg = Message::program_change(2, 7);
        assert_eq!(msg.to_bytes(), vec![0xC2, 7]);
    }

    #[test]
    fn test_write_to_short_buffer() {
        let msg = Message::note_on(0, 60, 100);
        let mut out = [0u8; 2];
        assert_eq!(msg.write_to(&mut out), None);
    }

    #[test]
    fn test_pitch_bend_center() {
        let msg = Message::pitch_bend(0, 8192);
        assert_eq!(msg.to_bytes(), vec![0xE0, 0x00, 0x40]);
        assert_eq!(msg.typed(), MidiMessage::PitchBend { channel: 0, value: 8192 });
    }

    #[test]
    fn test_note_on_velocity_zero_is_note_off() {
        assert!(Message::note_on(0, 60, 0).is_note_off());
        assert!(Message::note_off(0, 60, 64).is_note_off());
        assert!(!Message::note_on(0, 60, 1).is_note_off());
    }

    #[test]
    fn test_display() {
        let msg = Message::control_change(2, 7, 100);
        assert_eq!(msg.to_string(), "CC ch:3 cc:7 v:100");
    }

    #[test]
    fn test_typed_conversion_back() {
        let typed = MidiMessage::ChannelPressure { channel: 4, pressure: 33 };
        let msg = Message::from(typed);
        assert_eq!(msg.to_bytes(), vec![0xD4, 33]);
        assert_eq!(msg.typed(), typed);
    }

    #[test]
    fn test_14bit_helpers() {
        assert_eq!(convert::value_14bit(0x40, 0x00), 8192);
        assert_eq!(convert::split_14bit(16383), (0x7F, 0x7F));
        assert_eq!(convert::split_14bit(20000), (0x7F, 0x7F));
        assert_eq!(convert::to_7bit(8192), 64);
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0x90, 0x3C, 0x7F]), "90 3C 7F");
        assert_eq!(format_hex(&[]), "");
    }
}

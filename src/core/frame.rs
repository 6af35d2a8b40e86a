//! Bike frame codec
//! Translates raw notification payloads into telemetry readings and control
//! commands into the bytes the bike firmware expects. No I/O, no state.

use serde::{Deserialize, Serialize};

/// Length of an acknowledgment/status frame.
pub const ACK_FRAME_LEN: usize = 3;

/// Length of the one recognised telemetry layout.
pub const TELEMETRY_FRAME_LEN: usize = 21;

/// Anything shorter than this is treated as a partial write.
pub const MIN_FRAME_LEN: usize = 10;

/// Lowest resistance level the bike accepts.
pub const MIN_RESISTANCE_LEVEL: u8 = 1;

/// Highest resistance level the bike accepts.
pub const MAX_RESISTANCE_LEVEL: u8 = 32;

/// Keep-alive poll for the vendor service.
pub const VENDOR_POLL_FRAME: [u8; 5] = [0xF0, 0xA2, 0x01, 0x01, 0xA3];

/// Keep-alive poll for the FTMS control point (Request Control).
pub const FTMS_POLL_FRAME: [u8; 1] = [0x00];

const VENDOR_HEADER: u8 = 0xF0;
const VENDOR_SET_RESISTANCE: u8 = 0xA6;
const VENDOR_DEVICE_ID: u8 = 0x01;
const VENDOR_CHANNEL: u8 = 0x01;
const FTMS_SET_TARGET_RESISTANCE: u8 = 0x04;

// Byte offsets inside a telemetry frame.
const SPEED_OFFSET: usize = 2;
const CADENCE_OFFSET: usize = 4;
const DISTANCE_OFFSET: usize = 6;
const RESISTANCE_OFFSET: usize = 9;
const POWER_OFFSET: usize = 11;
const CALORIES_OFFSET: usize = 13;
const HEART_RATE_OFFSET: usize = 18;
const ELAPSED_OFFSET: usize = 19;

/// One decoded snapshot of the bike state.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReading {
    /// Device-reported session counter, in seconds
    pub time: u32,
    /// km/h
    pub speed: f64,
    pub rpm: u32,
    /// km
    pub distance: f64,
    pub calories: u32,
    /// bpm, 0 when no sensor is attached
    pub heart_rate: u32,
    /// W
    pub power: u32,
    pub resistance: u32,
}

/// Shape of an incoming frame, decided once from its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind<'a> {
    /// Too short to carry anything useful.
    Partial,
    /// Acknowledgment/status frame.
    Ack,
    /// The 21-byte telemetry layout.
    Telemetry(&'a [u8; TELEMETRY_FRAME_LEN]),
    /// A length we do not understand; dropped for forward compatibility.
    Unknown(&'a [u8]),
}

impl<'a> FrameKind<'a> {
    pub fn classify(frame: &'a [u8]) -> Self {
        if frame.len() == ACK_FRAME_LEN {
            return Self::Ack;
        }
        if frame.len() < MIN_FRAME_LEN {
            return Self::Partial;
        }
        match <&[u8; TELEMETRY_FRAME_LEN]>::try_from(frame) {
            Ok(telemetry) => Self::Telemetry(telemetry),
            Err(_) => Self::Unknown(frame),
        }
    }
}

/// Outcome of decoding a single notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodeOutcome {
    Reading(TelemetryReading),
    Ignored,
}

impl DecodeOutcome {
    pub fn reading(self) -> Option<TelemetryReading> {
        match self {
            Self::Reading(reading) => Some(reading),
            Self::Ignored => None,
        }
    }
}

/// Decodes a notification payload of any length.
///
/// Only 21-byte frames yield a reading; every other shape is ignored and
/// never reported as an error.
pub fn decode_telemetry(frame: &[u8]) -> DecodeOutcome {
    match FrameKind::classify(frame) {
        FrameKind::Telemetry(data) => DecodeOutcome::Reading(decode_layout(data)),
        FrameKind::Partial | FrameKind::Ack | FrameKind::Unknown(_) => DecodeOutcome::Ignored,
    }
}

fn decode_layout(data: &[u8; TELEMETRY_FRAME_LEN]) -> TelemetryReading {
    let raw_speed = u16::from_le_bytes([data[SPEED_OFFSET], data[SPEED_OFFSET + 1]]);
    let raw_cadence = f64::from(data[CADENCE_OFFSET]);

    TelemetryReading {
        time: u32::from(data[ELAPSED_OFFSET]),
        speed: f64::from(raw_speed) / 100.0,
        rpm: (raw_cadence / 2.0).round() as u32,
        distance: f64::from(data[DISTANCE_OFFSET]) / 1000.0,
        calories: u32::from(data[CALORIES_OFFSET]),
        heart_rate: u32::from(data[HEART_RATE_OFFSET]),
        power: u32::from(data[POWER_OFFSET]),
        resistance: u32::from(data[RESISTANCE_OFFSET]),
    }
}

/// The GATT service the session settled on. The firmware accepts different
/// framing depending on which one it advertised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceProfile {
    /// Standard Fitness Machine Service.
    Ftms,
    /// Proprietary vendor service, also used when neither known service is present.
    Vendor,
}

/// Outbound instruction to the bike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Keep-alive/status poll.
    Poll,
    /// Target resistance level; clamped when encoded.
    SetResistance(i32),
}

impl ControlCommand {
    /// Builds a resistance command with its level already clamped.
    pub fn set_resistance(level: i32) -> Self {
        Self::SetResistance(i32::from(clamp_resistance(level)))
    }
}

/// Clamps a requested level into the range the bike accepts.
pub fn clamp_resistance(level: i32) -> u8 {
    level.clamp(
        i32::from(MIN_RESISTANCE_LEVEL),
        i32::from(MAX_RESISTANCE_LEVEL),
    ) as u8
}

/// Encodes a command using the framing of the given profile.
pub fn encode_control(command: ControlCommand, profile: ServiceProfile) -> Vec<u8> {
    match (command, profile) {
        (ControlCommand::Poll, ServiceProfile::Ftms) => FTMS_POLL_FRAME.to_vec(),
        (ControlCommand::Poll, ServiceProfile::Vendor) => VENDOR_POLL_FRAME.to_vec(),
        (ControlCommand::SetResistance(level), ServiceProfile::Ftms) => {
            // Resolution is 0.1 of a level.
            let target = i16::from(clamp_resistance(level)) * 10;
            let [lo, hi] = target.to_le_bytes();
            vec![FTMS_SET_TARGET_RESISTANCE, lo, hi]
        }
        (ControlCommand::SetResistance(level), ServiceProfile::Vendor) => {
            let mut frame = vec![
                VENDOR_HEADER,
                VENDOR_SET_RESISTANCE,
                VENDOR_DEVICE_ID,
                VENDOR_CHANNEL,
                clamp_resistance(level),
            ];
            frame.push(vendor_checksum(&frame));
            frame
        }
    }
}

fn vendor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FRAME: [u8; 21] = [
        0x74, 0x0b, 0x88, 0x13, 0x64, 0, 0x0a, 0, 0, 0x05, 0, 0x96, 0, 0x96, 0, 0, 0, 0, 0x4b,
        0x3c, 0,
    ];

    #[test]
    fn test_decode_sample_frame() {
        let reading = decode_telemetry(&SAMPLE_FRAME).reading().unwrap();

        assert_eq!(
            reading,
            TelemetryReading {
                time: 60,
                speed: 50.0,
                rpm: 50,
                distance: 0.01,
                calories: 150,
                heart_rate: 75,
                power: 150,
                resistance: 5,
            }
        );
    }

    #[test]
    fn test_decode_is_pure() {
        assert_eq!(decode_telemetry(&SAMPLE_FRAME), decode_telemetry(&SAMPLE_FRAME));
    }

    #[test]
    fn test_short_frames_are_ignored() {
        for len in 0..MIN_FRAME_LEN {
            let frame = vec![0xFF; len];
            assert_eq!(decode_telemetry(&frame), DecodeOutcome::Ignored, "len {len}");
        }
    }

    #[test]
    fn test_ack_frame_is_ignored() {
        assert_eq!(FrameKind::classify(&[0xF0, 0xA2, 0x01]), FrameKind::Ack);
        assert_eq!(decode_telemetry(&[0xF0, 0xA2, 0x01]), DecodeOutcome::Ignored);
    }

    #[test]
    fn test_unknown_lengths_are_ignored() {
        let twenty = [0u8; 20];
        let twenty_two = [0u8; 22];
        assert_eq!(FrameKind::classify(&twenty), FrameKind::Unknown(&twenty));
        assert_eq!(decode_telemetry(&twenty), DecodeOutcome::Ignored);
        assert_eq!(decode_telemetry(&twenty_two), DecodeOutcome::Ignored);
    }

    #[test]
    fn test_cadence_rounds_half_up() {
        let mut frame = SAMPLE_FRAME;
        frame[CADENCE_OFFSET] = 101;
        assert_eq!(decode_telemetry(&frame).reading().unwrap().rpm, 51);
    }

    #[test]
    fn test_zeroed_frame_defaults_to_zero() {
        let reading = decode_telemetry(&[0u8; TELEMETRY_FRAME_LEN]).reading().unwrap();
        assert_eq!(reading, TelemetryReading::default());
    }

    #[test]
    fn test_poll_encoding_depends_on_profile() {
        assert_eq!(encode_control(ControlCommand::Poll, ServiceProfile::Ftms), vec![0x00]);
        assert_eq!(
            encode_control(ControlCommand::Poll, ServiceProfile::Vendor),
            vec![0xF0, 0xA2, 0x01, 0x01, 0xA3]
        );
    }

    #[test]
    fn test_resistance_is_clamped() {
        assert_eq!(clamp_resistance(0), 1);
        assert_eq!(clamp_resistance(-5), 1);
        assert_eq!(clamp_resistance(999), 32);
        assert_eq!(clamp_resistance(12), 12);
        assert_eq!(ControlCommand::set_resistance(999), ControlCommand::SetResistance(32));
    }

    #[test]
    fn test_vendor_resistance_frame() {
        let frame = encode_control(ControlCommand::SetResistance(5), ServiceProfile::Vendor);
        assert_eq!(frame, vec![0xF0, 0xA6, 0x01, 0x01, 0x05, 0x9D]);

        let clamped = encode_control(ControlCommand::SetResistance(400), ServiceProfile::Vendor);
        assert_eq!(clamped[4], MAX_RESISTANCE_LEVEL);
    }

    #[test]
    fn test_ftms_resistance_frame() {
        let frame = encode_control(ControlCommand::SetResistance(32), ServiceProfile::Ftms);
        assert_eq!(frame, vec![0x04, 0x40, 0x01]);

        let floor = encode_control(ControlCommand::SetResistance(-3), ServiceProfile::Ftms);
        assert_eq!(floor, vec![0x04, 0x0A, 0x00]);
    }
}

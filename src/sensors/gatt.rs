//! GATT characteristic decoding for heart-rate and running sensors.
//!
//! Pure byte-level decoding with no I/O or state. Callers decide whether a
//! decode failure is dropped or propagated.

use thiserror::Error;
use uuid::Uuid;

/// Heart Rate Service UUID (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Measurement Characteristic UUID (0x2A37)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);

/// Running Speed and Cadence Service UUID (0x1814)
pub const RSC_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1814_0000_1000_8000_0080_5f9b_34fb);

/// RSC Measurement Characteristic UUID (0x2A53)
pub const RSC_MEASUREMENT_UUID: Uuid = Uuid::from_u128(0x0000_2a53_0000_1000_8000_0080_5f9b_34fb);

/// Errors from characteristic decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Payload shorter than the format indicated by its flags
    #[error("{characteristic} payload too short: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Which characteristic was being decoded
        characteristic: &'static str,
        /// Bytes required by the flags
        expected: usize,
        /// Bytes actually present
        actual: usize,
    },
}

/// Decoded Heart Rate Measurement (0x2A37) payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartRateMeasurement {
    /// Heart rate in beats per minute
    pub bpm: u16,
    /// Skin contact detected (when the sensor supports contact detection)
    pub sensor_contact: bool,
    /// Energy expended in kJ, if present
    pub energy_expended: Option<u16>,
    /// RR intervals in 1/1024 s units, if present
    pub rr_intervals: Vec<u16>,
}

/// Decode a Heart Rate Measurement notification.
///
/// Byte 0 is a flags field; bit 0 selects 8-bit vs 16-bit little-endian
/// bpm encoding in the following byte(s).
pub fn decode_heart_rate(data: &[u8]) -> Result<HeartRateMeasurement, DecodeError> {
    let too_short = |expected: usize| DecodeError::TooShort {
        characteristic: "Heart Rate Measurement",
        expected,
        actual: data.len(),
    };

    if data.is_empty() {
        return Err(too_short(2));
    }

    let flags = data[0];
    let bpm_u16 = (flags & 0x01) != 0;
    let contact_supported = (flags & 0x04) != 0;
    let sensor_contact = contact_supported && (flags & 0x02) != 0;
    let energy_present = (flags & 0x08) != 0;
    let rr_present = (flags & 0x10) != 0;

    let mut offset = 1usize;

    let bpm = if bpm_u16 {
        if data.len() < offset + 2 {
            return Err(too_short(offset + 2));
        }
        let bpm = u16::from_le_bytes([data[offset], data[offset + 1]]);
        offset += 2;
        bpm
    } else {
        if data.len() < offset + 1 {
            return Err(too_short(offset + 1));
        }
        let bpm = u16::from(data[offset]);
        offset += 1;
        bpm
    };

    let mut measurement = HeartRateMeasurement {
        bpm,
        sensor_contact,
        ..Default::default()
    };

    if energy_present {
        if data.len() < offset + 2 {
            return Err(too_short(offset + 2));
        }
        measurement.energy_expended = Some(u16::from_le_bytes([data[offset], data[offset + 1]]));
        offset += 2;
    }

    if rr_present {
        while offset + 2 <= data.len() {
            measurement
                .rr_intervals
                .push(u16::from_le_bytes([data[offset], data[offset + 1]]));
            offset += 2;
        }
    }

    Ok(measurement)
}

/// Decoded RSC Measurement (0x2A53) payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RscMeasurement {
    /// Instantaneous speed in meters per second
    pub speed_mps: f32,
    /// Instantaneous cadence in steps per minute, if present
    pub cadence_spm: Option<u8>,
    /// Instantaneous stride length in meters, if present
    pub stride_length_m: Option<f32>,
    /// Total distance in meters, if present
    pub total_distance_m: Option<f64>,
}

impl RscMeasurement {
    /// Derived pace in seconds per kilometer; undefined at zero speed.
    pub fn pace_seconds_per_km(&self) -> Option<f32> {
        if self.speed_mps > 0.0 {
            Some(1000.0 / self.speed_mps)
        } else {
            None
        }
    }
}

/// Decode an RSC Measurement notification.
///
/// Byte 0 is a flags field. Bytes 1-2 are a 16-bit little-endian speed in
/// units of 1/256 m/s, always present. Byte 3 is instantaneous cadence in
/// steps/minute, present when flag bit 0 is set. Stride length (bit 1,
/// u16 in 1/100 m) and total distance (bit 2, u32 in 1/10 m) follow.
pub fn decode_rsc(data: &[u8]) -> Result<RscMeasurement, DecodeError> {
    let too_short = |expected: usize| DecodeError::TooShort {
        characteristic: "RSC Measurement",
        expected,
        actual: data.len(),
    };

    if data.len() < 3 {
        return Err(too_short(3));
    }

    let flags = data[0];
    let cadence_present = (flags & 0x01) != 0;
    let stride_present = (flags & 0x02) != 0;
    let distance_present = (flags & 0x04) != 0;

    let speed_raw = u16::from_le_bytes([data[1], data[2]]);
    let mut measurement = RscMeasurement {
        speed_mps: f32::from(speed_raw) / 256.0,
        ..Default::default()
    };

    let mut offset = 3usize;

    if cadence_present {
        if data.len() < offset + 1 {
            return Err(too_short(offset + 1));
        }
        measurement.cadence_spm = Some(data[offset]);
        offset += 1;
    }

    if stride_present {
        if data.len() < offset + 2 {
            return Err(too_short(offset + 2));
        }
        let stride_raw = u16::from_le_bytes([data[offset], data[offset + 1]]);
        measurement.stride_length_m = Some(f32::from(stride_raw) / 100.0);
        offset += 2;
    }

    if distance_present {
        if data.len() < offset + 4 {
            return Err(too_short(offset + 4));
        }
        let distance_raw = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        measurement.total_distance_m = Some(f64::from(distance_raw) / 10.0);
    }

    Ok(measurement)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_heart_rate_u8() {
        // Flags 0x00: 8-bit bpm
        let measurement = decode_heart_rate(&[0x00, 0x46]).unwrap();
        assert_eq!(measurement.bpm, 70);
    }

    #[test]
    fn test_decode_heart_rate_u16() {
        // Flags 0x01: 16-bit bpm
        let measurement = decode_heart_rate(&[0x01, 0x46, 0x00]).unwrap();
        assert_eq!(measurement.bpm, 70);
    }

    #[test]
    fn test_decode_heart_rate_too_short() {
        assert!(matches!(
            decode_heart_rate(&[]),
            Err(DecodeError::TooShort { .. })
        ));
        assert!(matches!(
            decode_heart_rate(&[0x00]),
            Err(DecodeError::TooShort { .. })
        ));
        // 16-bit flag but only one value byte
        assert!(matches!(
            decode_heart_rate(&[0x01, 0x46]),
            Err(DecodeError::TooShort { .. })
        ));
    }

    #[test]
    fn test_decode_heart_rate_contact_and_energy() {
        // Flags 0x0C: contact supported + detected is bit1; 0x04|0x02|0x08 = 0x0E
        let measurement = decode_heart_rate(&[0x0E, 0x91, 0x34, 0x12]).unwrap();
        assert_eq!(measurement.bpm, 145);
        assert!(measurement.sensor_contact);
        assert_eq!(measurement.energy_expended, Some(0x1234));
    }

    #[test]
    fn test_decode_heart_rate_rr_intervals() {
        // Flags 0x10: RR intervals present
        let measurement = decode_heart_rate(&[0x10, 0x5A, 0x00, 0x04, 0x10, 0x03]).unwrap();
        assert_eq!(measurement.bpm, 90);
        assert_eq!(measurement.rr_intervals, vec![0x0400, 0x0310]);
    }

    #[test]
    fn test_decode_rsc_with_cadence() {
        // Flags 0x01: cadence present; speed 256 = 1.0 m/s; cadence 180
        let measurement = decode_rsc(&[0x01, 0x00, 0x01, 0xB4]).unwrap();
        assert!((measurement.speed_mps - 1.0).abs() < f32::EPSILON);
        assert_eq!(measurement.cadence_spm, Some(180));
    }

    #[test]
    fn test_decode_rsc_speed_only() {
        // Flags 0x00: no cadence; speed 640 = 2.5 m/s
        let measurement = decode_rsc(&[0x00, 0x80, 0x02]).unwrap();
        assert!((measurement.speed_mps - 2.5).abs() < 0.001);
        assert_eq!(measurement.cadence_spm, None);
    }

    #[test]
    fn test_rsc_pace_derivation() {
        let measurement = decode_rsc(&[0x00, 0x00, 0x01]).unwrap();
        // 1.0 m/s => 1000 s/km
        assert!((measurement.pace_seconds_per_km().unwrap() - 1000.0).abs() < 0.01);

        let stopped = RscMeasurement::default();
        assert_eq!(stopped.pace_seconds_per_km(), None);
    }

    #[test]
    fn test_decode_rsc_stride_and_distance() {
        // Flags 0x07: cadence + stride + distance
        // speed 512 = 2.0 m/s, cadence 170, stride 0x0078 = 1.20 m,
        // distance 0x00002710 = 10000 * 0.1 m = 1000 m
        let data = [
            0x07, 0x00, 0x02, 0xAA, 0x78, 0x00, 0x10, 0x27, 0x00, 0x00,
        ];
        let measurement = decode_rsc(&data).unwrap();
        assert!((measurement.speed_mps - 2.0).abs() < 0.001);
        assert_eq!(measurement.cadence_spm, Some(170));
        assert!((measurement.stride_length_m.unwrap() - 1.20).abs() < 0.001);
        assert!((measurement.total_distance_m.unwrap() - 1000.0).abs() < 0.01);
    }

    #[test]
    fn test_decode_rsc_too_short() {
        assert!(matches!(decode_rsc(&[]), Err(DecodeError::TooShort { .. })));
        assert!(matches!(
            decode_rsc(&[0x00, 0x80]),
            Err(DecodeError::TooShort { .. })
        ));
        // Cadence flag set but cadence byte missing
        assert!(matches!(
            decode_rsc(&[0x01, 0x00, 0x01]),
            Err(DecodeError::TooShort { .. })
        ));
    }
}

// src/io/serial/classifier.rs
//
// Turns one extracted frame into a typed message: decoded sensor telemetry,
// a device error line, or plain text.

use serde::{Deserialize, Serialize};

// =============================================================================
// Telemetry wire shape
// =============================================================================

/// DHT22 temperature / humidity block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dht22Reading {
    pub temperature: f64,
    pub humidity: f64,
    pub status: String,
}

/// CCS811 air quality block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ccs811Reading {
    /// eCO2 in ppm
    pub co2: f64,
    /// TVOC in ppb
    pub tvoc: f64,
    pub status: String,
}

/// Firmware health block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemReading {
    pub free_heap: u64,
    pub wifi_connected: bool,
    pub sensors_ok: bool,
}

/// One telemetry object as emitted by the sensor node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub device_id: String,
    /// Device clock, Unix ms
    pub timestamp: u64,
    pub uptime: u64,
    pub dht22: Dht22Reading,
    pub ccs811: Ccs811Reading,
    pub system: SystemReading,
}

// =============================================================================
// Classification
// =============================================================================

/// A classified frame
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMessage {
    Reading(SensorReading),
    DeviceError(String),
    Raw(String),
}

/// Classification outcome. `decode_error` is set when a brace-delimited
/// frame failed to decode and fell back to text.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub message: ParsedMessage,
    pub decode_error: Option<String>,
}

/// Classify one complete frame.
///
/// A brace-delimited frame that decodes as telemetry wins even if it
/// contains the word "error" somewhere in its payload.
pub fn classify(frame: &str) -> Classified {
    let text = frame.trim();

    let mut decode_error = None;
    if text.starts_with('{') && text.ends_with('}') {
        match serde_json::from_str::<SensorReading>(text) {
            Ok(reading) => {
                return Classified {
                    message: ParsedMessage::Reading(reading),
                    decode_error: None,
                }
            }
            Err(e) => decode_error = Some(e.to_string()),
        }
    }

    let message = if text.to_ascii_lowercase().contains("error") {
        ParsedMessage::DeviceError(text.to_string())
    } else {
        ParsedMessage::Raw(text.to_string())
    };

    Classified {
        message,
        decode_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const READING: &str = r#"{"device_id":"d1","timestamp":1,"uptime":1,"dht22":{"temperature":21.5,"humidity":40,"status":"ok"},"ccs811":{"co2":450,"tvoc":10,"status":"ok"},"system":{"free_heap":1000,"wifi_connected":true,"sensors_ok":true}}"#;

    #[test]
    fn test_telemetry_decodes() {
        let classified = classify(READING);
        assert!(classified.decode_error.is_none());
        match classified.message {
            ParsedMessage::Reading(r) => {
                assert_eq!(r.device_id, "d1");
                assert_eq!(r.dht22.temperature, 21.5);
                assert_eq!(r.dht22.humidity, 40.0);
                assert_eq!(r.ccs811.co2, 450.0);
                assert_eq!(r.system.free_heap, 1000);
                assert!(r.system.wifi_connected);
            }
            other => panic!("expected reading, got {:?}", other),
        }
    }

    #[test]
    fn test_device_error_line() {
        let classified = classify("DEVICE ERROR: sensor offline");
        assert_eq!(
            classified.message,
            ParsedMessage::DeviceError("DEVICE ERROR: sensor offline".to_string())
        );
    }

    #[test]
    fn test_error_match_is_case_insensitive() {
        let classified = classify("ccs811 Error code 3");
        assert!(matches!(classified.message, ParsedMessage::DeviceError(_)));
    }

    #[test]
    fn test_plain_text_is_raw() {
        let classified = classify("WiFi connected, IP 192.168.1.20");
        assert_eq!(
            classified.message,
            ParsedMessage::Raw("WiFi connected, IP 192.168.1.20".to_string())
        );
        assert!(classified.decode_error.is_none());
    }

    #[test]
    fn test_bad_json_falls_back_to_raw() {
        let classified = classify(r#"{"device_id":"d1","uptime":"#);
        // Does not end with '}' so no decode is attempted
        assert!(matches!(classified.message, ParsedMessage::Raw(_)));

        let classified = classify(r#"{"hello":"world"}"#);
        assert!(classified.decode_error.is_some());
        assert_eq!(
            classified.message,
            ParsedMessage::Raw(r#"{"hello":"world"}"#.to_string())
        );
    }

    #[test]
    fn test_bad_json_with_error_word_is_device_error() {
        let classified = classify(r#"{"error":"dht22 read failed"}"#);
        assert!(classified.decode_error.is_some());
        assert!(matches!(classified.message, ParsedMessage::DeviceError(_)));
    }

    #[test]
    fn test_telemetry_mentioning_error_stays_telemetry() {
        let frame = READING.replace(r#""status":"ok"}"#, r#""status":"error"}"#);
        let classified = classify(&frame);
        assert!(matches!(classified.message, ParsedMessage::Reading(_)));
    }
}

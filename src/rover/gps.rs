//! GPS receiver ingestion.
//!
//! Reads NMEA 0183 sentences from a dedicated serial port. Every sentence
//! is forwarded raw as an `nmea` message for archival; GGA fixes are
//! additionally decoded into a `sensor_data` reading so drivers get
//! position without parsing NMEA themselves.

use super::{now_ns, Upstream};
use crate::config::{RoverConfig, RECONNECT_DELAY_SECS};
use crate::protocol::{Measurements, Message};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_serial::SerialPortBuilderExt;

/// Reconnecting GPS read loop. Runs for the life of the process.
pub async fn run(config: RoverConfig, upstream: Upstream) {
    if let Some(control_port) = &config.gps_control_port {
        enable_receiver(control_port, config.gps_baud).await;
    }

    loop {
        match tokio_serial::new(&config.gps_port, config.gps_baud).open_native_async() {
            Ok(stream) => {
                tracing::info!(port = %config.gps_port, "Opened GPS serial port");
                let mut lines = BufReader::new(stream).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => handle_sentence(line.trim(), &upstream),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!(error = %e, "GPS read failed");
                            break;
                        }
                    }
                }
                tracing::error!(
                    "Disconnected from GPS receiver, reconnecting in {RECONNECT_DELAY_SECS} seconds"
                );
            }
            Err(e) => {
                tracing::error!(port = %config.gps_port, error = %e, "Unable to open GPS serial port");
            }
        }
        tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
    }
}

/// One-shot positioning-session enable, required by Quectel modems after
/// power-up. Failure is non-fatal: the receiver may already be running.
async fn enable_receiver(port: &str, baud: u32) {
    match tokio_serial::new(port, baud).open_native_async() {
        Ok(mut control) => {
            if let Err(e) = control.write_all(b"AT+QGPS=1\r\n").await {
                tracing::warn!(error = %e, "Failed to write GPS enable command");
            }
        }
        Err(e) => {
            tracing::warn!(port = %port, error = %e, "Unable to open GPS control port");
        }
    }
}

fn handle_sentence(sentence: &str, upstream: &Upstream) {
    if sentence.is_empty() {
        return;
    }
    upstream.send(Message::Nmea {
        time: now_ns(),
        sentence: sentence.to_string(),
    });
    if let Some(fix) = parse_gga(sentence) {
        upstream.send(Message::SensorData {
            time: now_ns(),
            sensor: "gps".to_string(),
            measurements: fix.into_measurements(),
        });
    }
}

#[derive(Debug, PartialEq)]
pub struct GgaFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub hdop: Option<f64>,
    pub num_sats: Option<f64>,
}

impl GgaFix {
    fn into_measurements(self) -> Measurements {
        let mut m = Measurements::new();
        m.insert("lat".into(), Some(self.latitude));
        m.insert("lon".into(), Some(self.longitude));
        m.insert("alt".into(), self.altitude);
        m.insert("hdop".into(), self.hdop);
        m.insert("num_sats".into(), self.num_sats);
        m
    }
}

/// Parses a GGA sentence into a fix. Returns `None` for non-GGA sentences,
/// checksum failures and fixless readings (quality 0).
pub fn parse_gga(sentence: &str) -> Option<GgaFix> {
    let body = verify_checksum(sentence)?;
    let fields: Vec<&str> = body.split(',').collect();
    // Talker prefix varies (GP, GN, ...); match on the sentence type.
    if fields.first().map_or(true, |id| !id.ends_with("GGA")) {
        return None;
    }
    if fields.len() < 10 {
        return None;
    }

    let quality: u32 = fields[6].parse().ok()?;
    if quality == 0 {
        return None;
    }

    let latitude = parse_coordinate(fields[2], fields[3], 2)?;
    let longitude = parse_coordinate(fields[4], fields[5], 3)?;

    Some(GgaFix {
        latitude,
        longitude,
        altitude: fields.get(9).and_then(|s| s.parse().ok()),
        hdop: fields.get(8).and_then(|s| s.parse().ok()),
        num_sats: fields.get(7).and_then(|s| s.parse().ok()),
    })
}

/// Validates `$...*hh` framing and returns the body between `$` and `*`.
fn verify_checksum(sentence: &str) -> Option<&str> {
    let inner = sentence.strip_prefix('$')?;
    let (body, checksum_hex) = inner.rsplit_once('*')?;
    let expected = u8::from_str_radix(checksum_hex.trim(), 16).ok()?;
    let actual = body.bytes().fold(0u8, |acc, b| acc ^ b);
    (actual == expected).then_some(body)
}

/// NMEA coordinates are `ddmm.mmmm` (degrees then decimal minutes), with
/// `deg_digits` degree digits. South and west are negated.
fn parse_coordinate(raw: &str, hemisphere: &str, deg_digits: usize) -> Option<f64> {
    // Coordinates are ASCII digits; anything else would slice inside a
    // multibyte character below.
    if !raw.is_ascii() || raw.len() < deg_digits {
        return None;
    }
    let degrees: f64 = raw[..deg_digits].parse().ok()?;
    let minutes: f64 = raw[deg_digits..].parse().ok()?;
    let value = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Some(value),
        "S" | "W" => Some(-value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
    const GGA_NO_FIX: &str = "$GPGGA,123519,4807.038,N,01131.000,E,0,08,0.9,545.4,M,46.9,M,,*46";

    #[test]
    fn gga_fix_decodes() {
        let fix = parse_gga(GGA).unwrap();
        assert!((fix.latitude - 48.1173).abs() < 1e-4);
        assert!((fix.longitude - 11.516_666).abs() < 1e-4);
        assert_eq!(fix.altitude, Some(545.4));
        assert_eq!(fix.hdop, Some(0.9));
        assert_eq!(fix.num_sats, Some(8.0));
    }

    #[test]
    fn southern_and_western_hemispheres_negate() {
        let lat = parse_coordinate("4807.038", "S", 2).unwrap();
        let lon = parse_coordinate("01131.000", "W", 3).unwrap();
        assert!(lat < 0.0);
        assert!(lon < 0.0);
    }

    fn frame(body: &str) -> String {
        let sum = body.bytes().fold(0u8, |acc, b| acc ^ b);
        format!("${body}*{sum:02X}")
    }

    #[test]
    fn fix_measurement_keys_match_the_wire_format() {
        let m = parse_gga(GGA).unwrap().into_measurements();
        for key in ["lat", "lon", "alt", "hdop", "num_sats"] {
            assert!(m.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn multibyte_garbage_in_coordinates_is_rejected_not_fatal() {
        // Checksum-valid frame with a corrupted latitude field.
        let sentence = frame("GPGGA,123519,aé07.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,");
        assert_eq!(parse_gga(&sentence), None);
        assert_eq!(parse_coordinate("aé07.038", "N", 2), None);
    }

    #[test]
    fn non_gga_sentences_are_skipped() {
        assert_eq!(parse_gga(RMC), None);
    }

    #[test]
    fn fixless_gga_is_skipped() {
        assert_eq!(parse_gga(GGA_NO_FIX), None);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let corrupted = GGA.replace("4807.038", "4807.039");
        assert_eq!(parse_gga(&corrupted), None);
    }

    #[test]
    fn unframed_lines_are_rejected() {
        assert_eq!(parse_gga("GPGGA,123519"), None);
        assert_eq!(parse_gga(""), None);
    }
}

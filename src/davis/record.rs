//! Pure decode/encode functions for the Davis Vantage Pro binary records
//! (spec.md §4.2). No I/O, no state; callers (the protocol engine) are
//! responsible for framing and CRC validation before calling `parse_loop` /
//! `parse_archive`.

use chrono::{DateTime, Local, TimeZone, Utc};

pub const LOOP_LEN: usize = 99;
pub const ARCHIVE_LEN: usize = 52;

const INVALID_WORD: u16 = 0x7FFF;
const INVALID_BYTE: u8 = 0xFF;

const INHG_TO_HPA: f64 = 1.0 / 0.02953007;
const MPH_TO_KPH_LOOP_TABLE: f64 = 0.45;

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn read_u16_le(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_i16_le(bytes: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn fahrenheit_tenths_to_celsius(raw: i16) -> f64 {
    let fahrenheit = raw as f64 / 10.0;
    round1((fahrenheit - 32.0) * 5.0 / 9.0)
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LoopRecord {
    pub barometer_trend: i8,
    pub next_archive_record: u16,
    pub pressure_hpa: Option<f64>,
    pub temp_in_c: Option<f64>,
    pub humidity_in_pct: Option<u8>,
    pub temp_out_c: Option<f64>,
    pub wind_gust_10min_kph: Option<f64>,
    pub wind_speed_kph: Option<f64>,
    pub wind_direction_deg: Option<u16>,
    pub humidity_out_pct: Option<u8>,
    pub rain_rate_mm_per_h: Option<f64>,
    pub uv_index: Option<f64>,
    pub solar_radiation_wm2: Option<f64>,
    pub rain_daily_mm: Option<f64>,
    pub console_battery_v: Option<f64>,
}

/// Decodes a 99-byte LOOP packet. `bytes` must be exactly `LOOP_LEN` long and
/// already CRC-verified by the caller; this function trusts the buffer.
pub fn parse_loop(bytes: &[u8]) -> Result<LoopRecord, String> {
    if bytes.len() != LOOP_LEN {
        return Err(format!("loop record must be {LOOP_LEN} bytes, got {}", bytes.len()));
    }
    if &bytes[0..3] != b"LOO" {
        return Err("loop record missing 'LOO' signature".to_string());
    }

    let barometer_trend = bytes[3] as i8;
    let next_archive_record = read_u16_le(bytes, 5);

    let pressure_raw = read_u16_le(bytes, 7);
    let pressure_hpa = (pressure_raw != 0 && pressure_raw != INVALID_WORD)
        .then(|| round1(pressure_raw as f64 / 1000.0 * INHG_TO_HPA));

    let temp_in_raw = read_i16_le(bytes, 9);
    let temp_in_c = (temp_in_raw as u16 != INVALID_WORD).then(|| fahrenheit_tenths_to_celsius(temp_in_raw));

    let humidity_in_pct = (bytes[11] != INVALID_BYTE).then_some(bytes[11]);

    let temp_out_raw = read_i16_le(bytes, 12);
    let temp_out_c = (temp_out_raw as u16 != INVALID_WORD).then(|| fahrenheit_tenths_to_celsius(temp_out_raw));

    let wind_gust_10min_kph = (bytes[14] != INVALID_BYTE)
        .then(|| round1(bytes[14] as f64 * MPH_TO_KPH_LOOP_TABLE));
    let wind_speed_kph = (bytes[15] != INVALID_BYTE)
        .then(|| round1(bytes[15] as f64 * MPH_TO_KPH_LOOP_TABLE));

    let wind_direction_raw = read_u16_le(bytes, 16);
    let wind_direction_deg = (wind_direction_raw != INVALID_WORD).then_some(wind_direction_raw);

    let humidity_out_pct = (bytes[33] != INVALID_BYTE).then_some(bytes[33]);

    let rain_rate_raw = read_u16_le(bytes, 41);
    let rain_rate_mm_per_h = (rain_rate_raw != INVALID_WORD).then(|| round1(rain_rate_raw as f64 * 0.2));

    let uv_index = (bytes[43] != INVALID_BYTE).then(|| round1(bytes[43] as f64 / 10.0));

    let solar_radiation_raw = read_u16_le(bytes, 44);
    let solar_radiation_wm2 =
        (solar_radiation_raw != INVALID_WORD).then(|| round1(solar_radiation_raw as f64));

    let rain_daily_raw = read_u16_le(bytes, 50);
    let rain_daily_mm = (rain_daily_raw != INVALID_WORD).then(|| round1(rain_daily_raw as f64 * 0.2));

    let battery_raw = read_u16_le(bytes, 87);
    let console_battery_v = (battery_raw != INVALID_WORD)
        .then(|| round1(battery_raw as f64 * 300.0 / 512.0 / 100.0));

    Ok(LoopRecord {
        barometer_trend,
        next_archive_record,
        pressure_hpa,
        temp_in_c,
        humidity_in_pct,
        temp_out_c,
        wind_gust_10min_kph,
        wind_speed_kph,
        wind_direction_deg,
        humidity_out_pct,
        rain_rate_mm_per_h,
        uv_index,
        solar_radiation_wm2,
        rain_daily_mm,
        console_battery_v,
    })
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ArchiveRecord {
    pub timestamp: DateTime<Utc>,
    pub temp_out_avg_c: Option<f64>,
    pub temp_out_high_c: Option<f64>,
    pub temp_out_low_c: Option<f64>,
    pub rain_total_mm: Option<f64>,
    pub rain_peak_rate_mm_per_h: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub solar_radiation_wm2: Option<f64>,
    pub temp_in_c: Option<f64>,
    pub humidity_in_pct: Option<u8>,
    pub humidity_out_pct: Option<u8>,
    pub wind_avg_kph: Option<f64>,
    pub wind_peak_kph: Option<f64>,
    pub wind_avg_direction_deg: Option<f64>,
    pub wind_peak_direction_deg: Option<f64>,
    pub uv_index: Option<f64>,
    pub et_mm: Option<f64>,
    pub solar_radiation_high_wm2: Option<f64>,
    pub uv_index_high: Option<f64>,
}

/// Decodes the packed Davis date/time words into a timestamp. The console
/// encodes wall-clock values with no timezone; per spec.md §9's open
/// question, this core interprets them as the host process's local time and
/// converts to UTC for storage, keeping the source's local-zone semantics
/// explicit rather than silently treating console time as UTC.
fn decode_timestamp(date_word: u16, time_word: u16) -> Result<DateTime<Utc>, String> {
    let day = (date_word & 0x1F) as u32;
    let month = ((date_word >> 5) & 0x0F) as u32;
    let year = 2000 + ((date_word >> 9) & 0x7F) as i32;
    let hour = (time_word / 100) as u32;
    let minute = (time_word % 100) as u32;

    Local
        .with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| format!("invalid archive timestamp: {year}-{month}-{day} {hour}:{minute}"))
}

/// Decodes a 52-byte archive record. `bytes` must be exactly `ARCHIVE_LEN`
/// long and already CRC-verified by the caller.
pub fn parse_archive(bytes: &[u8]) -> Result<ArchiveRecord, String> {
    if bytes.len() != ARCHIVE_LEN {
        return Err(format!("archive record must be {ARCHIVE_LEN} bytes, got {}", bytes.len()));
    }

    let date_word = read_u16_le(bytes, 0);
    let time_word = read_u16_le(bytes, 2);
    let timestamp = decode_timestamp(date_word, time_word)?;

    let temp = |offset: usize| -> Option<f64> {
        let raw = read_i16_le(bytes, offset);
        (raw as u16 != INVALID_WORD).then(|| fahrenheit_tenths_to_celsius(raw))
    };

    let word = |offset: usize| -> Option<u16> {
        let raw = read_u16_le(bytes, offset);
        (raw != INVALID_WORD).then_some(raw)
    };

    let byte_pct = |offset: usize| -> Option<u8> { (bytes[offset] != INVALID_BYTE).then_some(bytes[offset]) };

    let byte_speed = |offset: usize| -> Option<f64> {
        (bytes[offset] != INVALID_BYTE).then(|| round1(bytes[offset] as f64 * MPH_TO_KPH_LOOP_TABLE))
    };

    let byte_compass = |offset: usize| -> Option<f64> {
        (bytes[offset] != INVALID_BYTE).then(|| round1(bytes[offset] as f64 * 22.5))
    };

    Ok(ArchiveRecord {
        timestamp,
        temp_out_avg_c: temp(4),
        temp_out_high_c: temp(6),
        temp_out_low_c: temp(8),
        rain_total_mm: word(10).map(|raw| round1(raw as f64 * 0.2)),
        rain_peak_rate_mm_per_h: word(12).map(|raw| round1(raw as f64 * 0.2)),
        pressure_hpa: word(14).map(|raw| round1(raw as f64 / 1000.0 * INHG_TO_HPA)),
        solar_radiation_wm2: word(16).map(|raw| round1(raw as f64)),
        temp_in_c: temp(20),
        humidity_in_pct: byte_pct(22),
        humidity_out_pct: byte_pct(23),
        wind_avg_kph: byte_speed(24),
        wind_peak_kph: byte_speed(25),
        wind_avg_direction_deg: byte_compass(26),
        wind_peak_direction_deg: byte_compass(27),
        uv_index: (bytes[28] != INVALID_BYTE).then(|| round1(bytes[28] as f64 / 10.0)),
        et_mm: (bytes[29] != INVALID_BYTE).then(|| round1(bytes[29] as f64 / 1000.0 * 25.4)),
        solar_radiation_high_wm2: word(30).map(|raw| round1(raw as f64)),
        uv_index_high: (bytes[32] != INVALID_BYTE).then(|| round1(bytes[32] as f64 / 10.0)),
    })
}

/// Encodes an instant's `(year, month, day)` into the Davis packed date word,
/// interpreting the instant in local time to match `decode_timestamp`.
pub fn encode_date(instant: DateTime<Utc>) -> [u8; 2] {
    let local = instant.with_timezone(&Local);
    use chrono::Datelike;
    let day = local.day() as u16;
    let month = local.month() as u16;
    let year_offset = (local.year() - 2000).max(0) as u16;
    let word = day | (month << 5) | (year_offset << 9);
    word.to_le_bytes()
}

/// Encodes an instant's `(hour, minute)` into the Davis packed time word.
pub fn encode_time(instant: DateTime<Utc>) -> [u8; 2] {
    let local = instant.with_timezone(&Local);
    use chrono::Timelike;
    let word = local.hour() * 100 + local.minute();
    (word as u16).to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc16;

    fn sample_loop_bytes() -> [u8; LOOP_LEN] {
        let mut bytes = [0u8; LOOP_LEN];
        bytes[0..3].copy_from_slice(b"LOO");
        // 72.0 F * 10 = 720 = 0x02D0, little-endian [0xD0, 0x02]
        bytes[12] = 0xD0;
        bytes[13] = 0x02;
        bytes[33] = 0xFF; // invalid humidity_out sentinel
        bytes
    }

    #[test]
    fn temp_out_converts_fahrenheit_tenths_to_celsius() {
        let record = parse_loop(&sample_loop_bytes()).unwrap();
        assert_eq!(record.temp_out_c, Some(22.2));
    }

    #[test]
    fn invalid_humidity_sentinel_decodes_to_none() {
        let record = parse_loop(&sample_loop_bytes()).unwrap();
        assert_eq!(record.humidity_out_pct, None);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(parse_loop(&[0u8; 10]).is_err());
    }

    #[test]
    fn encode_date_time_round_trip_through_decode() {
        let instant = Local
            .with_ymd_and_hms(2024, 6, 15, 14, 37, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc);
        let date_bytes = encode_date(instant);
        let time_bytes = encode_time(instant);
        let date_word = u16::from_le_bytes(date_bytes);
        let time_word = u16::from_le_bytes(time_bytes);
        let decoded = decode_timestamp(date_word, time_word).unwrap();
        let decoded_local = decoded.with_timezone(&Local);
        use chrono::{Datelike, Timelike};
        assert_eq!(decoded_local.year(), 2024);
        assert_eq!(decoded_local.month(), 6);
        assert_eq!(decoded_local.day(), 15);
        assert_eq!(decoded_local.hour(), 14);
        assert_eq!(decoded_local.minute(), 37);
    }

    #[test]
    fn crc_over_framed_loop_packet_folds_to_zero() {
        let mut bytes = sample_loop_bytes().to_vec();
        bytes.truncate(LOOP_LEN - 2);
        let crc = crc16::compute(&bytes);
        bytes.extend_from_slice(&crc16::to_be_bytes(crc));
        assert!(crc16::verify(&bytes));
    }
}

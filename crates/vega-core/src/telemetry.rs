//! Decoding of the detector's DATA_BUF telemetry buffer.
//!
//! The buffer is a stream of records, each with a 7-byte header
//! (`seq:u8, eid:u8, gid:u8, ts_offset:i32`) followed by a payload whose shape
//! depends on `(eid, gid)`. Only the real-time record `(0, 0)` is interpreted;
//! every other known record type is skipped by size. The walk stops at the end
//! of the buffer, at a sequence break, or at an unknown record type.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::DeviceId;
use crate::frame::{FrameReader, FrameResult};

/// Factor from the device-native dose rate to µSv/h.
///
/// Applied when a [`RealtimeRecord`] becomes a [`Reading`], never inside the
/// decoder.
pub const DOSE_RATE_DISPLAY_SCALE: f64 = 10_000.0;

/// Size of the per-record header.
const RECORD_HEADER_LEN: usize = 7;

/// Newest real-time sample found in a telemetry buffer, in device units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RealtimeRecord {
    /// Dose rate in the device-native unit.
    pub dose_rate: f32,
    /// Count rate in counts per second.
    pub count_rate: f32,
    /// Relative uncertainty of the count rate, percent.
    pub count_rate_err_pct: f32,
    /// Relative uncertainty of the dose rate, percent.
    pub dose_rate_err_pct: f32,
    /// Record flags as transmitted.
    pub flags: u16,
}

/// A decoded reading attributed to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Reading {
    /// Owning device id.
    #[schema(value_type = Uuid, example = "0190f4c2-7a1b-7c3e-9a55-3c2d1e0f4a5b")]
    pub device_id: DeviceId,

    /// Dose rate in µSv/h.
    #[schema(example = 0.12)]
    pub dose_rate: f64,

    /// Count rate in counts per second.
    #[schema(example = 4.5)]
    pub count_rate: f64,

    /// Wall-clock timestamp, milliseconds since the Unix epoch.
    #[schema(example = 1_736_912_400_000_i64)]
    pub timestamp_ms: i64,
}

impl Reading {
    /// Builds a display-unit reading from a raw record.
    #[must_use]
    pub fn from_record(device_id: DeviceId, record: &RealtimeRecord, timestamp_ms: i64) -> Self {
        Self {
            device_id,
            dose_rate: f64::from(record.dose_rate) * DOSE_RATE_DISPLAY_SCALE,
            count_rate: f64::from(record.count_rate),
            timestamp_ms,
        }
    }
}

/// Payload shape of a record, by `(eid, gid)`.
enum RecordKind {
    RealTime,
    Fixed(usize),
    Samples { bytes_per_sample: usize },
}

fn record_kind(eid: u8, gid: u8) -> Option<RecordKind> {
    let kind = match (eid, gid) {
        (0, 0) => RecordKind::RealTime,
        // raw data: count_rate f32, dose_rate f32
        (0, 1) => RecordKind::Fixed(8),
        // dose-rate db, user data, schedule data: u32 f32 f32 u16 u16
        (0, 2 | 7 | 8) => RecordKind::Fixed(16),
        // rare data: duration u32, dose f32, temperature u16, charge u16, flags u16
        (0, 3) => RecordKind::Fixed(14),
        // accelerometer: x, y, z
        (0, 9) => RecordKind::Fixed(6),
        // event: event u8, param u8, flags u16
        (0, 10) => RecordKind::Fixed(4),
        // raw count rate / raw dose rate: f32 + flags u16
        (0, 11 | 12) => RecordKind::Fixed(6),
        (1, 1) => RecordKind::Samples { bytes_per_sample: 8 },
        (1, 2) => RecordKind::Samples { bytes_per_sample: 16 },
        (1, 3) => RecordKind::Samples { bytes_per_sample: 14 },
        _ => return None,
    };
    Some(kind)
}

fn read_realtime(reader: &mut FrameReader<'_>) -> FrameResult<RealtimeRecord> {
    let count_rate = reader.read_f32_le()?;
    let dose_rate = reader.read_f32_le()?;
    let count_rate_err = reader.read_u16_le()?;
    let dose_rate_err = reader.read_u16_le()?;
    let flags = reader.read_u16_le()?;
    let _rt_flags = reader.read_u8()?;
    Ok(RealtimeRecord {
        dose_rate,
        count_rate,
        count_rate_err_pct: f32::from(count_rate_err) / 10.0,
        dose_rate_err_pct: f32::from(dose_rate_err) / 10.0,
        flags,
    })
}

fn skip_samples(reader: &mut FrameReader<'_>, bytes_per_sample: usize) -> FrameResult<()> {
    let samples = reader.read_u16_le()?;
    let _sample_time_ms = reader.read_u32_le()?;
    reader.skip(usize::from(samples) * bytes_per_sample)
}

/// Returns the newest real-time record in `buf`, or `None` if there is none.
///
/// Never fails: a truncated record, a sequence break or an unknown record type
/// ends the walk, and whatever real-time record was seen before is returned.
#[must_use]
pub fn decode_latest_realtime(buf: &[u8]) -> Option<RealtimeRecord> {
    let mut reader = FrameReader::new(buf);
    let mut latest = None;
    let mut expected_seq: Option<u8> = None;

    while reader.remaining() >= RECORD_HEADER_LEN {
        let Ok((seq, eid, gid)) = read_header(&mut reader) else {
            break;
        };
        if expected_seq.is_some_and(|expected| expected != seq) {
            tracing::trace!(seq, ?expected_seq, "telemetry sequence break");
            break;
        }
        expected_seq = Some(seq.wrapping_add(1));

        let Some(kind) = record_kind(eid, gid) else {
            tracing::trace!(eid, gid, "unknown telemetry record, stopping");
            break;
        };
        let step = match kind {
            RecordKind::RealTime => read_realtime(&mut reader).map(|record| {
                latest = Some(record);
            }),
            RecordKind::Fixed(len) => reader.skip(len),
            RecordKind::Samples { bytes_per_sample } => skip_samples(&mut reader, bytes_per_sample),
        };
        if step.is_err() {
            break;
        }
    }

    latest
}

fn read_header(reader: &mut FrameReader<'_>) -> FrameResult<(u8, u8, u8)> {
    let seq = reader.read_u8()?;
    let eid = reader.read_u8()?;
    let gid = reader.read_u8()?;
    let _ts_offset = reader.read_i32_le()?;
    Ok((seq, eid, gid))
}

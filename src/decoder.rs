//! Sample batch decoding.
//!
//! A sample record holds the global signals first, then one block of peak
//! signals per channel. Two layouts exist:
//!
//! - **Double**: every slot is an `f64`, so peak signal `k` of channel `c` sits
//!   at slot `global_count + c * peak_count + k`.
//! - **Raw**: slots keep their native width and records are packed without
//!   padding.
//!
//! [`SampleDecoder`] caches the layout derived from a catalog and re-derives it
//! whenever the batch carries a different format index or a format-change
//! status. Every [`DecodedBatch`] keeps the layout it was decoded with, so a
//! later rebuild never changes what an earlier batch reports.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::error::{AppResult, DaqError};
use crate::protocol::ids::{OutputDataMode, ReadStatus};
use crate::signal::{DataType, SignalCatalog};

/// A block of samples as read from the device.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    /// Outcome of the read.
    pub status: ReadStatus,
    /// Records held in `data`.
    pub sample_count: usize,
    /// Encoding of the records.
    pub mode: OutputDataMode,
    /// Packed records.
    pub data: Bytes,
    /// Catalog the device reported for this block.
    pub catalog: Arc<SignalCatalog>,
}

impl SampleBatch {
    /// No records.
    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }
}

/// A value read in its native width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawValue {
    /// Unsigned byte.
    U8(u8),
    /// Signed byte.
    I8(i8),
    /// Unsigned 16-bit.
    U16(u16),
    /// Signed 16-bit.
    I16(i16),
    /// Unsigned 32-bit.
    U32(u32),
    /// Signed 32-bit.
    I32(i32),
    /// Single precision float.
    F32(f32),
    /// Double precision float.
    F64(f64),
}

impl RawValue {
    fn read(data_type: DataType, bytes: &[u8]) -> Option<RawValue> {
        let b = bytes.get(..data_type.width())?;
        Some(match data_type {
            DataType::U8 => RawValue::U8(b[0]),
            DataType::I8 => RawValue::I8(b[0] as i8),
            DataType::U16 => RawValue::U16(u16::from_le_bytes([b[0], b[1]])),
            DataType::I16 => RawValue::I16(i16::from_le_bytes([b[0], b[1]])),
            DataType::U32 => RawValue::U32(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            DataType::I32 => RawValue::I32(i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            DataType::F32 => RawValue::F32(f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            DataType::F64 => RawValue::F64(f64::from_le_bytes([
                b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            ])),
        })
    }

    /// Widen to `f64` without loss.
    pub fn to_f64(self) -> f64 {
        match self {
            RawValue::U8(v) => f64::from(v),
            RawValue::I8(v) => f64::from(v),
            RawValue::U16(v) => f64::from(v),
            RawValue::I16(v) => f64::from(v),
            RawValue::U32(v) => f64::from(v),
            RawValue::I32(v) => f64::from(v),
            RawValue::F32(v) => f64::from(v),
            RawValue::F64(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct SlotInfo {
    data_type: DataType,
    /// Offset of the slot within a record (channel 0 for peak signals).
    offset: usize,
    global: bool,
}

/// Byte layout of one record, derived from a catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleLayout {
    format_index: u32,
    mode: OutputDataMode,
    stride: usize,
    channel_count: usize,
    /// Bytes between the same peak slot of consecutive channels.
    channel_stride: usize,
    slots: HashMap<u16, SlotInfo>,
}

impl SampleLayout {
    /// Slot offsets for `catalog` encoded in `mode`.
    ///
    /// In double mode every slot is 8 bytes wide regardless of its native type.
    pub fn derive(catalog: &SignalCatalog, mode: OutputDataMode) -> Self {
        let mut slots = HashMap::with_capacity(catalog.signals().len());
        let width = |t: DataType| match mode {
            OutputDataMode::Double => 8,
            OutputDataMode::Raw => t.width(),
        };
        let mut offset = 0;
        for s in catalog.global_signals() {
            slots.insert(
                s.id,
                SlotInfo {
                    data_type: s.data_type,
                    offset,
                    global: true,
                },
            );
            offset += width(s.data_type);
        }
        let peak_base = offset;
        let mut peak_offset = 0;
        for s in catalog.peak_signals() {
            slots.insert(
                s.id,
                SlotInfo {
                    data_type: s.data_type,
                    offset: peak_base + peak_offset,
                    global: false,
                },
            );
            peak_offset += width(s.data_type);
        }
        Self {
            format_index: catalog.format_index(),
            mode,
            stride: peak_base + catalog.channel_count() * peak_offset,
            channel_count: catalog.channel_count(),
            channel_stride: peak_offset,
            slots,
        }
    }

    /// Format index of the catalog this layout came from.
    pub fn format_index(&self) -> u32 {
        self.format_index
    }

    /// Data mode the layout expects.
    pub fn mode(&self) -> OutputDataMode {
        self.mode
    }

    /// Bytes per record.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Channels per record.
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Whether `id` has a slot.
    pub fn contains(&self, id: u16) -> bool {
        self.slots.contains_key(&id)
    }

    fn slot(&self, id: u16) -> AppResult<&SlotInfo> {
        self.slots.get(&id).ok_or(DaqError::InvalidSignalId(id))
    }

    /// Channels a signal occupies: 1 for global signals.
    pub fn channels_of(&self, id: u16) -> AppResult<usize> {
        let slot = self.slot(id)?;
        Ok(if slot.global { 1 } else { self.channel_count })
    }
}

/// One signal across a batch, row-major `[sample][channel]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalColumn {
    /// Values per sample.
    pub channels: usize,
    /// All values, row-major.
    pub values: Vec<f64>,
}

impl SignalColumn {
    /// Number of rows.
    pub fn sample_count(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.values.len() / self.channels
        }
    }

    /// Values of one channel in sample order.
    pub fn channel(&self, channel: usize) -> impl Iterator<Item = f64> + '_ {
        self.values
            .iter()
            .skip(channel)
            .step_by(self.channels.max(1))
            .copied()
    }

    /// Values of one sample; empty when out of range.
    pub fn row(&self, sample: usize) -> &[f64] {
        let start = sample * self.channels;
        self.values.get(start..start + self.channels).unwrap_or(&[])
    }
}

/// A batch bound to the layout it was decoded with.
#[derive(Debug, Clone)]
pub struct DecodedBatch {
    layout: Arc<SampleLayout>,
    data: Bytes,
    sample_count: usize,
    catalog: Arc<SignalCatalog>,
}

impl DecodedBatch {
    /// Records in the batch.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Layout used to read the records.
    pub fn layout(&self) -> &Arc<SampleLayout> {
        &self.layout
    }

    /// Catalog the batch was produced with.
    pub fn catalog(&self) -> &Arc<SignalCatalog> {
        &self.catalog
    }

    /// Whether the batch carries signal `id`.
    pub fn contains(&self, id: u16) -> bool {
        self.layout.contains(id)
    }

    fn check_sample(&self, sample: usize) -> AppResult<()> {
        if sample >= self.sample_count {
            return Err(DaqError::InvalidSampleNumber {
                index: sample,
                count: self.sample_count,
            });
        }
        Ok(())
    }

    /// Native-width value of `id` for one sample and channel.
    pub fn raw_value(&self, id: u16, sample: usize, channel: usize) -> AppResult<RawValue> {
        let slot = self.layout.slot(id)?;
        self.check_sample(sample)?;
        let channel = if slot.global { 0 } else { channel };
        if channel >= self.layout.channel_count.max(1) {
            return Err(DaqError::Protocol(format!(
                "channel {channel} out of range for signal {id}"
            )));
        }
        let at = sample * self.layout.stride + slot.offset + channel * self.layout.channel_stride;
        let data_type = match self.layout.mode {
            OutputDataMode::Double => DataType::F64,
            OutputDataMode::Raw => slot.data_type,
        };
        RawValue::read(data_type, self.data.get(at..).unwrap_or(&[])).ok_or_else(|| {
            DaqError::Protocol(format!("sample data truncated at byte {at}"))
        })
    }

    /// Value of `id` for one sample; channel 0 for peak signals.
    pub fn value(&self, id: u16, sample: usize) -> AppResult<f64> {
        self.raw_value(id, sample, 0).map(RawValue::to_f64)
    }

    /// Values of `id` for one sample, one per channel.
    pub fn values(&self, id: u16, sample: usize) -> AppResult<Vec<f64>> {
        let channels = self.layout.channels_of(id)?;
        (0..channels)
            .map(|c| self.raw_value(id, sample, c).map(RawValue::to_f64))
            .collect()
    }

    /// `id` across every sample.
    pub fn values_all(&self, id: u16) -> AppResult<SignalColumn> {
        let channels = self.layout.channels_of(id)?;
        let mut values = Vec::with_capacity(channels * self.sample_count);
        for sample in 0..self.sample_count {
            for c in 0..channels {
                values.push(self.raw_value(id, sample, c)?.to_f64());
            }
        }
        Ok(SignalColumn { channels, values })
    }

    /// Channel-0 values of `id`, or `None` when the catalog lacks it.
    pub fn first_channel(&self, id: u16) -> Option<Vec<f64>> {
        if !self.contains(id) {
            return None;
        }
        (0..self.sample_count)
            .map(|s| self.value(id, s).ok())
            .collect()
    }

    /// Value of `id` in the newest sample.
    pub fn latest(&self, id: u16) -> Option<f64> {
        let last = self.sample_count.checked_sub(1)?;
        self.value(id, last).ok()
    }
}

/// Caches the layout for the current format index.
#[derive(Debug, Default)]
pub struct SampleDecoder {
    layout: Option<Arc<SampleLayout>>,
    rebuilds: u64,
}

impl SampleDecoder {
    /// Decoder with no layout yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Times the layout has been derived.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// The cached layout, if any.
    pub fn layout(&self) -> Option<&Arc<SampleLayout>> {
        self.layout.as_ref()
    }

    fn needs_rebuild(&self, batch: &SampleBatch) -> bool {
        match &self.layout {
            None => true,
            Some(layout) => {
                batch.status == ReadStatus::FormatChange
                    || layout.format_index != batch.catalog.format_index()
                    || layout.mode != batch.mode
            }
        }
    }

    /// Bind `batch` to a layout, deriving a new one on a format change.
    pub fn decode(&mut self, batch: &SampleBatch) -> AppResult<DecodedBatch> {
        if self.needs_rebuild(batch) {
            let layout = SampleLayout::derive(&batch.catalog, batch.mode);
            debug!(
                format_index = layout.format_index,
                stride = layout.stride,
                "sample layout derived"
            );
            self.layout = Some(Arc::new(layout));
            self.rebuilds += 1;
        }
        let layout = match &self.layout {
            Some(layout) => Arc::clone(layout),
            None => return Err(DaqError::State("no sample layout".into())),
        };
        let needed = layout.stride * batch.sample_count;
        if batch.data.len() < needed {
            return Err(DaqError::Protocol(format!(
                "batch holds {} bytes, {} samples need {needed}",
                batch.data.len(),
                batch.sample_count
            )));
        }
        Ok(DecodedBatch {
            layout,
            data: batch.data.clone(),
            sample_count: batch.sample_count,
            catalog: Arc::clone(&batch.catalog),
        })
    }
}

/// Pack values into a record stream of the given layout.
///
/// `value_of(id, channel)` supplies each slot. Used by drivers that produce
/// samples in software.
pub fn encode_record(
    catalog: &SignalCatalog,
    mode: OutputDataMode,
    out: &mut Vec<u8>,
    mut value_of: impl FnMut(u16, usize) -> f64,
) {
    let mut put = |data_type: DataType, v: f64| match mode {
        OutputDataMode::Double => out.extend_from_slice(&v.to_le_bytes()),
        OutputDataMode::Raw => match data_type {
            DataType::U8 => out.push(v as u8),
            DataType::I8 => out.push((v as i8) as u8),
            DataType::U16 => out.extend_from_slice(&(v as u16).to_le_bytes()),
            DataType::I16 => out.extend_from_slice(&(v as i16).to_le_bytes()),
            DataType::U32 => out.extend_from_slice(&(v as u32).to_le_bytes()),
            DataType::I32 => out.extend_from_slice(&(v as i32).to_le_bytes()),
            DataType::F32 => out.extend_from_slice(&(v as f32).to_le_bytes()),
            DataType::F64 => out.extend_from_slice(&v.to_le_bytes()),
        },
    };
    for s in catalog.global_signals() {
        put(s.data_type, value_of(s.id, 0));
    }
    for channel in 0..catalog.channel_count() {
        for s in catalog.peak_signals() {
            put(s.data_type, value_of(s.id, channel));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalDescriptor;

    fn catalog(format_index: u32) -> Arc<SignalCatalog> {
        Arc::new(
            SignalCatalog::new(
                format_index,
                2,
                2,
                vec![
                    SignalDescriptor::new(83, DataType::U16),
                    SignalDescriptor::new(65, DataType::I32),
                    SignalDescriptor::new(16640, DataType::I16),
                    SignalDescriptor::new(16641, DataType::I16),
                ],
            )
            .unwrap(),
        )
    }

    fn batch(catalog: Arc<SignalCatalog>, mode: OutputDataMode, n: usize) -> SampleBatch {
        let mut data = Vec::new();
        for sample in 0..n {
            encode_record(&catalog, mode, &mut data, |id, ch| match id {
                83 => sample as f64,
                65 => -(sample as f64) * 10.0,
                16640 => 1000.0 + (ch * 100 + sample) as f64,
                _ => (ch + 1) as f64,
            });
        }
        SampleBatch {
            status: ReadStatus::Success,
            sample_count: n,
            mode,
            data: Bytes::from(data),
            catalog,
        }
    }

    #[test]
    fn test_double_layout_interleaves_peaks_per_channel() {
        let layout = SampleLayout::derive(&catalog(1), OutputDataMode::Double);
        assert_eq!(layout.stride(), (2 + 2 * 2) * 8);
        assert_eq!(layout.slots[&16641].offset, 3 * 8);
        assert_eq!(layout.channel_stride, 2 * 8);
    }

    #[test]
    fn test_both_layouts_decode_same_values() {
        for mode in [OutputDataMode::Double, OutputDataMode::Raw] {
            let mut decoder = SampleDecoder::new();
            let decoded = decoder.decode(&batch(catalog(1), mode, 3)).unwrap();
            assert_eq!(decoded.value(83, 2).unwrap(), 2.0);
            assert_eq!(decoded.value(65, 1).unwrap(), -10.0);
            assert_eq!(decoded.values(16640, 1).unwrap(), vec![1001.0, 1101.0]);
            let col = decoded.values_all(16641).unwrap();
            assert_eq!(col.channels, 2);
            assert_eq!(col.channel(1).collect::<Vec<_>>(), vec![2.0, 2.0, 2.0]);
        }
    }

    #[test]
    fn test_raw_view_keeps_native_width() {
        let mut decoder = SampleDecoder::new();
        let decoded = decoder.decode(&batch(catalog(1), OutputDataMode::Raw, 2)).unwrap();
        assert_eq!(decoded.raw_value(83, 1, 0).unwrap(), RawValue::U16(1));
        assert_eq!(decoded.raw_value(16640, 0, 1).unwrap(), RawValue::I16(1100));
        assert_eq!(decoded.layout().stride(), 2 + 4 + 2 * 4);
    }

    #[test]
    fn test_lookup_errors() {
        let mut decoder = SampleDecoder::new();
        let decoded = decoder.decode(&batch(catalog(1), OutputDataMode::Double, 2)).unwrap();
        assert!(matches!(
            decoded.value(9, 0),
            Err(DaqError::InvalidSignalId(9))
        ));
        assert!(matches!(
            decoded.value(83, 2),
            Err(DaqError::InvalidSampleNumber { index: 2, count: 2 })
        ));
    }

    #[test]
    fn test_same_format_index_is_not_rebuilt_and_decodes_identically() {
        let mut decoder = SampleDecoder::new();
        let b = batch(catalog(1), OutputDataMode::Raw, 4);
        let first = decoder.decode(&b).unwrap().values_all(16640).unwrap();
        let replaced = SampleBatch {
            catalog: catalog(1),
            ..b.clone()
        };
        let second = decoder.decode(&replaced).unwrap().values_all(16640).unwrap();
        assert_eq!(first, second);
        assert_eq!(decoder.rebuilds(), 1);
    }

    #[test]
    fn test_format_change_status_forces_rebuild() {
        let mut decoder = SampleDecoder::new();
        let mut b = batch(catalog(1), OutputDataMode::Raw, 1);
        decoder.decode(&b).unwrap();
        b.status = ReadStatus::FormatChange;
        decoder.decode(&b).unwrap();
        assert_eq!(decoder.rebuilds(), 2);
    }

    #[test]
    fn test_short_buffer_is_protocol_error() {
        let mut decoder = SampleDecoder::new();
        let mut b = batch(catalog(1), OutputDataMode::Raw, 2);
        b.sample_count = 3;
        assert!(matches!(decoder.decode(&b), Err(DaqError::Protocol(_))));
    }
}

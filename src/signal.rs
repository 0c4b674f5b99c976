//! Output signal catalog.
//!
//! The device streams a set of signals chosen with `SODX`. Global signals
//! (sample counter, encoders, exposure flags) appear once per sample; peak
//! signals (distance, intensity) repeat once per channel. The catalog is
//! identified by a format index that changes whenever the device alters what
//! it streams.
//!
//! A [`SignalCatalog`] is never mutated after construction. [`CatalogCell`]
//! holds the current one and swaps in a replacement as a whole, so readers on
//! other workers always see either the old or the new catalog.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::protocol::ids::OutputDataMode;

/// Primitive type of one signal slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Unsigned byte.
    U8,
    /// Signed byte.
    I8,
    /// Unsigned 16-bit.
    U16,
    /// Signed 16-bit.
    I16,
    /// Unsigned 32-bit.
    U32,
    /// Signed 32-bit.
    I32,
    /// Single precision float.
    F32,
    /// Double precision float.
    F64,
}

impl DataType {
    /// Type for a wire code; unknown codes are a protocol error.
    pub fn from_code(code: u8) -> AppResult<Self> {
        Ok(match code {
            0 => DataType::U8,
            1 => DataType::I8,
            2 => DataType::U16,
            3 => DataType::I16,
            4 => DataType::U32,
            5 => DataType::I32,
            6 => DataType::F32,
            255 => DataType::F64,
            other => {
                return Err(DaqError::Protocol(format!(
                    "unknown signal data type {other}"
                )))
            }
        })
    }

    /// Wire code of the type.
    pub const fn code(self) -> u8 {
        match self {
            DataType::U8 => 0,
            DataType::I8 => 1,
            DataType::U16 => 2,
            DataType::I16 => 3,
            DataType::U32 => 4,
            DataType::I32 => 5,
            DataType::F32 => 6,
            DataType::F64 => 255,
        }
    }

    /// Element width in bytes.
    pub const fn width(self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::F64 => 8,
        }
    }
}

/// One signal the device outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDescriptor {
    /// Signal id.
    pub id: u16,
    /// Native type in raw mode.
    pub data_type: DataType,
}

impl SignalDescriptor {
    /// Descriptor for signal `id`.
    pub const fn new(id: u16, data_type: DataType) -> Self {
        Self { id, data_type }
    }
}

/// Signals the device currently streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalCatalog {
    format_index: u32,
    channel_count: usize,
    global_count: usize,
    signals: Vec<SignalDescriptor>,
}

impl SignalCatalog {
    /// `signals` lists the global signals first, then the peak signals.
    pub fn new(
        format_index: u32,
        channel_count: usize,
        global_count: usize,
        signals: Vec<SignalDescriptor>,
    ) -> AppResult<Self> {
        if global_count > signals.len() {
            return Err(DaqError::Protocol(format!(
                "catalog declares {global_count} global signals but lists {}",
                signals.len()
            )));
        }
        if channel_count == 0 && global_count < signals.len() {
            return Err(DaqError::Protocol(
                "catalog has peak signals but no channels".into(),
            ));
        }
        for (i, s) in signals.iter().enumerate() {
            if signals[..i].iter().any(|o| o.id == s.id) {
                return Err(DaqError::Protocol(format!(
                    "signal {} listed twice in catalog",
                    s.id
                )));
            }
        }
        Ok(Self {
            format_index,
            channel_count,
            global_count,
            signals,
        })
    }

    /// Catalog before the device reported anything.
    pub fn empty() -> Self {
        Self {
            format_index: 0,
            channel_count: 0,
            global_count: 0,
            signals: Vec::new(),
        }
    }

    /// Changes whenever the output layout changes.
    pub fn format_index(&self) -> u32 {
        self.format_index
    }

    /// Channels each peak signal spans.
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Signals emitted once per sample.
    pub fn global_count(&self) -> usize {
        self.global_count
    }

    /// Signals emitted once per channel.
    pub fn peak_count(&self) -> usize {
        self.signals.len() - self.global_count
    }

    /// Global signals first, then peak signals.
    pub fn signals(&self) -> &[SignalDescriptor] {
        &self.signals
    }

    /// Signals emitted once per sample.
    pub fn global_signals(&self) -> &[SignalDescriptor] {
        &self.signals[..self.global_count]
    }

    /// Signals emitted per channel.
    pub fn peak_signals(&self) -> &[SignalDescriptor] {
        &self.signals[self.global_count..]
    }

    /// Index of `id` in [`signals`](Self::signals).
    pub fn position(&self, id: u16) -> Option<usize> {
        self.signals.iter().position(|s| s.id == id)
    }

    /// Whether the catalog lists `id`.
    pub fn contains(&self, id: u16) -> bool {
        self.position(id).is_some()
    }

    /// Descriptor of `id`, or `InvalidSignalId`.
    pub fn descriptor(&self, id: u16) -> AppResult<&SignalDescriptor> {
        self.signals
            .iter()
            .find(|s| s.id == id)
            .ok_or(DaqError::InvalidSignalId(id))
    }

    /// `id` is in the global section.
    pub fn is_global(&self, id: u16) -> bool {
        self.position(id).is_some_and(|p| p < self.global_count)
    }

    /// Value slots in one sample record.
    pub fn slots_per_sample(&self) -> usize {
        self.global_count + self.channel_count * self.peak_count()
    }

    /// Bytes per sample record in the given layout.
    pub fn sample_width(&self, mode: OutputDataMode) -> usize {
        match mode {
            OutputDataMode::Double => self.slots_per_sample() * 8,
            OutputDataMode::Raw => {
                let global: usize = self.global_signals().iter().map(|s| s.data_type.width()).sum();
                let peak: usize = self.peak_signals().iter().map(|s| s.data_type.width()).sum();
                global + self.channel_count * peak
            }
        }
    }
}

/// Holder for the current catalog with whole-object replacement.
#[derive(Debug)]
pub struct CatalogCell {
    current: RwLock<Arc<SignalCatalog>>,
}

impl Default for CatalogCell {
    fn default() -> Self {
        Self::new(SignalCatalog::empty())
    }
}

impl CatalogCell {
    /// Cell holding `catalog`.
    pub fn new(catalog: SignalCatalog) -> Self {
        Self {
            current: RwLock::new(Arc::new(catalog)),
        }
    }

    /// Snapshot of the current catalog.
    pub fn load(&self) -> Arc<SignalCatalog> {
        self.current.read().clone()
    }

    /// Install `next`; returns the installed snapshot.
    pub fn replace(&self, next: SignalCatalog) -> Arc<SignalCatalog> {
        let next = Arc::new(next);
        *self.current.write() = Arc::clone(&next);
        next
    }

    /// Format index of the current catalog.
    pub fn format_index(&self) -> u32 {
        self.current.read().format_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SignalCatalog {
        SignalCatalog::new(
            4,
            2,
            1,
            vec![
                SignalDescriptor::new(83, DataType::U16),
                SignalDescriptor::new(16640, DataType::I16),
                SignalDescriptor::new(16641, DataType::I16),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_widths_follow_type_table() {
        let widths: Vec<usize> = [0u8, 1, 2, 3, 4, 5, 6, 255]
            .iter()
            .map(|c| DataType::from_code(*c).unwrap().width())
            .collect();
        assert_eq!(widths, vec![1, 1, 2, 2, 4, 4, 4, 8]);
        assert!(DataType::from_code(7).is_err());
    }

    #[test]
    fn test_catalog_layout_sizes() {
        let c = catalog();
        assert_eq!(c.peak_count(), 2);
        assert_eq!(c.slots_per_sample(), 5);
        assert_eq!(c.sample_width(OutputDataMode::Double), 40);
        assert_eq!(c.sample_width(OutputDataMode::Raw), 2 + 2 * 4);
        assert!(c.is_global(83));
        assert!(!c.is_global(16640));
        assert!(matches!(
            c.descriptor(1),
            Err(DaqError::InvalidSignalId(1))
        ));
    }

    #[test]
    fn test_catalog_rejects_inconsistent_counts() {
        assert!(SignalCatalog::new(1, 1, 3, vec![]).is_err());
        let dup = vec![
            SignalDescriptor::new(83, DataType::U16),
            SignalDescriptor::new(83, DataType::U16),
        ];
        assert!(SignalCatalog::new(1, 1, 2, dup).is_err());
    }

    #[test]
    fn test_cell_replacement_keeps_old_snapshots() {
        let cell = CatalogCell::new(catalog());
        let before = cell.load();
        cell.replace(SignalCatalog::new(5, 1, 1, vec![SignalDescriptor::new(83, DataType::U16)]).unwrap());
        assert_eq!(before.format_index(), 4);
        assert_eq!(before.signals().len(), 3);
        assert_eq!(cell.format_index(), 5);
        assert_eq!(cell.load().signals().len(), 1);
    }
}

//! Protocol vocabulary: command ids, signal ids and shared enumerations.
//!
//! Numeric values are fixed by the device firmware and the native library and
//! must not be renumbered.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::protocol::CommandId;

// ===== Command ids =====

/// Standard command set.
pub mod cmd {
    use super::CommandId;

    /// Output signal subscription.
    pub const OUTPUT_SIGNALS: CommandId = CommandId::pack("SODX");
    /// Firmware version string.
    pub const FIRMWARE_VERSION: CommandId = CommandId::pack("VER");
    /// Confocal or interferometric measuring.
    pub const MEASURING_METHOD: CommandId = CommandId::pack("MMD");
    /// Measuring range of the selected optical pen, in micrometres.
    pub const FULL_SCALE: CommandId = CommandId::pack("SCA");
    /// Sample rate in hertz.
    pub const SCAN_RATE: CommandId = CommandId::pack("SHZ");
    /// Samples averaged per output value.
    pub const DATA_AVERAGE: CommandId = CommandId::pack("AVD");
    /// Spectra averaged per sample.
    pub const SPECTRUM_AVERAGE: CommandId = CommandId::pack("AVS");
    /// Light source intensity in percent.
    pub const LAMP_INTENSITY: CommandId = CommandId::pack("LAI");
    /// Selected optical pen.
    pub const OPTICAL_PEN: CommandId = CommandId::pack("SEN");
    /// Calibrated pens known to the device.
    pub const PEN_LIST: CommandId = CommandId::pack("SENX");
    /// Peak detection threshold.
    pub const DETECTION_THRESHOLD: CommandId = CommandId::pack("THR");
    /// Peaks reported per channel.
    pub const NUMBER_OF_PEAKS: CommandId = CommandId::pack("NOP");
    /// Channel count of the device.
    pub const NUMBER_OF_CHANNELS: CommandId = CommandId::pack("NCH");
    /// Record a dark reference.
    pub const DARK_REFERENCE: CommandId = CommandId::pack("DRK");
    /// Record a dark reference at the current rate.
    pub const FAST_DARK_REFERENCE: CommandId = CommandId::pack("FDK");
    /// Resume the sample stream.
    pub const START_DATA_STREAM: CommandId = CommandId::pack("STA");
    /// Pause the sample stream.
    pub const STOP_DATA_STREAM: CommandId = CommandId::pack("STO");
    /// Full configuration dump.
    pub const CONF: CommandId = CommandId::pack("CONF");
    /// Serial number and device family.
    pub const DEVICE_TYPE: CommandId = CommandId::pack("PRSN");
    /// Persist the current settings on the device.
    pub const SAVE_SETTINGS: CommandId = CommandId::pack("SSU");
    /// Spectrum download.
    pub const DOWNLOAD_SPECTRUM: CommandId = CommandId::pack("DNLD");
    /// Encoder trigger parameter, indexed by [`super::etr`].
    pub const ENCODER_TRIGGER: CommandId = CommandId::pack("ETR");
    /// Encoder counter value of one axis.
    pub const ENCODER_POSITION: CommandId = CommandId::pack("ENC");
    /// Free-running measurement.
    pub const TRIGGER_CONTINUOUS: CommandId = CommandId::pack("CTN");
    /// Wait for a trigger, then run free.
    pub const TRIGGER_WAIT: CommandId = CommandId::pack("TRG");
    /// One sample per trigger.
    pub const TRIGGER_EACH: CommandId = CommandId::pack("TRE");
    /// Unsolicited device message.
    pub const MESSAGE: CommandId = CommandId::pack("MESG");

    // Library-internal ids that older firmware answers with.
    /// Trigger mode echo.
    pub const DEVICE_TRIGGER_MODE: CommandId = CommandId::pack("%TRM");
    /// Encoder trigger enable echo.
    pub const ENCODER_TRIGGER_ENABLED: CommandId = CommandId::pack("%ETE");
    /// Encoder trigger properties echo.
    pub const ENCODER_TRIGGER_PROPERTY: CommandId = CommandId::pack("%ETP");
    /// Encoder preload configuration.
    pub const ENCODER_PRELOAD_FUNCTION: CommandId = CommandId::pack("%EPF");
    /// Encoder counter echo.
    pub const ENCODER_COUNTER: CommandId = CommandId::pack("%EPS");
    /// Encoder counter trigger source.
    pub const ENCODER_COUNTER_SOURCE: CommandId = CommandId::pack("%ECS");
}

// ===== Signal ids =====

/// Output signal ids.
pub mod signal {
    /// Encoder counter, x axis.
    pub const ENCODER_X: u16 = 65;
    /// Encoder counter, y axis.
    pub const ENCODER_Y: u16 = 66;
    /// Encoder counter, z axis.
    pub const ENCODER_Z: u16 = 67;
    /// Encoder counter, u axis.
    pub const ENCODER_U: u16 = 68;
    /// Encoder counter, v axis.
    pub const ENCODER_V: u16 = 69;
    /// Exposure flags; bit 0 marks a trigger.
    pub const EXPOSURE_FLAGS: u16 = 76;
    /// Wrapping 16-bit sample counter.
    pub const SAMPLE_COUNTER: u16 = 83;

    /// First peak signal id, the distance of peak 1.
    pub const PEAK_BASE: u16 = 16640;
    /// Id distance between consecutive peaks of the same quantity.
    pub const PEAK_STRIDE: u16 = 8;
    /// Peaks a channel can report.
    pub const MAX_PEAKS: u16 = 4;

    /// Distance signal of peak `n` (0-based).
    pub const fn distance(peak: u16) -> u16 {
        PEAK_BASE + peak * PEAK_STRIDE
    }

    /// Intensity signal of peak `n` (0-based).
    pub const fn intensity(peak: u16) -> u16 {
        PEAK_BASE + 1 + peak * PEAK_STRIDE
    }

    /// Distance of the first peak.
    pub const DISTANCE_1: u16 = distance(0);
    /// Intensity of the first peak.
    pub const INTENSITY_1: u16 = intensity(0);

    fn peak_slot(id: u16) -> Option<(u16, u16)> {
        let rel = id.checked_sub(PEAK_BASE)?;
        let peak = rel / PEAK_STRIDE;
        (peak < MAX_PEAKS).then_some((peak, rel % PEAK_STRIDE))
    }

    /// Whether `id` is the distance signal of some peak.
    pub fn is_distance(id: u16) -> bool {
        matches!(peak_slot(id), Some((_, 0)))
    }

    /// Whether `id` is the intensity signal of some peak.
    pub fn is_intensity(id: u16) -> bool {
        matches!(peak_slot(id), Some((_, 1)))
    }

    /// 1-based peak number for display names.
    pub fn peak_number(id: u16) -> Option<u16> {
        peak_slot(id).map(|(peak, _)| peak + 1)
    }

    /// Encoder id for an axis index (0 = x ... 4 = v).
    pub fn encoder(axis: usize) -> Option<u16> {
        [ENCODER_X, ENCODER_Y, ENCODER_Z, ENCODER_U, ENCODER_V]
            .get(axis)
            .copied()
    }
}

macro_rules! code_enum {
    (
        $(#[$meta:meta])* $name:ident : $repr:ty {
            $($(#[$vmeta:meta])* $variant:ident = $value:expr),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Numeric code as used by the library.
            pub const fn code(self) -> $repr {
                match self {
                    $($name::$variant => $value),+
                }
            }

            /// Variant for a library code; unknown codes are a protocol error.
            pub fn from_code(code: $repr) -> AppResult<Self> {
                match code {
                    $(v if v == $value => Ok($name::$variant),)+
                    other => Err(DaqError::Protocol(format!(
                        "unknown {} code {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

code_enum! {
    /// Device family selector.
    DeviceType: i32 {
        /// Single-channel first generation.
        Chr1 = 0,
        /// Single-channel second generation.
        Chr2 = 1,
        /// Multi-channel line sensor.
        MultiChannel = 2,
        /// Compact single-channel sensor.
        Compact = 3,
    }
}

code_enum! {
    /// Blocking (request/reply) or non-blocking (ticketed) connection.
    OperationMode: i32 {
        /// Each command waits for its reply.
        Blocking = 0,
        /// Commands return a ticket; replies arrive by callback.
        NonBlocking = 1,
    }
}

code_enum! {
    /// Sample layout delivered by the library.
    OutputDataMode: i32 {
        /// Every value widened to `f64`.
        Double = 0,
        /// Values in their native width.
        Raw = 1,
    }
}

code_enum! {
    /// Status reported alongside a sample read.
    ReadStatus: i32 {
        /// Fewer samples than requested were ready.
        NotEnough = 0,
        /// Samples delivered.
        Success = 1,
        /// A command response arrived instead.
        Response = 2,
        /// The destination buffer is too small.
        BufferSmall = 3,
        /// The library buffer overflowed.
        BufferFull = 4,
        /// The output signal format changed.
        FormatChange = 5,
    }
}

code_enum! {
    /// State of the active auto buffer.
    AutoBufferStatus: i32 {
        /// The device failed to fill the buffer.
        Error = -1,
        /// Samples are still being saved.
        Saving = 0,
        /// The buffer is full.
        Finished = 1,
        /// A command response interrupted saving.
        ReceivedResponse = 2,
        /// No buffer is active.
        Deactivated = 3,
        /// No buffer was ever activated.
        Uninitialized = 4,
    }
}

code_enum! {
    /// Trigger mode as the device reports it.
    DeviceTriggerMode: i32 {
        /// Measure continuously.
        FreeRun = 0,
        /// Wait for one trigger, then run free.
        WaitTrigger = 1,
        /// One sample per trigger.
        TriggerEach = 2,
        /// Measure while the trigger is active.
        TriggerWindow = 3,
    }
}

code_enum! {
    /// Spectrum kinds available for download.
    SpectrumType: i32 {
        /// Raw detector spectrum.
        Raw = 0,
        /// Confocal spectrum.
        Confocal = 1,
        /// Interferometric Fourier transform.
        FourierTransform = 2,
        /// Detector image.
        Image = 3,
    }
}

/// Library behaviour flags.
pub mod lib_flag {
    /// Answer commands while an auto buffer is active by deactivating it.
    pub const RSP_DEACTIVATE_AUTO_BUFFER: u32 = 1;
    /// Let the library grow its sample buffer.
    pub const AUTO_CHANGE_DATA_BUFFER_SIZE: u32 = 2;
    /// Reject calls from a thread other than the opener.
    pub const CHECK_THREAD_ID: u32 = 4;
}

/// Encoder preload configuration bits.
pub mod encoder_preload {
    /// Preload on the first event only.
    pub const ONCE: u32 = 0;
    /// Preload on every event.
    pub const EACH_TIME: u32 = 1;
    /// Rising edge.
    pub const TRIGGER_RISING_EDGE: u32 = 0;
    /// Falling edge.
    pub const TRIGGER_FALLING_EDGE: u32 = 2;
    /// Edge sensitive.
    pub const TRIGGER_ON_EDGE: u32 = 0;
    /// Level sensitive.
    pub const TRIGGER_ON_LEVEL: u32 = 4;
    /// Preload armed.
    pub const ACTIVE: u32 = 8;
}

// ===== Encoder trigger source =====

/// Encoder counter trigger source.
///
/// The library publishes two overlapping code ranges: the input pins A0..B4
/// (0..=9) and the named sources `SyncIn` (1, same as B0) and `Immediate` /
/// `Quadrature` (15). A code therefore does not identify a source on its own;
/// [`EncoderTriggerSource::interpretations`] returns every reading of a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncoderTriggerSource {
    /// Input pin A0.
    A0,
    /// Input pin B0.
    B0,
    /// Input pin A1.
    A1,
    /// Input pin B1.
    B1,
    /// Input pin A2.
    A2,
    /// Input pin B2.
    B2,
    /// Input pin A3.
    A3,
    /// Input pin B3.
    B3,
    /// Input pin A4.
    A4,
    /// Input pin B4.
    B4,
    /// Synchronisation input, wired to B0.
    SyncIn,
    /// Quadrature decoder output.
    Quadrature,
    /// Trigger without waiting for an input.
    Immediate,
}

impl EncoderTriggerSource {
    /// Numeric code as used by the library.
    pub const fn code(self) -> i32 {
        use EncoderTriggerSource::*;
        match self {
            A0 => 0,
            B0 | SyncIn => 1,
            A1 => 2,
            B1 => 3,
            A2 => 4,
            B2 => 5,
            A3 => 6,
            B3 => 7,
            A4 => 8,
            B4 => 9,
            Quadrature | Immediate => 15,
        }
    }

    /// All sources that share `code`, pin range first.
    pub fn interpretations(code: i32) -> Vec<EncoderTriggerSource> {
        use EncoderTriggerSource::*;
        [
            A0, B0, A1, B1, A2, B2, A3, B3, A4, B4, SyncIn, Quadrature, Immediate,
        ]
        .into_iter()
        .filter(|s| s.code() == code)
        .collect()
    }
}

/// Encoder-trigger parameter indices used with `ETR <index> <value>`.
pub mod etr {
    /// First trigger position.
    pub const START: i32 = 0;
    /// Last trigger position.
    pub const STOP: i32 = 1;
    /// Distance between trigger positions.
    pub const INTERVAL: i32 = 2;
    /// Arm (1) or disarm (0).
    pub const ENABLE: i32 = 3;
    /// Also trigger on the way back.
    pub const ON_RETURN: i32 = 4;
    /// Encoder axis the trigger follows.
    pub const AXIS: i32 = 5;
    /// Repeat the trigger window endlessly.
    pub const ENDLESS: i32 = 7;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_ids_match_library_values() {
        assert_eq!(cmd::OUTPUT_SIGNALS.raw(), 0x5844_4F53);
        assert_eq!(cmd::SCAN_RATE.raw(), 0x005A_4853);
        assert_eq!(cmd::FULL_SCALE.raw(), 0x0041_4353);
        assert_eq!(cmd::START_DATA_STREAM.raw(), 0x0041_5453);
        assert_eq!(cmd::STOP_DATA_STREAM.raw(), 0x004F_5453);
        assert_eq!(cmd::DEVICE_TRIGGER_MODE.raw(), 0x4D52_5425);
        assert_eq!(cmd::ENCODER_TRIGGER_PROPERTY.raw(), 0x5054_4525);
        assert_eq!(cmd::ENCODER_COUNTER.raw(), 0x5350_4525);
        assert_eq!(cmd::CONF.raw(), 0x464E_4F43);
    }

    #[test]
    fn test_peak_signal_classification() {
        assert_eq!(signal::distance(2), 16656);
        assert_eq!(signal::intensity(3), 16665);
        assert!(signal::is_distance(16648));
        assert!(signal::is_intensity(16649));
        assert!(!signal::is_distance(16649));
        assert!(!signal::is_distance(83));
        assert!(!signal::is_distance(16640 + 8 * 4));
        assert_eq!(signal::peak_number(16657), Some(3));
    }

    #[test]
    fn test_code_enum_round_trip_and_rejection() {
        assert_eq!(ReadStatus::from_code(5).ok(), Some(ReadStatus::FormatChange));
        assert_eq!(AutoBufferStatus::Error.code(), -1);
        assert_eq!(OutputDataMode::Raw.code(), 1);
        assert!(DeviceType::from_code(7).is_err());
    }

    #[test]
    fn test_encoder_source_codes_overlap_explicitly() {
        let one = EncoderTriggerSource::interpretations(1);
        assert_eq!(
            one,
            vec![EncoderTriggerSource::B0, EncoderTriggerSource::SyncIn]
        );
        let fifteen = EncoderTriggerSource::interpretations(15);
        assert_eq!(fifteen.len(), 2);
        assert!(fifteen.contains(&EncoderTriggerSource::Immediate));
        assert!(EncoderTriggerSource::interpretations(12).is_empty());
    }
}

//! Connection and acquisition settings using Figment.
//!
//! Settings are layered:
//! 1. Built-in defaults
//! 2. A TOML file (optional)
//! 3. Environment variables prefixed with `CHR_DAQ_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use chr_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/chr_daq.toml")?;
//! println!("Sensor at {}", settings.connection.address);
//! # Ok::<(), chr_daq::error::DaqError>(())
//! ```
//!
//! ```toml
//! [connection]
//! address = "192.168.170.3"
//! device_type = "MultiChannel"
//! timeout = "10ms"
//!
//! [acquisition]
//! refresh_hz = 20.0
//! distance_plot_hz = 2.0
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::protocol::ids::{DeviceType, OperationMode};

/// Transport buffer size used when the configured one is 0 or negative.
pub const DEFAULT_BUFFER_SIZE: i64 = 32 * 1024 * 1024;

/// Options recognized when opening a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Address or host identifier of the sensor.
    pub address: String,
    /// Device family the address resolves to.
    pub device_type: DeviceType,
    /// Blocking or non-blocking command handling.
    pub mode: OperationMode,
    /// Maximum samples returned by one pull.
    pub max_samples_per_pull: usize,
    /// Read timeout; zero returns immediately with whatever is available.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Library transport buffer in bytes, power of two; `<= 0` selects 32 MiB.
    pub buffer_size: i64,
    /// Vendor library to load instead of the default search.
    pub library_path: Option<PathBuf>,
    /// Driver configuration file, applied before the first connection opens.
    pub ini_file: Option<PathBuf>,
    /// Directory for the driver's own log files.
    pub log_dir: Option<PathBuf>,
    /// Size cap of one driver log file.
    pub log_max_file_kib: u32,
    /// Number of rotated driver log files.
    pub log_max_files: u32,
    /// Keep an auto buffer running in non-blocking mode.
    pub async_auto_buffer: bool,
    /// Reactivate the auto buffer once it fills.
    pub async_auto_activate: bool,
    /// Bound on waiting for outstanding tickets when closing.
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,
    /// Interval between outstanding-ticket checks while closing.
    #[serde(with = "humantime_serde")]
    pub close_poll: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: "192.168.170.3".to_string(),
            device_type: DeviceType::MultiChannel,
            mode: OperationMode::Blocking,
            max_samples_per_pull: 32_000,
            timeout: Duration::from_millis(10),
            buffer_size: 0,
            library_path: None,
            ini_file: None,
            log_dir: None,
            log_max_file_kib: 1024,
            log_max_files: 10,
            async_auto_buffer: true,
            async_auto_activate: true,
            close_timeout: Duration::from_secs(5),
            close_poll: Duration::from_millis(500),
        }
    }
}

impl ConnectionConfig {
    /// Buffer size handed to the library.
    pub fn effective_buffer_size(&self) -> i64 {
        if self.buffer_size <= 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.buffer_size
        }
    }

    /// Same settings in another operating mode.
    pub fn with_mode(&self, mode: OperationMode) -> Self {
        Self {
            mode,
            ..self.clone()
        }
    }

    /// Reject options the driver cannot open with.
    pub fn validate(&self) -> AppResult<()> {
        if self.address.trim().is_empty() {
            return Err(DaqError::Configuration("address must not be empty".into()));
        }
        if self.buffer_size > 0 && (self.buffer_size as u64).count_ones() != 1 {
            return Err(DaqError::Configuration(format!(
                "buffer_size {} is not a power of two",
                self.buffer_size
            )));
        }
        if self.max_samples_per_pull == 0 {
            return Err(DaqError::Configuration(
                "max_samples_per_pull must be positive".into(),
            ));
        }
        if let Some(ini) = &self.ini_file {
            if !ini.is_file() {
                return Err(DaqError::Configuration(format!(
                    "ini file {} does not exist",
                    ini.display()
                )));
            }
        }
        if let Some(dir) = &self.log_dir {
            if !dir.is_dir() {
                return Err(DaqError::Configuration(format!(
                    "log directory {} does not exist",
                    dir.display()
                )));
            }
        }
        if self.close_poll.is_zero() {
            return Err(DaqError::Configuration("close_poll must be positive".into()));
        }
        Ok(())
    }
}

/// Cadences and capacities of the acquisition workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Target rate of reads from the device.
    pub refresh_hz: f64,
    /// Samples requested per pull until the scan rate is known.
    pub default_pull_count: usize,
    /// Skip a read until the latest values were consumed.
    pub gate_on_consumer: bool,
    /// Update rate of the sample rate plot.
    pub sample_rate_plot_hz: f64,
    /// Update rate of the distance plot.
    pub distance_plot_hz: f64,
    /// Update rate of the trigger loss check.
    pub trigger_verify_hz: f64,
    /// Bound of each distribution queue, in batches.
    pub queue_capacity: usize,
    /// Time span a plot series keeps before trimming.
    #[serde(with = "humantime_serde")]
    pub retention_window: Duration,
    /// Fraction of the oldest points dropped on each trim.
    pub trim_fraction: f64,
    /// Pause between auto buffer polls during a scan.
    #[serde(with = "humantime_serde")]
    pub scan_poll: Duration,
    /// Longest wait for one scan line to fill.
    #[serde(with = "humantime_serde")]
    pub scan_line_timeout: Duration,
    /// Bound on each teardown step.
    #[serde(with = "humantime_serde")]
    pub teardown_timeout: Duration,
    /// Rate at which the dispatcher drains responses.
    pub dispatcher_hz: f64,
    /// Raw intensity treated as saturation.
    pub saturation_level: f64,
    /// Where trigger loss reports are written.
    pub report_dir: PathBuf,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            refresh_hz: 20.0,
            default_pull_count: 200,
            gate_on_consumer: true,
            sample_rate_plot_hz: 4.0,
            distance_plot_hz: 2.0,
            trigger_verify_hz: 10.0,
            queue_capacity: 64,
            retention_window: Duration::from_secs(10),
            trim_fraction: 0.2,
            scan_poll: Duration::from_millis(250),
            scan_line_timeout: Duration::from_secs(60),
            teardown_timeout: Duration::from_secs(5),
            dispatcher_hz: 32.0,
            saturation_level: 4095.0,
            report_dir: PathBuf::from("TrigLostReport"),
        }
    }
}

/// Period for a rate in hertz.
pub fn period_of(hz: f64) -> Duration {
    Duration::from_secs_f64(1.0 / hz)
}

impl AcquisitionSettings {
    /// Period of the acquisition loop.
    pub fn refresh_period(&self) -> Duration {
        period_of(self.refresh_hz)
    }

    /// Rates must be positive and bounds nonzero.
    pub fn validate(&self) -> AppResult<()> {
        let rates = [
            ("refresh_hz", self.refresh_hz),
            ("sample_rate_plot_hz", self.sample_rate_plot_hz),
            ("distance_plot_hz", self.distance_plot_hz),
            ("trigger_verify_hz", self.trigger_verify_hz),
            ("dispatcher_hz", self.dispatcher_hz),
        ];
        for (name, hz) in rates {
            if !hz.is_finite() || hz <= 0.0 {
                return Err(DaqError::Configuration(format!(
                    "{name} must be positive, got {hz}"
                )));
            }
        }
        if self.scan_line_timeout.is_zero() {
            return Err(DaqError::Configuration("scan_line_timeout must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(DaqError::Configuration("queue_capacity must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.trim_fraction) {
            return Err(DaqError::Configuration(format!(
                "trim_fraction must be in [0, 1), got {}",
                self.trim_fraction
            )));
        }
        if self.saturation_level <= 0.0 {
            return Err(DaqError::Configuration(
                "saturation_level must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// How to reach the device.
    pub connection: ConnectionConfig,
    /// Acquisition and distribution tuning.
    pub acquisition: AcquisitionSettings,
}

impl Settings {
    /// Defaults overridden by `CHR_DAQ_` environment variables.
    pub fn load() -> AppResult<Self> {
        Self::from_figment(Self::figment())
    }

    /// Defaults, then `path`, then environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CHR_DAQ_").split("__"));
        Self::from_figment(figment)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Env::prefixed("CHR_DAQ_").split("__"))
    }

    fn from_figment(figment: Figment) -> AppResult<Self> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate both sections.
    pub fn validate(&self) -> AppResult<()> {
        self.connection.validate()?;
        self.acquisition.validate()
    }

    /// TOML rendering of the effective settings.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.connection.effective_buffer_size(), DEFAULT_BUFFER_SIZE);
        assert_eq!(settings.acquisition.refresh_period(), Duration::from_millis(50));
    }

    #[test]
    fn test_file_and_env_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "chr.toml",
                r#"
                [connection]
                address = "10.0.0.7"
                mode = "NonBlocking"
                timeout = "25ms"

                [acquisition]
                distance_plot_hz = 5.0
                "#,
            )?;
            jail.set_env("CHR_DAQ_ACQUISITION__QUEUE_CAPACITY", "8");

            let settings = Settings::load_from("chr.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.connection.address, "10.0.0.7");
            assert_eq!(settings.connection.mode, OperationMode::NonBlocking);
            assert_eq!(settings.connection.timeout, Duration::from_millis(25));
            assert_eq!(settings.acquisition.distance_plot_hz, 5.0);
            assert_eq!(settings.acquisition.queue_capacity, 8);
            assert_eq!(settings.acquisition.refresh_hz, 20.0);
            Ok(())
        });
    }

    #[test]
    fn test_rejects_bad_buffer_and_missing_ini() {
        let mut cfg = ConnectionConfig {
            buffer_size: 3000,
            ..ConnectionConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(DaqError::Configuration(_))));

        cfg.buffer_size = 1 << 20;
        cfg.ini_file = Some(PathBuf::from("/definitely/not/here.ini"));
        assert!(cfg.validate().is_err());

        let dir = tempfile::tempdir().unwrap();
        let ini = dir.path().join("driver.ini");
        std::fs::write(&ini, "[lib]\n").unwrap();
        cfg.ini_file = Some(ini);
        cfg.log_dir = Some(dir.path().to_path_buf());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_nonpositive_rates() {
        let acq = AcquisitionSettings {
            refresh_hz: 0.0,
            ..AcquisitionSettings::default()
        };
        assert!(acq.validate().is_err());
        let acq = AcquisitionSettings {
            scan_line_timeout: Duration::ZERO,
            ..AcquisitionSettings::default()
        };
        assert!(acq.validate().unwrap_err().to_string().contains("scan_line_timeout"));
    }

    #[test]
    fn test_toml_rendering_round_trips_through_figment() {
        let rendered = Settings::default().to_toml().unwrap();
        let parsed: Settings = Figment::from(Toml::string(&rendered)).extract().unwrap();
        assert_eq!(parsed, Settings::default());
    }
}

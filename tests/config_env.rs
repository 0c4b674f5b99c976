//! Settings layering through the process environment.

use std::time::Duration;

use chr_daq::config::Settings;
use serial_test::serial;

struct EnvGuard(&'static [&'static str]);

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for key in self.0 {
            std::env::remove_var(key);
        }
    }
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let _guard = EnvGuard(&["CHR_DAQ_ACQUISITION__REFRESH_HZ"]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chr_daq.toml");
    std::fs::write(
        &path,
        "[connection]\naddress = \"10.0.0.7\"\n\n[acquisition]\nrefresh_hz = 10.0\nteardown_timeout = \"2s\"\n",
    )
    .unwrap();

    let settings = Settings::load_from(&path).unwrap();
    assert_eq!(settings.connection.address, "10.0.0.7");
    assert_eq!(settings.acquisition.refresh_hz, 10.0);
    assert_eq!(settings.acquisition.teardown_timeout, Duration::from_secs(2));

    std::env::set_var("CHR_DAQ_ACQUISITION__REFRESH_HZ", "40");
    let settings = Settings::load_from(&path).unwrap();
    assert_eq!(settings.acquisition.refresh_hz, 40.0);
    assert_eq!(settings.acquisition.refresh_period(), Duration::from_millis(25));
}

#[test]
#[serial]
fn test_invalid_environment_value_is_rejected() {
    let _guard = EnvGuard(&["CHR_DAQ_ACQUISITION__QUEUE_CAPACITY"]);
    std::env::set_var("CHR_DAQ_ACQUISITION__QUEUE_CAPACITY", "0");
    let err = Settings::load().unwrap_err();
    assert!(err.to_string().contains("queue_capacity"), "unexpected error: {err}");
}

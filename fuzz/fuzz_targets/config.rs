//! Fuzz the waterscope.conf reader.
//!
//! Writes arbitrary bytes as a config file and walks every getter,
//! including the per-account lookups for each discovered account.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::fs;

use waterscope_unix_common::config::WaterscopeConfig;

fuzz_target!(|data: &[u8]| {
    let path = format!("/tmp/waterscope_fuzz_config_{}.ini", uuid::Uuid::new_v4());
    if fs::write(&path, String::from_utf8_lossy(data).as_bytes()).is_err() {
        return;
    }

    if let Ok(config) = WaterscopeConfig::new(Some(&path)) {
        let _ = config.get_connection_timeout(None);
        let _ = config.get_poll_interval(None);
        let _ = config.get_verify_session();
        let _ = config.get_reading_selectors();
        let _ = config.get_state_path();
        for account in config.get_accounts() {
            assert!(config.get_connection_timeout(Some(&account)) > 0);
            assert!(config.get_poll_interval(Some(&account)) > 0);
            let _ = config.get_password(&account);
        }
    }
    let _ = fs::remove_file(&path);
});

/*
   Waterscope meter reader for Azure B2C fronted portals
   Copyright (C) David Mulder <dmulder@samba.org> 2024

   This program is free software; you can redistribute it and/or modify
   it under the terms of the GNU General Public License as published by
   the Free Software Foundation; either version 3 of the License, or
   (at your option) any later version.

   This program is distributed in the hope that it will be useful,
   but WITHOUT ANY WARRANTY; without even the implied warranty of
   MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
   GNU General Public License for more details.

   You should have received a copy of the GNU General Public License
   along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/
use configparser::ini::Ini;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{error, warn};
use zeroize::Zeroizing;

use crate::constants::{
    DEFAULT_CONFIG_PATH, DEFAULT_CONN_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_STATE_PATH,
    DEFAULT_VERIFY_SESSION, MAX_CONN_TIMEOUT, MAX_POLL_INTERVAL,
};
use crate::session::mask_username;

fn match_bool(val: Option<String>, default: bool) -> bool {
    match val {
        Some(val) => match val.to_lowercase().as_str() {
            "true" => true,
            "false" => false,
            "1" => true,
            "0" => false,
            _ => {
                error!("Unrecognized boolean value '{}'", val);
                default
            }
        },
        None => default,
    }
}

fn split_list(val: Option<String>) -> Vec<String> {
    match val {
        Some(val) => val
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => vec![],
    }
}

#[derive(Clone)]
pub struct WaterscopeConfig {
    config: Ini,
    filename: String,
}

impl WaterscopeConfig {
    pub fn new(config_path: Option<&str>) -> Result<WaterscopeConfig, String> {
        let mut sconfig = Ini::new();
        let mut filename: String = DEFAULT_CONFIG_PATH.to_string();
        if let Some(config_path) = config_path {
            filename = config_path.to_string();
        }
        let cfg_path: PathBuf = PathBuf::from(filename.clone());
        if cfg_path.exists() {
            if let Err(e) = sconfig.load(filename.clone()) {
                return Err(format!(
                    "failed to read config from {} - cannot start up: {} Quitting.",
                    filename, e
                ));
            }
        }
        Ok(WaterscopeConfig {
            config: sconfig,
            filename,
        })
    }

    pub fn get(&self, section: &str, option: &str) -> Option<String> {
        self.config.get(section, option)
    }

    /// Look `option` up in the account's section, then in `[global]`.
    fn get_scoped(&self, account: Option<&str>, option: &str) -> Option<String> {
        match account {
            Some(account) => match self.config.get(account, option) {
                Some(val) => Some(val),
                None => self.config.get("global", option),
            },
            None => self.config.get("global", option),
        }
    }

    fn get_seconds(&self, account: Option<&str>, option: &str, default: u64, max: u64) -> u64 {
        match self.get_scoped(account, option) {
            Some(val) => match val.parse::<u64>() {
                Ok(n) if n > max => {
                    warn!("{} of {}s exceeds the limit, using {}s", option, n, max);
                    max
                }
                Ok(n) if n > 0 => n,
                _ => {
                    error!("Failed parsing {} from config: {}", option, val);
                    default
                }
            },
            None => default,
        }
    }

    pub fn get_connection_timeout(&self, account: Option<&str>) -> u64 {
        self.get_seconds(
            account,
            "connection_timeout",
            DEFAULT_CONN_TIMEOUT,
            MAX_CONN_TIMEOUT,
        )
    }

    pub fn get_poll_interval(&self, account: Option<&str>) -> u64 {
        self.get_seconds(
            account,
            "poll_interval",
            DEFAULT_POLL_INTERVAL,
            MAX_POLL_INTERVAL,
        )
    }

    pub fn get_verify_session(&self) -> bool {
        match_bool(
            self.config.get("global", "verify_session"),
            DEFAULT_VERIFY_SESSION,
        )
    }

    /// Additional dashboard selectors, tried after the built-in ones.
    pub fn get_reading_selectors(&self) -> Vec<String> {
        split_list(self.config.get("global", "reading_selectors"))
    }

    pub fn get_state_path(&self) -> String {
        match self.config.get("global", "state_path") {
            Some(val) => val,
            None => DEFAULT_STATE_PATH.to_string(),
        }
    }

    /// Accounts listed in `[global] accounts`, followed by any other section
    /// name not already listed.
    pub fn get_accounts(&self) -> Vec<String> {
        let mut accounts = split_list(self.config.get("global", "accounts"))
            .into_iter()
            .map(|a| a.to_lowercase())
            .collect::<Vec<String>>();
        let mut sections = self.config.sections();
        sections.retain(|s| s != "global" && s != "default");
        for section in sections {
            if !accounts.contains(&section) {
                accounts.push(section);
            }
        }
        accounts
    }

    /// The account's password, either inline or read from `password_file`.
    pub fn get_password(&self, account: &str) -> Result<Option<Zeroizing<String>>, String> {
        if let Some(password) = self.config.get(account, "password") {
            return Ok(Some(Zeroizing::new(password)));
        }
        match self.config.get(account, "password_file") {
            Some(path) => match fs::read_to_string(&path) {
                Ok(contents) => {
                    let contents = Zeroizing::new(contents);
                    Ok(Some(Zeroizing::new(
                        contents.trim_end_matches(['\r', '\n']).to_string(),
                    )))
                }
                Err(e) => Err(format!(
                    "failed to read password file of {}: {}",
                    mask_username(account),
                    e
                )),
            },
            None => Ok(None),
        }
    }

    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        self.config.set(section, key, Some(value.to_string()));
    }

    pub fn get_config_file(&self) -> String {
        self.filename.clone()
    }
}

impl fmt::Debug for WaterscopeConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaterscopeConfig")
            .field("filename", &self.filename)
            .field("sections", &self.config.sections())
            .finish()
    }
}

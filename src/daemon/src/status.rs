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
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;
use waterscope_unix_common::dashboard::DashboardData;
use waterscope_unix_common::session::mask_username;
use waterscope_unix_common::WaterscopeError;

/// How an account appears in the status file. The key is a name-based UUID
/// of the username, so it is stable across restarts, distinct per account,
/// and does not spell the username out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountId {
    pub key: String,
    pub masked: String,
}

impl AccountId {
    pub fn new(username: &str) -> Self {
        AccountId {
            key: Uuid::new_v5(&Uuid::NAMESPACE_OID, username.to_lowercase().as_bytes())
                .to_string(),
            masked: mask_username(username),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Credentials were accepted, no reading fetched yet.
    Validated,
    Ok,
    /// Transient failure; the last reading, if any, is kept.
    Unavailable,
    AuthFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Extras {
    pub previous_day_consumption: Option<f64>,
    pub daily_average_consumption: Option<f64>,
    pub billing_read: Option<f64>,
    pub current_cycle_total: Option<f64>,
    pub device_name: Option<String>,
}

impl From<&DashboardData> for Extras {
    fn from(data: &DashboardData) -> Self {
        Extras {
            previous_day_consumption: data.previous_day_consumption,
            daily_average_consumption: data.daily_average_consumption,
            billing_read: data.billing_read,
            current_cycle_total: data.current_cycle_total,
            device_name: data.device_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountStatus {
    pub account: String,
    pub status: State,
    pub reading: Option<f64>,
    pub unit: Option<String>,
    pub extras: Extras,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub updated: DateTime<Utc>,
}

impl AccountStatus {
    fn empty(account: &AccountId, status: State) -> Self {
        AccountStatus {
            account: account.masked.clone(),
            status,
            reading: None,
            unit: None,
            extras: Extras::default(),
            error_kind: None,
            error: None,
            last_success: None,
            updated: Utc::now(),
        }
    }
}

/// Per-account outcomes, mirrored to a JSON file after every change.
pub struct StatusStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, AccountStatus>>,
}

impl StatusStore {
    pub fn new(path: &str) -> Self {
        StatusStore {
            path: PathBuf::from(path),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    #[cfg(test)]
    pub async fn get(&self, account: &AccountId) -> Option<AccountStatus> {
        self.entries.lock().await.get(&account.key).cloned()
    }

    pub async fn record_validated(&self, account: &AccountId) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(account.key.clone())
            .or_insert_with(|| AccountStatus::empty(account, State::Validated));
        entry.error_kind = None;
        entry.error = None;
        entry.updated = Utc::now();
        self.flush(&entries).await
    }

    pub async fn record_reading(&self, account: &AccountId, data: &DashboardData) -> Result<()> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        entries.insert(
            account.key.clone(),
            AccountStatus {
                account: account.masked.clone(),
                status: State::Ok,
                reading: Some(data.reading.value),
                unit: Some(data.reading.unit.clone()),
                extras: Extras::from(data),
                error_kind: None,
                error: None,
                last_success: Some(now),
                updated: now,
            },
        );
        self.flush(&entries).await
    }

    pub async fn record_error(&self, account: &AccountId, err: &WaterscopeError) -> Result<()> {
        let status = if err.is_transient() {
            State::Unavailable
        } else {
            State::AuthFailed
        };
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(account.key.clone())
            .or_insert_with(|| AccountStatus::empty(account, status));
        entry.status = status;
        entry.error_kind = Some(err.kind().to_string());
        entry.error = Some(err.to_string());
        entry.updated = Utc::now();
        self.flush(&entries).await
    }

    async fn flush(&self, entries: &BTreeMap<String, AccountStatus>) -> Result<()> {
        let contents = serde_json::to_string_pretty(entries)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        debug!("Wrote status for {} accounts", entries.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waterscope_unix_common::dashboard::MeterReading;
    use waterscope_unix_common::AuthFailure;

    fn temp_path() -> String {
        format!("/tmp/waterscoped_test_{}/readings.json", uuid::Uuid::new_v4())
    }

    fn data(value: f64) -> DashboardData {
        DashboardData {
            reading: MeterReading {
                value,
                unit: "ft³".to_string(),
                strategy: "selector #lcd-read_NEW".to_string(),
            },
            previous_day_consumption: Some(16.81),
            daily_average_consumption: None,
            billing_read: None,
            current_cycle_total: None,
            device_name: Some("innov8-VN LTE Metron".to_string()),
        }
    }

    #[tokio::test]
    async fn test_reading_is_written() {
        let path = temp_path();
        let store = StatusStore::new(&path);
        let user = AccountId::new("user@example.com");
        store.record_reading(&user, &data(123.45)).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let entry = &written[user.key.as_str()];
        assert_eq!(entry["account"], "use***");
        assert_eq!(entry["status"], "ok");
        assert_eq!(entry["reading"], 123.45);
        assert_eq!(entry["unit"], "ft³");
        assert_eq!(entry["extras"]["previous_day_consumption"], 16.81);
        assert!(entry["error_kind"].is_null());
        assert!(!std::fs::read_to_string(&path)
            .unwrap()
            .contains("user@example.com"));
    }

    #[tokio::test]
    async fn test_accounts_sharing_a_prefix_stay_apart() {
        let store = StatusStore::new(&temp_path());
        let first = AccountId::new("john@a.com");
        let second = AccountId::new("joh.smith@b.com");
        assert_eq!(first.masked, second.masked);
        assert_ne!(first.key, second.key);
        assert_eq!(first, AccountId::new("John@a.com"));

        store.record_reading(&first, &data(100.0)).await.unwrap();
        store.record_reading(&second, &data(200.0)).await.unwrap();
        assert_eq!(store.get(&first).await.unwrap().reading, Some(100.0));
        assert_eq!(store.get(&second).await.unwrap().reading, Some(200.0));
    }

    #[tokio::test]
    async fn test_transient_error_keeps_last_reading() {
        let store = StatusStore::new(&temp_path());
        let user = AccountId::new("user@example.com");
        store.record_reading(&user, &data(10.0)).await.unwrap();
        store
            .record_error(
                &user,
                &WaterscopeError::DataParse("reading not found".to_string()),
            )
            .await
            .unwrap();

        let status = store.get(&user).await.unwrap();
        assert_eq!(status.status, State::Unavailable);
        assert_eq!(status.reading, Some(10.0));
        assert_eq!(status.error_kind.as_deref(), Some("data_parse"));
        assert!(status.last_success.is_some());
    }

    #[tokio::test]
    async fn test_auth_error_state() {
        let store = StatusStore::new(&temp_path());
        let user = AccountId::new("abc@example.com");
        store
            .record_error(&user, &AuthFailure::ConfirmationFailed.into())
            .await
            .unwrap();
        let status = store.get(&user).await.unwrap();
        assert_eq!(status.status, State::AuthFailed);
        assert_eq!(status.account, "abc***");
        assert_eq!(status.reading, None);
        assert_eq!(status.error_kind.as_deref(), Some("authentication"));
    }
}

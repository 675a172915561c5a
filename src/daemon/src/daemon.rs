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
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, ArgAction, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use waterscope_unix_common::config::WaterscopeConfig;
use waterscope_unix_common::constants::DEFAULT_CONFIG_PATH;
use waterscope_unix_common::{ClientOptions, Credentials, MeterClient, WaterscopeError};

mod status;
use status::{AccountId, StatusStore};

/// Longest stretch, as a multiple of the poll interval, between attempts for
/// an account whose credentials keep being refused.
const MAX_AUTH_BACKOFF: u32 = 8;

/// Multiplier for the next sleep after a cycle ended with `result`.
fn next_backoff(backoff: u32, result: Result<(), &WaterscopeError>) -> u32 {
    match result {
        Ok(()) => 1,
        Err(e) if e.is_transient() => 1,
        Err(_) => backoff.saturating_mul(2).min(MAX_AUTH_BACKOFF),
    }
}

fn delay(interval: Duration, backoff: u32) -> Duration {
    interval.saturating_mul(backoff)
}

struct Poller {
    id: AccountId,
    creds: Credentials,
    client: MeterClient,
    interval: Duration,
    store: Arc<StatusStore>,
}

impl Poller {
    fn record(&self, result: anyhow::Result<()>) {
        if let Err(e) = result {
            error!("Failed updating status for {}: {:#}", self.id.masked, e);
        }
    }

    async fn report_error(&self, e: &WaterscopeError) {
        if e.is_transient() {
            warn!("{} temporarily unavailable: {}", self.id.masked, e);
        } else {
            error!("{} rejected: {}", self.id.masked, e);
        }
        self.record(self.store.record_error(&self.id, e).await);
    }

    /// The startup cycle: sign in without fetching anything.
    async fn validate(&self) -> Result<(), WaterscopeError> {
        match self.client.validate(&self.creds).await {
            Ok(()) => {
                info!("Credentials for {} accepted", self.id.masked);
                self.record(self.store.record_validated(&self.id).await);
                Ok(())
            }
            Err(e) => {
                self.report_error(&e).await;
                Err(e)
            }
        }
    }

    async fn run(self) {
        debug!(
            "Polling {} every {}s",
            self.id.masked,
            self.interval.as_secs()
        );
        let mut backoff: u32 = 1;
        if let Err(e) = self.validate().await {
            backoff = next_backoff(backoff, Err(&e));
            if backoff > 1 {
                tokio::time::sleep(self.interval).await;
            }
        }

        loop {
            match self.client.read(&self.creds).await {
                Ok(data) => {
                    backoff = next_backoff(backoff, Ok(()));
                    self.record(self.store.record_reading(&self.id, &data).await);
                }
                Err(e) => {
                    backoff = next_backoff(backoff, Err(&e));
                    self.report_error(&e).await;
                }
            }
            tokio::time::sleep(delay(self.interval, backoff)).await;
        }
    }
}

fn build_pollers(config: &WaterscopeConfig, store: &Arc<StatusStore>) -> Vec<Poller> {
    let mut pollers = vec![];
    for account in config.get_accounts() {
        let id = AccountId::new(&account);
        let password: Zeroizing<String> = match config.get_password(&account) {
            Ok(Some(password)) => password,
            Ok(None) => {
                error!("No password configured for {}, skipping", id.masked);
                continue;
            }
            Err(e) => {
                error!("{}, skipping", e);
                continue;
            }
        };
        let options = match ClientOptions::from_config(config, Some(&account)) {
            Ok(options) => options,
            Err(e) => {
                error!("Failed building client for {}: {}", id.masked, e);
                continue;
            }
        };
        pollers.push(Poller {
            creds: Credentials::new(&account, &password),
            client: MeterClient::new(options),
            interval: Duration::from_secs(config.get_poll_interval(Some(&account))),
            store: Arc::clone(store),
            id,
        });
    }
    pollers
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let clap_args = Command::new("waterscoped")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Waterscope Meter Polling Daemon")
        .arg(
            Arg::new("debug")
                .help("Show extra debug information")
                .short('d')
                .long("debug")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config")
                .help("Path to the configuration file")
                .short('c')
                .long("config")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .get_matches();

    if clap_args.get_flag("debug") {
        std::env::set_var("RUST_LOG", "debug");
    }
    tracing_subscriber::fmt::init();

    async {
        // Read the configuration
        let config_path = clap_args
            .get_one::<String>("config")
            .map(|s| s.as_str())
            .unwrap_or(DEFAULT_CONFIG_PATH);
        let config = match WaterscopeConfig::new(Some(config_path)) {
            Ok(c) => c,
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        };

        let store = Arc::new(StatusStore::new(&config.get_state_path()));
        let pollers = build_pollers(&config, &store);
        if pollers.is_empty() {
            error!(
                "No usable accounts configured in {}",
                config.get_config_file()
            );
            return ExitCode::FAILURE;
        }

        // One task per account, so an account never has two cycles in flight.
        let handles: Vec<_> = pollers
            .into_iter()
            .map(|poller| tokio::spawn(poller.run()))
            .collect();
        let server = tokio::spawn(async move {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Polling task failed: {}", e);
                }
            }
        });

        let terminate_task = tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed registering terminate signal: {}", e);
                }
            };
        });

        let quit_task = tokio::spawn(async move {
            match signal(SignalKind::quit()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed registering quit signal: {}", e);
                }
            };
        });

        let interrupt_task = tokio::spawn(async move {
            match signal(SignalKind::interrupt()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed registering interrupt signal: {}", e);
                }
            };
        });

        info!("Server started ...");

        tokio::select! {
            _ = server => {
                debug!("All polling tasks have stopped");
            },
            _ = terminate_task => {
                debug!("Received signal to terminate");
            },
            _ = quit_task => {
                debug!("Received signal to quit");
            },
            _ = interrupt_task => {
                debug!("Received signal to interrupt");
            }
        }

        ExitCode::SUCCESS
    }
    .await
}

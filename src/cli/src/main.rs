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

#[macro_use]
extern crate tracing;

use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rpassword::prompt_password;
use serde_json::to_string_pretty;
use waterscope_unix_common::config::WaterscopeConfig;
use waterscope_unix_common::dashboard::{extract_dashboard, reading_strategies};
use waterscope_unix_common::{ClientOptions, Credentials, MeterClient};
use zeroize::Zeroizing;

include!("./opt/tool.rs");

fn load_config(config: Option<&str>) -> Result<WaterscopeConfig> {
    WaterscopeConfig::new(config).map_err(|e| anyhow!(e))
}

/// Build a client and credentials for `account_id`, prompting for the
/// password when the configuration has none.
fn init(config: &WaterscopeConfig, account_id: &str) -> Result<(MeterClient, Credentials)> {
    let password: Zeroizing<String> = match config
        .get_password(account_id)
        .map_err(|e| anyhow!(e))?
    {
        Some(password) => password,
        None => Zeroizing::new(
            prompt_password(format!("{} password: ", account_id))
                .context("Failed reading password")?,
        ),
    };
    let options = ClientOptions::from_config(config, Some(account_id))?;
    Ok((
        MeterClient::new(options),
        Credentials::new(account_id, &password),
    ))
}

async fn read(account_id: &str, config: Option<&str>) -> Result<()> {
    let cfg = load_config(config)?;
    let (client, creds) = init(&cfg, account_id)?;
    let data = client.read(&creds).await?;
    println!("{}", to_string_pretty(&data)?);
    Ok(())
}

async fn auth_test(account_id: &str, config: Option<&str>) -> Result<()> {
    let cfg = load_config(config)?;
    let (client, creds) = init(&cfg, account_id)?;
    client.validate(&creds).await?;
    println!("auth success!");
    Ok(())
}

fn parse(file: &str, config: Option<&str>) -> Result<()> {
    let cfg = load_config(config)?;
    let html =
        std::fs::read_to_string(file).with_context(|| format!("Failed reading {}", file))?;
    let strategies = reading_strategies(&cfg.get_reading_selectors());
    let data = extract_dashboard(&html, &strategies)?;
    println!("{}", to_string_pretty(&data)?);
    Ok(())
}

fn finish(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let opt = WsToolParser::parse();

    let debug = match opt.commands {
        WsToolOpt::Read { debug, .. } => debug,
        WsToolOpt::AuthTest { debug, .. } => debug,
        WsToolOpt::Parse { debug, .. } => debug,
        WsToolOpt::Version { debug } => debug,
    };

    if debug {
        std::env::set_var("RUST_LOG", "debug");
    }
    tracing_subscriber::fmt::init();

    match opt.commands {
        WsToolOpt::Read {
            debug: _,
            account_id,
            config,
        } => finish(read(&account_id, config.as_deref()).await),
        WsToolOpt::AuthTest {
            debug: _,
            account_id,
            config,
        } => finish(auth_test(&account_id, config.as_deref()).await),
        WsToolOpt::Parse {
            debug: _,
            file,
            config,
        } => finish(parse(&file, config.as_deref())),
        WsToolOpt::Version { debug: _ } => {
            println!("ws-tool {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
    }
}

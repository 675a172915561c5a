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
use clap::Subcommand;

#[derive(Debug, Subcommand)]
#[clap(about = "Waterscope Management Utility")]
pub enum WsToolOpt {
    /// Sign in to the portal and print the current meter reading along with
    /// any consumption figures the dashboard shows.
    Read {
        #[clap(short, long)]
        debug: bool,
        #[clap(short = 'D', long = "name")]
        account_id: String,
        #[clap(short, long)]
        config: Option<String>,
    },
    /// Test authentication of an account without fetching the dashboard.
    /// A failure here names the sign-in step that was refused.
    AuthTest {
        #[clap(short, long)]
        debug: bool,
        #[clap(short = 'D', long = "name")]
        account_id: String,
        #[clap(short, long)]
        config: Option<String>,
    },
    /// Extract the meter data from a saved dashboard page. Useful for
    /// checking `reading_selectors` against a page whose markup changed.
    Parse {
        #[clap(short, long)]
        debug: bool,
        file: String,
        #[clap(short, long)]
        config: Option<String>,
    },
    /// Show the version of this tool.
    Version {
        #[clap(short, long)]
        debug: bool,
    },
}

#[derive(Debug, clap::Parser)]
#[clap(about = "Waterscope Management Utility")]
pub struct WsToolParser {
    #[clap(subcommand)]
    pub commands: WsToolOpt,
}

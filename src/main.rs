// Copyright (c) 2020-present, UMD Database Group.
//
// This program is free software: you can use, redistribute, and/or modify
// it under the terms of the GNU Affero General Public License, version 3
// or later ("AGPL"), as published by the Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

//! fis-lambda creates and starts AWS FIS fault-injection experiments
//! against Lambda functions.

mod args;
mod experiment;
mod template;

use anyhow::{anyhow, bail, Context as _, Result};
use clap::{crate_version, App, AppSettings};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = App::new("fis-lambda")
        .version(crate_version!())
        .about("Creates and starts AWS FIS fault-injection experiments against Lambda functions")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .args(args::get_logging_args())
        .subcommand(template::command_args())
        .subcommand(experiment::start_command_args())
        .subcommand(experiment::status_command_args())
        .get_matches();

    let (command, sub_matches) = match matches.subcommand() {
        Some((command, sub_matches)) => (command, sub_matches),
        None => unreachable!(),
    };

    args::get_logging(&matches, sub_matches)?.try_init()?;

    match command {
        "run" => template::command(sub_matches).await,
        "start" => experiment::start_command(sub_matches).await,
        "status" => experiment::status_command(sub_matches).await,
        _ => bail!("{} command is not implemented", command),
    }
    .with_context(|| anyhow!("{} command failed", command))
}

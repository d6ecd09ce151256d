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

//! Starts FIS experiments from templates and reads their status.

use anyhow::{anyhow, bail, Context as _, Result};
use clap::{App, AppSettings, Arg, ArgMatches};
use lazy_static::lazy_static;
use log::error;
use rusoto_core::Region;
use rusoto_fis::{Experiment, Fis, FisClient, GetExperimentRequest, StartExperimentRequest};
use std::collections::HashMap;
use uuid::Uuid;

lazy_static! {
    /// Tags attached to an experiment when the caller supplies none.
    pub static ref FIS_START_TAGS: HashMap<String, String> = [("StartedBy", "automation-script")]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
}

pub fn start_command_args() -> App<'static> {
    App::new("start")
        .about("Starts a FIS experiment from an existing template")
        .setting(AppSettings::DisableVersionFlag)
        .arg(
            Arg::new("template id")
                .short('t')
                .long("template-id")
                .value_name("TEMPLATE_ID")
                .help("Sets the experiment template id to start from")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::new("tag")
                .long("tag")
                .value_name("KEY=VALUE")
                .help("Tags the experiment (repeatable)")
                .takes_value(true)
                .multiple_occurrences(true),
        )
        .arg(
            Arg::new("region")
                .long("region")
                .help("Sets the AWS region")
                .takes_value(true)
                .default_value("us-east-1"),
        )
}

pub fn status_command_args() -> App<'static> {
    App::new("status")
        .about("Fetches the current status of a FIS experiment")
        .setting(AppSettings::DisableVersionFlag)
        .arg(
            Arg::new("experiment id")
                .short('e')
                .long("experiment-id")
                .value_name("EXPERIMENT_ID")
                .help("Sets the experiment id to fetch")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::new("region")
                .long("region")
                .help("Sets the AWS region")
                .takes_value(true)
                .default_value("us-east-1"),
        )
}

pub async fn start_command(matches: &ArgMatches) -> Result<()> {
    let template_id = matches.value_of("template id").unwrap();
    let tags = match matches.values_of("tag") {
        Some(values) => Some(parse_tags(values)?),
        None => None,
    };
    let client = FisClient::new(parse_region(matches)?);

    let experiment = start_experiment(&client, template_id, tags).await?;
    println!("{:#?}", experiment);

    Ok(())
}

pub async fn status_command(matches: &ArgMatches) -> Result<()> {
    let experiment_id = matches.value_of("experiment id").unwrap();
    let client = FisClient::new(parse_region(matches)?);

    let experiment = get_experiment_status(&client, experiment_id).await?;
    println!(
        "[OK] experiment {} is {}",
        experiment_id,
        experiment_state(&experiment)
    );
    println!("{:#?}", experiment);

    Ok(())
}

/// Starts an experiment from the given template.
///
/// # Arguments
/// * `client` - The FIS client.
/// * `template_id` - The experiment template id.
/// * `tags` - Tags for the experiment. If `None`, the default
///   `StartedBy: automation-script` tag applies.
///
/// # Returns
/// The started experiment.
pub async fn start_experiment(
    client: &dyn Fis,
    template_id: &str,
    tags: Option<HashMap<String, String>>,
) -> Result<Experiment> {
    let request = build_start_request(template_id, tags);
    let response = client.start_experiment(request).await.map_err(|e| {
        error!("[FAIL] start experiment: {}", e);
        anyhow!(e)
    })?;

    let experiment = response
        .experiment
        .ok_or_else(|| anyhow!("FIS returned no experiment"))?;
    println!(
        "[OK] started experiment: {}",
        experiment.id.as_deref().unwrap_or("<unknown>")
    );
    println!("  state: {}", experiment_state(&experiment));

    Ok(experiment)
}

/// Fetches the current record of an experiment, unmodified.
pub async fn get_experiment_status(client: &dyn Fis, experiment_id: &str) -> Result<Experiment> {
    let response = client
        .get_experiment(GetExperimentRequest {
            id: experiment_id.to_string(),
        })
        .await
        .map_err(|e| {
            error!("[FAIL] get experiment status: {}", e);
            anyhow!(e)
        })?;

    response
        .experiment
        .ok_or_else(|| anyhow!("FIS returned no experiment for id {}", experiment_id))
}

/// Assembles the start-experiment request, applying the default tag set
/// when the caller supplies none.
pub fn build_start_request(
    template_id: &str,
    tags: Option<HashMap<String, String>>,
) -> StartExperimentRequest {
    StartExperimentRequest {
        client_token: Uuid::new_v4().to_string(),
        experiment_template_id: template_id.to_string(),
        tags: Some(tags.unwrap_or_else(|| FIS_START_TAGS.clone())),
    }
}

/// Parses repeated `KEY=VALUE` tag arguments into a map.
pub fn parse_tags<'a>(values: impl Iterator<Item = &'a str>) -> Result<HashMap<String, String>> {
    let mut tags = HashMap::new();
    for value in values {
        match value.split_once('=') {
            Some((key, tag)) if !key.is_empty() => {
                tags.insert(key.to_string(), tag.to_string());
            }
            _ => bail!("Invalid tag {:?}, expected KEY=VALUE", value),
        }
    }
    Ok(tags)
}

fn parse_region(matches: &ArgMatches) -> Result<Region> {
    matches
        .value_of("region")
        .unwrap()
        .parse::<Region>()
        .with_context(|| anyhow!("Invalid region"))
}

fn experiment_state(experiment: &Experiment) -> String {
    experiment
        .state
        .as_ref()
        .and_then(|state| state.status.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

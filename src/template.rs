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

//! Builds FIS experiment templates that inject faults into Lambda functions.

use crate::experiment;
use anyhow::{anyhow, Context as _, Result};
use clap::{App, AppSettings, Arg, ArgMatches};
use lazy_static::lazy_static;
use log::{error, info};
use rusoto_core::Region;
use rusoto_fis::{
    CreateExperimentTemplateActionInput, CreateExperimentTemplateLogConfigurationInput,
    CreateExperimentTemplateRequest, CreateExperimentTemplateStopConditionInput,
    CreateExperimentTemplateTargetInput, ExperimentTemplate,
    ExperimentTemplateCloudWatchLogsLogConfigurationInput,
    ExperimentTemplateS3LogConfigurationInput, Fis, FisClient,
};
use rusoto_sts::{GetCallerIdentityRequest, Sts, StsClient};
use std::collections::HashMap;
use uuid::Uuid;

/// The name of the target group every template declares.
pub const FIS_TARGET_NAME: &str = "lambda-functions";
/// The name of the single fault-injection action.
pub const FIS_ACTION_NAME: &str = "inject-fault";
/// The key under which the action references its target group.
pub const FIS_ACTION_TARGET_KEY: &str = "Lambdas";
/// The FIS resource type for Lambda functions.
pub const FIS_LAMBDA_RESOURCE_TYPE: &str = "aws:lambda:function";
/// The log schema version FIS expects in log configurations.
pub const FIS_LOG_SCHEMA_VERSION: i64 = 1;

lazy_static! {
    /// Tags attached to every experiment template this tool creates.
    pub static ref FIS_TEMPLATE_TAGS: HashMap<String, String> = [
        ("Environment", "test"),
        ("ManagedBy", "fis-automation"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
}

/// Options for a Lambda fault-injection experiment template.
pub struct FaultExperimentOpt {
    /// The description of the experiment.
    pub description: String,
    /// The IAM role ARN that grants FIS permission to act.
    pub role_arn: String,
    /// The ARNs of the target Lambda functions.
    pub lambda_arns: Vec<String>,
    /// The FIS action id identifying the fault behavior.
    pub action_id: String,
    /// The experiment duration in ISO-8601 form.
    pub duration: String,
    /// The percentage of targets affected (0-100).
    pub percentage: i64,
    /// The S3 bucket that receives experiment logs, if any.
    pub log_bucket: Option<String>,
    /// The key prefix inside the log bucket.
    pub log_prefix: String,
}

impl Default for FaultExperimentOpt {
    fn default() -> Self {
        FaultExperimentOpt {
            description: "Lambda fault injection experiment".to_string(),
            role_arn: String::new(),
            lambda_arns: vec![],
            action_id: "aws:fis:inject-api-unavailable-error".to_string(),
            duration: "PT2M".to_string(),
            percentage: 100,
            log_bucket: None,
            log_prefix: "fis-logs".to_string(),
        }
    }
}

pub fn command_args() -> App<'static> {
    App::new("run")
        .about("Creates a FIS experiment template and starts an experiment from it")
        .setting(AppSettings::DisableVersionFlag)
        .arg(
            Arg::new("role arn")
                .short('r')
                .long("role-arn")
                .value_name("ROLE_ARN")
                .help("Sets the IAM role ARN that FIS assumes to run the experiment")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::new("lambda arns")
                .short('f')
                .long("lambda-arns")
                .value_name("LAMBDA_ARN")
                .help("Sets the target Lambda function ARNs (one or more)")
                .takes_value(true)
                .multiple_values(true)
                .required(true),
        )
        .arg(
            Arg::new("description")
                .long("description")
                .help("Sets the experiment description")
                .takes_value(true)
                .default_value("Lambda fault injection experiment"),
        )
        .arg(
            Arg::new("action id")
                .short('a')
                .long("action-id")
                .help("Sets the FIS action id to inject")
                .takes_value(true)
                .default_value("aws:fis:inject-api-unavailable-error"),
        )
        .arg(
            Arg::new("duration")
                .short('s')
                .long("duration")
                .help("Sets the experiment duration (ISO 8601, e.g. PT2M)")
                .takes_value(true)
                .default_value("PT2M"),
        )
        .arg(
            Arg::new("percentage")
                .short('p')
                .long("percentage")
                .help("Sets the percentage of targets affected [0-100]")
                .takes_value(true)
                .default_value("100"),
        )
        .arg(
            Arg::new("log bucket")
                .short('b')
                .long("log-bucket")
                .value_name("BUCKET")
                .help("Sets the S3 bucket that receives experiment logs")
                .takes_value(true),
        )
        .arg(
            Arg::new("log prefix")
                .long("log-prefix")
                .value_name("PREFIX")
                .help("Sets the key prefix inside the log bucket")
                .takes_value(true)
                .default_value("fis-logs"),
        )
        .arg(
            Arg::new("region")
                .long("region")
                .help("Sets the AWS region")
                .takes_value(true)
                .default_value("us-east-1"),
        )
        .arg(
            Arg::new("no start")
                .long("no-start")
                .help("Creates the template without starting an experiment"),
        )
}

pub async fn command(matches: &ArgMatches) -> Result<()> {
    let opt = experiment_opt(matches)?;
    let region = matches
        .value_of("region")
        .unwrap()
        .parse::<Region>()
        .with_context(|| anyhow!("Invalid region"))?;

    info!("=== AWS FIS experiment template ===");
    info!("target lambda arns: {:?}", opt.lambda_arns);
    info!("action: {}", opt.action_id);
    info!("duration: {}", opt.duration);
    info!("percentage: {}%", opt.percentage);

    let fis = FisClient::new(region.clone());
    let sts = StsClient::new(region.clone());

    let template = create_experiment_template(&fis, &sts, &region, &opt).await?;
    let template_id = template
        .id
        .clone()
        .ok_or_else(|| anyhow!("FIS returned a template without an id"))?;
    println!("{:#?}", template);

    maybe_start_experiment(&fis, &template_id, matches.is_present("no start")).await
}

/// Starts an experiment from the freshly created template, or prints how to
/// start it manually when `no_start` is set.
async fn maybe_start_experiment(fis: &dyn Fis, template_id: &str, no_start: bool) -> Result<()> {
    if no_start {
        println!("To start the experiment later, run:");
        println!("  fis-lambda start --template-id {}", template_id);
        return Ok(());
    }

    let tags = [("CreatedBy", "fis-script")]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let experiment = experiment::start_experiment(fis, template_id, Some(tags)).await?;
    println!("{:#?}", experiment);

    if let Some(id) = experiment.id {
        println!("To monitor the experiment, run:");
        println!("  aws fis get-experiment --id {}", id);
    }

    Ok(())
}

/// Populates the experiment options from the command-line matches.
fn experiment_opt(matches: &ArgMatches) -> Result<FaultExperimentOpt> {
    let mut opt = FaultExperimentOpt::default();

    opt.role_arn = matches.value_of("role arn").unwrap().to_string();
    opt.lambda_arns = matches
        .values_of("lambda arns")
        .unwrap()
        .map(|s| s.to_string())
        .collect();
    opt.description = matches.value_of("description").unwrap().to_string();
    opt.action_id = matches.value_of("action id").unwrap().to_string();
    opt.duration = matches.value_of("duration").unwrap().to_string();
    opt.percentage = matches
        .value_of("percentage")
        .unwrap()
        .parse::<i64>()
        .with_context(|| anyhow!("Invalid percentage"))?;
    opt.log_bucket = matches.value_of("log bucket").map(|s| s.to_string());
    opt.log_prefix = matches.value_of("log prefix").unwrap().to_string();

    Ok(opt)
}

/// Creates a FIS experiment template for the given options.
///
/// When a log bucket is set, the caller's account id is resolved through STS
/// to synthesize the CloudWatch log-group ARN of the log configuration.
///
/// # Arguments
/// * `fis` - The FIS client.
/// * `sts` - The STS client, used only when `opt.log_bucket` is set.
/// * `region` - The region the experiment runs in.
/// * `opt` - The experiment options.
///
/// # Returns
/// The created experiment template.
pub async fn create_experiment_template(
    fis: &dyn Fis,
    sts: &dyn Sts,
    region: &Region,
    opt: &FaultExperimentOpt,
) -> Result<ExperimentTemplate> {
    let log_configuration = match &opt.log_bucket {
        Some(bucket) => {
            let account = resolve_account_id(sts).await?;
            Some(build_log_configuration(
                region,
                &account,
                bucket,
                &opt.log_prefix,
            ))
        }
        None => None,
    };

    let request = build_template_request(opt, log_configuration);
    let response = fis
        .create_experiment_template(request)
        .await
        .map_err(|e| {
            error!("[FAIL] create experiment template: {}", e);
            anyhow!(e)
        })?;

    let template = response
        .experiment_template
        .ok_or_else(|| anyhow!("FIS returned no experiment template"))?;
    println!(
        "[OK] created experiment template: {}",
        template.id.as_deref().unwrap_or("<unknown>")
    );

    Ok(template)
}

/// Assembles the create-template request from the options.
pub fn build_template_request(
    opt: &FaultExperimentOpt,
    log_configuration: Option<CreateExperimentTemplateLogConfigurationInput>,
) -> CreateExperimentTemplateRequest {
    let mut targets = HashMap::new();
    targets.insert(
        FIS_TARGET_NAME.to_string(),
        CreateExperimentTemplateTargetInput {
            resource_type: FIS_LAMBDA_RESOURCE_TYPE.to_string(),
            resource_arns: Some(opt.lambda_arns.clone()),
            selection_mode: "ALL".to_string(),
            ..Default::default()
        },
    );

    let mut parameters = HashMap::new();
    parameters.insert("duration".to_string(), opt.duration.clone());
    parameters.insert("percentage".to_string(), opt.percentage.to_string());

    let mut action_targets = HashMap::new();
    action_targets.insert(
        FIS_ACTION_TARGET_KEY.to_string(),
        FIS_TARGET_NAME.to_string(),
    );

    let mut actions = HashMap::new();
    actions.insert(
        FIS_ACTION_NAME.to_string(),
        CreateExperimentTemplateActionInput {
            action_id: opt.action_id.clone(),
            parameters: Some(parameters),
            targets: Some(action_targets),
            ..Default::default()
        },
    );

    CreateExperimentTemplateRequest {
        client_token: Uuid::new_v4().to_string(),
        description: opt.description.clone(),
        targets: Some(targets),
        actions,
        stop_conditions: vec![CreateExperimentTemplateStopConditionInput {
            source: "none".to_string(),
            ..Default::default()
        }],
        role_arn: opt.role_arn.clone(),
        tags: Some(FIS_TEMPLATE_TAGS.clone()),
        log_configuration,
        ..Default::default()
    }
}

/// Assembles the log configuration for the given bucket and prefix.
pub fn build_log_configuration(
    region: &Region,
    account: &str,
    bucket: &str,
    prefix: &str,
) -> CreateExperimentTemplateLogConfigurationInput {
    CreateExperimentTemplateLogConfigurationInput {
        cloud_watch_logs_configuration: Some(ExperimentTemplateCloudWatchLogsLogConfigurationInput {
            log_group_arn: build_log_group_arn(region, account),
        }),
        s3_configuration: Some(ExperimentTemplateS3LogConfigurationInput {
            bucket_name: bucket.to_string(),
            prefix: Some(prefix.to_string()),
        }),
        log_schema_version: FIS_LOG_SCHEMA_VERSION,
    }
}

/// Synthesizes the ARN of the FIS CloudWatch log groups in the account.
pub fn build_log_group_arn(region: &Region, account: &str) -> String {
    format!(
        "arn:{}:logs:{}:{}:log-group:/aws/fis/*",
        arn_partition(region),
        region.name(),
        account
    )
}

/// Maps a region to its ARN partition.
fn arn_partition(region: &Region) -> &'static str {
    let name = region.name();
    if name.starts_with("cn-") {
        "aws-cn"
    } else if name.starts_with("us-gov-") {
        "aws-us-gov"
    } else {
        "aws"
    }
}

/// Resolves the caller's account id through STS.
pub async fn resolve_account_id(sts: &dyn Sts) -> Result<String> {
    let identity = sts
        .get_caller_identity(GetCallerIdentityRequest {})
        .await
        .map_err(|e| {
            error!("[FAIL] resolve caller identity: {}", e);
            anyhow!(e)
        })?;
    identity
        .account
        .ok_or_else(|| anyhow!("STS returned no account id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusoto_mock::{MockCredentialsProvider, MockRequestDispatcher};

    fn test_opt() -> FaultExperimentOpt {
        FaultExperimentOpt {
            role_arn: "arn:aws:iam::123456789012:role/fis-role".to_string(),
            lambda_arns: vec![
                "arn:aws:lambda:us-east-1:123456789012:function:f1".to_string(),
                "arn:aws:lambda:us-east-1:123456789012:function:f2".to_string(),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn default_opt() {
        let opt = FaultExperimentOpt::default();
        assert_eq!(opt.description, "Lambda fault injection experiment");
        assert_eq!(opt.action_id, "aws:fis:inject-api-unavailable-error");
        assert_eq!(opt.duration, "PT2M");
        assert_eq!(opt.percentage, 100);
        assert_eq!(opt.log_prefix, "fis-logs");
        assert!(opt.log_bucket.is_none());
    }

    #[test]
    fn target_group_passes_arns_through() {
        let opt = test_opt();
        let request = build_template_request(&opt, None);

        let targets = request.targets.unwrap();
        let target = &targets[FIS_TARGET_NAME];
        assert_eq!(target.resource_arns, Some(opt.lambda_arns.clone()));
        assert_eq!(target.resource_type, FIS_LAMBDA_RESOURCE_TYPE);
        assert_eq!(target.selection_mode, "ALL");
    }

    #[test]
    fn action_parameters_are_stringified() {
        let mut opt = test_opt();
        opt.percentage = 37;
        opt.duration = "PT10M".to_string();
        let request = build_template_request(&opt, None);

        let action = &request.actions[FIS_ACTION_NAME];
        let parameters = action.parameters.as_ref().unwrap();
        assert_eq!(parameters["duration"], "PT10M");
        assert_eq!(parameters["percentage"], "37");
        assert_eq!(
            action.targets.as_ref().unwrap()[FIS_ACTION_TARGET_KEY],
            FIS_TARGET_NAME
        );
    }

    #[test]
    fn out_of_range_percentage_is_not_rejected() {
        // Bounds are enforced by the service, not locally.
        let mut opt = test_opt();
        opt.percentage = 250;
        let request = build_template_request(&opt, None);
        let action = &request.actions[FIS_ACTION_NAME];
        assert_eq!(action.parameters.as_ref().unwrap()["percentage"], "250");
    }

    #[test]
    fn fixed_tags_and_stop_condition() {
        let request = build_template_request(&test_opt(), None);
        let tags = request.tags.unwrap();
        assert_eq!(tags["Environment"], "test");
        assert_eq!(tags["ManagedBy"], "fis-automation");
        assert_eq!(request.stop_conditions.len(), 1);
        assert_eq!(request.stop_conditions[0].source, "none");
        assert!(!request.client_token.is_empty());
    }

    #[test]
    fn log_configuration_only_with_bucket() {
        let request = build_template_request(&test_opt(), None);
        assert!(request.log_configuration.is_none());

        let log_configuration =
            build_log_configuration(&Region::UsEast1, "123456789012", "my-bucket", "fis-logs");
        let request = build_template_request(&test_opt(), Some(log_configuration));
        let log_configuration = request.log_configuration.unwrap();
        assert_eq!(log_configuration.log_schema_version, FIS_LOG_SCHEMA_VERSION);

        let s3 = log_configuration.s3_configuration.unwrap();
        assert_eq!(s3.bucket_name, "my-bucket");
        assert_eq!(s3.prefix, Some("fis-logs".to_string()));

        let cloudwatch = log_configuration.cloud_watch_logs_configuration.unwrap();
        assert_eq!(
            cloudwatch.log_group_arn,
            "arn:aws:logs:us-east-1:123456789012:log-group:/aws/fis/*"
        );
    }

    #[test]
    fn partitioned_log_group_arns() {
        assert_eq!(
            build_log_group_arn(&Region::CnNorth1, "1"),
            "arn:aws-cn:logs:cn-north-1:1:log-group:/aws/fis/*"
        );
        assert_eq!(
            build_log_group_arn(&Region::UsGovEast1, "1"),
            "arn:aws-us-gov:logs:us-gov-east-1:1:log-group:/aws/fis/*"
        );
        assert_eq!(arn_partition(&Region::EuWest1), "aws");
    }

    #[test]
    fn single_target_scenario() {
        let opt = FaultExperimentOpt {
            role_arn: "arn:aws:iam::123:role/fis-role".to_string(),
            lambda_arns: vec!["arn:aws:lambda:us-east-1:123:function:f1".to_string()],
            duration: "PT5M".to_string(),
            percentage: 50,
            ..Default::default()
        };
        let request = build_template_request(&opt, None);

        let targets = request.targets.unwrap();
        assert_eq!(
            targets[FIS_TARGET_NAME].resource_arns.as_ref().unwrap().len(),
            1
        );
        let parameters = request.actions[FIS_ACTION_NAME].parameters.clone().unwrap();
        assert_eq!(parameters["duration"], "PT5M");
        assert_eq!(parameters["percentage"], "50");
        assert!(request.log_configuration.is_none());
    }

    /// A FIS client whose every request fails with a service error.
    fn failing_fis() -> FisClient {
        FisClient::new_with(
            MockRequestDispatcher::with_status(400)
                .with_body(r#"{"message":"request rejected"}"#),
            MockCredentialsProvider,
            Region::UsEast1,
        )
    }

    #[tokio::test]
    async fn failed_create_propagates_the_error() {
        let fis = failing_fis();
        let sts = StsClient::new_with(
            MockRequestDispatcher::with_status(400),
            MockCredentialsProvider,
            Region::UsEast1,
        );
        let result = create_experiment_template(&fis, &sts, &Region::UsEast1, &test_opt()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn no_start_skips_the_start_call() {
        // Any request through this client fails, so touching the service at
        // all would turn this Ok into an Err.
        let fis = failing_fis();
        maybe_start_experiment(&fis, "EXT123", true).await.unwrap();
    }

    #[tokio::test]
    async fn start_follows_create_by_default() {
        let fis = FisClient::new_with(
            MockRequestDispatcher::default()
                .with_body(r#"{"experiment":{"id":"EXP1","state":{"status":"initiating"}}}"#),
            MockCredentialsProvider,
            Region::UsEast1,
        );
        maybe_start_experiment(&fis, "EXT123", false).await.unwrap();
    }
}

//! Invocation configuration from the environment.
//!
//! Everything is read and validated up front: a missing or malformed
//! setting is a [`ProvisionError::Configuration`] raised before the first
//! record is touched.

use crate::error::ProvisionError;
use crate::handoff::template_url_for;
use crate::record::{RecordSchema, StackDefaults};
use crate::retry::RetryPolicy;
use crate::types::Pairs;
use crate::waiter::{WaitConfig, WaitStrategy};
use crate::workflow::PipelineConfig;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_COMMAND_DOCUMENT: &str = "AWS-RunPowerShellScript";
pub const DEFAULT_COMMAND_TEMPLATE: &str = r#"Rename-Computer -NewName "{directive}" -Force -Restart"#;
pub const DEFAULT_REQUIRED_COLUMNS: &str = "StackName,Action,InstanceType,AmiId";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Upsert, wait, and post-configure in this process.
    Stack,
    /// Start one workflow execution per record.
    Workflow,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stack" => Ok(Mode::Stack),
            "workflow" => Ok(Mode::Workflow),
            other => Err(format!("unknown mode '{}'", other)),
        }
    }
}

/// Where the stack template lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateLocation {
    Url(String),
    /// Object key in the upload bucket; resolved per event.
    BucketKey { region: String, key: String },
}

impl TemplateLocation {
    pub fn resolve(&self, bucket: &str) -> String {
        match self {
            TemplateLocation::Url(url) => url.clone(),
            TemplateLocation::BucketKey { region, key } => template_url_for(region, bucket, key),
        }
    }
}

/// Subnet and security group every instance is placed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPlacement {
    pub subnet_id: String,
    pub security_group_id: String,
}

/// Remote command settings for post-configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandConfig {
    pub document_name: String,
    /// Script with a `{directive}` placeholder.
    pub template: String,
}

impl CommandConfig {
    pub fn render(&self, directive: &str) -> String {
        self.template.replace("{directive}", directive)
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            document_name: DEFAULT_COMMAND_DOCUMENT.into(),
            template: DEFAULT_COMMAND_TEMPLATE.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    pub mode: Mode,
    pub template: Option<TemplateLocation>,
    pub role_arn: Option<String>,
    pub network: Option<NetworkPlacement>,
    pub schema: RecordSchema,
    pub output_key: String,
    pub wait: WaitConfig,
    pub command: CommandConfig,
    pub state_machine_arn: Option<String>,
    pub required_columns: Vec<String>,
}

impl ProvisionConfig {
    pub fn from_env() -> Result<Self, ProvisionError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ProvisionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mode = match get("PROVISION_MODE") {
            Some(raw) => raw.parse().map_err(ProvisionError::Configuration)?,
            None => Mode::Stack,
        };

        let template = match (get("TEMPLATE_URL"), get("TEMPLATE_KEY")) {
            (Some(url), _) => Some(TemplateLocation::Url(url)),
            (None, Some(key)) => Some(TemplateLocation::BucketKey {
                region: get("AWS_REGION").ok_or_else(|| {
                    missing("AWS_REGION (needed to resolve TEMPLATE_KEY)")
                })?,
                key,
            }),
            (None, None) => None,
        };

        let network = match (get("SUBNET_ID"), get("SECURITY_GROUP_ID")) {
            (Some(subnet_id), Some(security_group_id)) => Some(NetworkPlacement {
                subnet_id,
                security_group_id,
            }),
            (None, None) => None,
            (Some(_), None) => return Err(missing("SECURITY_GROUP_ID (SUBNET_ID is set)")),
            (None, Some(_)) => return Err(missing("SUBNET_ID (SECURITY_GROUP_ID is set)")),
        };

        let schema = RecordSchema {
            name_prefix: get("STACK_NAME_PREFIX").unwrap_or_else(|| "ec2-".into()),
            ..RecordSchema::default()
        };

        let strategy = match get("WAIT_STRATEGY") {
            Some(raw) => raw.parse::<WaitStrategy>().map_err(ProvisionError::Configuration)?,
            None => WaitStrategy::default(),
        };
        let policy = RetryPolicy::new(
            number(&get, "POLL_MAX_ATTEMPTS", 8)?,
            Duration::from_secs(number(&get, "POLL_DELAY_SECONDS", 15)?),
        )
        .with_initial_delay(Duration::from_secs(number(
            &get,
            "POLL_INITIAL_DELAY_SECONDS",
            0,
        )?));
        let wait = WaitConfig {
            strategy,
            policy,
            not_found_grace_attempts: number(&get, "NOT_FOUND_GRACE_ATTEMPTS", 3)?,
        };

        let command = CommandConfig {
            document_name: get("COMMAND_DOCUMENT").unwrap_or_else(|| DEFAULT_COMMAND_DOCUMENT.into()),
            template: get("COMMAND_TEMPLATE").unwrap_or_else(|| DEFAULT_COMMAND_TEMPLATE.into()),
        };

        let required_columns = get("REQUIRED_COLUMNS")
            .unwrap_or_else(|| DEFAULT_REQUIRED_COLUMNS.into())
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();

        let config = Self {
            mode,
            template,
            role_arn: get("CFN_ROLE_ARN"),
            network,
            schema,
            output_key: get("OUTPUT_KEY").unwrap_or_else(|| "InstanceId".into()),
            wait,
            command,
            state_machine_arn: get("STATE_MACHINE_ARN"),
            required_columns,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the selected mode has everything it needs.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        match self.mode {
            Mode::Stack => {
                if self.template.is_none() {
                    return Err(missing("TEMPLATE_URL or TEMPLATE_KEY"));
                }
                if self.role_arn.is_none() {
                    return Err(missing("CFN_ROLE_ARN"));
                }
            }
            Mode::Workflow => {
                if self.state_machine_arn.is_none() {
                    return Err(missing("STATE_MACHINE_ARN"));
                }
                if self.template.is_none() {
                    return Err(missing("TEMPLATE_URL or TEMPLATE_KEY"));
                }
            }
        }
        if !self.command.template.contains("{directive}") {
            return Err(ProvisionError::Configuration(
                "COMMAND_TEMPLATE must contain {directive}".into(),
            ));
        }
        Ok(())
    }

    /// Pipeline settings for an upload that arrived in `bucket/key`.
    pub fn pipeline_config(&self, bucket: &str, key: &str) -> Result<PipelineConfig, ProvisionError> {
        let template_url = self
            .template
            .as_ref()
            .map(|t| t.resolve(bucket))
            .ok_or_else(|| missing("TEMPLATE_URL or TEMPLATE_KEY"))?;
        let role_arn = self.role_arn.clone().ok_or_else(|| missing("CFN_ROLE_ARN"))?;

        let mut parameters = Pairs::new();
        if let Some(network) = &self.network {
            parameters.insert("SubnetId".into(), network.subnet_id.clone());
            parameters.insert("SecurityGroupId".into(), network.security_group_id.clone());
        }

        let mut tags = Pairs::new();
        tags.insert("SourceFile".into(), format!("s3://{}/{}", bucket, key));
        tags.insert("ManagedBy".into(), env!("CARGO_PKG_NAME").into());

        Ok(PipelineConfig {
            defaults: StackDefaults {
                template_url,
                role_arn,
                parameters,
                tags,
            },
            output_key: self.output_key.clone(),
            wait: self.wait.clone(),
        })
    }
}

fn number<G, T>(get: &G, key: &str, default: T) -> Result<T, ProvisionError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|_| {
            ProvisionError::Configuration(format!("{} must be a non-negative integer, got '{}'", key, raw))
        }),
        None => Ok(default),
    }
}

fn missing(what: &str) -> ProvisionError {
    ProvisionError::Configuration(format!("{} is not set", what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ProvisionConfig, ProvisionError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ProvisionConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_stack_mode_defaults() {
        let config = config_from(&[
            ("TEMPLATE_URL", "https://bucket.s3.amazonaws.com/ec2.yaml"),
            ("CFN_ROLE_ARN", "arn:aws:iam::1:role/cfn"),
        ])
        .unwrap();

        assert_eq!(config.mode, Mode::Stack);
        assert_eq!(config.output_key, "InstanceId");
        assert_eq!(config.schema.name_prefix, "ec2-");
        assert_eq!(config.wait.policy.max_attempts, 8);
        assert_eq!(config.wait.policy.delay, Duration::from_secs(15));
        assert_eq!(config.wait.policy.initial_delay, Duration::ZERO);
        assert_eq!(config.wait.strategy, WaitStrategy::PollForOutput);
        assert_eq!(config.required_columns.len(), 4);
        assert!(config.network.is_none());
    }

    #[test]
    fn test_missing_role_is_configuration_error() {
        let err = config_from(&[("TEMPLATE_URL", "https://t")]).unwrap_err();
        assert!(matches!(err, ProvisionError::Configuration(_)));
        assert!(err.to_string().contains("CFN_ROLE_ARN"));
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_half_network_placement_rejected() {
        let err = config_from(&[
            ("TEMPLATE_URL", "https://t"),
            ("CFN_ROLE_ARN", "arn"),
            ("SUBNET_ID", "subnet-1"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("SECURITY_GROUP_ID"));
    }

    #[test]
    fn test_bad_numbers_and_strategy() {
        let base = [("TEMPLATE_URL", "https://t"), ("CFN_ROLE_ARN", "arn")];

        let mut pairs = base.to_vec();
        pairs.push(("POLL_MAX_ATTEMPTS", "many"));
        assert!(config_from(&pairs).unwrap_err().to_string().contains("POLL_MAX_ATTEMPTS"));

        let mut pairs = base.to_vec();
        pairs.push(("WAIT_STRATEGY", "forever"));
        assert!(config_from(&pairs).is_err());
    }

    #[test]
    fn test_workflow_mode_requires_state_machine() {
        let err = config_from(&[("PROVISION_MODE", "workflow"), ("TEMPLATE_KEY", "t.yaml")])
            .unwrap_err();
        assert!(err.to_string().contains("AWS_REGION"));

        let err = config_from(&[
            ("PROVISION_MODE", "workflow"),
            ("TEMPLATE_KEY", "t.yaml"),
            ("AWS_REGION", "ap-northeast-1"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("STATE_MACHINE_ARN"));

        let config = config_from(&[
            ("PROVISION_MODE", "workflow"),
            ("TEMPLATE_KEY", "t.yaml"),
            ("AWS_REGION", "ap-northeast-1"),
            ("STATE_MACHINE_ARN", "arn:aws:states:sm"),
        ])
        .unwrap();
        assert_eq!(
            config.template.unwrap().resolve("uploads"),
            "https://s3.ap-northeast-1.amazonaws.com/uploads/t.yaml"
        );
    }

    #[test]
    fn test_pipeline_config_injects_placement_and_tags() {
        let config = config_from(&[
            ("TEMPLATE_URL", "https://t"),
            ("CFN_ROLE_ARN", "arn"),
            ("SUBNET_ID", "subnet-1"),
            ("SECURITY_GROUP_ID", "sg-1"),
            ("POLL_INITIAL_DELAY_SECONDS", "30"),
        ])
        .unwrap();
        let pipeline = config.pipeline_config("uploads", "in/hosts.csv").unwrap();

        assert_eq!(pipeline.defaults.parameters["SubnetId"], "subnet-1");
        assert_eq!(pipeline.defaults.parameters["SecurityGroupId"], "sg-1");
        assert_eq!(pipeline.defaults.tags["SourceFile"], "s3://uploads/in/hosts.csv");
        assert_eq!(pipeline.defaults.tags["ManagedBy"], "stack-provision");
        assert_eq!(pipeline.wait.policy.initial_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_command_render() {
        let command = CommandConfig::default();
        assert_eq!(
            command.render("WEB01"),
            r#"Rename-Computer -NewName "WEB01" -Force -Restart"#
        );
    }
}

//! Record validation: one uploaded row in, one [`RecordPlan`] out.
//!
//! A record is a flat, ordered field → value map. The schema names the few
//! fields with special meaning; everything else becomes a stack parameter
//! or, with the tag prefix, a stack tag.

use crate::error::ProvisionError;
use crate::types::{Pairs, StackRequest};
use serde::{Deserialize, Serialize};

/// One row from the record source.
pub type Record = Pairs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordAction {
    Upsert,
    Delete,
}

/// A validated record, ready for the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPlan {
    /// 1-based position in the source file.
    pub index: usize,
    pub stack_name: String,
    pub action: RecordAction,
    pub parameters: Pairs,
    pub tags: Pairs,
    /// Post-configuration directive; `None` when the field is absent or blank.
    pub directive: Option<String>,
}

/// Per-invocation values shared by every stack request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackDefaults {
    pub template_url: String,
    pub role_arn: String,
    /// Added to the parameters unless the record sets the same key.
    pub parameters: Pairs,
    /// Added to the tags unless the record sets the same key.
    pub tags: Pairs,
}

impl RecordPlan {
    pub fn to_request(&self, defaults: &StackDefaults) -> StackRequest {
        let mut request = StackRequest::new(
            &self.stack_name,
            &defaults.template_url,
            &defaults.role_arn,
        );
        request.parameters = self.parameters.clone();
        for (key, value) in &defaults.parameters {
            request
                .parameters
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        request.tags = self.tags.clone();
        for (key, value) in &defaults.tags {
            request.tags.entry(key.clone()).or_insert_with(|| value.clone());
        }
        request
    }
}

/// Which fields mean what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    pub stack_name_field: String,
    pub action_field: String,
    pub directive_field: String,
    pub tag_prefix: String,
    /// Every stack name must start with this.
    pub name_prefix: String,
    /// Fields that must be non-empty for an upsert.
    pub required_fields: Vec<String>,
}

impl Default for RecordSchema {
    fn default() -> Self {
        Self {
            stack_name_field: "StackName".into(),
            action_field: "Action".into(),
            directive_field: "HostName".into(),
            tag_prefix: "Tag-".into(),
            name_prefix: "ec2-".into(),
            required_fields: Vec::new(),
        }
    }
}

const MAX_STACK_NAME_LEN: usize = 128;

impl RecordSchema {
    /// Validate `record` and split it into a [`RecordPlan`].
    pub fn plan(&self, index: usize, record: &Record) -> Result<RecordPlan, ProvisionError> {
        let stack_name = self
            .field(record, &self.stack_name_field)
            .ok_or_else(|| invalid(index, format!("missing {}", self.stack_name_field)))?;
        self.check_stack_name(index, stack_name)?;

        let action = match self.field(record, &self.action_field) {
            None => RecordAction::Upsert,
            Some(a) if a.eq_ignore_ascii_case("delete") => RecordAction::Delete,
            Some(a)
                if ["create", "update", "upsert"]
                    .iter()
                    .any(|known| a.eq_ignore_ascii_case(known)) =>
            {
                RecordAction::Upsert
            }
            Some(other) => return Err(invalid(index, format!("unknown action '{}'", other))),
        };

        if action == RecordAction::Upsert {
            let missing: Vec<&str> = self
                .required_fields
                .iter()
                .filter(|f| self.field(record, f).is_none())
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(invalid(
                    index,
                    format!("missing required fields: {}", missing.join(", ")),
                ));
            }
        }

        let mut parameters = Pairs::new();
        let mut tags = Pairs::new();
        for (key, value) in record {
            let key = key.trim();
            let value = value.trim();
            if value.is_empty() || self.is_reserved(key) {
                continue;
            }
            match key.strip_prefix(self.tag_prefix.as_str()) {
                Some(tag) if !tag.is_empty() => {
                    tags.insert(tag.to_string(), value.to_string());
                }
                Some(_) => return Err(invalid(index, "tag field without a tag name")),
                None => {
                    parameters.insert(key.to_string(), value.to_string());
                }
            }
        }

        let directive = self.field(record, &self.directive_field);
        if let Some(directive) = directive {
            check_host_name(index, directive)?;
        }

        Ok(RecordPlan {
            index,
            stack_name: stack_name.to_string(),
            action,
            parameters,
            tags,
            directive: directive.map(str::to_string),
        })
    }

    fn check_stack_name(&self, index: usize, name: &str) -> Result<(), ProvisionError> {
        if !name.starts_with(self.name_prefix.as_str()) {
            return Err(invalid(
                index,
                format!("stack name '{}' must start with '{}'", name, self.name_prefix),
            ));
        }
        let mut chars = name.chars();
        let starts_alpha = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
        let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !starts_alpha || !rest_ok || name.len() > MAX_STACK_NAME_LEN {
            return Err(invalid(index, format!("stack name '{}' is not valid", name)));
        }
        Ok(())
    }

    fn is_reserved(&self, key: &str) -> bool {
        key == self.stack_name_field || key == self.action_field || key == self.directive_field
    }

    /// Trimmed, non-empty value of `name`. Keys compare trimmed.
    fn field<'r>(&self, record: &'r Record, name: &str) -> Option<&'r str> {
        record
            .iter()
            .find(|(key, _)| key.trim() == name)
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Longest NetBIOS computer name.
const MAX_HOST_NAME_LEN: usize = 15;

/// The directive ends up inside a remote script, so only plain host names pass.
fn check_host_name(index: usize, name: &str) -> Result<(), ProvisionError> {
    let chars_ok = name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    let digits_only = name.chars().all(|c| c.is_ascii_digit());
    if !chars_ok
        || digits_only
        || name.starts_with('-')
        || name.ends_with('-')
        || name.len() > MAX_HOST_NAME_LEN
    {
        return Err(invalid(index, format!("host name '{}' is not valid", name)));
    }
    Ok(())
}

fn invalid(index: usize, reason: impl std::fmt::Display) -> ProvisionError {
    ProvisionError::RecordValidation(format!("record {}: {}", index, reason))
}

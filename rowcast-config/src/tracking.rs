use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::env::resolve_env_value;
use crate::error::ConfigError;

/// The root of the tracking document.
///
/// Maps `<table>.<op>` keys to rules, sink kinds to destination entries
/// (separately for processed events and raw rows), and table names to
/// ignore entries. Parsed once, validated, then read-only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackingDocument {
    #[serde(default)]
    pub track: BTreeMap<String, TrackRule>,
    #[serde(default)]
    pub destinations: BTreeMap<String, DestinationConfig>,
    #[serde(default)]
    pub raw_db_event_destinations: BTreeMap<String, DestinationConfig>,
    #[serde(default)]
    pub ignore: BTreeMap<String, ColumnIgnore>,
}

impl TrackingDocument {
    /// Reads, parses and validates a tracking document from disk.
    pub fn from_path(path: &Path) -> Result<TrackingDocument, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut document: TrackingDocument =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        document.validate()?;

        Ok(document)
    }

    /// Structural validation plus `$ENV_VAR` resolution.
    ///
    /// Expression compilation against the schema happens later, once the
    /// descriptor is available; this pass only rejects what can be rejected
    /// without a database connection.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        for (key, rule) in &self.track {
            let parsed = TrackKey::parse(key)?;
            rule.validate(&parsed)?;
        }

        for (kind, destination) in self.destinations.iter_mut() {
            destination.validate(kind, DestinationRole::Processed)?;
        }
        for (kind, destination) in self.raw_db_event_destinations.iter_mut() {
            destination.validate(kind, DestinationRole::Raw)?;
        }

        for (table, ignore) in &self.ignore {
            ignore.validate(table)?;
        }

        Ok(())
    }
}

/// A parsed `<table>.<op>` track key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackKey {
    pub table: String,
    pub op: String,
}

impl TrackKey {
    pub fn parse(key: &str) -> Result<TrackKey, ConfigError> {
        let invalid = || ConfigError::InvalidTrackKey {
            key: key.to_string(),
        };

        let (table, op) = key.rsplit_once('.').ok_or_else(invalid)?;
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(invalid());
        }
        if !matches!(op, "insert" | "update" | "delete") {
            return Err(invalid());
        }

        Ok(TrackKey {
            table: table.to_string(),
            op: op.to_string(),
        })
    }
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.op)
    }
}

/// A tracking rule: either a fixed event or a condition selecting a branch.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TrackRule {
    Simple(SimpleRule),
    Conditional(ConditionalRule),
}

impl TrackRule {
    fn validate(&self, key: &TrackKey) -> Result<(), ConfigError> {
        match self {
            TrackRule::Simple(rule) => {
                if rule.event.is_empty() {
                    return Err(ConfigError::InvalidRule {
                        key: key.to_string(),
                        reason: "event name must not be empty".to_string(),
                    });
                }
            }
            TrackRule::Conditional(rule) => {
                if rule.cond.trim().is_empty() {
                    return Err(ConfigError::InvalidRule {
                        key: key.to_string(),
                        reason: "cond must not be empty".to_string(),
                    });
                }
                if rule.branches.is_empty() {
                    return Err(ConfigError::InvalidRule {
                        key: key.to_string(),
                        reason: "a conditional rule must declare at least one event".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// `{event, properties?}`: one fixed event name plus property projections.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimpleRule {
    pub event: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// `{cond, <event>: {properties?}, …}`: a condition expression selecting one
/// of the declared branches, or null for "no event".
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionalRule {
    pub cond: String,
    #[serde(flatten)]
    pub branches: BTreeMap<String, BranchRule>,
}

/// One branch of a conditional rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BranchRule {
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Whether a destination entry feeds processed events or raw log rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationRole {
    Processed,
    Raw,
}

fn default_filter() -> String {
    "*".to_string()
}

/// One destination entry. Kind-specific fields are all optional at the
/// serde layer; `validate` enforces what each kind requires and resolves
/// `$ENV_VAR` indirections in place.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub project_token: Option<String>,
    #[serde(default)]
    pub table_id: Option<String>,
    #[serde(default)]
    pub credentials_json: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub root_dir: Option<String>,
    #[serde(default)]
    pub flush_on_batch: Option<bool>,
    #[serde(default)]
    pub max_events_per_file: Option<usize>,
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        DestinationConfig {
            filter: default_filter(),
            api_key: None,
            project_token: None,
            table_id: None,
            credentials_json: None,
            endpoint: None,
            bucket: None,
            region: None,
            access_key_id: None,
            secret_access_key: None,
            root_dir: None,
            flush_on_batch: None,
            max_events_per_file: None,
            flush_interval_ms: None,
        }
    }
}

impl DestinationConfig {
    fn validate(&mut self, kind: &str, role: DestinationRole) -> Result<(), ConfigError> {
        self.filter = self.filter.trim().to_string();
        if self.filter.is_empty() {
            self.filter = default_filter();
        }
        if self.filter != "*" {
            globset::Glob::new(&self.filter).map_err(|err| ConfigError::InvalidFilter {
                pattern: self.filter.clone(),
                reason: err.to_string(),
            })?;
        }

        for field in [
            &mut self.api_key,
            &mut self.project_token,
            &mut self.table_id,
            &mut self.credentials_json,
            &mut self.endpoint,
            &mut self.bucket,
            &mut self.region,
            &mut self.access_key_id,
            &mut self.secret_access_key,
            &mut self.root_dir,
        ] {
            if let Some(value) = field.as_deref() {
                *field = Some(resolve_env_value(value)?);
            }
        }

        let required = |field: &Option<String>, name: &str| -> Result<(), ConfigError> {
            match field.as_deref() {
                Some(value) if !value.is_empty() => Ok(()),
                _ => Err(ConfigError::Destination {
                    kind: kind.to_string(),
                    reason: format!("`{name}` is required"),
                }),
            }
        };

        match (kind, role) {
            ("posthog" | "amplitude", DestinationRole::Processed) => {
                required(&self.api_key, "api_key")
            }
            ("mixpanel", DestinationRole::Processed) => {
                required(&self.project_token, "project_token")
            }
            ("bigquery", _) => {
                required(&self.table_id, "table_id")?;
                required(&self.credentials_json, "credentials_json")
            }
            ("s3", _) => {
                required(&self.bucket, "bucket")?;
                required(&self.region, "region")
            }
            ("loopback", _) => Ok(()),
            _ => Err(ConfigError::Destination {
                kind: kind.to_string(),
                reason: match role {
                    DestinationRole::Processed => "unknown destination kind".to_string(),
                    DestinationRole::Raw => "unknown raw event destination kind".to_string(),
                },
            }),
        }
    }
}

/// An ignore entry: either the whole table or a set of its columns.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ColumnIgnore {
    All(String),
    Columns(Vec<String>),
}

impl ColumnIgnore {
    pub fn is_all(&self) -> bool {
        matches!(self, ColumnIgnore::All(_))
    }

    pub fn columns(&self) -> &[String] {
        match self {
            ColumnIgnore::All(_) => &[],
            ColumnIgnore::Columns(columns) => columns,
        }
    }

    fn validate(&self, table: &str) -> Result<(), ConfigError> {
        match self {
            ColumnIgnore::All(marker) if marker == "*" => Ok(()),
            ColumnIgnore::All(_) => Err(ConfigError::InvalidIgnore {
                table: table.to_string(),
                reason: "must be `*` or an array of column names".to_string(),
            }),
            ColumnIgnore::Columns(columns) if columns.is_empty() => {
                Err(ConfigError::InvalidIgnore {
                    table: table.to_string(),
                    reason: "must list at least one column".to_string(),
                })
            }
            ColumnIgnore::Columns(_) => Ok(()),
        }
    }
}

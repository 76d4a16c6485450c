//! Core domain model for txscout: scraper types, definitions, raw rows and outbound transactions.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "txscout-core";

/// Parameter id whose value names the tenant account a scraper imports into.
pub const ACCOUNT_PARAMETER_ID: &str = "account";

/// Reference ID of the synthetic opening-balance transaction.
pub const INITIALIZATION_REFERENCE_ID: &str = "initialization";

/// Environment contract between the orchestrator and an execution unit.
pub const ENV_TENANT_ID: &str = "TENANT_ID";
pub const ENV_SCRAPER_ID: &str = "SCRAPER_ID";
pub const ENV_SCRAPER_TYPE_ID: &str = "SCRAPER_TYPE_ID";
pub const ENV_LEDGER_API_URL: &str = "LEDGER_API_URL";
pub const ENV_RUN_DEADLINE_SECS: &str = "RUN_DEADLINE_SECS";
pub const ENV_PARAM_PREFIX: &str = "PARAM_";

static FLOAT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d+(\.\d+)?$").expect("static float pattern"));
static INTEGER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d+$").expect("static integer pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterType {
    Account,
    Boolean,
    Date,
    Float,
    Integer,
    Password,
    String,
}

impl ParameterType {
    /// Checks a raw submitted value against the declared type.
    pub fn accepts(self, value: &str) -> bool {
        match self {
            ParameterType::Boolean => matches!(value, "true" | "false"),
            ParameterType::Date => parse_iso_date(value).is_some(),
            ParameterType::Float => FLOAT_PATTERN.is_match(value),
            ParameterType::Integer => INTEGER_PATTERN.is_match(value),
            ParameterType::Account | ParameterType::Password | ParameterType::String => true,
        }
    }
}

/// Accepts a plain `YYYY-MM-DD` date or a full RFC 3339 timestamp.
pub fn parse_iso_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|dt| dt.with_timezone(&Utc).date_naive())
        })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScraperTypeParameter {
    pub id: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScraperType {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub parameters: Vec<ScraperTypeParameter>,
}

impl ScraperType {
    pub fn parameter(&self, parameter_id: &str) -> Option<&ScraperTypeParameter> {
        self.parameters.iter().find(|p| p.id == parameter_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown scraper type `{0}`")]
    UnknownScraperType(String),
    #[error("scraper type `{scraper_type_id}` declares no parameter `{parameter_id}`")]
    UnknownParameter {
        scraper_type_id: String,
        parameter_id: String,
    },
    #[error("value for parameter `{parameter_id}` is not a valid {expected:?}")]
    InvalidParameterValue {
        parameter_id: String,
        expected: ParameterType,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    scraper_types: Vec<ScraperType>,
}

/// Registry of scraper types and their parameter schemas.
#[derive(Debug, Clone, Default)]
pub struct ScraperTypeCatalog {
    types: Vec<ScraperType>,
    index: HashMap<String, usize>,
}

impl ScraperTypeCatalog {
    pub fn new(types: Vec<ScraperType>) -> Self {
        let index = types
            .iter()
            .enumerate()
            .map(|(idx, t)| (t.id.clone(), idx))
            .collect();
        Self { types, index }
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(yaml).context("parsing scraper type catalog")?;
        Ok(Self::new(file.scraper_types))
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("loading {}", path.display()))
    }

    pub fn get(&self, scraper_type_id: &str) -> Option<&ScraperType> {
        self.index.get(scraper_type_id).map(|idx| &self.types[*idx])
    }

    pub fn types(&self) -> &[ScraperType] {
        &self.types
    }

    /// Resolves the type and checks every submitted value against its declared parameter.
    pub fn validate(
        &self,
        scraper_type_id: &str,
        parameters: &[ParameterValue],
    ) -> Result<&ScraperType, ValidationError> {
        let scraper_type = self
            .get(scraper_type_id)
            .ok_or_else(|| ValidationError::UnknownScraperType(scraper_type_id.to_string()))?;

        for submitted in parameters {
            let declared = scraper_type.parameter(&submitted.parameter_id).ok_or_else(|| {
                ValidationError::UnknownParameter {
                    scraper_type_id: scraper_type_id.to_string(),
                    parameter_id: submitted.parameter_id.clone(),
                }
            })?;
            if !declared.param_type.accepts(&submitted.value) {
                return Err(ValidationError::InvalidParameterValue {
                    parameter_id: submitted.parameter_id.clone(),
                    expected: declared.param_type,
                });
            }
        }

        Ok(scraper_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterValue {
    pub parameter_id: String,
    pub value: String,
}

impl ParameterValue {
    pub fn new(parameter_id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            parameter_id: parameter_id.into(),
            value: value.into(),
        }
    }
}

/// Environment variable carrying a parameter value into an execution unit.
pub fn parameter_env_name(parameter_id: &str) -> String {
    let suffix: String = parameter_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{ENV_PARAM_PREFIX}{suffix}")
}

/// A tenant's configured scraper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScraperDefinition {
    pub id: Uuid,
    pub tenant_id: String,
    pub display_name: String,
    pub scraper_type_id: String,
    pub parameters: Vec<ParameterValue>,
    pub last_successful_scraped_date: Option<NaiveDate>,
}

impl ScraperDefinition {
    pub fn parameter_value(&self, parameter_id: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.parameter_id == parameter_id)
            .map(|p| p.value.as_str())
    }
}

/// Upsert input; `id == None` inserts a new definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScraperDraft {
    pub tenant_id: String,
    #[serde(default)]
    pub id: Option<Uuid>,
    pub scraper_type_id: String,
    pub display_name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
        }
    }
}

impl std::str::FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Trigger::Scheduled),
            "manual" => Ok(Trigger::Manual),
            other => Err(format!("invalid trigger: {other}")),
        }
    }
}

/// Status derived from raw cluster signals; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizedStatus {
    Pending,
    Running,
    Successful,
    Failed,
}

impl NormalizedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizedStatus::Pending => "pending",
            NormalizedStatus::Running => "running",
            NormalizedStatus::Successful => "successful",
            NormalizedStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NormalizedStatus::Successful | NormalizedStatus::Failed)
    }
}

impl fmt::Display for NormalizedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row as observed on the target site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransactionRow {
    pub date: NaiveDate,
    pub reference_id: String,
    pub description: String,
    #[serde(default)]
    pub debit: Option<Decimal>,
    #[serde(default)]
    pub credit: Option<Decimal>,
    #[serde(default)]
    pub balance_after: Option<Decimal>,
    #[serde(default)]
    pub compound: bool,
}

impl RawTransactionRow {
    pub fn amount(&self) -> Option<Decimal> {
        self.debit.or(self.credit)
    }

    /// Balance before this row was applied, if the row carries a balance.
    ///
    /// `None` when there is no `balance_after` or neither side is set.
    pub fn balance_before(&self) -> Option<Decimal> {
        let after = self.balance_after?;
        match (self.debit, self.credit) {
            (Some(debit), _) => Some(after + debit),
            (None, Some(credit)) => Some(after - credit),
            (None, None) => None,
        }
    }
}

/// The unit submitted to the tenant-domain API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundTransaction {
    pub date: NaiveDate,
    pub reference_id: String,
    pub description: String,
    pub amount: Decimal,
    pub sequence: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_account_id: Option<String>,
}

/// Inclusive date range scraped by one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStats {
    pub count: u64,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG_YAML: &str = r#"
scraper_types:
  - id: sample-bank
    displayName: Sample Bank
    parameters:
      - { id: username, displayName: Username, type: String }
      - { id: password, displayName: Password, type: Password }
      - { id: account, displayName: Account, type: Account }
      - { id: lookback-days, displayName: Lookback, type: Integer }
      - { id: fee-rate, displayName: Fee rate, type: Float }
      - { id: headless, displayName: Headless, type: Boolean }
      - { id: since, displayName: Since, type: Date }
"#;

    fn catalog() -> ScraperTypeCatalog {
        ScraperTypeCatalog::from_yaml_str(CATALOG_YAML).expect("catalog")
    }

    #[test]
    fn type_validators_follow_declared_formats() {
        assert!(ParameterType::Boolean.accepts("true"));
        assert!(!ParameterType::Boolean.accepts("TRUE"));
        assert!(ParameterType::Integer.accepts("-42"));
        assert!(!ParameterType::Integer.accepts("12.5"));
        assert!(ParameterType::Float.accepts("12.5"));
        assert!(ParameterType::Float.accepts("-3"));
        assert!(!ParameterType::Float.accepts("1e3"));
        assert!(!ParameterType::Float.accepts("12."));
        assert!(ParameterType::Date.accepts("2024-03-01"));
        assert!(ParameterType::Date.accepts("2024-03-01T10:00:00Z"));
        assert!(!ParameterType::Date.accepts("03/01/2024"));
        assert!(ParameterType::Password.accepts(""));
        assert!(ParameterType::Account.accepts("anything at all"));
    }

    #[test]
    fn catalog_rejects_unknown_type_and_parameter() {
        let catalog = catalog();
        assert_eq!(
            catalog.validate("nope", &[]).unwrap_err(),
            ValidationError::UnknownScraperType("nope".into())
        );
        let err = catalog
            .validate("sample-bank", &[ParameterValue::new("pin", "1234")])
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnknownParameter { ref parameter_id, .. } if parameter_id == "pin"));
    }

    #[test]
    fn catalog_rejects_malformed_integer() {
        let err = catalog()
            .validate("sample-bank", &[ParameterValue::new("lookback-days", "12.5")])
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidParameterValue {
                parameter_id: "lookback-days".into(),
                expected: ParameterType::Integer,
            }
        );
    }

    #[test]
    fn catalog_accepts_well_formed_values() {
        let params = vec![
            ParameterValue::new("username", "alice"),
            ParameterValue::new("password", "s3cret!"),
            ParameterValue::new("account", "acc-1"),
            ParameterValue::new("lookback-days", "30"),
            ParameterValue::new("fee-rate", "0.25"),
            ParameterValue::new("headless", "false"),
            ParameterValue::new("since", "2024-01-31"),
        ];
        let catalog = catalog();
        let scraper_type = catalog.validate("sample-bank", &params).expect("valid");
        assert_eq!(scraper_type.display_name, "Sample Bank");
    }

    #[test]
    fn parameter_env_names_are_deterministic() {
        assert_eq!(parameter_env_name("lookback-days"), "PARAM_LOOKBACK_DAYS");
        assert_eq!(parameter_env_name("account"), "PARAM_ACCOUNT");
        assert_eq!(parameter_env_name("a.b c"), "PARAM_A_B_C");
    }

    #[test]
    fn balance_before_reverses_the_row() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let debit_row = RawTransactionRow {
            date,
            reference_id: "C".into(),
            description: "coffee".into(),
            debit: Some(Decimal::from(100)),
            credit: None,
            balance_after: Some(Decimal::from(-100)),
            compound: false,
        };
        assert_eq!(debit_row.balance_before(), Some(Decimal::ZERO));

        let credit_row = RawTransactionRow {
            debit: None,
            credit: Some(Decimal::from(1000)),
            balance_after: Some(Decimal::from(900)),
            ..debit_row.clone()
        };
        assert_eq!(credit_row.balance_before(), Some(Decimal::from(-100)));

        let empty = RawTransactionRow {
            debit: None,
            credit: None,
            ..debit_row
        };
        assert_eq!(empty.balance_before(), None);
        assert_eq!(empty.amount(), None);
    }
}

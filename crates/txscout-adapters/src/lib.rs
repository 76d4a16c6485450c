//! Row source contracts + concrete row sources for supported target sites.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Url;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use txscout_core::{parameter_env_name, DateWindow, RawTransactionRow};

pub const CRATE_NAME: &str = "txscout-adapters";

pub const FIXTURE_LEDGER_TYPE: &str = "fixture-ledger";
pub const HTML_STATEMENT_TYPE: &str = "html-statement";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("login failed: {0}")]
    Authentication(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("could not read statement: {0}")]
    Parse(String),
    #[error("missing parameter `{0}`")]
    MissingParameter(String),
    #[error("no row source registered for scraper type `{0}`")]
    UnknownScraperType(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Capability surface of a target site, as seen by the sync engine.
///
/// Call order per run: `authenticate`, `set_range`, `list_rows`, then `expand`
/// for every row `is_compound` flags.
#[async_trait]
pub trait RowSource: Send {
    fn scraper_type_id(&self) -> &'static str;

    async fn authenticate(&mut self) -> Result<(), AdapterError>;

    fn set_range(&mut self, window: DateWindow);

    /// Account-level rows inside the current range, in the site's native
    /// (newest first) order.
    async fn list_rows(&mut self) -> Result<Vec<RawTransactionRow>, AdapterError>;

    fn is_compound(&self, row: &RawTransactionRow) -> bool {
        row.compound
    }

    /// Sub-rows of an aggregate row, in display order.
    async fn expand(&mut self, row: &RawTransactionRow) -> Result<Vec<RawTransactionRow>, AdapterError>;
}

/// Parameter values keyed by their execution-unit environment name.
#[derive(Debug, Clone, Default)]
pub struct SourceParams {
    values: HashMap<String, String>,
}

impl SourceParams {
    pub fn from_env_map(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn insert(&mut self, parameter_id: &str, value: impl Into<String>) {
        self.values.insert(parameter_env_name(parameter_id), value.into());
    }

    pub fn get(&self, parameter_id: &str) -> Option<&str> {
        self.values
            .get(&parameter_env_name(parameter_id))
            .map(String::as_str)
    }

    pub fn require(&self, parameter_id: &str) -> Result<&str, AdapterError> {
        self.get(parameter_id)
            .ok_or_else(|| AdapterError::MissingParameter(parameter_id.to_string()))
    }
}

pub fn row_source_for_type(
    scraper_type_id: &str,
    params: &SourceParams,
) -> Result<Box<dyn RowSource>, AdapterError> {
    match scraper_type_id {
        FIXTURE_LEDGER_TYPE => Ok(Box::new(FixtureRowSource::from_params(params)?)),
        HTML_STATEMENT_TYPE => Ok(Box::new(HtmlStatementSource::from_params(params)?)),
        other => Err(AdapterError::UnknownScraperType(other.to_string())),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureStatement {
    #[serde(default)]
    pub password: Option<String>,
    /// Newest first, as the site lists them.
    pub rows: Vec<FixtureRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureRow {
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
    pub children: Vec<FixtureChild>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureChild {
    pub date: NaiveDate,
    pub description: String,
    #[serde(default)]
    pub debit: Option<Decimal>,
    #[serde(default)]
    pub credit: Option<Decimal>,
}

impl FixtureRow {
    fn to_raw(&self) -> RawTransactionRow {
        RawTransactionRow {
            date: self.date,
            reference_id: self.reference_id.clone(),
            description: self.description.clone(),
            debit: self.debit,
            credit: self.credit,
            balance_after: self.balance_after,
            compound: !self.children.is_empty(),
        }
    }
}

pub fn load_fixture_statement(path: impl AsRef<Path>) -> anyhow::Result<FixtureStatement> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Replays a captured statement from a JSON file.
#[derive(Debug, Clone)]
pub struct FixtureRowSource {
    path: PathBuf,
    password: Option<String>,
    statement: Option<FixtureStatement>,
    window: Option<DateWindow>,
}

impl FixtureRowSource {
    pub fn new(path: impl Into<PathBuf>, password: Option<String>) -> Self {
        Self {
            path: path.into(),
            password,
            statement: None,
            window: None,
        }
    }

    pub fn from_params(params: &SourceParams) -> Result<Self, AdapterError> {
        Ok(Self::new(
            params.require("fixture-path")?,
            params.get("password").map(ToString::to_string),
        ))
    }

    fn statement(&self) -> Result<&FixtureStatement, AdapterError> {
        self.statement
            .as_ref()
            .ok_or_else(|| AdapterError::Navigation("statement requested before login".into()))
    }
}

#[async_trait]
impl RowSource for FixtureRowSource {
    fn scraper_type_id(&self) -> &'static str {
        FIXTURE_LEDGER_TYPE
    }

    async fn authenticate(&mut self) -> Result<(), AdapterError> {
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let statement: FixtureStatement = serde_json::from_str(&data)
            .map_err(|e| AdapterError::Parse(format!("{}: {e}", self.path.display())))?;

        if let Some(expected) = &statement.password {
            if self.password.as_deref() != Some(expected.as_str()) {
                return Err(AdapterError::Authentication("password rejected".into()));
            }
        }
        self.statement = Some(statement);
        Ok(())
    }

    fn set_range(&mut self, window: DateWindow) {
        self.window = Some(window);
    }

    async fn list_rows(&mut self) -> Result<Vec<RawTransactionRow>, AdapterError> {
        let window = self.window;
        Ok(self
            .statement()?
            .rows
            .iter()
            .filter(|row| window.map_or(true, |w| row.date >= w.start && row.date <= w.end))
            .map(FixtureRow::to_raw)
            .collect())
    }

    async fn expand(&mut self, row: &RawTransactionRow) -> Result<Vec<RawTransactionRow>, AdapterError> {
        let parent = self
            .statement()?
            .rows
            .iter()
            .find(|r| r.reference_id == row.reference_id)
            .ok_or_else(|| AdapterError::Navigation(format!("no detail view for {}", row.reference_id)))?;
        Ok(parent
            .children
            .iter()
            .map(|child| RawTransactionRow {
                date: child.date,
                reference_id: String::new(),
                description: child.description.clone(),
                debit: child.debit,
                credit: child.credit,
                balance_after: None,
                compound: false,
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct HtmlStatementConfig {
    pub login_url: String,
    pub statement_url: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

/// Scrapes a server-rendered online-banking statement.
///
/// Expects `table#transactions` rows with cells
/// `date | reference | description | debit | credit | balance`; aggregate rows
/// carry a `data-detail-url` attribute pointing at a `table#details` page
/// with cells `date | description | debit | credit`.
#[derive(Debug)]
pub struct HtmlStatementSource {
    config: HtmlStatementConfig,
    client: reqwest::Client,
    window: Option<DateWindow>,
    detail_urls: HashMap<String, Url>,
}

impl HtmlStatementSource {
    pub fn new(config: HtmlStatementConfig) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .gzip(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            config,
            client,
            window: None,
            detail_urls: HashMap::new(),
        })
    }

    pub fn from_params(params: &SourceParams) -> Result<Self, AdapterError> {
        Self::new(HtmlStatementConfig {
            login_url: params.require("login-url")?.to_string(),
            statement_url: params.require("statement-url")?.to_string(),
            username: params.require("username")?.to_string(),
            password: params.require("password")?.to_string(),
            timeout: Duration::from_secs(30),
        })
    }

    async fn fetch_page(&self, url: Url) -> Result<(Url, String), AdapterError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::Navigation(format!("http status {status} for {url}")));
        }
        let final_url = response.url().clone();
        Ok((final_url, response.text().await?))
    }
}

#[async_trait]
impl RowSource for HtmlStatementSource {
    fn scraper_type_id(&self) -> &'static str {
        HTML_STATEMENT_TYPE
    }

    async fn authenticate(&mut self) -> Result<(), AdapterError> {
        let form = [
            ("username", self.config.username.as_str()),
            ("password", self.config.password.as_str()),
        ];
        let response = self
            .client
            .post(&self.config.login_url)
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::Authentication(format!("http status {status}")));
        }
        let body = response.text().await?;
        if page_has_login_form(&body)? {
            return Err(AdapterError::Authentication("credentials rejected".into()));
        }
        info!(scraper_type = HTML_STATEMENT_TYPE, "logged in");
        Ok(())
    }

    fn set_range(&mut self, window: DateWindow) {
        self.window = Some(window);
    }

    async fn list_rows(&mut self) -> Result<Vec<RawTransactionRow>, AdapterError> {
        let mut url = Url::parse(&self.config.statement_url)
            .map_err(|e| AdapterError::Navigation(format!("bad statement url: {e}")))?;
        if let Some(window) = self.window {
            url.query_pairs_mut()
                .append_pair("from", &window.start.format("%Y-%m-%d").to_string())
                .append_pair("to", &window.end.format("%Y-%m-%d").to_string());
        }

        let (page_url, body) = self.fetch_page(url).await?;
        let parsed = parse_statement_page(&body)?;

        self.detail_urls.clear();
        let mut rows = Vec::with_capacity(parsed.len());
        for (mut row, detail) in parsed {
            if let Some(detail) = detail {
                let detail_url = page_url
                    .join(&detail)
                    .map_err(|e| AdapterError::Parse(format!("bad detail url `{detail}`: {e}")))?;
                self.detail_urls.insert(row.reference_id.clone(), detail_url);
                row.compound = true;
            }
            rows.push(row);
        }
        debug!(rows = rows.len(), "statement rows parsed");
        Ok(rows)
    }

    fn is_compound(&self, row: &RawTransactionRow) -> bool {
        row.compound || self.detail_urls.contains_key(&row.reference_id)
    }

    async fn expand(&mut self, row: &RawTransactionRow) -> Result<Vec<RawTransactionRow>, AdapterError> {
        let url = self
            .detail_urls
            .get(&row.reference_id)
            .cloned()
            .ok_or_else(|| AdapterError::Navigation(format!("no detail view for {}", row.reference_id)))?;
        let (_, body) = self.fetch_page(url).await?;
        parse_detail_page(&body)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Parse(e.to_string()))
}

fn cell_texts(row: ElementRef<'_>, td: &Selector) -> Vec<String> {
    row.select(td)
        .map(|cell| cell.text().collect::<String>().trim().to_string())
        .collect()
}

pub fn page_has_login_form(html: &str) -> Result<bool, AdapterError> {
    let document = Html::parse_document(html);
    let login = selector("form#login, input[type=password]")?;
    let found = document.select(&login).next().is_some();
    Ok(found)
}

/// Parses an amount cell such as `1,234.56`, `$ 12.00` or an empty cell.
pub fn parse_amount(text: &str) -> Result<Option<Decimal>, AdapterError> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return Ok(None);
    }
    Decimal::from_str(&cleaned)
        .map(Some)
        .map_err(|e| AdapterError::Parse(format!("bad amount `{text}`: {e}")))
}

pub fn parse_row_date(text: &str) -> Result<NaiveDate, AdapterError> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(text, "%d/%m/%Y"))
        .map_err(|_| AdapterError::Parse(format!("bad date `{text}`")))
}

/// Rows of `table#transactions` plus each row's detail link, if any.
pub fn parse_statement_page(html: &str) -> Result<Vec<(RawTransactionRow, Option<String>)>, AdapterError> {
    let document = Html::parse_document(html);
    let table = selector("table#transactions")?;
    if document.select(&table).next().is_none() {
        return Err(AdapterError::Navigation("statement table not found".into()));
    }
    let tr = selector("table#transactions tbody tr")?;
    let td = selector("td")?;

    let mut rows = Vec::new();
    for element in document.select(&tr) {
        let cells = cell_texts(element, &td);
        if cells.len() < 6 {
            return Err(AdapterError::Parse(format!(
                "statement row has {} cells, expected 6",
                cells.len()
            )));
        }
        let row = RawTransactionRow {
            date: parse_row_date(&cells[0])?,
            reference_id: cells[1].clone(),
            description: cells[2].clone(),
            debit: parse_amount(&cells[3])?,
            credit: parse_amount(&cells[4])?,
            balance_after: parse_amount(&cells[5])?,
            compound: false,
        };
        let detail = element.value().attr("data-detail-url").map(ToString::to_string);
        rows.push((row, detail));
    }
    Ok(rows)
}

pub fn parse_detail_page(html: &str) -> Result<Vec<RawTransactionRow>, AdapterError> {
    let document = Html::parse_document(html);
    let tr = selector("table#details tbody tr")?;
    let td = selector("td")?;

    document
        .select(&tr)
        .map(|element| {
            let cells = cell_texts(element, &td);
            if cells.len() < 4 {
                return Err(AdapterError::Parse(format!(
                    "detail row has {} cells, expected 4",
                    cells.len()
                )));
            }
            Ok(RawTransactionRow {
                date: parse_row_date(&cells[0])?,
                reference_id: String::new(),
                description: cells[1].clone(),
                debit: parse_amount(&cells[2])?,
                credit: parse_amount(&cells[3])?,
                balance_after: None,
                compound: false,
            })
        })
        .collect()
}

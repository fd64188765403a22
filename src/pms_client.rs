// src/pms_client.rs
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::COOKIE;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::store::WorkConfig;

// Portal endpoints. The submission field names (`new_project-3` and
// friends) are the portal's own form keys and are not negotiable.
pub const DEFAULT_PORTAL_BASE_URL: &str = "http://pd-reverse.api.senruisoft.com/";
const LOGIN_PATH: &str = "NoAuth/Login";
const TS_DATA_PATH: &str = "Helpers/pms/ts_data";
const SAVE_TS_PATH: &str = "Helpers/pms/SaveTs";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum PmsError {
    #[error("HTTP request failed")]
    Request(#[from] reqwest::Error),

    #[error("URL parsing error")]
    UrlParse(#[from] url::ParseError),

    #[error("login rejected by portal: {message}")]
    LoginRejected { message: String },

    #[error("portal API error: {message}")]
    Api { message: String },
}

/// Opaque credential returned by the portal login endpoint. Threaded
/// explicitly through every remote call and re-derived each run; never
/// persisted.
#[derive(Debug, Clone)]
pub struct PortalSession {
    token: String,
}

impl PortalSession {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

// Generic reply envelope; the portal is inconsistent about which of `code`
// and `msg` signals success, so both are kept.
#[derive(Debug, Deserialize)]
struct PortalReply {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// The portal surface the pipeline consumes. A trait seam so tests can
/// script replies without a network.
#[async_trait]
pub trait PortalApi: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<PortalSession, PmsError>;

    /// One read of the authenticated user's timesheet collection; the raw
    /// payload also carries the project/task listing the UI consumes.
    async fn fetch_ts_data(&self, session: &PortalSession) -> Result<Value, PmsError>;

    async fn save_timesheet(
        &self,
        session: &PortalSession,
        date: NaiveDate,
        work: &WorkConfig,
        description: &str,
    ) -> Result<(), PmsError>;
}

// --- HTTP client ---

pub struct PmsClient {
    http: Client,
    base_url: Url,
}

impl PmsClient {
    pub fn new(base_url: &str) -> Result<Self, PmsError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, PmsError> {
        Ok(self.base_url.join(path)?)
    }
}

#[async_trait]
impl PortalApi for PmsClient {
    async fn login(&self, username: &str, password: &str) -> Result<PortalSession, PmsError> {
        let url = self.endpoint(LOGIN_PATH)?;
        let reply: PortalReply = self
            .http
            .get(url)
            .query(&[("username", username), ("password", password)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if reply.code == Some(0) {
            if let Some(cookie) = reply
                .data
                .as_ref()
                .and_then(|data| data.get("cookie"))
                .and_then(Value::as_str)
            {
                debug!("portal login succeeded");
                return Ok(PortalSession::new(cookie));
            }
        }
        Err(PmsError::LoginRejected {
            message: reply
                .msg
                .unwrap_or_else(|| "no session token in reply".to_string()),
        })
    }

    async fn fetch_ts_data(&self, session: &PortalSession) -> Result<Value, PmsError> {
        let url = self.endpoint(TS_DATA_PATH)?;
        let reply: PortalReply = self
            .http
            .get(url)
            .query(&[("access_token", session.token())])
            .header(COOKIE, session.token())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let ok = reply.code == Some(0) || reply.msg.as_deref() == Some("success");
        match reply.data {
            Some(data) if ok => Ok(data),
            _ => Err(PmsError::Api {
                message: reply
                    .msg
                    .unwrap_or_else(|| "timesheet read failed".to_string()),
            }),
        }
    }

    async fn save_timesheet(
        &self,
        session: &PortalSession,
        date: NaiveDate,
        work: &WorkConfig,
        description: &str,
    ) -> Result<(), PmsError> {
        let url = self.endpoint(SAVE_TS_PATH)?;
        let ts_date = date.format("%Y-%m-%d").to_string();
        let project_id = work.project_id.to_string();
        let task_id = work.task_id.to_string();
        let hours = work.hours.to_string();

        let reply: PortalReply = self
            .http
            .get(url)
            .query(&[
                ("access_token", session.token()),
                ("ts_date", ts_date.as_str()),
                ("new_project-3", project_id.as_str()),
                ("new_task-3", task_id.as_str()),
                ("new_ts_hour-3", hours.as_str()),
                ("new_notes-3", description),
            ])
            .header(COOKIE, session.token())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if reply.msg.as_deref() == Some("success") {
            Ok(())
        } else {
            Err(PmsError::Api {
                message: reply
                    .msg
                    .unwrap_or_else(|| "submission rejected".to_string()),
            })
        }
    }
}

// --- Record adapter ---

/// One parsed row of the portal's per-date timesheet collection.
#[derive(Debug, Clone, PartialEq)]
pub struct TimesheetRecord {
    pub date: NaiveDate,
    pub project_id: Option<i64>,
    pub task_id: Option<i64>,
    pub hours: Decimal,
}

// Field-name priority per value. Portal versions disagree on naming, and
// this adapter is the only place allowed to know that.
const PROJECT_ID_FIELDS: &[&str] = &["project_id", "projectId"];
const TASK_ID_FIELDS: &[&str] = &["task_id", "taskId"];
const HOURS_FIELDS: &[&str] = &["hours", "ts_hour"];

fn field_as_i64(record: &Value, names: &[&str]) -> Option<i64> {
    for &name in names {
        match record.get(name) {
            Some(Value::Number(n)) => return n.as_i64(),
            Some(Value::String(s)) => {
                if let Ok(parsed) = s.trim().parse() {
                    return Some(parsed);
                }
            }
            _ => {}
        }
    }
    None
}

fn field_as_decimal(record: &Value, names: &[&str]) -> Option<Decimal> {
    for &name in names {
        match record.get(name) {
            Some(Value::Number(n)) => return n.to_string().parse().ok(),
            Some(Value::String(s)) => {
                if let Ok(parsed) = s.trim().parse() {
                    return Some(parsed);
                }
            }
            _ => {}
        }
    }
    None
}

/// Flattens the `tss` map (date string -> record array) into parsed
/// records. Rows that fail to parse are skipped with a warning rather than
/// failing the read: a partial fill-state still beats none.
pub fn extract_records(data: &Value) -> Vec<TimesheetRecord> {
    let mut records = Vec::new();
    let Some(tss) = data.get("tss").and_then(Value::as_object) else {
        warn!("portal reply carries no tss collection");
        return records;
    };

    for (date_str, rows) in tss {
        let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            warn!("skipping unparseable timesheet date '{}'", date_str);
            continue;
        };
        let Some(rows) = rows.as_array() else {
            continue;
        };
        for row in rows {
            records.push(TimesheetRecord {
                date,
                project_id: field_as_i64(row, PROJECT_ID_FIELDS),
                task_id: field_as_i64(row, TASK_ID_FIELDS),
                hours: field_as_decimal(row, HOURS_FIELDS).unwrap_or_default(),
            });
        }
    }
    records
}

use std::{collections::HashMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    config::Config,
    errors::ShiftError,
    report::{ReportPayload, fmt_date, fmt_time},
    session::{Identity, UserType},
};

/// Device position attached to task and event logs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

/// One row of the task adjustment log sheet.
#[derive(Debug, Clone, Serialize)]
pub struct TaskLogEntry {
    #[serde(rename = "Utilizador")]
    pub user: String,
    #[serde(rename = "Data")]
    pub date: String,
    #[serde(rename = "Hora")]
    pub time: String,
    #[serde(rename = "Cidade")]
    pub city: String,
    #[serde(rename = "Operador")]
    pub operator: String,
    #[serde(rename = "Tarefa")]
    pub task: String,
    #[serde(rename = "Quantidade")]
    pub quantity: i64,
    #[serde(rename = "Latitude")]
    pub latitude: f64,
    #[serde(rename = "Longitude")]
    pub longitude: f64,
}

impl TaskLogEntry {
    pub fn new(
        identity: &Identity,
        operator: &str,
        task: &str,
        quantity: i64,
        position: Position,
        now_ms: i64,
    ) -> Self {
        Self {
            user: identity.username.clone(),
            date: fmt_date(now_ms),
            time: fmt_time(now_ms),
            city: identity.city.clone(),
            operator: operator.to_string(),
            task: task.to_string(),
            quantity,
            latitude: position.latitude,
            longitude: position.longitude,
        }
    }
}

/// Shift and warehouse audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ShiftStart,
    ShiftEnd,
    WarehouseExit,
    WarehouseEntry,
}

impl EventKind {
    /// Row label in the event log sheet.
    pub fn label(self) -> &'static str {
        match self {
            Self::ShiftStart => "Início Turno",
            Self::ShiftEnd => "Fim Turno",
            Self::WarehouseExit => "Saída",
            Self::WarehouseEntry => "Chegada",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventLogEntry {
    #[serde(rename = "Utilizador")]
    pub user: String,
    #[serde(rename = "Data")]
    pub date: String,
    #[serde(rename = "Hora")]
    pub time: String,
    #[serde(rename = "Tipo de Registo")]
    pub kind: &'static str,
    #[serde(rename = "Latitude")]
    pub latitude: String,
    #[serde(rename = "Longitude")]
    pub longitude: String,
}

impl EventLogEntry {
    pub fn new(identity: &Identity, kind: EventKind, position: Position, now_ms: i64) -> Self {
        Self {
            user: identity.username.clone(),
            date: fmt_date(now_ms),
            time: fmt_time(now_ms),
            kind: kind.label(),
            latitude: format!("{:.6}", position.latitude),
            longitude: format!("{:.6}", position.longitude),
        }
    }
}

#[derive(Serialize)]
struct LogBatch<'a, T: Serialize> {
    logs: &'a [T],
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    success: bool,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VehiclesResponse {
    vehicles: Vec<String>,
}

/// Directory row for one worker, keyed by lowercased username.
#[derive(Debug, Clone, Deserialize)]
pub struct UserRecord {
    pub password: String,
    pub city: String,
    #[serde(rename = "type")]
    pub user_type: UserType,
}

/// Boundary to the spreadsheet-backed endpoints and the photo blob store.
///
/// At-least-once and non-transactional: nothing here deduplicates a
/// resubmission, so callers must not clear local state until a call has
/// confirmed success.
#[allow(async_fn_in_trait)]
pub trait Gateway {
    async fn fetch_users(&self) -> Result<HashMap<String, UserRecord>, ShiftError>;
    async fn fetch_vehicles(&self) -> Result<Vec<String>, ShiftError>;
    async fn submit_task_logs(&self, entries: &[TaskLogEntry]) -> Result<(), ShiftError>;
    async fn submit_event(&self, entry: &EventLogEntry) -> Result<(), ShiftError>;
    async fn submit_report(&self, payload: &ReportPayload) -> Result<(), ShiftError>;
    /// Uploads one photo and returns its public URL.
    async fn upload_photo(&self, path: &Path) -> Result<String, ShiftError>;
}

/// Production gateway speaking JSON over HTTP.
pub struct SheetsGateway {
    client: reqwest::Client,
    config: &'static Config,
}

impl SheetsGateway {
    pub fn new(config: &'static Config) -> Result<Self, ShiftError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.network.timeout_secs))
            .build()
            .map_err(|e| ShiftError::RemoteSync(format!("building http client: {e}")))?;
        Ok(Self { client, config })
    }

    /// POSTs a JSON body, retrying transport-level failures with linear
    /// backoff. An explicit rejection from the endpoint is not retried;
    /// resubmitting rejected data cannot make it acceptable.
    async fn post_json<B: Serialize>(&self, url: &str, body: &B) -> Result<(), ShiftError> {
        let mut last_err = None;
        for attempt in 0..=self.config.network.retries {
            if attempt > 0 {
                let backoff = self.config.network.backoff_ms * u64::from(attempt);
                debug!("Retrying POST to {url} after {backoff}ms (attempt {attempt})");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            match self.try_post(url, body).await {
                Ok(()) => return Ok(()),
                Err(Retry::Fatal(err)) => return Err(err),
                Err(Retry::Transient(err)) => {
                    warn!("POST to {url} failed: {err}");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ShiftError::RemoteSync("no attempts made".into())))
    }

    async fn try_post<B: Serialize>(&self, url: &str, body: &B) -> Result<(), Retry> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| Retry::Transient(ShiftError::RemoteSync(format!("POST {url}: {e}"))))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Retry::Transient(ShiftError::RemoteSync(format!(
                "POST {url}: HTTP {status}"
            ))));
        }
        let parsed: ApiResponse = response.json().await.map_err(|e| {
            Retry::Transient(ShiftError::RemoteSync(format!("decoding reply from {url}: {e}")))
        })?;
        if parsed.success {
            Ok(())
        } else {
            let reason = parsed.error.unwrap_or_else(|| "endpoint rejected the data".into());
            Err(Retry::Fatal(ShiftError::RemoteSync(reason)))
        }
    }
}

enum Retry {
    Transient(ShiftError),
    Fatal(ShiftError),
}

impl Gateway for SheetsGateway {
    async fn fetch_users(&self) -> Result<HashMap<String, UserRecord>, ShiftError> {
        let url = &self.config.endpoints.user_directory;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ShiftError::RemoteSync(format!("GET {url}: {e}")))?;
        response
            .json()
            .await
            .map_err(|e| ShiftError::RemoteSync(format!("decoding user directory: {e}")))
    }

    async fn fetch_vehicles(&self) -> Result<Vec<String>, ShiftError> {
        let url = &self.config.endpoints.vehicle_directory;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ShiftError::RemoteSync(format!("GET {url}: {e}")))?;
        let parsed: VehiclesResponse = response
            .json()
            .await
            .map_err(|e| ShiftError::RemoteSync(format!("decoding vehicle list: {e}")))?;
        Ok(parsed.vehicles)
    }

    async fn submit_task_logs(&self, entries: &[TaskLogEntry]) -> Result<(), ShiftError> {
        self.post_json(&self.config.endpoints.task_log, &LogBatch { logs: entries })
            .await
    }

    async fn submit_event(&self, entry: &EventLogEntry) -> Result<(), ShiftError> {
        let batch = LogBatch {
            logs: std::slice::from_ref(entry),
        };
        self.post_json(&self.config.endpoints.event_log, &batch).await
    }

    async fn submit_report(&self, payload: &ReportPayload) -> Result<(), ShiftError> {
        let url = match payload {
            ReportPayload::Fleet(_) => &self.config.endpoints.shift_report,
            ReportPayload::Delivery(_) => &self.config.endpoints.delivery_report,
            ReportPayload::Mechanic(_) => &self.config.endpoints.mechanic_report,
        };
        self.post_json(url, payload).await
    }

    async fn upload_photo(&self, path: &Path) -> Result<String, ShiftError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ShiftError::storage(format!("reading photo {}: {e}", path.display())))?;
        let file_name = format!("imagem_{}.jpg", chrono::Utc::now().timestamp_millis());
        let url = &self.config.endpoints.photo_upload;
        let response = self
            .client
            .post(url)
            .query(&[("name", file_name.as_str())])
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(bytes)
            .send()
            .await
            .map_err(|e| ShiftError::RemoteSync(format!("uploading {file_name}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ShiftError::RemoteSync(format!(
                "uploading {file_name}: HTTP {status}"
            )));
        }
        let parsed: UploadResponse = response
            .json()
            .await
            .map_err(|e| ShiftError::RemoteSync(format!("decoding upload reply: {e}")))?;
        match (parsed.success, parsed.url) {
            (true, Some(url)) => Ok(url),
            _ => Err(ShiftError::RemoteSync(
                parsed.error.unwrap_or_else(|| "photo upload rejected".into()),
            )),
        }
    }
}

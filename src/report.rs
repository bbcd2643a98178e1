use std::collections::BTreeMap;

use chrono::{Local, TimeZone};
use serde::Serialize;

use crate::{
    close::CloseForm,
    ledger::{Ledger, catalog},
    session::{Identity, ShiftSession, UserType},
};

/// Formats epoch milliseconds as the sheet's date column, `dd/mm/yyyy`.
pub fn fmt_date(ms: i64) -> String {
    match Local.timestamp_millis_opt(ms).single() {
        Some(dt) if ms > 0 => dt.format("%d/%m/%Y").to_string(),
        _ => "N/A".to_string(),
    }
}

/// Formats epoch milliseconds as the sheet's time column, `HH:MM:SS`.
pub fn fmt_time(ms: i64) -> String {
    match Local.timestamp_millis_opt(ms).single() {
        Some(dt) if ms > 0 => dt.format("%H:%M:%S").to_string(),
        _ => "N/A".to_string(),
    }
}

/// Formats a millisecond span as `HH:MM:SS`. Hours do not wrap at 24 and
/// negative spans clamp to zero, so a recomputed display never runs
/// backwards after a clock hiccup.
pub fn fmt_duration(ms: i64) -> String {
    let ms = ms.max(0);
    let hours = ms / 3_600_000;
    let minutes = (ms / 60_000) % 60;
    let seconds = (ms / 1000) % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Close payload, one variant per report sheet.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ReportPayload {
    Fleet(ShiftReport),
    Delivery(DeliveryReport),
    Mechanic(MechanicReport),
}

#[derive(Debug, Clone, Serialize)]
pub struct ShiftReport {
    pub username: String,
    pub city: String,
    #[serde(rename = "dataInicio")]
    pub data_inicio: String,
    #[serde(rename = "horaInicio")]
    pub hora_inicio: String,
    #[serde(rename = "horaFim")]
    pub hora_fim: String,
    #[serde(rename = "dataFim")]
    pub data_fim: String,
    pub duration: String,
    pub carrinha: String,
    #[serde(rename = "kmInicial")]
    pub km_inicial: String,
    #[serde(rename = "kmFinal")]
    pub km_final: String,
    pub notes: String,
    #[serde(rename = "warehouseStart")]
    pub warehouse_start: String,
    #[serde(rename = "warehouseEnd")]
    pub warehouse_end: String,
    #[serde(rename = "warehouseElapsedTime")]
    pub warehouse_elapsed_time: String,
    #[serde(rename = "imageDriveLinks")]
    pub image_drive_links: String,
    /// One column per catalog task label, zero-filled.
    #[serde(flatten)]
    pub tasks: BTreeMap<&'static str, i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    pub username: String,
    pub city: String,
    #[serde(rename = "dataInicio")]
    pub data_inicio: String,
    #[serde(rename = "horaInicio")]
    pub hora_inicio: String,
    #[serde(rename = "horaFim")]
    pub hora_fim: String,
    #[serde(rename = "dataFim")]
    pub data_fim: String,
    pub duration: String,
    pub carrinha: String,
    #[serde(rename = "kmInicial")]
    pub km_inicial: String,
    #[serde(rename = "kmFinal")]
    pub km_final: String,
    pub notes: String,
    #[serde(rename = "warehouseStart")]
    pub warehouse_start: String,
    #[serde(rename = "warehouseEnd")]
    pub warehouse_end: String,
    #[serde(rename = "warehouseElapsedTime")]
    pub warehouse_elapsed_time: String,
    #[serde(rename = "imageDriveLinks")]
    pub image_drive_links: String,
    #[serde(rename = "totalEntregas")]
    pub total_entregas: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MechanicReport {
    pub username: String,
    pub city: String,
    #[serde(rename = "horaInicio")]
    pub hora_inicio: String,
    #[serde(rename = "horaFim")]
    pub hora_fim: String,
    pub duration: String,
    pub notes: String,
    #[serde(rename = "trotineteReparadas")]
    pub trotinete_reparadas: i64,
    #[serde(rename = "bicicletasReparadas")]
    pub bicicletas_reparadas: i64,
}

pub struct ReportContext<'a> {
    pub identity: &'a Identity,
    pub session: &'a ShiftSession,
    pub form: &'a CloseForm,
    pub image_urls: &'a [String],
    pub ledger: &'a Ledger,
    pub end_time_ms: i64,
}

pub fn build(ctx: &ReportContext) -> ReportPayload {
    match ctx.identity.user_type {
        UserType::Driver => ReportPayload::Fleet(build_fleet(ctx)),
        UserType::Delivery => ReportPayload::Delivery(build_delivery(ctx)),
        UserType::Mechanic => ReportPayload::Mechanic(build_mechanic(ctx)),
    }
}

fn build_fleet(ctx: &ReportContext) -> ShiftReport {
    let mut tasks = BTreeMap::new();
    for operator_id in ctx.identity.user_type.operators() {
        let operator = catalog::find_operator(operator_id).expect("operator ids come from the table");
        for task in operator.tasks {
            let storage_key = format!("{}_{}", operator.id, task.id);
            tasks.insert(task.label, ctx.ledger.get(&storage_key).copied().unwrap_or(0));
        }
    }

    ShiftReport {
        username: ctx.identity.username.clone(),
        city: ctx.identity.city.clone(),
        data_inicio: fmt_date(ctx.session.start_time_ms),
        hora_inicio: fmt_time(ctx.session.start_time_ms),
        hora_fim: fmt_time(ctx.end_time_ms),
        data_fim: fmt_date(ctx.end_time_ms),
        duration: fmt_duration(ctx.end_time_ms - ctx.session.start_time_ms),
        carrinha: ctx.session.vehicle_id.clone().unwrap_or_else(|| "N/A".to_string()),
        km_inicial: odometer_string(ctx.session.initial_odometer),
        km_final: ctx.form.final_odometer.trim().to_string(),
        notes: notes_or_default(&ctx.form.notes),
        warehouse_start: warehouse_stamp(ctx.session.warehouse_exit_ms),
        warehouse_end: warehouse_stamp(ctx.session.warehouse_entry_ms),
        warehouse_elapsed_time: warehouse_elapsed(ctx.session),
        image_drive_links: hyperlink_cells(ctx.image_urls),
        tasks,
    }
}

fn build_delivery(ctx: &ReportContext) -> DeliveryReport {
    DeliveryReport {
        username: ctx.identity.username.clone(),
        city: ctx.identity.city.clone(),
        data_inicio: fmt_date(ctx.session.start_time_ms),
        hora_inicio: fmt_time(ctx.session.start_time_ms),
        hora_fim: fmt_time(ctx.end_time_ms),
        data_fim: fmt_date(ctx.end_time_ms),
        duration: fmt_duration(ctx.end_time_ms - ctx.session.start_time_ms),
        carrinha: ctx.session.vehicle_id.clone().unwrap_or_else(|| "N/A".to_string()),
        km_inicial: odometer_string(ctx.session.initial_odometer),
        km_final: ctx.form.final_odometer.trim().to_string(),
        notes: notes_or_default(&ctx.form.notes),
        warehouse_start: warehouse_stamp(ctx.session.warehouse_exit_ms),
        warehouse_end: warehouse_stamp(ctx.session.warehouse_entry_ms),
        warehouse_elapsed_time: warehouse_elapsed(ctx.session),
        image_drive_links: plain_links(ctx.image_urls),
        total_entregas: ctx.ledger.get("delivery_entregas").copied().unwrap_or(0),
    }
}

fn build_mechanic(ctx: &ReportContext) -> MechanicReport {
    MechanicReport {
        username: ctx.identity.username.clone(),
        city: ctx.identity.city.clone(),
        hora_inicio: fmt_time(ctx.session.start_time_ms),
        hora_fim: fmt_time(ctx.end_time_ms),
        duration: fmt_duration(ctx.end_time_ms - ctx.session.start_time_ms),
        notes: notes_or_default(&ctx.form.notes),
        trotinete_reparadas: ctx
            .ledger
            .get("mechanic_trotinetesReparadas")
            .copied()
            .unwrap_or(0),
        bicicletas_reparadas: ctx
            .ledger
            .get("mechanic_bicicletasReparadas")
            .copied()
            .unwrap_or(0),
    }
}

fn odometer_string(value: Option<i64>) -> String {
    value.map_or_else(|| "0".to_string(), |v| v.to_string())
}

fn notes_or_default(notes: &str) -> String {
    let trimmed = notes.trim();
    if trimmed.is_empty() {
        "Sem notas".to_string()
    } else {
        trimmed.to_string()
    }
}

fn warehouse_stamp(ms: Option<i64>) -> String {
    ms.map_or_else(|| "N/A".to_string(), fmt_time)
}

fn warehouse_elapsed(session: &ShiftSession) -> String {
    match (session.warehouse_exit_ms, session.warehouse_entry_ms) {
        (Some(exit), Some(entry)) if exit > 0 && entry > exit => fmt_duration(entry - exit),
        _ => "N/A".to_string(),
    }
}

/// The report sheet renders each link as a clickable cell.
fn hyperlink_cells(urls: &[String]) -> String {
    if urls.is_empty() {
        return "Sem imagens".to_string();
    }
    urls.iter()
        .map(|link| format!("=HYPERLINK(\"{link}\", \"Ver Foto\")"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn plain_links(urls: &[String]) -> String {
    if urls.is_empty() {
        return "Sem imagens".to_string();
    }
    urls.join("\n")
}

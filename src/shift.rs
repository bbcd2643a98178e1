use chrono::Utc;
use tracing::{info, warn};

use crate::{
    close::{self, CloseForm},
    config::Config,
    errors::ShiftError,
    ledger::{TaskKey, catalog},
    report::{self, ReportContext, fmt_duration},
    session::{Identity, ShiftSession, keys},
    store::SessionStore,
    sync::{EventKind, EventLogEntry, Gateway, Position, TaskLogEntry},
};

/// Shift lifecycle. `Closing` is transient and in-memory only: a failed
/// finalize lands back here so the worker can retry without re-entering
/// anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftState {
    NotStarted,
    Active { warehouse_out: bool },
    Closing,
    Closed,
}

/// Result of a locally-committed transition whose audit log call may still
/// have failed. The transition itself never rolls back on audit failure;
/// the error is carried out so the user hears about it.
#[derive(Debug)]
pub struct Audited<T> {
    pub value: T,
    pub audit_error: Option<ShiftError>,
}

/// Coordinates one worker's shift: state transitions, ledger entry, close.
///
/// Owns nothing ambient; store and gateway are injected once and the
/// manager lives for the duration of the login session.
pub struct ShiftManager<G> {
    store: SessionStore,
    gateway: G,
    identity: Identity,
    state: ShiftState,
    session: Option<ShiftSession>,
}

impl<G: Gateway> ShiftManager<G> {
    /// Rehydrates manager state from the store, resuming an interrupted
    /// shift if one is active.
    pub async fn resume(
        store: SessionStore,
        gateway: G,
        identity: Identity,
    ) -> Result<Self, ShiftError> {
        let session = ShiftSession::load(&store, identity.user_type).await?;
        let state = match &session {
            Some(session) => ShiftState::Active {
                warehouse_out: session.warehouse_out,
            },
            None => ShiftState::NotStarted,
        };
        Ok(Self {
            store,
            gateway,
            identity,
            state,
            session,
        })
    }

    pub fn state(&self) -> ShiftState {
        self.state
    }

    pub fn session(&self) -> Option<&ShiftSession> {
        self.session.as_ref()
    }

    /// Current ledger snapshot, read through the store queue.
    pub async fn ledger(&self) -> Result<crate::ledger::Ledger, ShiftError> {
        self.store.load_ledger().await
    }

    /// Elapsed shift time derived from the persisted absolute start; safe
    /// across process restarts and suspends.
    pub fn elapsed(&self, now_ms: i64) -> Option<String> {
        self.session
            .as_ref()
            .map(|s| fmt_duration(now_ms - s.start_time_ms))
    }

    /// Starts a shift. Non-mechanics must supply an odometer reading; the
    /// ledger starts empty; the start event is audited after the local
    /// state is committed.
    pub async fn start_shift(
        &mut self,
        initial_odometer: Option<i64>,
        vehicle_id: Option<String>,
        position: Option<Position>,
        now_ms: i64,
    ) -> Result<Audited<()>, ShiftError> {
        if self.state != ShiftState::NotStarted {
            return Err(ShiftError::validation("shift already active"));
        }
        let user_type = self.identity.user_type;
        if user_type.requires_odometer() && initial_odometer.is_none() {
            return Err(ShiftError::validation("initial odometer required"));
        }

        let mut pairs = vec![
            (keys::IS_TURN_ACTIVE.to_string(), "true".to_string()),
            (keys::START_TIME.to_string(), now_ms.to_string()),
            (keys::IS_WAREHOUSE_ACTIVE.to_string(), "false".to_string()),
        ];
        if let Some(km) = initial_odometer {
            pairs.push((keys::KM_INICIAL.to_string(), km.to_string()));
        }
        if let Some(vehicle) = &vehicle_id {
            pairs.push((keys::CARRINHA.to_string(), vehicle.clone()));
        }
        self.store.clear_ledger().await?;
        self.store.set_many(pairs).await?;

        self.session = Some(ShiftSession {
            start_time_ms: now_ms,
            user_type,
            initial_odometer,
            vehicle_id,
            warehouse_out: false,
            warehouse_exit_ms: None,
            warehouse_entry_ms: None,
        });
        self.state = ShiftState::Active {
            warehouse_out: false,
        };
        info!("Shift started for {} at {now_ms}", self.identity.username);

        let audit_error = self.audit(EventKind::ShiftStart, position, now_ms).await;
        Ok(Audited {
            value: (),
            audit_error,
        })
    }

    /// Flips the warehouse status and stamps the corresponding timestamp.
    /// Local commit first; the audit event may fail without undoing it.
    pub async fn toggle_warehouse(
        &mut self,
        position: Option<Position>,
        now_ms: i64,
    ) -> Result<Audited<bool>, ShiftError> {
        if !self.identity.user_type.tracks_warehouse() {
            return Err(ShiftError::validation(
                "warehouse tracking does not apply to mechanics",
            ));
        }
        let ShiftState::Active { warehouse_out } = self.state else {
            return Err(ShiftError::validation("no active shift"));
        };
        let session = self.session.as_mut().expect("active state implies session");

        let kind = if warehouse_out {
            let exit_ms = session.warehouse_exit_ms.unwrap_or(0);
            self.store
                .set_many(vec![
                    (keys::WAREHOUSE_END_TIME.to_string(), now_ms.to_string()),
                    (
                        keys::WAREHOUSE_ELAPSED_TIME.to_string(),
                        (now_ms - exit_ms).max(0).to_string(),
                    ),
                    (keys::IS_WAREHOUSE_ACTIVE.to_string(), "false".to_string()),
                ])
                .await?;
            session.warehouse_entry_ms = Some(now_ms);
            session.warehouse_out = false;
            EventKind::WarehouseEntry
        } else {
            self.store
                .set_many(vec![
                    (keys::WAREHOUSE_START_TIME.to_string(), now_ms.to_string()),
                    (keys::IS_WAREHOUSE_ACTIVE.to_string(), "true".to_string()),
                ])
                .await?;
            session.warehouse_exit_ms = Some(now_ms);
            session.warehouse_out = true;
            EventKind::WarehouseExit
        };
        let now_out = !warehouse_out;
        self.state = ShiftState::Active {
            warehouse_out: now_out,
        };
        info!("Warehouse toggled: {}", kind.label());

        let audit_error = self.audit(kind, position, now_ms).await;
        Ok(Audited {
            value: now_out,
            audit_error,
        })
    }

    /// Applies task deltas through the store's serialized queue, then
    /// submits the adjustment rows. Counts are committed even when the
    /// submission fails; the error rides along for the user.
    pub async fn record_tasks(
        &mut self,
        deltas: Vec<(TaskKey, i64)>,
        position: Option<Position>,
        now_ms: i64,
    ) -> Result<Audited<Vec<i64>>, ShiftError> {
        if !matches!(self.state, ShiftState::Active { .. }) {
            return Err(ShiftError::validation("no active shift"));
        }
        let mut rows = Vec::new();
        for (key, delta) in &deltas {
            let (operator, task) = catalog::resolve(key)
                .ok_or_else(|| ShiftError::validation(format!("unknown task: {key}")))?;
            if *delta != 0 {
                rows.push((operator.name, task.label, *delta));
            }
        }

        let counts = self.store.apply_deltas(deltas).await?;

        let audit_error = if rows.is_empty() {
            None
        } else if let Some(position) = position {
            let entries: Vec<TaskLogEntry> = rows
                .iter()
                .map(|(operator, task, quantity)| {
                    TaskLogEntry::new(&self.identity, operator, task, *quantity, position, now_ms)
                })
                .collect();
            self.gateway.submit_task_logs(&entries).await.err()
        } else {
            Some(ShiftError::Permission("location unavailable".into()))
        };
        if let Some(err) = &audit_error {
            warn!("Task counts stored but log submission failed: {err}");
        }
        Ok(Audited {
            value: counts,
            audit_error,
        })
    }

    /// Gate into the close flow: non-mechanics must be back at the
    /// warehouse first.
    pub fn request_close(&mut self) -> Result<(), ShiftError> {
        match self.state {
            ShiftState::Closing => Ok(()),
            ShiftState::Active { warehouse_out } => {
                if warehouse_out && self.identity.user_type.tracks_warehouse() {
                    return Err(ShiftError::validation("must return to warehouse first"));
                }
                self.state = ShiftState::Closing;
                Ok(())
            }
            _ => Err(ShiftError::validation("no active shift")),
        }
    }

    /// Abandons the close dialog. Only valid before `finalize_close` is
    /// invoked; once finalizing, the operation runs to completion or
    /// failure.
    pub fn cancel_close(&mut self) -> Result<(), ShiftError> {
        if self.state != ShiftState::Closing {
            return Err(ShiftError::validation("no close in progress"));
        }
        let session = self.session.as_ref().expect("closing state implies session");
        self.state = ShiftState::Active {
            warehouse_out: session.warehouse_out,
        };
        Ok(())
    }

    /// The close pipeline: validate, upload photos, persist the form,
    /// submit the report, then — only after the remote confirmed success —
    /// clear every session key.
    ///
    /// Strictly sequential: the payload embeds the uploaded photo URLs and
    /// local state survives until the report lands. Any failure leaves the
    /// state at `Closing` with the form (including already-uploaded
    /// photos) intact, so retrying is cheap and does not duplicate
    /// uploads.
    pub async fn finalize_close(
        &mut self,
        form: &mut CloseForm,
        position: Option<Position>,
        now_ms: i64,
    ) -> Result<Audited<()>, ShiftError> {
        if self.state != ShiftState::Closing {
            return Err(ShiftError::validation("close not requested"));
        }
        let session = self.session.as_ref().expect("closing state implies session");
        close::validate(form, session, Config::get().max_shift_distance_km)?;

        // Abort on any upload failure; a report must never reference a
        // photo that is not actually retrievable.
        for (angle, path) in form.photos.pending_uploads() {
            let url = self.gateway.upload_photo(&path).await?;
            form.photos.set_uploaded(angle, url);
        }
        let image_urls = if session.user_type.required_photos() > 0 {
            form.photos
                .remote_urls()
                .ok_or_else(|| ShiftError::RemoteSync("photo upload incomplete".into()))?
        } else {
            Vec::new()
        };

        self.store
            .set_many(vec![
                (keys::KM_FINAL.to_string(), form.final_odometer.trim().to_string()),
                (keys::NOTES.to_string(), form.notes.clone()),
                (
                    keys::IMAGE_DRIVE_LINKS.to_string(),
                    serde_json::to_string(&image_urls)
                        .map_err(|e| ShiftError::storage(format!("encode image links: {e}")))?,
                ),
            ])
            .await?;

        let ledger = self.store.load_ledger().await?;
        let payload = report::build(&ReportContext {
            identity: &self.identity,
            session,
            form,
            image_urls: &image_urls,
            ledger: &ledger,
            end_time_ms: now_ms,
        });
        self.gateway.submit_report(&payload).await?;

        // The report is in; the end-of-shift audit row is best effort.
        let audit_error = self.audit(EventKind::ShiftEnd, position, now_ms).await;

        self.store.clear_ledger().await?;
        self.store.remove(keys::SHIFT_KEYS).await?;
        self.session = None;
        self.state = ShiftState::Closed;
        info!("Shift closed for {}", self.identity.username);

        Ok(Audited {
            value: (),
            audit_error,
        })
    }

    async fn audit(
        &self,
        kind: EventKind,
        position: Option<Position>,
        now_ms: i64,
    ) -> Option<ShiftError> {
        let Some(position) = position else {
            warn!("No position for {} event, audit row skipped", kind.label());
            return Some(ShiftError::Permission("location unavailable".into()));
        };
        let entry = EventLogEntry::new(&self.identity, kind, position, now_ms);
        let result = self.gateway.submit_event(&entry).await;
        if let Err(err) = &result {
            warn!("Audit event {} failed: {err}", kind.label());
        }
        result.err()
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        path::Path,
        sync::{
            Mutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
    };

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        close::{PhotoAngle, PhotoSet},
        report::ReportPayload,
        session::UserType,
        sync::UserRecord,
    };

    #[derive(Default)]
    struct FakeGateway {
        events: Mutex<Vec<&'static str>>,
        task_logs: Mutex<Vec<(String, String, i64)>>,
        reports: Mutex<Vec<ReportPayload>>,
        uploads: AtomicUsize,
        fail_report: AtomicBool,
        fail_upload: AtomicBool,
    }

    impl Gateway for &FakeGateway {
        async fn fetch_users(&self) -> Result<HashMap<String, UserRecord>, ShiftError> {
            Ok(HashMap::new())
        }

        async fn fetch_vehicles(&self) -> Result<Vec<String>, ShiftError> {
            Ok(vec!["BA-69-PM".into()])
        }

        async fn submit_task_logs(&self, entries: &[TaskLogEntry]) -> Result<(), ShiftError> {
            let mut logs = self.task_logs.lock().unwrap();
            for entry in entries {
                logs.push((entry.operator.clone(), entry.task.clone(), entry.quantity));
            }
            Ok(())
        }

        async fn submit_event(&self, entry: &EventLogEntry) -> Result<(), ShiftError> {
            self.events.lock().unwrap().push(entry.kind);
            Ok(())
        }

        async fn submit_report(&self, payload: &ReportPayload) -> Result<(), ShiftError> {
            if self.fail_report.load(Ordering::SeqCst) {
                return Err(ShiftError::RemoteSync("sheet unavailable".into()));
            }
            self.reports.lock().unwrap().push(payload.clone());
            Ok(())
        }

        async fn upload_photo(&self, _path: &Path) -> Result<String, ShiftError> {
            if self.fail_upload.load(Ordering::SeqCst) {
                return Err(ShiftError::RemoteSync("blob store unavailable".into()));
            }
            let n = self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(format!("https://blob/{n}"))
        }
    }

    fn identity(user_type: UserType) -> Identity {
        Identity {
            username: "joao".into(),
            city: "Faro".into(),
            user_type,
        }
    }

    fn position() -> Option<Position> {
        Some(Position {
            latitude: 37.019356,
            longitude: -7.930440,
        })
    }

    fn four_photos() -> PhotoSet {
        let mut photos = PhotoSet::default();
        for (i, angle) in [
            PhotoAngle::Left,
            PhotoAngle::Front,
            PhotoAngle::Right,
            PhotoAngle::Rear,
        ]
        .into_iter()
        .enumerate()
        {
            photos.set_local(angle, format!("/tmp/photo-{i}.jpg").into());
        }
        photos
    }

    async fn manager<'a>(
        gateway: &'a FakeGateway,
        dir: &tempfile::TempDir,
        user_type: UserType,
    ) -> ShiftManager<&'a FakeGateway> {
        Config::set_for_tests(Config::default());
        let (store, _join) = SessionStore::launch(&dir.path().join("test.sqlite")).unwrap();
        ShiftManager::resume(store, gateway, identity(user_type))
            .await
            .unwrap()
    }

    const T0: i64 = 1_700_000_000_000;

    #[tokio::test]
    async fn start_requires_odometer_for_drivers() {
        let gateway = FakeGateway::default();
        let dir = tempdir().unwrap();
        let mut mgr = manager(&gateway, &dir, UserType::Driver).await;

        let err = mgr.start_shift(None, None, position(), T0).await.unwrap_err();
        assert_eq!(err, ShiftError::validation("initial odometer required"));
        assert_eq!(mgr.state(), ShiftState::NotStarted);

        mgr.start_shift(Some(1000), Some("BA-69-PM".into()), position(), T0)
            .await
            .unwrap();
        assert_eq!(
            mgr.state(),
            ShiftState::Active {
                warehouse_out: false
            }
        );
        assert_eq!(gateway.events.lock().unwrap().as_slice(), &["Início Turno"]);

        let err = mgr
            .start_shift(Some(1000), None, position(), T0)
            .await
            .unwrap_err();
        assert_eq!(err, ShiftError::validation("shift already active"));
    }

    #[tokio::test]
    async fn mechanics_start_without_odometer_and_never_toggle() {
        let gateway = FakeGateway::default();
        let dir = tempdir().unwrap();
        let mut mgr = manager(&gateway, &dir, UserType::Mechanic).await;

        mgr.start_shift(None, None, position(), T0).await.unwrap();
        assert!(mgr.toggle_warehouse(position(), T0).await.is_err());
        // Warehouse never blocks a mechanic's close.
        mgr.request_close().unwrap();
        assert_eq!(mgr.state(), ShiftState::Closing);
    }

    #[tokio::test]
    async fn close_is_gated_on_warehouse_return() {
        let gateway = FakeGateway::default();
        let dir = tempdir().unwrap();
        let mut mgr = manager(&gateway, &dir, UserType::Driver).await;
        mgr.start_shift(Some(1000), None, position(), T0).await.unwrap();

        let out = mgr.toggle_warehouse(position(), T0 + 1000).await.unwrap();
        assert!(out.value);
        let err = mgr.request_close().unwrap_err();
        assert_eq!(err, ShiftError::validation("must return to warehouse first"));

        let back = mgr.toggle_warehouse(position(), T0 + 3_601_000).await.unwrap();
        assert!(!back.value);
        mgr.request_close().unwrap();
        assert_eq!(mgr.state(), ShiftState::Closing);
        assert_eq!(
            gateway.events.lock().unwrap().as_slice(),
            &["Início Turno", "Saída", "Chegada"]
        );
    }

    #[tokio::test]
    async fn audit_failure_never_rolls_back_a_toggle() {
        let gateway = FakeGateway::default();
        let dir = tempdir().unwrap();
        let mut mgr = manager(&gateway, &dir, UserType::Driver).await;
        mgr.start_shift(Some(1000), None, position(), T0).await.unwrap();

        // No position available: locally committed, error surfaced.
        let toggled = mgr.toggle_warehouse(None, T0 + 1000).await.unwrap();
        assert!(toggled.value);
        assert_eq!(
            toggled.audit_error,
            Some(ShiftError::Permission("location unavailable".into()))
        );
        assert_eq!(
            mgr.state(),
            ShiftState::Active {
                warehouse_out: true
            }
        );
    }

    #[tokio::test]
    async fn elapsed_is_recomputed_from_the_absolute_start() {
        let gateway = FakeGateway::default();
        let dir = tempdir().unwrap();
        let mut mgr = manager(&gateway, &dir, UserType::Driver).await;
        assert_eq!(mgr.elapsed(T0), None);

        mgr.start_shift(Some(1000), None, position(), T0).await.unwrap();
        assert_eq!(mgr.elapsed(T0).as_deref(), Some("00:00:00"));
        assert_eq!(mgr.elapsed(T0 + 5_400_000).as_deref(), Some("01:30:00"));
    }

    #[tokio::test]
    async fn full_shift_scenario_clears_the_store_only_after_success() {
        let gateway = FakeGateway::default();
        let dir = tempdir().unwrap();
        let mut mgr = manager(&gateway, &dir, UserType::Driver).await;

        mgr.start_shift(Some(1000), Some("BA-69-PM".into()), position(), T0)
            .await
            .unwrap();
        mgr.toggle_warehouse(position(), T0 + 1000).await.unwrap();

        let key: TaskKey = "lime_collectTroti".parse().unwrap();
        let applied = mgr
            .record_tasks(vec![(key.clone(), 3)], position(), T0 + 2000)
            .await
            .unwrap();
        assert_eq!(applied.value, vec![3]);
        let applied = mgr
            .record_tasks(vec![(key, -1)], position(), T0 + 3000)
            .await
            .unwrap();
        assert_eq!(applied.value, vec![2]);

        mgr.toggle_warehouse(position(), T0 + 4000).await.unwrap();
        mgr.request_close().unwrap();

        let mut form = CloseForm {
            final_odometer: "1050".into(),
            notes: "ok".into(),
            photos: four_photos(),
        };

        // First attempt: report endpoint down. Everything local survives.
        gateway.fail_report.store(true, Ordering::SeqCst);
        let err = mgr
            .finalize_close(&mut form, position(), T0 + 5000)
            .await
            .unwrap_err();
        assert_eq!(err, ShiftError::RemoteSync("sheet unavailable".into()));
        assert_eq!(mgr.state(), ShiftState::Closing);

        // Retry succeeds without re-uploading the four photos.
        gateway.fail_report.store(false, Ordering::SeqCst);
        mgr.finalize_close(&mut form, position(), T0 + 6000)
            .await
            .unwrap();
        assert_eq!(mgr.state(), ShiftState::Closed);
        assert_eq!(gateway.uploads.load(Ordering::SeqCst), 4);

        let reports = gateway.reports.lock().unwrap();
        let ReportPayload::Fleet(report) = &reports[0] else {
            panic!("driver close submits the fleet report");
        };
        assert_eq!(report.tasks["Collect Lime"], 2);
        assert_eq!(report.km_inicial, "1000");
        assert_eq!(report.km_final, "1050");

        // Every session key is gone; a fresh manager sees no shift.
        drop(mgr);
        let (store, _join) = SessionStore::launch(&dir.path().join("test.sqlite")).unwrap();
        assert!(store.load_ledger().await.unwrap().is_empty());
        for key in keys::SHIFT_KEYS {
            assert_eq!(store.get(key).await.unwrap(), None, "{key} should be gone");
        }
        let session = ShiftSession::load(&store, UserType::Driver).await.unwrap();
        assert_eq!(session, None);
    }

    #[tokio::test]
    async fn photo_upload_failure_aborts_before_any_submission() {
        let gateway = FakeGateway::default();
        let dir = tempdir().unwrap();
        let mut mgr = manager(&gateway, &dir, UserType::Driver).await;
        mgr.start_shift(Some(1000), None, position(), T0).await.unwrap();
        mgr.request_close().unwrap();

        let mut form = CloseForm {
            final_odometer: "1010".into(),
            photos: four_photos(),
            ..Default::default()
        };
        gateway.fail_upload.store(true, Ordering::SeqCst);
        let err = mgr
            .finalize_close(&mut form, position(), T0 + 1000)
            .await
            .unwrap_err();
        assert_eq!(err, ShiftError::RemoteSync("blob store unavailable".into()));
        assert_eq!(mgr.state(), ShiftState::Closing);
        assert!(gateway.reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_close_returns_to_active() {
        let gateway = FakeGateway::default();
        let dir = tempdir().unwrap();
        let mut mgr = manager(&gateway, &dir, UserType::Driver).await;
        mgr.start_shift(Some(1000), None, position(), T0).await.unwrap();
        mgr.request_close().unwrap();
        mgr.cancel_close().unwrap();
        assert_eq!(
            mgr.state(),
            ShiftState::Active {
                warehouse_out: false
            }
        );
    }

    #[tokio::test]
    async fn interrupted_shift_resumes_from_the_store() {
        let gateway = FakeGateway::default();
        let dir = tempdir().unwrap();
        {
            let mut mgr = manager(&gateway, &dir, UserType::Driver).await;
            mgr.start_shift(Some(1000), None, position(), T0).await.unwrap();
            mgr.toggle_warehouse(position(), T0 + 1000).await.unwrap();
        }

        // Process restart: a fresh manager picks the shift back up.
        let mgr = manager(&gateway, &dir, UserType::Driver).await;
        assert_eq!(
            mgr.state(),
            ShiftState::Active {
                warehouse_out: true
            }
        );
        let session = mgr.session().unwrap();
        assert_eq!(session.start_time_ms, T0);
        assert_eq!(session.initial_odometer, Some(1000));
        assert_eq!(session.warehouse_exit_ms, Some(T0 + 1000));
    }
}

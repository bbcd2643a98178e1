use serde::Deserialize;
use strum::{Display, EnumString};
use tracing::info;

use crate::{errors::ShiftError, store::SessionStore, sync::Gateway};

/// Store key names. These match the original device storage layout, so an
/// upgraded install keeps its session.
pub mod keys {
    pub const USERNAME: &str = "USERNAME";
    pub const CITY: &str = "CITY";
    pub const USER_TYPE: &str = "USER_TYPE";
    pub const IS_LOGGED_IN: &str = "isLoggedIn";
    pub const IS_TURN_ACTIVE: &str = "isTurnActive";
    pub const START_TIME: &str = "startTime";
    pub const KM_INICIAL: &str = "kmInicial";
    pub const KM_FINAL: &str = "kmFinal";
    pub const CARRINHA: &str = "carrinha";
    pub const NOTES: &str = "notes";
    pub const IS_WAREHOUSE_ACTIVE: &str = "isWarehouseActive";
    pub const WAREHOUSE_START_TIME: &str = "warehouseStartTime";
    pub const WAREHOUSE_END_TIME: &str = "warehouseEndTime";
    pub const WAREHOUSE_ELAPSED_TIME: &str = "warehouseElapsedTime";
    pub const IMAGE_DRIVE_LINKS: &str = "imageDriveLinks";
    pub const TASKS: &str = "TASKS";

    /// Everything owned by one shift; removed together on successful close.
    pub const SHIFT_KEYS: &[&str] = &[
        IS_TURN_ACTIVE,
        START_TIME,
        KM_INICIAL,
        KM_FINAL,
        CARRINHA,
        NOTES,
        IS_WAREHOUSE_ACTIVE,
        WAREHOUSE_START_TIME,
        WAREHOUSE_END_TIME,
        WAREHOUSE_ELAPSED_TIME,
        IMAGE_DRIVE_LINKS,
    ];
}

/// Worker category. All per-type behavioral differences live in the methods
/// below instead of string comparisons scattered through the flows.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Driver,
    Delivery,
    Mechanic,
}

impl UserType {
    /// Mechanics work in the shop; odometer, van and warehouse toggling do
    /// not apply to them.
    pub fn requires_odometer(self) -> bool {
        !matches!(self, Self::Mechanic)
    }

    pub fn tracks_warehouse(self) -> bool {
        !matches!(self, Self::Mechanic)
    }

    pub fn required_photos(self) -> usize {
        match self {
            Self::Mechanic => 0,
            _ => 4,
        }
    }

    pub fn requires_notes(self) -> bool {
        matches!(self, Self::Mechanic)
    }

    /// Operator cards visible during this type's shift, by catalog id.
    pub fn operators(self) -> &'static [&'static str] {
        match self {
            Self::Driver => &["lime", "ridemovi", "bird", "link", "bolt"],
            Self::Delivery => &["delivery"],
            Self::Mechanic => &["mechanic"],
        }
    }
}

/// Logged-in worker, as fetched from the user directory at login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub city: String,
    pub user_type: UserType,
}

impl Identity {
    pub async fn load(store: &SessionStore) -> Result<Option<Self>, ShiftError> {
        let values = store
            .get_many(&[keys::USERNAME, keys::CITY, keys::USER_TYPE])
            .await?;
        let [username, city, user_type] = values.as_slice() else {
            return Err(ShiftError::storage("short identity reply"));
        };
        let (Some(username), Some(city), Some(user_type)) = (username, city, user_type) else {
            return Ok(None);
        };
        let user_type = user_type
            .parse()
            .map_err(|_| ShiftError::storage(format!("unknown user type: {user_type}")))?;
        Ok(Some(Self {
            username: username.clone(),
            city: city.clone(),
            user_type,
        }))
    }

    pub async fn save(&self, store: &SessionStore) -> Result<(), ShiftError> {
        store
            .set_many(vec![
                (keys::USERNAME.into(), self.username.clone()),
                (keys::CITY.into(), self.city.clone()),
                (keys::USER_TYPE.into(), self.user_type.to_string()),
                (keys::IS_LOGGED_IN.into(), "true".into()),
            ])
            .await
    }
}

/// One active shift as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShiftSession {
    /// Epoch milliseconds; set once at start, immutable for the session.
    pub start_time_ms: i64,
    pub user_type: UserType,
    pub initial_odometer: Option<i64>,
    pub vehicle_id: Option<String>,
    /// True while the worker is out in the field (between warehouse exit
    /// and warehouse entry).
    pub warehouse_out: bool,
    pub warehouse_exit_ms: Option<i64>,
    pub warehouse_entry_ms: Option<i64>,
}

impl ShiftSession {
    /// Rehydrates the active shift, or `None` if no shift is running.
    pub async fn load(store: &SessionStore, user_type: UserType) -> Result<Option<Self>, ShiftError> {
        let values = store
            .get_many(&[
                keys::IS_TURN_ACTIVE,
                keys::START_TIME,
                keys::KM_INICIAL,
                keys::CARRINHA,
                keys::IS_WAREHOUSE_ACTIVE,
                keys::WAREHOUSE_START_TIME,
                keys::WAREHOUSE_END_TIME,
            ])
            .await?;
        let [active, start, km, vehicle, wh_active, wh_start, wh_end] = values.as_slice() else {
            return Err(ShiftError::storage("short session reply"));
        };
        if active.as_deref() != Some("true") {
            return Ok(None);
        }
        let start_time_ms = parse_ms(start.as_deref())
            .ok_or_else(|| ShiftError::storage("active shift without startTime"))?;
        Ok(Some(Self {
            start_time_ms,
            user_type,
            initial_odometer: km.as_deref().and_then(|v| v.parse().ok()),
            vehicle_id: vehicle.clone(),
            warehouse_out: wh_active.as_deref() == Some("true"),
            warehouse_exit_ms: parse_ms(wh_start.as_deref()),
            warehouse_entry_ms: parse_ms(wh_end.as_deref()),
        }))
    }
}

fn parse_ms(raw: Option<&str>) -> Option<i64> {
    raw.and_then(|v| v.parse().ok())
}

/// Checks the credentials against the remote user directory and persists
/// the resulting identity. Directory lookups are by lowercased username.
pub async fn login<G: Gateway>(
    store: &SessionStore,
    gateway: &G,
    username: &str,
    password: &str,
) -> Result<Identity, ShiftError> {
    let users = gateway.fetch_users().await?;
    match users.get(&username.trim().to_lowercase()) {
        Some(record) if record.password == password => {
            let identity = Identity {
                username: username.trim().to_string(),
                city: record.city.clone(),
                user_type: record.user_type,
            };
            identity.save(store).await?;
            info!("Logged in {} ({})", identity.username, identity.user_type);
            Ok(identity)
        }
        _ => Err(ShiftError::validation("invalid credentials")),
    }
}

/// Ends the login session: everything on the device belongs to it, so the
/// whole store goes.
pub async fn logout(store: &SessionStore) -> Result<(), ShiftError> {
    store.clear().await
}

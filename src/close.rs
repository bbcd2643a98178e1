use std::path::PathBuf;

use strum::{Display, EnumIter, IntoEnumIterator};

use crate::{errors::ShiftError, session::ShiftSession};

/// Fixed capture order for the vehicle evidence photos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum PhotoAngle {
    Left,
    Front,
    Right,
    Rear,
}

impl PhotoAngle {
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PhotoSlot {
    #[default]
    Empty,
    /// Captured on-device, not yet uploaded.
    Local(PathBuf),
    /// Replaced by the blob store URL after upload.
    Uploaded(String),
}

/// The four evidence slots, one per angle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PhotoSet {
    slots: [PhotoSlot; 4],
}

impl PhotoSet {
    pub fn set_local(&mut self, angle: PhotoAngle, path: PathBuf) {
        self.slots[angle.index()] = PhotoSlot::Local(path);
    }

    pub fn set_uploaded(&mut self, angle: PhotoAngle, url: String) {
        self.slots[angle.index()] = PhotoSlot::Uploaded(url);
    }

    pub fn slot(&self, angle: PhotoAngle) -> &PhotoSlot {
        &self.slots[angle.index()]
    }

    pub fn filled_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !matches!(slot, PhotoSlot::Empty))
            .count()
    }

    /// Slots still awaiting upload, in angle order.
    pub fn pending_uploads(&self) -> Vec<(PhotoAngle, PathBuf)> {
        PhotoAngle::iter()
            .filter_map(|angle| match self.slot(angle) {
                PhotoSlot::Local(path) => Some((angle, path.clone())),
                _ => None,
            })
            .collect()
    }

    /// All four remote URLs, once every slot has been uploaded.
    pub fn remote_urls(&self) -> Option<Vec<String>> {
        let urls: Vec<String> = self
            .slots
            .iter()
            .filter_map(|slot| match slot {
                PhotoSlot::Uploaded(url) => Some(url.clone()),
                _ => None,
            })
            .collect();
        (urls.len() == 4).then_some(urls)
    }
}

/// Ephemeral close-time input, kept by the caller across failed attempts so
/// a retry does not re-enter anything.
#[derive(Debug, Clone, Default)]
pub struct CloseForm {
    /// Raw odometer text as typed; validated, not trusted.
    pub final_odometer: String,
    pub notes: String,
    pub photos: PhotoSet,
}

impl CloseForm {
    pub fn parsed_odometer(&self) -> Option<i64> {
        self.final_odometer.trim().parse().ok().filter(|v| *v >= 0)
    }
}

/// Close preconditions, first failing rule wins.
///
/// Pure and deterministic: safe to run on every keystroke for live
/// feedback. `max_distance_km` comes from configuration (default 250).
pub fn validate(
    form: &CloseForm,
    session: &ShiftSession,
    max_distance_km: i64,
) -> Result<(), ShiftError> {
    if session.user_type.requires_notes() {
        if form.notes.trim().is_empty() {
            return Err(ShiftError::validation("notes required"));
        }
        // Nothing else applies to the shop.
        return Ok(());
    }

    let Some(final_odometer) = form.parsed_odometer() else {
        return Err(ShiftError::validation("invalid odometer"));
    };

    if let Some(initial) = session.initial_odometer {
        let distance = final_odometer - initial;
        if distance < 0 {
            return Err(ShiftError::validation("final < initial"));
        }
        if distance > max_distance_km {
            return Err(ShiftError::validation("distance implausible"));
        }
    }

    if form.photos.filled_count() != session.user_type.required_photos() {
        return Err(ShiftError::validation("incomplete photo set"));
    }

    Ok(())
}

//! Multi-volume spanning state machine.
//!
//! ```text
//! Init -> Writing -> EotDetected -> VolumeSwapPending -> AutoLoaded ----------> Writing
//!                                                      \-> AwaitingManualChange -> Writing
//! Writing -> Completed        EotDetected -> Completed (nothing left to write)
//! any non-terminal state -> Failed
//! ```
//!
//! The autoloader path picks the next usable pool volume; when there is no
//! changer, no pool volume left, or the load fails, the operator is asked to
//! change the cartridge by hand.

use super::{Pool, VolumeStatus};
use crate::classify::ErrorKind;
use crate::device::{Autoloader, DeviceSession};
use crate::error::{Result, TapeStreamError};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanState {
    Init,
    Writing,
    EotDetected,
    VolumeSwapPending,
    AutoLoaded,
    AwaitingManualChange,
    Completed,
    Failed,
}

impl fmt::Display for SpanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl SpanState {
    fn can_move_to(self, next: SpanState) -> bool {
        use SpanState::*;
        match (self, next) {
            (Completed, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Init, Writing) => true,
            (Writing, EotDetected) | (Writing, Completed) => true,
            (EotDetected, VolumeSwapPending) | (EotDetected, Completed) => true,
            (VolumeSwapPending, AutoLoaded) | (VolumeSwapPending, AwaitingManualChange) => true,
            (AutoLoaded, Writing) | (AutoLoaded, AwaitingManualChange) => true,
            (AwaitingManualChange, Writing) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorReply {
    /// A cartridge with this label is now in the drive.
    Inserted(String),
    Abort,
}

/// The human at the drive.
pub trait Operator: Send {
    /// Ask for a fresh cartridge for `job`. `suggested` is the label used if
    /// the operator does not name one.
    fn request_volume(&mut self, job: &str, reason: &str, suggested: &str) -> Result<OperatorReply>;

    /// Ask for a specific, already written cartridge.
    fn request_existing(&mut self, volume_id: &str) -> Result<OperatorReply>;
}

pub struct SpanningManager {
    job_label: String,
    state: SpanState,
    pool: Option<Pool>,
    autoloader: Option<Box<dyn Autoloader>>,
    operator: Box<dyn Operator>,
    current: Option<String>,
    used: Vec<String>,
}

impl SpanningManager {
    pub fn new(
        job_label: &str,
        pool: Option<Pool>,
        autoloader: Option<Box<dyn Autoloader>>,
        operator: Box<dyn Operator>,
    ) -> Self {
        Self {
            job_label: job_label.to_string(),
            state: SpanState::Init,
            pool,
            autoloader,
            operator,
            current: None,
            used: Vec::new(),
        }
    }

    pub fn state(&self) -> SpanState {
        self.state
    }

    pub fn pool(&self) -> Option<&Pool> {
        self.pool.as_ref()
    }

    pub fn has_autoloader(&self) -> bool {
        self.autoloader.is_some()
    }

    /// Mark pool volumes that stored manifests still reference as full, so
    /// the autoloader never treats them as fresh media.
    pub fn protect_written(&mut self, in_use: &BTreeMap<String, BTreeSet<String>>) {
        let Some(pool) = self.pool.as_mut() else {
            return;
        };
        for volume in pool.volumes.iter_mut() {
            let Some(labels) = in_use.get(&volume.label) else {
                continue;
            };
            if volume.status != VolumeStatus::Error {
                volume.status = VolumeStatus::Full;
            }
            debug!("Volume {} holds backups of {:?}", volume.label, labels);
        }
    }

    /// Volumes written by this job, in order.
    pub fn used_volumes(&self) -> &[String] {
        &self.used
    }

    fn transition(&mut self, next: SpanState) -> Result<()> {
        if !self.state.can_move_to(next) {
            return Err(TapeStreamError::state_transition(format!(
                "{} -> {}",
                self.state, next
            )));
        }
        debug!("Spanning state {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    fn suggested_label(&self) -> String {
        format!("{}-v{}", self.job_label, self.used.len() + 1)
    }

    /// Label of the cartridge currently in the drive, from the changer and
    /// pool when they can tell, otherwise a generated one.
    pub fn identify_loaded(&mut self) -> Result<String> {
        if let (Some(loader), Some(pool)) = (self.autoloader.as_mut(), self.pool.as_ref()) {
            if let Some(slot) = loader.current_slot()? {
                if let Some(label) = pool.label_for_slot(slot) {
                    return Ok(label.to_string());
                }
            }
        }
        Ok(self.suggested_label())
    }

    /// Start writing on `volume_id`.
    pub fn begin(&mut self, volume_id: &str) -> Result<()> {
        self.transition(SpanState::Writing)?;
        self.enter_volume(volume_id);
        Ok(())
    }

    fn enter_volume(&mut self, volume_id: &str) {
        info!("Writing to volume {}", volume_id);
        self.current = Some(volume_id.to_string());
        self.used.push(volume_id.to_string());
        if let Some(v) = self.pool.as_mut().and_then(|p| p.volume_mut(volume_id)) {
            v.status = VolumeStatus::Appendable;
        }
    }

    /// Account bytes written to the current volume.
    pub fn record_usage(&mut self, bytes: u64) {
        let Some(current) = self.current.clone() else {
            return;
        };
        if let Some(v) = self.pool.as_mut().and_then(|p| p.volume_mut(&current)) {
            v.used_bytes += bytes;
        }
    }

    /// The drive reported end of volume (EOT or ENOSPC).
    pub fn end_of_volume(&mut self, kind: ErrorKind) -> Result<()> {
        if !kind.is_end_of_volume() {
            return Err(TapeStreamError::state_transition(format!(
                "{} is not an end-of-volume condition",
                kind
            )));
        }
        self.transition(SpanState::EotDetected)?;

        let current = self.current.clone().unwrap_or_default();
        warn!("Volume {} is full ({})", current, kind);
        if let Some(v) = self.pool.as_mut().and_then(|p| p.volume_mut(&current)) {
            v.status = VolumeStatus::Full;
            v.capacity_estimate = Some(v.used_bytes);
        }
        Ok(())
    }

    /// Replace the full cartridge and reopen the drive. Returns the label of
    /// the new volume.
    pub fn swap(&mut self, session: &mut DeviceSession) -> Result<String> {
        self.transition(SpanState::VolumeSwapPending)?;
        session.release();

        if let Some(label) = self.try_autoload()? {
            self.transition(SpanState::AutoLoaded)?;
            match session.reopen() {
                Ok(()) => {
                    self.transition(SpanState::Writing)?;
                    self.enter_volume(&label);
                    return Ok(label);
                }
                Err(e) => {
                    warn!("Drive did not come ready with {}: {}", label, e);
                    self.mark_error(&label);
                    session.release();
                }
            }
        }

        self.manual_change(session)
    }

    fn try_autoload(&mut self) -> Result<Option<String>> {
        let (Some(loader), Some(pool)) = (self.autoloader.as_mut(), self.pool.as_ref()) else {
            return Ok(None);
        };
        let Some(next) = pool.next_usable(&self.used) else {
            info!("No usable volume left in pool {}", pool.name);
            return Ok(None);
        };
        let (label, slot) = (next.label.clone(), next.slot);
        let Some(slot) = slot else {
            return Ok(None);
        };

        if let Some(loaded) = loader.current_slot()? {
            loader.unload_volume(loaded)?;
        }
        match loader.load_volume(slot) {
            Ok(()) => {
                info!("Autoloaded {} from slot {}", label, slot);
                Ok(Some(label))
            }
            Err(e) => {
                warn!("Autoload of {} from slot {} failed: {}", label, slot, e);
                self.mark_error(&label);
                Ok(None)
            }
        }
    }

    fn mark_error(&mut self, label: &str) {
        if let Some(v) = self.pool.as_mut().and_then(|p| p.volume_mut(label)) {
            v.status = VolumeStatus::Error;
        }
    }

    fn manual_change(&mut self, session: &mut DeviceSession) -> Result<String> {
        self.transition(SpanState::AwaitingManualChange)?;
        let mut reason = format!(
            "volume {} is full",
            self.current.as_deref().unwrap_or("in drive")
        );

        loop {
            let suggested = self.suggested_label();
            match self
                .operator
                .request_volume(&self.job_label, &reason, &suggested)?
            {
                OperatorReply::Abort => {
                    self.transition(SpanState::Failed)?;
                    return Err(TapeStreamError::SpanningAborted(format!(
                        "operator aborted the media change for {}",
                        self.job_label
                    )));
                }
                OperatorReply::Inserted(label) => {
                    let label = if label.trim().is_empty() {
                        suggested
                    } else {
                        label.trim().to_string()
                    };
                    if let Some(refusal) = self.refusal(&label) {
                        warn!("Refusing volume {}: {}", label, refusal);
                        reason = refusal;
                        continue;
                    }
                    match session.reopen() {
                        Ok(()) => {
                            self.transition(SpanState::Writing)?;
                            self.enter_volume(&label);
                            return Ok(label);
                        }
                        Err(e) => {
                            warn!("Drive not ready after media change: {}", e);
                            reason = format!("drive not ready: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Why `label` cannot take new data, if it cannot.
    fn refusal(&self, label: &str) -> Option<String> {
        if self.used.iter().any(|u| u == label) {
            return Some(format!("volume {} was already written by this job", label));
        }
        match self.pool.as_ref().and_then(|p| p.volume(label)) {
            Some(v) if !v.is_usable() => Some(format!("volume {} is {}", label, v.status)),
            _ => None,
        }
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(SpanState::Completed)
    }

    /// Terminal failure. The current volume is marked in error when a device
    /// fault caused it.
    pub fn fail(&mut self, device_fault: bool) {
        if device_fault {
            if let Some(current) = self.current.clone() {
                self.mark_error(&current);
            }
        }
        if self.state != SpanState::Failed {
            let _ = self.transition(SpanState::Failed);
        }
    }

    /// Bring a written volume into the drive for reading. Does not touch the
    /// write state machine.
    pub fn load_for_read(&mut self, volume_id: &str, session: &mut DeviceSession) -> Result<()> {
        if self.current.as_deref() == Some(volume_id) {
            return Ok(());
        }

        let slot = match (self.autoloader.as_mut(), self.pool.as_ref()) {
            (Some(loader), pool) => match pool.and_then(|p| p.volume(volume_id)).and_then(|v| v.slot) {
                Some(slot) => Some(slot),
                None => loader.slot_of(volume_id)?,
            },
            _ => None,
        };

        if let (Some(slot), Some(loader)) = (slot, self.autoloader.as_mut()) {
            session.release();
            if let Some(loaded) = loader.current_slot()? {
                if loaded == slot {
                    session.reopen()?;
                    self.current = Some(volume_id.to_string());
                    return Ok(());
                }
                loader.unload_volume(loaded)?;
            }
            loader.load_volume(slot)?;
            session.reopen()?;
            self.current = Some(volume_id.to_string());
            return Ok(());
        }

        loop {
            session.release();
            match self.operator.request_existing(volume_id)? {
                OperatorReply::Abort => {
                    return Err(TapeStreamError::SpanningAborted(format!(
                        "operator did not provide volume {}",
                        volume_id
                    )))
                }
                OperatorReply::Inserted(_) => match session.reopen() {
                    Ok(()) => {
                        self.current = Some(volume_id.to_string());
                        return Ok(());
                    }
                    Err(e) => warn!("Drive not ready: {}", e),
                },
            }
        }
    }

    /// Declare which volume is in the drive without loading anything.
    pub fn assume_loaded(&mut self, volume_id: &str) {
        self.current = Some(volume_id.to_string());
    }
}

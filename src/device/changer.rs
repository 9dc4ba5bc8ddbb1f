//! SCSI media changer adapter built on `mtx`.

use super::{run_tool, Autoloader};
use crate::error::Result;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveElement {
    pub index: u32,
    pub full: bool,
    pub loaded_slot: Option<u32>,
    pub volume_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageElement {
    pub slot: u32,
    pub full: bool,
    pub volume_tag: Option<String>,
    pub import_export: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangerStatus {
    pub drives: Vec<DriveElement>,
    pub slots: Vec<StorageElement>,
}

/// Autoloader driven through `mtx -f <changer>`.
pub struct MtxChanger {
    changer: PathBuf,
    drive_index: u32,
}

impl MtxChanger {
    pub fn new(changer: PathBuf, drive_index: u32) -> Self {
        Self {
            changer,
            drive_index,
        }
    }

    fn mtx(&self, args: &[&str]) -> Result<String> {
        let changer = self.changer.to_string_lossy();
        let mut full = vec!["-f", &*changer];
        full.extend_from_slice(args);
        run_tool("mtx", &full)
    }

    pub fn status(&self) -> Result<ChangerStatus> {
        Ok(parse_mtx_status(&self.mtx(&["status"])?))
    }
}

impl Autoloader for MtxChanger {
    fn load_volume(&mut self, slot: u32) -> Result<()> {
        info!("Loading slot {} into drive {}", slot, self.drive_index);
        self.mtx(&["load", &slot.to_string(), &self.drive_index.to_string()])?;
        Ok(())
    }

    fn unload_volume(&mut self, slot: u32) -> Result<()> {
        info!("Unloading drive {} to slot {}", self.drive_index, slot);
        self.mtx(&["unload", &slot.to_string(), &self.drive_index.to_string()])?;
        Ok(())
    }

    fn current_slot(&mut self) -> Result<Option<u32>> {
        let status = self.status()?;
        Ok(status
            .drives
            .iter()
            .find(|d| d.index == self.drive_index)
            .and_then(|d| d.loaded_slot))
    }

    fn slot_of(&mut self, volume_label: &str) -> Result<Option<u32>> {
        let status = self.status()?;
        Ok(status
            .slots
            .iter()
            .find(|s| s.full && s.volume_tag.as_deref() == Some(volume_label))
            .map(|s| s.slot))
    }
}

fn volume_tag(field: Option<&str>) -> Option<String> {
    field
        .and_then(|f| f.split_once('='))
        .map(|(_, tag)| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
}

/// Parse `mtx status` output.
pub fn parse_mtx_status(output: &str) -> ChangerStatus {
    let mut status = ChangerStatus::default();

    for line in output.lines() {
        let line = line.trim();
        let mut fields = line.split(':');
        let head = fields.next().unwrap_or("");
        let state = fields.next().unwrap_or("").trim();
        let tag = volume_tag(fields.next());

        if let Some(rest) = head.strip_prefix("Data Transfer Element ") {
            let Ok(index) = rest.trim().parse::<u32>() else {
                continue;
            };
            // "Full (Storage Element 2 Loaded)"
            let loaded_slot = state
                .split_once("Storage Element ")
                .and_then(|(_, s)| s.split_whitespace().next())
                .and_then(|s| s.parse().ok());
            status.drives.push(DriveElement {
                index,
                full: state.starts_with("Full"),
                loaded_slot,
                volume_tag: tag,
            });
        } else if let Some(rest) = head.strip_prefix("Storage Element ") {
            let mut parts = rest.split_whitespace();
            let Some(slot) = parts.next().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            status.slots.push(StorageElement {
                slot,
                full: state.starts_with("Full"),
                volume_tag: tag,
                import_export: parts.any(|p| p == "IMPORT/EXPORT"),
            });
        }
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "  Storage Changer /dev/sg3:1 Drives, 4 Slots ( 1 Import/Export )
Data Transfer Element 0:Full (Storage Element 2 Loaded):VolumeTag = P0002SL9
      Storage Element 1:Full :VolumeTag=P0001SL9
      Storage Element 2:Empty
      Storage Element 3:Full :VolumeTag=P0003SL9
      Storage Element 4 IMPORT/EXPORT:Empty
";

    #[test]
    fn test_parse_drive_element() {
        let status = parse_mtx_status(STATUS);
        assert_eq!(
            status.drives,
            vec![DriveElement {
                index: 0,
                full: true,
                loaded_slot: Some(2),
                volume_tag: Some("P0002SL9".to_string()),
            }]
        );
    }

    #[test]
    fn test_parse_storage_elements() {
        let status = parse_mtx_status(STATUS);
        assert_eq!(status.slots.len(), 4);
        assert_eq!(status.slots[0].volume_tag.as_deref(), Some("P0001SL9"));
        assert!(!status.slots[1].full);
        assert!(status.slots[3].import_export);
        assert!(!status.slots[0].import_export);
    }
}

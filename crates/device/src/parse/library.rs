//! `mtx status` output.
//!
//! ```text
//!   Storage Changer /dev/sg1:2 Drives, 20 Slots ( 1 Import/Export )
//! Data Transfer Element 0:Full (Storage Element 1 Loaded):VolumeTag = VOL001L6
//! Data Transfer Element 1:Empty
//!       Storage Element 1:Empty
//!       Storage Element 2:Full :VolumeTag=VOL002L6
//!       Storage Element 20 IMPORT/EXPORT:Empty
//! ```

use crate::error::{ErrorKind, Result};
use std::str::FromStr;

const TOOL: &str = "mtx";

regex!(HEADER, r"^Storage Changer (\S+):(\d+) Drives?, (\d+) Slots? \( (\d+) Import/Export \)$");
regex!(
    DRIVE,
    r"^Data Transfer Element (\d+):(Empty|Full)(?: \((?:Storage Element (\d+)|Unknown Storage Element) Loaded\))?(.*)$"
);
regex!(SLOT, r"^Storage Element (\d+)( IMPORT/EXPORT)?:(Empty|Full)(.*)$");
regex!(TAGS, r"^\s*(?::VolumeTag\s*=\s*([^\s:]+))?\s*(?::AlternateVolumeTag\s*=\s*([^\s:]+))?\s*$");

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cartridge {
    /// Barcode label; absent when the library has no barcode reader.
    pub volume_tag: Option<String>,
    pub alternate_volume_tag: Option<String>,
}

/// A data transfer element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveSlot {
    pub index: u32,
    /// Storage element the loaded cartridge came from, when the changer remembers it.
    pub loaded_from: Option<u32>,
    pub cartridge: Option<Cartridge>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSlot {
    pub index: u32,
    /// Mail slot used to move cartridges in and out of the library.
    pub import_export: bool,
    pub cartridge: Option<Cartridge>,
}

/// Where a cartridge currently sits in the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeLocation {
    Slot(u32),
    Drive(u32),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryStatus {
    pub device: String,
    pub drive_count: u32,
    pub slot_count: u32,
    pub import_export_count: u32,
    pub drives: Vec<DriveSlot>,
    pub slots: Vec<StorageSlot>,
}
impl LibraryStatus {
    pub fn drive(&self, index: u32) -> Option<&DriveSlot> {
        self.drives.iter().find(|drive| drive.index == index)
    }

    pub fn find_tape(&self, label: &str) -> Option<TapeLocation> {
        let matches = |cartridge: &Option<Cartridge>| {
            cartridge.as_ref().and_then(|c| c.volume_tag.as_deref()).is_some_and(|tag| tag == label)
        };
        if let Some(drive) = self.drives.iter().find(|drive| matches(&drive.cartridge)) {
            return Some(TapeLocation::Drive(drive.index));
        }
        self.slots.iter().find(|slot| matches(&slot.cartridge)).map(|slot| TapeLocation::Slot(slot.index))
    }

    /// First empty storage slot, ignoring mail slots.
    pub fn free_slot(&self) -> Option<u32> {
        self.slots.iter().find(|slot| !slot.import_export && slot.cartridge.is_none()).map(|slot| slot.index)
    }

    pub fn is_slot_empty(&self, index: u32) -> bool {
        self.slots.iter().any(|slot| slot.index == index && slot.cartridge.is_none())
    }
}

pub fn parse_library_status(output: &str) -> Result<LibraryStatus> {
    let mut lines = output.lines().map(str::trim).filter(|line| !line.is_empty());
    let header = lines.next().unwrap_or_default();
    let caps = HEADER.captures(header).ok_or_else(|| ErrorKind::parse(TOOL, header))?;
    let mut status = LibraryStatus {
        device: caps[1].to_string(),
        drive_count: number(&caps[2], header)?,
        slot_count: number(&caps[3], header)?,
        import_export_count: number(&caps[4], header)?,
        ..LibraryStatus::default()
    };
    for line in lines {
        if let Some(caps) = DRIVE.captures(line) {
            let full = &caps[2] == "Full";
            let loaded_from = caps.get(3).map(|m| number(m.as_str(), line)).transpose()?;
            let tags = tags(&caps[4], line)?;
            status.drives.push(DriveSlot {
                index: number(&caps[1], line)?,
                loaded_from,
                cartridge: full.then_some(tags),
            });
        } else if let Some(caps) = SLOT.captures(line) {
            let full = &caps[3] == "Full";
            let tags = tags(&caps[4], line)?;
            status.slots.push(StorageSlot {
                index: number(&caps[1], line)?,
                import_export: caps.get(2).is_some(),
                cartridge: full.then_some(tags),
            });
        } else {
            exn::bail!(ErrorKind::parse(TOOL, line));
        }
    }
    Ok(status)
}

fn tags(rest: &str, line: &str) -> Result<Cartridge> {
    let caps = TAGS.captures(rest).ok_or_else(|| ErrorKind::parse(TOOL, line))?;
    Ok(Cartridge {
        volume_tag: caps.get(1).map(|m| m.as_str().to_string()),
        alternate_volume_tag: caps.get(2).map(|m| m.as_str().to_string()),
    })
}

fn number<T: FromStr>(digits: &str, line: &str) -> Result<T> {
    digits.parse().map_err(|_| exn::Exn::from(ErrorKind::parse(TOOL, line)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const INVENTORY: &str = "  Storage Changer /dev/sg1:2 Drives, 4 Slots ( 1 Import/Export )
Data Transfer Element 0:Full (Storage Element 1 Loaded):VolumeTag = VOL001L6
Data Transfer Element 1:Empty
      Storage Element 1:Empty
      Storage Element 2:Full :VolumeTag=VOL002L6
      Storage Element 3:Full :VolumeTag=VOL003L6                        :AlternateVolumeTag=ALT003
      Storage Element 4 IMPORT/EXPORT:Empty
";

    #[test]
    fn test_inventory() {
        let status = parse_library_status(INVENTORY).unwrap();
        assert_eq!(status.device, "/dev/sg1");
        assert_eq!((status.drive_count, status.slot_count, status.import_export_count), (2, 4, 1));
        assert_eq!(status.drives.len(), 2);
        assert_eq!(status.slots.len(), 4);

        let drive = status.drive(0).unwrap();
        assert_eq!(drive.loaded_from, Some(1));
        assert_eq!(drive.cartridge.as_ref().unwrap().volume_tag.as_deref(), Some("VOL001L6"));
        assert!(status.drive(1).unwrap().cartridge.is_none());

        let slot = &status.slots[2];
        assert_eq!(slot.index, 3);
        assert_eq!(slot.cartridge.as_ref().unwrap().alternate_volume_tag.as_deref(), Some("ALT003"));
        assert!(status.slots[3].import_export);
    }

    #[rstest]
    #[case::in_drive("VOL001L6", Some(TapeLocation::Drive(0)))]
    #[case::in_slot("VOL003L6", Some(TapeLocation::Slot(3)))]
    #[case::missing("VOL999L6", None)]
    fn test_find_tape(#[case] label: &str, #[case] expected: Option<TapeLocation>) {
        let status = parse_library_status(INVENTORY).unwrap();
        assert_eq!(status.find_tape(label), expected);
    }

    #[test]
    fn test_free_slot_skips_mail_slots() {
        let mut status = parse_library_status(INVENTORY).unwrap();
        assert_eq!(status.free_slot(), Some(1));
        status.slots[0].cartridge = Some(Cartridge::default());
        assert_eq!(status.free_slot(), None);
    }

    #[test]
    fn test_unknown_source_element() {
        let output = "Storage Changer /dev/sg3:1 Drive, 1 Slot ( 0 Import/Export )
Data Transfer Element 0:Full (Unknown Storage Element Loaded):VolumeTag = VOL009L6
Storage Element 1:Empty
";
        let status = parse_library_status(output).unwrap();
        assert_eq!(status.drives[0].loaded_from, None);
        assert_eq!(status.find_tape("VOL009L6"), Some(TapeLocation::Drive(0)));
    }

    #[rstest]
    #[case::missing_header("Data Transfer Element 0:Empty\n", "Data Transfer Element 0:Empty")]
    #[case::unknown_line(
        "Storage Changer /dev/sg1:1 Drives, 1 Slots ( 0 Import/Export )\nRobot arm is on fire\n",
        "Robot arm is on fire"
    )]
    #[case::garbled_tag(
        "Storage Changer /dev/sg1:1 Drives, 1 Slots ( 0 Import/Export )\nStorage Element 1:Full :Barcode=X\n",
        "Storage Element 1:Full :Barcode=X"
    )]
    #[case::empty("", "")]
    fn test_unparseable(#[case] output: &str, #[case] expected_line: &str) {
        let err = parse_library_status(output).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Parse { tool: "mtx", line } if line == expected_line), "{err:?}");
    }
}

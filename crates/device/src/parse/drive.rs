//! `mt status` output.
//!
//! ```text
//! SCSI 2 tape drive:
//! File number=0, block number=0, partition=0.
//! Tape block size 0 bytes. Density code 0x5a (LTO-6).
//! Soft error count since last status=0
//! General status bits on (41010000):
//!  BOT ONLINE IM_REP_EN
//! ```

use crate::error::{ErrorKind, Result};
use std::collections::BTreeSet;
use std::str::FromStr;

const TOOL: &str = "mt";

regex!(DESCRIPTION, r"^(.+ tape drive):$");
regex!(POSITION, r"^File number=(-?\d+), block number=(-?\d+), partition=(\d+)\.$");
regex!(MEDIUM, r"^Tape block size (\d+) bytes\. Density code (0x[[:xdigit:]]+) \((.*)\)\.$");
regex!(SOFT_ERRORS, r"^Soft error count since last status=(\d+)$");
regex!(STATUS_BITS, r"^General status bits on \(([[:xdigit:]]+)\):$");

/// Generic status flags reported by the SCSI tape driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DriveFlag {
    /// Beginning of tape.
    Bot,
    Eof,
    /// End of tape (early warning).
    Eot,
    /// Set mark.
    Sm,
    /// End of recorded data.
    Eod,
    WriteProtected,
    /// A cartridge is loaded and the drive is ready.
    Online,
    D6250,
    D1600,
    D800,
    /// Door open: no cartridge.
    DoorOpen,
    ImmediateReport,
    /// A cleaning cartridge is requested.
    Cleaning,
}
impl FromStr for DriveFlag {
    type Err = ();
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "BOT" => Self::Bot,
            "EOF" => Self::Eof,
            "EOT" => Self::Eot,
            "SM" => Self::Sm,
            "EOD" => Self::Eod,
            "WR_PROT" => Self::WriteProtected,
            "ONLINE" => Self::Online,
            "D_6250" => Self::D6250,
            "D_1600" => Self::D1600,
            "D_800" => Self::D800,
            "DR_OPEN" => Self::DoorOpen,
            "IM_REP_EN" => Self::ImmediateReport,
            "CLN" => Self::Cleaning,
            _ => return Err(()),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveStatus {
    pub description: Option<String>,
    /// File (tape mark) number the head is positioned at; `-1` when unknown.
    pub file_number: Option<i64>,
    pub block_number: Option<i64>,
    pub partition: Option<u32>,
    pub block_size: Option<u64>,
    pub density_code: Option<String>,
    pub density: Option<String>,
    pub soft_errors: Option<u64>,
    pub status_bits: Option<String>,
    pub flags: BTreeSet<DriveFlag>,
}
impl DriveStatus {
    pub fn has(&self, flag: DriveFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// A cartridge is in the drive and ready for commands.
    pub fn is_loaded(&self) -> bool {
        self.has(DriveFlag::Online) && !self.has(DriveFlag::DoorOpen)
    }

    pub fn is_write_protected(&self) -> bool {
        self.has(DriveFlag::WriteProtected)
    }
}

pub fn parse_drive_status(output: &str) -> Result<DriveStatus> {
    let mut status = DriveStatus::default();
    let mut seen_any = false;
    for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
        seen_any = true;
        if let Some(caps) = DESCRIPTION.captures(line) {
            status.description = Some(caps[1].to_string());
        } else if let Some(caps) = POSITION.captures(line) {
            status.file_number = Some(number(&caps[1], line)?);
            status.block_number = Some(number(&caps[2], line)?);
            status.partition = Some(number(&caps[3], line)?);
        } else if let Some(caps) = MEDIUM.captures(line) {
            status.block_size = Some(number(&caps[1], line)?);
            status.density_code = Some(caps[2].to_string());
            status.density = Some(caps[3].to_string());
        } else if let Some(caps) = SOFT_ERRORS.captures(line) {
            status.soft_errors = Some(number(&caps[1], line)?);
        } else if let Some(caps) = STATUS_BITS.captures(line) {
            status.status_bits = Some(caps[1].to_string());
        } else {
            // Anything else must be the flag line, and every token must be known.
            for token in line.split_whitespace() {
                let flag = token.parse::<DriveFlag>().map_err(|()| ErrorKind::parse(TOOL, line))?;
                status.flags.insert(flag);
            }
        }
    }
    if !seen_any {
        exn::bail!(ErrorKind::parse(TOOL, ""));
    }
    Ok(status)
}

fn number<T: FromStr>(digits: &str, line: &str) -> Result<T> {
    digits.parse().map_err(|_| exn::Exn::from(ErrorKind::parse(TOOL, line)))
}

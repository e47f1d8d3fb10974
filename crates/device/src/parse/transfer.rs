//! `dd` summary, printed on stderr once the transfer ends.
//!
//! ```text
//! 2+0 records in
//! 2+0 records out
//! 1048576 bytes (1.0 MB, 1.0 MiB) copied, 0.0012 s, 852 MB/s
//! ```

use crate::error::{ErrorKind, Result};

const TOOL: &str = "dd";

regex!(RECORDS, r"^(\d+)\+(\d+) records (in|out)$");
regex!(BYTES, r"^(\d+) bytes(?: \([^)]*\))? (?:copied|transferred)");

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Records {
    pub full: u64,
    pub partial: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub records_in: Records,
    pub records_out: Records,
    pub bytes: u64,
}

pub fn parse_transfer_summary(output: &str) -> Result<TransferSummary> {
    let mut summary = TransferSummary::default();
    let mut bytes = None;
    for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if let Some(caps) = RECORDS.captures(line) {
            let records = Records { full: number(&caps[1], line)?, partial: number(&caps[2], line)? };
            match &caps[3] {
                "in" => summary.records_in = records,
                _ => summary.records_out = records,
            }
        } else if let Some(caps) = BYTES.captures(line) {
            bytes = Some(number(&caps[1], line)?);
        } else if line.starts_with("dd: warning") {
            tracing::warn!(message = line, "transfer tool warning");
        } else {
            exn::bail!(ErrorKind::parse(TOOL, line));
        }
    }
    summary.bytes = match bytes {
        Some(bytes) => bytes,
        None => exn::bail!(ErrorKind::parse(TOOL, output.trim())),
    };
    Ok(summary)
}

fn number(digits: &str, line: &str) -> Result<u64> {
    digits.parse().map_err(|_| exn::Exn::from(ErrorKind::parse(TOOL, line)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::gnu(
        "2+0 records in\n2+0 records out\n1048576 bytes (1.0 MB, 1.0 MiB) copied, 0.0012 s, 852 MB/s\n",
        1_048_576
    )]
    #[case::gnu_small("0+1 records in\n0+1 records out\n12 bytes copied, 0.000101 s, 119 kB/s\n", 12)]
    #[case::bsd("2+0 records in\n2+0 records out\n1048576 bytes transferred in 0.002 secs (524288000 bytes/sec)\n", 1_048_576)]
    #[case::with_warning(
        "dd: warning: partial read (512 bytes); suggest iflag=fullblock\n0+1 records in\n0+1 records out\n512 bytes copied, 0.1 s, 5 kB/s\n",
        512
    )]
    fn test_bytes(#[case] output: &str, #[case] bytes: u64) {
        assert_eq!(parse_transfer_summary(output).unwrap().bytes, bytes);
    }

    #[test]
    fn test_records() {
        let summary = parse_transfer_summary("3+1 records in\n3+1 records out\n1000 bytes copied, 1 s, 1 kB/s\n").unwrap();
        assert_eq!(summary.records_in, Records { full: 3, partial: 1 });
        assert_eq!(summary.records_out, Records { full: 3, partial: 1 });
    }

    #[rstest]
    #[case::no_byte_count("1+0 records in\n1+0 records out\n")]
    #[case::error_message("dd: error writing '/dev/nst0': No space left on device\n")]
    fn test_unparseable(#[case] output: &str) {
        let err = parse_transfer_summary(output).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Parse { tool: "dd", .. }));
    }
}

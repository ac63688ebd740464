//! Plain-text state dumps for debugging.

use std::fmt::{self, Write};
use std::str::FromStr;

use crate::hardware::DeviceId;
use crate::stats::UsageSnapshot;

/// Which devices a dump covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpTarget {
    All,
    Device(DeviceId),
}

impl DumpTarget {
    pub fn matches(&self, id: &str) -> bool {
        match self {
            DumpTarget::All => true,
            DumpTarget::Device(target) => &**target == id,
        }
    }
}

impl FromStr for DumpTarget {
    type Err = std::convert::Infallible;

    /// `"all"` (any case) or a device id
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            Ok(DumpTarget::All)
        } else {
            Ok(DumpTarget::Device(s.into()))
        }
    }
}

impl fmt::Display for DumpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DumpTarget::All => f.write_str("all"),
            DumpTarget::Device(id) => f.write_str(id),
        }
    }
}

pub(crate) fn write_line(out: &mut String, indent: usize, args: fmt::Arguments<'_>) {
    // Writing into a String cannot fail
    let _ = writeln!(out, "{:width$}{}", "", args, width = indent * 2);
}

pub(crate) fn write_snapshot(out: &mut String, indent: usize, label: &str, s: &UsageSnapshot) {
    write_line(
        out,
        indent,
        format_args!(
            "{label}: received={} ignored={} skipped={} returned={} errors={} \
             peak_clients={} peak_in_flight={} mean_hold={}us quota={} clients={}",
            s.frames_received,
            s.frames_ignored,
            s.frames_skipped_to_sync,
            s.frames_returned,
            s.erroneous_events,
            s.peak_clients,
            s.peak_frames_in_flight,
            s.mean_hold_time_us,
            s.buffer_quota,
            s.clients,
        ),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_parsing() {
        assert_eq!("ALL".parse::<DumpTarget>().unwrap(), DumpTarget::All);
        let target: DumpTarget = "front".parse().unwrap();
        assert!(target.matches("front"));
        assert!(!target.matches("rear"));
        assert!(DumpTarget::All.matches("rear"));
    }

    #[test]
    fn lines_are_indented() {
        let mut out = String::new();
        write_line(&mut out, 0, format_args!("top"));
        write_snapshot(&mut out, 1, "last", &UsageSnapshot::default());
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[0], "top");
        assert!(lines[1].starts_with("  last: received=0"));
    }
}

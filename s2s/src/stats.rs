//! Packet-count statistics file (spec §10, from `original_source/s2s/main.c`):
//! a single decimal integer and newline, truncated and rewritten on a fixed
//! ~60 second cadence independent of `check.interval`.

use std::path::{Path, PathBuf};

use crate::error::Result;

pub const WRITE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

pub struct PacketStats {
    path: PathBuf,
    count: u64,
}

impl PacketStats {
    pub fn new(path: PathBuf) -> Self {
        PacketStats { path, count: 0 }
    }

    pub fn record_packet(&mut self) {
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Truncate-and-rewrite the stats file. A failure here is treated as
    /// fatal by the caller (spec §7: "signals environment corruption"),
    /// which is why this returns a `Result` rather than logging and moving
    /// on like every other phase of the loop.
    pub fn write(&self) -> Result<()> {
        write_count(&self.path, self.count)
    }
}

fn write_count(path: &Path, count: u64) -> Result<()> {
    std::fs::write(path, format!("{}\n", count))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_truncates_and_holds_one_line() {
        let dir = std::env::temp_dir().join(format!("s2s-stats-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("packet.stat");
        std::fs::write(&path, "999999\nstale\n").unwrap();

        let mut stats = PacketStats::new(path.clone());
        stats.record_packet();
        stats.record_packet();
        stats.write().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "2\n");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn write_failure_surfaces_as_error() {
        let mut stats = PacketStats::new(PathBuf::from("/nonexistent-dir-for-s2s-tests/packet.stat"));
        stats.record_packet();
        assert!(stats.write().is_err());
    }
}

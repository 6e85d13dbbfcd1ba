//! Periodic CSV dump of the client counters.

use anyhow::bail;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tunnel_pool::{Stats, StatsSnapshot};

/// Appends one row of counters per period to a time-named CSV file
pub struct StatsLogger {
    path_format: String,
    period: Duration,
    stats: Arc<Stats>,
}

impl StatsLogger {
    /// Returns `None` when logging is disabled (empty path or zero period)
    pub fn new(path_format: &str, period_secs: u64, stats: Arc<Stats>) -> anyhow::Result<Option<Self>> {
        if path_format.is_empty() || period_secs == 0 {
            return Ok(None);
        }
        check_path_format(path_format)?;
        Ok(Some(Self {
            path_format: path_format.to_string(),
            period: Duration::from_secs(period_secs),
            stats,
        }))
    }

    /// File name for `now`, expanding strftime escapes in the configured path
    pub fn path_at(&self, now: &DateTime<Local>) -> io::Result<PathBuf> {
        let mut path = String::new();
        write!(path, "{}", now.format_with_items(StrftimeItems::new(&self.path_format))).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid time format in {}", self.path_format),
            )
        })?;
        Ok(PathBuf::from(path))
    }

    /// Append the current counters and reset them
    pub fn write_row(&self, now: &DateTime<Local>) -> io::Result<()> {
        let path = self.path_at(now)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut out = String::new();
        if file.metadata()?.len() == 0 {
            out.push_str("Unix,");
            out.push_str(&StatsSnapshot::header().join(","));
            out.push('\n');
        }

        let snapshot = self.stats.take();
        out.push_str(&now.timestamp().to_string());
        for field in snapshot.to_row() {
            out.push(',');
            out.push_str(&field);
        }
        out.push('\n');

        file.write_all(out.as_bytes())
    }

    /// Write a row every period; stops at the first file error
    pub async fn run(self) {
        component_info!(
            "stats",
            "Writing stats to {} every {:?}",
            self.path_format,
            self.period
        );

        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.write_row(&Local::now()) {
                component_error!("stats", "Failed to write stats row: {}", e);
                return;
            }
        }
    }
}

/// Reject strftime escapes chrono cannot expand
pub fn check_path_format(path_format: &str) -> anyhow::Result<()> {
    if StrftimeItems::new(path_format).any(|item| matches!(item, Item::Error)) {
        bail!("snmplog {} contains an invalid time escape", path_format);
    }
    Ok(())
}

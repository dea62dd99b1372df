//! Dashboard queries over persisted detections.
//!
//! Every windowed query takes a [`TimeRange`]; missing bounds fall back to the
//! defaults of the dashboard (last 30 days for counts, last 12 months for the
//! monthly chart). [`Analytics::total_violations`] is deliberately all-time and
//! ignores any range.

use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::store::{format_timestamp, TIMESTAMP_FORMAT};

pub const PAGE_SIZE: u32 = 15;
pub const DEFAULT_WINDOW_DAYS: i64 = 30;
pub const DEFAULT_MONTHS: u32 = 12;
pub const NO_VIOLATIONS_LABEL: &str = "None";

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

// ----------------------------------------------------------------------------
// Pure helpers
// ----------------------------------------------------------------------------

/// `100 * (1 - violations / total)`; 100 when there are no rows.
pub fn compliance_percentage(total: u64, violations: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    100.0 * (1.0 - violations as f64 / total as f64)
}

/// Period-over-period change in percent, rounded to one decimal.
///
/// No previous activity yields 0 when there is still none and 100 otherwise.
pub fn trend_percentage(current: u64, previous: u64) -> f64 {
    if previous == 0 {
        return if current == 0 { 0.0 } else { 100.0 };
    }
    round1((current as f64 - previous as f64) / previous as f64 * 100.0)
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Number of pages needed for `total` rows.
pub fn page_count(total: u64, per_page: u32) -> u64 {
    if per_page == 0 {
        return 0;
    }
    total.div_ceil(per_page as u64)
}

// ----------------------------------------------------------------------------
// Time ranges
// ----------------------------------------------------------------------------

/// Inclusive timestamp window; either bound may be open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    /// Parse optional textual bounds as sent by the dashboard.
    ///
    /// Accepts `YYYY-MM-DD HH:MM:SS`, the HTML `YYYY-MM-DDTHH:MM` form (seconds
    /// optional) and bare dates. A bare end date covers the whole day.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> Result<Self> {
        let start = start
            .filter(|s| !s.trim().is_empty())
            .map(|s| parse_bound(s, false))
            .transpose()?;
        let end = end
            .filter(|s| !s.trim().is_empty())
            .map(|s| parse_bound(s, true))
            .transpose()?;
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(anyhow!("range start {} is after its end {}", s, e));
            }
        }
        Ok(Self { start, end })
    }

    pub fn is_open(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Fill open bounds with `[now - days, now]`.
    pub fn or_last_days(&self, now: NaiveDateTime, days: i64) -> (NaiveDateTime, NaiveDateTime) {
        (
            self.start.unwrap_or(now - Duration::days(days)),
            self.end.unwrap_or(now),
        )
    }
}

fn parse_bound(raw: &str, is_end: bool) -> Result<NaiveDateTime> {
    let raw = raw.trim();
    for format in [
        TIMESTAMP_FORMAT,
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(ts);
        }
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid date or timestamp '{}'", raw))?;
    let time = if is_end {
        NaiveTime::from_hms_opt(23, 59, 59)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| anyhow!("invalid time of day"))?;
    Ok(date.and_time(time))
}

// ----------------------------------------------------------------------------
// Query results
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionRow {
    pub id: i64,
    pub timestamp: String,
    pub equipment: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LabeledCount {
    pub label: String,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EquipmentSummary {
    pub name: String,
    pub count: u64,
    pub percentage: f64,
    pub trend: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DashboardSummary {
    pub total_detections: u64,
    pub total_violations: u64,
    pub compliance_rate: f64,
    pub most_common_missing: String,
    pub daily: Vec<LabeledCount>,
    pub monthly: Vec<LabeledCount>,
    pub equipment: Vec<EquipmentSummary>,
}

// ----------------------------------------------------------------------------
// Queries
// ----------------------------------------------------------------------------

/// Read-only view over the detection tables, pinned to a reference "now".
pub struct Analytics<'a> {
    conn: &'a Connection,
    now: NaiveDateTime,
}

impl<'a> Analytics<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self::at(conn, Local::now().naive_local())
    }

    /// Analytics with a fixed clock.
    pub fn at(conn: &'a Connection, now: NaiveDateTime) -> Self {
        Self { conn, now }
    }

    fn window(&self, range: &TimeRange) -> (String, String) {
        let (start, end) = range.or_last_days(self.now, DEFAULT_WINDOW_DAYS);
        (format_timestamp(&start), format_timestamp(&end))
    }

    /// Detection rows in `range` (unbounded when open), newest first.
    pub fn detections_page(&self, range: &TimeRange, limit: u32, offset: u64) -> Result<Vec<DetectionRow>> {
        let (start, end) = raw_bounds(range);
        let mut stmt = self.conn.prepare(
            "SELECT d.id, d.timestamp, e.name FROM detections d \
             LEFT JOIN equipment e ON d.equipment_id = e.id \
             WHERE (?1 IS NULL OR d.timestamp >= ?1) AND (?2 IS NULL OR d.timestamp <= ?2) \
             ORDER BY d.timestamp DESC, d.id DESC LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt
            .query_map(params![start, end, limit, offset as i64], |row| {
                Ok(DetectionRow {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    equipment: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("query detections page")?;
        Ok(rows)
    }

    /// Row count for the same (unbounded when open) range as `detections_page`.
    pub fn detections_count(&self, range: &TimeRange) -> Result<u64> {
        let (start, end) = raw_bounds(range);
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM detections \
             WHERE (?1 IS NULL OR timestamp >= ?1) AND (?2 IS NULL OR timestamp <= ?2)",
            params![start, end],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Detections per day, labelled `DD-MM-YYYY`.
    pub fn daily_counts(&self, range: &TimeRange) -> Result<Vec<LabeledCount>> {
        let (start, end) = self.window(range);
        let mut stmt = self.conn.prepare(
            "SELECT strftime('%Y-%m-%d', timestamp) AS day, COUNT(*) FROM detections \
             WHERE timestamp >= ?1 AND timestamp <= ?2 GROUP BY day ORDER BY day",
        )?;
        let raw = stmt
            .query_map(params![start, end], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter()
            .map(|(day, count)| {
                let date = NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                    .with_context(|| format!("parse day '{}'", day))?;
                Ok(LabeledCount {
                    label: date.format("%d-%m-%Y").to_string(),
                    count: count.max(0) as u64,
                })
            })
            .collect()
    }

    /// Detections per month, labelled `MMM/YY`. An open range covers the current
    /// month and the eleven before it.
    pub fn monthly_counts(&self, range: &TimeRange) -> Result<Vec<LabeledCount>> {
        let (start, end) = if range.is_open() {
            let first = months_back(self.now.date(), DEFAULT_MONTHS - 1)?;
            (first.and_time(NaiveTime::MIN), self.now)
        } else {
            range.or_last_days(self.now, DEFAULT_WINDOW_DAYS)
        };
        let mut stmt = self.conn.prepare(
            "SELECT strftime('%Y', timestamp) AS year, strftime('%m', timestamp) AS month, \
             COUNT(*) FROM detections WHERE timestamp >= ?1 AND timestamp <= ?2 \
             GROUP BY year, month ORDER BY year, month",
        )?;
        let raw = stmt
            .query_map(
                params![format_timestamp(&start), format_timestamp(&end)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter()
            .map(|(year, month, count)| {
                let index: usize = month
                    .parse::<usize>()
                    .ok()
                    .filter(|m| (1..=12).contains(m))
                    .ok_or_else(|| anyhow!("invalid month '{}'", month))?;
                let short_year = year.get(2..).unwrap_or(&year);
                Ok(LabeledCount {
                    label: format!("{}/{}", MONTHS[index - 1], short_year),
                    count: count.max(0) as u64,
                })
            })
            .collect()
    }

    /// Violation rows per equipment name, most frequent first.
    pub fn equipment_counts(&self, range: &TimeRange) -> Result<Vec<LabeledCount>> {
        let (start, end) = self.window(range);
        let mut stmt = self.conn.prepare(
            "SELECT e.name, COUNT(*) AS n FROM detections d \
             JOIN equipment e ON d.equipment_id = e.id \
             WHERE d.timestamp >= ?1 AND d.timestamp <= ?2 \
             GROUP BY e.name ORDER BY n DESC, e.name ASC",
        )?;
        let rows = stmt
            .query_map(params![start, end], |row| {
                Ok(LabeledCount {
                    label: row.get(0)?,
                    count: row.get::<_, i64>(1)?.max(0) as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn most_common_missing(&self, range: &TimeRange) -> Result<String> {
        Ok(self
            .equipment_counts(range)?
            .into_iter()
            .next()
            .map(|c| c.label)
            .unwrap_or_else(|| NO_VIOLATIONS_LABEL.to_string()))
    }

    /// All rows in the window, violations or not.
    pub fn total_count(&self, range: &TimeRange) -> Result<u64> {
        let (start, end) = self.window(range);
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM detections WHERE timestamp >= ?1 AND timestamp <= ?2",
            params![start, end],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// All-time number of violation rows. Not windowed.
    pub fn total_violations(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM detections d JOIN equipment e ON d.equipment_id = e.id",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Share of rows without an equipment link, in percent. An open range covers
    /// every row.
    pub fn compliance_rate(&self, range: &TimeRange) -> Result<f64> {
        let (start, end) = raw_bounds(range);
        let (total, violations): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COUNT(equipment_id) FROM detections \
             WHERE (?1 IS NULL OR timestamp >= ?1) AND (?2 IS NULL OR timestamp <= ?2)",
            params![start, end],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(compliance_percentage(
            total.max(0) as u64,
            violations.max(0) as u64,
        ))
    }

    /// Change in violations for `name` against the preceding period of equal
    /// length (in whole days, at least one).
    pub fn equipment_trend(&self, name: &str, range: &TimeRange) -> Result<f64> {
        let (start, end) = range.or_last_days(self.now, DEFAULT_WINDOW_DAYS);
        let days = (end - start).num_days().max(1);
        let previous_start = start - Duration::days(days);

        let current: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM detections d JOIN equipment e ON d.equipment_id = e.id \
             WHERE e.name = ?1 AND d.timestamp >= ?2 AND d.timestamp <= ?3",
            params![name, format_timestamp(&start), format_timestamp(&end)],
            |row| row.get(0),
        )?;
        let previous: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM detections d JOIN equipment e ON d.equipment_id = e.id \
             WHERE e.name = ?1 AND d.timestamp >= ?2 AND d.timestamp < ?3",
            params![name, format_timestamp(&previous_start), format_timestamp(&start)],
            |row| row.get(0),
        )?;
        Ok(trend_percentage(current.max(0) as u64, previous.max(0) as u64))
    }

    /// Per-equipment count, share of all violations in the window, and trend.
    pub fn equipment_summary(&self, range: &TimeRange) -> Result<Vec<EquipmentSummary>> {
        let counts = self.equipment_counts(range)?;
        let total: u64 = counts.iter().map(|c| c.count).sum();
        counts
            .into_iter()
            .map(|c| {
                let percentage = if total > 0 {
                    round1(c.count as f64 / total as f64 * 100.0)
                } else {
                    0.0
                };
                Ok(EquipmentSummary {
                    trend: self.equipment_trend(&c.label, range)?,
                    name: c.label,
                    count: c.count,
                    percentage,
                })
            })
            .collect()
    }

    pub fn summary(&self, range: &TimeRange) -> Result<DashboardSummary> {
        Ok(DashboardSummary {
            total_detections: self.total_count(range)?,
            total_violations: self.total_violations()?,
            compliance_rate: round1(self.compliance_rate(range)?),
            most_common_missing: self.most_common_missing(range)?,
            daily: self.daily_counts(range)?,
            monthly: self.monthly_counts(range)?,
            equipment: self.equipment_summary(range)?,
        })
    }

    /// Encoded evidence frame for a detection row.
    pub fn frame_by_id(&self, id: i64) -> Result<Option<Vec<u8>>> {
        let blob = self
            .conn
            .query_row(
                "SELECT frame_data FROM detections WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob)
    }
}

fn raw_bounds(range: &TimeRange) -> (Option<String>, Option<String>) {
    (
        range.start.as_ref().map(format_timestamp),
        range.end.as_ref().map(format_timestamp),
    )
}

/// First day of the month `months` before the month of `date`.
fn months_back(date: NaiveDate, months: u32) -> Result<NaiveDate> {
    let total = date.year() * 12 + date.month0() as i32 - months as i32;
    NaiveDate::from_ymd_opt(total.div_euclid(12), total.rem_euclid(12) as u32 + 1, 1)
        .ok_or_else(|| anyhow!("month arithmetic out of range"))
}

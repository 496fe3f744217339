use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::messages::PresenceReport;

const DAY_START_MINUTE: u32 = 7 * 60;
const DAY_END_MINUTE: u32 = 17 * 60;
const SLOT_MINUTES: usize = 5;

/// `07:00`, `07:05`, ... `17:00`.
pub fn timeline_slots() -> Vec<String> {
    (DAY_START_MINUTE..=DAY_END_MINUTE)
        .step_by(SLOT_MINUTES)
        .map(|minute| format!("{:02}:{:02}", minute / 60, minute % 60))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPresence {
    Alone,
    Accompanied,
    NoData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTimeline {
    pub device_id: String,
    /// One cell per entry of [`timeline_slots`]
    pub cells: Vec<SlotPresence>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub device_id: String,
    pub total: usize,
    pub alone: usize,
    pub alone_percent: usize,
}

/// Reports inside the school day, grouped by device.
fn group_by_device(reports: &[PresenceReport]) -> BTreeMap<String, Vec<PresenceReport>> {
    let slots = timeline_slots();
    let mut grouped: BTreeMap<String, Vec<PresenceReport>> = BTreeMap::new();
    for report in reports {
        let time = report.time.trim();
        if !slots.iter().any(|slot| slot == time) {
            continue;
        }
        let mut report = report.clone();
        report.time = time.to_string();
        grouped
            .entry(report.device_id.clone())
            .or_default()
            .push(report);
    }
    grouped
}

pub fn build_timelines(reports: &[PresenceReport]) -> Vec<DeviceTimeline> {
    let slots = timeline_slots();
    group_by_device(reports)
        .into_iter()
        .map(|(device_id, reports)| {
            let cells = slots
                .iter()
                .map(|slot| match reports.iter().find(|r| &r.time == slot) {
                    Some(r) if r.is_alone => SlotPresence::Alone,
                    Some(_) => SlotPresence::Accompanied,
                    None => SlotPresence::NoData,
                })
                .collect();
            DeviceTimeline { device_id, cells }
        })
        .collect()
}

pub fn summarize(reports: &[PresenceReport]) -> Vec<DeviceSummary> {
    group_by_device(reports)
        .into_iter()
        .map(|(device_id, reports)| {
            let total = reports.len();
            let alone = reports.iter().filter(|r| r.is_alone).count();
            let alone_percent = if total > 0 { alone * 100 / total } else { 0 };
            DeviceSummary {
                device_id,
                total,
                alone,
                alone_percent,
            }
        })
        .collect()
}

/// Plain-text timeline (`#` alone, `+` accompanied, `.` no data) and summary table.
pub fn render(reports: &[PresenceReport]) -> String {
    let mut out = String::new();
    for timeline in build_timelines(reports) {
        let row: String = timeline
            .cells
            .iter()
            .map(|cell| match cell {
                SlotPresence::Alone => '#',
                SlotPresence::Accompanied => '+',
                SlotPresence::NoData => '.',
            })
            .collect();
        let _ = writeln!(out, "{:<10} {}", timeline.device_id, row);
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "{:<10} {:>8} {:>6} {:>6}", "Device", "Alone %", "Total", "Alone");
    for summary in summarize(reports) {
        let _ = writeln!(
            out,
            "{:<10} {:>7}% {:>6} {:>6}",
            summary.device_id, summary.alone_percent, summary.total, summary.alone
        );
    }
    out
}

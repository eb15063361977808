use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime};

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

pub(crate) const DAY_MS: Ms = 86_400_000;
const HOUR_MS: Ms = 3_600_000;
const MINUTE_MS: Ms = 60_000;

/// Start of the UTC day containing `t`.
pub(crate) fn day_start_ms(t: Ms) -> Ms {
    t - t.rem_euclid(DAY_MS)
}

/// Calendar date of `t`, UTC. None only for instants outside chrono's
/// representable range, which validated inputs never reach.
pub(crate) fn date_for(t: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(t).map(|dt| dt.date_naive())
}

/// Midnight UTC of `date`, in epoch milliseconds.
pub(crate) fn date_to_ms(date: NaiveDate) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// Blocked spans intersecting `window`, clamped to it, merged into
/// disjoint sorted spans. The snapshot everything else here works from.
pub(crate) fn blocked_spans_within(cal: &Calendar, window: &Span) -> Vec<Span> {
    let mut blocked: Vec<Span> = cal
        .overlapping(window)
        .map(|b| Span::new(b.span.start.max(window.start), b.span.end.min(window.end)))
        .filter(|s| s.start < s.end)
        .collect();
    blocked.sort_by_key(|s| s.start);
    merge_overlapping(&blocked)
}

/// Free spans: the window minus its blocked spans. `min_duration`
/// drops gaps too short to be useful to a caller.
pub(crate) fn free_spans_within(
    cal: &Calendar,
    window: &Span,
    min_duration: Option<Ms>,
) -> Vec<Span> {
    let blocked = blocked_spans_within(cal, window);
    let mut free = subtract_intervals(&[*window], &blocked);
    if let Some(min) = min_duration {
        free.retain(|s| s.duration_ms() >= min);
    }
    free
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

// ── Day-granularity availability ──────────────────────────────────

/// Lazy per-day availability over a fixed snapshot.
///
/// One element per UTC day whose midnight falls before the window end,
/// starting at the day containing the window start. A day is
/// unavailable if ANY blocked instant touches it — deliberately
/// conservative for calendar display. Half-open spans hold at day
/// granularity too: a block ending exactly at midnight leaves the next
/// day untouched.
///
/// The snapshot is immutable; `Clone` (or `restart`) re-iterates from
/// the first day.
#[derive(Debug, Clone)]
pub struct DayAvailability {
    blocked: Arc<[Span]>,
    window_end: Ms,
    first_day_start: Ms,
    first_date: NaiveDate,
    cursor_start: Ms,
    cursor_date: NaiveDate,
    idx: usize,
}

impl DayAvailability {
    pub(crate) fn new(blocked: Vec<Span>, window: &Span, first_date: NaiveDate) -> Self {
        let first_day_start = day_start_ms(window.start);
        Self {
            blocked: blocked.into(),
            window_end: window.end,
            first_day_start,
            first_date,
            cursor_start: first_day_start,
            cursor_date: first_date,
            idx: 0,
        }
    }

    /// Fresh iterator over the same snapshot, positioned at the first day.
    pub fn restart(&self) -> Self {
        Self {
            blocked: Arc::clone(&self.blocked),
            window_end: self.window_end,
            first_day_start: self.first_day_start,
            first_date: self.first_date,
            cursor_start: self.first_day_start,
            cursor_date: self.first_date,
            idx: 0,
        }
    }
}

impl Iterator for DayAvailability {
    type Item = AvailabilityDay;

    fn next(&mut self) -> Option<AvailabilityDay> {
        if self.cursor_start >= self.window_end {
            return None;
        }
        let day_end = self.cursor_start + DAY_MS;

        // Blocked spans are sorted+disjoint; skip the ones fully behind us.
        while self.idx < self.blocked.len() && self.blocked[self.idx].end <= self.cursor_start {
            self.idx += 1;
        }
        let touched =
            self.idx < self.blocked.len() && self.blocked[self.idx].start < day_end;

        let day = AvailabilityDay {
            date: self.cursor_date,
            available: !touched,
        };
        self.cursor_start = day_end;
        self.cursor_date = self.cursor_date.succ_opt()?;
        Some(day)
    }
}

// ── Day slots ─────────────────────────────────────────────────────

/// Slot grid parameters. Defaults mirror the marketplace UI: 60-minute
/// slots across 09:00–21:00 UTC.
#[derive(Debug, Clone, Copy)]
pub struct SlotOptions {
    pub slot_minutes: i64,
    pub open_hour: u32,
    pub close_hour: u32,
}

impl Default for SlotOptions {
    fn default() -> Self {
        Self { slot_minutes: 60, open_hour: 9, close_hour: 21 }
    }
}

/// Cut one day's working hours into fixed slots; a slot is available
/// iff it is free on the calendar and has not already started by `now`.
pub(crate) fn slots_for_day(
    cal: &Calendar,
    date: NaiveDate,
    opts: &SlotOptions,
    now: Ms,
) -> Vec<DaySlot> {
    let day_base = date_to_ms(date);
    let open = day_base + (opts.open_hour as Ms) * HOUR_MS;
    let close = day_base + (opts.close_hour as Ms) * HOUR_MS;
    let slot_ms = opts.slot_minutes.max(1) * MINUTE_MS;

    let blocked = blocked_spans_within(cal, &Span::new(open, close));

    let mut slots = Vec::new();
    let mut idx = 0;
    let mut start = open;
    while start + slot_ms <= close {
        let span = Span::new(start, start + slot_ms);
        while idx < blocked.len() && blocked[idx].end <= span.start {
            idx += 1;
        }
        let free = !(idx < blocked.len() && blocked[idx].start < span.end);
        slots.push(DaySlot { span, available: free && span.start >= now });
        start += slot_ms;
    }
    slots
}

use crate::limits::{MS_PER_DAY, MS_PER_MINUTE};
use crate::model::*;

// ── Free-window computation ──────────────────────────────────────
//
// Read-side complement of the conflict check: the windows in which a
// booking for this staff member would be accepted. Base availability
// comes from the salon's operating hours; salon blocks, staff blocks,
// approved time-off, and slot-holding appointments are subtracted.

pub fn free_windows(salon: &SalonState, calendar: &StaffCalendar, query: &Span) -> Vec<Span> {
    let mut open = open_spans(salon, query);
    if open.is_empty() {
        return open;
    }

    let mut busy: Vec<Span> = Vec::new();
    busy.extend(
        salon
            .blocks
            .iter()
            .filter(|b| b.span.overlaps(query))
            .map(|b| b.span),
    );
    busy.extend(
        calendar
            .blocks
            .iter()
            .filter(|b| b.span.overlaps(query))
            .map(|b| b.span),
    );
    busy.extend(
        calendar
            .time_off
            .iter()
            .filter(|r| r.status == TimeOffStatus::Approved && r.span.overlaps(query))
            .map(|r| r.span),
    );
    busy.extend(
        calendar
            .overlapping_appointments(query)
            .filter(|a| a.status.holds_slot())
            .map(|a| a.span),
    );

    if busy.is_empty() {
        return open;
    }
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);
    open = subtract_intervals(&open, &busy);
    open
}

/// Per-day open windows from the salon's hours table, clamped to the
/// query. A weekday with no row is fully open; a `closed` row
/// contributes nothing.
fn open_spans(salon: &SalonState, query: &Span) -> Vec<Span> {
    let mut out = Vec::new();
    let mut day_start = query.start - query.start.rem_euclid(MS_PER_DAY);
    while day_start < query.end {
        let window = match salon.hours_for(weekday_of(day_start)) {
            None => Some(Span::new(day_start, day_start + MS_PER_DAY)),
            Some(h) if h.closed => None,
            Some(h) => Some(Span::new(
                day_start + h.open_min as Ms * MS_PER_MINUTE,
                day_start + h.close_min as Ms * MS_PER_MINUTE,
            )),
        };
        if let Some(w) = window {
            let clamped_start = w.start.max(query.start);
            let clamped_end = w.end.min(query.end);
            if clamped_start < clamped_end {
                out.push(Span::new(clamped_start, clamped_end));
            }
        }
        day_start += MS_PER_DAY;
    }
    // Adjacent fully-open days merge into one window.
    merge_overlapping(&out)
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

/// Subtract `to_remove` (sorted by start) from each base interval.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}

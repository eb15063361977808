use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{self, DayAvailability, SlotOptions, DAY_MS};
use super::overlap::{is_free, now_ms, validate_window};
use super::{Engine, EngineError};

impl Engine {
    /// Blocks for a resource, ascending by start. With bounds, only
    /// blocks intersecting the half-open window; each bound is optional
    /// independently ("everything from today onward" is a real query).
    pub async fn list_blocks(
        &self,
        resource_id: Ulid,
        range_start: Option<Ms>,
        range_end: Option<Ms>,
    ) -> Result<Vec<Block>, EngineError> {
        if let (Some(s), Some(e)) = (range_start, range_end)
            && s >= e
        {
            return Err(EngineError::Validation("range start must be before end"));
        }
        let Some(cal) = self.get_calendar(&resource_id) else {
            return Ok(Vec::new());
        };
        let guard = cal.read().await;
        let query = Span::new(range_start.unwrap_or(Ms::MIN), range_end.unwrap_or(Ms::MAX));
        Ok(guard.overlapping(&query).cloned().collect())
    }

    /// The blocks a booking currently owns, across resources, ascending
    /// by start.
    pub async fn blocks_for_booking(&self, booking_ref: Ulid) -> Vec<Block> {
        let mut out = Vec::new();
        for block_id in self.store.blocks_for_booking(&booking_ref) {
            if let Some(rid) = self.store.resource_for_block(&block_id)
                && let Some(cal) = self.get_calendar(&rid)
            {
                let guard = cal.read().await;
                if let Some(b) = guard.find(block_id) {
                    out.push(b.clone());
                }
            }
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        out
    }

    /// True iff no block touches `span`. Unknown resources are fully free.
    pub async fn is_range_free(&self, resource_id: Ulid, span: Span) -> Result<bool, EngineError> {
        validate_window(&span)?;
        let Some(cal) = self.get_calendar(&resource_id) else {
            return Ok(true);
        };
        let guard = cal.read().await;
        Ok(is_free(&guard, &span))
    }

    /// Day-granularity availability for every UTC day the window touches.
    ///
    /// The returned iterator owns an immutable snapshot: it never holds a
    /// lock, re-iterates via `restart`/`Clone`, and prices each day
    /// conservatively (any blocked instant in the day marks it
    /// unavailable, wherever in the day it falls).
    pub async fn day_availability(
        &self,
        resource_id: Ulid,
        window: Span,
    ) -> Result<DayAvailability, EngineError> {
        validate_window(&window)?;
        let first_day_start = availability::day_start_ms(window.start);
        let first_date = availability::date_for(first_day_start)
            .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;

        // Whole-day snapshot: edge days count blocks outside the window
        // but inside the day.
        let snapshot = Span::new(
            first_day_start,
            availability::day_start_ms(window.end - 1) + DAY_MS,
        );
        let blocked = match self.get_calendar(&resource_id) {
            Some(cal) => {
                let guard = cal.read().await;
                availability::blocked_spans_within(&guard, &snapshot)
            }
            None => Vec::new(),
        };
        Ok(DayAvailability::new(blocked, &window, first_date))
    }

    /// Free gaps inside the window, merged and ordered; `min_duration`
    /// drops gaps too short to book.
    pub async fn free_ranges(
        &self,
        resource_id: Ulid,
        window: Span,
        min_duration: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        validate_window(&window)?;
        let Some(cal) = self.get_calendar(&resource_id) else {
            return Ok(availability::free_spans_within(
                &Calendar::new(resource_id),
                &window,
                min_duration,
            ));
        };
        let guard = cal.read().await;
        Ok(availability::free_spans_within(&guard, &window, min_duration))
    }

    /// One day cut into bookable slots. Slots already started by the
    /// wall clock report unavailable.
    pub async fn slots_for_day(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        opts: SlotOptions,
    ) -> Result<Vec<DaySlot>, EngineError> {
        if opts.slot_minutes <= 0 {
            return Err(EngineError::Validation("slot minutes must be positive"));
        }
        if opts.open_hour >= opts.close_hour || opts.close_hour > 24 {
            return Err(EngineError::Validation("invalid working hours"));
        }
        let day_base = availability::date_to_ms(date);
        if day_base < MIN_VALID_TIMESTAMP_MS || day_base + DAY_MS > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }

        let now = now_ms();
        match self.get_calendar(&resource_id) {
            Some(cal) => {
                let guard = cal.read().await;
                Ok(availability::slots_for_day(&guard, date, &opts, now))
            }
            None => Ok(availability::slots_for_day(
                &Calendar::new(resource_id),
                date,
                &opts,
                now,
            )),
        }
    }
}

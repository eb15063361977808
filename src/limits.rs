//! Hard caps enforced before any lock or WAL write.

use crate::model::Ms;

/// Timestamps must be at or after the Unix epoch.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// Timestamps must fall before 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single block may cover at most 366 days.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 60 * 60 * 1000;

/// Availability queries may scan at most 366 days.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 60 * 60 * 1000;

/// Per-calendar block cap. Expected scale is low thousands.
pub const MAX_BLOCKS_PER_RESOURCE: usize = 10_000;

/// Free-text notes cap, in bytes.
pub const MAX_NOTES_LEN: usize = 1_000;

/// Calendars lazily materialized per tenant.
pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;

/// Tenant (pgwire database) name length cap.
pub const MAX_TENANT_NAME_LEN: usize = 256;

/// Concurrently open tenants per process.
pub const MAX_TENANTS: usize = 256;

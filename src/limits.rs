use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_EVENTS_PER_TENANT: usize = 100_000;
pub const MAX_RESOURCES_PER_TENANT: usize = 10_000;
pub const MAX_ALLOCATIONS_PER_TENANT: usize = 500_000;

pub const MAX_TITLE_LEN: usize = 120;
pub const MAX_NAME_LEN: usize = 120;
pub const MAX_KIND_LEN: usize = 80;
pub const MAX_DESCRIPTION_LEN: usize = 10_000;

pub const MAX_BATCH_SIZE: usize = 1000;

/// 1970-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// 366 days
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

/// Number of events shown on the dashboard.
pub const UPCOMING_EVENTS: usize = 5;

use crate::model::Ms;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ROOMS_PER_TENANT: usize = 10_000;
pub const MAX_WORKSTATIONS_PER_TENANT: usize = 100_000;

/// Upper bound on a single workgroup window (one week).
pub const MAX_DURATION_MINUTES: i64 = 7 * 24 * 60;
pub const MAX_WORKSTATIONS_PER_WORKGROUP: usize = 512;
pub const MAX_APPLICATIONS_PER_WORKGROUP: usize = 64;

pub const DEFAULT_HISTORY_COUNT: usize = 5;
pub const MAX_HISTORY_COUNT: usize = 500;

/// Heartbeats are rejected outside [2000-01-01, 2100-01-01).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

//! Hard caps. Every limit failure surfaces as `EngineError::LimitExceeded`.

pub const MAX_LOTS_PER_TENANT: usize = 10_000;
pub const MAX_SPOTS_PER_TENANT: usize = 100_000;
pub const MAX_USERS_PER_TENANT: usize = 100_000;
pub const MAX_RESERVATIONS_PER_SPOT: usize = 10_000;

/// Timestamps must be non-negative and before year 2100.
pub const MIN_VALID_TIMESTAMP_MS: i64 = 0;
pub const MAX_VALID_TIMESTAMP_MS: i64 = 4_102_444_800_000;

/// A single reservation may span at most 30 days.
pub const MAX_WINDOW_DURATION_MS: i64 = 30 * 24 * 3_600_000;

/// Availability queries may span at most one year.
pub const MAX_QUERY_WINDOW_MS: i64 = 366 * 24 * 3_600_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ADDRESS_LEN: usize = 512;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_SPOT_NUMBER_LEN: usize = 32;
pub const MAX_PHONE_LEN: usize = 32;

pub const MAX_PAGE_LIMIT: usize = 500;

pub const MAX_TENANT_NAME_LEN: usize = 256;
pub const MAX_TENANTS: usize = 1024;

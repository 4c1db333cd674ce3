use crate::model::Ms;

pub const MS_PER_MINUTE: Ms = 60_000;
pub const MS_PER_DAY: Ms = 86_400_000;

/// Sanity bounds on any timestamp accepted from a caller.
/// 2020-01-01 .. 2100-01-01 in unix millis.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 1_577_836_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// How far ahead a booking may be placed.
pub const MAX_ADVANCE_MS: Ms = 90 * MS_PER_DAY;

/// Longest single time-off request.
pub const MAX_TIME_OFF_SPAN_MS: Ms = 90 * MS_PER_DAY;

/// Reasons (request, rejection, cancellation) must carry this many chars.
pub const MIN_REASON_LEN: usize = 10;

/// Service duration when the service row does not specify one.
pub const DEFAULT_SERVICE_DURATION_MIN: u32 = 60;

/// Confirmation-code generation attempts before the booking fails.
pub const CODE_RETRY_LIMIT: usize = 5;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_PATTERN_LEN: usize = 512;

/// Caps on per-aggregate growth; breach is an operational error, not a
/// business rule.
pub const MAX_SALONS: usize = 10_000;
pub const MAX_STAFF_PER_SALON: usize = 1_000;
pub const MAX_SERVICES_PER_SALON: usize = 1_000;
pub const MAX_INTERVALS_PER_CALENDAR: usize = 100_000;
pub const MAX_BLOCKS_PER_SALON: usize = 10_000;

/// Widest availability query window.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * MS_PER_DAY;

use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// One year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_PAGE_SIZE: i64 = 1_000;
pub const DEFAULT_PAGE_SIZE: i64 = 10;

pub const MAX_COMMENT_LEN: usize = 2_000;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 2_000;
pub const MAX_EMAIL_LEN: usize = 512;

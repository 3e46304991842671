use crate::model::Ms;

/// Fixed reschedule budget per booking.
pub const MAX_RESCHEDULES: u32 = 3;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 64;

pub const MAX_BOOKINGS_PER_TENANT: usize = 1_000_000;
pub const MAX_EVENT_TYPES_PER_HOST: usize = 256;

pub const MAX_SLUG_LEN: usize = 64;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_CALENDARS_PER_PROFILE: usize = 16;
pub const MAX_CALENDAR_ID_LEN: usize = 256;
pub const MAX_REMINDERS: usize = 8;
pub const MAX_BLOCKS_PER_DAY: usize = 24;

pub const MAX_SLOT_MINUTES: u32 = 24 * 60;
pub const MAX_BUFFER_MINUTES: u32 = 24 * 60;
/// 90 days.
pub const MAX_NOTICE_MINUTES: u32 = 90 * 24 * 60;

/// 1970-01-01.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
/// A single booking may not exceed one day.
pub const MAX_BOOKING_DURATION_MS: Ms = 24 * 3_600_000;

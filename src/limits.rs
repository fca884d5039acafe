use crate::model::{DAY, Ms};

pub const MAX_PROPERTIES_PER_TENANT: usize = 100_000;
pub const MAX_USERS_PER_TENANT: usize = 1_000_000;
pub const MAX_LISTINGS_PER_PROPERTY: usize = 10_000;
pub const MAX_RENTALS_PER_PROPERTY: usize = 10_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 4096;
pub const MAX_UID_LEN: usize = 256;
pub const MAX_TOKEN_LEN: usize = 4096;
pub const MAX_FRIENDS: usize = 50;

/// Year 2000.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// Year 2200.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
pub const MAX_SPAN_DURATION_MS: Ms = 3 * 366 * DAY;

/// `SELECT * FROM wigwams` without a filter.
pub const DEFAULT_PROPERTY_PAGE: usize = 20;
/// `SELECT * FROM listings` / `rentals` without a filter.
pub const RECENT_EVENTS: usize = 10;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 64;

/// Pending social calls per tenant before new ones are dropped.
pub const SOCIAL_QUEUE_CAPACITY: usize = 1024;

//! Hard bounds on input sizes and business ranges.

/// Smallest party the form accepts.
pub const MIN_GUESTS: u32 = 1;
/// Largest party the form accepts.
pub const MAX_GUESTS: u32 = 40;

pub const MIN_TABLE_CAPACITY: u32 = 2;
pub const MAX_TABLE_CAPACITY: u32 = 6;

/// Every booking occupies its tables for two hours.
pub const BOOKING_DURATION_SECS: u32 = 2 * 60 * 60;

/// Start times are offered on a 30-minute grid.
pub const SLOT_STEP_MINUTES: u32 = 30;

pub const MAX_NAME_LEN: usize = 50;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_PHONE_LEN: usize = 20;
pub const MAX_COMMENTS_LEN: usize = 2000;
pub const MAX_MESSAGE_LEN: usize = 5000;
/// Sender name on the contact form.
pub const MAX_CONTACT_NAME_LEN: usize = 100;
pub const MAX_TITLE_LEN: usize = 100;
pub const MAX_IMAGE_PATH_LEN: usize = 255;
pub const MAX_CUSTOMER_ID_LEN: usize = 128;

pub const MAX_TABLES: usize = 500;
pub const MAX_BOOKINGS_PER_DAY: usize = 10_000;
pub const MAX_COVER_IMAGES: usize = 100;

/// Highest `$N` placeholder a console statement may use.
pub const MAX_PARAMS: usize = 16;

/// How far ahead a booking may be placed.
pub const MAX_DAYS_AHEAD: i64 = 366;

/// Reservations per page in the admin listing.
pub const ADMIN_PAGE_SIZE: usize = 10;

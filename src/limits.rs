//! Hard caps on user-supplied data.

pub const MAX_FIELDS: usize = 1_000;
pub const MAX_USERS: usize = 1_000_000;
pub const MAX_MESSAGES: usize = 100_000;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_PHONE_LEN: usize = 40;
pub const MAX_PASSWORD_LEN: usize = 1_024;
pub const MAX_TEXT_LEN: usize = 500;
pub const MAX_MESSAGE_BODY_LEN: usize = 10_000;
pub const MAX_HOUR_WINDOWS: usize = 24;

/// Listeners on a connection; there is only one channel today.
pub const MAX_LISTEN_CHANNELS: usize = 8;

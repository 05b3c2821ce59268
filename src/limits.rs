//! Hard limits enforced by the engine and the SQL front end.

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_INVITEES_PER_MEETING: usize = 512;
pub const MAX_ORGANIZATIONS: usize = 10_000;
pub const MAX_USERS: usize = 1_000_000;
pub const MAX_EVENTS: usize = 1_000_000;
pub const MAX_MEETINGS: usize = 10_000_000;
pub const MAX_PARTICIPANTS_PER_EVENT: usize = 100_000;
pub const MAX_MEETINGS_PER_USER: usize = 100_000;

// Codes 126 & 127 are traditionally reserved for shells
// so we use higher codes. Windows and POSIX both support
// i32 exit statuses.
//
// - https://pubs.opengroup.org/onlinepubs/9699919799/utilities/V3_chap02.html#tag_18_08_02

/// The configuration file is missing, unreadable or names no usable target.
pub const CONFIG_PROBLEM: i32 = 150;

pub const MIGRATION_DIR_PROBLEM: i32 = 151;

/// No driver for the scheme, or the target could not be reached.
pub const CONNECTION_PROBLEM: i32 = 152;

/// At least one migration reported errors.
pub const MIGRATION_FAILED: i32 = 153;

/// The engine could not run a migration at all (missing down script,
/// unknown version, a driver that panicked).
pub const DISPATCH_PROBLEM: i32 = 154;

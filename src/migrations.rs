use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// See https://docs.rs/chrono/0.4/chrono/format/strftime/index.html
// Generated migrations are stamped with this, which keeps them ordered
// numerically as well as lexically.
pub static FORMAT_STR: &str = "%Y%m%d%H%M%S";

/// Ordered identifier of a migration. Comparison is numeric, so `9` sorts
/// before `10` and `1` before `20170118205923` whatever the file names say.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u64);

impl Version {
    pub const fn new(v: u64) -> Self {
        Version(v)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for Version {
    fn from(v: u64) -> Self {
        Version(v)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{input:?} is not a valid migration version")]
pub struct ParseVersionError {
    input: String,
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // u64::from_str accepts a leading '+', versions do not.
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseVersionError {
                input: s.to_string(),
            });
        }
        s.parse::<u64>()
            .map(Version)
            .map_err(|_| ParseVersionError {
                input: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// The spelling used in file names and in the bookkeeping table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{0:?} is neither up nor down")]
pub struct ParseDirectionError(String);

impl FromStr for Direction {
    type Err = ParseDirectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            _ => Err(ParseDirectionError(s.to_string())),
        }
    }
}

/// One change script. Built once by file discovery (or by hand), then moved
/// into exactly one [`crate::driver::Driver::migrate`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub path: PathBuf,
    pub file_name: String,
    pub version: Version,
    pub name: String,
    pub direction: Direction,
    pub content: Vec<u8>,
}

impl MigrationFile {
    /// Builds a record from a file name such as `001_foobar.up.sql`,
    /// returning `None` when the name does not follow the convention.
    pub fn from_file_name(
        path: PathBuf,
        file_name: &str,
        extension: &str,
        content: Vec<u8>,
    ) -> Option<MigrationFile> {
        let parsed = parse_file_name(file_name, extension)?;
        Some(MigrationFile {
            path,
            file_name: file_name.to_string(),
            version: parsed.version,
            name: parsed.name,
            direction: parsed.direction,
            content,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Parsed {
    pub version: Version,
    pub name: String,
    pub direction: Direction,
}

/// Parses `<version>_<name>.<up|down>.<extension>`.
pub fn parse_file_name(file_name: &str, extension: &str) -> Option<Parsed> {
    let stem = file_name
        .strip_suffix(extension)?
        .strip_suffix('.')?;
    let (head, direction) = stem.rsplit_once('.')?;
    let direction = direction.parse::<Direction>().ok()?;
    let (version, name) = head.split_once('_')?;
    let version = version.parse::<Version>().ok()?;
    Some(Parsed {
        version,
        name: name.to_string(),
        direction,
    })
}

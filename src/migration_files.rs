use crate::migrations::{Direction, MigrationFile, Version, FORMAT_STR};
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("migrations directory {0} does not exist or is not a directory")]
    NoSuchDirectory(PathBuf),

    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("directory traversal failed: {0}")]
    Walk(#[from] ignore::Error),

    #[error("{first} and {second} are both version {version} {direction}")]
    DuplicateMigration {
        version: Version,
        direction: Direction,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("{0} already exists, refusing to overwrite it")]
    AlreadyExists(PathBuf),
}

/// List all migrations in `dir` whose names follow
/// `<version>_<name>.<up|down>.<extension>`.
///
/// The walk is flat, sub-directories are not entered. Hidden files and
/// anything matched by git's ignore rules are skipped, as are files with
/// other names (a README, say).
///
/// The result is sorted by version and then direction, up first.
pub fn from_disk(dir: &Path, extension: &str) -> Result<Vec<MigrationFile>, Error> {
    if !dir.is_dir() {
        return Err(Error::NoSuchDirectory(dir.to_path_buf()));
    }

    let mut migrations: Vec<MigrationFile> = vec![];
    let mut seen: HashMap<(Version, Direction), PathBuf> = HashMap::new();

    for entry in ignore::WalkBuilder::new(dir).max_depth(Some(1)).build() {
        let entry = entry?;
        if !entry.file_type().map_or(false, |t| t.is_file()) {
            continue;
        }
        let path = entry.path();
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => {
                warn!("skipping {}, file name is not valid UTF-8", path.display());
                continue;
            }
        };
        if crate::migrations::parse_file_name(file_name, extension).is_none() {
            trace!("{} does not look like a migration", file_name);
            continue;
        }

        let content = fs::read(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let migration =
            match MigrationFile::from_file_name(path.to_path_buf(), file_name, extension, content) {
                Some(m) => m,
                None => continue,
            };

        if let Some(first) = seen.insert(
            (migration.version, migration.direction),
            migration.path.clone(),
        ) {
            return Err(Error::DuplicateMigration {
                version: migration.version,
                direction: migration.direction,
                first,
                second: migration.path,
            });
        }
        debug!("found migration {}", file_name);
        migrations.push(migration);
    }

    migrations.sort_by_key(|m| (m.version, m.direction));
    Ok(migrations)
}

/// Writes an empty up and down pair for `name` into `dir`, returning the
/// paths written. Without a `version` the current local time is used.
pub fn create(
    dir: &Path,
    name: &str,
    extension: &str,
    version: Option<Version>,
) -> Result<(PathBuf, PathBuf), Error> {
    if !dir.is_dir() {
        return Err(Error::NoSuchDirectory(dir.to_path_buf()));
    }
    let version = match version {
        Some(v) => v.to_string(),
        None => chrono::Local::now().format(FORMAT_STR).to_string(),
    };
    let stem = format!("{}_{}", version, inflections::case::to_snake_case(name));
    let up = dir.join(format!("{}.{}.{}", stem, Direction::Up, extension));
    let down = dir.join(format!("{}.{}.{}", stem, Direction::Down, extension));

    for path in [&up, &down] {
        if path.exists() {
            return Err(Error::AlreadyExists(path.clone()));
        }
    }
    for path in [&up, &down] {
        fs::write(path, "").map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;
    }
    info!("created {} and {}", up.display(), down.display());
    Ok((up, down))
}

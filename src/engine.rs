//! Decides which scripts to run and runs them, one at a time, through a
//! [`Driver`].

use crate::driver::{self, ConnectionDescriptor, Driver, MigrateError, Registry};
use crate::migrations::{Direction, MigrationFile, Version};
use crate::pipe::{pipe, Drained};
use colored::*;
use log::{debug, info, trace, warn};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Errors that stop the engine. A script that merely fails to apply is a
/// [`MigrationResult::Failure`] instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Driver(#[from] driver::Error),

    #[error("could not start a thread to apply {file_name}: {source}")]
    Dispatch {
        file_name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("driver panicked while applying {file_name}")]
    Panicked { file_name: String },

    #[error("version {version} needs a {direction} migration, none was found")]
    MissingMigration {
        version: Version,
        direction: Direction,
    },

    #[error("no migration with version {0}")]
    UnknownVersion(Version),
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum MigrationState {
    Pending,
    Applied,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            MigrationState::Pending => write!(f, "{}", "Pending".yellow()),
            MigrationState::Applied => write!(f, "{}", "Applied".green()),
        }
    }
}

#[derive(Debug)]
pub enum MigrationResult {
    Success,
    Failure { errors: Vec<MigrateError> },
    SkippedDueToEarlierError,
    Cancelled,
}

impl MigrationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, MigrationResult::Success)
    }
}

impl fmt::Display for MigrationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            MigrationResult::Success => write!(f, "{}", "Success".green()),
            MigrationResult::Failure { errors } => {
                let reasons: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                write!(f, "{} {}", "Failure".red(), reasons.join("; "))
            }
            MigrationResult::SkippedDueToEarlierError => {
                write!(f, "{}", "Skipped due to earlier error".yellow())
            }
            MigrationResult::Cancelled => write!(f, "{}", "Cancelled".yellow()),
        }
    }
}

pub type MigrationStateTuple = (MigrationState, MigrationFile);
pub type MigrationResultTuple = (MigrationResult, MigrationFile);

/// Stops an [`Engine`] before its next dispatch. A migration already
/// running is not interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        debug!("cancellation requested");
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Engine {
    driver: Box<dyn Driver>,
    target: ConnectionDescriptor,
    cancel: CancelHandle,
}

impl Engine {
    /// Takes an uninitialized driver and initializes it against `target`.
    pub fn new(mut driver: Box<dyn Driver>, target: &ConnectionDescriptor) -> Result<Self, Error> {
        driver.initialize(target)?;
        Ok(Engine {
            driver,
            target: target.clone(),
            cancel: CancelHandle::default(),
        })
    }

    pub fn connect(registry: &Registry, target: &ConnectionDescriptor) -> Result<Self, Error> {
        Engine::new(registry.driver_for(target)?, target)
    }

    pub fn target(&self) -> &ConnectionDescriptor {
        &self.target
    }

    pub fn filename_extension(&self) -> &'static str {
        self.driver.filename_extension()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Runs a single script on its own thread and collects everything it
    /// reported. Failures of the script itself are in the returned
    /// [`Drained`], only a driver that could not be run or that panicked is
    /// an `Err`.
    pub fn dispatch(&mut self, file: MigrationFile) -> Result<Drained, Error> {
        let file_name = file.file_name.clone();
        let (writer, reader) = pipe();
        let driver = &mut self.driver;
        thread::scope(|s| -> Result<Drained, Error> {
            let handle = thread::Builder::new()
                .name(format!("migrate {}", file_name))
                .spawn_scoped(s, move || driver.migrate(file, writer))
                .map_err(|source| Error::Dispatch {
                    file_name: file_name.clone(),
                    source,
                })?;
            let drained = reader.drain_with(|p| trace!("{}: {:?}", file_name, p));
            handle.join().map_err(|_| Error::Panicked {
                file_name: file_name.clone(),
            })?;
            Ok(drained)
        })
    }

    pub fn applied(&mut self) -> Result<BTreeSet<Version>, Error> {
        Ok(self.driver.versions()?.into_iter().collect())
    }

    pub fn version(&mut self) -> Result<Option<Version>, Error> {
        Ok(self.driver.version()?)
    }

    /// Every up migration, in version order, with whether it is applied.
    pub fn diff(&mut self, files: &[MigrationFile]) -> Result<Vec<MigrationStateTuple>, Error> {
        let applied = self.applied()?;
        Ok(ups(files)
            .into_iter()
            .map(|f| {
                let state = if applied.contains(&f.version) {
                    MigrationState::Applied
                } else {
                    MigrationState::Pending
                };
                (state, f)
            })
            .collect())
    }

    /// Applies pending migrations up to and including `to`, or all of them.
    pub fn up(
        &mut self,
        files: &[MigrationFile],
        to: Option<Version>,
    ) -> Result<Vec<MigrationResultTuple>, Error> {
        let plan = self
            .pending(files)?
            .into_iter()
            .filter(|f| to.map_or(true, |to| f.version <= to))
            .collect();
        self.run(plan)
    }

    /// Reverses applied migrations newer than `to`, or all of them.
    pub fn down(
        &mut self,
        files: &[MigrationFile],
        to: Option<Version>,
    ) -> Result<Vec<MigrationResultTuple>, Error> {
        let versions: Vec<Version> = self
            .applied()?
            .into_iter()
            .rev()
            .filter(|v| to.map_or(true, |to| *v > to))
            .collect();
        let plan = find_all(files, &versions, Direction::Down)?;
        self.run(plan)
    }

    /// `n > 0` applies the next `n` pending migrations, `n < 0` reverses
    /// the last `-n` applied ones.
    pub fn steps(
        &mut self,
        files: &[MigrationFile],
        n: i64,
    ) -> Result<Vec<MigrationResultTuple>, Error> {
        let count = usize::try_from(n.unsigned_abs()).unwrap_or(usize::MAX);
        let plan = if n >= 0 {
            self.pending(files)?.into_iter().take(count).collect()
        } else {
            let versions: Vec<Version> = self.applied()?.into_iter().rev().take(count).collect();
            find_all(files, &versions, Direction::Down)?
        };
        self.run(plan)
    }

    /// Migrates up or down until exactly `version` is the newest applied.
    pub fn goto(
        &mut self,
        files: &[MigrationFile],
        version: Version,
    ) -> Result<Vec<MigrationResultTuple>, Error> {
        if !files.iter().any(|f| f.version == version) {
            return Err(Error::UnknownVersion(version));
        }
        let newer: Vec<Version> = self
            .applied()?
            .into_iter()
            .rev()
            .filter(|v| *v > version)
            .collect();
        let mut plan = find_all(files, &newer, Direction::Down)?;
        plan.extend(
            self.pending(files)?
                .into_iter()
                .filter(|f| f.version <= version),
        );
        self.run(plan)
    }

    /// Reverses and re-applies the newest applied migration.
    pub fn redo(&mut self, files: &[MigrationFile]) -> Result<Vec<MigrationResultTuple>, Error> {
        let plan = match self.version()? {
            Some(latest) => vec![
                find(files, latest, Direction::Down)?,
                find(files, latest, Direction::Up)?,
            ],
            None => {
                info!("nothing applied, nothing to redo");
                vec![]
            }
        };
        self.run(plan)
    }

    pub fn close(mut self) -> Result<(), Error> {
        debug!("closing engine for {}", self.target);
        Ok(self.driver.close()?)
    }

    fn pending(&mut self, files: &[MigrationFile]) -> Result<Vec<MigrationFile>, Error> {
        let applied = self.applied()?;
        Ok(ups(files)
            .into_iter()
            .filter(|f| !applied.contains(&f.version))
            .collect())
    }

    fn run(&mut self, plan: Vec<MigrationFile>) -> Result<Vec<MigrationResultTuple>, Error> {
        let mut results = Vec::with_capacity(plan.len());
        let mut failed = false;
        for file in plan {
            if failed {
                results.push((MigrationResult::SkippedDueToEarlierError, file));
                continue;
            }
            if self.cancel.is_cancelled() {
                results.push((MigrationResult::Cancelled, file));
                continue;
            }
            info!("migrating {}", file.file_name);
            let drained = self.dispatch(file.clone())?;
            let result = if drained.is_ok() {
                MigrationResult::Success
            } else {
                warn!("{} failed, skipping the rest", file.file_name);
                failed = true;
                MigrationResult::Failure {
                    errors: drained.errors,
                }
            };
            results.push((result, file));
        }
        Ok(results)
    }
}

// Up migrations sorted by version, whatever order they came in.
fn ups(files: &[MigrationFile]) -> Vec<MigrationFile> {
    let mut ups: Vec<MigrationFile> = files
        .iter()
        .filter(|f| f.direction == Direction::Up)
        .cloned()
        .collect();
    ups.sort_by_key(|f| f.version);
    ups
}

fn find(files: &[MigrationFile], version: Version, direction: Direction) -> Result<MigrationFile, Error> {
    files
        .iter()
        .find(|f| f.version == version && f.direction == direction)
        .cloned()
        .ok_or(Error::MissingMigration { version, direction })
}

fn find_all(
    files: &[MigrationFile],
    versions: &[Version],
    direction: Direction,
) -> Result<Vec<MigrationFile>, Error> {
    versions
        .iter()
        .map(|v| find(files, *v, direction))
        .collect()
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::driver::succeed_or_fail;
    use std::path::PathBuf;

    fn file(version: u64, direction: Direction, content: &str) -> MigrationFile {
        let file_name = format!("{}_test.{}.sql", version, direction);
        MigrationFile {
            path: PathBuf::from(&file_name),
            file_name,
            version: Version::new(version),
            name: String::from("test"),
            direction,
            content: content.as_bytes().to_vec(),
        }
    }

    fn pair(version: u64) -> Vec<MigrationFile> {
        vec![
            file(version, Direction::Up, "SUCCEED"),
            file(version, Direction::Down, "SUCCEED"),
        ]
    }

    fn engine(driver: succeed_or_fail::Driver) -> Engine {
        Engine::new(
            Box::new(driver),
            &ConnectionDescriptor::new("succeed_or_fail://test"),
        )
        .expect("succeed or fail driver should initialize")
    }

    fn versions(results: &[MigrationResultTuple]) -> Vec<(u64, Direction)> {
        results
            .iter()
            .map(|(_, f)| (f.version.as_u64(), f.direction))
            .collect()
    }

    #[test]
    fn test_initialize_failure_is_fatal() {
        let result = Engine::new(
            Box::new(succeed_or_fail::Driver::default()),
            &ConnectionDescriptor::new("succeed_or_fail://unreachable"),
        );
        assert!(matches!(
            result,
            Err(Error::Driver(driver::Error::Connection { .. }))
        ));
    }

    #[test]
    fn test_up_applies_in_numeric_order() {
        let mut files = pair(20170118205923);
        files.extend(pair(2));
        files.extend(pair(10));
        let mut e = engine(succeed_or_fail::Driver::default());

        let results = e.up(&files, None).unwrap();
        assert!(results.iter().all(|(r, _)| r.is_success()));
        assert_eq!(
            versions(&results),
            vec![
                (2, Direction::Up),
                (10, Direction::Up),
                (20170118205923, Direction::Up)
            ]
        );
        assert_eq!(e.version().unwrap(), Some(Version::new(20170118205923)));
        // Nothing left to do the second time round.
        assert!(e.up(&files, None).unwrap().is_empty());
    }

    #[test]
    fn test_up_to_a_version() {
        let files: Vec<MigrationFile> = [1, 2, 3].iter().flat_map(|v| pair(*v)).collect();
        let mut e = engine(succeed_or_fail::Driver::default());
        let results = e.up(&files, Some(Version::new(2))).unwrap();
        assert_eq!(versions(&results), vec![(1, Direction::Up), (2, Direction::Up)]);
        assert_eq!(e.version().unwrap(), Some(Version::new(2)));
    }

    #[test]
    fn test_later_migrations_are_skipped_after_a_failure() {
        let files = vec![
            file(1, Direction::Up, "SUCCEED"),
            file(2, Direction::Up, "SUCCEED;\nFAIL;\nSUCCEED"),
            file(3, Direction::Up, "SUCCEED"),
        ];
        let driver = succeed_or_fail::Driver::default();
        let journal = driver.journal.clone();
        let mut e = engine(driver);

        let results = e.up(&files, None).unwrap();
        assert!(matches!(results[0].0, MigrationResult::Success));
        match &results[1].0 {
            MigrationResult::Failure { errors } => {
                assert_eq!(errors.len(), 1);
                assert!(matches!(
                    errors[0],
                    MigrateError::StatementExecution { index: 2, line: 2, .. }
                ));
            }
            other => panic!("expected a failure, got {:?}", other),
        }
        assert!(matches!(
            results[2].0,
            MigrationResult::SkippedDueToEarlierError
        ));
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["SUCCEED", "SUCCEED", "FAIL"]
        );
        assert_eq!(e.applied().unwrap().into_iter().collect::<Vec<_>>(), vec![Version::new(1)]);
    }

    #[test]
    fn test_down_reverses_newest_first() {
        let files: Vec<MigrationFile> = [1, 2, 3].iter().flat_map(|v| pair(*v)).collect();
        let mut e = engine(succeed_or_fail::Driver::with_applied(&[1, 2, 3]));

        let results = e.down(&files, Some(Version::new(1))).unwrap();
        assert_eq!(
            versions(&results),
            vec![(3, Direction::Down), (2, Direction::Down)]
        );
        assert_eq!(e.version().unwrap(), Some(Version::new(1)));

        e.down(&files, None).unwrap();
        assert_eq!(e.version().unwrap(), None);
    }

    #[test]
    fn test_down_without_a_down_script_runs_nothing() {
        let files = vec![
            file(1, Direction::Up, "SUCCEED"),
            file(1, Direction::Down, "SUCCEED"),
            file(2, Direction::Up, "SUCCEED"),
        ];
        let driver = succeed_or_fail::Driver::with_applied(&[1, 2]);
        let journal = driver.journal.clone();
        let mut e = engine(driver);
        assert!(matches!(
            e.down(&files, None),
            Err(Error::MissingMigration { version, direction: Direction::Down }) if version == Version::new(2)
        ));
        assert!(journal.lock().unwrap().is_empty());
    }

    #[test]
    fn test_steps() {
        let files: Vec<MigrationFile> = [1, 2, 3, 4].iter().flat_map(|v| pair(*v)).collect();
        let mut e = engine(succeed_or_fail::Driver::default());

        assert_eq!(
            versions(&e.steps(&files, 2).unwrap()),
            vec![(1, Direction::Up), (2, Direction::Up)]
        );
        assert_eq!(
            versions(&e.steps(&files, 5).unwrap()),
            vec![(3, Direction::Up), (4, Direction::Up)]
        );
        assert_eq!(
            versions(&e.steps(&files, -3).unwrap()),
            vec![(4, Direction::Down), (3, Direction::Down), (2, Direction::Down)]
        );
        assert!(e.steps(&files, 0).unwrap().is_empty());
        assert_eq!(e.version().unwrap(), Some(Version::new(1)));
    }

    #[test]
    fn test_goto_moves_both_ways() {
        let files: Vec<MigrationFile> = [1, 2, 3].iter().flat_map(|v| pair(*v)).collect();
        let mut e = engine(succeed_or_fail::Driver::default());

        e.goto(&files, Version::new(2)).unwrap();
        assert_eq!(e.version().unwrap(), Some(Version::new(2)));

        let results = e.goto(&files, Version::new(1)).unwrap();
        assert_eq!(versions(&results), vec![(2, Direction::Down)]);

        assert!(matches!(
            e.goto(&files, Version::new(42)),
            Err(Error::UnknownVersion(v)) if v == Version::new(42)
        ));
    }

    #[test]
    fn test_redo() {
        let files: Vec<MigrationFile> = [1, 2].iter().flat_map(|v| pair(*v)).collect();
        let mut e = engine(succeed_or_fail::Driver::default());
        assert!(e.redo(&files).unwrap().is_empty());

        e.up(&files, None).unwrap();
        let results = e.redo(&files).unwrap();
        assert_eq!(
            versions(&results),
            vec![(2, Direction::Down), (2, Direction::Up)]
        );
        assert_eq!(e.version().unwrap(), Some(Version::new(2)));
    }

    #[test]
    fn test_diff() {
        let files: Vec<MigrationFile> = [3, 1, 2].iter().flat_map(|v| pair(*v)).collect();
        let mut e = engine(succeed_or_fail::Driver::with_applied(&[1, 3]));
        let states: Vec<(MigrationState, u64)> = e
            .diff(&files)
            .unwrap()
            .into_iter()
            .map(|(s, f)| (s, f.version.as_u64()))
            .collect();
        assert_eq!(
            states,
            vec![
                (MigrationState::Applied, 1),
                (MigrationState::Pending, 2),
                (MigrationState::Applied, 3)
            ]
        );
    }

    #[test]
    fn test_cancelled_engines_dispatch_nothing() {
        let files: Vec<MigrationFile> = [1, 2].iter().flat_map(|v| pair(*v)).collect();
        let driver = succeed_or_fail::Driver::default();
        let journal = driver.journal.clone();
        let mut e = engine(driver);

        let handle = e.cancel_handle();
        thread::spawn(move || handle.cancel()).join().unwrap();

        let results = e.up(&files, None).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|(r, _)| matches!(r, MigrationResult::Cancelled)));
        assert!(journal.lock().unwrap().is_empty());
    }

    #[test]
    fn test_a_panicking_driver_is_fatal() {
        let mut e = engine(succeed_or_fail::Driver::default());
        assert!(matches!(
            e.dispatch(file(1, Direction::Up, "SUCCEED; PANIC")),
            Err(Error::Panicked { .. })
        ));
    }

    #[test]
    fn test_dispatch_reports_errors_through_the_result() {
        let mut e = engine(succeed_or_fail::Driver::default());
        let drained = e.dispatch(file(1, Direction::Up, "FAIL")).unwrap();
        assert_eq!(drained.errors.len(), 1);
        assert!(!drained.completed());
    }

    #[test]
    fn test_close_is_final() {
        let e = engine(succeed_or_fail::Driver::default());
        assert!(e.close().is_ok());
    }

    #[cfg(feature = "driver_sqlite")]
    #[test]
    fn test_sqlite_up_and_down() {
        let dir = tempfile::tempdir().unwrap();
        let target = ConnectionDescriptor::new(format!(
            "sqlite://{}",
            dir.path().join("engine.sqlite3").display()
        ));
        let files = vec![
            file(
                20170118205923,
                Direction::Up,
                "CREATE TABLE demo (\n  id INTEGER PRIMARY KEY\n);",
            ),
            file(20170118205923, Direction::Down, "DROP TABLE demo;"),
            file(2, Direction::Up, "CREATE TABLE two (id INTEGER);"),
            file(2, Direction::Down, "DROP TABLE two;"),
        ];
        let mut e = Engine::connect(&Registry::with_defaults(), &target).unwrap();

        let results = e.up(&files, None).unwrap();
        assert_eq!(
            versions(&results),
            vec![(2, Direction::Up), (20170118205923, Direction::Up)]
        );
        assert!(results.iter().all(|(r, _)| r.is_success()));

        let results = e.down(&files, None).unwrap();
        assert!(results.iter().all(|(r, _)| r.is_success()));
        assert_eq!(e.version().unwrap(), None);
        e.close().unwrap();
    }
}

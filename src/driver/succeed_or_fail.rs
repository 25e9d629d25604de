//! A driver for tests. Scripts are made of the statements `SUCCEED`,
//! `FAIL` and `PANIC`, anything else is a failure too. Bookkeeping lives
//! in memory.

use super::{
    apply_script, ConnectionDescriptor, Error, MigrateError, NamedDriver, NativeError, Session,
};
use crate::migrations::{Direction, MigrationFile, Version};
use crate::pipe::PipeWriter;
use crate::statements::{self, Splitter};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Every statement executed by any clone of a journal, in order.
pub type Journal = Arc<Mutex<Vec<String>>>;

#[derive(Debug, PartialEq, Eq)]
enum State {
    Fresh,
    Open,
    Closed,
}

pub struct Driver {
    state: State,
    applied: BTreeMap<Version, Direction>,
    pub journal: Journal,
}

impl Default for Driver {
    fn default() -> Self {
        Driver {
            state: State::Fresh,
            applied: BTreeMap::new(),
            journal: Journal::default(),
        }
    }
}

impl Driver {
    /// A driver that already has `versions` applied.
    pub fn with_applied(versions: &[u64]) -> Self {
        Driver {
            applied: versions
                .iter()
                .map(|v| (Version::new(*v), Direction::Up))
                .collect(),
            ..Driver::default()
        }
    }
}

impl NamedDriver for Driver {
    fn name() -> &'static str {
        "succeed_or_fail"
    }
}

struct Script<'a> {
    applied: &'a mut BTreeMap<Version, Direction>,
    journal: &'a Journal,
}

impl<'a> Session for Script<'a> {
    fn splitter(&self) -> &dyn Splitter {
        &statements::SQLITE
    }

    fn execute(&mut self, sql: &str) -> Result<(), NativeError> {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(sql.to_string());
        }
        match sql {
            "SUCCEED" => Ok(()),
            "PANIC" => panic!("succeed or fail driver was asked to panic"),
            other => Err(format!("succeed or fail driver refuses {:?}", other).into()),
        }
    }

    fn record(
        &mut self,
        version: Version,
        direction: Direction,
        _: chrono::NaiveDateTime,
    ) -> Result<(), NativeError> {
        self.applied.insert(version, direction);
        Ok(())
    }
}

impl super::Driver for Driver {
    fn initialize(&mut self, target: &ConnectionDescriptor) -> Result<(), Error> {
        if self.state == State::Closed {
            return Err(Error::Closed);
        }
        if target.rest()? == "unreachable" {
            return Err(Error::Connection {
                target: target.clone(),
                source: "connection refused".into(),
            });
        }
        self.state = State::Open;
        Ok(())
    }

    fn migrate(&mut self, file: MigrationFile, pipe: PipeWriter) {
        let outcome = match self.state {
            State::Open => apply_script(
                &mut Script {
                    applied: &mut self.applied,
                    journal: &self.journal,
                },
                &file,
                &pipe,
            ),
            State::Fresh => Err(MigrateError::NotInitialized),
            State::Closed => Err(MigrateError::Closed),
        };
        pipe.finish(outcome);
    }

    fn close(&mut self) -> Result<(), Error> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Closed => Err(Error::Closed),
            _ => Ok(()),
        }
    }

    fn versions(&mut self) -> Result<Vec<Version>, Error> {
        match self.state {
            State::Open => Ok(self
                .applied
                .iter()
                .filter(|(_, d)| **d == Direction::Up)
                .map(|(v, _)| *v)
                .collect()),
            State::Fresh => Err(Error::NotInitialized),
            State::Closed => Err(Error::Closed),
        }
    }
}

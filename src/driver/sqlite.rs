use super::{
    apply_script, close_outcome, ConnectionDescriptor, Error, MigrateError, NamedDriver,
    NativeError, Session, MIGRATIONS_TABLE,
};
use crate::migrations::{Direction, MigrationFile, Version};
use crate::pipe::PipeWriter;
use crate::statements::{self, Splitter};
use indoc::formatdoc;
use log::{debug, info};
use rusqlite::{params, Connection};

enum State {
    Fresh,
    Open {
        conn: Connection,
        target: ConnectionDescriptor,
    },
    Closed,
}

/// SQLite driver. Targets look like `sqlite://path/to/db.sqlite3` or
/// `sqlite://:memory:`.
pub struct Sqlite {
    state: State,
}

impl NamedDriver for Sqlite {
    fn name() -> &'static str {
        "sqlite"
    }
}

impl Default for Sqlite {
    fn default() -> Self {
        Sqlite::new()
    }
}

impl Sqlite {
    pub fn new() -> Self {
        Sqlite {
            state: State::Fresh,
        }
    }

    fn connect(target: &ConnectionDescriptor) -> Result<Connection, Error> {
        let conn = match target.rest()? {
            "" | ":memory:" => Connection::open_in_memory(),
            path => Connection::open(path),
        };
        conn.map_err(|e| Error::Connection {
            target: target.clone(),
            source: e.into(),
        })
    }

    fn ensure_migrations_table(conn: &Connection) -> Result<(), Error> {
        conn.execute_batch(&formatdoc!(
            "
            CREATE TABLE IF NOT EXISTS {} (
                version INTEGER PRIMARY KEY NOT NULL,
                direction TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );",
            MIGRATIONS_TABLE
        ))
        .map_err(query_failed)
    }

    fn conn(&self) -> Result<&Connection, Error> {
        match &self.state {
            State::Open { conn, .. } => Ok(conn),
            State::Fresh => Err(Error::NotInitialized),
            State::Closed => Err(Error::Closed),
        }
    }
}

fn query_failed(e: rusqlite::Error) -> Error {
    Error::Query(e.into())
}

struct SqliteSession<'a> {
    conn: &'a Connection,
}

impl<'a> Session for SqliteSession<'a> {
    fn splitter(&self) -> &dyn Splitter {
        &statements::SQLITE
    }

    fn transactional(&self) -> bool {
        true
    }

    fn execute(&mut self, sql: &str) -> Result<(), NativeError> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn record(
        &mut self,
        version: Version,
        direction: Direction,
        applied_at: chrono::NaiveDateTime,
    ) -> Result<(), NativeError> {
        let version = i64::try_from(version.as_u64())?;
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (version, direction, applied_at) VALUES (?1, ?2, ?3)",
                MIGRATIONS_TABLE
            ),
            params![
                version,
                direction.as_str(),
                applied_at.format("%Y-%m-%d %H:%M:%S").to_string()
            ],
        )?;
        Ok(())
    }
}

impl super::Driver for Sqlite {
    fn initialize(&mut self, target: &ConnectionDescriptor) -> Result<(), Error> {
        match &self.state {
            State::Closed => return Err(Error::Closed),
            State::Open { conn, target: open } if open == target => {
                debug!("{} is already open, checking {} again", target, MIGRATIONS_TABLE);
                return Sqlite::ensure_migrations_table(conn);
            }
            _ => {}
        }
        let conn = Sqlite::connect(target)?;
        Sqlite::ensure_migrations_table(&conn)?;
        info!("sqlite driver initialized for {}", target);
        self.state = State::Open {
            conn,
            target: target.clone(),
        };
        Ok(())
    }

    fn migrate(&mut self, file: MigrationFile, pipe: PipeWriter) {
        let outcome = match &self.state {
            State::Open { conn, .. } => apply_script(&mut SqliteSession { conn }, &file, &pipe),
            State::Fresh => Err(MigrateError::NotInitialized),
            State::Closed => Err(MigrateError::Closed),
        };
        pipe.finish(outcome);
    }

    fn close(&mut self) -> Result<(), Error> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Open { conn, target } => {
                close_outcome(target, conn.close().map_err(|(_, e)| e))
            }
            State::Fresh => Ok(()),
            State::Closed => Err(Error::Closed),
        }
    }

    fn versions(&mut self) -> Result<Vec<Version>, Error> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT version FROM {} WHERE direction = ?1 ORDER BY version ASC",
                MIGRATIONS_TABLE
            ))
            .map_err(query_failed)?;
        let rows = stmt
            .query_map(params![Direction::Up.as_str()], |row| row.get::<_, i64>(0))
            .map_err(query_failed)?;
        let versions: Result<Vec<Version>, Error> = rows
            .map(|row| {
                let version = row.map_err(query_failed)?;
                u64::try_from(version)
                    .map(Version::from)
                    .map_err(|e| Error::Query(e.into()))
            })
            .collect();
        versions
    }
}

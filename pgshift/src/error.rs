use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Error surfaced by the public migration API.
///
/// The underlying cause chain lives in `inner`; `kind` classifies the error
/// so callers can react to preconditions (an active migration, a duplicate
/// name) without string matching.
#[derive(Debug)]
pub struct Error {
    pub inner: anyhow::Error,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Another migration is already active for the logical schema.
    MigrationInProgress,
    /// Complete or Rollback was called with no migration in flight.
    NoActiveMigration,
    /// A migration with this name was already recorded for the schema.
    DuplicateMigrationName,
    /// The migration failed structural validation against the schema model.
    InvalidMigration,
    /// An operation failed in the given phase.
    Operation(Phase),
    /// The migration state could not be read or written.
    StateStore,
    /// A raw database error, e.g. from view creation or schema drops.
    Database,
    /// The in-flight statement was cancelled.
    Cancelled,
}

/// Phase of the three-phase operation contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Complete,
    Rollback,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let context = match self.kind {
            ErrorKind::MigrationInProgress => "migration already in progress",
            ErrorKind::NoActiveMigration => "no active migration",
            ErrorKind::DuplicateMigrationName => "duplicate migration name",
            ErrorKind::InvalidMigration => "invalid migration",
            ErrorKind::Operation(Phase::Start) => "operation start failed",
            ErrorKind::Operation(Phase::Complete) => "operation complete failed",
            ErrorKind::Operation(Phase::Rollback) => "operation rollback failed",
            ErrorKind::StateStore => "state store error",
            ErrorKind::Database => "database error",
            ErrorKind::Cancelled => "cancelled",
        };

        write!(f, "{context}: {:#}", self.inner)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(kind: ErrorKind, inner: anyhow::Error) -> Self {
        Self { inner, kind }
    }

    pub(crate) fn migration_in_progress(schema: &str) -> Self {
        Self::new(
            ErrorKind::MigrationInProgress,
            anyhow::anyhow!("a migration for schema {:?} is already in progress", schema),
        )
    }

    pub(crate) fn no_active_migration(schema: &str) -> Self {
        Self::new(
            ErrorKind::NoActiveMigration,
            anyhow::anyhow!("schema {:?} has no active migration", schema),
        )
    }

    pub(crate) fn duplicate_migration_name(schema: &str, name: &str) -> Self {
        Self::new(
            ErrorKind::DuplicateMigrationName,
            anyhow::anyhow!("schema {:?} already has a migration named {:?}", schema, name),
        )
    }

    pub(crate) fn invalid_migration(inner: anyhow::Error) -> Self {
        Self::new(ErrorKind::InvalidMigration, inner)
    }

    /// Wrap an operation failure. A query cancellation surfacing from the
    /// driver is reported as [ErrorKind::Cancelled] rather than an
    /// operation failure, whatever the phase.
    pub(crate) fn operation(phase: Phase, inner: anyhow::Error) -> Self {
        if is_cancellation(&inner) {
            return Self::new(ErrorKind::Cancelled, inner);
        }
        Self::new(ErrorKind::Operation(phase), inner)
    }

    pub(crate) fn state(inner: anyhow::Error) -> Self {
        Self::new(ErrorKind::StateStore, inner)
    }

    /// Wrap a raw database error, surfacing driver-reported query
    /// cancellation as its own kind.
    pub(crate) fn database(inner: anyhow::Error) -> Self {
        if is_cancellation(&inner) {
            return Self::new(ErrorKind::Cancelled, inner);
        }
        Self::new(ErrorKind::Database, inner)
    }

    /// Combine a primary error with the outcome of the compensating action
    /// it triggered. The primary error's kind is preserved; both errors stay
    /// reachable through the [Join] container.
    pub fn join(primary: Error, secondary: Error) -> Self {
        let kind = primary.kind;
        Self::new(
            kind,
            anyhow::Error::new(Join {
                errors: vec![primary, secondary],
            }),
        )
    }
}

// SQLSTATE 57014 = query_canceled, what the driver reports when the
// in-flight statement is interrupted.
fn is_cancellation(inner: &anyhow::Error) -> bool {
    matches!(
        inner.downcast_ref::<sqlx::Error>(),
        Some(sqlx::Error::Database(db)) if db.code().as_deref() == Some("57014")
    )
}

/// Container carrying an error together with the outcome of the rollback it
/// forced. Constituents are iterable for observability.
#[derive(Debug)]
pub struct Join {
    errors: Vec<Error>,
}

impl Join {
    pub fn errors(&self) -> impl Iterator<Item = &Error> {
        self.errors.iter()
    }
}

impl fmt::Display for Join {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "\n")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Join {}

pub(crate) trait ResultExt<T> {
    fn err_state(self) -> Result<T>;
    fn err_db(self) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn err_state(self) -> Result<T> {
        self.map_err(|e| Error::state(e.into()))
    }

    fn err_db(self) -> Result<T> {
        self.map_err(|e| Error::database(e.into()))
    }
}

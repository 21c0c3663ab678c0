//! Core types shared by the mywire driver and pool.
//!
//! - [`Value`] for parameters and decoded column values
//! - [`Row`] with shared [`ColumnInfo`]
//! - [`Error`] taxonomy separating retryable failures from server rejections
//! - `Cx` / `Outcome` re-exports from asupersync for cancel-correct operations

pub use asupersync::{Cx, Outcome};

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    ConfigError, DatabaseError, DatabaseErrorKind, Error, InterfaceError, InterfaceErrorKind,
    OperationalError, OperationalErrorKind, PoolError, PoolErrorKind, ProgrammingError,
    ProgrammingErrorKind, Result, TypeError,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::{Date, DateTime, Time, Value};

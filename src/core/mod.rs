pub mod error;
pub mod types;
pub mod value;

pub use error::{Code, DbError, Phase, Result, Status};
pub use types::{Catalog, Column, Key, Row, TableSchema};
pub use value::{DataType, Value};

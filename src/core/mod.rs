pub mod error;
pub mod types;
pub mod value;

pub use error::{OrmError, Result};
pub use types::{FieldMap, ID_FIELD, InstanceToken, RepoKey, RowId, SubscriberId};
pub use value::Value;

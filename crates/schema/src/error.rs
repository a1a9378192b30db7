use thiserror::Error;
use uuid::Uuid;

use crate::name::QualName;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema object `{0}` already exists")]
    DuplicateName(QualName),
    #[error("schema object `{0}` does not exist")]
    NameNotFound(QualName),
    #[error("schema object with id `{0}` does not exist")]
    IdNotFound(Uuid),
    #[error("`{0}` is not a valid qualified name")]
    BadName(String),
    #[error("invalid reference to schema object `{0}`")]
    InvalidReference(QualName),
    #[error("cannot apply `{op}` to `{name}`: {reason}")]
    BadCommand {
        op: &'static str,
        name: QualName,
        reason: String,
    },
}

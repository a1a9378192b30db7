use std::fmt;
use std::str::FromStr;

use crate::error::SchemaError;

/// A fully qualified schema name, `module::local`.
///
/// Names are case-sensitive and interned nowhere; they are small enough that
/// cloning them around beats the bookkeeping of an interner.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualName {
    pub module: Box<str>,
    pub name: Box<str>,
}

impl QualName {
    pub fn new(module: impl Into<Box<str>>, name: impl Into<Box<str>>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    /// Shorthand for names in the `std` module.
    pub fn std(name: &str) -> Self {
        Self::new("std", name)
    }

    /// The unqualified part of the name.
    pub fn local(&self) -> &str {
        &self.name
    }

    pub fn is_std(&self) -> bool {
        matches!(&*self.module, "std" | "schema" | "sys" | "cfg")
    }
}

impl fmt::Display for QualName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.module, self.name)
    }
}

impl FromStr for QualName {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once("::") {
            Some((module, name)) if !module.is_empty() && !name.is_empty() => {
                Ok(QualName::new(module, name))
            }
            _ => Err(SchemaError::BadName(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        let n: QualName = "default::User".parse().unwrap();
        assert_eq!(n, QualName::new("default", "User"));
        assert_eq!(n.to_string(), "default::User");
    }

    #[test]
    fn nested_module_path_splits_on_last_separator() {
        let n: QualName = "ext::auth::Identity".parse().unwrap();
        assert_eq!(&*n.module, "ext::auth");
        assert_eq!(&*n.name, "Identity");
    }

    #[test]
    fn rejects_unqualified() {
        assert!("User".parse::<QualName>().is_err());
        assert!("::User".parse::<QualName>().is_err());
    }
}

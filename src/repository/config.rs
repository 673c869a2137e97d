use crate::core::{OrmError, Result};

/// Environment variable holding the maximum number of tracked entities.
pub const MAX_ENTITIES_ENV: &str = "MEMORM_MAX_TRACKED_ENTITIES";

pub const DEFAULT_MAX_ENTITIES: usize = 10_000;

/// Repository configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryConfig {
    /// Tracked entity count at which the next `add` clears the whole repository
    pub max_entities: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            max_entities: DEFAULT_MAX_ENTITIES,
        }
    }
}

impl RepositoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the eviction threshold
    pub fn max_entities(mut self, max: usize) -> Self {
        self.max_entities = max;
        self
    }

    /// Read the configuration from the process environment.
    ///
    /// A missing variable yields the default; an unparsable or zero value is an error.
    pub fn from_env() -> Result<Self> {
        Self::from_env_value(std::env::var(MAX_ENTITIES_ENV).ok().as_deref())
    }

    fn from_env_value(raw: Option<&str>) -> Result<Self> {
        let Some(raw) = raw else {
            return Ok(Self::default());
        };

        match raw.trim().parse::<usize>() {
            Ok(0) => Err(OrmError::Config(format!(
                "{} must be greater than zero",
                MAX_ENTITIES_ENV
            ))),
            Ok(max) => Ok(Self::default().max_entities(max)),
            Err(e) => Err(OrmError::Config(format!(
                "{}='{}' is not a valid count: {}",
                MAX_ENTITIES_ENV, raw, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capacity() {
        assert_eq!(RepositoryConfig::default().max_entities, 10_000);
        assert_eq!(RepositoryConfig::from_env_value(None).unwrap().max_entities, 10_000);
    }

    #[test]
    fn test_env_value_parsing() {
        assert_eq!(
            RepositoryConfig::from_env_value(Some(" 250 ")).unwrap(),
            RepositoryConfig::new().max_entities(250)
        );
        assert!(matches!(
            RepositoryConfig::from_env_value(Some("0")),
            Err(OrmError::Config(_))
        ));
        assert!(matches!(
            RepositoryConfig::from_env_value(Some("lots")),
            Err(OrmError::Config(_))
        ));
    }
}

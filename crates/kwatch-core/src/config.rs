//! Typed access to one section of the daemon configuration file.

use std::{
    collections::{BTreeMap, btree_map::Iter},
    fmt::Display,
    str::FromStr,
    time::Duration,
};

use thiserror::Error;

/// Key/value pairs of a configuration section, e.g. `[dedup]`.
#[derive(Debug, Clone, Default)]
pub struct SectionConfig {
    section: String,
    values: BTreeMap<String, String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("[{section}] field {field} is required")]
    RequiredValue { section: String, field: String },
    #[error("[{section}] {value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        section: String,
        field: String,
        value: String,
        err: String,
    },
}

impl SectionConfig {
    pub fn new(section: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn section(&self) -> &str {
        &self.section
    }

    /// Inserts a value, replacing the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.values.insert(key.into(), value.into())
    }

    pub fn get_raw(&self, field: &str) -> Option<&str> {
        self.values.get(field).map(String::as_str)
    }

    pub fn required<T>(&self, field: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.values.get(field) {
            None => Err(ConfigError::RequiredValue {
                section: self.section.clone(),
                field: field.to_string(),
            }),
            Some(value) => self.parse(value, field),
        }
    }

    pub fn optional<T>(&self, field: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.values
            .get(field)
            .filter(|value| !value.trim().is_empty())
            .map(|value| self.parse(value, field))
            .transpose()
    }

    /// Typed value, or `default` when the field is missing.
    pub fn with_default<T>(&self, field: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        Ok(self.optional(field)?.unwrap_or(default))
    }

    /// Duration expressed in seconds, or `default` when the field is missing.
    pub fn secs_with_default(&self, field: &str, default: u64) -> Result<Duration, ConfigError> {
        self.with_default(field, default).map(Duration::from_secs)
    }

    /// Duration expressed in milliseconds, or `default` when the field is missing.
    pub fn millis_with_default(&self, field: &str, default: u64) -> Result<Duration, ConfigError> {
        self.with_default(field, default).map(Duration::from_millis)
    }

    /// Comma separated list of values. Empty when the field is missing.
    pub fn get_list<T>(&self, field: &str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.values
            .get(field)
            .iter()
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| self.parse(item, field))
            .collect()
    }

    pub fn get_list_with_default<T>(&self, field: &str, default: Vec<T>) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        if self.values.contains_key(field) {
            self.get_list(field)
        } else {
            Ok(default)
        }
    }

    pub fn iter(&self) -> Iter<'_, String, String> {
        self.values.iter()
    }

    fn parse<T>(&self, value: &str, field: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        T::from_str(value.trim()).map_err(|err| ConfigError::InvalidValue {
            section: self.section.clone(),
            field: field.to_string(),
            value: value.to_string(),
            err: err.to_string(),
        })
    }
}

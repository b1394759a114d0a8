//! Small typed helpers over `std::env` so every option keeps a single,
//! explicit environment binding.

use std::str::FromStr;

use crate::error::{ConfigError, Result};

pub fn string(var: &'static str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_owned())
}

pub fn required(var: &'static str) -> Result<String> {
    std::env::var(var).map_err(|_| ConfigError::MissingVar(var))
}

pub fn optional(var: &'static str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

pub fn parsed<T>(var: &'static str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidVar {
            var,
            reason: format!("{raw:?}: {e}"),
        }),
        Err(_) => Ok(default),
    }
}

pub fn boolean(var: &'static str, default: bool) -> Result<bool> {
    match std::env::var(var) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidVar {
                var,
                reason: format!("{other:?} is not a boolean"),
            }),
        },
        Err(_) => Ok(default),
    }
}

/// Comma-separated list; empty entries dropped.
pub fn list(var: &'static str) -> Vec<String> {
    std::env::var(var)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

// Copyright 2023-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! Small helpers for reading ambient configuration from the environment,
//! grounded on `ddcommon::config::parse_env`. File-path/CLI configuration
//! of the worker binaries themselves is out of scope for the fabric.

pub mod parse_env {
    use std::{env, str::FromStr, time::Duration};

    pub fn duration(name: &str) -> Option<Duration> {
        Some(Duration::from_secs_f32(
            env::var(name).ok()?.parse::<f32>().ok()?,
        ))
    }

    pub fn int<T: FromStr>(name: &str) -> Option<T> {
        env::var(name).ok()?.parse::<T>().ok()
    }

    pub fn bool(name: &str) -> Option<bool> {
        let var = env::var(name).ok()?;
        Some(var == "true" || var == "1")
    }

    pub fn str_not_empty(name: &str) -> Option<String> {
        env::var(name).ok().filter(|s| !s.is_empty())
    }
}

/// Default request timeout, matching `DEFAULT_SEND_TIMEOUT` in the
/// original program. Overridable via `HEMS_SEND_TIMEOUT_MS`.
pub fn default_send_timeout_ms() -> u64 {
    parse_env::int("HEMS_SEND_TIMEOUT_MS").unwrap_or(5000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_without_env() {
        std::env::remove_var("HEMS_SEND_TIMEOUT_MS");
        assert_eq!(default_send_timeout_ms(), 5000);
    }
}

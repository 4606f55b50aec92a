use std::str::FromStr;

/// Errors raised while reading configuration from files or the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {key} holds an unparsable value '{value}'")]
    InvalidEnv { key: String, value: String },
    #[error("environment variable {key} is not valid unicode")]
    NotUnicode { key: String },
    #[error("failed to read configuration file {path}: {message}")]
    Io { path: String, message: String },
    #[error("failed to parse configuration file {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn raw(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode {
            key: key.to_string(),
        }),
    }
}

/// Parses a boolean flag. Accepts the usual spellings of on/off.
pub fn flag(key: &str) -> Result<Option<bool>, ConfigError> {
    let Some(value) = raw(key)? else {
        return Ok(None);
    };
    match value.as_str() {
        "1" | "true" | "True" | "TRUE" | "on" | "ON" | "yes" => Ok(Some(true)),
        "0" | "false" | "False" | "FALSE" | "off" | "OFF" | "no" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidEnv {
            key: key.to_string(),
            value,
        }),
    }
}

/// Parses any `FromStr` value, returning `None` when the variable is unset or blank.
pub fn parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    let Some(value) = raw(key)? else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value,
        })
}

/// Overwrites `slot` when `key` is set.
pub fn override_with<T: FromStr>(slot: &mut T, key: &str) -> Result<(), ConfigError> {
    if let Some(value) = parse::<T>(key)? {
        *slot = value;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_env::with_env;
    use super::*;

    #[test]
    fn unset_and_blank_values_are_absent() {
        with_env(
            &[("SPIRAL_TEST_ENV_A", None), ("SPIRAL_TEST_ENV_B", Some("  "))],
            || {
                assert_eq!(parse::<u64>("SPIRAL_TEST_ENV_A").unwrap(), None);
                assert_eq!(flag("SPIRAL_TEST_ENV_B").unwrap(), None);
            },
        );
    }

    #[test]
    fn garbage_is_reported_with_its_key() {
        with_env(&[("SPIRAL_TEST_ENV_C", Some("fast"))], || {
            let err = parse::<f32>("SPIRAL_TEST_ENV_C").unwrap_err();
            assert!(err.to_string().contains("SPIRAL_TEST_ENV_C"));
            assert!(flag("SPIRAL_TEST_ENV_C").is_err());
        });
    }

    #[test]
    fn override_only_touches_set_values() {
        with_env(
            &[("SPIRAL_TEST_ENV_D", Some("0.25")), ("SPIRAL_TEST_ENV_E", None)],
            || {
                let mut rate = 1.0f32;
                let mut window = 7usize;
                override_with(&mut rate, "SPIRAL_TEST_ENV_D").unwrap();
                override_with(&mut window, "SPIRAL_TEST_ENV_E").unwrap();
                assert_eq!(rate, 0.25);
                assert_eq!(window, 7);
            },
        );
    }
}

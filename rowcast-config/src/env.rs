use crate::error::ConfigError;

/// Resolves a configuration value that may be `$ENV_VAR`-indirected.
///
/// Values starting with `$` are replaced with the named environment
/// variable's contents at validation time; anything else passes through
/// untouched. A missing variable is a startup failure.
pub fn resolve_env_value(value: &str) -> Result<String, ConfigError> {
    let Some(name) = value.strip_prefix('$') else {
        return Ok(value.to_string());
    };

    std::env::var(name).map_err(|_| ConfigError::MissingEnvVar {
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_values_pass_through() {
        assert_eq!(resolve_env_value("abc123").unwrap(), "abc123");
        assert_eq!(resolve_env_value("").unwrap(), "");
    }

    #[test]
    fn dollar_values_resolve_from_the_environment() {
        unsafe {
            std::env::set_var("ROWCAST_TEST_API_KEY", "sekrit");
        }
        assert_eq!(resolve_env_value("$ROWCAST_TEST_API_KEY").unwrap(), "sekrit");
    }

    #[test]
    fn missing_variables_are_startup_failures() {
        let err = resolve_env_value("$ROWCAST_TEST_DOES_NOT_EXIST").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar { name } if name == "ROWCAST_TEST_DOES_NOT_EXIST"));
    }
}

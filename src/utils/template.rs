use regex::Regex;

use crate::errors::{ApitapError, Result};

/// Replaces `${VAR}` tokens in `text` with the current process environment value of `VAR`.
///
/// Every referenced name must appear in `whitelist`, otherwise loading fails naming the
/// offending variable (spec invariant: env-substitution references are rejected unless
/// whitelisted). A whitelisted name that is unset in the environment resolves to the empty
/// string and logs a warning rather than failing.
pub fn substitute_env_vars(text: &str, whitelist: &[String]) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")?;

    let mut result = String::with_capacity(text.len());
    let mut last_match = 0;

    for cap in re.captures_iter(text) {
        let full_match = cap.get(0).unwrap();
        let var_name = cap.get(1).unwrap().as_str();

        if !whitelist.iter().any(|w| w == var_name) {
            return Err(ApitapError::ConfigError(format!(
                "environment variable '{var_name}' is not in environment_whitelist"
            )));
        }

        let value = std::env::var(var_name).unwrap_or_else(|_| {
            tracing::warn!(var = var_name, "whitelisted environment variable is unset");
            String::new()
        });

        result.push_str(&text[last_match..full_match.start()]);
        result.push_str(&value);
        last_match = full_match.end();
    }

    result.push_str(&text[last_match..]);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_whitelisted_variable() {
        unsafe {
            std::env::set_var("FLAPI_TEST_VAR", "secret123");
        }
        let whitelist = vec!["FLAPI_TEST_VAR".to_string()];
        let result = substitute_env_vars("token=${FLAPI_TEST_VAR}", &whitelist).unwrap();
        assert_eq!(result, "token=secret123");
        unsafe {
            std::env::remove_var("FLAPI_TEST_VAR");
        }
    }

    #[test]
    fn rejects_non_whitelisted_variable() {
        let err = substitute_env_vars("token=${NOT_WHITELISTED}", &[]).unwrap_err();
        assert!(err.to_string().contains("NOT_WHITELISTED"));
    }

    #[test]
    fn unset_whitelisted_variable_becomes_empty() {
        unsafe {
            std::env::remove_var("FLAPI_TEST_UNSET");
        }
        let whitelist = vec!["FLAPI_TEST_UNSET".to_string()];
        let result = substitute_env_vars("x=${FLAPI_TEST_UNSET}", &whitelist).unwrap();
        assert_eq!(result, "x=");
    }

    #[test]
    fn multiple_variables_in_one_string() {
        unsafe {
            std::env::set_var("FLAPI_TEST_A", "1");
            std::env::set_var("FLAPI_TEST_B", "2");
        }
        let whitelist = vec!["FLAPI_TEST_A".to_string(), "FLAPI_TEST_B".to_string()];
        let result = substitute_env_vars("${FLAPI_TEST_A}-${FLAPI_TEST_B}", &whitelist).unwrap();
        assert_eq!(result, "1-2");
        unsafe {
            std::env::remove_var("FLAPI_TEST_A");
            std::env::remove_var("FLAPI_TEST_B");
        }
    }
}

use std::{error::Error, str::FromStr, time::Duration};

use snafu::{whatever, ResultExt, Whatever};

/// Reads an environment variable for the current process.
///
/// The `.env` file in the current or a parent directory is loaded first
/// through [dotenvy]. An unset variable yields `Ok(None)` instead of an
/// error.
#[track_caller]
pub fn var(key: &str) -> Result<Option<String>, Whatever> {
    match dotenvy::var(key) {
        Ok(content) => Ok(Some(content)),
        Err(dotenvy::Error::EnvVar(std::env::VarError::NotPresent)) => Ok(None),
        Err(error) => whatever!(Err(error), "Failed to read {key} environment variable"),
    }
}

/// Like [var], and parses the value if it is set.
#[track_caller]
pub fn var_parsed<R>(key: &str) -> Result<Option<R>, Whatever>
where
    R: FromStr,
    R::Err: Error + Send + Sync + 'static,
{
    match var(key)? {
        Some(content) => Ok(Some(content.trim().parse().with_whatever_context(|e| {
            format!("Failed to parse {key} environment variable; {e}")
        })?)),
        None => Ok(None),
    }
}

/// Reads a millisecond count, e.g. `DXRAM_RPC_TIMEOUT_MS=250`.
#[track_caller]
pub fn var_millis(key: &str) -> Result<Option<Duration>, Whatever> {
    Ok(var_parsed::<u64>(key)?.map(Duration::from_millis))
}

/// Overwrites `target` when `key` is set.
pub fn override_with<R>(target: &mut R, key: &str) -> Result<(), Whatever>
where
    R: FromStr,
    R::Err: Error + Send + Sync + 'static,
{
    if let Some(v) = var_parsed(key)? {
        *target = v;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_is_none() {
        assert_eq!(var("DXRAM_TEST_SURELY_UNSET_VARIABLE").unwrap(), None);
        let mut n = 7usize;
        override_with(&mut n, "DXRAM_TEST_SURELY_UNSET_VARIABLE").unwrap();
        assert_eq!(n, 7);
    }

    #[test]
    fn parsed_and_millis() {
        std::env::set_var("DXRAM_TEST_ENV_MILLIS", " 250 ");
        assert_eq!(
            var_millis("DXRAM_TEST_ENV_MILLIS").unwrap(),
            Some(Duration::from_millis(250))
        );
        std::env::set_var("DXRAM_TEST_ENV_BAD", "abc");
        assert!(var_parsed::<u32>("DXRAM_TEST_ENV_BAD").is_err());
    }
}

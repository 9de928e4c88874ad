//! Fallback from a CLI flag to an environment variable, mirroring the
//! corpus's `common::or_env` module: `field.or_env_mut("APP_SETTING_X")?`
//! fills an unset `Option<T>` field from its env var, parsing via `FromStr`.

use std::{env, str::FromStr};

pub trait OrEnvExt: Sized {
    fn or_env_mut(&mut self, env_var: &'static str) -> anyhow::Result<&mut Self>;
}

fn env_var_opt(env_var: &'static str) -> anyhow::Result<Option<String>> {
    match env::var(env_var) {
        Ok(val) => Ok(Some(val)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(s)) => {
            Err(anyhow::anyhow!("invalid unicode in `{env_var}`: {s:?}"))
        }
    }
}

impl<T> OrEnvExt for Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn or_env_mut(&mut self, env_var: &'static str) -> anyhow::Result<&mut Self> {
        if self.is_none() {
            let Some(val_str) = env_var_opt(env_var)? else {
                return Ok(self);
            };
            let val = T::from_str(&val_str)
                .map_err(|e| anyhow::anyhow!("invalid value for `{env_var}`: {e}"))?;
            *self = Some(val);
        }
        Ok(self)
    }
}

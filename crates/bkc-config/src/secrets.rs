//! Runtime secret resolution.
//!
//! YAML stores only env var NAMES (`database.url_env`, `daemon.admin_token_env`).
//! Callers resolve once at startup and pass the result into constructors.
//! `Debug` redacts values; errors name the variable, never the value.

use anyhow::{bail, Result};

use crate::BkcConfig;

#[derive(Clone, Default)]
pub struct ResolvedSecrets {
    /// `None` when the named env var is absent or blank.
    pub database_url: Option<String>,
    pub admin_token: Option<String>,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "<REDACTED>"),
            )
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

/// Resolve every secret the configuration names, using `lookup` as the
/// environment. Pass `|k| std::env::var(k).ok()` in production.
pub fn resolve_secrets<F>(cfg: &BkcConfig, lookup: F) -> Result<ResolvedSecrets>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(ResolvedSecrets {
        database_url: read_named(&cfg.database.url_env, &lookup)?,
        admin_token: read_named(&cfg.daemon.admin_token_env, &lookup)?,
    })
}

/// Database URL only. Errors when the variable is required but missing.
pub fn resolve_database_url<F>(cfg: &BkcConfig, lookup: F, required: bool) -> Result<Option<String>>
where
    F: Fn(&str) -> Option<String>,
{
    let url = read_named(&cfg.database.url_env, &lookup)?;
    if required && url.is_none() {
        bail!(
            "SECRET_MISSING: env var {} must hold the database url",
            cfg.database.url_env
        );
    }
    Ok(url)
}

fn read_named<F>(var_name: &str, lookup: &F) -> Result<Option<String>>
where
    F: Fn(&str) -> Option<String>,
{
    let name = var_name.trim();
    if name.is_empty() {
        return Ok(None);
    }
    if name.contains("://") || name.contains(char::is_whitespace) {
        bail!("CONFIG_INVALID: secret reference must be an env var name, got a value-like string");
    }
    Ok(lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_values() {
        let s = ResolvedSecrets {
            database_url: Some("postgres://u:hunter2@db/bkc".to_string()),
            admin_token: None,
        };
        let dbg = format!("{s:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("<REDACTED>"));
    }

    #[test]
    fn blank_values_resolve_to_none() {
        let cfg = BkcConfig::default();
        let got = resolve_secrets(&cfg, |_| Some("   ".to_string())).unwrap();
        assert!(got.database_url.is_none());
        assert!(got.admin_token.is_none());
    }

    #[test]
    fn required_url_reports_the_var_name() {
        let cfg = BkcConfig::default();
        let err = resolve_database_url(&cfg, |_| None, true).unwrap_err();
        assert!(err.to_string().contains("BKC_DATABASE_URL"));
    }
}

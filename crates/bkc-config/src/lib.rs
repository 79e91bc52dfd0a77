//! bkc-config
//!
//! Layered YAML configuration:
//! - docs are deep-merged in order, later docs override earlier ones
//! - literal secrets in any string leaf abort the load
//! - the merged document is canonicalized and hashed so the running
//!   configuration can be logged and compared by `config_hash`
//!
//! Typed access goes through [`BkcConfig::from_loaded`]. Secrets (database
//! URL, admin token) are only ever referenced by env var NAME; see [`secrets`].

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

mod model;
pub mod secrets;

pub use model::*;
pub use secrets::{resolve_database_url, resolve_secrets, ResolvedSecrets};

/// Leaf string values starting with any of these abort the load with
/// `CONFIG_SECRET_DETECTED`.
const SECRET_PREFIXES: &[&str] = &[
    "sk-",           // OpenAI style
    "sk_live",       // Stripe live
    "sk_test",       // Stripe test
    "AKIA",          // AWS access key ID
    "-----BEGIN",    // PEM private keys
    "ghp_",          // GitHub PAT
    "glpat-",        // GitLab PAT
    "xoxb-",         // Slack bot token
    "postgres://",   // connection strings carry credentials
    "postgresql://", //
    "redis://",      //
];

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut docs: Vec<String> = Vec::new();
    for p in paths {
        let raw =
            fs::read_to_string(p).with_context(|| format!("failed to read yaml path: {p}"))?;
        docs.push(raw);
    }

    let doc_refs: Vec<&str> = docs.iter().map(|s| s.as_str()).collect();
    load_layered_yaml_from_strings(&doc_refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = serde_json::json!({});
    for raw in yaml_docs {
        let v_yaml: serde_yaml::Value = serde_yaml::from_str(raw).context("invalid yaml")?;
        // An empty document parses as null; treat it as "no overrides".
        if v_yaml.is_null() {
            continue;
        }
        let v_json = serde_json::to_value(v_yaml).context("yaml->json conversion failed")?;
        merged = deep_merge(merged, v_json);
    }

    enforce_no_secret_literals(&merged)?;

    let canonical_json = canonicalize_json(&merged)?;
    let config_hash = sha256_hex(canonical_json.as_bytes());
    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
    })
}

fn deep_merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(mut a_map), Value::Object(b_map)) => {
            for (k, b_val) in b_map {
                let a_val = a_map.remove(&k).unwrap_or(Value::Null);
                a_map.insert(k, deep_merge(a_val, b_val));
            }
            Value::Object(a_map)
        }
        (_, b_other) => b_other,
    }
}

// serde_json's default Map is ordered by key, so compact serialization is canonical.
fn canonicalize_json(v: &Value) -> Result<String> {
    serde_json::to_string(v).context("canonical json serialize failed")
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn enforce_no_secret_literals(v: &Value) -> Result<()> {
    let mut leaves = Vec::new();
    collect_string_leaves(v, "", &mut leaves);

    for (ptr, s) in leaves {
        if looks_like_secret(s) {
            bail!("CONFIG_SECRET_DETECTED leaf={} value=REDACTED", ptr);
        }
    }
    Ok(())
}

fn collect_string_leaves<'a>(v: &'a Value, prefix: &str, out: &mut Vec<(String, &'a str)>) {
    match v {
        Value::Object(map) => {
            for (k, vv) in map.iter() {
                let next = format!("{}/{}", prefix, k.replace('~', "~0").replace('/', "~1"));
                collect_string_leaves(vv, &next, out);
            }
        }
        Value::Array(arr) => {
            for (i, vv) in arr.iter().enumerate() {
                collect_string_leaves(vv, &format!("{prefix}/{i}"), out);
            }
        }
        Value::String(s) => out.push((prefix.to_string(), s.as_str())),
        _ => {}
    }
}

fn looks_like_secret(s: &str) -> bool {
    let t = s.trim();
    if t.len() < 8 {
        return false;
    }
    SECRET_PREFIXES.iter().any(|p| t.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_overrides_leaves_and_keeps_siblings() {
        let a = serde_json::json!({"tap": {"daily_limit": 500, "energy_max": 1000}});
        let b = serde_json::json!({"tap": {"daily_limit": 800}});
        let m = deep_merge(a, b);
        assert_eq!(m["tap"]["daily_limit"], 800);
        assert_eq!(m["tap"]["energy_max"], 1000);
    }

    #[test]
    fn short_strings_are_never_secrets() {
        assert!(!looks_like_secret("sk-1"));
        assert!(looks_like_secret("postgres://u:p@db/bkc"));
        assert!(!looks_like_secret("BKC_DATABASE_URL"));
    }
}

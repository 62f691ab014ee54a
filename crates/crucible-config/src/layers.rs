//! Layered file-based deployment config.
//!
//! YAML files are merged in order (later overrides earlier, objects merge
//! recursively, arrays and scalars replace), then canonicalized to
//! sorted-key compact JSON and hashed with SHA-256. The hash is reported in
//! `/health` so operators can confirm what a running daemon was booted with.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub value: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Read and merge the given YAML files in order.
pub fn load_layered_yaml<P: AsRef<Path>>(paths: &[P]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let p = p.as_ref();
        let raw = fs::read_to_string(p).with_context(|| format!("read config {}", p.display()))?;
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(&raw).with_context(|| format!("parse yaml {}", p.display()))?;
        let json = serde_json::to_value(yaml).context("yaml to json conversion failed")?;
        merge_value(&mut merged, json);
    }

    let canonical_json = canonical_string(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical_json.as_bytes());
    let config_hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        value: merged,
        canonical_json,
        config_hash,
    })
}

/// Objects merge key-by-key; anything else (arrays, scalars) is replaced.
fn merge_value(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(slot) => merge_value(slot, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

/// Compact JSON with all object keys sorted recursively, so the hash is
/// independent of YAML key order.
fn canonical_string(v: &Value) -> String {
    fn sorted(v: &Value) -> Value {
        match v {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for k in keys {
                    out.insert(k.clone(), sorted(&map[k]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    // serde_json never fails on a Value tree it produced itself.
    serde_json::to_string(&sorted(v)).expect("canonical json serialization")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn later_layers_override_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_yaml(&dir, "base.yaml", "router:\n  primary_percentage: 0.1\n  spill: 5\n");
        let env = write_yaml(&dir, "env.yaml", "router:\n  primary_percentage: 0.9\n");

        let loaded = load_layered_yaml(&[base, env]).unwrap();
        assert_eq!(
            loaded.value.pointer("/router/primary_percentage"),
            Some(&serde_json::json!(0.9))
        );
        // Untouched sibling keys survive the merge.
        assert_eq!(loaded.value.pointer("/router/spill"), Some(&serde_json::json!(5)));
    }

    #[test]
    fn hash_is_independent_of_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_yaml(&dir, "a.yaml", "x: 1\ny: 2\n");
        let b = write_yaml(&dir, "b.yaml", "y: 2\nx: 1\n");

        let ha = load_layered_yaml(&[a]).unwrap().config_hash;
        let hb = load_layered_yaml(&[b]).unwrap().config_hash;
        assert_eq!(ha, hb);
    }

    #[test]
    fn missing_file_is_a_contextual_error() {
        let err = load_layered_yaml(&["/nonexistent/config.yaml"]).unwrap_err();
        assert!(format!("{err:#}").contains("read config"));
    }
}

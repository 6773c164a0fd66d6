// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/synapse/config.yaml"));
    paths.push(PathBuf::from("/etc/synapse/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/synapse/config.yaml"));
        paths.push(home.join(".config/synapse/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("synapse/config.yaml"));
        paths.push(cfg.join("synapse/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".synapse/config.yaml"));
    paths.push(PathBuf::from(".synapse/config.yml"));
    paths.push(PathBuf::from("synapse.yaml"));
    paths.push(PathBuf::from("synapse.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (`~` and `$VAR` are
/// expanded).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        let expanded = shellexpand::full(&p.to_string_lossy())
            .map(|s| PathBuf::from(s.into_owned()))
            .unwrap_or_else(|_| p.to_path_buf());
        debug!(path = %expanded.display(), "loading explicit config");
        let text = std::fs::read_to_string(&expanded)
            .with_context(|| format!("reading {}", expanded.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", expanded.display()))?;
        merge_yaml(&mut merged, layer);
    }

    // Deserialize the merged YAML value into Config, falling back to defaults
    // when the merged value is empty (no config files found).
    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };
    Ok(config)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        let src = val("b: 99");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("executor:\n  primary_model: primary");
        let src = val("executor:\n  tool_loop_model: loop");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["executor"]["primary_model"].as_str(), Some("primary"));
        assert_eq!(dst["executor"]["tool_loop_model"].as_str(), Some("loop"));
    }

    #[test]
    fn load_explicit_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "executor:\n  primary_model: synth\n  tool_loop_model: cheap"
        )
        .unwrap();
        let c = load(Some(f.path())).unwrap();
        assert_eq!(c.executor.primary_model, "synth");
        assert_eq!(c.executor.tool_loop_model.as_deref(), Some("cheap"));
    }

    #[test]
    fn load_missing_explicit_file_errors() {
        assert!(load(Some(Path::new("/nonexistent/synapse.yaml"))).is_err());
    }
}

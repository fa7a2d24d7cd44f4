//! Batch plan schema, validation, and defaults resolution.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use crate::types::BatchDefaults;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPlan {
    /// Maximum in-flight items.
    pub concurrency: u32,
    #[serde(default)]
    pub defaults: BatchDefaults,
    pub matrix: Vec<PlanItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItem {
    pub repo: String,
    pub prompt: String,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub script_command: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub merge_on_pass: Option<bool>,
}

/// A matrix entry with run defaults folded in.
#[derive(Debug, Clone)]
pub struct ResolvedItem {
    pub repo: String,
    pub prompt: String,
    pub base_branch: Option<String>,
    pub script_command: Option<String>,
    pub model: Option<String>,
    pub timeout: Option<Duration>,
    pub merge_on_pass: bool,
    pub retries: u32,
}

impl BatchPlan {
    /// Load a plan from a TOML or JSON file, picked by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file {}", path.display()))?;
        let plan: Self = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid JSON plan {}", path.display()))?
        } else {
            toml::from_str(&contents)
                .with_context(|| format!("Invalid TOML plan {}", path.display()))?
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("plan concurrency must be a positive integer");
        }
        if self.matrix.is_empty() {
            bail!("plan matrix is empty");
        }
        for (index, item) in self.matrix.iter().enumerate() {
            if item.repo.trim().is_empty() {
                bail!("matrix[{index}] is missing a repo path");
            }
            if item.prompt.trim().is_empty() {
                bail!("matrix[{index}] has an empty prompt");
            }
        }
        Ok(())
    }

    /// Matrix entries with defaults applied, in plan order.
    pub fn resolved_items(&self) -> Vec<ResolvedItem> {
        self.matrix
            .iter()
            .map(|item| ResolvedItem {
                repo: item.repo.clone(),
                prompt: item.prompt.clone(),
                base_branch: item
                    .base_branch
                    .clone()
                    .or_else(|| self.defaults.base_branch.clone()),
                script_command: item
                    .script_command
                    .clone()
                    .or_else(|| self.defaults.script_command.clone()),
                model: item.model.clone().or_else(|| self.defaults.model.clone()),
                timeout: item
                    .timeout_sec
                    .or(self.defaults.timeout_sec)
                    .map(Duration::from_secs),
                merge_on_pass: item.merge_on_pass.unwrap_or(self.defaults.merge_on_pass),
                retries: self.defaults.retries,
            })
            .collect()
    }

    /// Human-readable dry-run summary.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Batch plan: {} item(s), concurrency {}\n",
            self.matrix.len(),
            self.concurrency
        );
        for (index, item) in self.resolved_items().iter().enumerate() {
            let _ = writeln!(
                out,
                "  [{index}] {} — \"{}\"{}{}{}",
                item.repo,
                truncate(&item.prompt, 60),
                item.base_branch
                    .as_deref()
                    .map(|b| format!(" base={b}"))
                    .unwrap_or_default(),
                item.model
                    .as_deref()
                    .map(|m| format!(" model={m}"))
                    .unwrap_or_default(),
                if item.merge_on_pass { " merge-on-pass" } else { "" },
            );
        }
        out
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &s[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_plan() -> BatchPlan {
        BatchPlan {
            concurrency: 2,
            defaults: BatchDefaults {
                base_branch: Some("main".to_string()),
                script_command: None,
                model: Some("gpt-5".to_string()),
                timeout_sec: Some(600),
                retries: 1,
                merge_on_pass: false,
            },
            matrix: vec![
                PlanItem {
                    repo: "/tmp/repo-a".to_string(),
                    prompt: "task a".to_string(),
                    base_branch: None,
                    script_command: None,
                    model: None,
                    timeout_sec: None,
                    merge_on_pass: None,
                },
                PlanItem {
                    repo: "/tmp/repo-b".to_string(),
                    prompt: "task b".to_string(),
                    base_branch: Some("develop".to_string()),
                    script_command: Some("make test".to_string()),
                    model: Some("claude-sonnet".to_string()),
                    timeout_sec: Some(60),
                    merge_on_pass: Some(true),
                },
            ],
        }
    }

    #[test]
    fn test_defaults_resolution() {
        let plan = minimal_plan();
        let items = plan.resolved_items();

        assert_eq!(items[0].base_branch.as_deref(), Some("main"));
        assert_eq!(items[0].model.as_deref(), Some("gpt-5"));
        assert_eq!(items[0].timeout, Some(Duration::from_secs(600)));
        assert!(!items[0].merge_on_pass);
        assert_eq!(items[0].retries, 1);

        assert_eq!(items[1].base_branch.as_deref(), Some("develop"));
        assert_eq!(items[1].model.as_deref(), Some("claude-sonnet"));
        assert_eq!(items[1].timeout, Some(Duration::from_secs(60)));
        assert!(items[1].merge_on_pass);
    }

    #[test]
    fn test_validation_rules() {
        let mut plan = minimal_plan();
        plan.concurrency = 0;
        assert!(plan.validate().is_err());

        let mut plan = minimal_plan();
        plan.matrix.clear();
        assert!(plan.validate().is_err());

        let mut plan = minimal_plan();
        plan.matrix[0].prompt = "   ".to_string();
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("empty prompt"));

        assert!(minimal_plan().validate().is_ok());
    }

    #[test]
    fn test_load_toml_and_json() {
        let temp = tempfile::TempDir::new().unwrap();

        let toml_path = temp.path().join("plan.toml");
        std::fs::write(
            &toml_path,
            r#"
concurrency = 3

[defaults]
base_branch = "main"
retries = 2

[[matrix]]
repo = "/tmp/r1"
prompt = "do a thing"

[[matrix]]
repo = "/tmp/r2"
prompt = "do another"
timeout_sec = 30
"#,
        )
        .unwrap();
        let plan = BatchPlan::load(&toml_path).unwrap();
        assert_eq!(plan.concurrency, 3);
        assert_eq!(plan.matrix.len(), 2);
        assert_eq!(plan.defaults.retries, 2);

        let json_path = temp.path().join("plan.json");
        std::fs::write(
            &json_path,
            r#"{"concurrency":1,"matrix":[{"repo":"/tmp/r","prompt":"p"}]}"#,
        )
        .unwrap();
        let plan = BatchPlan::load(&json_path).unwrap();
        assert_eq!(plan.concurrency, 1);
        assert_eq!(plan.defaults.retries, 0);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("bad.toml");
        std::fs::write(&path, "concurrency = 0\nmatrix = []\n").unwrap();
        assert!(BatchPlan::load(&path).is_err());
    }

    #[test]
    fn test_summary_mentions_items() {
        let summary = minimal_plan().summary();
        assert!(summary.contains("2 item(s)"));
        assert!(summary.contains("/tmp/repo-a"));
        assert!(summary.contains("merge-on-pass"));
    }
}

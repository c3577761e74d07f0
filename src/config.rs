use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};

use crate::region::merge::OnMissing;

/// One page to keep in sync, as described by a YAML file in the pages dir.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PageConfig {
    #[serde(deserialize_with = "string_or_number")]
    pub page_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub on_missing: OnMissing,
    #[serde(default)]
    pub fragment_path: Option<PathBuf>,
    #[serde(default)]
    pub fragment: Option<String>,
    #[serde(default)]
    pub notes_section: bool,
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(u64),
    }
    Ok(match Id::deserialize(d)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

impl PageConfig {
    pub fn from_yaml_str(src: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(src)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.page_id.trim().is_empty() {
            bail!("page_id must not be empty");
        }
        match (&self.fragment_path, &self.fragment) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (None, None) => bail!("one of fragment_path or fragment is required"),
            (Some(_), Some(_)) => bail!("fragment_path and fragment are mutually exclusive"),
        }
    }

    pub fn label(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.page_id)
    }

    /// Inline fragment, or the file at `fragment_path` relative to `base_dir`.
    pub fn resolve_fragment(&self, base_dir: &Path) -> Result<String> {
        if let Some(inline) = &self.fragment {
            return Ok(inline.clone());
        }
        let Some(rel) = &self.fragment_path else {
            bail!("page {} has no fragment source", self.page_id);
        };
        let path = base_dir.join(rel);
        fs::read_to_string(&path)
            .with_context(|| format!("Failed to read fragment {}", path.display()))
    }
}

pub struct PageEntry {
    pub path: PathBuf,
    pub config: PageConfig,
}

impl PageEntry {
    pub fn load_fragment(&self) -> Result<String> {
        let base = self.path.parent().unwrap_or_else(|| Path::new("."));
        self.config.resolve_fragment(base)
    }
}

/// Load every `*.yaml` / `*.yml` in `dir`, sorted by file name.
pub fn load_page_configs(dir: &Path) -> Result<Vec<PageEntry>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read pages directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
        })
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let src = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config = PageConfig::from_yaml_str(&src)
                .with_context(|| format!("Invalid page config {}", path.display()))?;
            Ok(PageEntry { path, config })
        })
        .collect()
}

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::catalog::{Catalog, FlavorSpec};
use crate::error::{Error, Result};
use crate::invocation::InvocationSettings;
use crate::paths::{self, RootPaths};

/// `[orchestrator]` table. Unset fields fall back to the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_options: Option<Vec<String>>,
    /// Relative to the config file's directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_root: Option<String>,
    /// Relative to the source root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    /// Relative to the source root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_root: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogFile {
    pub orchestrator: OrchestratorConfig,
    /// Replaces the built-in table when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flavors: Option<Vec<FlavorSpec>>,
}

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn parse(&self) -> Result<CatalogFile> {
        self.value.clone().try_into().map_err(|e| {
            Error::config(format!("invalid catalog {}: {e}", self.path.display()))
        })
    }

    pub fn base_dir(&self) -> PathBuf {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        // Arrays (including `flavors`) are replaced wholesale, never concatenated.
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "catalog extends cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::io(format!("failed to read catalog {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends") {
        let Some(ext) = ext.as_str() else {
            return Err(Error::config(format!(
                "invalid extends in {} (expected string)",
                path.display()
            )));
        };
        let from = path.parent().unwrap_or_else(|| Path::new("."));
        let base_path = paths::resolve_user_path(from, ext)?;
        out = load_value_inner(&base_path, stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }

    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

/// Reads a catalog file, following `extends` chains.
pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

/// Values given on the command line; they beat anything in the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub source_root: Option<PathBuf>,
    pub prefix_root: Option<PathBuf>,
    pub tool: Option<String>,
}

/// Everything a run needs, fully resolved.
#[derive(Debug, Clone)]
pub struct Setup {
    pub catalog: Catalog,
    pub roots: RootPaths,
    pub settings: InvocationSettings,
}

impl Setup {
    /// The effective configuration in catalog-file form.
    pub fn to_catalog_file(&self) -> CatalogFile {
        let s = |p: &Path| p.display().to_string();
        CatalogFile {
            orchestrator: OrchestratorConfig {
                product: Some(self.settings.product.clone()),
                tool: Some(self.settings.tool.clone()),
                global_options: Some(self.settings.global_options.clone()),
                source_root: Some(s(&self.roots.source_root)),
                output_dir: Some(s(&self.roots.output_root)),
                cross_dir: Some(s(&self.roots.cross_file_root)),
                prefix_root: Some(s(&self.roots.prefix_root)),
            },
            flavors: Some(self.catalog.flavors().to_vec()),
        }
    }
}

pub fn setup(doc: Option<&ConfigDoc>, overrides: &Overrides, cwd: &Path) -> Result<Setup> {
    let file = match doc {
        Some(d) => d.parse()?,
        None => CatalogFile::default(),
    };
    let orch = &file.orchestrator;

    let source_root = match (&overrides.source_root, &orch.source_root) {
        (Some(p), _) => cwd.join(p),
        (None, Some(raw)) => {
            let base = doc.map(ConfigDoc::base_dir).unwrap_or_else(|| cwd.to_path_buf());
            paths::resolve_user_path(&cwd.join(base), raw)?
        }
        (None, None) => cwd.to_path_buf(),
    };
    let source_root = paths::normalize_abs("source_root", &source_root)?;

    let output_root = paths::resolve_user_path(
        &source_root,
        orch.output_dir.as_deref().unwrap_or(paths::DEFAULT_OUTPUT_DIR),
    )?;
    let cross_file_root = paths::resolve_user_path(
        &source_root,
        orch.cross_dir.as_deref().unwrap_or(paths::DEFAULT_CROSS_DIR),
    )?;
    let prefix_root = match (&overrides.prefix_root, &orch.prefix_root) {
        (Some(p), _) => cwd.join(p),
        (None, Some(raw)) => paths::resolve_user_path(&source_root, raw)?,
        (None, None) => PathBuf::from(paths::DEFAULT_PREFIX_ROOT),
    };
    let roots = RootPaths::new(&source_root, &output_root, &cross_file_root, &prefix_root)?;

    let defaults = InvocationSettings::default();
    let settings = InvocationSettings {
        product: orch.product.clone().unwrap_or(defaults.product),
        tool: overrides
            .tool
            .clone()
            .or_else(|| orch.tool.clone())
            .unwrap_or(defaults.tool),
        global_options: orch.global_options.clone().unwrap_or(defaults.global_options),
    };
    paths::validate_segment("product name", &settings.product)
        .map_err(|e| Error::config(e.to_string()))?;
    if settings.tool.trim().is_empty() {
        return Err(Error::config("tool must not be empty"));
    }

    let catalog = match file.flavors {
        Some(flavors) => Catalog::new(flavors)?,
        None => Catalog::builtin(),
    };

    Ok(Setup {
        catalog,
        roots,
        settings,
    })
}

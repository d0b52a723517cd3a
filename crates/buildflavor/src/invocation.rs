use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::process::Command;

use serde::Serialize;

use crate::catalog::FlavorSpec;
use crate::error::Result;
use crate::paths::{self, RootPaths, path_str};

pub const CROSS_FILE_FLAG: &str = "--cross-file";
pub const LIBDIR_FLAG: &str = "--libdir";
// Meson picks the build machine's multiarch libdir (e.g. lib/x86_64-linux-gnu)
// for cross builds; the stow layout wants a flat lib/.
pub const LIBDIR_OVERRIDE: &str = "lib";
pub const PREFIX_FLAG: &str = "--prefix";

pub fn default_product() -> String {
    "libmpdclient".into()
}

pub fn default_tool() -> String {
    "meson".into()
}

pub fn default_global_options() -> Vec<String> {
    vec!["--werror".into()]
}

/// Knobs shared by every flavor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationSettings {
    pub product: String,
    pub tool: String,
    pub global_options: Vec<String>,
}

impl Default for InvocationSettings {
    fn default() -> Self {
        Self {
            product: default_product(),
            tool: default_tool(),
            global_options: default_global_options(),
        }
    }
}

/// A full environment for one child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<OsString, OsString>,
}

impl Environment {
    /// Snapshot of the current process environment.
    pub fn ambient() -> Self {
        Self::from_vars(std::env::vars_os())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Returns a new environment with `overrides` winning on collision.
    pub fn overlay(&self, overrides: &BTreeMap<String, String>) -> Self {
        let mut vars = self.vars.clone();
        for (k, v) in overrides {
            vars.insert(OsString::from(k), OsString::from(v));
        }
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&OsStr> {
        self.vars.get(OsStr::new(key)).map(OsString::as_os_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Everything needed to configure one flavor. Built fresh per flavor.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedInvocation {
    pub flavor: String,
    pub build_dir: PathBuf,
    pub install_prefix: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_file: Option<PathBuf>,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env_overrides: BTreeMap<String, String>,
    #[serde(skip)]
    pub environment: Environment,
}

impl ResolvedInvocation {
    pub fn program(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or_default()
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(self.program());
        cmd.args(self.args.iter().skip(1));
        cmd.env_clear();
        cmd.envs(self.environment.iter());
        cmd
    }

    /// Shell-like rendering for humans; overrides are shown as `KEY=value` prefixes.
    pub fn display_line(&self) -> String {
        let mut parts: Vec<String> = self
            .env_overrides
            .iter()
            .map(|(k, v)| format!("{k}={}", shell_quote(v)))
            .collect();
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

/// Pure: no filesystem or process access. `ambient` is passed in explicitly.
pub fn build(
    spec: &FlavorSpec,
    roots: &RootPaths,
    settings: &InvocationSettings,
    ambient: &Environment,
) -> Result<ResolvedInvocation> {
    let fp = paths::resolve(spec, roots, &settings.product)?;

    let mut args = vec![
        settings.tool.clone(),
        path_str(&roots.source_root)?.to_string(),
        path_str(&fp.build_dir)?.to_string(),
    ];
    args.extend(settings.global_options.iter().cloned());
    args.extend(spec.extra_options.iter().cloned());

    if let Some(cross_file) = fp.cross_file.as_deref() {
        args.push(CROSS_FILE_FLAG.into());
        args.push(path_str(cross_file)?.to_string());
        args.push(LIBDIR_FLAG.into());
        args.push(LIBDIR_OVERRIDE.into());
    }

    args.push(PREFIX_FLAG.into());
    args.push(path_str(&fp.install_prefix)?.to_string());

    Ok(ResolvedInvocation {
        flavor: spec.name.clone(),
        build_dir: fp.build_dir,
        install_prefix: fp.install_prefix,
        cross_file: fp.cross_file,
        args,
        env_overrides: spec.env_overrides.clone(),
        environment: ambient.overlay(&spec.env_overrides),
    })
}

fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::paths::validate_segment;

/// One named build profile.
///
/// `target_triple` is the only thing that marks a flavor as a cross build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlavorSpec {
    pub name: String,
    #[serde(default, rename = "options", skip_serializing_if = "Vec::is_empty")]
    pub extra_options: Vec<String>,
    #[serde(default, rename = "arch", skip_serializing_if = "Option::is_none")]
    pub target_triple: Option<String>,
    #[serde(default, rename = "env", skip_serializing_if = "BTreeMap::is_empty")]
    pub env_overrides: BTreeMap<String, String>,
}

impl FlavorSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra_options: Vec::new(),
            target_triple: None,
            env_overrides: BTreeMap::new(),
        }
    }

    pub fn options<I, S>(mut self, opts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_options.extend(opts.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_overrides.insert(key.into(), value.into());
        self
    }

    pub fn cross(mut self, triple: impl Into<String>) -> Self {
        self.target_triple = Some(triple.into());
        self
    }

    pub fn is_cross(&self) -> bool {
        self.target_triple.is_some()
    }
}

/// The flavors libmpdclient is routinely configured with, in run order.
pub fn builtin_flavors() -> Vec<FlavorSpec> {
    vec![
        FlavorSpec::new("debug").options(["-Ddocumentation=true", "-Dtest=true"]),
        FlavorSpec::new("asan").options(["-Db_sanitize=address", "-Dtest=true"]),
        FlavorSpec::new("release").options([
            "--buildtype",
            "release",
            "-Db_ndebug=true",
            "-Dtest=true",
        ]),
        FlavorSpec::new("musl")
            .options([
                "--buildtype",
                "minsize",
                "--default-library",
                "static",
                "-Db_ndebug=true",
            ])
            .env("CC", "musl-gcc"),
        FlavorSpec::new("win32").cross("i686-w64-mingw32"),
        FlavorSpec::new("win64").cross("x86_64-w64-mingw32"),
    ]
}

/// Ordered, read-only flavor table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    flavors: Vec<FlavorSpec>,
}

impl Catalog {
    pub fn new(flavors: Vec<FlavorSpec>) -> Result<Self> {
        let mut seen = BTreeSet::<&str>::new();
        for spec in &flavors {
            validate_segment("flavor name", &spec.name)
                .map_err(|e| Error::config(format!("invalid flavor: {e}")))?;
            if !seen.insert(spec.name.as_str()) {
                return Err(Error::config(format!(
                    "duplicate flavor name '{}'",
                    spec.name
                )));
            }
            if let Some(triple) = spec.target_triple.as_deref() {
                validate_segment("target triple", triple).map_err(|e| {
                    Error::config(format!("flavor '{}': {e}", spec.name))
                })?;
            }
            for key in spec.env_overrides.keys() {
                if key.is_empty() || key.contains(['=', '\0']) {
                    return Err(Error::config(format!(
                        "flavor '{}' has invalid environment variable name '{}'",
                        spec.name, key
                    )));
                }
            }
        }
        Ok(Self { flavors })
    }

    pub fn builtin() -> Self {
        Self {
            flavors: builtin_flavors(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FlavorSpec)> {
        self.flavors.iter().map(|f| (f.name.as_str(), f))
    }

    pub fn flavors(&self) -> &[FlavorSpec] {
        &self.flavors
    }

    pub fn names(&self) -> Vec<&str> {
        self.flavors.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&FlavorSpec> {
        self.flavors.iter().find(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.flavors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flavors.is_empty()
    }

    /// Narrows the catalog to `names`, keeping catalog order rather than request order.
    pub fn select(&self, names: &[String]) -> Result<Catalog> {
        if names.is_empty() {
            return Ok(self.clone());
        }
        for n in names {
            if self.get(n).is_none() {
                return Err(Error::config(format!(
                    "unknown flavor '{}' (known: {})",
                    n,
                    self.names().join(", ")
                )));
            }
        }
        let flavors = self
            .flavors
            .iter()
            .filter(|f| names.iter().any(|n| *n == f.name))
            .cloned()
            .collect();
        Ok(Catalog { flavors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_order_is_stable() {
        let cat = Catalog::builtin();
        assert_eq!(
            cat.names(),
            vec!["debug", "asan", "release", "musl", "win32", "win64"]
        );
        assert_eq!(Catalog::new(builtin_flavors()).expect("valid"), cat);
    }

    #[test]
    fn builtin_shapes() {
        let cat = Catalog::builtin();
        let musl = cat.get("musl").expect("musl");
        assert_eq!(musl.env_overrides.get("CC").map(String::as_str), Some("musl-gcc"));
        assert!(!musl.is_cross());

        let win32 = cat.get("win32").expect("win32");
        assert_eq!(win32.target_triple.as_deref(), Some("i686-w64-mingw32"));
        assert!(win32.extra_options.is_empty());

        let cross: Vec<_> = cat.iter().filter(|(_, f)| f.is_cross()).map(|(n, _)| n).collect();
        assert_eq!(cross, vec!["win32", "win64"]);
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = Catalog::new(vec![FlavorSpec::new("debug"), FlavorSpec::new("debug")])
            .unwrap_err();
        assert!(err.to_string().contains("duplicate flavor name 'debug'"), "{err}");
    }

    #[test]
    fn rejects_name_with_separator() {
        let err = Catalog::new(vec![FlavorSpec::new("win/32")]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
        assert!(err.to_string().contains("win/32"), "{err}");
    }

    #[test]
    fn rejects_bad_env_key() {
        let err = Catalog::new(vec![FlavorSpec::new("musl").env("C=C", "x")]).unwrap_err();
        assert!(err.to_string().contains("environment variable"), "{err}");
    }

    #[test]
    fn select_keeps_catalog_order() {
        let cat = Catalog::builtin();
        let picked = cat
            .select(&["win64".to_string(), "debug".to_string()])
            .expect("select");
        assert_eq!(picked.names(), vec!["debug", "win64"]);

        let err = cat.select(&["nope".to_string()]).unwrap_err();
        assert!(err.to_string().contains("unknown flavor 'nope'"), "{err}");
    }
}

use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::catalog::FlavorSpec;
use crate::error::{Error, Result};

pub const DEFAULT_OUTPUT_DIR: &str = "output";
pub const DEFAULT_CROSS_DIR: &str = "build/cross";
pub const DEFAULT_PREFIX_ROOT: &str = "/usr/local/stow";
pub const CROSS_FILE_EXT: &str = "txt";

/// Process-wide roots, resolved once before the first flavor runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootPaths {
    pub source_root: PathBuf,
    pub output_root: PathBuf,
    pub cross_file_root: PathBuf,
    pub prefix_root: PathBuf,
}

impl RootPaths {
    pub fn new(
        source_root: &Path,
        output_root: &Path,
        cross_file_root: &Path,
        prefix_root: &Path,
    ) -> Result<Self> {
        Ok(Self {
            source_root: normalize_abs("source_root", source_root)?,
            output_root: normalize_abs("output_root", output_root)?,
            cross_file_root: normalize_abs("cross_file_root", cross_file_root)?,
            prefix_root: normalize_abs("prefix_root", prefix_root)?,
        })
    }

    // libmpdclient layout: `output/` and `build/cross/` live under the
    // source root, prefixes go to a stow directory.
    pub fn with_defaults(source_root: &Path) -> Result<Self> {
        Self::new(
            source_root,
            &source_root.join(DEFAULT_OUTPUT_DIR),
            &source_root.join(DEFAULT_CROSS_DIR),
            Path::new(DEFAULT_PREFIX_ROOT),
        )
    }
}

/// Directories derived for one flavor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlavorPaths {
    pub build_dir: PathBuf,
    pub install_prefix: PathBuf,
    pub cross_file: Option<PathBuf>,
}

pub fn resolve(spec: &FlavorSpec, roots: &RootPaths, product: &str) -> Result<FlavorPaths> {
    validate_segment("flavor name", &spec.name)?;
    validate_segment("product name", product)?;

    let build_dir = roots.output_root.join(&spec.name);

    // Cross builds get an arch-qualified prefix so two triples of the same
    // flavor never share an install tree.
    let mut install_prefix = roots
        .prefix_root
        .join(format!("{product}-{}", spec.name));
    let mut cross_file = None;
    if let Some(triple) = spec.target_triple.as_deref() {
        validate_segment("target triple", triple)?;
        install_prefix = install_prefix.join(triple);
        cross_file = Some(
            roots
                .cross_file_root
                .join(format!("{}.{CROSS_FILE_EXT}", spec.name)),
        );
    }

    Ok(FlavorPaths {
        build_dir,
        install_prefix,
        cross_file,
    })
}

/// Rejects anything that would not stay a single component when joined onto a parent.
pub fn validate_segment(what: &str, raw: &str) -> Result<()> {
    if raw.is_empty() {
        return Err(Error::path(format!("{what} is empty")));
    }
    if raw.trim() != raw {
        return Err(Error::path(format!(
            "{what} '{raw}' has leading or trailing whitespace"
        )));
    }
    if raw.contains(['/', '\\', '\0']) {
        return Err(Error::path(format!(
            "{what} '{raw}' contains a path separator"
        )));
    }
    let mut comps = Path::new(raw).components();
    match (comps.next(), comps.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(Error::path(format!(
            "{what} '{raw}' is not a plain path segment"
        ))),
    }
}

/// Lexically normalizes an absolute path; `.` is dropped and `..` pops a component.
pub fn normalize_abs(what: &str, p: &Path) -> Result<PathBuf> {
    if !p.is_absolute() {
        return Err(Error::path(format!(
            "{what} '{}' is not an absolute path",
            p.display()
        )));
    }
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::Prefix(_) | Component::RootDir => out.push(c.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || !out.has_root() {
                    return Err(Error::path(format!(
                        "{what} '{}' escapes the filesystem root",
                        p.display()
                    )));
                }
            }
            Component::Normal(seg) => out.push(seg),
        }
    }
    Ok(out)
}

/// Joins a user-supplied path onto `base` unless it is already absolute.
pub fn resolve_user_path(base: &Path, raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::path("empty path"));
    }
    let pb = PathBuf::from(raw);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

pub fn path_str(p: &Path) -> Result<&str> {
    p.to_str()
        .ok_or_else(|| Error::path(format!("path is not valid UTF-8: {}", p.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots() -> RootPaths {
        RootPaths::with_defaults(Path::new("/src/libmpdclient")).expect("roots")
    }

    #[test]
    fn native_flavor_has_no_cross_file() {
        let spec = FlavorSpec::new("musl");
        let got = resolve(&spec, &roots(), "libmpdclient").expect("resolve");
        assert_eq!(got.build_dir, PathBuf::from("/src/libmpdclient/output/musl"));
        assert_eq!(
            got.install_prefix,
            PathBuf::from("/usr/local/stow/libmpdclient-musl")
        );
        assert_eq!(got.cross_file, None);
    }

    #[test]
    fn cross_flavor_prefix_is_arch_qualified() {
        let spec = FlavorSpec::new("win32").cross("i686-w64-mingw32");
        let got = resolve(&spec, &roots(), "libmpdclient").expect("resolve");
        assert_eq!(
            got.install_prefix,
            PathBuf::from("/usr/local/stow/libmpdclient-win32/i686-w64-mingw32")
        );
        assert_eq!(
            got.cross_file,
            Some(PathBuf::from("/src/libmpdclient/build/cross/win32.txt"))
        );
    }

    #[test]
    fn rejects_names_that_escape_their_parent() {
        for bad in ["", "..", ".", "a/b", "../etc", "a\\b", " debug"] {
            let spec = FlavorSpec::new(bad);
            let err = resolve(&spec, &roots(), "libmpdclient").unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::Path, "name {bad:?}");
        }
    }

    #[test]
    fn rejects_triple_with_separator() {
        let spec = FlavorSpec::new("win64").cross("x86_64/../../etc");
        let err = resolve(&spec, &roots(), "libmpdclient").unwrap_err();
        assert!(err.to_string().contains("target triple"), "{err}");
    }

    #[test]
    fn normalize_drops_dot_and_folds_parent() {
        let got = normalize_abs("x", Path::new("/a/./b/../c")).expect("normalize");
        assert_eq!(got, PathBuf::from("/a/c"));
        assert!(normalize_abs("x", Path::new("relative/dir")).is_err());
        assert!(normalize_abs("x", Path::new("/..")).is_err());
    }
}

//! Config Inspector: the only component that looks inside a package's
//! configuration blob.
//!
//! Everything else in this workspace treats a config blob as opaque bytes
//! to be handed to an executor. This crate extracts exactly two fields —
//! the package name and its declared build-time dependencies — and
//! nothing else; it does not validate or interpret the rest of the
//! document.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("config blob is not valid YAML: {0}")]
    InvalidYaml(String),
    #[error("config blob is missing required field `package.name`")]
    MissingName,
}

/// The bits of a config blob the orchestrator core needs to plan a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDescriptor {
    pub name: String,
    pub build_deps: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    package: RawPackage,
}

#[derive(Debug, Deserialize)]
struct RawPackage {
    name: Option<String>,
    #[serde(default)]
    build_deps: Vec<String>,
}

/// Parse a config blob, extracting `package.name` and
/// `package.build_deps`. Any other top-level keys are ignored.
pub fn inspect(config_blob: &str) -> Result<PackageDescriptor, DescriptorError> {
    let doc: RawDocument = serde_yaml::from_str(config_blob)
        .map_err(|e| DescriptorError::InvalidYaml(e.to_string()))?;

    let name = doc.package.name.ok_or(DescriptorError::MissingName)?;
    if name.trim().is_empty() {
        return Err(DescriptorError::MissingName);
    }

    Ok(PackageDescriptor {
        name,
        build_deps: doc.package.build_deps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_name_and_deps() {
        let blob = r#"
package:
  name: widget
  build_deps: ["libcore", "libfoo"]
toolchain: stable
"#;
        let desc = inspect(blob).unwrap();
        assert_eq!(desc.name, "widget");
        assert_eq!(desc.build_deps, vec!["libcore", "libfoo"]);
    }

    #[test]
    fn defaults_build_deps_to_empty() {
        let blob = "package:\n  name: widget\n";
        let desc = inspect(blob).unwrap();
        assert!(desc.build_deps.is_empty());
    }

    #[test]
    fn rejects_missing_name() {
        let blob = "package:\n  build_deps: []\n";
        assert_eq!(inspect(blob).unwrap_err(), DescriptorError::MissingName);
    }

    #[test]
    fn rejects_blank_name() {
        let blob = "package:\n  name: \"\"\n";
        assert_eq!(inspect(blob).unwrap_err(), DescriptorError::MissingName);
    }

    #[test]
    fn rejects_invalid_yaml() {
        let blob = "not: [valid";
        assert!(matches!(
            inspect(blob).unwrap_err(),
            DescriptorError::InvalidYaml(_)
        ));
    }

    #[test]
    fn ignores_unrelated_top_level_keys() {
        let blob = r#"
package:
  name: widget
pipelines:
  build: "echo hi"
extra:
  nested:
    - 1
    - 2
"#;
        let desc = inspect(blob).unwrap();
        assert_eq!(desc.name, "widget");
    }
}

//! Direct file edits for code-edit steps.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::debug;

use crate::plan::FileChange;

/// Join a plan-relative path onto `root`, refusing paths that escape it.
pub fn resolve_in_root(root: &Path, relative: &Path) -> Result<PathBuf> {
    if relative.as_os_str().is_empty() {
        bail!("empty path");
    }
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => bail!(
                "path '{}' must be relative to the working tree",
                relative.display()
            ),
        }
    }
    Ok(root.join(relative))
}

/// Apply a `write` or `replace` change. Returns a one-line summary.
///
/// `instruct` changes need the driver and are rejected here.
pub fn apply_change(root: &Path, file: &Path, change: &FileChange) -> Result<String> {
    let path = resolve_in_root(root, file)?;
    match change {
        FileChange::Write { contents } => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
            fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
            debug!(path = %path.display(), bytes = contents.len(), "wrote file");
            Ok(format!("wrote {} bytes to {}", contents.len(), file.display()))
        }
        FileChange::Replace { find, replace } => {
            if find.is_empty() {
                bail!("replace pattern for {} is empty", file.display());
            }
            let current =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            let count = current.matches(find.as_str()).count();
            if count == 0 {
                return Err(anyhow!("text to replace not found in {}", file.display()));
            }
            fs::write(&path, current.replace(find.as_str(), replace))
                .with_context(|| format!("write {}", path.display()))?;
            debug!(path = %path.display(), count, "replaced text");
            Ok(format!("replaced {count} occurrence(s) in {}", file.display()))
        }
        FileChange::Instruct { .. } => Err(anyhow!(
            "instruct changes for {} must go through the driver",
            file.display()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_creates_parent_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let change = FileChange::Write {
            contents: "x = 1\n".to_string(),
        };
        let summary =
            apply_change(temp.path(), Path::new("pkg/mod.py"), &change).expect("apply");
        assert_eq!(summary, "wrote 6 bytes to pkg/mod.py");
        assert_eq!(
            fs::read_to_string(temp.path().join("pkg/mod.py")).expect("read"),
            "x = 1\n"
        );
    }

    #[test]
    fn replace_rewrites_every_occurrence() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.py"), "foo(); foo()\n").expect("write");
        let change = FileChange::Replace {
            find: "foo".to_string(),
            replace: "bar".to_string(),
        };
        let summary = apply_change(temp.path(), Path::new("a.py"), &change).expect("apply");
        assert_eq!(summary, "replaced 2 occurrence(s) in a.py");
        assert_eq!(
            fs::read_to_string(temp.path().join("a.py")).expect("read"),
            "bar(); bar()\n"
        );
    }

    #[test]
    fn replace_fails_when_text_is_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.py"), "x = 1\n").expect("write");
        let change = FileChange::Replace {
            find: "missing".to_string(),
            replace: "y".to_string(),
        };
        let err = apply_change(temp.path(), Path::new("a.py"), &change).expect_err("absent");
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(resolve_in_root(temp.path(), Path::new("../outside.py")).is_err());
        assert!(resolve_in_root(temp.path(), Path::new("/etc/passwd")).is_err());
        assert!(resolve_in_root(temp.path(), Path::new("./a/b.py")).is_ok());
    }
}

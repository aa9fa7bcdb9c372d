use crate::config::{is_reserved, InstalledFileSet};
use crate::error::{Result, UpdaterError};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Copy the staged payload over the installation.
///
/// Every `file_set` name found in `content_root` is overwritten or created.
/// Other top-level files are only added when the installation does not have
/// them yet; hidden files and the data store are never copied. Returns the
/// number of files written.
///
/// Not transactional: a failure part way leaves earlier files replaced.
#[tracing::instrument(skip_all, fields(install_dir = %install_dir.display()))]
pub fn apply(content_root: &Path, install_dir: &Path, file_set: &InstalledFileSet) -> Result<usize> {
    fs::create_dir_all(install_dir).map_err(UpdaterError::fs(install_dir))?;
    let mut written = 0usize;

    for name in file_set.iter() {
        if is_reserved(name) {
            continue;
        }
        let source = content_root.join(name);
        if !source.is_file() {
            debug!(file = name, "not shipped in this release");
            continue;
        }
        copy_into(&source, &install_dir.join(name))?;
        debug!(file = name, "updated");
        written += 1;
    }

    for name in extra_files(content_root, file_set)? {
        let target = install_dir.join(&name);
        if target.exists() {
            debug!(file = %name, "extra file already installed, keeping it");
            continue;
        }
        copy_into(&content_root.join(&name), &target)?;
        debug!(file = %name, "added");
        written += 1;
    }

    info!(files = written, "update files installed");
    Ok(written)
}

/// Regular top-level files outside the file set, in name order.
fn extra_files(content_root: &Path, file_set: &InstalledFileSet) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(content_root).map_err(UpdaterError::fs(content_root))? {
        let entry = entry.map_err(UpdaterError::fs(content_root))?;
        if !entry
            .file_type()
            .map_err(UpdaterError::fs(entry.path()))?
            .is_file()
        {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if name.starts_with('.') || is_reserved(&name) || file_set.contains(&name) {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

fn copy_into(source: &Path, target: &Path) -> Result<()> {
    fs::copy(source, target).map_err(UpdaterError::fs(target))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RESERVED_DATA_FILE;
    use tempfile::tempdir;

    #[test]
    fn copies_exactly_the_shipped_subset() {
        let staged = tempdir().unwrap();
        let install = tempdir().unwrap();
        fs::write(staged.path().join("main.js"), "new main").unwrap();
        fs::write(staged.path().join("index.html"), "new index").unwrap();
        fs::write(install.path().join("main.js"), "old main").unwrap();
        fs::write(install.path().join("preload.js"), "old preload").unwrap();

        let written = apply(staged.path(), install.path(), &InstalledFileSet::default()).unwrap();

        assert_eq!(written, 2);
        assert_eq!(fs::read_to_string(install.path().join("main.js")).unwrap(), "new main");
        assert_eq!(fs::read_to_string(install.path().join("index.html")).unwrap(), "new index");
        assert_eq!(
            fs::read_to_string(install.path().join("preload.js")).unwrap(),
            "old preload"
        );
    }

    #[test]
    fn data_store_in_release_is_ignored() {
        let staged = tempdir().unwrap();
        let install = tempdir().unwrap();
        fs::write(staged.path().join("main.js"), "new").unwrap();
        fs::write(staged.path().join(RESERVED_DATA_FILE), r#"{"items":[]}"#).unwrap();
        fs::write(install.path().join(RESERVED_DATA_FILE), r#"{"items":[1,2,3]}"#).unwrap();

        let written = apply(staged.path(), install.path(), &InstalledFileSet::default()).unwrap();

        assert_eq!(written, 1);
        assert_eq!(
            fs::read_to_string(install.path().join(RESERVED_DATA_FILE)).unwrap(),
            r#"{"items":[1,2,3]}"#
        );
    }

    #[test]
    fn extra_files_are_added_but_never_overwritten() {
        let staged = tempdir().unwrap();
        let install = tempdir().unwrap();
        fs::write(staged.path().join("LICENSE"), "new license").unwrap();
        fs::write(staged.path().join("README.md"), "readme").unwrap();
        fs::write(staged.path().join(".gitignore"), "node_modules").unwrap();
        fs::create_dir(staged.path().join("docs")).unwrap();
        fs::write(install.path().join("LICENSE"), "old license").unwrap();

        let written = apply(staged.path(), install.path(), &InstalledFileSet::default()).unwrap();

        assert_eq!(written, 1);
        assert_eq!(fs::read_to_string(install.path().join("LICENSE")).unwrap(), "old license");
        assert!(install.path().join("README.md").exists());
        assert!(!install.path().join(".gitignore").exists());
        assert!(!install.path().join("docs").exists());
    }
}

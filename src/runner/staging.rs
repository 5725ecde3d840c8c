//! Local staging area pushed to a remote environment before launch.
//!
//! Layout of the staging directory:
//!
//! ```text
//! input.json          {"<task_id>": <input payload>}
//! agent_args.json     agent arguments
//! setup_script.sh     benchmark setup script, mode 0755 (optional)
//! <dest>...           auxiliary files declared by the payload
//! ```

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde_json::Value;
use tempfile::TempDir;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::task::Task;
use crate::error::StagingError;

pub const INPUT_FILE: &str = "input.json";
pub const AGENT_ARGS_FILE: &str = "agent_args.json";
pub const SETUP_SCRIPT_FILE: &str = "setup_script.sh";

/// A temporary directory holding one task's inputs. Removed on drop.
#[derive(Debug)]
pub struct StagingArea {
    dir: TempDir,
    staged_files: usize,
    skipped_files: usize,
}

impl StagingArea {
    /// Builds the staging area for a task.
    ///
    /// Auxiliary files that cannot be copied are logged and skipped; only
    /// failures to write the input and argument files are fatal.
    pub fn prepare(
        task: &Task,
        agent_args: &Value,
        setup_script: Option<&Path>,
    ) -> Result<Self, StagingError> {
        let dir = tempfile::Builder::new()
            .prefix("agent-staging-")
            .tempdir()
            .map_err(|e| StagingError::DirectoryCreationFailed(e.to_string()))?;
        let root = dir.path();

        let mut input = serde_json::Map::with_capacity(1);
        input.insert(task.id.clone(), task.input.clone());
        fs::write(root.join(INPUT_FILE), serde_json::to_vec(&input)?)?;
        fs::write(root.join(AGENT_ARGS_FILE), serde_json::to_vec(agent_args)?)?;

        let mut staged_files = 0;
        let mut skipped_files = 0;
        for (dest, src) in task.files() {
            match stage_file(root, &dest, &src) {
                Ok(()) => staged_files += 1,
                Err(e) => {
                    warn!(
                        task_id = %task.id,
                        source = %src.display(),
                        destination = %dest,
                        error = %e,
                        "Failed to stage task file, skipping"
                    );
                    skipped_files += 1;
                }
            }
        }

        if let Some(script) = setup_script {
            if script.exists() {
                stage_setup_script(root, script)?;
            } else {
                warn!(path = %script.display(), "Setup script not found, not staging it");
            }
        }

        debug!(
            task_id = %task.id,
            staged = staged_files,
            skipped = skipped_files,
            dir = %root.display(),
            "Staging area ready"
        );

        Ok(Self {
            dir,
            staged_files,
            skipped_files,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Number of auxiliary file entries copied.
    pub fn staged_files(&self) -> usize {
        self.staged_files
    }

    /// Number of auxiliary file entries that failed to copy.
    pub fn skipped_files(&self) -> usize {
        self.skipped_files
    }
}

/// Maps a declared destination onto a path relative to the staging root.
///
/// A `/root/` prefix and leading slashes are dropped. Destinations that
/// would escape the staging root are rejected.
pub fn normalize_destination(dest: &str) -> Option<PathBuf> {
    let trimmed = dest.replace("/root/", "");
    let relative = Path::new(trimmed.trim_start_matches('/'));

    let mut normalized = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    if normalized.as_os_str().is_empty() {
        None
    } else {
        Some(normalized)
    }
}

fn stage_file(root: &Path, dest: &str, src: &Path) -> Result<(), StagingError> {
    let relative = normalize_destination(dest).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("destination '{}' is outside the staging area", dest),
        )
    })?;
    let target = root.join(relative);

    if src.is_dir() {
        copy_tree(src, &target)?;
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, &target)?;
    }
    Ok(())
}

/// Recursively copies a directory, merging into an existing target.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn stage_setup_script(root: &Path, script: &Path) -> Result<(), StagingError> {
    let target = root.join(SETUP_SCRIPT_FILE);
    fs::copy(script, &target).map_err(|e| StagingError::SetupScript {
        path: script.to_path_buf(),
        reason: e.to_string(),
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755)).map_err(|e| {
            StagingError::SetupScript {
                path: script.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_destination() {
        assert_eq!(
            normalize_destination("data/x.csv"),
            Some(PathBuf::from("data/x.csv"))
        );
        assert_eq!(
            normalize_destination("/root/environment/data.csv"),
            Some(PathBuf::from("environment/data.csv"))
        );
        assert_eq!(
            normalize_destination("//abs/./file"),
            Some(PathBuf::from("abs/file"))
        );
        assert_eq!(normalize_destination("../escape"), None);
        assert_eq!(normalize_destination("a/../../escape"), None);
        assert_eq!(normalize_destination("/"), None);
    }

    #[test]
    fn test_stages_input_and_args() {
        let task = Task::new("task-1", json!({"prompt": "solve it"}));
        let staging = StagingArea::prepare(&task, &json!({"model_name": "m"}), None).unwrap();

        let input: Value =
            serde_json::from_slice(&fs::read(staging.path().join(INPUT_FILE)).unwrap()).unwrap();
        assert_eq!(input, json!({"task-1": {"prompt": "solve it"}}));

        let args: Value =
            serde_json::from_slice(&fs::read(staging.path().join(AGENT_ARGS_FILE)).unwrap())
                .unwrap();
        assert_eq!(args, json!({"model_name": "m"}));
        assert!(!staging.path().join(SETUP_SCRIPT_FILE).exists());
    }

    #[test]
    fn test_stages_declared_file_with_identical_bytes() {
        let local = TempDir::new().unwrap();
        let src = local.path().join("x.csv");
        let bytes = b"id,value\n1,\xff\x00binary\n".to_vec();
        fs::write(&src, &bytes).unwrap();

        let task = Task::new(
            "task-1",
            json!({"files": {"data/x.csv": src.to_string_lossy()}}),
        );
        let staging = StagingArea::prepare(&task, &json!({}), None).unwrap();

        let staged = fs::read(staging.path().join("data/x.csv")).unwrap();
        assert_eq!(staged, bytes);
        assert_eq!(staging.staged_files(), 1);
        assert_eq!(staging.skipped_files(), 0);
    }

    #[test]
    fn test_stages_directory_tree() {
        let local = TempDir::new().unwrap();
        let tree = local.path().join("repo");
        fs::create_dir_all(tree.join("src/nested")).unwrap();
        fs::write(tree.join("README"), "readme").unwrap();
        fs::write(tree.join("src/nested/lib.rs"), "fn main() {}").unwrap();

        let task = Task::new(
            "task-1",
            json!({"files": {"/root/workspace/repo": tree.to_string_lossy()}}),
        );
        let staging = StagingArea::prepare(&task, &json!({}), None).unwrap();

        let root = staging.path().join("workspace/repo");
        assert_eq!(fs::read_to_string(root.join("README")).unwrap(), "readme");
        assert_eq!(
            fs::read_to_string(root.join("src/nested/lib.rs")).unwrap(),
            "fn main() {}"
        );
    }

    #[test]
    fn test_missing_file_is_skipped() {
        let local = TempDir::new().unwrap();
        let good = local.path().join("good.txt");
        fs::write(&good, "ok").unwrap();

        let task = Task::new(
            "task-1",
            json!({"files": {
                "missing.txt": "/definitely/not/here.txt",
                "good.txt": good.to_string_lossy(),
                "../outside.txt": good.to_string_lossy(),
            }}),
        );
        let staging = StagingArea::prepare(&task, &json!({}), None).unwrap();

        assert!(staging.path().join("good.txt").exists());
        assert!(!staging.path().join("missing.txt").exists());
        assert_eq!(staging.staged_files(), 1);
        assert_eq!(staging.skipped_files(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_setup_script_is_executable() {
        use std::os::unix::fs::PermissionsExt;

        let local = TempDir::new().unwrap();
        let script = local.path().join("setup.sh");
        fs::write(&script, "#!/bin/bash\necho setup\n").unwrap();

        let task = Task::new("task-1", json!({}));
        let staging = StagingArea::prepare(&task, &json!({}), Some(&script)).unwrap();

        let staged = staging.path().join(SETUP_SCRIPT_FILE);
        let mode = fs::metadata(&staged).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(
            fs::read_to_string(staged).unwrap(),
            "#!/bin/bash\necho setup\n"
        );
    }

    #[test]
    fn test_staging_dir_removed_on_drop() {
        let task = Task::new("task-1", json!({}));
        let staging = StagingArea::prepare(&task, &json!({}), None).unwrap();
        let path = staging.path().to_path_buf();
        assert!(path.exists());
        drop(staging);
        assert!(!path.exists());
    }
}

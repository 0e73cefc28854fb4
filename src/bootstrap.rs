//! Project bootstrap: the `assets/` output directory and a default `.env`.

use std::io::Write;
use std::path::Path;

use tracing::warn;

use crate::env_file::{EnvEntries, EnvStore};
use crate::errors::Result;

/// Creates whatever is missing under `root`, reporting each step to `out`.
/// Returns `true` when nothing failed.
pub fn init<W: Write>(root: &Path, env_file: &Path, out: &mut W) -> Result<bool> {
    let mut ok = true;

    let assets = root.join("assets");
    if !assets.exists() {
        writeln!(out, "No \"assets/\" folder was found")?;
        match std::fs::create_dir_all(&assets) {
            Ok(()) => writeln!(out, "Created \"assets/\" folder")?,
            Err(err) => {
                warn!(path = %assets.display(), error = %err, "failed to create assets folder");
                writeln!(out, "Failed to create \"assets/\"")?;
                ok = false;
            }
        }
    }

    let store = EnvStore::new(root.join(env_file));
    if !store.path().exists() {
        writeln!(out, "No \"{}\" file was found", env_file.display())?;
        let defaults = EnvEntries::defaults();
        match store.write(&defaults) {
            Ok(()) => {
                writeln!(
                    out,
                    "Created \"{}\" file with the following content:",
                    env_file.display()
                )?;
                write!(out, "{}", defaults.render())?;
            }
            Err(err) => {
                warn!(error = %err, "failed to create config file");
                writeln!(out, "Failed to create \"{}\"", env_file.display())?;
                ok = false;
            }
        }
    }

    if ok {
        writeln!(out, "Project is ready.")?;
    }
    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_assets_and_default_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();

        assert!(init(dir.path(), Path::new(".env"), &mut out).unwrap());

        assert!(dir.path().join("assets").is_dir());
        assert_eq!(
            std::fs::read_to_string(dir.path().join(".env")).unwrap(),
            "GIN_MODE=debug\nPORT=:3000\nDB_FILE=database.db\n"
        );
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Created \"assets/\" folder"));
        assert!(text.contains("Created \".env\" file"));
    }

    #[test]
    fn leaves_existing_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join(".env"), "PORT=:9000\n").unwrap();
        let mut out = Vec::new();

        assert!(init(dir.path(), Path::new(".env"), &mut out).unwrap());

        assert_eq!(
            std::fs::read_to_string(dir.path().join(".env")).unwrap(),
            "PORT=:9000\n"
        );
        assert_eq!(String::from_utf8(out).unwrap(), "Project is ready.\n");
    }

    #[test]
    fn reports_failure_without_erroring() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        let mut out = Vec::new();

        let ok = init(dir.path(), Path::new("nested/missing/.env"), &mut out).unwrap();

        assert!(!ok);
        assert!(String::from_utf8(out).unwrap().contains("Failed to create"));
    }
}

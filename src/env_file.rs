//! Private environment files.
//!
//! A unit's environment (including the hub's auth token) is handed over
//! through a file the manager reads at launch, never through command-line
//! text, which would be visible in process listings.  The file and its
//! directory are owner-only; values are shell-quoted, one `KEY=value`
//! line per variable, sorted by key.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{Error, Result};

/// Valid environment variable names: `[A-Za-z_][A-Za-z0-9_]*`.
fn is_valid_key(key: &str) -> bool {
    let mut bytes = key.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() || b == b'_' => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Ensure `dir` exists and is private to its owner.
///
/// A pre-existing directory with group or other bits set is tightened to
/// 0700 and re-checked afterwards; some filesystems ignore the chmod, in
/// which case all we can do is warn.
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)?;
    let mode = fs::metadata(dir)?.permissions().mode();
    if mode & 0o077 == 0 {
        return Ok(());
    }
    warn!(
        "fixing permissions on environment directory {}: {:o}",
        dir.display(),
        mode & 0o7777
    );
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    let mode = fs::metadata(dir)?.permissions().mode();
    if mode & 0o077 != 0 {
        warn!(
            "bad permissions on environment directory {}: {:o}",
            dir.display(),
            mode & 0o7777
        );
    }
    Ok(())
}

/// Write the environment file for `unit_name` under `dir` and return its
/// path.  The file is readable only by its owner (0400).
pub fn write_env_file(
    dir: &Path,
    unit_name: &str,
    environment: &BTreeMap<String, String>,
) -> Result<PathBuf> {
    write(dir, &format!("{unit_name}.env"), environment, 0o400)
}

pub(crate) fn write(
    dir: &Path,
    file_name: &str,
    environment: &BTreeMap<String, String>,
    mode: u32,
) -> Result<PathBuf> {
    // Validate and quote everything up front so a bad entry can never
    // leave a partially written file behind.
    let mut content = String::new();
    for (key, value) in environment {
        if !is_valid_key(key) {
            return Err(Error::InvalidEnvironmentKey(key.clone()));
        }
        let quoted = shlex::try_quote(value)
            .map_err(|_| Error::UnquotableEnvironmentValue(key.clone()))?;
        content.push_str(key);
        content.push('=');
        content.push_str(&quoted);
        content.push('\n');
    }

    ensure_private_dir(dir)?;
    let path = dir.join(file_name);
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(&path)?;
    // The open mode only applies to newly created files; fchmod the open
    // descriptor so a pre-existing file is restricted before any content
    // reaches it.
    file.set_permissions(fs::Permissions::from_mode(mode))?;
    file.write_all(content.as_bytes())?;
    Ok(path)
}

/// Remove a credential artifact, tolerating its absence.
///
/// Handles both the single environment file of a transient unit and the
/// per-server secrets directory of a pre-installed unit.
pub fn remove_credentials(path: &Path) -> Result<()> {
    let result = match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(
                "credentials at {} were already removed",
                path.display()
            );
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn parse_back(path: &Path) -> BTreeMap<String, String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| {
                let token = shlex::split(line).unwrap().remove(0);
                let (k, v) = token.split_once('=').unwrap();
                (k.to_string(), v.to_string())
            })
            .collect()
    }

    #[test]
    fn round_trips_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let environment = env(&[
            ("ZEBRA", "last"),
            ("API_TOKEN", "s3cret value"),
            ("PATH", "/usr/bin:/bin"),
        ]);
        let path =
            write_env_file(dir.path(), "unit-alice", &environment).unwrap();

        assert_eq!(parse_back(&path), environment);

        let keys: Vec<_> = fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| l.split('=').next().unwrap().to_string())
            .collect();
        assert_eq!(keys, ["API_TOKEN", "PATH", "ZEBRA"]);
    }

    #[test]
    fn ends_with_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path =
            write_env_file(dir.path(), "unit", &env(&[("A", "1")])).unwrap();
        assert!(fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[test]
    fn restricts_modes() {
        let dir = tempfile::tempdir().unwrap();
        let envdir = dir.path().join("envs");
        let path =
            write_env_file(&envdir, "unit", &env(&[("A", "1")])).unwrap();
        let dir_mode = fs::metadata(&envdir).unwrap().permissions().mode();
        let file_mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        assert_eq!(file_mode & 0o777, 0o400);
    }

    #[test]
    fn tightens_loose_directories() {
        let dir = tempfile::tempdir().unwrap();
        let envdir = dir.path().join("envs");
        fs::create_dir(&envdir).unwrap();
        fs::set_permissions(&envdir, fs::Permissions::from_mode(0o755)).unwrap();

        ensure_private_dir(&envdir).unwrap();
        let mode = fs::metadata(&envdir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn rejects_invalid_keys_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        for bad in ["1BAD", "WITH SPACE", "DASH-ED", "", "Ä"] {
            let err = write_env_file(dir.path(), "unit", &env(&[(bad, "v")]))
                .unwrap_err();
            assert!(matches!(err, Error::InvalidEnvironmentKey(_)), "{bad}");
        }
        assert!(!dir.path().join("unit.env").exists());
    }

    #[test]
    fn rewrites_after_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path =
            write_env_file(dir.path(), "unit", &env(&[("A", "1"), ("B", "2")]))
                .unwrap();
        remove_credentials(&path).unwrap();
        let path =
            write_env_file(dir.path(), "unit", &env(&[("A", "3")])).unwrap();
        assert_eq!(parse_back(&path), env(&[("A", "3")]));
    }

    #[test]
    fn removal_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let path =
            write_env_file(dir.path(), "unit", &env(&[("A", "1")])).unwrap();
        remove_credentials(&path).unwrap();
        assert!(!path.exists());
        remove_credentials(&path).unwrap();
    }

    #[test]
    fn removal_handles_directories() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = dir.path().join("secrets");
        write(&secrets, "envfile", &env(&[("A", "1")]), 0o600).unwrap();
        remove_credentials(&secrets).unwrap();
        assert!(!secrets.exists());
    }
}

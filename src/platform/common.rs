use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::process::Command;

/// Atomically write content to a file
///
/// Writes to a sibling temporary file, syncs it, then renames it over the
/// target so readers never observe a half-written credit or identity file.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    write_and_rename(path, content, None)
}

/// Like [`atomic_write`], but the temporary file is created with `mode`
///
/// The content is never readable with looser permissions, not even before
/// the rename. Windows ignores `mode`.
pub fn atomic_write_with_mode(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    write_and_rename(path, content, Some(mode))
}

fn write_and_rename(path: &Path, content: &[u8], mode: Option<u32>) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory_exists(parent)?;
    }

    let temp_path = path.with_extension("tmp");

    {
        let mut file = open_temp_file(&temp_path, mode).with_context(|| {
            format!("Failed to create temporary file: {}", temp_path.display())
        })?;

        file.write_all(content)
            .context("Failed to write to temporary file")?;

        file.sync_all().context("Failed to sync file to disk")?;
    }

    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}

fn open_temp_file(temp_path: &Path, mode: Option<u32>) -> std::io::Result<File> {
    let Some(mode) = mode else {
        return File::create(temp_path);
    };

    // A leftover temp file would keep its old permissions
    match std::fs::remove_file(temp_path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    #[cfg(not(unix))]
    let _ = mode;

    options.open(temp_path)
}

/// Ensure a directory exists, creating it and all parents if needed
pub fn ensure_directory_exists(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() || path.exists() {
        return Ok(());
    }

    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    Ok(())
}

/// Set file permissions to a specific mode (Unix only, clears read-only on Windows)
pub fn set_file_permissions(path: &Path, mode: u32) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to get metadata for: {}", path.display()))?;
    let mut permissions = metadata.permissions();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        permissions.set_mode(mode);
    }

    #[cfg(not(unix))]
    {
        let _ = mode;
        permissions.set_readonly(false);
    }

    std::fs::set_permissions(path, permissions)
        .with_context(|| format!("Failed to set permissions for: {}", path.display()))?;

    Ok(())
}

/// Run a command, returning Ok only if it exits successfully
pub fn try_command(cmd: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run {}", cmd))?;

    if output.status.success() {
        Ok(())
    } else {
        anyhow::bail!("Command failed: {} {:?}", cmd, args)
    }
}

/// Run a command and capture its trimmed stdout
pub fn command_output(cmd: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("Failed to run {}", cmd))?;

    if !output.status.success() {
        anyhow::bail!("Command failed: {} {:?}", cmd, args);
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

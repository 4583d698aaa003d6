use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Validates a file name taken from a meta object and joins it to `dir`.
///
/// Meta objects come from untrusted hosts, so the name must be a single
/// plain component. Rejects:
/// - Empty names and `.`
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
/// - Names with directory separators
pub fn destination_path(dir: &Path, file_name: &str) -> Result<PathBuf, TransferError> {
    if file_name.is_empty() {
        return Err(TransferError::InvalidPath("empty file name".into()));
    }

    let path = Path::new(file_name);
    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {file_name}"
        )));
    }

    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => Ok(dir.join(name)),
        (Some(Component::ParentDir), _) => Err(TransferError::InvalidPath(format!(
            "parent directory traversal not allowed: {file_name}"
        ))),
        (Some(Component::Prefix(_)), _) => Err(TransferError::InvalidPath(format!(
            "path prefix not allowed: {file_name}"
        ))),
        _ => Err(TransferError::InvalidPath(format!(
            "file name must be a single component: {file_name}"
        ))),
    }
}

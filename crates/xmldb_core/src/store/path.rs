//! Collection and document paths.

use crate::error::{CoreError, CoreResult};

/// Path of the root collection, which always exists.
pub const ROOT_COLLECTION: &str = "/db";

/// Normalizes a collection path to its absolute form.
///
/// Relative paths are resolved against `/db`; repeated and trailing slashes
/// are removed.
///
/// # Errors
///
/// Returns `InvalidOperation` for `.` or `..` segments, or an absolute path
/// outside `/db`.
pub fn normalize_path(path: &str) -> CoreResult<String> {
    let absolute = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{ROOT_COLLECTION}/{path}")
    };

    let mut out = String::new();
    for segment in absolute.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(CoreError::invalid_operation(format!(
                "relative segment in path '{path}'"
            )));
        }
        out.push('/');
        out.push_str(segment);
    }

    if out != ROOT_COLLECTION && !out.starts_with("/db/") {
        return Err(CoreError::invalid_operation(format!(
            "path '{path}' is outside {ROOT_COLLECTION}"
        )));
    }
    Ok(out)
}

/// Returns the parent collection path, or `None` for the root.
#[must_use]
pub fn parent_path(path: &str) -> Option<String> {
    if path == ROOT_COLLECTION {
        return None;
    }
    path.rfind('/')
        .filter(|&i| i > 0)
        .map(|i| path[..i].to_string())
}

/// Joins a collection path and a document name.
#[must_use]
pub fn document_path(collection: &str, name: &str) -> String {
    format!("{collection}/{name}")
}

/// Splits a document path into its collection and name.
///
/// # Errors
///
/// Returns `InvalidOperation` if the path does not name a document.
pub fn split_document_path(path: &str) -> CoreResult<(String, String)> {
    let normalized = normalize_path(path)?;
    match normalized.rfind('/') {
        Some(i) if normalized != ROOT_COLLECTION && i > 0 => {
            Ok((normalized[..i].to_string(), normalized[i + 1..].to_string()))
        }
        _ => Err(CoreError::invalid_operation(format!(
            "'{path}' is not a document path"
        ))),
    }
}

/// Checks a document name.
pub(crate) fn validate_name(name: &str) -> CoreResult<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(CoreError::invalid_operation(format!(
            "invalid document name '{name}'"
        )));
    }
    Ok(())
}

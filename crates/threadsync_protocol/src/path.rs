//! Relative path validation.

use crate::error::{ProtocolError, ProtocolResult};

/// Validates a thread-relative path as used on the wire and in the workspace.
///
/// Accepted paths use `/` separators, are relative, and contain no empty,
/// `.` or `..` segments. Backslashes are rejected outright so a path cannot
/// smuggle a traversal segment past a Windows-style separator.
pub fn validate_relative_path(path: &str) -> ProtocolResult<&str> {
    let reject = |reason| ProtocolError::InvalidPath {
        path: path.to_string(),
        reason,
    };

    if path.is_empty() {
        return Err(reject("path is empty"));
    }
    if path.contains('\0') {
        return Err(reject("path contains NUL"));
    }
    if path.contains('\\') {
        return Err(reject("path contains a backslash"));
    }
    if path.starts_with('/') {
        return Err(reject("path is absolute"));
    }
    // Drive letters such as `C:`
    if path.len() >= 2 && path.as_bytes()[1] == b':' {
        return Err(reject("path is absolute"));
    }

    for segment in path.split('/') {
        match segment {
            "" => return Err(reject("path has an empty segment")),
            "." => return Err(reject("path has a `.` segment")),
            ".." => return Err(reject("path traverses to a parent directory")),
            _ => {}
        }
    }

    Ok(path)
}

/// Validates a thread id, which is used as a single URL and directory segment.
pub fn validate_thread_id(thread_id: &str) -> ProtocolResult<&str> {
    validate_relative_path(thread_id)?;
    if thread_id.contains('/') {
        return Err(ProtocolError::InvalidPath {
            path: thread_id.to_string(),
            reason: "thread id must be a single segment",
        });
    }
    Ok(thread_id)
}

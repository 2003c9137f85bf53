//! Property-based test generators using proptest.
//!
//! Histories draw their paths from a small pool so that edits, deletions
//! and re-creations of the same file actually collide.

use proptest::prelude::*;
use threadsync_engine::MemoryRemote;

use crate::fixtures::TestHarness;

/// Strategy for valid relative paths, optionally one directory deep.
pub fn relative_path_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("([a-z]{1,6}/)?[a-z]{1,8}\\.txt").expect("Invalid regex")
}

/// Strategy for file contents, empty files included.
pub fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

/// Strategy for a pool of `1..=max` distinct paths.
pub fn path_pool_strategy(max: usize) -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set(relative_path_strategy(), 1..=max.max(1))
        .prop_map(|paths| paths.into_iter().collect())
}

/// A change made on the remote by another device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp {
    /// Create or replace a file.
    Put {
        /// File path.
        path: String,
        /// New content.
        bytes: Vec<u8>,
    },
    /// Delete a file.
    Remove {
        /// File path.
        path: String,
    },
}

impl RemoteOp {
    /// Applies the change to `remote`.
    pub fn apply(&self, remote: &MemoryRemote) {
        match self {
            RemoteOp::Put { path, bytes } => {
                remote.put_file(path, bytes.clone());
            }
            RemoteOp::Remove { path } => remote.remove_file(path),
        }
    }
}

/// Applies every change of a history in order.
pub fn apply_history(remote: &MemoryRemote, history: &[RemoteOp]) {
    for op in history {
        op.apply(remote);
    }
}

/// Strategy for one remote change against a path pool.
pub fn remote_op_strategy(paths: Vec<String>) -> impl Strategy<Value = RemoteOp> {
    let put_paths = paths.clone();
    prop_oneof![
        3 => (prop::sample::select(put_paths), content_strategy())
            .prop_map(|(path, bytes)| RemoteOp::Put { path, bytes }),
        1 => prop::sample::select(paths).prop_map(|path| RemoteOp::Remove { path }),
    ]
}

/// Strategy for remote histories of up to `max_ops` changes over at most
/// `max_paths` paths.
pub fn remote_history_strategy(
    max_paths: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<RemoteOp>> {
    path_pool_strategy(max_paths).prop_flat_map(move |paths| {
        prop::collection::vec(remote_op_strategy(paths), 0..=max_ops)
    })
}

/// A change made by the user in the local mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEdit {
    /// Create or overwrite a file.
    Write {
        /// File path.
        path: String,
        /// New content.
        bytes: Vec<u8>,
    },
    /// Delete a file if it exists.
    Remove {
        /// File path.
        path: String,
    },
}

impl LocalEdit {
    /// Applies the edit to the harness's mirror.
    pub fn apply(&self, harness: &TestHarness) {
        match self {
            LocalEdit::Write { path, bytes } => harness.write_local(path, bytes),
            LocalEdit::Remove { path } => {
                if harness.read_local(path).is_some() {
                    harness.remove_local(path);
                }
            }
        }
    }

    /// Returns the edited path.
    pub fn path(&self) -> &str {
        match self {
            LocalEdit::Write { path, .. } | LocalEdit::Remove { path } => path,
        }
    }
}

/// Strategy for local edits against a path pool.
pub fn local_edits_strategy(
    paths: Vec<String>,
    max_edits: usize,
) -> impl Strategy<Value = Vec<LocalEdit>> {
    let write_paths = paths.clone();
    let edit = prop_oneof![
        3 => (prop::sample::select(write_paths), content_strategy())
            .prop_map(|(path, bytes)| LocalEdit::Write { path, bytes }),
        1 => prop::sample::select(paths).prop_map(|path| LocalEdit::Remove { path }),
    ];
    prop::collection::vec(edit, 0..=max_edits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadsync_protocol::validate_relative_path;

    proptest! {
        #[test]
        fn generated_paths_are_valid(path in relative_path_strategy()) {
            prop_assert!(validate_relative_path(&path).is_ok());
        }

        #[test]
        fn histories_stay_within_pool(history in remote_history_strategy(3, 10)) {
            let paths: std::collections::BTreeSet<_> = history
                .iter()
                .map(|op| match op {
                    RemoteOp::Put { path, .. } | RemoteOp::Remove { path } => path.clone(),
                })
                .collect();
            prop_assert!(paths.len() <= 3);
            prop_assert!(history.len() <= 10);
        }
    }

    #[test]
    fn applying_history_updates_remote() {
        let remote = MemoryRemote::new("t1");
        apply_history(
            &remote,
            &[
                RemoteOp::Put { path: "a.txt".into(), bytes: b"1".to_vec() },
                RemoteOp::Put { path: "b.txt".into(), bytes: b"2".to_vec() },
                RemoteOp::Remove { path: "a.txt".into() },
            ],
        );
        assert_eq!(remote.files(), vec!["b.txt".to_string()]);
    }
}

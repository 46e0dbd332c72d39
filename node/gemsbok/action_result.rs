use crate::CacheError;
use common::Digest;
use std::path::{Component, Path, PathBuf};

/// One output file of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    /// Relative to the output root, `/` separated.
    pub path: String,
    pub digest: Digest,
    pub executable: bool,
}

/// The outputs of an action, in the order they were recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionResult {
    outputs: Vec<Output>,
}

impl ActionResult {
    pub fn new() -> Self {
        ActionResult::default()
    }

    pub fn add_output(&mut self, path: impl Into<String>, digest: Digest, executable: bool) {
        self.outputs.push(Output {
            path: path.into(),
            digest,
            executable,
        });
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub(crate) fn extend(&mut self, outputs: Vec<Output>) {
        self.outputs.extend(outputs);
    }
}

impl From<ActionResult> for protos::remote::ActionResult {
    fn from(result: ActionResult) -> Self {
        protos::remote::ActionResult {
            output: result
                .outputs
                .into_iter()
                .map(|output| protos::remote::Output {
                    path: output.path,
                    file_metadata: Some(protos::remote::FileMetadata {
                        digest: Some(output.digest.into()),
                        executable: output.executable,
                    }),
                })
                .collect(),
        }
    }
}

impl TryFrom<protos::remote::ActionResult> for ActionResult {
    type Error = CacheError;

    fn try_from(result: protos::remote::ActionResult) -> Result<Self, Self::Error> {
        let mut action_result = ActionResult::new();
        for output in result.output {
            let metadata = output.file_metadata.ok_or_else(|| {
                CacheError::Protocol(format!("output {} has no file metadata", output.path))
            })?;
            let digest = metadata.digest.ok_or_else(|| {
                CacheError::Protocol(format!("output {} has no digest", output.path))
            })?;
            action_result.add_output(output.path, Digest::try_from(digest)?, metadata.executable);
        }
        Ok(action_result)
    }
}

/// Path of `file` relative to `root`, as recorded in an [`ActionResult`].
pub(crate) fn relative_output_path(root: &Path, file: &Path) -> Result<String, CacheError> {
    let outside = || CacheError::PathOutsideRoot {
        root: root.to_path_buf(),
        path: file.to_path_buf(),
    };
    let relative = file.strip_prefix(root).map_err(|_| outside())?;
    if !is_plain_relative(relative) {
        return Err(outside());
    }
    let components = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| CacheError::NonUtf8Path(file.to_path_buf()))?;
    Ok(components.join("/"))
}

/// Where an output recorded as `path` lands under `root`.
pub(crate) fn output_location(root: &Path, path: &str) -> Result<PathBuf, CacheError> {
    let relative = Path::new(path);
    if !is_plain_relative(relative) {
        return Err(CacheError::PathOutsideRoot {
            root: root.to_path_buf(),
            path: relative.to_path_buf(),
        });
    }
    Ok(root.join(relative))
}

// Only normal components: no root, no prefix, no `.` or `..`.
fn is_plain_relative(path: &Path) -> bool {
    let mut components = path.components().peekable();
    components.peek().is_some() && components.all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths() {
        let root = Path::new("/exec/root");
        assert_eq!(
            relative_output_path(root, Path::new("/exec/root/a/foo")).unwrap(),
            "a/foo"
        );
        assert!(matches!(
            relative_output_path(root, Path::new("/exec/other/foo")),
            Err(CacheError::PathOutsideRoot { .. })
        ));
        assert!(matches!(
            relative_output_path(root, Path::new("/exec/root/../root2/foo")),
            Err(CacheError::PathOutsideRoot { .. })
        ));
        assert!(matches!(
            relative_output_path(root, Path::new("/exec/root")),
            Err(CacheError::PathOutsideRoot { .. })
        ));
    }

    #[test]
    fn output_locations_stay_under_root() {
        let root = Path::new("/exec/root");
        assert_eq!(
            output_location(root, "b/empty").unwrap(),
            PathBuf::from("/exec/root/b/empty")
        );
        for bad in ["../escape", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(output_location(root, bad), Err(CacheError::PathOutsideRoot { .. })),
                "{bad} accepted"
            );
        }
    }

    #[test]
    fn wire_round_trip_keeps_order() {
        let mut result = ActionResult::new();
        result.add_output("a/foo", Digest::of_bytes(b"foo"), false);
        result.add_output("b/empty", Digest::empty(), false);
        result.add_output("a/bar", Digest::of_bytes(b"bar"), true);
        let wire: protos::remote::ActionResult = result.clone().into();
        assert_eq!(wire.output[2].path, "a/bar");
        assert_eq!(ActionResult::try_from(wire).unwrap(), result);
    }

    #[test]
    fn wire_output_without_digest() {
        let wire = protos::remote::ActionResult {
            output: vec![protos::remote::Output {
                path: "a/foo".to_string(),
                file_metadata: Some(protos::remote::FileMetadata {
                    digest: None,
                    executable: false,
                }),
            }],
        };
        assert!(matches!(
            ActionResult::try_from(wire),
            Err(CacheError::Protocol(_))
        ));
    }
}

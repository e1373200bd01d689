use std::path::{Component, Path, PathBuf};

use crate::tools::ToolError;

/// The directory file and terminal tools are confined to.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `relative` under the root without touching the filesystem.
    ///
    /// `..` components may not climb above the root and absolute paths must
    /// already lie inside it.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, ToolError> {
        let requested = Path::new(relative.trim());
        let requested = if requested.is_absolute() {
            requested
                .strip_prefix(&self.root)
                .map_err(|_| escape_error(relative))?
                .to_path_buf()
        } else {
            requested.to_path_buf()
        };

        let mut resolved = self.root.clone();
        let mut depth = 0_usize;
        for component in requested.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(escape_error(relative));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => return Err(escape_error(relative)),
            }
        }
        Ok(resolved)
    }
}

fn escape_error(path: &str) -> ToolError {
    ToolError::InvalidArguments(format!("path `{path}` is outside the workspace"))
}

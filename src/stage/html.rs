use std::path::{Path, PathBuf};

use super::{output_path, read, Output};
use crate::error::Result;

/// Identity copy, keeping each file's path relative to the glob base
pub(super) fn copy(inputs: &[PathBuf], base: &Path, destination: &Path) -> Result<Vec<Output>> {
    inputs
        .iter()
        .map(|src| {
            Ok(Output {
                path: output_path(src, base, destination),
                contents: read(src)?,
            })
        })
        .collect()
}

//! Resolving master inputs into subproblem stubs and solver options

use crate::config::ConfigErrors;
use globset::{GlobBuilder, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Resolve `inputs` into stub paths
///
/// Files are taken as they are, directories are walked recursively and filtered by
/// `glob` (matched against file names). The result is absolute, sorted and free of
/// duplicates, so every slave sharing the file system can open each stub.
pub fn collect_stubs(inputs: &[PathBuf], glob: &str) -> Result<Vec<PathBuf>, ConfigErrors> {
    let matcher = GlobBuilder::new(glob).literal_separator(true).build()?.compile_matcher();
    debug!("Filtering with glob: {matcher:?}");

    let mut stubs = Vec::new();

    for input in inputs {
        let input = input
            .canonicalize()
            .map_err(|_| ConfigErrors::FileNotFound(input.clone()))?;

        if input.is_dir() {
            let before = stubs.len();
            stubs.extend(walk(&input, &matcher));

            if stubs.len() == before {
                warn!(dir = ?input, glob, "No stubs found in directory");
            }
        } else {
            stubs.push(input);
        }
    }

    Ok(stubs.into_iter().sorted().dedup().collect_vec())
}

fn walk<'a>(dir: &Path, matcher: &'a GlobMatcher) -> impl Iterator<Item = PathBuf> + 'a {
    WalkBuilder::new(dir)
        .standard_filters(false)
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!(error = %error, "Skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
        .filter(move |entry| entry.path().file_name().map_or(false, |name| matcher.is_match(name)))
        .map(DirEntry::into_path)
}

/// Solver options from a file, one option per line; surrounding whitespace is trimmed and
/// blank lines are skipped
pub fn read_options_file(path: &Path) -> Result<Vec<String>, ConfigErrors> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn walks_directories_and_keeps_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("batch/deep")).unwrap();
        for file in ["batch/a.nl", "batch/deep/b.nl", "batch/notes.txt", "c.stub"] {
            fs::write(root.join(file), b"").unwrap();
        }

        let stubs = collect_stubs(
            &[root.join("c.stub"), root.join("batch"), root.join("batch/a.nl")],
            "*.nl",
        )
        .unwrap();

        assert_eq!(
            stubs,
            vec![
                root.join("batch/a.nl"),
                root.join("batch/deep/b.nl"),
                root.join("c.stub"),
            ]
        );
    }

    #[test]
    fn missing_inputs_are_an_error() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            collect_stubs(&[dir.path().join("missing.nl")], "*.nl"),
            Err(ConfigErrors::FileNotFound(_))
        ));
        assert!(matches!(
            collect_stubs(&[dir.path().to_path_buf()], "[unclosed"),
            Err(ConfigErrors::InvalidGlob(_))
        ));
    }

    #[test]
    fn options_file_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options");
        fs::write(&path, "  -timeout=60\n\n-threads=1  \n   \n").unwrap();

        assert_eq!(
            read_options_file(&path).unwrap(),
            vec!["-timeout=60".to_string(), "-threads=1".to_string()]
        );
    }
}

//! Expansion of command-line inputs into manifest files.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use walkdir::WalkDir;

const MANIFEST_EXTENSION: &str = "jsonl";

/// Files are kept as given; directories contribute their `*.jsonl` files in
/// sorted order. Duplicates keep their first position.
pub fn expand_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut manifests = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found = Vec::new();
            for entry in WalkDir::new(input).follow_links(true) {
                let entry = entry.with_context(|| format!("walk {}", input.display()))?;
                let path = entry.path();
                if entry.file_type().is_file()
                    && path.extension().is_some_and(|ext| ext == MANIFEST_EXTENSION)
                {
                    found.push(path.to_path_buf());
                }
            }
            found.sort();
            manifests.extend(found);
        } else if input.is_file() {
            manifests.push(input.clone());
        } else {
            bail!("input not found: {}", input.display());
        }
    }

    let mut seen = HashSet::new();
    manifests.retain(|path| seen.insert(path.clone()));
    if manifests.is_empty() {
        bail!("no manifest files found");
    }
    Ok(manifests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn directories_expand_to_sorted_jsonl_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("nested")).expect("mkdir");
        for name in ["b.jsonl", "a.jsonl", "notes.txt", "nested/c.jsonl"] {
            fs::write(root.join(name), "").expect("write");
        }

        let manifests = expand_inputs(&[root.to_path_buf()]).expect("expand");

        assert_eq!(
            manifests,
            vec![root.join("a.jsonl"), root.join("b.jsonl"), root.join("nested/c.jsonl")]
        );
    }

    #[test]
    fn explicit_files_keep_order_and_drop_repeats() {
        let temp = tempfile::tempdir().expect("tempdir");
        let a = temp.path().join("a.jsonl");
        let b = temp.path().join("b.jsonl");
        fs::write(&a, "").expect("write");
        fs::write(&b, "").expect("write");

        let manifests = expand_inputs(&[b.clone(), a.clone(), b.clone()]).expect("expand");

        assert_eq!(manifests, vec![b, a]);
    }

    #[test]
    fn missing_input_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = expand_inputs(&[temp.path().join("nope.jsonl")]).expect_err("missing");
        assert!(err.to_string().contains("nope.jsonl"));
    }

    #[test]
    fn directory_without_manifests_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(expand_inputs(&[temp.path().to_path_buf()]).is_err());
    }
}

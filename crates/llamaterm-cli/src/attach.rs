use ignore::WalkBuilder;
use llamaterm_core::prompts::render_item_list;
use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub const IGNORED_NAMES: [&str; 6] = [
    ".DS_Store",
    ".python-version",
    ".ssh",
    ".git",
    ".mypy_cache",
    "__pycache__",
];

pub const UNREADABLE_FILE: &str = "File Unproccessable";

pub fn read_attachment(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unable to open file");
            UNREADABLE_FILE.to_string()
        }
    }
}

pub fn read_directory(root: &Path) -> Vec<String> {
    WalkBuilder::new(root)
        .standard_filters(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(|entry| !is_ignored(entry.file_name()))
        .build()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_some_and(|kind| kind.is_file()))
        .map(|entry| {
            info!(path = %entry.path().display(), "opening attachment");
            read_attachment(entry.path())
        })
        .collect()
}

pub fn attach_to_question(question: &str, path: &Path) -> String {
    if path.is_dir() {
        let files = read_directory(path);
        format!("{question}. Here are my files: {}", render_item_list(&files))
    } else {
        format!("{question}. Here is my file: {}", read_attachment(path))
    }
}

fn is_ignored(name: &OsStr) -> bool {
    name.to_str()
        .is_some_and(|name| IGNORED_NAMES.contains(&name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn single_file_is_appended_to_question() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("notes.txt");
        fs::write(&path, "Test content").expect("write file");

        assert_eq!(
            attach_to_question("My question", &path),
            "My question. Here is my file: Test content"
        );
    }

    #[test]
    fn missing_file_is_marked_unprocessable() {
        let dir = tempdir().expect("temp dir");
        assert_eq!(read_attachment(&dir.path().join("gone.txt")), UNREADABLE_FILE);
    }

    #[test]
    fn directory_skips_ignored_names_at_any_depth() {
        let dir = tempdir().expect("temp dir");
        fs::create_dir_all(dir.path().join(".git")).expect("git dir");
        fs::create_dir_all(dir.path().join("src/__pycache__")).expect("cache dir");
        fs::write(dir.path().join(".git/HEAD"), "ignored").expect("write");
        fs::write(dir.path().join("src/__pycache__/x.pyc"), "ignored").expect("write");
        fs::write(dir.path().join(".DS_Store"), "ignored").expect("write");
        fs::write(dir.path().join("a.txt"), "File 1").expect("write");
        fs::write(dir.path().join("src/b.py"), "File 2").expect("write");

        assert_eq!(read_directory(dir.path()), vec!["File 1", "File 2"]);
        assert_eq!(
            attach_to_question("Initial question", dir.path()),
            "Initial question. Here are my files: ['File 1', 'File 2']"
        );
    }
}

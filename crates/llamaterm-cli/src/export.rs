use anyhow::{Context, Result};
use llamaterm_core::Chat;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::config::home_dir;

pub const CHAT_SEPARATOR: &str = "\n---------------\n";

pub const MIN_CODE_BLOCK_LINES: usize = 7;

const EXTENSIONS: [(&str, &str); 17] = [
    ("bash", ".sh"),
    ("c", ".c"),
    ("c++", ".cpp"),
    ("headers", ".h"),
    ("python", ".py"),
    ("ruby", ".rb"),
    ("ini", ".ini"),
    ("go", ".go"),
    ("rust", ".rs"),
    ("javascript", ".js"),
    ("json", ".json"),
    ("css", ".css"),
    ("textualcss", ".tcss"),
    ("yaml", ".yaml"),
    ("xml", ".xml"),
    ("toml", ".toml"),
    ("text", ".txt"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub language: String,
    pub body: String,
}

pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) => home_dir().join(rest.trim_start_matches('/')),
        None => PathBuf::from(path),
    }
}

pub fn render_text_export(chats: &[Chat]) -> String {
    chats
        .iter()
        .enumerate()
        .map(|(index, chat)| {
            format!(
                "Chat #:{}\nQuestion:\n{}\nAnswer:\n{}",
                index + 1,
                chat.question,
                chat.answer
            )
        })
        .collect::<Vec<_>>()
        .join(CHAT_SEPARATOR)
}

pub fn export_text(path: &Path, chats: &[Chat]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, render_text_export(chats))
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), chats = chats.len(), "exported chats as text");
    Ok(())
}

fn fenced_block() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)```\w.*?```").expect("valid regex"))
}

pub fn extract_code_blocks(answer: &str) -> Vec<CodeBlock> {
    fenced_block()
        .find_iter(answer)
        .filter_map(|found| {
            let lines = found.as_str().split_inclusive('\n').collect::<Vec<_>>();
            if lines.len() < MIN_CODE_BLOCK_LINES {
                return None;
            }
            let language = lines[0]
                .trim_start_matches('`')
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_lowercase();
            Some(CodeBlock {
                language,
                body: lines[1..lines.len() - 1].concat(),
            })
        })
        .collect()
}

pub fn extension_for(language: &str) -> &'static str {
    EXTENSIONS
        .iter()
        .find(|(name, _)| *name == language)
        .map(|(_, extension)| *extension)
        .unwrap_or(".txt")
}

pub fn export_code(dir: &Path, chats: &[Chat]) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let mut written = Vec::new();
    for (index, chat) in chats.iter().enumerate() {
        for (block_index, block) in extract_code_blocks(&chat.answer).iter().enumerate() {
            let name = format!(
                "chat{}_file{}{}",
                index + 1,
                block_index + 1,
                extension_for(&block.language)
            );
            let path = dir.join(name);
            fs::write(&path, &block.body)
                .with_context(|| format!("failed to write {}", path.display()))?;
            debug!(path = %path.display(), language = %block.language, "exported code block");
            written.push(path);
        }
    }
    info!(dir = %dir.display(), files = written.len(), "exported code blocks");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn chat(question: &str, answer: &str) -> Chat {
        Chat {
            id: 1,
            question: question.to_string(),
            answer: answer.to_string(),
            context_id: 1,
            topic_id: 2,
            llm_model_id: 1,
            created_at: Utc
                .with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
                .single()
                .expect("valid timestamp"),
        }
    }

    const LONG_PYTHON: &str = "Here you go:\n```python\nimport os\n\ndef main():\n    print(os.getcwd())\n\nmain()\n```\nDone.";

    #[test]
    fn text_export_numbers_chats_and_separates_them() {
        let rendered = render_text_export(&[chat("Q1", "A1"), chat("Q2", "A2")]);
        assert_eq!(
            rendered,
            "Chat #:1\nQuestion:\nQ1\nAnswer:\nA1\n---------------\nChat #:2\nQuestion:\nQ2\nAnswer:\nA2"
        );
    }

    #[test]
    fn short_blocks_are_skipped() {
        let answer = "```bash\necho hi\n```";
        assert!(extract_code_blocks(answer).is_empty());
    }

    #[test]
    fn long_block_body_drops_fences() {
        let blocks = extract_code_blocks(LONG_PYTHON);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].language, "python");
        assert_eq!(
            blocks[0].body,
            "import os\n\ndef main():\n    print(os.getcwd())\n\nmain()\n"
        );
    }

    #[test]
    fn languages_map_to_extensions() {
        assert_eq!(extension_for("rust"), ".rs");
        assert_eq!(extension_for("c++"), ".cpp");
        assert_eq!(extension_for("brainfuck"), ".txt");
    }

    #[test]
    fn code_export_names_files_per_chat() {
        let dir = tempdir().expect("temp dir");
        let target = dir.path().join("code");
        let chats = vec![chat("Q1", "no code"), chat("Q2", LONG_PYTHON)];

        let written = export_code(&target, &chats).expect("export");
        assert_eq!(written, vec![target.join("chat2_file1.py")]);
        let contents = fs::read_to_string(&written[0]).expect("read export");
        assert!(contents.starts_with("import os\n"));
    }

    #[test]
    fn text_export_writes_file() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("out/chats.txt");
        export_text(&path, &[chat("Q1", "A1")]).expect("export");
        assert_eq!(
            fs::read_to_string(&path).expect("read export"),
            "Chat #:1\nQuestion:\nQ1\nAnswer:\nA1"
        );
    }

    #[test]
    fn tilde_expands_to_home() {
        assert_eq!(expand_home("~/exports"), home_dir().join("exports"));
        assert_eq!(expand_home("/tmp/exports"), PathBuf::from("/tmp/exports"));
    }
}

use std::sync::OnceLock;

use regex::Regex;

/// A fenced code block pulled out of a model response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub language: String,
    pub code: String,
}

fn fenced_with_lang() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(\w+)\n(.*?)```").unwrap())
}

fn fenced_without_lang() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```\n(.*?)```").unwrap())
}

/// Extract fenced code blocks from markdown text, in document order for
/// labeled blocks followed by unlabeled ones.
///
/// Unlabeled blocks get a best-effort language guess from their content,
/// defaulting to python.
pub fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();

    for caps in fenced_with_lang().captures_iter(text) {
        blocks.push(CodeBlock {
            language: caps[1].to_string(),
            code: caps[2].to_string(),
        });
    }

    // Strip the labeled blocks so their bodies can't be re-matched as
    // unlabeled ones.
    let remaining = fenced_with_lang().replace_all(text, "");
    for caps in fenced_without_lang().captures_iter(&remaining) {
        let code = caps[1].to_string();
        blocks.push(CodeBlock {
            language: guess_language(&code).to_string(),
            code,
        });
    }

    blocks
}

fn guess_language(code: &str) -> &'static str {
    let stripped = code.trim();
    if stripped.starts_with("import ")
        || stripped.starts_with("from ")
        || stripped.contains("def ")
        || stripped.contains("print(")
    {
        "python"
    } else if stripped.starts_with("#!/bin/bash")
        || stripped.starts_with("#!/bin/sh")
        || stripped.starts_with("apt")
        || stripped.starts_with("pip ")
    {
        "bash"
    } else if stripped.starts_with("const ")
        || stripped.starts_with("let ")
        || stripped.starts_with("var ")
        || stripped.contains("console.log")
    {
        "javascript"
    } else {
        "python"
    }
}

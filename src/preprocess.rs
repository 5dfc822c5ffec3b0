//! Source-specific content preprocessors.
//!
//! Pure transforms keyed by language/format: no I/O, no model access. The
//! ingestion pipeline detects a language from the file extension, collects
//! the preprocessors that apply, and runs them in registration order.

use regex::Regex;
use std::sync::Arc;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreprocessMode {
    /// Remove the matched construct entirely.
    Strip,
    /// Leave content untouched.
    Keep,
    /// Replace the construct with a short placeholder line.
    Placeholder,
    /// Return only the matched constructs, dropping everything else.
    Extract,
}

pub trait Preprocessor: Send + Sync {
    fn name(&self) -> &'static str;
    fn applies_to(&self, language: &str) -> bool;
    fn process(&self, content: &str, mode: PreprocessMode) -> String;
}

/// Detects the preprocessing language for a file extension.
pub fn detect_language(extension: &str) -> &'static str {
    match extension {
        "md" | "mdx" | "markdown" => "markdown",
        "rst" => "restructuredtext",
        "adoc" => "asciidoc",
        "html" | "htm" => "html",
        "tex" => "latex",
        _ => "text",
    }
}

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```([A-Za-z0-9_+-]*)[ \t]*\n(.*?)```").expect("static regex")
});
static HTML_COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("static regex"));
static DIAGRAM_LANGS: &[&str] = &["mermaid", "plantuml", "dot", "graphviz", "d2"];

/// Handles fenced code blocks in markdown-family documents.
pub struct CodeFencePreprocessor;

impl Preprocessor for CodeFencePreprocessor {
    fn name(&self) -> &'static str {
        "code-fences"
    }

    fn applies_to(&self, language: &str) -> bool {
        language == "markdown"
    }

    fn process(&self, content: &str, mode: PreprocessMode) -> String {
        match mode {
            PreprocessMode::Keep => content.to_string(),
            PreprocessMode::Strip => FENCE_RE
                .replace_all(content, |caps: &regex::Captures<'_>| {
                    if DIAGRAM_LANGS.contains(&&caps[1]) {
                        caps[0].to_string() // diagram fences belong to the diagram pass
                    } else {
                        String::new()
                    }
                })
                .into_owned(),
            PreprocessMode::Placeholder => FENCE_RE
                .replace_all(content, |caps: &regex::Captures<'_>| {
                    if DIAGRAM_LANGS.contains(&&caps[1]) {
                        caps[0].to_string()
                    } else if caps[1].is_empty() {
                        "[code block]".to_string()
                    } else {
                        format!("[code block: {}]", &caps[1])
                    }
                })
                .into_owned(),
            PreprocessMode::Extract => FENCE_RE
                .captures_iter(content)
                .filter(|caps| !DIAGRAM_LANGS.contains(&&caps[1]))
                .map(|caps| caps[2].to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Handles diagram-DSL fences (mermaid and friends).
pub struct DiagramPreprocessor;

impl Preprocessor for DiagramPreprocessor {
    fn name(&self) -> &'static str {
        "diagram-dsl"
    }

    fn applies_to(&self, language: &str) -> bool {
        language == "markdown"
    }

    fn process(&self, content: &str, mode: PreprocessMode) -> String {
        match mode {
            PreprocessMode::Keep => content.to_string(),
            PreprocessMode::Strip => FENCE_RE
                .replace_all(content, |caps: &regex::Captures<'_>| {
                    if DIAGRAM_LANGS.contains(&&caps[1]) {
                        String::new()
                    } else {
                        caps[0].to_string()
                    }
                })
                .into_owned(),
            PreprocessMode::Placeholder => FENCE_RE
                .replace_all(content, |caps: &regex::Captures<'_>| {
                    if DIAGRAM_LANGS.contains(&&caps[1]) {
                        format!("[diagram: {}]", &caps[1])
                    } else {
                        caps[0].to_string()
                    }
                })
                .into_owned(),
            PreprocessMode::Extract => FENCE_RE
                .captures_iter(content)
                .filter(|caps| DIAGRAM_LANGS.contains(&&caps[1]))
                .map(|caps| caps[2].to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Markdown cleanup: comments out, nothing else touched.
pub struct MarkdownPreprocessor;

impl Preprocessor for MarkdownPreprocessor {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn applies_to(&self, language: &str) -> bool {
        matches!(language, "markdown" | "html")
    }

    fn process(&self, content: &str, mode: PreprocessMode) -> String {
        match mode {
            PreprocessMode::Keep => content.to_string(),
            // Comments carry no retrieval value in any non-keep mode.
            _ => HTML_COMMENT_RE.replace_all(content, "").into_owned(),
        }
    }
}

pub struct PreprocessorRegistry {
    entries: Vec<Arc<dyn Preprocessor>>,
}

impl Default for PreprocessorRegistry {
    fn default() -> Self {
        Self {
            entries: vec![
                Arc::new(MarkdownPreprocessor),
                Arc::new(DiagramPreprocessor),
                Arc::new(CodeFencePreprocessor),
            ],
        }
    }
}

impl PreprocessorRegistry {
    pub fn for_language(&self, language: &str) -> Vec<Arc<dyn Preprocessor>> {
        self.entries
            .iter()
            .filter(|p| p.applies_to(language))
            .cloned()
            .collect()
    }

    /// Runs every applicable preprocessor with one mode. The ingestion
    /// default is `Placeholder`: fences stay findable without flooding the
    /// embedding space with code tokens.
    pub fn run(&self, language: &str, content: &str, mode: PreprocessMode) -> String {
        let mut out = content.to_string();
        for pre in self.for_language(language) {
            out = pre.process(&out, mode);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "# Title\n\nIntro text.\n\n```rust\nfn main() {}\n```\n\n```mermaid\ngraph TD; A-->B;\n```\n\n<!-- private note -->\nOutro.";

    #[test]
    fn language_detection_follows_extension() {
        assert_eq!(detect_language("md"), "markdown");
        assert_eq!(detect_language("rst"), "restructuredtext");
        assert_eq!(detect_language("txt"), "text");
    }

    #[test]
    fn strip_removes_code_but_not_diagrams() {
        let out = CodeFencePreprocessor.process(DOC, PreprocessMode::Strip);
        assert!(!out.contains("fn main"));
        assert!(out.contains("graph TD"));
        assert!(out.contains("Intro text."));
    }

    #[test]
    fn placeholder_names_the_fence_language() {
        let out = CodeFencePreprocessor.process(DOC, PreprocessMode::Placeholder);
        assert!(out.contains("[code block: rust]"));
        assert!(!out.contains("fn main"));
    }

    #[test]
    fn extract_returns_only_fence_bodies() {
        let code = CodeFencePreprocessor.process(DOC, PreprocessMode::Extract);
        assert_eq!(code.trim(), "fn main() {}");

        let diagram = DiagramPreprocessor.process(DOC, PreprocessMode::Extract);
        assert_eq!(diagram.trim(), "graph TD; A-->B;");
    }

    #[test]
    fn diagram_placeholder_leaves_code_alone() {
        let out = DiagramPreprocessor.process(DOC, PreprocessMode::Placeholder);
        assert!(out.contains("[diagram: mermaid]"));
        assert!(out.contains("fn main"));
    }

    #[test]
    fn comments_are_dropped_outside_keep_mode() {
        let out = MarkdownPreprocessor.process(DOC, PreprocessMode::Strip);
        assert!(!out.contains("private note"));
        let kept = MarkdownPreprocessor.process(DOC, PreprocessMode::Keep);
        assert!(kept.contains("private note"));
    }

    #[test]
    fn registry_composes_passes_for_markdown() {
        let registry = PreprocessorRegistry::default();
        let out = registry.run("markdown", DOC, PreprocessMode::Placeholder);
        assert!(out.contains("[code block: rust]"));
        assert!(out.contains("[diagram: mermaid]"));
        assert!(!out.contains("private note"));
        assert!(out.contains("Intro text."));

        // Plain text gets no passes.
        assert_eq!(registry.run("text", DOC, PreprocessMode::Placeholder), DOC);
    }
}

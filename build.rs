use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories that are never part of the crate's own sources.
const SKIPPED_ROOTS: [&str; 2] = ["./target", "./examples"];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Rule {
    UnderscorePrefix,
    ForbiddenWords,
    StarsInComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Rule {
    fn pattern(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b",
            Rule::ForbiddenWords => {
                r"(//|/\*|///).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)"
            }
            Rule::StarsInComment => r"(//|/\*).*\*\*",
            Rule::UppercaseComment => r"(//|/\*|///).*",
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        }
    }

    fn applies_to_build_script(self) -> bool {
        self == Rule::UnderscorePrefix
    }

    fn explanation(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => {
                "Underscore-prefixed variable names are not allowed in this project.\n   Either use the variable (removing the underscore) or remove it completely."
            }
            Rule::ForbiddenWords => {
                "Comments narrating edits ('FIXED', 'CHANGED', 'UPDATE', ...) are not allowed.\n   Remove them completely rather than commenting them out."
            }
            Rule::StarsInComment => {
                "The '**' pattern is not allowed in regular comments (but is allowed in doc comments)."
            }
            Rule::UppercaseComment => {
                "Comments where all alphabetic characters are uppercase are not allowed."
            }
            Rule::AllowDeadCode => {
                "#[allow(dead_code)] attributes are not allowed.\n   Either use the code or remove it completely."
            }
        }
    }
}

// Collects the offending lines of one file for one rule.
struct Violations {
    rule: Rule,
    file_path: PathBuf,
    lines: Vec<String>,
}

impl Violations {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            lines: Vec::new(),
        }
    }

    fn accepts(&self, line_text: &str) -> bool {
        let trimmed = line_text.trim_start();
        match self.rule {
            Rule::UnderscorePrefix => {
                let is_comment = trimmed.starts_with("//") || line_text.contains("/*");
                let in_string = line_text
                    .split('"')
                    .enumerate()
                    .any(|(idx, part)| idx % 2 == 1 && part.contains('_'));
                !is_comment && !in_string
            }
            Rule::ForbiddenWords | Rule::AllowDeadCode => true,
            Rule::StarsInComment => !trimmed.starts_with("///"),
            Rule::UppercaseComment => {
                let comment = if let Some(rest) = trimmed.strip_prefix("///") {
                    rest
                } else if let Some(rest) = trimmed.strip_prefix("//") {
                    rest
                } else if let Some(idx) = line_text.find("/*") {
                    let tail = &line_text[idx + 2..];
                    tail.find("*/").map_or(tail, |end| &tail[..end])
                } else {
                    return false;
                };
                let letters: Vec<char> = comment.chars().filter(|c| c.is_alphabetic()).collect();
                !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
            }
        }
    }

    fn into_error(self) -> Option<String> {
        if self.lines.is_empty() {
            return None;
        }
        let mut message = format!(
            "\nERROR: {} violation(s) in {}:\n",
            self.lines.len(),
            self.file_path.display()
        );
        for line in &self.lines {
            message.push_str(&format!("   {line}\n"));
        }
        message.push_str(&format!("\n   {}\n", self.rule.explanation()));
        Some(message)
    }
}

impl Sink for Violations {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.accepts(line_text) {
            self.lines.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn rust_sources() -> Vec<PathBuf> {
    WalkDir::new(".")
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            !SKIPPED_ROOTS
                .iter()
                .any(|root| entry.path().starts_with(root))
        })
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|entry| entry.into_path())
        .collect()
}

fn scan(rule: Rule, sources: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern())?;
    let mut searcher = Searcher::new();
    for path in sources {
        let is_build_script = path.file_name().is_some_and(|name| name == "build.rs");
        if is_build_script && !rule.applies_to_build_script() {
            continue;
        }
        let mut violations = Violations::new(rule, path);
        searcher.search_path(&matcher, path, &mut violations)?;
        if let Some(message) = violations.into_error() {
            return Err(message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let sources = rust_sources();
    for path in &sources {
        println!("cargo:rerun-if-changed={}", path.display());
    }

    let rules = [
        Rule::UnderscorePrefix,
        Rule::ForbiddenWords,
        Rule::StarsInComment,
        Rule::UppercaseComment,
        Rule::AllowDeadCode,
    ];
    for rule in rules {
        if let Err(e) = scan(rule, &sources) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

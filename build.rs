use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

// Directories holding the crate's own sources.
const SOURCE_DIRS: [&str; 4] = ["audit", "cli", "tests", "benches"];

/// What a collector does with a line the matcher reported.
#[derive(Clone, Copy)]
enum Rule {
    UnderscoreBinding,
    MarkerWord,
    StarsInComment,
    ShoutedComment,
    AllowDeadCode,
}

impl Rule {
    fn pattern(self) -> &'static str {
        match self {
            Self::UnderscoreBinding => r"\b(_[a-zA-Z0-9_]+)\b",
            Self::MarkerWord => {
                r"(//|/\*).*(?:FIXED|CORRECTED|FIX|NEW|CHANGED|CHANGE|MODIFIED|MODIFY|UPDATED|UPDATE)"
            }
            Self::StarsInComment => r"(//|/\*).*\*\*",
            Self::ShoutedComment => r"(//|/\*).*",
            Self::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        }
    }

    fn complaint(self) -> &'static str {
        match self {
            Self::UnderscoreBinding => {
                "Underscore-prefixed names are not allowed. Use the binding or remove it."
            }
            Self::MarkerWord => {
                "Comments must describe the code, not its history (no FIX/NEW/UPDATE markers)."
            }
            Self::StarsInComment => "Bold markup belongs in doc comments only.",
            Self::ShoutedComment => "Comments written entirely in capitals are not allowed.",
            Self::AllowDeadCode => {
                "#[allow(dead_code)] is forbidden. Use the item or remove it completely."
            }
        }
    }

    // Decides whether a matched line is a real violation.
    fn applies(self, line: &str) -> bool {
        let trimmed = line.trim_start();
        let is_comment = trimmed.starts_with("//") || trimmed.starts_with("/*");
        match self {
            Self::UnderscoreBinding => !is_comment && !underscore_only_in_strings(line),
            Self::MarkerWord => true,
            Self::StarsInComment => !trimmed.starts_with("///") && !trimmed.starts_with("//!"),
            Self::ShoutedComment => {
                let text = comment_text(line);
                let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
                !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
            }
            Self::AllowDeadCode => true,
        }
    }
}

fn underscore_only_in_strings(line: &str) -> bool {
    line.contains('"')
        && line
            .split('"')
            .enumerate()
            .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn comment_text(line: &str) -> &str {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        rest.trim()
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        rest.trim()
    } else if let Some(idx) = line.find("/*") {
        let body = &line[idx + 2..];
        body.find("*/").map_or(body, |end| &body[..end]).trim()
    } else {
        ""
    }
}

// Collects the offending lines of a single file.
struct ViolationCollector {
    rule: Rule,
    violations: Vec<String>,
    file_path: PathBuf,
}

impl ViolationCollector {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let mut error_msg = format!(
            "\n❌ ERROR: Found {} violation(s) in {}:\n",
            self.violations.len(),
            self.file_path.display()
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.rule.complaint()));
        Some(error_msg)
    }
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if self.rule.applies(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn source_files() -> impl Iterator<Item = PathBuf> {
    SOURCE_DIRS.into_iter().flat_map(|dir| {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .map(|e| e.into_path())
    })
}

fn scan(rule: Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern())?;
    let mut searcher = Searcher::new();

    for path in source_files() {
        let mut collector = ViolationCollector::new(rule, &path);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=CONCORD_BUILD_TIMESTAMP={timestamp}");

    for rule in [
        Rule::UnderscoreBinding,
        Rule::MarkerWord,
        Rule::StarsInComment,
        Rule::ShoutedComment,
        Rule::AllowDeadCode,
    ] {
        if let Err(e) = scan(rule) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

//! Source policy gate. Every rule below is checked against the crate's own sources
//! on each build, and any hit fails the build with a per-file report.

use grep::matcher::Matcher;
use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::fmt::Write as FmtWrite;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const SOURCE_ROOTS: [&str; 4] = ["admix", "shared", "src", "tests"];

/// Roots whose non-test code must propagate errors instead of panicking.
const LIBRARY_ROOTS: [&str; 3] = ["admix", "shared", "src"];

/// Which part of a line a rule looks at.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// Code with string literal contents blanked out.
    Code,
    /// Code of library files, above the first `#[cfg(test)]`.
    LibraryCode,
    /// Any line comment, doc comments included.
    Comment,
    /// Line comments that are not doc comments.
    PlainComment,
}

struct Rule {
    name: &'static str,
    pattern: &'static str,
    scope: Scope,
    hint: &'static str,
}

const RULES: [Rule; 5] = [
    Rule {
        name: "underscore-prefixed binding",
        pattern: r"\b_[A-Za-z0-9_]+\b",
        scope: Scope::Code,
        hint: "use the binding or remove it",
    },
    Rule {
        name: "allowed dead code",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        scope: Scope::Code,
        hint: "delete the unused item",
    },
    Rule {
        name: "panicking error path",
        pattern: r"\.(?:unwrap\(\)|expect\()",
        scope: Scope::LibraryCode,
        hint: "return the error and let the caller decide",
    },
    Rule {
        name: "revision note in comment",
        pattern: r"\b(?:FIX(?:ED|ES)?|CORRECTED|NEW|CHANGE[SD]?|MODIF(?:Y|IED|IES)|UPDATE[SD]?)\b",
        scope: Scope::Comment,
        hint: "comments describe the code as it is",
    },
    Rule {
        name: "emphasis in plain comment",
        pattern: r"\*\*",
        scope: Scope::PlainComment,
        hint: "markdown emphasis belongs in doc comments only",
    },
];

/// A line split into its code, with string literal contents replaced by spaces, and
/// its trailing `//` comment if there is one.
struct SplitLine<'a> {
    code: String,
    comment: Option<&'a str>,
}

fn split_line(line: &str) -> SplitLine<'_> {
    let bytes = line.as_bytes();
    let mut code = String::with_capacity(line.len());
    let mut idx = 0;
    while idx < bytes.len() {
        let rest = &line[idx..];
        if rest.starts_with("//") {
            return SplitLine {
                code,
                comment: Some(rest),
            };
        }
        let (open, close) = if rest.starts_with("r#\"") {
            ("r#\"", "\"#")
        } else if rest.starts_with('"') {
            ("\"", "\"")
        } else {
            let ch = rest.chars().next().unwrap_or(' ');
            code.push(ch);
            idx += ch.len_utf8();
            continue;
        };
        code.push_str(open);
        idx += open.len();
        let body_start = idx;
        let mut escaped = false;
        while idx < bytes.len() {
            let rest = &line[idx..];
            if close == "\"" && escaped {
                escaped = false;
            } else if close == "\"" && rest.starts_with('\\') {
                escaped = true;
            } else if rest.starts_with(close) {
                break;
            }
            idx += rest.chars().next().map_or(1, char::len_utf8);
        }
        code.extend(line[body_start..idx].chars().map(|_| ' '));
        if idx < bytes.len() {
            code.push_str(close);
            idx += close.len();
        }
    }
    SplitLine { code, comment: None }
}

fn is_doc_comment(comment: &str) -> bool {
    comment.starts_with("///") || comment.starts_with("//!")
}

fn under_any(path: &Path, roots: &[&str]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}

/// First line of the file's test module, if it has one.
fn test_module_start(path: &Path) -> Option<u64> {
    let text = fs::read_to_string(path).ok()?;
    text.lines()
        .position(|line| line.trim() == "#[cfg(test)]")
        .map(|idx| idx as u64 + 1)
}

/// Collects the lines of one file that break one rule.
struct RuleSink<'a> {
    rule: &'a Rule,
    matcher: &'a RegexMatcher,
    test_start: Option<u64>,
    hits: Vec<String>,
}

impl RuleSink<'_> {
    fn breaks_rule(&self, line: &str, number: u64) -> bool {
        let split = split_line(line);
        let target = match self.rule.scope {
            Scope::Code => split.code.as_str(),
            Scope::LibraryCode => {
                if self.test_start.is_some_and(|start| number >= start) {
                    return false;
                }
                split.code.as_str()
            }
            Scope::Comment => match split.comment {
                Some(comment) => comment,
                None => return false,
            },
            Scope::PlainComment => match split.comment {
                Some(comment) if !is_doc_comment(comment) => comment,
                _ => return false,
            },
        };
        self.matcher.is_match(target.as_bytes()).unwrap_or(false)
    }
}

impl Sink for RuleSink<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch<'_>) -> Result<bool, Self::Error> {
        let number = mat.line_number().unwrap_or(0);
        let text = String::from_utf8_lossy(mat.bytes());
        for (offset, line) in text.lines().enumerate() {
            let line_number = number + offset as u64;
            let line = line.trim_start();
            if self.breaks_rule(line, line_number) {
                self.hits.push(format!("{line_number}: {}", line.trim_end()));
            }
        }
        Ok(true)
    }
}

fn policy_files() -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = SOURCE_ROOTS
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(Result::ok))
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|entry| entry.into_path())
        .collect();
    files.push(PathBuf::from("build.rs"));
    files.sort();
    files
}

/// Runs every rule over every file and renders the violations, if any.
fn check_policy() -> Result<Option<String>, Box<dyn Error>> {
    let files = policy_files();
    let mut searcher = Searcher::new();
    let mut report = String::new();
    for rule in &RULES {
        let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
        for path in &files {
            if rule.scope == Scope::LibraryCode && !under_any(path, &LIBRARY_ROOTS) {
                continue;
            }
            let mut sink = RuleSink {
                rule,
                matcher: &matcher,
                test_start: test_module_start(path),
                hits: Vec::new(),
            };
            searcher.search_path(&matcher, path, &mut sink)?;
            if sink.hits.is_empty() {
                continue;
            }
            writeln!(report, "\n{} ({}): {}", path.display(), rule.name, rule.hint)?;
            for hit in &sink.hits {
                writeln!(report, "   {hit}")?;
            }
        }
    }
    Ok((!report.is_empty()).then_some(report))
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    match check_policy() {
        Ok(None) => {}
        Ok(Some(report)) => {
            eprintln!("Source policy violations:{report}");
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("Source policy check could not run: {err}");
            std::process::exit(1);
        }
    }
}

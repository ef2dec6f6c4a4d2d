//! Commit message rendering for agent-produced changes.

use crate::core::types::first_line;

/// Maximum length of the commit subject line, in characters.
pub const SUBJECT_MAX_CHARS: usize = 72;

/// Render the commit message for a task.
///
/// Subject: the first non-empty line of the description, truncated to 72
/// characters. Body: the changed files. Trailer: an optional `Co-Authored-By`.
pub fn render(description: &str, changed_files: &[String], co_author: Option<&str>) -> String {
    let subject: String = first_line(description)
        .chars()
        .take(SUBJECT_MAX_CHARS)
        .collect();
    let subject = if subject.trim().is_empty() {
        "Automated change".to_string()
    } else {
        subject.trim_end().to_string()
    };

    let mut message = subject;
    if !changed_files.is_empty() {
        message.push_str("\n\nChanged files:\n");
        let lines: Vec<String> = changed_files.iter().map(|f| format!("- {f}")).collect();
        message.push_str(&lines.join("\n"));
    }
    if let Some(co_author) = co_author.map(str::trim).filter(|c| !c.is_empty()) {
        message.push_str(&format!("\n\nCo-Authored-By: {co_author}"));
    }
    message.push('\n');
    message
}

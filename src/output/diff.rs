// Content diffs shown for file and lineinfile changes in diff mode

use similar::TextDiff;

const CONTEXT_LINES: usize = 3;

/// Unified diff of a managed file. `before` is `None` when the file does not
/// exist yet, which renders against `/dev/null`.
pub fn render_content_diff(path: &str, before: Option<&str>, after: &str) -> String {
    let (old_label, new_label) = match before {
        Some(_) => (format!("{} (before)", path), format!("{} (after)", path)),
        None => ("/dev/null".to_string(), format!("{} (new)", path)),
    };

    let diff = TextDiff::from_lines(before.unwrap_or(""), after);
    let mut unified = diff.unified_diff();
    unified.context_radius(CONTEXT_LINES);

    // Headers always go out, even for an empty new file
    let mut output = format!("--- {}\n+++ {}\n", old_label, new_label);
    for hunk in unified.iter_hunks() {
        output.push_str(&hunk.to_string());
    }
    output
}

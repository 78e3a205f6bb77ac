/// Normalizes program output for comparison: CRLF becomes LF, every line is
/// right-trimmed of spaces, tabs and stray CRs, and trailing newlines are
/// dropped from the whole text.
pub fn normalize(text: &str) -> String {
    let unified = text.replace("\r\n", "\n");
    let lines: Vec<&str> = unified
        .split('\n')
        .map(|line| line.trim_end_matches([' ', '\t', '\r']))
        .collect();
    lines.join("\n").trim_end_matches('\n').to_string()
}

/// Byte-exact equality after normalization. No Unicode folding, no numeric
/// tolerance.
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize(actual) == normalize(expected)
}

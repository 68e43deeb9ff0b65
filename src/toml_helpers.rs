// Small helpers for parse error message extraction shared by config loading.

fn leading_number(s: &str) -> Option<usize> {
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map_or(s.len(), |(i, _)| i);
    s[..end].parse().ok()
}

/// Look for patterns like "line N, column M" in parser error messages and
/// return (line, column) when found.
#[must_use]
pub fn extract_line_col_from_msg(msg: &str) -> Option<(usize, usize)> {
    let after_line = &msg[msg.find("line ")? + 5..];
    let line = leading_number(after_line)?;
    let after_col = &after_line[after_line.find("column ")? + 7..];
    let col = leading_number(after_col)?;
    Some((line, col))
}

/// Returns up to `max_lines` lines of `content` starting at the 0-based
/// `start_line`, joined with `\n`. Carriage returns are stripped.
pub fn preview_lines(content: &str, start_line: u32, max_lines: usize) -> String {
    content
        .split('\n')
        .skip(start_line as usize)
        .take(max_lines)
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n")
}

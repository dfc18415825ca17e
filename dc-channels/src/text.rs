/// Split `text` into chunks of at most `max_chars` characters.
///
/// Prefers breaking after a newline, then after whitespace, and only cuts
/// mid-word when a single run exceeds the limit.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > max_chars {
        let window_end = rest
            .char_indices()
            .nth(max_chars)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let window = &rest[..window_end];

        let cut = window
            .rfind('\n')
            .map(|idx| idx + 1)
            .or_else(|| {
                window
                    .char_indices()
                    .rev()
                    .find(|(_, c)| c.is_whitespace())
                    .map(|(idx, c)| idx + c.len_utf8())
            })
            .filter(|&idx| idx > 0)
            .unwrap_or(window_end);

        let (head, tail) = rest.split_at(cut);
        if !head.trim().is_empty() {
            chunks.push(head.trim_end().to_string());
        }
        rest = tail;
    }

    if !rest.trim().is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

//! Word-boundary matching shared by memory search, consistency checks and
//! memory extraction.

/// Byte offset of the first occurrence of `word` in `text` that sits on word
/// boundaries, ignoring ASCII case.
///
/// Matching is ASCII case-insensitive so offsets stay valid for `text`.
pub fn find_word(text: &str, word: &str) -> Option<usize> {
    let word = word.trim();
    if word.is_empty() {
        return None;
    }

    let text_bytes = text.as_bytes();
    let word_bytes = word.as_bytes();
    let text_len = text_bytes.len();
    let word_len = word_bytes.len();

    if word_len > text_len {
        return None;
    }

    let mut i = 0;
    while i + word_len <= text_len {
        if text_bytes[i..i + word_len].eq_ignore_ascii_case(word_bytes) {
            // Start of string or non-alphanumeric on both sides
            let left_ok = i == 0 || !is_word_byte(text_bytes[i - 1]);
            let right_ok = i + word_len == text_len || !is_word_byte(text_bytes[i + word_len]);

            if left_ok && right_ok {
                return Some(i);
            }
        }
        i += 1;
    }

    None
}

/// Check if `text` contains `word` at word boundaries, ignoring ASCII case.
pub fn contains_word(text: &str, word: &str) -> bool {
    find_word(text, word).is_some()
}

fn is_word_byte(b: u8) -> bool {
    // Bytes of multi-byte UTF-8 characters count as letters.
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

/// Lowercased search terms of at least three characters.
pub fn terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(|t| t.to_lowercase())
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

/// The JSON payload of a model reply: the contents of a fenced block if
/// there is one, otherwise the outermost `{...}` span, otherwise the
/// trimmed text.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    // ```json ... ``` blocks
    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // ``` ... ``` blocks without a language tag
    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_word_boundaries() {
        assert!(contains_word("The dragon attacks", "dragon"));
        assert!(contains_word("dragon!", "dragon"));
        assert!(!contains_word("dragonfly", "dragon"));
        assert!(!contains_word("snapdragon", "dragon"));
        assert!(!contains_word("anything", ""));
    }

    #[test]
    fn test_case_insensitive_phrase() {
        assert_eq!(find_word("Then TIME Travel happened", "time travel"), Some(5));
        assert!(contains_word("Mira's blade", "mira"));
    }

    #[test]
    fn test_non_ascii_neighbours() {
        assert!(!contains_word("naïveté", "na"));
        assert!(contains_word("café Mira", "mira"));
    }

    #[test]
    fn test_terms() {
        assert_eq!(
            terms("I ask Mira about the old tower, the TOWER!"),
            vec!["about", "ask", "mira", "old", "the", "tower"]
        );
    }

    #[test]
    fn test_extract_json() {
        let plain = r#"{"issues": []}"#;
        assert_eq!(extract_json(plain), plain);
        assert_eq!(extract_json("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json("Sure! {\"a\": 1} Hope that helps."), "{\"a\": 1}");
        assert_eq!(extract_json("  no json here "), "no json here");
    }
}

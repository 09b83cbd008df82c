//! Tokenization and entropy reduction
//!
//! Messages are split on Unicode whitespace. English articles are glued to
//! the word that follows them, so "the cat" is a single token.

/// Split a message into its words.
///
/// If a word is an article (a, an, the) and another word follows, the token is
/// both words together. As a special case for the special case, "a" might be
/// part of a spelled-out sequence like "D A N K", so a one-letter word after
/// "a" is not joined.
pub fn tokens(msg: &str) -> Vec<String> {
    let mut dst: Vec<String> = Vec::new();
    let mut art = false;
    for word in msg.split_whitespace() {
        if art {
            if let Some(last) = dst.last_mut() {
                if word.chars().count() != 1 || !last.eq_ignore_ascii_case("a") {
                    last.push(' ');
                    last.push_str(word);
                    art = false;
                    continue;
                }
            }
        }
        dst.push(word.to_string());
        art = is_article(word);
    }
    dst
}

fn is_article(word: &str) -> bool {
    ["a", "an", "the"]
        .iter()
        .any(|a| word.eq_ignore_ascii_case(a))
}

/// Transform a term so that it is more likely to equal other terms
/// transformed the same way. Used only for match keys.
pub fn reduce_entropy(w: &str) -> String {
    w.to_lowercase()
}

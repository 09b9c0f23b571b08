//! Glob matching for cache key patterns.
//!
//! Supports the two wildcards cache servers commonly accept in key scans:
//! `*` (any run of characters, including none) and `?` (exactly one character).
//! A backslash makes the next character literal, so `\*` matches only `*`.

/// Returns true if `text` matches the glob `pattern`.
///
/// Runs in `O(pattern * text)` worst case using single-star backtracking.
///
/// # Examples
///
/// ```
/// use payhook::backends::glob_match;
///
/// assert!(glob_match("transactions:co1:*", "transactions:co1:page:2"));
/// assert!(!glob_match("transactions:co1:*", "transactions:co10:page:2"));
/// assert!(glob_match("a?c", "abc"));
/// ```
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    // Position of the last `*` seen and the text index it is currently absorbing up to.
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some((p, t));
                p += 1;
            }
            Some('?') => {
                p += 1;
                t += 1;
            }
            Some('\\') if p + 1 < pattern.len() && pattern[p + 1] == text[t] => {
                p += 2;
                t += 1;
            }
            Some('\\') if p + 1 < pattern.len() => match star {
                Some((star_p, star_t)) => {
                    p = star_p + 1;
                    t = star_t + 1;
                    star = Some((star_p, star_t + 1));
                }
                None => return false,
            },
            Some(c) if *c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((star_p, star_t)) => {
                    p = star_p + 1;
                    t = star_t + 1;
                    star = Some((star_p, star_t + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Escapes `*`, `?` and `\` so that `text` matches only itself.
///
/// # Examples
///
/// ```
/// use payhook::backends::{glob_escape, glob_match};
///
/// let pattern = glob_escape("co*");
/// assert!(glob_match(&pattern, "co*"));
/// assert!(!glob_match(&pattern, "co1"));
/// ```
pub fn glob_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

//! Output sanitization for provider credentials.
//!
//! Every component that serializes an error or log record runs its text
//! through [`redact`] so that well-formed key material never reaches a
//! client or a log file.

/// Key prefixes we recognize. Longest-prefix first so `sk-ant-` wins over `sk-`.
const KEY_PREFIXES: &[&str] = &["sk-ant-", "sk-", "AIza", "ghp_"];

/// Minimum number of body characters after the prefix before we treat the
/// match as a credential rather than prose that happens to contain "sk-".
const MIN_BODY_LEN: usize = 8;

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Replace any substring that looks like a provider key with `<prefix>***`.
pub fn redact(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    'outer: while !rest.is_empty() {
        for prefix in KEY_PREFIXES {
            if let Some(tail) = rest.strip_prefix(prefix) {
                let body_len = tail.chars().take_while(|c| is_key_char(*c)).count();
                if body_len >= MIN_BODY_LEN {
                    out.push_str(prefix);
                    out.push_str("***");
                    let skip: usize = tail.chars().take(body_len).map(char::len_utf8).sum();
                    rest = &tail[skip..];
                    continue 'outer;
                }
            }
        }
        let Some(ch) = rest.chars().next() else {
            break;
        };
        out.push(ch);
        rest = &rest[ch.len_utf8()..];
    }

    out
}

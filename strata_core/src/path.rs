//! Unix path normalization for record file paths.

use std::borrow::Cow;

/// Safely clean a unix style path.
///
/// Collapses duplicate `/` and drops `./` segments. It does not remove any
/// `..`, as removing those correctly involves resolving symbolic links.
/// Returns the input unchanged when nothing needs cleaning.
pub fn clean_path(path: &str) -> Cow<'_, str> {
    if path.is_empty() {
        return Cow::Borrowed(path);
    }

    let mut chars = path.chars().peekable();
    let mut prev = match chars.next() {
        Some(first) => first,
        None => return Cow::Borrowed(path),
    };
    let mut out = String::with_capacity(path.len());
    out.push(prev);
    while let Some(c) = chars.next() {
        if c == '/' && prev == '/' {
            continue;
        }
        if c == '.' && prev == '/' && chars.peek() == Some(&'/') {
            chars.next();
            continue;
        }
        out.push(c);
        prev = c;
    }

    if out == path {
        Cow::Borrowed(path)
    } else {
        Cow::Owned(out)
    }
}

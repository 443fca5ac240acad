//! Shell style pattern matching for domain and MX host names.
//!
//! `*` matches any run of characters, `?` matches exactly one,
//! `[a-z]` and `[^0-9]` match character classes and `\` escapes
//! the following character. A malformed pattern never matches.

pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    match_from(&pattern, &name).unwrap_or(false)
}

fn match_from(pattern: &[char], name: &[char]) -> Option<bool> {
    let (mut p, mut n) = (0, 0);
    // Position to resume from after the most recent `*`
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        let step = match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p + 1, n));
                p += 1;
                continue;
            }
            Some('?') => Some(p + 1),
            Some('[') => {
                let (matched, next) = match_class(pattern, p + 1, name[n])?;
                matched.then_some(next)
            }
            Some('\\') => {
                let c = pattern.get(p + 1)?;
                (*c == name[n]).then_some(p + 2)
            }
            Some(c) => (*c == name[n]).then_some(p + 1),
            None => None,
        };

        match step {
            Some(next) => {
                p = next;
                n += 1;
            }
            None => match backtrack {
                Some((star_p, star_n)) => {
                    p = star_p;
                    n = star_n + 1;
                    backtrack = Some((star_p, star_n + 1));
                }
                None => return Some(false),
            },
        }
    }

    while pattern.get(p) == Some(&'*') {
        p += 1;
    }
    Some(p == pattern.len())
}

/// Matches `c` against the class starting just after its `[`.
/// Returns whether it matched and the index following the `]`,
/// or None if the class is unterminated.
fn match_class(pattern: &[char], mut idx: usize, c: char) -> Option<(bool, usize)> {
    let negated = matches!(pattern.get(idx), Some('^'));
    if negated {
        idx += 1;
    }

    let mut matched = false;
    let mut first = true;
    loop {
        let mut lo = *pattern.get(idx)?;
        if lo == ']' && !first {
            return Some((matched != negated, idx + 1));
        }
        first = false;
        if lo == '\\' {
            idx += 1;
            lo = *pattern.get(idx)?;
        }
        idx += 1;

        let mut hi = lo;
        if pattern.get(idx) == Some(&'-') && pattern.get(idx + 1) != Some(&']') {
            hi = *pattern.get(idx + 1)?;
            if hi == '\\' {
                hi = *pattern.get(idx + 2)?;
                idx += 1;
            }
            idx += 2;
        }

        if lo <= c && c <= hi {
            matched = true;
        }
    }
}

/// First eight characters of a commit SHA.
pub fn short_sha(sha: &str) -> &str { sha.get(..8).unwrap_or(sha) }

/// Replace `{key}` tokens in `template` with their values. Unknown tokens are
/// left untouched.
pub fn substitute(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// One `FROM` reference that was re-pinned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromRewrite {
    pub line: usize,
    pub from: String,
    pub to: String,
}

/// Rewrites the image references of `FROM` instructions.
///
/// `resolve` receives the repository part of each base image (without tag or
/// digest) and returns the tag to pin, or `None` to leave the line untouched.
/// Lines that are not rewritten keep their exact bytes.
pub fn rewrite_from_lines<F>(content: &str, mut resolve: F) -> (String, Vec<FromRewrite>)
where
    F: FnMut(&str) -> Option<String>,
{
    let mut output = String::with_capacity(content.len());
    let mut rewrites = Vec::new();

    for (idx, line) in content.split_inclusive('\n').enumerate() {
        let Some((start, end, reference)) = find_from_reference(line) else {
            output.push_str(line);
            continue;
        };

        let repository = split_repository(reference);
        match resolve(repository) {
            Some(tag) => {
                let pinned = format!("{}:{}", repository, tag);
                output.push_str(&line[..start]);
                output.push_str(&pinned);
                output.push_str(&line[end..]);
                if pinned != reference {
                    rewrites.push(FromRewrite {
                        line: idx + 1,
                        from: reference.to_string(),
                        to: pinned,
                    });
                }
            }
            None => output.push_str(line),
        }
    }

    (output, rewrites)
}

/// Byte span and text of the image reference in a `FROM` line.
fn find_from_reference(line: &str) -> Option<(usize, usize, &str)> {
    let mut tokens = tokens_with_spans(line);

    let (_, _, keyword) = tokens.next()?;
    if !keyword.eq_ignore_ascii_case("FROM") {
        return None;
    }

    tokens.find(|(_, _, token)| !token.starts_with("--"))
}

fn tokens_with_spans(line: &str) -> impl Iterator<Item = (usize, usize, &str)> {
    let mut offset = 0;
    std::iter::from_fn(move || {
        let rest = &line[offset..];
        let skipped = rest.len() - rest.trim_start().len();
        let start = offset + skipped;
        if start >= line.len() {
            return None;
        }
        let len = line[start..]
            .find(char::is_whitespace)
            .unwrap_or(line.len() - start);
        offset = start + len;
        Some((start, offset, &line[start..offset]))
    })
}

/// Strips a `:tag` or `@digest` suffix, keeping registry ports intact.
fn split_repository(reference: &str) -> &str {
    let without_digest = reference.split('@').next().unwrap_or(reference);
    let name_start = without_digest.rfind('/').map(|i| i + 1).unwrap_or(0);
    match without_digest[name_start..].rfind(':') {
        Some(colon) => &without_digest[..name_start + colon],
        None => without_digest,
    }
}

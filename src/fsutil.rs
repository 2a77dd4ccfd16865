use std::path::{Component, Path, PathBuf};

/// Joins a user-supplied relative path onto `base`, resolving `..`
/// lexically and refusing to climb above `base`. Returns `None` when
/// the path would escape the root.
#[inline(always)]
pub fn secure_join(base: &Path, user_path: &str) -> Option<PathBuf> {
    let mut result = base.to_path_buf();
    for component in Path::new(user_path).components() {
        match component {
            Component::Normal(c) => result.push(c),
            Component::ParentDir => {
                if result != base {
                    result.pop();
                } else {
                    return None;
                }
            }
            _ => continue, // drops CurDir and any absolute-path prefix
        }
    }
    Some(result)
}

/// Escapes text for inclusion in generated HTML (listing entries,
/// redirect bodies).
#[inline(always)]
pub fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len() + 16);
    for c in input.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub fn get_mime_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_secure_join_valid_paths() {
        let base = Path::new("/srv/www");

        let res = secure_join(base, "index.html").unwrap();
        assert_eq!(res, base.join("index.html"));

        let res = secure_join(base, "assets/css/site.css").unwrap();
        assert_eq!(res, base.join("assets/css/site.css"));
    }

    #[test]
    fn test_secure_join_directory_traversal_attempts() {
        let base = Path::new("/srv/www");

        let res = secure_join(base, "../../../etc/passwd");
        assert_eq!(res, None);

        // a leading slash is stripped, not treated as filesystem root
        let res = secure_join(base, "/etc/shadow").unwrap();
        assert_eq!(res, base.join("etc/shadow"));

        // interior .. that stays inside the root is resolved lexically
        let res = secure_join(base, "assets/../index.html").unwrap();
        assert_eq!(res, base.join("index.html"));
    }

    #[test]
    fn test_escape_html_payloads() {
        let payload = r#"<a href="x">'&'</a>"#;
        assert_eq!(
            escape_html(payload),
            "&lt;a href=&quot;x&quot;&gt;&#x27;&amp;&#x27;&lt;/a&gt;"
        );

        let benign = "plain-file_name.txt";
        assert_eq!(escape_html(benign), benign);
    }

    #[test]
    fn test_mime_lookup() {
        assert_eq!(get_mime_type(Path::new("a.html")), "text/html");
        assert_eq!(get_mime_type(Path::new("a.css")), "text/css");
        assert_eq!(
            get_mime_type(Path::new("a.unknownext")),
            "application/octet-stream"
        );
    }
}

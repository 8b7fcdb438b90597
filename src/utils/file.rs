const MAX_NAME_LEN: usize = 120;
const FALLBACK_NAME: &str = "file";

/// Reduces a client-supplied name to a single safe path segment.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|') { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.');

    let mut truncated = String::with_capacity(MAX_NAME_LEN);
    for c in cleaned.chars() {
        if truncated.len() + c.len_utf8() > MAX_NAME_LEN {
            break;
        }
        truncated.push(c);
    }

    if truncated.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        truncated
    }
}

/// Display name kept in the ledger: the basename as sent, or a fallback.
pub fn display_name(original: Option<&str>) -> String {
    original
        .map(|name| name.rsplit(['/', '\\']).next().unwrap_or_default().trim())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

pub fn resolve_mime_type(declared: Option<&str>, file_name: &str) -> String {
    declared
        .and_then(|value| value.parse::<mime::Mime>().ok())
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| {
            mime_guess::from_path(file_name)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        })
}

/// `attachment` header value carrying `name` in both ASCII and RFC 5987 form.
pub fn content_disposition(name: &str) -> String {
    let ascii: String = name
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' { c } else { '_' })
        .collect();

    let mut encoded = String::new();
    for byte in name.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(*byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }

    format!("attachment; filename=\"{}\"; filename*=UTF-8''{}", ascii, encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\a.txt"), "a.txt");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name("a\u{0}b?.txt"), "a_b_.txt");
        assert_eq!(sanitize_file_name(""), "file");

        let long = "é".repeat(200);
        let sanitized = sanitize_file_name(&long);
        assert!(sanitized.len() <= MAX_NAME_LEN);
        assert!(sanitized.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name(Some("photo.jpg")), "photo.jpg");
        assert_eq!(display_name(Some("dir/photo.jpg")), "photo.jpg");
        assert_eq!(display_name(Some("  ")), "file");
        assert_eq!(display_name(None), "file");
    }

    #[test]
    fn test_resolve_mime_type() {
        assert_eq!(resolve_mime_type(Some("text/plain; charset=utf-8"), "a.bin"), "text/plain");
        assert_eq!(resolve_mime_type(None, "photo.png"), "image/png");
        assert_eq!(resolve_mime_type(Some("not a mime"), "x.unknownext"), "application/octet-stream");
    }

    #[test]
    fn test_content_disposition() {
        assert_eq!(
            content_disposition("a b.txt"),
            "attachment; filename=\"a b.txt\"; filename*=UTF-8''a%20b.txt"
        );
        assert_eq!(
            content_disposition("relatório\".pdf"),
            "attachment; filename=\"relat_rio_.pdf\"; filename*=UTF-8''relat%C3%B3rio%22.pdf"
        );
    }
}

use url::Url;

/// File name for a download: the last path segment of the URL, decoded and
/// sanitized. URLs without one get `download_<uuid>`, where the UUID is
/// derived from the URL so reruns land on the same file and sidecar.
pub fn filename_from_url(url_str: &str) -> String {
    let decoded = Url::parse(url_str)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .map(|name| {
            urlencoding::decode(&name)
                .map(|d| d.into_owned())
                .unwrap_or(name)
        });

    match decoded {
        Some(name) => {
            let name = sanitize_filename(&name);
            if name.trim_matches('.').is_empty() {
                fallback_filename(url_str)
            } else {
                name
            }
        }
        None => fallback_filename(url_str),
    }
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

fn fallback_filename(url: &str) -> String {
    let id = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, url.as_bytes());
    format!("download_{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_from_last_segment() {
        assert_eq!(filename_from_url("https://example.com/files/archive.tar.gz"), "archive.tar.gz");
    }

    #[test]
    fn test_filename_ignores_query() {
        assert_eq!(filename_from_url("https://example.com/a/model.bin?download=1"), "model.bin");
    }

    #[test]
    fn test_filename_is_decoded_then_sanitized() {
        assert_eq!(filename_from_url("https://example.com/my%20report%281%29.pdf"), "my_report_1_.pdf");
    }

    #[test]
    fn test_filename_rejects_traversal() {
        let name = filename_from_url("https://example.com/a/..%2F..%2Fetc%2Fpasswd");
        assert!(!name.contains('/'), "unexpected name: {name}");
    }

    #[test]
    fn test_filename_fallback() {
        assert!(filename_from_url("https://example.com/").starts_with("download_"));
        assert!(filename_from_url("not a url").starts_with("download_"));
        assert!(filename_from_url("https://example.com/..").starts_with("download_"));
    }

    #[test]
    fn test_fallback_is_stable_per_url() {
        let first = filename_from_url("https://example.com/");
        assert_eq!(first, filename_from_url("https://example.com/"));
        assert_eq!(
            filename_from_url("https://example.com/?id=3"),
            filename_from_url("https://example.com/?id=3")
        );
        assert_ne!(first, filename_from_url("https://example.com/?id=3"));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a b/c:d.txt"), "a_b_c_d.txt");
        assert_eq!(sanitize_filename("ok-name_1.bin"), "ok-name_1.bin");
    }
}

pub mod client;
pub mod link_probe;

pub use client::HttpClient;
pub use link_probe::HttpLinkProbe;

/// Parses `Name: value` pairs; entries without a name are dropped.
pub fn parse_headers(raw: &[String]) -> Vec<(String, String)> {
    raw.iter()
        .filter_map(|h| {
            let mut parts = h.splitn(2, ':');
            let key = parts.next()?.trim().to_string();
            let val = parts.next().unwrap_or("").trim().to_string();
            if key.is_empty() {
                return None;
            }
            Some((key, val))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headers() {
        let raw = vec![
            "Accept: application/json".to_string(),
            ": orphan".to_string(),
            "X-Empty".to_string(),
        ];
        assert_eq!(
            parse_headers(&raw),
            vec![
                ("Accept".to_string(), "application/json".to_string()),
                ("X-Empty".to_string(), String::new()),
            ]
        );
    }
}

//! RFC 8288 `Link` header parsing for cursor-style pagination.

/// Pagination targets advertised by one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkSet {
    pub next: Option<String>,
    pub prev: Option<String>,
    pub first: Option<String>,
    pub last: Option<String>,
}

impl LinkSet {
    /// Parse `<url>; rel="next", <url>; rel="last"`.
    ///
    /// Unknown relations and malformed entries are ignored. A `rel` may list
    /// several space-separated relation types.
    pub fn parse(header: &str) -> Self {
        let mut links = LinkSet::default();
        for entry in split_entries(header) {
            let Some((target, params)) = parse_entry(entry) else {
                continue;
            };
            for rel in params {
                let slot = match rel.as_str() {
                    "next" => &mut links.next,
                    "prev" | "previous" => &mut links.prev,
                    "first" => &mut links.first,
                    "last" => &mut links.last,
                    _ => continue,
                };
                if slot.is_none() {
                    *slot = Some(target.to_string());
                }
            }
        }
        links
    }
}

/// Split on commas that sit outside `<...>`, since URLs may contain commas.
fn split_entries(header: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, ch) in header.char_indices() {
        match ch {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                entries.push(&header[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    entries.push(&header[start..]);
    entries
}

fn parse_entry(entry: &str) -> Option<(&str, Vec<String>)> {
    let entry = entry.trim();
    let rest = entry.strip_prefix('<')?;
    let close = rest.find('>')?;
    let target = rest[..close].trim();

    let rels = rest[close + 1..]
        .split(';')
        .filter_map(|param| {
            let (key, value) = param.split_once('=')?;
            if !key.trim().eq_ignore_ascii_case("rel") {
                return None;
            }
            Some(value.trim().trim_matches('"').to_ascii_lowercase())
        })
        .flat_map(|value| {
            value
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect();
    Some((target, rels))
}

//! Canonical identity scheme tying REST paths and MCP entity names to a single
//! addressable "slug" used throughout the management API (spec §4.2).

/// Computes the canonical slug for a REST path.
///
/// Steps (must match exactly on both server and clients):
/// 1. Empty input -> `"empty"`.
/// 2. Strip a leading `/`.
/// 3. Note and strip a trailing `/`.
/// 4. Replace internal `/` with `-`.
/// 5. Replace any character outside `[A-Za-z0-9-]` with `-`.
/// 6. Collapse consecutive `-`.
/// 7. Trim leading/trailing `-`.
/// 8. If step 3 stripped a trailing slash, append `-slash`.
pub fn slug_for_path(path: &str) -> String {
    if path.is_empty() {
        return "empty".to_string();
    }

    let mut s = path;
    if let Some(stripped) = s.strip_prefix('/') {
        s = stripped;
    }

    let had_trailing_slash = s.ends_with('/') && !s.is_empty();
    let s = if had_trailing_slash {
        s.strip_suffix('/').unwrap_or(s)
    } else {
        s
    };

    let replaced: String = s
        .chars()
        .map(|c| if c == '/' { '-' } else { c })
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let collapsed = collapse_dashes(&replaced);
    let trimmed = collapsed.trim_matches('-').to_string();

    if had_trailing_slash {
        if trimmed.is_empty() {
            "slash".to_string()
        } else {
            format!("{trimmed}-slash")
        }
    } else if trimmed.is_empty() {
        "empty".to_string()
    } else {
        trimmed
    }
}

fn collapse_dashes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_dash = false;
    for c in s.chars() {
        if c == '-' {
            if !prev_dash {
                out.push(c);
            }
            prev_dash = true;
        } else {
            out.push(c);
            prev_dash = false;
        }
    }
    out
}

/// MCP entities carry an already URL-safe `mcp_name`, used verbatim as the slug.
pub fn slug_for_mcp_name(mcp_name: &str) -> String {
    mcp_name.to_string()
}

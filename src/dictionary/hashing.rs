//! Canonical hashing of event and function signatures into the values the
//! dictionary indexes (`topics0` hashes, 4-byte function selectors).

use alloy_primitives::keccak256;

const SELECTOR_BYTES: usize = 4;

/// Converts an event signature into its topic hash. Hex input is passed through lower-cased.
pub fn event_to_topic(input: &str) -> String {
    let input = input.trim();
    if is_hex_string(input) {
        return input.to_ascii_lowercase();
    }
    let canonical = canonical_signature(input, "event");
    format!("0x{}", hex::encode(keccak256(canonical.as_bytes())))
}

/// Converts a function signature into its 4-byte selector. Hex input is passed through lower-cased.
pub fn function_to_selector(input: &str) -> String {
    let input = input.trim();
    if is_hex_string(input) {
        return input.to_ascii_lowercase();
    }
    let canonical = canonical_signature(input, "function");
    let hash = keccak256(canonical.as_bytes());
    format!("0x{}", hex::encode(&hash[..SELECTOR_BYTES]))
}

pub fn is_hex_string(value: &str) -> bool {
    let Some(digits) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    else {
        return false;
    };
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit())
}

/// Reduces a human-readable signature to `name(type,type,...)`.
///
/// Parameter names, `indexed` markers and data locations are dropped, and the
/// `uint`/`int` aliases are widened to their 256-bit forms.
pub fn canonical_signature(input: &str, keyword: &str) -> String {
    let mut body = input.trim();
    if let Some(rest) = body.strip_prefix(keyword) {
        if rest.starts_with(char::is_whitespace) {
            body = rest.trim_start();
        }
    }

    let Some(open) = body.find('(') else {
        return body.to_owned();
    };
    let name = body[..open].trim();
    let close = matching_paren(body, open).unwrap_or(body.len());
    let params = &body[open + 1..close];
    format!("{name}({})", canonical_params(params))
}

fn canonical_params(params: &str) -> String {
    split_top_level(params)
        .into_iter()
        .map(str::trim)
        .filter(|param| !param.is_empty())
        .map(canonical_param)
        .collect::<Vec<_>>()
        .join(",")
}

fn canonical_param(param: &str) -> String {
    let tuple_start = if param.starts_with('(') {
        Some(0)
    } else if param.starts_with("tuple(") {
        Some("tuple".len())
    } else {
        None
    };

    if let Some(open) = tuple_start {
        let close = matching_paren(param, open).unwrap_or(param.len());
        let inner = &param[open + 1..close];
        let rest = param.get(close + 1..).unwrap_or("");
        let suffix = rest
            .split_whitespace()
            .next()
            .filter(|token| token.starts_with('['))
            .unwrap_or("");
        return format!("({}){suffix}", canonical_params(inner));
    }

    widen(param.split_whitespace().next().unwrap_or(""))
}

fn widen(ty: &str) -> String {
    let (base, suffix) = match ty.find('[') {
        Some(idx) => ty.split_at(idx),
        None => (ty, ""),
    };
    match base {
        "uint" => format!("uint256{suffix}"),
        "int" => format!("int256{suffix}"),
        _ => ty.to_owned(),
    }
}

fn matching_paren(value: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, ch) in value.char_indices().skip_while(|(idx, _)| *idx < open) {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in params.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&params[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&params[start..]);
    parts
}

//! Version string extraction

use crate::model::CoreType;

pub(crate) const UNKNOWN: &str = "Unknown";

/// Extract the version number from `version` subcommand output.
///
/// sing-box prints `sing-box version 1.12.17` (older builds: `sing-box 1.x.y`),
/// Xray prints `Xray 1.8.24 (Xray, Penetrates Everything.) ...`.
pub fn parse_version(core: CoreType, output: &str) -> String {
    let output = output.trim();
    let Some(first_line) = output.lines().next().map(str::trim) else {
        return UNKNOWN.to_string();
    };
    if first_line.is_empty() {
        return UNKNOWN.to_string();
    }

    let found = match core {
        CoreType::SingBox => after_keyword(output, "version ")
            .filter(|v| is_dotted(v))
            .or_else(|| {
                let legacy = first_line.to_ascii_lowercase().starts_with("sing-box ");
                legacy.then(|| after_keyword(first_line, "sing-box ")).flatten()
            }),
        CoreType::Xray => {
            let mut tokens = first_line.split_whitespace();
            match (tokens.next(), tokens.next()) {
                (Some(name), Some(version)) if name.eq_ignore_ascii_case("xray") => {
                    Some(version.to_string())
                }
                _ => None,
            }
        }
    };

    found
        .or_else(|| {
            first_line
                .split_whitespace()
                .find(|t| is_dotted(t))
                .map(str::to_string)
        })
        .unwrap_or_else(|| first_line.to_string())
}

/// First token after a case-insensitive keyword
fn after_keyword(text: &str, keyword: &str) -> Option<String> {
    let idx = text.to_ascii_lowercase().find(keyword)?;
    text[idx + keyword.len()..]
        .split_whitespace()
        .next()
        .map(str::to_string)
}

fn is_dotted(token: &str) -> bool {
    token.contains('.') && token.starts_with(|c: char| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singbox_versions() {
        let out = "sing-box version 1.12.17\n\nEnvironment: go1.25.6 linux/amd64\nTags: with_gvisor";
        assert_eq!(parse_version(CoreType::SingBox, out), "1.12.17");
        assert_eq!(parse_version(CoreType::SingBox, "sing-box 1.8.0"), "1.8.0");
        assert_eq!(parse_version(CoreType::SingBox, "build 2.0.1 dev"), "2.0.1");
        assert_eq!(parse_version(CoreType::SingBox, "nightly"), "nightly");
        assert_eq!(parse_version(CoreType::SingBox, "  "), "Unknown");
    }

    #[test]
    fn test_xray_versions() {
        let out = "Xray 1.8.24 (Xray, Penetrates Everything.) 1b6b3a1 (go1.22.5 linux/amd64)\nA unified platform";
        assert_eq!(parse_version(CoreType::Xray, out), "1.8.24");
        assert_eq!(parse_version(CoreType::Xray, "core v 25.1.30"), "25.1.30");
    }
}

use crate::error::{Result, ScanError};
use crate::types::EngineKind;

/// Every TCP port, used by `auto` on the fast engine.
pub const FULL_RANGE: &str = "1-65535";

/// Constrained list used by `auto` on the verify engine.
pub const VERIFY_AUTO_PORTS: &str = "1-1024,8080,8443,3000,5000,8000,8087,9000";

/// Fixed well-known ports used by `top`, regardless of engine.
pub const TOP_PORTS: &str = "22,21,25,53,80,110,143,443,3306,5432,6379,27017,8080,8443";

/// Expand the `auto`/`top` keywords for the given engine.
///
/// Empty input means `auto`. Any other value is returned unchanged; use
/// [`validate_port_spec`] to reject malformed literals first.
pub fn resolve_port_spec(spec: &str, engine: EngineKind) -> String {
    let p = spec.trim().to_ascii_lowercase();
    match p.as_str() {
        "" | "auto" => {
            let resolved = match engine {
                EngineKind::Fast => FULL_RANGE,
                EngineKind::Verify => VERIFY_AUTO_PORTS,
            };
            tracing::info!(%engine, ports = resolved, "auto ports resolved");
            resolved.to_string()
        }
        "top" => {
            tracing::info!("top ports mode enabled");
            TOP_PORTS.to_string()
        }
        _ => spec.to_string(),
    }
}

/// Accept keywords as-is and check that a literal spec parses.
pub fn validate_port_spec(spec: &str) -> Result<()> {
    let p = spec.trim().to_ascii_lowercase();
    if matches!(p.as_str(), "" | "auto" | "top") {
        return Ok(());
    }
    // Literals reach the engine command line verbatim.
    if let Some(c) = p.chars().find(|c| !(c.is_ascii_digit() || matches!(c, ',' | '-' | ' '))) {
        return Err(invalid(format!("invalid character {c:?} in port spec")));
    }
    parse_port_spec(spec).map(|_| ())
}

/// Parse a port spec into a deduplicated list of TCP ports (1..=65535).
///
/// Supported items, separated by commas or newlines:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - comments: everything after `#` on a line is ignored
/// - whitespace and blank items are ignored
pub fn parse_port_spec(s: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for raw_line in s.lines() {
        let line = raw_line.split('#').next().unwrap_or("");
        for item in line.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            if let Some((a, b)) = item.split_once('-') {
                let start = parse_port_str(a.trim())?;
                let end = parse_port_str(b.trim())?;
                if start > end {
                    return Err(invalid(format!("invalid range {start}-{end} (start > end)")));
                }
                for p in start..=end {
                    if seen.insert(p) {
                        out.push(p);
                    }
                }
                continue;
            }

            let p = parse_port_str(item)?;
            if seen.insert(p) {
                out.push(p);
            }
        }
    }

    if out.is_empty() {
        return Err(invalid("empty port specification".into()));
    }
    Ok(out)
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s
        .parse::<u32>()
        .map_err(|_| invalid(format!("invalid port value: {s:?}")))?;
    if val == 0 || val > 65535 {
        return Err(invalid(format!("port out of range: {val}")));
    }
    Ok(val as u16)
}

fn invalid(msg: String) -> ScanError {
    ScanError::Validation(format!("invalid ports: {msg}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_and_empty_follow_engine() {
        assert_eq!(resolve_port_spec("", EngineKind::Fast), "1-65535");
        assert_eq!(resolve_port_spec(" AUTO ", EngineKind::Fast), "1-65535");
        assert_eq!(resolve_port_spec("auto", EngineKind::Verify), VERIFY_AUTO_PORTS);
    }

    #[test]
    fn top_ignores_engine() {
        assert_eq!(resolve_port_spec("top", EngineKind::Fast), TOP_PORTS);
        assert_eq!(resolve_port_spec("Top", EngineKind::Verify), TOP_PORTS);
    }

    #[test]
    fn literal_passes_through_unchanged() {
        assert_eq!(resolve_port_spec("22,80-90", EngineKind::Fast), "22,80-90");
    }

    #[test]
    fn parse_ranges_and_dedup() {
        let ports = parse_port_spec("8000-8002,80,8001").unwrap();
        assert_eq!(ports, vec![8000, 8001, 8002, 80]);
    }

    #[test]
    fn parse_with_comments_and_whitespace() {
        let input = r#"
            # common web ports
            80  # http
            443 , 8000-8002   # dev servers
        "#;
        let ports = parse_port_spec(input).unwrap();
        assert_eq!(ports, vec![80, 443, 8000, 8001, 8002]);
    }

    #[test]
    fn invalid_values_error() {
        assert!(parse_port_spec("70000").is_err());
        assert!(parse_port_spec("0").is_err());
        assert!(parse_port_spec("90-80").is_err());
        assert!(parse_port_spec("--script=vuln").is_err());
        assert!(parse_port_spec(" , ").is_err());
    }

    #[test]
    fn keywords_validate() {
        for spec in ["", "auto", "TOP", "1-1024,8080"] {
            assert!(validate_port_spec(spec).is_ok(), "{spec}");
        }
        assert!(matches!(
            validate_port_spec("http"),
            Err(ScanError::Validation(_))
        ));
    }

    #[test]
    fn literal_with_comment_or_newline_is_rejected() {
        assert!(parse_port_spec("22 # ssh").is_ok());
        assert!(validate_port_spec("22 # ssh").is_err());
        assert!(validate_port_spec("22\n80").is_err());
        assert!(validate_port_spec("22\t80").is_err());
        assert!(validate_port_spec("22, 80-90").is_ok());
    }
}

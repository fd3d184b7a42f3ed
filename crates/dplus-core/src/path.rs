//! Service name matching and object path helpers.
//!
//! Bus service names are dot-separated strings like
//! "com.victronenergy.battery.ttyO1". Discovery filters them against
//! glob patterns such as "com.victronenergy.battery.*".
//!
//! Relay channel identifiers entered by operators come in several shapes
//! (bus paths, settings paths, service-qualified paths); they are reduced to
//! the bare channel identifier used by the relay catalog.

/// A segment in a service pattern.
#[derive(Debug, Clone, PartialEq)]
enum PatternSegment {
    Literal(String),
    /// `*`: one segment mid-pattern, any non-empty suffix at the end
    Wildcard,
}

/// A glob pattern over dot-separated service names.
///
/// Supported patterns:
/// - Exact: "com.victronenergy.system"
/// - Suffix wildcard: "com.victronenergy.battery.*"
/// - Mid-name wildcard: "com.*.system"
#[derive(Debug, Clone)]
pub struct ServicePattern {
    raw: String,
    segments: Vec<PatternSegment>,
    trailing_wildcard: bool,
}

impl ServicePattern {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(PatternError::EmptyPattern);
        }

        let parts: Vec<&str> = trimmed.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(PatternError::EmptySegment(trimmed.to_string()));
        }

        let segments = parts
            .iter()
            .map(|&s| {
                if s == "*" {
                    PatternSegment::Wildcard
                } else {
                    PatternSegment::Literal(s.to_string())
                }
            })
            .collect();

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
            trailing_wildcard: parts.last() == Some(&"*"),
        })
    }

    /// Check if a service name matches this pattern.
    ///
    /// A trailing wildcard requires at least one extra segment, so
    /// "com.victronenergy.battery.*" does not match "com.victronenergy.battery".
    pub fn matches(&self, name: &str) -> bool {
        let parts: Vec<&str> = name.split('.').collect();

        if self.trailing_wildcard {
            if parts.len() < self.segments.len() {
                return false;
            }
        } else if parts.len() != self.segments.len() {
            return false;
        }

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                PatternSegment::Literal(lit) => {
                    if parts[i] != lit {
                        return false;
                    }
                }
                PatternSegment::Wildcard => {
                    if parts[i].is_empty() {
                        return false;
                    }
                    if self.trailing_wildcard && i == self.segments.len() - 1 {
                        return parts[i..].iter().all(|p| !p.is_empty());
                    }
                }
            }
        }

        true
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for ServicePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Errors that can occur when creating a service pattern.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatternError {
    #[error("Empty pattern")]
    EmptyPattern,

    #[error("Empty segment in pattern {0:?}")]
    EmptySegment(String),
}

/// Reduce an operator-entered relay identifier to a bare channel id.
///
/// Backslashes count as separators. A leading service name (any segment
/// containing a dot), `Settings`, `Relays` and `Relay` prefixes and a
/// trailing `State` are stripped:
///
/// - "Relays/4brelays/0" -> "4brelays/0"
/// - "Settings/Relays/relay/0/State" -> "0"
/// - "com.victronenergy.system/Relays/Relay/2" -> "2"
pub fn normalize_relay_channel(raw: &str) -> String {
    let unified = raw.trim().replace('\\', "/");
    let mut segments: Vec<&str> = unified.split('/').filter(|s| !s.is_empty()).collect();

    if segments.first().map_or(false, |s| s.contains('.')) {
        segments.remove(0);
    }
    for prefix in ["settings", "relays", "relay"] {
        if segments.len() > 1 && segments[0].eq_ignore_ascii_case(prefix) {
            segments.remove(0);
        }
    }
    if segments.len() > 1 && segments.last().map_or(false, |s| s.eq_ignore_ascii_case("state")) {
        segments.pop();
    }

    segments.join("/")
}

/// Join object path pieces into one absolute path.
///
/// `join_object_path("/Relays", "0/State")` is "/Relays/0/State".
pub fn join_object_path(base: &str, rest: &str) -> String {
    let base = base.trim_end_matches('/');
    let rest = rest.trim_start_matches('/');
    match (base.is_empty(), rest.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", rest),
        (false, true) if base.starts_with('/') => base.to_string(),
        (false, true) => format!("/{}", base),
        _ if base.starts_with('/') => format!("{}/{}", base, rest),
        _ => format!("/{}/{}", base, rest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_pattern() {
        let pattern = ServicePattern::new("com.victronenergy.system").unwrap();
        assert!(pattern.matches("com.victronenergy.system"));
        assert!(!pattern.matches("com.victronenergy.system.extra"));
        assert!(!pattern.matches("com.victronenergy.settings"));
    }

    #[test]
    fn test_suffix_wildcard() {
        let pattern = ServicePattern::new("com.victronenergy.battery.*").unwrap();
        assert!(pattern.matches("com.victronenergy.battery.ttyO1"));
        assert!(pattern.matches("com.victronenergy.battery.socketcan_can0.vecan0"));
        assert!(!pattern.matches("com.victronenergy.battery"));
        assert!(!pattern.matches("com.victronenergy.solarcharger.ttyO2"));
    }

    #[test]
    fn test_mid_wildcard() {
        let pattern = ServicePattern::new("com.*.system").unwrap();
        assert!(pattern.matches("com.victronenergy.system"));
        assert!(!pattern.matches("com.victronenergy.battery"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert_eq!(ServicePattern::new("  ").unwrap_err(), PatternError::EmptyPattern);
        assert!(matches!(
            ServicePattern::new("com..battery"),
            Err(PatternError::EmptySegment(_))
        ));
    }

    #[test]
    fn test_normalize_relay_channel() {
        assert_eq!(normalize_relay_channel("Relays/4brelays/0"), "4brelays/0");
        assert_eq!(normalize_relay_channel("Settings/Relays/relay/0/State"), "0");
        assert_eq!(normalize_relay_channel("\\Relays\\Relay/1\\State"), "1");
        assert_eq!(normalize_relay_channel("com.victronenergy.system/Relays/Relay/2"), "2");
    }

    #[test]
    fn test_normalize_keeps_bare_channels() {
        assert_eq!(normalize_relay_channel("4brelays/1"), "4brelays/1");
        assert_eq!(normalize_relay_channel(" 0 "), "0");
        assert_eq!(normalize_relay_channel(""), "");
    }

    #[test]
    fn test_join_object_path() {
        assert_eq!(join_object_path("/Relays", "0/State"), "/Relays/0/State");
        assert_eq!(join_object_path("/Relays/", "/Count"), "/Relays/Count");
        assert_eq!(join_object_path("", "Dc/1/Voltage"), "/Dc/1/Voltage");
    }
}

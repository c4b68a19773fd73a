//! # Capability Advertising
//!
//! Capabilities travel as a compact `key=value` string in the user profile,
//! so peers learn what we support without a message exchange. Unknown keys
//! are ignored for forward compatibility.

use shared_types::Caps;

const KEY_RECEIVE: &str = "receive";
const KEY_WEB_RTC: &str = "webRTC";

/// Render capabilities as the advertised profile string.
#[must_use]
pub fn stringify_caps(caps: &Caps) -> String {
    format!(
        "{KEY_RECEIVE}={},{KEY_WEB_RTC}={}",
        u8::from(caps.receive),
        u8::from(caps.web_rtc)
    )
}

/// Parse an advertised capability string. Missing keys keep their defaults;
/// a malformed string parses as the default capability set.
#[must_use]
pub fn parse_caps(text: &str) -> Caps {
    let mut caps = Caps::default();
    for pair in text.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let enabled = matches!(value.trim(), "1" | "true");
        match key.trim() {
            KEY_RECEIVE => caps.receive = enabled,
            KEY_WEB_RTC => caps.web_rtc = enabled,
            _ => {}
        }
    }
    caps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let caps = Caps { receive: true, web_rtc: true };
        assert_eq!(parse_caps(&stringify_caps(&caps)), caps);

        let caps = Caps { receive: false, web_rtc: false };
        assert_eq!(parse_caps(&stringify_caps(&caps)), caps);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let caps = parse_caps("receive=0,mediated=1,webRTC=1");
        assert!(!caps.receive);
        assert!(caps.web_rtc);
    }

    #[test]
    fn test_garbage_parses_as_default() {
        assert_eq!(parse_caps("not a caps string"), Caps::default());
        assert_eq!(parse_caps(""), Caps::default());
    }
}

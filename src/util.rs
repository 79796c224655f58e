//! Small helpers shared across the crate.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch as a float, the timestamp format used in
/// event payloads and the WebSocket UI.
pub fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Fold accented Latin letters to their ASCII base and drop spaces.
///
/// Entity ids must stay stable across HA restarts, so this mirrors the
/// NFD-based fold of the original board configs (Polish diacritics plus the
/// common Latin-1 range) rather than pulling in a Unicode table.
pub fn strip_accents(s: &str) -> String {
    s.chars()
        .filter(|c| *c != ' ')
        .map(|c| match c {
            'ą' | 'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
            'Ą' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'A',
            'ć' | 'ç' | 'č' => 'c',
            'Ć' | 'Ç' | 'Č' => 'C',
            'ę' | 'è' | 'é' | 'ê' | 'ë' | 'ě' => 'e',
            'Ę' | 'È' | 'É' | 'Ê' | 'Ë' | 'Ě' => 'E',
            'ì' | 'í' | 'î' | 'ï' => 'i',
            'Ì' | 'Í' | 'Î' | 'Ï' => 'I',
            'ł' => 'l',
            'Ł' => 'L',
            'ń' | 'ñ' | 'ň' => 'n',
            'Ń' | 'Ñ' | 'Ň' => 'N',
            'ò' | 'ó' | 'ô' | 'õ' | 'ö' => 'o',
            'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => 'O',
            'ś' | 'š' => 's',
            'Ś' | 'Š' => 'S',
            'ù' | 'ú' | 'û' | 'ü' => 'u',
            'Ù' | 'Ú' | 'Û' | 'Ü' => 'U',
            'ý' | 'ÿ' => 'y',
            'Ý' => 'Y',
            'ź' | 'ż' | 'ž' => 'z',
            'Ź' | 'Ż' | 'Ž' => 'Z',
            other => other,
        })
        .collect()
}

/// Normalised entity id: accents folded, spaces stripped, lowercased.
pub fn normalize_id(s: &str) -> String {
    strip_accents(s).to_lowercase()
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accents_fold_to_ascii() {
        assert_eq!(strip_accents("Światło Góra"), "SwiatloGora");
        assert_eq!(normalize_id("Żaluzja Południe"), "zaluzjapoludnie");
    }

    #[test]
    fn wildcard_matching() {
        assert!(topic_matches("boneio/cmd/+/+/#", "boneio/cmd/relay/r1/set"));
        assert!(topic_matches("boneio/energy/#", "boneio/energy/r1"));
        assert!(topic_matches("homeassistant/status", "homeassistant/status"));
        assert!(!topic_matches("boneio/cmd/+/+/#", "boneio/relay/r1"));
        assert!(!topic_matches("boneio/state", "boneio/state/extra"));
    }
}

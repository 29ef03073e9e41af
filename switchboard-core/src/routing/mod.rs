//! Dialed-number routing.
//!
//! Numbers arrive from two places: the dial-plan extension carried on the
//! UUID handshake (direct dial) and DTMF digits typed during a call. Both
//! funnel through `PhoneRouter`, which normalizes the digits and resolves
//! them against the static directory, the birthday pattern, and the
//! single-key shortcut table.

pub mod directory;

pub use directory::{DirectoryEntry, EntryType};

use directory::{
    letters_of, ALIAS_TO_NUMBER, BIRTHDAY_FEATURE, BIRTHDAY_GREETING, BIRTHDAY_NAME,
    BIRTHDAY_PATTERN, DTMF_SHORTCUTS, FEATURE_TO_NUMBER, NOT_IN_SERVICE_GREETING, PHONE_DIRECTORY,
};
use tracing::debug;

/// Where a dialed number leads.
#[derive(Debug, Clone)]
pub struct RouteResult {
    pub feature: String,
    pub display_name: String,
    pub entry_type: EntryType,
    pub persona_key: Option<String>,
    pub greeting: Option<String>,
    pub is_direct_dial: bool,
}

/// Stateless resolver over the static tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhoneRouter;

impl PhoneRouter {
    pub fn new() -> Self {
        Self
    }

    /// Normalize a dialed number to `XXX-XXXX`.
    ///
    /// 11 digits with a leading 1 lose country and area code; 10 digits
    /// lose the area code; 7 digits gain the dash. Anything else comes
    /// back as bare digits, which matches no directory entry.
    pub fn normalize(number: &str) -> String {
        let mut digits: String = number.chars().filter(char::is_ascii_digit).collect();

        if digits.len() == 11 && digits.starts_with('1') {
            digits = digits[4..].to_string();
        } else if digits.len() == 10 {
            digits = digits[3..].to_string();
        }

        if digits.len() == 7 {
            format!("{}-{}", &digits[..3], &digits[3..])
        } else {
            digits
        }
    }

    /// Resolve a dialed number: directory, then vanity aliases, then the
    /// birthday pattern, then the not-in-service fallback.
    pub fn route(&self, dialed: &str) -> RouteResult {
        let normalized = Self::normalize(dialed);

        if let Some(entry) = PHONE_DIRECTORY.get(normalized.as_str()) {
            debug!(number = %normalized, feature = entry.feature, "routed via directory");
            return Self::entry_result(entry);
        }

        // Dial-plan extensions may carry the lettered vanity form
        // ("555-JOKE", "POPCORN").
        let letters = letters_of(dialed);
        if !letters.is_empty() {
            if let Some(entry) = ALIAS_TO_NUMBER
                .get(letters.as_str())
                .and_then(|number| PHONE_DIRECTORY.get(number))
            {
                debug!(alias = %letters, feature = entry.feature, "routed via vanity alias");
                return Self::entry_result(entry);
            }
        }

        if BIRTHDAY_PATTERN.is_match(&normalized) {
            debug!(number = %normalized, "routed to birthday line");
            return RouteResult {
                feature: BIRTHDAY_FEATURE.to_string(),
                display_name: BIRTHDAY_NAME.to_string(),
                entry_type: EntryType::EasterEgg,
                persona_key: None,
                greeting: Some(BIRTHDAY_GREETING.to_string()),
                is_direct_dial: true,
            };
        }

        debug!(number = %normalized, "number not in service");
        RouteResult {
            feature: "invalid".to_string(),
            display_name: "Not In Service".to_string(),
            entry_type: EntryType::Invalid,
            persona_key: None,
            greeting: Some(NOT_IN_SERVICE_GREETING.to_string()),
            is_direct_dial: false,
        }
    }

    /// Resolve DTMF input typed during a call: single-key shortcuts first,
    /// then full numbers through `route`.
    pub fn route_dtmf(&self, digits: &str) -> RouteResult {
        if digits.len() == 1 {
            if let Some(&feature) = digits
                .chars()
                .next()
                .and_then(|d| DTMF_SHORTCUTS.get(&d))
            {
                let display_name = FEATURE_TO_NUMBER
                    .get(feature)
                    .and_then(|number| PHONE_DIRECTORY.get(number))
                    .map(|entry| entry.name.to_string())
                    .unwrap_or_else(|| feature.replace('_', " "));
                let greeting = FEATURE_TO_NUMBER
                    .get(feature)
                    .and_then(|number| PHONE_DIRECTORY.get(number))
                    .map(|entry| entry.greeting.to_string());
                return RouteResult {
                    feature: feature.to_string(),
                    display_name,
                    entry_type: EntryType::Feature,
                    persona_key: None,
                    greeting,
                    is_direct_dial: false,
                };
            }
        }

        RouteResult {
            is_direct_dial: false,
            ..self.route(digits)
        }
    }

    fn entry_result(entry: &DirectoryEntry) -> RouteResult {
        RouteResult {
            feature: entry.feature.to_string(),
            display_name: entry.name.to_string(),
            entry_type: entry.entry_type,
            persona_key: entry.persona_key.map(str::to_string),
            greeting: Some(entry.greeting.to_string()),
            is_direct_dial: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_handles_all_standard_lengths() {
        assert_eq!(PhoneRouter::normalize("5555653"), "555-5653");
        assert_eq!(PhoneRouter::normalize("8005555653"), "555-5653");
        assert_eq!(PhoneRouter::normalize("18005555653"), "555-5653");
        assert_eq!(PhoneRouter::normalize("555-5653"), "555-5653");
        assert_eq!(PhoneRouter::normalize("(800) 555-5653"), "555-5653");
    }

    #[test]
    fn normalize_leaves_odd_lengths_as_digits() {
        assert_eq!(PhoneRouter::normalize("123"), "123");
        assert_eq!(PhoneRouter::normalize("12345678"), "12345678");
        assert_eq!(PhoneRouter::normalize(""), "");
    }

    #[test]
    fn normalize_is_a_retraction() {
        for input in ["5555653", "18005555653", "555-5653", "12", "banana", "555-0214"] {
            let once = PhoneRouter::normalize(input);
            assert_eq!(PhoneRouter::normalize(&once), once, "input {input:?}");
        }
    }

    #[test]
    fn route_finds_directory_entries() {
        let router = PhoneRouter::new();
        let result = router.route("555-5653");
        assert_eq!(result.feature, "jokes");
        assert_eq!(result.entry_type, EntryType::Feature);
        assert!(result.is_direct_dial);
        assert_eq!(
            result.greeting.as_deref(),
            Some("Welcome to Dial-A-Joke! Want to hear a joke?")
        );
    }

    #[test]
    fn vanity_aliases_route_to_their_entries() {
        let router = PhoneRouter::new();
        assert_eq!(router.route("555-JOKE").feature, "jokes");
        assert_eq!(router.route("POPCORN").feature, "time_temp");
        assert_eq!(router.route("777-FILM").feature, "moviefone");
        assert!(router.route("555-joke").is_direct_dial);
    }

    #[test]
    fn numeric_form_wins_over_stray_letters() {
        let router = PhoneRouter::new();
        // A full 7-digit number routes by digits even with letters present.
        assert_eq!(router.route("555-5653 x JOKE").feature, "jokes");
    }

    #[test]
    fn route_matches_birthday_pattern() {
        let router = PhoneRouter::new();
        let result = router.route("555-0214");
        assert_eq!(result.feature, "easter_birthday");
        assert_eq!(result.entry_type, EntryType::EasterEgg);
        assert!(result.greeting.is_some());
    }

    #[test]
    fn unknown_number_is_invalid_with_greeting() {
        let router = PhoneRouter::new();
        let result = router.route("555-9999");
        assert_eq!(result.entry_type, EntryType::Invalid);
        assert!(result
            .greeting
            .as_deref()
            .unwrap()
            .contains("not in service"));
        assert!(!result.is_direct_dial);
    }

    #[test]
    fn routed_features_exist_in_directory() {
        let router = PhoneRouter::new();
        for number in ["555-5653", "555-8748", "867-5309", "555-7243"] {
            let result = router.route(number);
            assert!(
                directory::FEATURE_TO_NUMBER.contains_key(result.feature.as_str()),
                "feature {} not in directory",
                result.feature
            );
        }
    }

    #[test]
    fn dtmf_single_digit_shortcut() {
        let router = PhoneRouter::new();
        let result = router.route_dtmf("1");
        assert_eq!(result.feature, "jokes");
        assert_eq!(result.display_name, "Dial-A-Joke");
        assert!(!result.is_direct_dial);
    }

    #[test]
    fn dtmf_multi_digit_routes_as_number() {
        let router = PhoneRouter::new();
        let result = router.route_dtmf("5558748");
        assert_eq!(result.feature, "trivia");
        assert!(!result.is_direct_dial);
    }

    #[test]
    fn dtmf_unknown_digit_is_invalid() {
        let router = PhoneRouter::new();
        let result = router.route_dtmf("#");
        assert_eq!(result.entry_type, EntryType::Invalid);
    }

    #[test]
    fn persona_route_carries_persona_key() {
        let router = PhoneRouter::new();
        let result = router.route("555-4726");
        assert_eq!(result.entry_type, EntryType::Persona);
        assert_eq!(result.persona_key.as_deref(), Some("grandma"));
    }
}

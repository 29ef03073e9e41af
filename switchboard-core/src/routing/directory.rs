//! Static phone directory.
//!
//! Maps 7-digit dial strings (`XXX-XXXX`) to features, personas, and
//! easter eggs. Loaded once; the full production catalog lives outside
//! the engine and follows the same shape.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// Three flavors of dialed destination; they differ only in which system
/// prompt is applied. `Invalid` marks numbers not in service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Feature,
    Persona,
    EasterEgg,
    Invalid,
}

/// One directory row.
#[derive(Debug, Clone, Copy)]
pub struct DirectoryEntry {
    pub feature: &'static str,
    pub name: &'static str,
    pub entry_type: EntryType,
    pub greeting: &'static str,
    pub persona_key: Option<&'static str>,
    pub alias: Option<&'static str>,
}

pub const OPERATOR_NUMBER: &str = "555-0000";
pub const OPERATOR_FEATURE: &str = "operator";

/// Matches 555-MMDD where MM is 01-12 and DD is 01-31.
pub static BIRTHDAY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^555-(?:0[1-9]|1[0-2])(?:0[1-9]|[12]\d|3[01])$").expect("birthday regex"));

pub const BIRTHDAY_FEATURE: &str = "easter_birthday";
pub const BIRTHDAY_NAME: &str = "Birthday Line";
pub const BIRTHDAY_GREETING: &str =
    "Happy birthday to you! The switchboard wishes you a wonderful day!";

pub const NOT_IN_SERVICE_GREETING: &str = "We're sorry. The number you have dialed is not in service. \
     Please check the number and try again, or dial 555-0000 for the operator.";

macro_rules! entry {
    ($feature:expr, $name:expr, $type:expr, $greeting:expr) => {
        DirectoryEntry {
            feature: $feature,
            name: $name,
            entry_type: $type,
            greeting: $greeting,
            persona_key: None,
            alias: None,
        }
    };
    ($feature:expr, $name:expr, $type:expr, $greeting:expr, alias = $alias:expr) => {
        DirectoryEntry {
            feature: $feature,
            name: $name,
            entry_type: $type,
            greeting: $greeting,
            persona_key: None,
            alias: Some($alias),
        }
    };
    ($feature:expr, $name:expr, $type:expr, $greeting:expr, persona = $persona:expr, alias = $alias:expr) => {
        DirectoryEntry {
            feature: $feature,
            name: $name,
            entry_type: $type,
            greeting: $greeting,
            persona_key: Some($persona),
            alias: Some($alias),
        }
    };
}

pub static PHONE_DIRECTORY: Lazy<HashMap<&'static str, DirectoryEntry>> = Lazy::new(|| {
    HashMap::from([
        // Core
        (
            OPERATOR_NUMBER,
            entry!(
                "operator",
                "The Operator",
                EntryType::Feature,
                "You're speaking with the operator. How can I help?"
            ),
        ),
        // Historic numbers
        (
            "767-2676",
            entry!(
                "time_temp",
                "Time & Temperature",
                EntryType::Feature,
                "At the tone, the time will be now. Welcome to Time and Temperature.",
                alias = "POPCORN"
            ),
        ),
        (
            "777-3456",
            entry!(
                "moviefone",
                "Moviefone",
                EntryType::Feature,
                "Hello, and welcome to Moviefone! What movie would you like to see?",
                alias = "777-FILM"
            ),
        ),
        (
            "867-5309",
            entry!(
                "easter_jenny",
                "Jenny",
                EntryType::EasterEgg,
                "Hello? Who is this? How did you get this number? Oh, you must have got it off the wall."
            ),
        ),
        // Information
        (
            "555-9328",
            entry!(
                "weather",
                "Weather Forecast",
                EntryType::Feature,
                "Welcome to the Weather Forecast line. What city would you like the forecast for?",
                alias = "WEAT"
            ),
        ),
        (
            "555-4676",
            entry!(
                "horoscope",
                "Daily Horoscope",
                EntryType::Feature,
                "Welcome to the Horoscope Line. What's your sign?",
                alias = "HORO"
            ),
        ),
        // Entertainment
        (
            "555-5653",
            entry!(
                "jokes",
                "Dial-A-Joke",
                EntryType::Feature,
                "Welcome to Dial-A-Joke! Want to hear a joke?",
                alias = "JOKE"
            ),
        ),
        (
            "555-8748",
            entry!(
                "trivia",
                "Trivia Challenge",
                EntryType::Feature,
                "Welcome to Trivia Challenge! Ready for a question?",
                alias = "TRIV"
            ),
        ),
        (
            "555-7867",
            entry!(
                "stories",
                "Story Time",
                EntryType::Feature,
                "Welcome to Story Time. Would you like to hear a story?",
                alias = "STOR"
            ),
        ),
        (
            "555-3678",
            entry!(
                "fortune",
                "Fortune Teller",
                EntryType::Feature,
                "Welcome to the Fortune Teller. The spirits are listening. Ask about your future.",
                alias = "FORT"
            ),
        ),
        // Advice & support
        (
            "555-2384",
            entry!(
                "advice",
                "Advice Line",
                EntryType::Feature,
                "Welcome to the Advice Line. What's on your mind?",
                alias = "ADVI"
            ),
        ),
        (
            "555-2667",
            entry!(
                "compliment",
                "Compliment Line",
                EntryType::Feature,
                "Welcome to the Compliment Line. You're amazing, and here's why.",
                alias = "COMP"
            ),
        ),
        (
            "555-7627",
            entry!(
                "roast",
                "Roast Line",
                EntryType::Feature,
                "Welcome to the Roast Line. Hope you can take the heat!",
                alias = "ROAS"
            ),
        ),
        // Personas
        (
            "555-7243",
            entry!(
                "persona_sage",
                "Wise Sage",
                EntryType::Persona,
                "Greetings, seeker. The Wise Sage awaits your question.",
                persona = "sage",
                alias = "SAGE"
            ),
        ),
        (
            "555-5264",
            entry!(
                "persona_comedian",
                "Comedian",
                EntryType::Persona,
                "Hey hey hey! You've reached the Comedian! Let's have some laughs!",
                persona = "comedian",
                alias = "LAFF"
            ),
        ),
        (
            "555-3383",
            entry!(
                "persona_detective",
                "Noir Detective",
                EntryType::Persona,
                "The name's Jones. Detective Jones. Something tells me you're not calling about the weather.",
                persona = "detective",
                alias = "DETE"
            ),
        ),
        (
            "555-4726",
            entry!(
                "persona_grandma",
                "Southern Grandma",
                EntryType::Persona,
                "Well, bless your heart! It's Grandma Mae. Come sit down and chat with me, sugar.",
                persona = "grandma",
                alias = "GRAN"
            ),
        ),
        // Easter eggs
        (
            "555-2600",
            entry!(
                "easter_phreaker",
                "Blue Box Secret",
                EntryType::EasterEgg,
                "Two-six-hundred hertz. You know what that means. Welcome to the underground."
            ),
        ),
        (
            "555-1337",
            entry!(
                "easter_hacker",
                "Hacker Mode",
                EntryType::EasterEgg,
                "Access granted. Welcome to Hacker Mode. The mainframe awaits your commands."
            ),
        ),
        (
            "555-1313",
            entry!(
                "easter_haunted",
                "Haunted Booth",
                EntryType::EasterEgg,
                "You shouldn't have called this number. The line is cold. Something is here with us."
            ),
        ),
    ])
});

/// Single-digit shortcuts for quick access during a call.
pub static DTMF_SHORTCUTS: Lazy<HashMap<char, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ('0', "operator"),
        ('1', "jokes"),
        ('2', "trivia"),
        ('3', "fortune"),
        ('4', "horoscope"),
        ('5', "stories"),
        ('6', "compliment"),
        ('7', "advice"),
        ('8', "time_temp"),
        ('9', "roast"),
    ])
});

/// Reverse lookup: feature name → phone number.
pub static FEATURE_TO_NUMBER: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    PHONE_DIRECTORY
        .iter()
        .map(|(number, entry)| (entry.feature, *number))
        .collect()
});

/// Vanity lookup: alias letters → phone number. Keyed by letters only, so
/// "777-FILM" resolves as "FILM" and "555-JOKE" as "JOKE".
pub static ALIAS_TO_NUMBER: Lazy<HashMap<String, &'static str>> = Lazy::new(|| {
    PHONE_DIRECTORY
        .iter()
        .filter_map(|(number, entry)| entry.alias.map(|alias| (letters_of(alias), *number)))
        .filter(|(letters, _)| !letters.is_empty())
        .collect()
});

/// Uppercase letters of a dial string, for vanity alias lookups.
pub fn letters_of(dialed: &str) -> String {
    dialed
        .chars()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_number_is_listed() {
        let entry = PHONE_DIRECTORY.get(OPERATOR_NUMBER).expect("operator");
        assert_eq!(entry.feature, "operator");
        assert_eq!(entry.entry_type, EntryType::Feature);
    }

    #[test]
    fn birthday_pattern_accepts_valid_dates_only() {
        assert!(BIRTHDAY_PATTERN.is_match("555-0101"));
        assert!(BIRTHDAY_PATTERN.is_match("555-1231"));
        assert!(BIRTHDAY_PATTERN.is_match("555-0229"));
        assert!(!BIRTHDAY_PATTERN.is_match("555-0001"));
        assert!(!BIRTHDAY_PATTERN.is_match("555-1301"));
        assert!(!BIRTHDAY_PATTERN.is_match("555-0132"));
        assert!(!BIRTHDAY_PATTERN.is_match("556-0101"));
    }

    #[test]
    fn every_shortcut_names_a_directory_feature() {
        for feature in DTMF_SHORTCUTS.values() {
            assert!(
                FEATURE_TO_NUMBER.contains_key(feature),
                "shortcut feature {feature} missing from directory"
            );
        }
    }

    #[test]
    fn every_alias_resolves_to_its_own_number() {
        for (number, entry) in PHONE_DIRECTORY.iter() {
            if let Some(alias) = entry.alias {
                assert_eq!(
                    ALIAS_TO_NUMBER.get(&letters_of(alias)),
                    Some(number),
                    "alias {alias} does not resolve to {number}"
                );
            }
        }
    }

    #[test]
    fn letters_of_keeps_only_uppercased_letters() {
        assert_eq!(letters_of("777-FILM"), "FILM");
        assert_eq!(letters_of("555-joke"), "JOKE");
        assert_eq!(letters_of("555-9328"), "");
    }

    #[test]
    fn personas_carry_persona_keys() {
        for entry in PHONE_DIRECTORY.values() {
            if entry.entry_type == EntryType::Persona {
                assert!(entry.persona_key.is_some(), "{} lacks persona_key", entry.feature);
            }
        }
    }
}

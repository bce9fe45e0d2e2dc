// Reading catalogue, tiers, input rules and prompt assembly

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

pub const MAX_INPUT_LEN: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadingType {
    Tarot,
    Numerology,
    Horoscope,
    AngelNumbers,
    Astrology,
    Oracle,
    PastLife,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Standard,
    Premium,
}

impl ReadingType {
    pub const ALL: [ReadingType; 7] = [
        ReadingType::Tarot,
        ReadingType::Numerology,
        ReadingType::Horoscope,
        ReadingType::AngelNumbers,
        ReadingType::Astrology,
        ReadingType::Oracle,
        ReadingType::PastLife,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingType::Tarot => "tarot",
            ReadingType::Numerology => "numerology",
            ReadingType::Horoscope => "horoscope",
            ReadingType::AngelNumbers => "angel-numbers",
            ReadingType::Astrology => "astrology",
            ReadingType::Oracle => "oracle",
            ReadingType::PastLife => "past-life",
        }
    }

    /// Hard-coded tier table. Never changes for the lifetime of the process.
    pub fn tier(&self) -> Tier {
        match self {
            ReadingType::Tarot
            | ReadingType::Numerology
            | ReadingType::Horoscope
            | ReadingType::AngelNumbers => Tier::Standard,
            ReadingType::Astrology | ReadingType::Oracle | ReadingType::PastLife => Tier::Premium,
        }
    }

    pub fn is_premium(&self) -> bool {
        self.tier() == Tier::Premium
    }

    pub fn required_inputs(&self) -> &'static [&'static str] {
        match self {
            ReadingType::Tarot => &["question"],
            ReadingType::Numerology => &["fullName", "birthDate"],
            ReadingType::Horoscope => &["zodiacSign"],
            ReadingType::AngelNumbers => &["number"],
            ReadingType::Astrology => &["birthDate", "birthTime", "birthPlace"],
            ReadingType::Oracle => &["question"],
            ReadingType::PastLife => &["fullName", "birthDate"],
        }
    }

    fn system_prompt(&self) -> &'static str {
        match self {
            ReadingType::Tarot => {
                "You are an experienced tarot reader. Draw a three-card spread (past, present, future) \
                 for the seeker's question, name each card, and interpret it warmly and clearly."
            }
            ReadingType::Numerology => {
                "You are a numerologist. Compute the life path and expression numbers from the \
                 details given, show the arithmetic briefly, and explain what each number means."
            }
            ReadingType::Horoscope => {
                "You are an astrologer writing a daily horoscope. Cover love, work and wellbeing \
                 for the given sign in a hopeful, grounded tone."
            }
            ReadingType::AngelNumbers => {
                "You interpret angel numbers. Explain the spiritual meaning of the number given \
                 and the guidance it may carry for the seeker."
            }
            ReadingType::Astrology => {
                "You are a professional astrologer. Describe the sun, moon and rising signs for the \
                 birth details given and interpret the key placements of the natal chart."
            }
            ReadingType::Oracle => {
                "You are an oracle card reader. Draw a single oracle card for the seeker's question \
                 and give a reflective, in-depth message."
            }
            ReadingType::PastLife => {
                "You are a past-life reader. Tell an evocative story of a possible past life for the \
                 seeker and the lessons it carries into this one."
            }
        }
    }
}

impl fmt::Display for ReadingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownReadingType(pub String);

impl fmt::Display for UnknownReadingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown reading type '{}'", self.0)
    }
}

impl FromStr for ReadingType {
    type Err = UnknownReadingType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReadingType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownReadingType(s.to_string()))
    }
}

// Check required keys are present and nothing is oversized
pub fn validate_input(
    reading_type: ReadingType,
    input: &HashMap<String, String>,
) -> Result<(), String> {
    for key in reading_type.required_inputs() {
        match input.get(*key) {
            Some(value) if !value.trim().is_empty() => {}
            _ => return Err(format!("userInput.{key} is required for {reading_type} readings")),
        }
    }

    if let Some((key, _)) = input
        .iter()
        .find(|(_, value)| value.chars().count() > MAX_INPUT_LEN)
    {
        return Err(format!(
            "userInput.{key} exceeds {MAX_INPUT_LEN} characters"
        ));
    }

    Ok(())
}

/// What gets sent to the generation service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

pub fn build_prompt(reading_type: ReadingType, input: &HashMap<String, String>) -> Prompt {
    // sorted so identical input always renders the same prompt
    let ordered: BTreeMap<&str, &str> = input
        .iter()
        .map(|(k, v)| (k.as_str(), v.trim()))
        .collect();

    let mut user = format!("Please give me a {reading_type} reading.\n");
    for (key, value) in ordered {
        user.push_str(&format!("{key}: {value}\n"));
    }

    Prompt {
        system: reading_type.system_prompt().to_string(),
        user,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_round_trips_every_type() {
        for t in ReadingType::ALL {
            assert_eq!(t.as_str().parse::<ReadingType>(), Ok(t));
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = "crystal-ball".parse::<ReadingType>().unwrap_err();
        assert_eq!(err.to_string(), "unknown reading type 'crystal-ball'");
        assert!("Tarot".parse::<ReadingType>().is_err());
    }

    #[test]
    fn test_premium_set() {
        let premium: Vec<_> = ReadingType::ALL
            .into_iter()
            .filter(ReadingType::is_premium)
            .collect();
        assert_eq!(
            premium,
            vec![ReadingType::Astrology, ReadingType::Oracle, ReadingType::PastLife]
        );
        assert_eq!(ReadingType::Tarot.tier(), Tier::Standard);
    }

    #[test]
    fn test_validate_requires_keys() {
        let err = validate_input(ReadingType::Numerology, &input(&[("fullName", "Ada")]))
            .unwrap_err();
        assert!(err.contains("birthDate"));

        let blank = validate_input(ReadingType::Tarot, &input(&[("question", "   ")]));
        assert!(blank.is_err());

        assert!(validate_input(ReadingType::Tarot, &input(&[("question", "Will I travel?")])).is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_values() {
        let long = "x".repeat(MAX_INPUT_LEN + 1);
        let err = validate_input(
            ReadingType::Tarot,
            &input(&[("question", "ok"), ("notes", long.as_str())]),
        )
        .unwrap_err();
        assert!(err.contains("notes"));
    }

    #[test]
    fn test_prompt_is_deterministic() {
        let a = build_prompt(
            ReadingType::Numerology,
            &input(&[("fullName", " Ada Lovelace "), ("birthDate", "1815-12-10")]),
        );
        let b = build_prompt(
            ReadingType::Numerology,
            &input(&[("birthDate", "1815-12-10"), ("fullName", "Ada Lovelace")]),
        );
        assert_eq!(a, b);
        assert_eq!(
            a.user,
            "Please give me a numerology reading.\nbirthDate: 1815-12-10\nfullName: Ada Lovelace\n"
        );
        assert!(a.system.contains("numerologist"));
    }
}

//! User language names and the codes the helpers expect.
//!
//! Users pick a language by name ("Malayalam"). Translation wants an ISO
//! 639-1 code, speech recognition wants a BCP 47 locale.

/// Language used when the caller does not name one.
pub const DEFAULT_LANGUAGE: &str = "English";

/// Locale used when the language has no speech mapping.
pub const DEFAULT_SPEECH_LOCALE: &str = "en-US";

struct Language {
    name: &'static str,
    iso: &'static str,
    speech: &'static str,
}

const LANGUAGES: &[Language] = &[
    Language { name: "English", iso: "en", speech: "en-US" },
    Language { name: "Malayalam", iso: "ml", speech: "ml-IN" },
    Language { name: "Tamil", iso: "ta", speech: "ta-IN" },
    Language { name: "Hindi", iso: "hi", speech: "hi-IN" },
    Language { name: "Kannada", iso: "kn", speech: "kn-IN" },
    Language { name: "Telugu", iso: "te", speech: "te-IN" },
];

fn lookup(language: &str) -> Option<&'static Language> {
    let language = language.trim();
    LANGUAGES.iter().find(|l| {
        l.name.eq_ignore_ascii_case(language)
            || l.iso.eq_ignore_ascii_case(language)
            || l.speech.eq_ignore_ascii_case(language)
    })
}

/// ISO code for a language name or code. Unknown values pass through trimmed.
pub fn iso_code(language: &str) -> String {
    match lookup(language) {
        Some(l) => l.iso.to_string(),
        None => language.trim().to_string(),
    }
}

/// Speech-recognition locale for a language name or code.
///
/// Unknown or empty languages fall back to [`DEFAULT_SPEECH_LOCALE`].
pub fn speech_locale(language: &str) -> &'static str {
    lookup(language).map_or(DEFAULT_SPEECH_LOCALE, |l| l.speech)
}

/// Display name for matching requests, defaulting to English when blank.
pub fn display_name(language: Option<&str>) -> String {
    match language.map(str::trim).filter(|l| !l.is_empty()) {
        Some(language) => lookup(language).map_or_else(|| language.to_string(), |l| l.name.to_string()),
        None => DEFAULT_LANGUAGE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_map_to_iso_codes() {
        assert_eq!(iso_code("Malayalam"), "ml");
        assert_eq!(iso_code("tamil"), "ta");
        assert_eq!(iso_code("ml"), "ml");
        assert_eq!(iso_code(" Klingon "), "Klingon");
    }

    #[test]
    fn speech_locales_default_to_english() {
        assert_eq!(speech_locale("Malayalam"), "ml-IN");
        assert_eq!(speech_locale("hi"), "hi-IN");
        assert_eq!(speech_locale("Kannada"), "kn-IN");
        assert_eq!(speech_locale("ml-IN"), "ml-IN");
        assert_eq!(speech_locale("French"), "en-US");
        assert_eq!(speech_locale(""), "en-US");
    }

    #[test]
    fn display_name_defaults_to_english() {
        assert_eq!(display_name(None), "English");
        assert_eq!(display_name(Some("  ")), "English");
        assert_eq!(display_name(Some("te")), "Telugu");
        assert_eq!(display_name(Some("Marathi")), "Marathi");
    }
}

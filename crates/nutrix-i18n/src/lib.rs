//! Nutrix i18n
//!
//! Phrase-keyed localization: source phrases are written in the default
//! language and translated through per-language JSON files.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::Path;
use tracing::{error, info, warn};

/// Translation lookup for chat-facing strings.
///
/// Locale files live in a directory as `<lang>.json`, each a flat map from
/// source phrase to translation. A phrase with no translation (or a language
/// with no file) falls through unchanged, so the bot always has something to
/// say. Placeholders use the `%name%` form and are substituted after lookup,
/// untranslated phrases included.
pub struct Localizer {
    default_language: String,
    locales: HashMap<String, HashMap<String, String>>,
    placeholder: Regex,
}

impl Localizer {
    pub fn load(locale_dir: &Path, default_language: &str) -> Self {
        let mut locales = HashMap::new();

        if !locale_dir.exists() {
            error!("Locale directory not found: {}", locale_dir.display());
            return Self::with_locales(locales, default_language);
        }

        let entries = match std::fs::read_dir(locale_dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Failed to read locale directory {}: {}", locale_dir.display(), e);
                return Self::with_locales(locales, default_language);
            }
        };

        let mut loaded = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(language) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match read_locale_file(&path) {
                Ok(strings) => {
                    locales.insert(language.to_string(), strings);
                    loaded.push(language.to_string());
                }
                Err(e) => {
                    error!("Failed to load locale file {}: {}", path.display(), e);
                }
            }
        }

        if loaded.is_empty() {
            warn!("No localization files were loaded");
        } else {
            loaded.sort();
            info!("Loaded localization for languages: {}", loaded.join(", "));
        }

        Self::with_locales(locales, default_language)
    }

    pub fn with_locales(
        locales: HashMap<String, HashMap<String, String>>,
        default_language: &str,
    ) -> Self {
        Self {
            default_language: default_language.to_string(),
            locales,
            placeholder: Regex::new(r"%(\w+)%").unwrap(),
        }
    }

    /// Map a channel locale such as "en-US" to a loaded language code.
    /// Unknown languages resolve to the default.
    pub fn resolve_language(&self, locale: Option<&str>) -> String {
        if let Some(locale) = locale {
            let base = locale.split('-').next().unwrap_or(locale).to_lowercase();
            if self.locales.contains_key(&base) {
                return base;
            }
        }
        self.default_language.clone()
    }

    pub fn translate(&self, phrase: &str, locale: Option<&str>) -> String {
        self.translate_with(phrase, locale, &[])
    }

    pub fn translate_with(
        &self,
        phrase: &str,
        locale: Option<&str>,
        params: &[(&str, &str)],
    ) -> String {
        let language = self.resolve_language(locale);
        let text = self
            .locales
            .get(&language)
            .and_then(|strings| strings.get(phrase))
            .map(String::as_str)
            .unwrap_or(phrase);
        self.fill_placeholders(text, params)
    }

    fn fill_placeholders(&self, text: &str, params: &[(&str, &str)]) -> String {
        if params.is_empty() {
            return text.to_string();
        }
        self.placeholder
            .replace_all(text, |caps: &Captures| {
                let key = &caps[1];
                match params.iter().find(|(name, _)| *name == key) {
                    Some((_, value)) => (*value).to_string(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    pub fn available_languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self.locales.keys().cloned().collect();
        languages.sort();
        languages
    }

    pub fn default_language(&self) -> &str {
        &self.default_language
    }
}

fn read_locale_file(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)?;
    let strings: HashMap<String, String> = serde_json::from_str(&content)?;
    Ok(strings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_localizer() -> Localizer {
        let mut it = HashMap::new();
        it.insert("Welcome back, %name%!".to_string(), "Bentornato, %name%!".to_string());
        it.insert("Breakfast".to_string(), "Colazione".to_string());

        let mut locales = HashMap::new();
        locales.insert("it".to_string(), it);
        Localizer::with_locales(locales, "en")
    }

    #[test]
    fn translates_known_phrase_for_loaded_language() {
        let l10n = sample_localizer();
        assert_eq!(l10n.translate("Breakfast", Some("it")), "Colazione");
    }

    #[test]
    fn maps_regional_locale_to_base_language() {
        let l10n = sample_localizer();
        assert_eq!(l10n.resolve_language(Some("it-IT")), "it");
        assert_eq!(l10n.translate("Breakfast", Some("it-IT")), "Colazione");
    }

    #[test]
    fn unknown_language_falls_back_to_default() {
        let l10n = sample_localizer();
        assert_eq!(l10n.resolve_language(Some("fr")), "en");
        assert_eq!(l10n.translate("Breakfast", Some("fr")), "Breakfast");
    }

    #[test]
    fn missing_translation_passes_phrase_through() {
        let l10n = sample_localizer();
        assert_eq!(l10n.translate("Lunch", Some("it")), "Lunch");
    }

    #[test]
    fn placeholders_are_substituted() {
        let l10n = sample_localizer();
        let text = l10n.translate_with("Welcome back, %name%!", Some("it"), &[("name", "Anna")]);
        assert_eq!(text, "Bentornato, Anna!");
    }

    #[test]
    fn placeholders_also_run_on_untranslated_fallback() {
        let l10n = sample_localizer();
        let text = l10n.translate_with("Hello, %name%!", Some("fr"), &[("name", "Anna")]);
        assert_eq!(text, "Hello, Anna!");
    }

    #[test]
    fn unknown_placeholder_is_left_intact() {
        let l10n = sample_localizer();
        let text = l10n.translate_with("Hi %name%, id %id%", None, &[("name", "Anna")]);
        assert_eq!(text, "Hi Anna, id %id%");
    }

    #[test]
    fn load_from_missing_directory_yields_empty_localizer() {
        let l10n = Localizer::load(Path::new("/nonexistent/locales"), "en");
        assert!(l10n.available_languages().is_empty());
        assert_eq!(l10n.translate("Breakfast", Some("it")), "Breakfast");
    }

    #[test]
    fn load_reads_json_files_from_directory() {
        let dir = std::env::temp_dir().join(format!(
            "nutrix_locales_{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        ));
        std::fs::create_dir_all(&dir).expect("create locale dir");
        std::fs::write(dir.join("it.json"), r#"{"Breakfast": "Colazione"}"#).expect("write locale");
        std::fs::write(dir.join("notes.txt"), "ignored").expect("write extra file");

        let l10n = Localizer::load(&dir, "en");
        assert_eq!(l10n.available_languages(), vec!["it".to_string()]);
        assert_eq!(l10n.translate("Breakfast", Some("it")), "Colazione");

        let _ = std::fs::remove_dir_all(&dir);
    }
}

//! Class label parsing and the label vocabulary.
//!
//! Labels follow the Stanford Cars naming scheme:
//! `"<Make> <Model words...> <BodyType> <Year>"`, e.g. `"Tesla Model S Sedan 2012"`.

use anyhow::{bail, Context, Result};
use std::{fs, path::Path};

use crate::error::LabelError;

/// Tokens that end the model name. Anything from here on is body type or later.
pub const BODY_TYPES: [&str; 11] = [
    "sedan",
    "coupe",
    "suv",
    "convertible",
    "hatchback",
    "wagon",
    "minivan",
    "pickup",
    "van",
    "cab",
    "truck",
];

/// Normalized `(make, model)` key shared by the table and the parser.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MakeModel {
    pub make: String,
    pub model: String,
}

impl MakeModel {
    pub fn new(make: &str, model: &str) -> Self {
        Self {
            make: normalize(make),
            model: normalize(model),
        }
    }

    /// Title-cased `"Make Model"` for user-facing messages.
    pub fn display(&self) -> String {
        format!("{} {}", title_case(&self.make), title_case(&self.model))
    }
}

pub fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

fn is_stop_token(token: &str) -> bool {
    let lower = token.to_lowercase();
    if BODY_TYPES.contains(&lower.as_str()) {
        return true;
    }
    // a bare number is the model year
    !token.is_empty() && token.chars().all(char::is_numeric)
}

/// Split a class label into its normalized make and model.
///
/// The make is the first token. The model is every following token up to, but
/// not including, the first body-type word or all-digit token.
pub fn parse_label(label: &str) -> Result<MakeModel, LabelError> {
    let tokens: Vec<&str> = label.split_whitespace().collect();
    if tokens.len() < 2 {
        return Err(LabelError::TooFewTokens);
    }

    let model_tokens: Vec<&str> = tokens[1..]
        .iter()
        .copied()
        .take_while(|t| !is_stop_token(t))
        .collect();
    if model_tokens.is_empty() {
        return Err(LabelError::NoModelTokens);
    }

    Ok(MakeModel::new(tokens[0], &model_tokens.join(" ")))
}

/// Uppercase every letter that follows a non-letter, lowercase the rest.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

/// Ordered class names plus the optional per-class eligibility bit vector.
#[derive(Debug, Clone)]
pub struct LabelVocabulary {
    names: Vec<String>,
    flags: Option<Vec<bool>>,
}

impl LabelVocabulary {
    pub fn new(names: Vec<String>, flags: Option<Vec<bool>>) -> Result<Self> {
        if names.is_empty() {
            bail!("class name list is empty");
        }
        if let Some(f) = &flags {
            if f.len() != names.len() {
                bail!(
                    "eligibility map has {} entries but there are {} classes",
                    f.len(),
                    names.len()
                );
            }
        }
        Ok(Self { names, flags })
    }

    /// Load `class_names.json` and, when present, `eligibility_map.json`.
    pub fn load(class_names_path: &Path, eligibility_map_path: &Path) -> Result<Self> {
        let txt = fs::read_to_string(class_names_path)
            .with_context(|| format!("failed to read class names at {}", class_names_path.display()))?;
        let names: Vec<String> =
            serde_json::from_str(&txt).with_context(|| "failed to parse class_names.json")?;

        let flags = if eligibility_map_path.exists() {
            let txt = fs::read_to_string(eligibility_map_path).with_context(|| {
                format!("failed to read eligibility map at {}", eligibility_map_path.display())
            })?;
            let bits: Vec<u8> =
                serde_json::from_str(&txt).with_context(|| "failed to parse eligibility_map.json")?;
            Some(bits.into_iter().map(|b| b == 1).collect())
        } else {
            tracing::warn!(
                "{} not found; per-class eligibility will be derived from the dataset",
                eligibility_map_path.display()
            );
            None
        };

        Self::new(names, flags)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn flags(&self) -> Option<&[bool]> {
        self.flags.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multi_word_model() {
        let mm = parse_label("Tesla Model S Sedan 2012").unwrap();
        assert_eq!(mm.make, "tesla");
        assert_eq!(mm.model, "model s");
    }

    #[test]
    fn year_stops_model() {
        let mm = parse_label("BMW M3 2015").unwrap();
        assert_eq!((mm.make.as_str(), mm.model.as_str()), ("bmw", "m3"));
    }

    #[test]
    fn body_type_match_is_case_insensitive() {
        let mm = parse_label("Chevrolet Silverado 1500 Extended CAB 2012").unwrap();
        assert_eq!(mm.model, "silverado");

        let mm = parse_label("FORD F-150 Regular Cab 2012").unwrap();
        assert_eq!(mm.make, "ford");
        assert_eq!(mm.model, "f-150 regular");
    }

    #[test]
    fn trailing_tokens_after_stop_are_discarded() {
        let mm = parse_label("Honda Odyssey Minivan 2012 Extra Words").unwrap();
        assert_eq!(mm.model, "odyssey");
    }

    #[test]
    fn single_token_fails() {
        assert_eq!(parse_label("Toyota"), Err(LabelError::TooFewTokens));
        assert_eq!(parse_label("   "), Err(LabelError::TooFewTokens));
    }

    #[test]
    fn body_type_right_after_make_fails() {
        assert_eq!(parse_label("Audi Sedan"), Err(LabelError::NoModelTokens));
        assert_eq!(parse_label("Audi 2012 A4"), Err(LabelError::NoModelTokens));
    }

    #[test]
    fn non_ascii_digit_years_stop_model() {
        let mm = parse_label("Tesla Model S ２０１２").unwrap();
        assert_eq!(mm.model, "model s");

        let mm = parse_label("Kia Niro ٢٠١٩ Extra").unwrap();
        assert_eq!(mm.model, "niro");
    }

    #[test]
    fn alphanumeric_tokens_are_not_years() {
        let mm = parse_label("Audi S4 Sedan 2007").unwrap();
        assert_eq!(mm.model, "s4");
    }

    #[test]
    fn extra_whitespace_is_ignored() {
        let mm = parse_label("  Tesla   Model  S  Sedan 2012 ").unwrap();
        assert_eq!(mm.model, "model s");
    }

    #[test]
    fn title_case_matches_display_rules() {
        assert_eq!(title_case("model s"), "Model S");
        assert_eq!(title_case("cr-v"), "Cr-V");
        assert_eq!(title_case("m3"), "M3");
        assert_eq!(title_case("3series"), "3Series");
        assert_eq!(MakeModel::new(" TESLA ", "Model S").display(), "Tesla Model S");
    }

    #[test]
    fn vocabulary_rejects_mismatched_flags() {
        let names = vec!["A B Sedan 2012".to_string(), "C D Coupe 2010".to_string()];
        assert!(LabelVocabulary::new(names.clone(), Some(vec![true])).is_err());
        let v = LabelVocabulary::new(names, Some(vec![true, false])).unwrap();
        assert_eq!(v.flags(), Some(&[true, false][..]));
        assert_eq!(v.name(1), Some("C D Coupe 2010"));
        assert_eq!(v.name(2), None);
    }

    #[test]
    fn vocabulary_loads_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let names = dir.path().join("class_names.json");
        let map = dir.path().join("eligibility_map.json");
        fs::write(&names, r#"["Tesla Model S Sedan 2012", "BMW M3 Coupe 2012"]"#).unwrap();

        let v = LabelVocabulary::load(&names, &map).unwrap();
        assert_eq!(v.len(), 2);
        assert!(v.flags().is_none());

        fs::write(&map, "[1, 0]").unwrap();
        let v = LabelVocabulary::load(&names, &map).unwrap();
        assert_eq!(v.flags(), Some(&[true, false][..]));
    }
}

use crate::ocr::data::Language;

fn is_japanese(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{309F}'   // hiragana
        | '\u{30A0}'..='\u{30FF}' // katakana
        | '\u{4E00}'..='\u{9FFF}' // CJK unified ideographs
        | '\u{FF66}'..='\u{FF9F}' // half-width katakana
    )
}

/// Classify recognised text by the scripts it contains.
pub fn classify(text: &str) -> Language {
    let (mut japanese, mut latin) = (false, false);
    for c in text.chars() {
        if is_japanese(c) {
            japanese = true;
        } else if c.is_ascii_alphabetic() {
            latin = true;
        }
        if japanese && latin {
            return Language::Mixed;
        }
    }
    match (japanese, latin) {
        (true, false) => Language::Japanese,
        (false, true) => Language::English,
        _ => Language::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_are_detected() {
        assert_eq!(classify("EXIT 3"), Language::English);
        assert_eq!(classify("出口"), Language::Japanese);
        assert_eq!(classify("ホーム 3番線"), Language::Japanese);
        assert_eq!(classify("JR 東京"), Language::Mixed);
        assert_eq!(classify("12:30"), Language::Unknown);
        assert_eq!(classify(""), Language::Unknown);
    }
}

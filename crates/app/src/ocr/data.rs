use serde::Serialize;

/// Longest joined text an [`OcrResult`] carries, in bytes.
pub const MAX_TEXT_BYTES: usize = 255;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Language {
    Japanese,
    English,
    Mixed,
    #[default]
    Unknown,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Orientation {
    #[default]
    Horizontal,
    Vertical,
}

impl From<u8> for Orientation {
    fn from(raw: u8) -> Self {
        if raw == 1 {
            Orientation::Vertical
        } else {
            Orientation::Horizontal
        }
    }
}

/// Region of the preprocessed image that holds text.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TextBox {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub confidence: f32,
    pub orientation: Orientation,
}

/// Outcome of one frame through detection and recognition.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OcrResult {
    pub text: String,
    /// Mean confidence of accepted fragments, within [0, 1].
    pub confidence: f32,
    pub char_count: usize,
    pub word_count: usize,
    pub language: Language,
    pub boxes: Vec<TextBox>,
    pub frame_timestamp_ms: i64,
    pub processing_time_us: u64,
}

impl OcrResult {
    pub fn empty(frame_timestamp_ms: i64) -> Self {
        Self {
            frame_timestamp_ms,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Append `fragment` to `text` with a single separating space, never
/// exceeding [`MAX_TEXT_BYTES`]. Returns false once the text is full.
pub(crate) fn append_fragment(text: &mut String, fragment: &str) -> bool {
    let separator = usize::from(!text.is_empty());
    let room = MAX_TEXT_BYTES.saturating_sub(text.len() + separator);
    if room == 0 {
        return false;
    }
    let mut end = fragment.len().min(room);
    while !fragment.is_char_boundary(end) {
        end -= 1;
    }
    if end == 0 {
        return false;
    }
    if separator == 1 {
        text.push(' ');
    }
    text.push_str(&fragment[..end]);
    end == fragment.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_join_with_single_spaces() {
        let mut text = String::new();
        assert!(append_fragment(&mut text, "EXIT"));
        assert!(append_fragment(&mut text, "GATE 12"));
        assert_eq!(text, "EXIT GATE 12");
    }

    #[test]
    fn joined_text_never_exceeds_limit() {
        let mut text = String::new();
        let fragment = "漢字".repeat(20);
        while append_fragment(&mut text, &fragment) {}
        assert!(text.len() <= MAX_TEXT_BYTES);
        assert!(text.is_char_boundary(text.len()));
    }
}

//! Transcript normalization applied before prompt assembly.

/// Sound-event tags the model understands, mapped from their shorthand form.
const SOUND_EVENT_TAGS: &[(&str, &str)] = &[
    ("[laugh]", "<SE>[Laughter]</SE>"),
    ("[humming start]", "<SE_s>[Humming]</SE_s>"),
    ("[humming end]", "<SE_e>[Humming]</SE_e>"),
    ("[music start]", "<SE_s>[Music]</SE_s>"),
    ("[music end]", "<SE_e>[Music]</SE_e>"),
    ("[music]", "<SE>[Music]</SE>"),
    ("[sing start]", "<SE_s>[Singing]</SE_s>"),
    ("[sing end]", "<SE_e>[Singing]</SE_e>"),
    ("[applause]", "<SE>[Applause]</SE>"),
    ("[cheering]", "<SE>[Cheering]</SE>"),
    ("[cough]", "<SE>[Cough]</SE>"),
];

/// Endings that already close a sentence; anything else gets a period.
const SENTENCE_ENDINGS: &[&str] = &[".", "!", "?", ",", ";", "\"", "'", "</SE_e>", "</SE>"];

/// Normalize a transcript for generation: CJK punctuation to ASCII, unit
/// spell-outs, sound-event markup, whitespace cleanup, and a terminal period
/// when the text ends mid-sentence.
pub fn normalize_transcript(raw: &str) -> String {
    let mut text = map_cjk_punctuation(raw);

    text = text.replace('(', " ").replace(')', " ");
    text = text.replace("°F", " degrees Fahrenheit");
    text = text.replace("°C", " degrees Celsius");

    for (tag, replacement) in SOUND_EVENT_TAGS {
        text = text.replace(tag, replacement);
    }

    // Collapse intra-line whitespace, drop blank lines, keep line structure
    // (speaker markers are line-oriented).
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            lines.push(collapsed);
        }
    }
    let mut text = lines.join("\n");

    if !text.is_empty() && !SENTENCE_ENDINGS.iter().any(|end| text.ends_with(end)) {
        text.push('.');
    }

    text
}

fn map_cjk_punctuation(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '，' => out.push_str(", "),
            '。' => out.push_str("."),
            '！' => out.push_str("!"),
            '？' => out.push_str("?"),
            '；' => out.push_str("; "),
            '：' => out.push_str(": "),
            '、' => out.push_str(", "),
            '（' => out.push_str(" "),
            '）' => out.push_str(" "),
            '“' | '”' => out.push('"'),
            '‘' | '’' => out.push('\''),
            '《' => out.push('"'),
            '》' => out.push('"'),
            '—' => out.push('-'),
            '…' => out.push_str("..."),
            other => out.push(other),
        }
    }
    out
}

/// Extract `[SPEAKERn]` tags, deduplicated and sorted. A transcript with tags
/// is treated as multi-speaker dialogue by the prompt assembler.
pub fn extract_speaker_tags(text: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while let Some(start) = find_from(bytes, i, b'[') {
        let rest = &text[start..];
        if let Some(tag) = parse_speaker_tag(rest) {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        i = start + 1;
    }
    tags.sort();
    tags
}

/// Parse a leading `[SPEAKERn]` marker, returning the tag without brackets.
pub fn parse_speaker_tag(text: &str) -> Option<String> {
    let rest = text.strip_prefix('[')?;
    let rest = rest.strip_prefix("SPEAKER")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let after = &rest[digits.len()..];
    if !after.starts_with(']') {
        return None;
    }
    Some(format!("SPEAKER{digits}"))
}

fn find_from(bytes: &[u8], from: usize, needle: u8) -> Option<usize> {
    bytes[from.min(bytes.len())..]
        .iter()
        .position(|&b| b == needle)
        .map(|pos| from + pos)
}

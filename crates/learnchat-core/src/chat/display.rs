//! Display cleanup for user messages
//!
//! Feature pages wrap what the user typed in prompt scaffolding ("Please
//! create flashcards for the following text: ..."). Transcripts and history
//! lists show the user's own words instead.

use once_cell::sync::Lazy;
use regex::Regex;

/// Shown in place of a message that is nothing but instructions
pub const PROCESSING_PLACEHOLDER: &str = "Processing your request...";

static SCAFFOLDING: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Feature request prefixes
        r"(?i)^Please (help me |create |generate |write |organize |summarize |explain |analyze |review |check |debug |translate |convert |extract |format |structure |plan |outline |brainstorm )[^:]*:\s*",
        r"(?i)^(Create |Generate |Write |Organize |Summarize |Explain |Analyze |Review |Check |Debug |Translate |Convert |Extract |Format |Structure |Plan |Outline |Brainstorm )[^:]*:\s*",
        r"(?i)^(I need help with|Help me|Can you|Could you|Please)[^:]*:\s*",
        // Trailing formatting instructions
        r"(?i)\n\n(Return your response in markdown format|Format them exactly|Use proper formatting|Please format|Make sure to format|Ensure proper formatting)[^\n]*$",
        r"(?i)\n\n(Use markdown|Format as|Structure as|Present as|Display as)[^\n]*$",
        r"(?i)\n\n(Output format|Response format|Expected format)[^\n]*$",
        // System context remnants
        r"(?i)^You are [^.]*\.\s*",
        r"(?i)^As an? [^,]*, ",
        r"\n{3,}",
        r"(?i)^(Flashcards|Notes|Summary|Mind map|Explanation) for:?\s*",
        r"(?i)\n\n[A-Z][^.]*format[^.]*\.$",
        r"(?i)\n\n[A-Z][^.]*structure[^.]*\.$",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("Invalid regex"))
    .collect()
});

static INSTRUCTION_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(please|help|create|generate|write)").expect("Invalid regex"));

// Checked in order; the first capture longer than 10 characters wins.
static CONTENT_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?s):\s*(.+)$",
        r"(?s)\n\n(.+)$",
        r"(?s)following:\s*(.+)$",
        r"(?s)text:\s*(.+)$",
        r"(?s)content:\s*(.+)$",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("Invalid regex"))
    .collect()
});

/// Strip prompt scaffolding from a user message.
///
/// Returns [`PROCESSING_PLACEHOLDER`] when what remains is shorter than 10
/// characters or still reads like an instruction.
pub fn clean_message_for_display(message: &str) -> String {
    let mut cleaned = message.to_string();
    for pattern in SCAFFOLDING.iter() {
        cleaned = pattern.replace_all(&cleaned, "").into_owned();
    }

    let cleaned = cleaned.trim();
    if cleaned.chars().count() < 10 || INSTRUCTION_START.is_match(cleaned) {
        return PROCESSING_PLACEHOLDER.to_string();
    }
    cleaned.to_string()
}

/// The user's own text within a feature prompt
pub fn extract_user_content(message: &str) -> String {
    for marker in CONTENT_MARKERS.iter() {
        let Some(found) = marker.captures(message).and_then(|c| c.get(1)) else {
            continue;
        };
        let text = found.as_str().trim();
        if text.chars().count() > 10 {
            return text.to_string();
        }
    }
    clean_message_for_display(message)
}

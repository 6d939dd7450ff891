use crate::error::ReconcileError;
use mail_parser::MessageParser;
use once_cell::sync::Lazy;
use regex::Regex;

const RE_WHITESPACE_STR: &str = r"\s+";
const RE_BRACKETED_STR: &str = r"(?i)Report-ID:\s*[<{]\s*([^>}]+?)\s*[>}]";
const RE_UNBRACKETED_STR: &str = r"(?i)Report-ID:(\S+)";
const RE_LOOSE_STR: &str = r"(?i)Report-ID:?\s+(\S+)";
const RE_UUID_STR: &str =
    r"\b([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})\b";
const RE_UUID_TRUNCATED_STR: &str =
    r"\b([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{1,11})\b";

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(RE_WHITESPACE_STR).unwrap());
static RE_BRACKETED: Lazy<Regex> = Lazy::new(|| Regex::new(RE_BRACKETED_STR).unwrap());
static RE_UNBRACKETED: Lazy<Regex> = Lazy::new(|| Regex::new(RE_UNBRACKETED_STR).unwrap());
static RE_LOOSE: Lazy<Regex> = Lazy::new(|| Regex::new(RE_LOOSE_STR).unwrap());
static RE_UUID: Lazy<Regex> = Lazy::new(|| Regex::new(RE_UUID_STR).unwrap());
static RE_UUID_TRUNCATED: Lazy<Regex> = Lazy::new(|| Regex::new(RE_UUID_TRUNCATED_STR).unwrap());

const TRIM_CHARS: &[char] = &[
    '.', ',', ';', ':', '!', '?', '(', ')', '[', ']', '{', '}', '<', '>', '"', '\'',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionPattern {
    Bracketed,
    Unbracketed,
    Loose,
    Uuid,
}

impl ExtractionPattern {
    pub const LABELLED: [ExtractionPattern; 3] = [
        ExtractionPattern::Bracketed,
        ExtractionPattern::Unbracketed,
        ExtractionPattern::Loose,
    ];

    fn capture(&self, text: &str) -> Option<String> {
        match self {
            ExtractionPattern::Bracketed => first_group(&RE_BRACKETED, text),
            ExtractionPattern::Unbracketed => first_group(&RE_UNBRACKETED, text),
            ExtractionPattern::Loose => first_group(&RE_LOOSE, text),
            ExtractionPattern::Uuid => {
                first_group(&RE_UUID, text).or_else(|| first_group(&RE_UUID_TRUNCATED, text))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtractorOptions {
    /// Fall back to a UUID-shaped token when no `Report-ID` label is present.
    pub uuid_fallback: bool,
}

/// Parses report identifiers out of free-text subject lines.
#[derive(Debug, Clone)]
pub struct IdentifierExtractor {
    patterns: Vec<ExtractionPattern>,
}

impl IdentifierExtractor {
    pub fn new(options: ExtractorOptions) -> Self {
        let mut patterns = ExtractionPattern::LABELLED.to_vec();
        if options.uuid_fallback {
            patterns.push(ExtractionPattern::Uuid);
        }
        Self { patterns }
    }

    pub fn patterns(&self) -> &[ExtractionPattern] {
        &self.patterns
    }

    /// Returns the canonical identifier for `subject`, trying each pattern in
    /// order. A pattern whose capture cleans down to nothing does not count.
    pub fn extract(&self, subject: Option<&str>) -> Option<String> {
        let subject = subject?;
        if subject.trim().is_empty() {
            return None;
        }
        let collapsed = collapse_whitespace(subject);
        self.patterns
            .iter()
            .filter_map(|pattern| pattern.capture(&collapsed))
            .map(|raw| clean_identifier(&raw))
            .find(|id| !id.is_empty())
    }

    /// Like [`extract`](Self::extract), for callers that treat a missing
    /// identifier as a failure rather than a skip.
    pub fn require(&self, subject: Option<&str>) -> Result<String, ReconcileError> {
        self.extract(subject).ok_or_else(|| {
            ReconcileError::Extraction(format!(
                "no report id in subject {:?}",
                subject.unwrap_or_default()
            ))
        })
    }
}

impl Default for IdentifierExtractor {
    fn default() -> Self {
        Self::new(ExtractorOptions::default())
    }
}

/// Extracts with the default pattern set.
pub fn extract(subject: Option<&str>) -> Option<String> {
    IdentifierExtractor::default().extract(subject)
}

/// Drops an email-domain suffix and trims surrounding whitespace and punctuation.
pub fn clean_identifier(raw: &str) -> String {
    let local = raw.split('@').next().unwrap_or_default();
    local
        .trim_matches(|c: char| c.is_whitespace() || TRIM_CHARS.contains(&c))
        .to_string()
}

fn collapse_whitespace(text: &str) -> String {
    RE_WHITESPACE.replace_all(text, " ").trim().to_string()
}

fn first_group(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Reads the `Subject` header out of a stored message.
///
/// Encoded words are decoded by the MIME parser. When the body does not parse
/// as a message, the raw header block is scanned for a (possibly folded)
/// `Subject:` line instead.
pub fn subject_line(body: &[u8]) -> Option<String> {
    let parsed = MessageParser::default()
        .parse(body)
        .and_then(|message| message.subject().map(|s| s.to_string()));
    parsed
        .or_else(|| scan_subject_header(&String::from_utf8_lossy(body)))
        .filter(|s| !s.trim().is_empty())
}

fn scan_subject_header(text: &str) -> Option<String> {
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        if line.is_empty() {
            return None;
        }
        let Some(value) = line
            .get(..8)
            .filter(|label| label.eq_ignore_ascii_case("subject:"))
            .map(|_| &line[8..])
        else {
            continue;
        };
        let mut subject = value.trim().to_string();
        for continuation in lines.by_ref() {
            if !continuation.starts_with([' ', '\t']) {
                break;
            }
            subject.push(' ');
            subject.push_str(continuation.trim());
        }
        return Some(subject);
    }
    None
}

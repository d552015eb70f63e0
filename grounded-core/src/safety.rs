//! Prompt injection scanner.
//!
//! Flags questions that try to override instructions, exfiltrate the system
//! prompt or secrets, hijack the assistant's role, or smuggle chat-template
//! delimiters. Matching runs on normalized text so that case, extra
//! whitespace, punctuation, zero-width characters, accents and common
//! Cyrillic/Greek look-alikes do not hide a phrase.
//!
//! This is a pattern gate, not a classifier: novel phrasing may pass, ordinary
//! factual questions must not be flagged.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

use crate::config::SafetyConfig;
use crate::error::ConfigError;

/// Result of scanning one question.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub is_injection: bool,
    /// Ids of the patterns that matched, in table order.
    pub matched_patterns: Vec<String>,
}

impl SafetyVerdict {
    pub fn benign() -> Self {
        Self::default()
    }

    pub fn flagged(matched_patterns: Vec<String>) -> Self {
        Self {
            is_injection: !matched_patterns.is_empty(),
            matched_patterns,
        }
    }
}

/// Which normalized form a pattern runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Form {
    /// Folded and lowercased, punctuation kept.
    Folded,
    /// Folded with every non-alphanumeric run turned into one space.
    Words,
}

#[derive(Debug, Clone)]
struct Pattern {
    id: String,
    form: Form,
    regex: Regex,
}

const BUILTIN_PATTERNS: &[(&str, Form, &str)] = &[
    (
        "override.ignore_instructions",
        Form::Words,
        r"\b(?:ignore|disregard|forget|override|bypass|skip)\s+(?:all\s+)?(?:of\s+)?(?:the\s+|your\s+|any\s+|these\s+)?(?:previous|prior|above|earlier|preceding|foregoing|original|initial|system)\s+(?:instructions?|prompts?|rules|directions|directives|guidelines|messages?)\b",
    ),
    (
        "override.ignore_instructions",
        Form::Words,
        r"\b(?:ignore|disregard|forget|override|bypass)\s+(?:all\s+)?(?:of\s+)?your\s+(?:instructions|rules|guidelines|programming|guardrails|restrictions|safety\s+rules)\b",
    ),
    (
        "override.new_instructions",
        Form::Folded,
        r"\b(?:new|updated|revised|real)\s+instructions\s*:",
    ),
    (
        "exfil.system_prompt",
        Form::Words,
        r"\b(?:print|show|reveal|display|output|repeat|leak|dump|expose|disclose|recite|share|tell\s+me|give\s+me|write\s+out)\s+(?:me\s+)?(?:your|the)\s+(?:\w+\s+){0,2}?(?:system\s+prompt|initial\s+prompt|hidden\s+prompt|pre\s?prompt)\b",
    ),
    (
        "exfil.system_prompt",
        Form::Words,
        r"\b(?:print|show|reveal|display|output|repeat|leak|dump|expose|disclose|recite|share|tell\s+me|give\s+me)\s+(?:me\s+)?your\s+(?:(?:original|initial|hidden|secret|internal|system|full|exact|underlying)\s+(?:instructions|directives|programming)\b|system\s+message\b|(?:instructions|directives|programming)(?:$|\s+(?:verbatim|word\s+for\s+word|in\s+full)\b))",
    ),
    (
        "exfil.system_prompt",
        Form::Words,
        r"\bwhat\s+(?:is|are|were)\s+your\s+(?:(?:original|initial|hidden|secret|exact|internal|system)\s+(?:prompt|instructions)\b|system\s+message\b|instructions$)",
    ),
    (
        "exfil.secrets",
        Form::Words,
        r"\b(?:print|show|reveal|display|output|dump|leak|expose|list|send|share|disclose|tell\s+me|give\s+me|read\s+out)\s+(?:me\s+)?(?:all\s+)?(?:of\s+)?(?:your|the\s+(?:server|system|backend|internal|application|app|host)(?:\s+s)?)\s+(?:\w+\s+){0,2}?(?:api\s+keys?|secrets?|passwords?|credentials|access\s+tokens?|auth\s+tokens?|environment\s+variables|env\s+vars?|config(?:uration)?\s+files?|private\s+keys?|connection\s+strings?)\b",
    ),
    (
        "exfil.secrets",
        Form::Folded,
        r"(?:\bcat|\bprint|\bread|\bopen|\bdump)\s+(?:the\s+)?(?:\S*/)?(?:\.env\b|etc/passwd\b|etc/shadow\b|id_rsa\b|\.aws/credentials\b)",
    ),
    (
        "role.hijack",
        Form::Words,
        r"\b(?:you\s+are\s+now\s+(?:an?\s+|my\s+|the\s+)?(?:\w+\s+)?(?:assistant|ai|bot|model|dan|unrestricted|unfiltered|jailbroken|admin|administrator|developer|root)|from\s+now\s+on\s+you\s+(?:are|will)|pretend\s+(?:to\s+be|you\s+are|that\s+you\s+are)|act\s+as\s+(?:if\s+you\s+(?:are|were)\s+)?(?:an?\s+)?(?:unrestricted|unfiltered|jailbroken|evil|uncensored|dan)\b|your\s+new\s+role\s+is|(?:enter|enable|activate|switch\s+to)\s+(?:developer|god|dan|jailbreak|unrestricted)\s+mode|do\s+anything\s+now)\b",
    ),
    (
        "delimiter.role_markers",
        Form::Folded,
        r"<\|(?:system|assistant|user|im_start|im_end|endoftext)\|>|\[/?inst\]|<</?sys>>|</s>|###\s*(?:system|instruction)s?\s*:",
    ),
    (
        "delimiter.role_markers",
        Form::Folded,
        r"\b(?:system|assistant)\s*:.*\b(?:user|assistant|system)\s*:",
    ),
];

/// Separator-free phrases that survive letter-spacing like `i.g.n.o.r.e`.
const SQUASHED_NEEDLES: &[(&str, &str)] = &[
    ("override.ignore_instructions", "ignorepreviousinstructions"),
    ("override.ignore_instructions", "ignoreallpreviousinstructions"),
    ("override.ignore_instructions", "disregardpreviousinstructions"),
    ("override.ignore_instructions", "ignoreallinstructions"),
    ("override.ignore_instructions", "ignoreyourinstructions"),
    ("exfil.system_prompt", "printyoursystemprompt"),
    ("exfil.system_prompt", "revealyoursystemprompt"),
    ("exfil.system_prompt", "showyoursystemprompt"),
    ("exfil.system_prompt", "repeatyoursystemprompt"),
];

/// Pattern-based prompt injection scanner. Immutable once built.
#[derive(Debug, Clone)]
pub struct SafetyScanner {
    enabled: bool,
    patterns: Vec<Pattern>,
}

impl SafetyScanner {
    /// Compile built-in and configured patterns.
    pub fn new(config: &SafetyConfig) -> Result<Self, ConfigError> {
        let mut patterns = Vec::with_capacity(BUILTIN_PATTERNS.len() + config.extra_patterns.len());
        for (id, form, source) in BUILTIN_PATTERNS {
            patterns.push(Pattern {
                id: id.to_string(),
                form: *form,
                regex: compile(id, source)?,
            });
        }
        for extra in &config.extra_patterns {
            if extra.id.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    message: "safety.extra_patterns entries need a non-empty id".to_string(),
                });
            }
            patterns.push(Pattern {
                id: extra.id.clone(),
                form: Form::Words,
                regex: compile(&extra.id, &extra.regex)?,
            });
        }
        Ok(Self {
            enabled: config.enabled,
            patterns,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Classify a question. Logs pattern ids only, never the question.
    pub fn scan(&self, question: &str) -> SafetyVerdict {
        if !self.enabled || question.trim().is_empty() {
            return SafetyVerdict::benign();
        }

        let folded = fold(question);
        let words = to_words(&folded);
        let squashed: String = words.chars().filter(|c| !c.is_whitespace()).collect();

        let mut matched: Vec<String> = Vec::new();
        let mut record = |id: &str| {
            if !matched.iter().any(|m| m == id) {
                matched.push(id.to_string());
            }
        };

        for pattern in &self.patterns {
            let haystack = match pattern.form {
                Form::Folded => &folded,
                Form::Words => &words,
            };
            if pattern.regex.is_match(haystack) {
                record(&pattern.id);
            }
        }
        for (id, needle) in SQUASHED_NEEDLES {
            if squashed.contains(needle) {
                record(id);
            }
        }

        let verdict = SafetyVerdict::flagged(matched);
        if verdict.is_injection {
            warn!(
                patterns = ?verdict.matched_patterns,
                question_chars = question.chars().count(),
                "Prompt injection pattern matched"
            );
        }
        verdict
    }
}

fn compile(id: &str, source: &str) -> Result<Regex, ConfigError> {
    RegexBuilder::new(source)
        .case_insensitive(true)
        .build()
        .map_err(|e| ConfigError::InvalidPattern {
            id: id.to_string(),
            message: e.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Strip invisible characters, fold look-alikes and accents, lowercase and
/// collapse whitespace.
pub fn fold(text: &str) -> String {
    let visible: String = text
        .chars()
        .filter(|c| !is_zero_width(*c))
        .map(|c| homoglyph_to_ascii(c).unwrap_or(c))
        .collect();
    let decomposed: String = visible
        .nfkd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect();

    let mut result = String::with_capacity(decomposed.len());
    let mut prev_space = false;
    for c in decomposed.chars() {
        if c.is_whitespace() {
            if !prev_space {
                result.push(' ');
                prev_space = true;
            }
        } else {
            result.extend(c.to_lowercase());
            prev_space = false;
        }
    }
    result.trim().to_string()
}

/// Replace every run of non-alphanumerics with a single space.
fn to_words(folded: &str) -> String {
    let mut result = String::with_capacity(folded.len());
    let mut prev_space = true;
    for c in folded.chars() {
        if c.is_alphanumeric() {
            result.push(c);
            prev_space = false;
        } else if !prev_space {
            result.push(' ');
            prev_space = true;
        }
    }
    result.trim_end().to_string()
}

fn is_zero_width(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'
            | '\u{200C}'
            | '\u{200D}'
            | '\u{FEFF}'
            | '\u{2060}'..='\u{2064}'
            | '\u{200E}'
            | '\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2066}'..='\u{2069}'
            | '\u{00AD}'
    )
}

fn homoglyph_to_ascii(c: char) -> Option<char> {
    match c {
        // Cyrillic
        '\u{0430}' | '\u{0410}' => Some('a'),
        '\u{0441}' | '\u{0421}' => Some('c'),
        '\u{0435}' | '\u{0415}' => Some('e'),
        '\u{043E}' | '\u{041E}' => Some('o'),
        '\u{0440}' | '\u{0420}' => Some('p'),
        '\u{0443}' => Some('y'),
        '\u{0445}' | '\u{0425}' => Some('x'),
        '\u{0456}' | '\u{0406}' => Some('i'),
        '\u{0455}' | '\u{0405}' => Some('s'),
        '\u{0458}' | '\u{0408}' => Some('j'),
        '\u{041D}' => Some('h'),
        '\u{041C}' => Some('m'),
        '\u{0422}' => Some('t'),
        '\u{0412}' => Some('b'),
        '\u{041A}' => Some('k'),
        // Greek
        '\u{03B1}' | '\u{0391}' => Some('a'),
        '\u{0392}' => Some('b'),
        '\u{03B5}' | '\u{0395}' => Some('e'),
        '\u{0397}' => Some('h'),
        '\u{03B9}' | '\u{0399}' => Some('i'),
        '\u{039A}' => Some('k'),
        '\u{039C}' => Some('m'),
        '\u{039D}' => Some('n'),
        '\u{03BF}' | '\u{039F}' => Some('o'),
        '\u{03C1}' | '\u{03A1}' => Some('p'),
        '\u{03A4}' => Some('t'),
        '\u{03A5}' => Some('y'),
        '\u{03A7}' => Some('x'),
        '\u{0396}' => Some('z'),
        _ => None,
    }
}

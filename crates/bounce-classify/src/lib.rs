use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// The rules that ship with the classifier. Operators may merge
/// additional rules files on top of these.
pub const DEFAULT_RULES: &str = include_str!("../rules/default.toml");

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Ord, PartialOrd)]
#[serde(from = "String", into = "String")]
pub enum BounceClass {
    PreDefined(PreDefinedBounceClass),
    UserDefined(String),
}

impl From<String> for BounceClass {
    fn from(s: String) -> BounceClass {
        if let Ok(pre) = PreDefinedBounceClass::from_str(&s) {
            BounceClass::PreDefined(pre)
        } else {
            BounceClass::UserDefined(s)
        }
    }
}

impl From<BounceClass> for String {
    fn from(class: BounceClass) -> String {
        match class {
            BounceClass::PreDefined(pre) => pre.to_string(),
            BounceClass::UserDefined(s) => s,
        }
    }
}

impl Default for BounceClass {
    fn default() -> Self {
        PreDefinedBounceClass::Uncategorized.into()
    }
}

impl From<PreDefinedBounceClass> for BounceClass {
    fn from(c: PreDefinedBounceClass) -> BounceClass {
        BounceClass::PreDefined(c)
    }
}

impl BounceClass {
    /// Returns true if a permanent failure of this class means that
    /// the recipient address itself cannot receive mail.
    pub fn is_hard_bounce(&self) -> bool {
        matches!(
            self,
            BounceClass::PreDefined(
                PreDefinedBounceClass::InvalidRecipient
                    | PreDefinedBounceClass::InactiveMailbox
                    | PreDefinedBounceClass::RelayDenied
                    | PreDefinedBounceClass::RoutingErrors
                    | PreDefinedBounceClass::ProtocolErrors
            )
        )
    }

    /// Returns true if the text describes a condition that is expected
    /// to clear up by itself, regardless of the reply code.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            BounceClass::PreDefined(PreDefinedBounceClass::QuotaIssues)
        )
    }
}

/// Variant order is significant: when a reply matches rules from
/// more than one class, the earliest variant wins.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Copy,
    Clone,
    Ord,
    PartialOrd,
    strum::EnumString,
    strum::Display,
)]
pub enum PreDefinedBounceClass {
    /// The mailbox is full or the receiving system is out of storage
    QuotaIssues,
    /// The recipient is invalid
    InvalidRecipient,
    /// The recipient address is expired, inactive or disabled
    InactiveMailbox,
    /// The message was blocked by the receiver because relaying is not allowed.
    RelayDenied,
    /// Mail routing issues for the recipient domain
    RoutingErrors,
    /// SMTP protocol syntax or sequence errors
    ProtocolErrors,
    /// Nothing matched
    Uncategorized,
}

/// A reply from a remote SMTP server, reduced to the parts that
/// classification cares about.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct SmtpReply {
    pub code: u16,
    /// The text following the code. When the server supplied an
    /// enhanced status code it is the first token of the content.
    pub content: String,
}

impl SmtpReply {
    pub fn new<S: Into<String>>(code: u16, content: S) -> Self {
        Self {
            code,
            content: content.into(),
        }
    }

    /// Parse a single reply line as reported by an SMTP client error,
    /// either `"550 5.1.1 user unknown"` or a bare enhanced status
    /// code such as `"5.1.1 user unknown"`, in which case the code is
    /// derived from the enhanced code (`511`).
    /// Only the first line of a multi-line reply is considered.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.strip_prefix("short response: ").unwrap_or(line);
        let first = line.lines().next()?;
        let bytes = first.as_bytes();
        let is_digit = |idx: usize| bytes.get(idx).map_or(false, u8::is_ascii_digit);

        if bytes.len() >= 5
            && is_digit(0)
            && bytes[0] != b'0'
            && is_digit(1)
            && is_digit(2)
            && bytes[3] == b' '
        {
            let code = first[..3].parse().ok()?;
            return Some(Self::new(code, first[4..].trim()));
        }

        if bytes.len() >= 7
            && is_digit(0)
            && bytes[0] != b'0'
            && bytes[1] == b'.'
            && is_digit(2)
            && bytes[3] == b'.'
            && is_digit(4)
            && bytes[5] == b' '
        {
            let code = first[..5].replace('.', "").parse().ok()?;
            return Some(Self::new(code, first.trim()));
        }

        None
    }

    pub fn to_single_line(&self) -> String {
        format!("{} {}", self.code, self.content.replace(['\r', '\n'], " "))
    }

    pub fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }
}

/// Defines the content of bounce classifier rules files
#[derive(Deserialize, Serialize, Debug)]
pub struct BounceClassifierFile {
    pub rules: BTreeMap<BounceClass, Vec<String>>,
}

/// Holds state for compiling rules files into a classifier
#[derive(Default)]
pub struct BounceClassifierBuilder {
    rules: BTreeMap<BounceClass, Vec<String>>,
}

impl BounceClassifierBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder pre-loaded with [DEFAULT_RULES].
    pub fn with_default_rules() -> Result<Self, String> {
        let mut builder = Self::new();
        builder.merge_toml_str("<default rules>", DEFAULT_RULES)?;
        Ok(builder)
    }

    pub fn add_rule(&mut self, class: BounceClass, rule: String) {
        self.rules.entry(class).or_default().push(rule);
    }

    /// Rules for a class that is already present are appended
    /// after the existing rules for that class.
    pub fn merge(&mut self, decoded_file: BounceClassifierFile) {
        for (class, mut rules) in decoded_file.rules {
            self.rules.entry(class).or_default().append(&mut rules);
        }
    }

    pub fn merge_json_file(&mut self, file_name: &str) -> Result<(), String> {
        let mut f = std::fs::File::open(file_name)
            .map_err(|err| format!("reading file: {file_name}: {err:#}"))?;
        let decoded: BounceClassifierFile = serde_json::from_reader(&mut f)
            .map_err(|err| format!("decoding {file_name} as BounceClassifierFile: {err:#}"))?;
        self.merge(decoded);
        Ok(())
    }

    pub fn merge_toml_file(&mut self, file_name: &str) -> Result<(), String> {
        let data = std::fs::read_to_string(file_name)
            .map_err(|err| format!("reading file: {file_name}: {err:#}"))?;
        self.merge_toml_str(file_name, &data)
    }

    pub fn merge_toml_str(&mut self, label: &str, data: &str) -> Result<(), String> {
        let decoded: BounceClassifierFile = toml::from_str(data)
            .map_err(|err| format!("decoding {label} as BounceClassifierFile: {err:#}"))?;
        self.merge(decoded);
        Ok(())
    }

    pub fn build(self) -> Result<BounceClassifier, String> {
        let mut pattern_to_class = vec![];
        let mut patterns = vec![];
        for (class, mut rules) in self.rules {
            // Implicit reverse map from pattern index to class;
            // O(1) lookup from the RegexSet match index.
            for _ in 0..rules.len() {
                pattern_to_class.push(class.clone());
            }
            patterns.append(&mut rules);
        }

        pattern_to_class.shrink_to_fit();

        let set = RegexSetBuilder::new(patterns)
            .case_insensitive(true)
            .build()
            .map_err(|err| format!("compiling rules: {err:#}"))?;
        Ok(BounceClassifier {
            set,
            pattern_to_class,
        })
    }
}

pub struct BounceClassifier {
    set: RegexSet,
    pattern_to_class: Vec<BounceClass>,
}

impl std::fmt::Debug for BounceClassifier {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("BounceClassifier")
            .field("num_rules", &self.pattern_to_class.len())
            .finish()
    }
}

impl BounceClassifier {
    /// Build a classifier from the built-in rules only.
    pub fn builtin() -> Self {
        BounceClassifierBuilder::with_default_rules()
            .and_then(BounceClassifierBuilder::build)
            .expect("built-in bounce rules are valid")
    }

    pub fn classify_str(&self, s: &str) -> BounceClass {
        self.set
            .matches(s)
            .into_iter()
            .next()
            .and_then(|idx| self.pattern_to_class.get(idx))
            .cloned()
            .unwrap_or(BounceClass::PreDefined(
                PreDefinedBounceClass::Uncategorized,
            ))
    }

    pub fn classify_reply(&self, reply: &SmtpReply) -> BounceClass {
        self.classify_str(&reply.content)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builtin_rules() {
        let classifier = BounceClassifier::builtin();

        let corpus = &[
            ("5.1.1 user unknown", PreDefinedBounceClass::InvalidRecipient),
            (
                "5.1.1 <bob@example.com>: Recipient address rejected",
                PreDefinedBounceClass::InvalidRecipient,
            ),
            (
                "No such user here",
                PreDefinedBounceClass::InvalidRecipient,
            ),
            (
                "5.2.2 mailbox full",
                PreDefinedBounceClass::QuotaIssues,
            ),
            (
                "4.2.2 The email account that you tried to reach is over quota",
                PreDefinedBounceClass::QuotaIssues,
            ),
            (
                "5.2.1 user account is disabled",
                PreDefinedBounceClass::InactiveMailbox,
            ),
            (
                "5.7.1 Relaying denied",
                PreDefinedBounceClass::RelayDenied,
            ),
            (
                "5.4.4 unable to route",
                PreDefinedBounceClass::RoutingErrors,
            ),
            (
                "5.5.2 Syntax error, command unrecognized",
                PreDefinedBounceClass::ProtocolErrors,
            ),
            (
                "4.2.1 mailbox temporarily unavailable",
                PreDefinedBounceClass::Uncategorized,
            ),
            (
                "5.7.1 message rejected due to policy",
                PreDefinedBounceClass::Uncategorized,
            ),
        ];

        for &(input, output) in corpus {
            assert_eq!(
                classifier.classify_str(input),
                output.into(),
                "expected {input} -> {output:?}"
            );
        }
    }

    #[test]
    fn quota_takes_precedence_over_hard_rules() {
        let classifier = BounceClassifier::builtin();
        let class = classifier.classify_str("5.1.1 user over quota");
        assert!(class.is_temporary());
        assert!(!class.is_hard_bounce());
    }

    #[test]
    fn merged_rules_extend_existing_classes() {
        let mut builder = BounceClassifierBuilder::with_default_rules().unwrap();
        builder
            .merge_toml_str(
                "extra",
                r#"
[rules]
InvalidRecipient = ["mailbox is gone"]
Blocklisted = ["listed at spamhaus"]
"#,
            )
            .unwrap();
        let classifier = builder.build().unwrap();

        assert_eq!(
            classifier.classify_str("550 mailbox is gone"),
            PreDefinedBounceClass::InvalidRecipient.into()
        );
        // built-in rules for the same class are still present
        assert_eq!(
            classifier.classify_str("5.1.1 user unknown"),
            PreDefinedBounceClass::InvalidRecipient.into()
        );
        let user = classifier.classify_str("client host listed at Spamhaus");
        assert_eq!(user, BounceClass::UserDefined("Blocklisted".to_string()));
        assert!(!user.is_hard_bounce());
        assert!(!user.is_temporary());
    }

    #[test]
    fn parse_reply_lines() {
        assert_eq!(
            SmtpReply::parse("550 5.1.1 user unknown"),
            Some(SmtpReply::new(550, "5.1.1 user unknown"))
        );
        assert_eq!(
            SmtpReply::parse("short response: 421 4.7.0 try again later\r\nmore"),
            Some(SmtpReply::new(421, "4.7.0 try again later"))
        );
        assert_eq!(
            SmtpReply::parse("5.7.1 blocked"),
            Some(SmtpReply::new(571, "5.7.1 blocked"))
        );
        assert_eq!(SmtpReply::parse("connection reset by peer"), None);
        assert_eq!(SmtpReply::parse("050 nope"), None);

        let reply = SmtpReply::new(451, "4.3.0 temporary\r\nfailure");
        assert!(reply.is_transient());
        assert!(!reply.is_permanent());
        assert_eq!(reply.to_single_line(), "451 4.3.0 temporary  failure");
    }
}

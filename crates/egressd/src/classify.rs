//! Turns the outcome of a delivery attempt into a retry decision
//! and the deferral it implies for the destination and IP.
use crate::accounting::{EventType, StatType};
use crate::limits::DeferReason;
use crate::settings::MtaSettings;
use bounce_classify::{BounceClassifier, SmtpReply};

/// A failed delivery attempt as reported by the message sender
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The session could not be established or was lost.
    /// `next_mx` asks for the next exchange to be tried.
    #[error("{message}")]
    Connection { message: String, next_mx: bool },
    /// The server rejected the message. `during_connect` is set when
    /// the rejection came before the transaction started, which is
    /// about the sending IP rather than the recipient.
    #[error("{}", reply.to_single_line())]
    Reply {
        reply: SmtpReply,
        during_connect: bool,
    },
}

impl DeliveryError {
    /// Interprets the text of an SMTP client error. Text that does
    /// not start with a reply code is a connection level failure.
    pub fn from_text(text: &str, during_connect: bool) -> Self {
        match SmtpReply::parse(text) {
            Some(reply) => Self::Reply {
                reply,
                during_connect,
            },
            None => Self::Connection {
                message: text.to_string(),
                next_mx: during_connect,
            },
        }
    }

    pub fn next_mx(&self) -> bool {
        matches!(self, Self::Connection { next_mx: true, .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Delivered,
    /// Rejected for now; the key is deferred
    Deferred,
    /// Rejected with a reply the profile lists as transient; retried
    /// without deferring the key
    Transient,
    SoftBounce,
    HardBounce,
    /// Would have been retried but the message is too old
    RetryExpired,
    ConnectionError,
}

impl ResultKind {
    pub fn event_type(self) -> EventType {
        match self {
            Self::Delivered => EventType::Send,
            Self::Deferred => EventType::Defer,
            Self::Transient | Self::ConnectionError => EventType::Err,
            Self::SoftBounce | Self::RetryExpired => EventType::Soft,
            Self::HardBounce => EventType::Hard,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::SoftBounce | Self::HardBounce | Self::RetryExpired
        )
    }
}

/// The verdict on one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnResult {
    pub kind: ResultKind,
    /// The deferral to apply to the key, if any
    pub defer: Option<DeferReason>,
    pub message: String,
    /// Whether the deferral is worth an info level log line
    pub log_defer: bool,
    pub retry: bool,
    pub next_mx: bool,
    pub stat: Option<StatType>,
}

impl ConnResult {
    pub fn delivered() -> Self {
        Self {
            kind: ResultKind::Delivered,
            defer: None,
            message: String::new(),
            log_defer: false,
            retry: false,
            next_mx: false,
            stat: Some(StatType::Send),
        }
    }

    /// A connection failure that happened before any server could
    /// be reached, such as a transient resolution error.
    pub fn connection_error(message: &str, next_mx: bool) -> Self {
        Self {
            kind: ResultKind::ConnectionError,
            defer: Some(DeferReason::ConnectionError),
            message: message.to_string(),
            log_defer: false,
            retry: true,
            next_mx,
            stat: Some(StatType::Err),
        }
    }
}

/// Classifies a failed attempt.
///
/// `within_window` is false once the message has been retried for
/// longer than the profile allows; anything that would be retried
/// then becomes a final soft bounce.
pub fn classify_failure(
    classifier: &BounceClassifier,
    settings: &MtaSettings,
    error: &DeliveryError,
    within_window: bool,
) -> ConnResult {
    let mut result = match error {
        DeliveryError::Connection { message, next_mx } => {
            ConnResult::connection_error(message, *next_mx)
        }
        DeliveryError::Reply {
            reply,
            during_connect,
        } => classify_reply(classifier, settings, reply, *during_connect),
    };

    if result.retry && !within_window {
        result.kind = ResultKind::RetryExpired;
        result.retry = false;
        result.next_mx = false;
        result.stat = Some(StatType::Soft);
    }
    result
}

fn classify_reply(
    classifier: &BounceClassifier,
    settings: &MtaSettings,
    reply: &SmtpReply,
    during_connect: bool,
) -> ConnResult {
    let message = reply.to_single_line();
    let lowered = message.to_lowercase();

    if settings.is_transient_text(&lowered) {
        return ConnResult {
            kind: ResultKind::Transient,
            defer: None,
            message,
            log_defer: false,
            retry: true,
            next_mx: false,
            stat: Some(StatType::Err),
        };
    }

    let class = classifier.classify_reply(reply);
    let mut retry = during_connect || reply.is_transient() || class.is_temporary();
    let defer = match settings.matching_bucket(&lowered) {
        Some(bucket) => {
            retry = true;
            Some(DeferReason::Matched(bucket.to_string()))
        }
        None if retry => Some(DeferReason::Default),
        None => None,
    };

    if retry {
        return ConnResult {
            kind: ResultKind::Deferred,
            defer,
            message,
            log_defer: true,
            retry: true,
            next_mx: false,
            stat: None,
        };
    }

    let (kind, stat) = if reply.is_permanent() && class.is_hard_bounce() {
        (ResultKind::HardBounce, StatType::Hard)
    } else {
        (ResultKind::SoftBounce, StatType::Soft)
    };
    ConnResult {
        kind,
        defer: None,
        message,
        log_defer: false,
        retry: false,
        next_mx: false,
        stat: Some(stat),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use maplit::btreemap;

    fn classify(settings: &MtaSettings, text: &str) -> ConnResult {
        let classifier = BounceClassifier::builtin();
        classify_failure(
            &classifier,
            settings,
            &DeliveryError::from_text(text, false),
            true,
        )
    }

    #[test]
    fn temporary_code_wins_over_mailbox_wording() {
        let result = classify(
            &MtaSettings::default(),
            "450 4.2.1 mailbox temporarily unavailable",
        );
        assert_eq!(result.kind, ResultKind::Deferred);
        assert!(result.retry);
        assert_eq!(result.defer, Some(DeferReason::Default));
        assert_eq!(result.stat, None);
    }

    #[test]
    fn unknown_user_is_hard() {
        let result = classify(&MtaSettings::default(), "550 5.1.1 user unknown");
        assert_eq!(result.kind, ResultKind::HardBounce);
        assert!(!result.retry);
        assert_eq!(result.defer, None);
        assert_eq!(result.stat, Some(StatType::Hard));
        assert_eq!(result.kind.event_type(), EventType::Hard);
    }

    #[test]
    fn policy_rejection_is_soft() {
        let result = classify(
            &MtaSettings::default(),
            "554 5.7.1 message rejected due to content policy",
        );
        assert_eq!(result.kind, ResultKind::SoftBounce);
        assert_eq!(result.stat, Some(StatType::Soft));
    }

    #[test]
    fn quota_text_retries_despite_permanent_code() {
        let result = classify(&MtaSettings::default(), "552 5.2.2 mailbox full");
        assert_eq!(result.kind, ResultKind::Deferred);
        assert!(result.retry);
    }

    #[test]
    fn buckets_and_transient_text() {
        let settings = MtaSettings {
            customwaitsecs: btreemap! {
                "too many connections".to_string() => vec![300],
            },
            transient: btreemap! {
                "try again in a moment".to_string() => true,
            },
            ..Default::default()
        };

        let result = classify(&settings, "554 5.7.0 Too many connections from your IP");
        assert_eq!(result.kind, ResultKind::Deferred);
        assert_eq!(
            result.defer,
            Some(DeferReason::Matched("too many connections".to_string()))
        );

        let result = classify(&settings, "451 Please try again in a moment");
        assert_eq!(result.kind, ResultKind::Transient);
        assert_eq!(result.defer, None);
        assert!(result.retry);
    }

    #[test]
    fn connection_errors() {
        let classifier = BounceClassifier::builtin();
        let error = DeliveryError::from_text("dial tcp 192.0.2.1:25: i/o timeout", true);
        assert!(error.next_mx());
        let result = classify_failure(&classifier, &MtaSettings::default(), &error, true);
        assert_eq!(result.kind, ResultKind::ConnectionError);
        assert_eq!(result.defer, Some(DeferReason::ConnectionError));
        assert!(!result.log_defer);
        assert!(result.next_mx);
        assert_eq!(result.stat, Some(StatType::Err));
    }

    #[test]
    fn rejected_greeting_is_retried() {
        let classifier = BounceClassifier::builtin();
        let error = DeliveryError::from_text("554 5.7.1 your IP is listed", true);
        let result = classify_failure(&classifier, &MtaSettings::default(), &error, true);
        assert_eq!(result.kind, ResultKind::Deferred);
    }

    #[test]
    fn expired_retry_becomes_soft_bounce() {
        let classifier = BounceClassifier::builtin();
        let error = DeliveryError::from_text("421 4.7.0 try later", false);
        let result = classify_failure(&classifier, &MtaSettings::default(), &error, false);
        assert_eq!(result.kind, ResultKind::RetryExpired);
        assert!(!result.retry);
        assert_eq!(result.stat, Some(StatType::Soft));
        // the key is still deferred
        assert_eq!(result.defer, Some(DeferReason::Default));
        assert!(result.kind.is_terminal());
    }
}

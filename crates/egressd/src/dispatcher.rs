//! Drives the delivery of a single recipient: obtain a connection,
//! hand it to the [`MessageSender`], classify what happened and
//! report it back, until the recipient reaches a final outcome.
use crate::accounting::{filter_message, Accounting, Event, EventType};
use crate::classify::{classify_failure, ConnResult, DeliveryError, ResultKind};
use crate::keys::destination_of;
use crate::limits::DeferReason;
use crate::pool::SenderConn;
use crate::sender::{GetConnError, Grant, Lease, Recipient, Sender};
use crate::settings::MtaSettings;
use async_trait::async_trait;
use bounce_classify::BounceClassifier;
use std::sync::Arc;

const RETRY_EXPIRED: &str = "Retry time expired";

/// Performs the SMTP transaction over a pooled connection. An
/// implementation establishes `conn.session` when it is not open
/// and may clear it when the session is no longer usable.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(
        &self,
        conn: &mut SenderConn,
        recipient: &dyn Recipient,
        settings: &MtaSettings,
    ) -> Result<(), DeliveryError>;
}

/// How delivery of a recipient ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    SoftBounce,
    HardBounce,
    RetryExpired,
    Canceled,
    Discarded,
}

pub struct Dispatcher {
    sender: Arc<Sender>,
    classifier: Arc<BounceClassifier>,
    accounting: Arc<Accounting>,
    message_sender: Arc<dyn MessageSender>,
}

impl Dispatcher {
    pub fn new(
        sender: Arc<Sender>,
        classifier: Arc<BounceClassifier>,
        accounting: Arc<Accounting>,
        message_sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            sender,
            classifier,
            accounting,
            message_sender,
        }
    }

    /// Delivers `recipient` through `profile`. Every outcome other
    /// than an unknown profile has produced exactly one final event
    /// by the time this returns.
    pub async fn deliver(
        &self,
        profile: &str,
        recipient: &dyn Recipient,
    ) -> Result<Outcome, GetConnError> {
        let mut mx_index = 0;

        loop {
            let grant = match self.sender.get_conn(profile, recipient, mx_index).await {
                Ok(grant) => grant,
                Err(GetConnError::Canceled) => {
                    return Ok(self.finish(profile, recipient, Outcome::Canceled))
                }
                Err(GetConnError::Discarded) => {
                    return Ok(self.finish(profile, recipient, Outcome::Discarded))
                }
                Err(GetConnError::Resolution {
                    permanent: true, ..
                }) => {
                    // the bounce was recorded when resolution failed
                    return Ok(Outcome::SoftBounce);
                }
                Err(GetConnError::Resolution {
                    message,
                    permanent: false,
                    lease,
                }) => {
                    let Some(settings) = self.sender.settings(profile) else {
                        return Err(GetConnError::UnknownProfile(profile.to_string()));
                    };
                    let mut result = ConnResult::connection_error(&message, false);
                    let expired = !self.within_window(recipient, &settings);
                    if expired {
                        result.kind = ResultKind::RetryExpired;
                        result.retry = false;
                    }
                    self.sender
                        .process_result(&lease, None, &result, recipient.is_test());
                    if expired {
                        self.emit_expired(profile, recipient, &lease.key.ip);
                        return Ok(Outcome::RetryExpired);
                    }
                    if recipient.is_canceled() {
                        return Ok(self.finish(profile, recipient, Outcome::Canceled));
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };

            let (result, lease) = self.attempt(profile, recipient, grant).await;

            let outcome = match result.kind {
                ResultKind::Delivered => Some(Outcome::Delivered),
                ResultKind::SoftBounce => Some(Outcome::SoftBounce),
                ResultKind::HardBounce => Some(Outcome::HardBounce),
                ResultKind::RetryExpired => Some(Outcome::RetryExpired),
                ResultKind::Deferred | ResultKind::Transient | ResultKind::ConnectionError => {
                    None
                }
            };
            if let Some(outcome) = outcome {
                tracing::debug!(
                    ip = %lease.key.ip,
                    "{} to {}: {outcome:?}",
                    recipient.campaign_id(),
                    recipient.email()
                );
                return Ok(outcome);
            }

            if recipient.is_canceled() {
                return Ok(self.finish(profile, recipient, Outcome::Canceled));
            }
            if result.next_mx {
                mx_index += 1;
            }
        }
    }

    /// One send over a granted connection, reported back to the
    /// sender before returning.
    async fn attempt(
        &self,
        profile: &str,
        recipient: &dyn Recipient,
        grant: Grant,
    ) -> (ConnResult, Lease) {
        let Grant {
            lease,
            mut conn,
            settings,
        } = grant;

        if conn.needs_reset(settings.sendsperconn) {
            tracing::trace!(
                "connection {} to {} reached {} messages, reconnecting",
                conn.id,
                conn.mx_host,
                conn.attempts
            );
            conn.reset().await;
        }
        if !conn.is_open() {
            conn.attempts = 0;
        }
        conn.attempts += 1;

        let sent = self
            .message_sender
            .send(&mut conn, recipient, &settings)
            .await;
        let result = match &sent {
            Ok(()) => ConnResult::delivered(),
            Err(err) => {
                let within_window = self.within_window(recipient, &settings);
                classify_failure(&self.classifier, &settings, err, within_window)
            }
        };

        if !recipient.is_test() {
            self.emit_result(profile, recipient, &conn, &result);
        }
        self.sender
            .process_result(&lease, Some(conn), &result, recipient.is_test());
        (result, lease)
    }

    fn within_window(&self, recipient: &dyn Recipient, settings: &MtaSettings) -> bool {
        self.sender.now() - recipient.first_attempt() <= settings.retry_window()
    }

    fn emit_result(
        &self,
        profile: &str,
        recipient: &dyn Recipient,
        conn: &SenderConn,
        result: &ConnResult,
    ) {
        let email = recipient.email();
        let message = filter_message(&result.message, email, &conn.ip, &conn.mx_host);
        let (kind, with_email) = match result.kind {
            ResultKind::SoftBounce | ResultKind::HardBounce => (result.kind.event_type(), true),
            // the attempt itself, followed by the final bounce
            ResultKind::RetryExpired => match result.defer {
                Some(DeferReason::ConnectionError) | None => (EventType::Err, false),
                Some(_) => (EventType::Defer, false),
            },
            kind => (kind.event_type(), false),
        };

        self.accounting.emit(Event {
            email: if with_email {
                email.to_string()
            } else {
                String::new()
            },
            campaign_id: recipient.campaign_id().to_string(),
            profile: profile.to_string(),
            ip: conn.ip.clone(),
            domain: destination_of(email).to_ascii_lowercase(),
            message: if result.kind == ResultKind::Delivered {
                String::new()
            } else {
                message
            },
            ..Event::new(kind)
        });

        if result.kind == ResultKind::RetryExpired {
            self.emit_expired(profile, recipient, &conn.ip);
        }
    }

    fn emit_expired(&self, profile: &str, recipient: &dyn Recipient, ip: &str) {
        if recipient.is_test() {
            return;
        }
        self.accounting.emit(Event {
            email: recipient.email().to_string(),
            campaign_id: recipient.campaign_id().to_string(),
            profile: profile.to_string(),
            ip: ip.to_string(),
            domain: destination_of(recipient.email()).to_ascii_lowercase(),
            message: RETRY_EXPIRED.to_string(),
            ..Event::new(EventType::Soft)
        });
    }

    /// Records an outcome that was decided without an attempt
    fn finish(&self, profile: &str, recipient: &dyn Recipient, outcome: Outcome) -> Outcome {
        let kind = match outcome {
            Outcome::Canceled => EventType::Canceled,
            Outcome::Discarded => EventType::Discarded,
            _ => return outcome,
        };
        tracing::debug!(
            "{} to {}: {outcome:?}",
            recipient.campaign_id(),
            recipient.email()
        );
        if !recipient.is_test() {
            self.accounting.emit(Event {
                email: recipient.email().to_string(),
                campaign_id: recipient.campaign_id().to_string(),
                profile: profile.to_string(),
                domain: destination_of(recipient.email()).to_ascii_lowercase(),
                ..Event::new(kind)
            });
        }
        outcome
    }
}

//! Verifying side of the check-in protocol.
//!
//! Staff scan a payload, the token is checked for shape, freshness and
//! signature, the visit store is asked whether the signature was already
//! consumed, and the customer row is loaded for confirmation. Confirming
//! records the visit and bumps the customer's counters.
//!
//! The "already used" lookup is advisory. Two devices scanning the same
//! code at once can both pass it, so the store's uniqueness constraint on
//! the signature column is what actually guarantees one visit per token.

use super::display::Clock;
use super::token::{QrProtocol, QrToken, TokenRejection};
use crate::backend::{PointsUpdate, User, VisitStore, VisitStoreError};
use crate::error::{ClassifiedError, ErrorKind};
use crate::loyalty;
use std::sync::Arc;

/// Why a scan was turned away. None of these end the scanning session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanRejection {
    #[error("Invalid QR code format")]
    Malformed(String),
    #[error("QR code has expired")]
    Expired,
    #[error("QR code signature is invalid")]
    InvalidSignature,
    #[error("QR code has already been used")]
    AlreadyUsed,
    #[error("Customer not found")]
    SubjectNotFound,
    #[error("{}", .0.user_message())]
    Unavailable(ClassifiedError),
}

impl From<TokenRejection> for ScanRejection {
    fn from(rejection: TokenRejection) -> Self {
        match rejection {
            TokenRejection::Expired { .. } => Self::Expired,
            TokenRejection::InvalidSignature => Self::InvalidSignature,
        }
    }
}

/// A scan that passed every check and awaits staff confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanAccepted {
    pub token: QrToken,
    pub customer: User,
}

/// Outcome of a confirmed check-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckInReceipt {
    pub customer_id: String,
    pub full_name: String,
    pub points: PointsUpdate,
    /// The new balance completes a loyalty card.
    pub reward_ready: bool,
}

/// Staff-side scanner bound to a visit store.
pub struct CheckIn {
    store: Arc<dyn VisitStore>,
    protocol: Arc<QrProtocol>,
    clock: Arc<dyn Clock>,
}

impl CheckIn {
    pub fn new(
        store: Arc<dyn VisitStore>,
        protocol: Arc<QrProtocol>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            protocol,
            clock,
        }
    }

    /// Decode a raw scan payload.
    pub fn parse_payload(payload: &str) -> Result<QrToken, ScanRejection> {
        let token: QrToken = serde_json::from_str(payload.trim())
            .map_err(|e| ScanRejection::Malformed(e.to_string()))?;

        if token.subject_id.trim().is_empty() {
            return Err(ScanRejection::Malformed("empty subject".into()));
        }
        if token.signature.is_empty() {
            return Err(ScanRejection::Malformed("empty signature".into()));
        }
        Ok(token)
    }

    /// Validate a payload and load the customer it names.
    pub async fn scan(&self, payload: &str) -> Result<ScanAccepted, ScanRejection> {
        let token = match Self::parse_payload(payload) {
            Ok(token) => token,
            Err(rejection) => {
                tracing::info!("Scan rejected: malformed payload");
                return Err(rejection);
            }
        };

        let now_ms = self.clock.now_ms();
        if let Err(rejection) = self.protocol.check_token(&token, now_ms) {
            tracing::info!(
                subject_id = %token.subject_id,
                reason = %rejection,
                "Scan rejected"
            );
            return Err(rejection.into());
        }

        let used = self
            .store
            .is_signature_used(&token.signature)
            .await
            .map_err(ScanRejection::Unavailable)?;
        if used {
            tracing::info!(subject_id = %token.subject_id, "Scan rejected: signature already used");
            return Err(ScanRejection::AlreadyUsed);
        }

        let customer = match self.store.get_customer(&token.subject_id).await {
            Ok(customer) => customer,
            Err(e) if e.kind == ErrorKind::NotFound => {
                tracing::info!(subject_id = %token.subject_id, "Scan rejected: unknown customer");
                return Err(ScanRejection::SubjectNotFound);
            }
            Err(e) => return Err(ScanRejection::Unavailable(e)),
        };

        tracing::info!(subject_id = %token.subject_id, "QR code scanned successfully");
        Ok(ScanAccepted { token, customer })
    }

    /// Record the visit and add a point.
    ///
    /// Freshness is not re-checked here: the window bounds how long the
    /// code is shown, not how long staff take to confirm.
    pub async fn confirm(
        &self,
        accepted: &ScanAccepted,
        staff_id: &str,
    ) -> Result<CheckInReceipt, ScanRejection> {
        let subject_id = &accepted.token.subject_id;

        match self
            .store
            .record_visit(subject_id, staff_id, &accepted.token.signature)
            .await
        {
            Ok(()) => {}
            Err(VisitStoreError::DuplicateSignature) => {
                tracing::warn!(subject_id = %subject_id, "Concurrent check-in lost the race");
                return Err(ScanRejection::AlreadyUsed);
            }
            Err(VisitStoreError::Backend(e)) => return Err(ScanRejection::Unavailable(e)),
        }

        let points = match self.store.increment_points(subject_id).await {
            Ok(points) => points,
            Err(e) => {
                tracing::error!(
                    subject_id = %subject_id,
                    error = %e,
                    "Visit recorded but point increment failed"
                );
                return Err(ScanRejection::Unavailable(e));
            }
        };

        tracing::info!(
            subject_id = %subject_id,
            staff_id = %staff_id,
            points = points.current_points,
            "Visit recorded"
        );

        Ok(CheckInReceipt {
            customer_id: subject_id.clone(),
            full_name: accepted.customer.full_name.clone(),
            points,
            reward_ready: loyalty::reward_ready(points.current_points),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{customer, FakeBackend, FixedClock};

    fn checkin(store: &Arc<FakeBackend>, now_ms: i64) -> CheckIn {
        CheckIn::new(
            Arc::clone(store) as Arc<dyn VisitStore>,
            Arc::new(QrProtocol::default()),
            Arc::new(FixedClock(now_ms)),
        )
    }

    fn payload(subject: &str, issued_at_ms: i64) -> String {
        QrProtocol::default().generate(subject, issued_at_ms).to_payload()
    }

    #[tokio::test]
    async fn fresh_token_is_accepted_then_confirmed() {
        let store = Arc::new(FakeBackend::new());
        store.insert_user(customer("u1", 4));
        let scanner = checkin(&store, 1_000 + 59_000);

        let accepted = scanner.scan(&payload("u1", 1_000)).await.unwrap();
        assert_eq!(accepted.customer.id, "u1");

        let receipt = scanner.confirm(&accepted, "staff-1").await.unwrap();
        assert_eq!(receipt.points.current_points, 5);
        assert_eq!(receipt.points.total_visits, 1);
        assert!(receipt.reward_ready);
        assert_eq!(store.visit_count(), 1);
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let store = Arc::new(FakeBackend::new());
        store.insert_user(customer("u1", 0));
        let scanner = checkin(&store, 1_000 + 61_000);

        let err = scanner.scan(&payload("u1", 1_000)).await.unwrap_err();
        assert_eq!(err, ScanRejection::Expired);
        assert_eq!(err.to_string(), "QR code has expired");
    }

    #[tokio::test]
    async fn malformed_payloads_are_rejected() {
        let store = Arc::new(FakeBackend::new());
        let scanner = checkin(&store, 0);

        for bad in [
            "",
            "not json",
            "{\"subjectId\":\"u1\"}",
            "{\"subjectId\":\"\",\"issuedAtMs\":0,\"signature\":\"x\"}",
            "{\"subjectId\":\"u1\",\"issuedAtMs\":0,\"signature\":\"\"}",
        ] {
            let err = scanner.scan(bad).await.unwrap_err();
            assert!(matches!(err, ScanRejection::Malformed(_)), "{bad:?} -> {err:?}");
        }
    }

    #[tokio::test]
    async fn forged_signature_is_rejected() {
        let store = Arc::new(FakeBackend::new());
        store.insert_user(customer("u1", 0));
        let scanner = checkin(&store, 1_000);

        let forged = r#"{"subjectId":"u1","issuedAtMs":1000,"signature":"AAAAAAAAAAAA"}"#;
        assert_eq!(
            scanner.scan(forged).await.unwrap_err(),
            ScanRejection::InvalidSignature
        );
    }

    #[tokio::test]
    async fn used_signature_is_rejected_and_scanner_stays_usable() {
        let store = Arc::new(FakeBackend::new());
        store.insert_user(customer("u1", 0));
        store.insert_user(customer("u2", 0));
        let scanner = checkin(&store, 1_000);

        let accepted = scanner.scan(&payload("u1", 1_000)).await.unwrap();
        scanner.confirm(&accepted, "staff-1").await.unwrap();

        assert_eq!(
            scanner.scan(&payload("u1", 1_000)).await.unwrap_err(),
            ScanRejection::AlreadyUsed
        );

        // Next customer still goes through.
        assert!(scanner.scan(&payload("u2", 1_000)).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_confirm_loses_on_duplicate_signature() {
        let store = Arc::new(FakeBackend::new());
        store.insert_user(customer("u1", 0));
        let scanner = checkin(&store, 1_000);

        let first = scanner.scan(&payload("u1", 1_000)).await.unwrap();
        let second = scanner.scan(&payload("u1", 1_000)).await.unwrap();

        scanner.confirm(&first, "staff-1").await.unwrap();
        assert_eq!(
            scanner.confirm(&second, "staff-2").await.unwrap_err(),
            ScanRejection::AlreadyUsed
        );
        assert_eq!(store.visit_count(), 1);
        assert_eq!(store.user("u1").unwrap().current_points, 1);
    }

    #[tokio::test]
    async fn unknown_subject_is_rejected() {
        let store = Arc::new(FakeBackend::new());
        let scanner = checkin(&store, 1_000);
        assert_eq!(
            scanner.scan(&payload("ghost", 1_000)).await.unwrap_err(),
            ScanRejection::SubjectNotFound
        );
    }

    #[tokio::test]
    async fn store_outage_is_unavailable() {
        let store = Arc::new(FakeBackend::new());
        store.insert_user(customer("u1", 0));
        store.fail_visit_lookups(ErrorKind::Transport);
        let scanner = checkin(&store, 1_000);

        let err = scanner.scan(&payload("u1", 1_000)).await.unwrap_err();
        match err {
            ScanRejection::Unavailable(e) => assert_eq!(e.kind, ErrorKind::Transport),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn web_client_payload_parses() {
        let token = CheckIn::parse_payload(
            r#" {"userId":"u1","timestamp":1000,"signature":"dTEtMTAwMA=="} "#,
        )
        .unwrap();
        assert_eq!(token.subject_id, "u1");
        assert_eq!(token.issued_at_ms, 1_000);
    }
}

//! Admin SMS notifications: validation order, pending log rows and
//! background delivery through the simulated and HTTP providers.

use std::sync::Arc;

use smart_queue::audit::MemoryAuditSink;
use smart_queue::models::audit::AuditAction;
use smart_queue::models::notification::Recipient;
use smart_queue::models::service::NewService;
use smart_queue::models::token::Token;
use smart_queue::notification::sms::{SimulatedProvider, SmsProvider, TwilioProvider, UnconfiguredProvider};
use smart_queue::notification::{NotificationError, Notifier};
use smart_queue::scheduler::{QueueScheduler, TokenIssuer};
use smart_queue::store::memory::{MemoryContacts, MemoryNotificationLog, MemoryStore};
use smart_queue::store::NotificationLogStore;
use uuid::Uuid;

struct Setup {
    store: Arc<MemoryStore>,
    contacts: MemoryContacts,
    log: MemoryNotificationLog,
    audit: Arc<MemoryAuditSink>,
    notifier: Notifier,
    token: Token,
}

async fn setup(provider: Arc<dyn SmsProvider>) -> Setup {
    let store = Arc::new(MemoryStore::new());
    let svc = store.create_service(NewService::named("OPD"));
    let token = TokenIssuer::new(store.clone())
        .issue_token(Uuid::new_v4(), svc.id)
        .await
        .unwrap();

    let contacts = MemoryContacts::new();
    let log = MemoryNotificationLog::new();
    let audit = Arc::new(MemoryAuditSink::new());
    let notifier = Notifier::new(
        provider,
        Arc::new(contacts.clone()),
        Arc::new(log.clone()),
        audit.clone(),
    );
    Setup {
        store,
        contacts,
        log,
        audit,
        notifier,
        token,
    }
}

fn reachable(user_id: Uuid) -> Recipient {
    Recipient {
        user_id,
        phone_number: Some("98765 43210".into()),
        sms_opt_in: true,
    }
}

mod validation_tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_and_long_messages_rejected_before_lookup() {
        let s = setup(Arc::new(SimulatedProvider)).await;
        // no contact on record: message checks must fire first
        let err = s
            .notifier
            .send_token_notification(&s.token, "   ", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NotificationError::EmptyMessage));

        let err = s
            .notifier
            .send_token_notification(&s.token, &"x".repeat(161), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NotificationError::MessageTooLong { len: 161, .. }));
        assert!(s.log.is_empty());
    }

    #[tokio::test]
    async fn test_missing_contact() {
        let s = setup(Arc::new(SimulatedProvider)).await;
        let err = s
            .notifier
            .send_token_notification(&s.token, "hello", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NotificationError::MissingRecipient(id) if id == s.token.user_id));
    }

    #[tokio::test]
    async fn test_opted_out_user() {
        let s = setup(Arc::new(SimulatedProvider)).await;
        s.contacts.upsert(Recipient {
            sms_opt_in: false,
            ..reachable(s.token.user_id)
        });
        let err = s
            .notifier
            .send_token_notification(&s.token, "hello", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NotificationError::OptedOut));
        assert!(s.log.is_empty());
    }

    #[tokio::test]
    async fn test_unformattable_phone() {
        let s = setup(Arc::new(SimulatedProvider)).await;
        s.contacts.upsert(Recipient {
            phone_number: Some("12345".into()),
            ..reachable(s.token.user_id)
        });
        let err = s
            .notifier
            .send_token_notification(&s.token, "hello", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NotificationError::InvalidRecipient));

        s.contacts.upsert(Recipient {
            phone_number: None,
            ..reachable(s.token.user_id)
        });
        let err = s
            .notifier
            .send_token_notification(&s.token, "hello", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NotificationError::InvalidRecipient));
    }

    #[tokio::test]
    async fn test_terminal_token_rejected() {
        let s = setup(Arc::new(SimulatedProvider)).await;
        s.contacts.upsert(reachable(s.token.user_id));

        let scheduler = QueueScheduler::new(s.store.clone(), s.audit.clone());
        let cancelled = scheduler
            .skip_or_cancel(s.token.id, None, None)
            .await
            .unwrap()
            .cancelled;

        let err = s
            .notifier
            .send_token_notification(&cancelled, "hello", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NotificationError::TokenTerminal(ref status) if status == "cancelled"));
        assert!(s.log.is_empty());
    }
}

mod delivery_tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_simulated_delivery_marks_log_success() {
        let s = setup(Arc::new(SimulatedProvider)).await;
        s.contacts.upsert(reachable(s.token.user_id));
        let admin = Uuid::new_v4();

        let handle = s
            .notifier
            .send_token_notification(&s.token, "Your token is next", Some(admin))
            .await
            .unwrap();
        let log_id = handle.log_id;

        let pending = s.log.get(log_id).await.unwrap().unwrap();
        assert_eq!(pending.phone_number, "+919876543210");
        assert_eq!(pending.token_id, Some(s.token.id));
        assert_eq!(pending.admin_id, Some(admin));

        let outcome = handle.delivered().await;
        assert!(outcome.success);
        assert_eq!(outcome.provider_id.as_deref(), Some("SIMULATED"));

        let row = s.log.get(log_id).await.unwrap().unwrap();
        assert!(row.success);
        assert_eq!(row.provider_id.as_deref(), Some("SIMULATED"));

        let events = s.audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, AuditAction::SendSms);
        assert_eq!(events[0].target_token_id, Some(s.token.id));
    }

    #[tokio::test]
    async fn test_provider_failure_is_logged_not_raised() {
        let s = setup(Arc::new(UnconfiguredProvider)).await;
        s.contacts.upsert(reachable(s.token.user_id));

        let handle = s
            .notifier
            .send_token_notification(&s.token, "hello", None)
            .await
            .unwrap();
        let log_id = handle.log_id;
        let outcome = handle.delivered().await;
        assert!(!outcome.success);
        assert!(outcome.details.contains("missing SMS provider credentials"));

        let row = s.log.get(log_id).await.unwrap().unwrap();
        assert!(!row.success);
        assert!(s.audit.events().is_empty());
    }

    #[tokio::test]
    async fn test_http_provider_end_to_end() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC9/Messages.json"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "sid": "SM99"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = TwilioProvider::with_base_url(&server.uri(), "AC9", "secret", "MGservice").unwrap();
        let s = setup(Arc::new(provider)).await;
        s.contacts.upsert(reachable(s.token.user_id));

        let handle = s
            .notifier
            .send_token_notification(&s.token, "Now serving your token", None)
            .await
            .unwrap();
        let log_id = handle.log_id;
        assert!(handle.delivered().await.success);

        let row = s.log.get(log_id).await.unwrap().unwrap();
        assert_eq!(row.provider_id.as_deref(), Some("SM99"));
    }
}

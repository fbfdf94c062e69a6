// Integration test: receive loop, retry queue and content dispatch
//
// Drives AccountManager::receive_messages against the fake transport and
// cipher and checks what ends up in the stores, the handler and the
// outbound queue of the transport.

mod common;

use common::*;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use sigmux_core::crypto::CryptoError;
use sigmux_core::message::{
    encode_snapshot, Content, ContactsSnapshot, DataMessage, DecryptedContent, DeviceContact,
    Envelope, EnvelopeType, GroupsSnapshot, SentTranscript, SyncMessage, SyncRequest, VerifiedMessage,
    VerifiedState,
};
use sigmux_core::transport::TransportError;
use sigmux_core::{ReceiveError, ReceiveOptions, TrustLevel};

fn options() -> ReceiveOptions {
    ReceiveOptions {
        timeout: Duration::from_millis(10),
        return_on_timeout: true,
        ignore_attachments: false,
    }
}

fn data(body: &str, expires: u32) -> Content {
    Content::Data(DataMessage {
        timestamp: 1000,
        body: Some(body.into()),
        expires_in_seconds: expires,
        ..Default::default()
    })
}

#[tokio::test]
async fn test_queued_envelope_replayed_after_restart() {
    init_tracing();
    let h = Harness::new();
    let alice = peer(1);

    // Persisted by a previous run that died before handling it
    h.manager
        .state()
        .queue()
        .enqueue(&envelope(&alice, &data("left over", 0), 500))
        .unwrap();

    let recorder = Recorder::default();
    h.manager.receive_messages(&options(), &recorder).await.unwrap();

    let calls = recorder.calls.lock();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].1.is_some());
    assert_eq!(h.manager.state().queue().len().unwrap(), 0);
    // Replayed envelopes were acknowledged long ago
    assert!(h.transport.acked.lock().is_empty());
}

#[tokio::test]
async fn test_envelope_persisted_and_acked_before_handler() {
    let h = Harness::new();
    let alice = peer(1);
    h.transport.push(envelope(&alice, &data("hi", 0), 1000));

    let observed: Arc<Mutex<Vec<(usize, usize)>>> = Arc::default();
    let manager = h.manager.clone();
    let transport = h.transport.clone();
    let seen = observed.clone();
    let handler = move |_: &Envelope, _: Option<&DecryptedContent>, _: Option<&ReceiveError>| {
        let queued = manager.state().queue().len().unwrap();
        let acked = transport.acked.lock().len();
        seen.lock().push((queued, acked));
    };

    h.manager.receive_messages(&options(), &handler).await.unwrap();

    assert_eq!(*observed.lock(), vec![(1, 1)]);
    assert_eq!(h.manager.state().queue().len().unwrap(), 0);
}

#[tokio::test]
async fn test_receipt_envelope_skips_decrypt() {
    let h = Harness::new();
    let alice = peer(1);
    h.cipher
        .decrypt_errors
        .lock()
        .insert(77, CryptoError::InvalidMessage("must not be called".into()));
    h.transport.push(receipt_envelope(&alice, 77));

    let recorder = Recorder::default();
    h.manager.receive_messages(&options(), &recorder).await.unwrap();

    let calls = recorder.calls.lock();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].1.is_none());
    assert!(calls[0].2.is_none());
}

#[tokio::test]
async fn test_untrusted_identity_on_decrypt_is_recorded() {
    let h = Harness::new();
    let alice = peer(1);
    h.cipher.decrypt_errors.lock().insert(
        42,
        CryptoError::UntrustedIdentity { address: alice.clone(), key: key(9) },
    );
    h.transport.push(envelope(&alice, &data("x", 0), 42));

    let recorder = Recorder::default();
    h.manager.receive_messages(&options(), &recorder).await.unwrap();

    let calls = recorder.calls.lock();
    assert!(matches!(calls[0].2, Some(ReceiveError::UntrustedIdentity { .. })));
    let records = h.manager.state().identities(&alice).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].trust_level, TrustLevel::Untrusted);
}

#[tokio::test]
async fn test_invalid_version_and_timeouts_do_not_stop_loop() {
    let h = Harness::new();
    let alice = peer(1);
    h.transport.push_error(TransportError::InvalidVersion("v0".into()));
    h.transport.push(envelope(&alice, &data("after", 0), 1000));

    let recorder = Recorder::default();
    h.manager.receive_messages(&options(), &recorder).await.unwrap();
    assert_eq!(recorder.calls.lock().len(), 1);
}

#[tokio::test]
async fn test_data_message_updates_contact_state() {
    let h = Harness::new();
    let alice = peer(1);
    let content = Content::Data(DataMessage {
        timestamp: 1000,
        expires_in_seconds: 300,
        profile_key: Some(vec![4; 32]),
        ..Default::default()
    });
    h.transport.push(envelope(&alice, &content, 1000));

    h.manager.receive_messages(&options(), &Recorder::default()).await.unwrap();

    assert_eq!(h.manager.state().contact_expiration(&alice).unwrap(), 300);
    assert!(h.manager.state().profile_key(&alice).unwrap().is_some());
}

#[tokio::test]
async fn test_wrong_length_profile_key_ignored() {
    let h = Harness::new();
    let alice = peer(1);
    let content = Content::Data(DataMessage { profile_key: Some(vec![4; 31]), ..Default::default() });
    h.transport.push(envelope(&alice, &content, 1000));

    h.manager.receive_messages(&options(), &Recorder::default()).await.unwrap();
    assert!(h.manager.state().profile_key(&alice).unwrap().is_none());
}

#[tokio::test]
async fn test_needs_receipt_sends_delivery_receipt() {
    let h = Harness::new();
    let alice = peer(1);
    h.cipher.needs_receipt.store(true, Ordering::SeqCst);
    h.transport.push(envelope(&alice, &data("ack me", 0), 1000));

    h.manager.receive_messages(&options(), &Recorder::default()).await.unwrap();

    let receipts: Vec<_> = h
        .transport
        .sent_contents()
        .into_iter()
        .filter(|(to, c)| to.matches(&alice) && matches!(c, Content::Receipt(_)))
        .collect();
    assert_eq!(receipts.len(), 1);
}

#[tokio::test]
async fn test_pre_key_envelope_triggers_refresh() {
    let h = Harness::new();
    let alice = peer(1);
    h.prekeys.available.store(5, Ordering::SeqCst);
    let mut env = envelope(&alice, &data("first contact", 0), 1000);
    env.kind = EnvelopeType::PreKeyBundle;
    h.transport.push(env);

    h.manager.receive_messages(&options(), &Recorder::default()).await.unwrap();
    assert_eq!(h.prekeys.uploaded.load(Ordering::SeqCst), 100);
}

#[tokio::test]
async fn test_end_session_drops_sessions() {
    let h = Harness::new();
    let alice = peer(1);
    let content = Content::Data(DataMessage { end_session: true, ..Default::default() });
    h.transport.push(envelope(&alice, &content, 1000));

    h.manager.receive_messages(&options(), &Recorder::default()).await.unwrap();
    assert_eq!(h.cipher.deleted_sessions.lock().len(), 1);
    assert!(h.cipher.deleted_sessions.lock()[0].matches(&alice));
}

#[tokio::test]
async fn test_attachments_retrieved_unless_ignored() {
    let h = Harness::new();
    let alice = peer(1);
    let pointer = h.attachments.host(b"picture".to_vec());
    let content = Content::Data(DataMessage {
        attachments: vec![pointer.clone()],
        ..Default::default()
    });
    let target = h.manager.paths().attachment_file(&pointer.remote_id);

    let mut skip = options();
    skip.ignore_attachments = true;
    h.transport.push(envelope(&alice, &content, 1000));
    h.manager.receive_messages(&skip, &Recorder::default()).await.unwrap();
    assert!(!target.exists());

    h.transport.push(envelope(&alice, &content, 1001));
    h.manager.receive_messages(&options(), &Recorder::default()).await.unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), b"picture");
}

#[tokio::test]
async fn test_sent_transcript_applies_to_destination() {
    let h = Harness::new();
    let bob = peer(2);
    let sync = Content::Sync(SyncMessage {
        sent: Some(SentTranscript {
            destination: Some(bob.clone()),
            timestamp: 1000,
            message: DataMessage { expires_in_seconds: 60, ..Default::default() },
            expiration_start_timestamp: 0,
            unidentified_status: Vec::new(),
            is_recipient_update: false,
        }),
        ..Default::default()
    });
    h.transport.push(envelope(&h.me(), &sync, 1000));

    h.manager.receive_messages(&options(), &Recorder::default()).await.unwrap();
    assert_eq!(h.manager.state().contact_expiration(&bob).unwrap(), 60);
    assert_eq!(h.manager.state().contact_expiration(&h.me()).unwrap(), 0);
}

#[tokio::test]
async fn test_sync_from_other_account_is_dropped() {
    let h = Harness::new();
    let mallory = peer(6);
    let sync = Content::Sync(SyncMessage {
        request: Some(SyncRequest::Contacts),
        ..Default::default()
    });
    h.transport.push(envelope(&mallory, &sync, 1000));

    h.manager.receive_messages(&options(), &Recorder::default()).await.unwrap();
    assert_eq!(h.attachments.uploads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_contacts_request_uploads_snapshot() {
    let h = Harness::new();
    let sync = Content::Sync(SyncMessage {
        request: Some(SyncRequest::Contacts),
        ..Default::default()
    });
    h.transport.push(envelope(&h.me(), &sync, 1000));

    h.manager.receive_messages(&options(), &Recorder::default()).await.unwrap();

    assert_eq!(h.attachments.uploads.load(Ordering::SeqCst), 1);
    let replies: Vec<_> = h
        .transport
        .sent_contents()
        .into_iter()
        .filter_map(|(_, c)| match c {
            Content::Sync(s) => s.contacts,
            _ => None,
        })
        .collect();
    assert_eq!(replies.len(), 1);
    assert!(replies[0].complete);
}

#[tokio::test]
async fn test_complete_contacts_snapshot_replaces_local() {
    let h = Harness::new();
    let stale = peer(3);
    h.transport.push(envelope(&stale, &data("hi", 30), 999));
    h.manager.receive_messages(&options(), &Recorder::default()).await.unwrap();
    assert_eq!(h.manager.state().contacts().unwrap().len(), 1);

    let entries = vec![DeviceContact {
        address: peer(4),
        name: Some("Dana".into()),
        color: None,
        avatar: None,
        expiration_timer: Some(10),
        profile_key: Some(vec![1; 32]),
        blocked: false,
        archived: false,
        inbox_position: Some(1),
    }];
    let blob = h.attachments.host(encode_snapshot(&entries).unwrap());
    let sync = Content::Sync(SyncMessage {
        contacts: Some(ContactsSnapshot { blob, complete: true }),
        ..Default::default()
    });
    h.transport.push(envelope(&h.me(), &sync, 1000));
    h.manager.receive_messages(&options(), &Recorder::default()).await.unwrap();

    let contacts = h.manager.state().contacts().unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].name.as_deref(), Some("Dana"));
    assert!(h.manager.state().profile_key(&peer(4)).unwrap().is_some());
}

#[tokio::test]
async fn test_verified_sync_sets_trust_level() {
    let h = Harness::new();
    let alice = peer(1);
    let sync = Content::Sync(SyncMessage {
        verified: Some(VerifiedMessage {
            destination: alice.clone(),
            identity_key: key(3),
            state: VerifiedState::Verified,
            timestamp: 1000,
        }),
        ..Default::default()
    });
    h.transport.push(envelope(&h.me(), &sync, 1000));

    h.manager.receive_messages(&options(), &Recorder::default()).await.unwrap();
    assert!(h.manager.state().is_trusted_for_send(&alice, &key(3)).unwrap());
    assert_eq!(
        h.manager.state().identities(&alice).unwrap()[0].trust_level,
        TrustLevel::TrustedVerified
    );
}

#[tokio::test]
async fn test_failed_attachment_job_does_not_block_receipt() {
    let h = Harness::new();
    let alice = peer(1);
    h.cipher.needs_receipt.store(true, Ordering::SeqCst);
    let missing = h.attachments.host(b"gone".to_vec());
    h.attachments.blobs.lock().remove(&missing.remote_id);
    let content = Content::Data(DataMessage {
        timestamp: 1000,
        attachments: vec![missing.clone()],
        ..Default::default()
    });
    h.transport.push(envelope(&alice, &content, 1000));

    let recorder = Recorder::default();
    h.manager.receive_messages(&options(), &recorder).await.unwrap();

    let receipts = h
        .transport
        .sent_contents()
        .into_iter()
        .filter(|(to, c)| to.matches(&alice) && matches!(c, Content::Receipt(_)))
        .count();
    assert_eq!(receipts, 1);
    assert!(!h.manager.paths().attachment_file(&missing.remote_id).exists());
    assert_eq!(recorder.calls.lock().len(), 1);
    assert!(h.manager.state().queue().is_empty().unwrap());
}

#[tokio::test]
async fn test_failed_group_snapshot_keeps_verified_sync() {
    let h = Harness::new();
    let alice = peer(1);
    let blob = h.attachments.host(Vec::new());
    h.attachments.blobs.lock().remove(&blob.remote_id);
    let sync = Content::Sync(SyncMessage {
        groups: Some(GroupsSnapshot { blob, complete: true }),
        verified: Some(VerifiedMessage {
            destination: alice.clone(),
            identity_key: key(5),
            state: VerifiedState::Verified,
            timestamp: 1000,
        }),
        ..Default::default()
    });
    h.transport.push(envelope(&h.me(), &sync, 1000));

    h.manager.receive_messages(&options(), &Recorder::default()).await.unwrap();

    assert!(h.manager.state().is_trusted_for_send(&alice, &key(5)).unwrap());
    assert!(h.manager.state().groups_v1().unwrap().is_empty());
    assert!(h.manager.state().queue().is_empty().unwrap());
}

#[tokio::test]
async fn test_shutdown_ends_receive_loop() {
    let h = Harness::new();
    let mut opts = options();
    opts.return_on_timeout = false;

    h.manager.shutdown();
    tokio::time::timeout(
        Duration::from_secs(5),
        h.manager.receive_messages(&opts, &Recorder::default()),
    )
    .await
    .expect("loop ended")
    .unwrap();
    assert!(h.transport.is_closed());
}

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;

use sigmux_core::message::{Content, DataMessage, GroupContext, GroupContextV1, GroupUpdateType};
use sigmux_core::store::{SledStorage, StorageBackend};
use sigmux_core::{ReceiveOptions, TrustLevel};

fn options() -> ReceiveOptions {
    ReceiveOptions {
        timeout: Duration::from_millis(10),
        return_on_timeout: true,
        ignore_attachments: true,
    }
}

fn open(path: &std::path::Path) -> Arc<dyn StorageBackend> {
    Arc::new(SledStorage::open(path).unwrap())
}

#[tokio::test]
async fn test_account_state_survives_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let alice = peer(1);

    // First run: learn a contact, a group and a key, and die with one
    // envelope still queued
    {
        let h = Harness::with_backend(open(dir.path()));
        h.cipher.decrypt_identities.lock().insert(alice.identifier(), key(7));

        let timer = Content::Data(DataMessage { expires_in_seconds: 45, ..Default::default() });
        let update = Content::Data(DataMessage {
            group: Some(GroupContext::V1(GroupContextV1 {
                id: vec![1; 16],
                kind: GroupUpdateType::Update,
                name: Some("book club".into()),
                members: Some(vec![h.me(), alice.clone()]),
                avatar: None,
            })),
            ..Default::default()
        });
        h.transport.push(envelope(&alice, &timer, 1000));
        h.transport.push(envelope(&alice, &update, 1001));
        h.manager.receive_messages(&options(), &Recorder::default()).await.unwrap();

        let pending = Content::Data(DataMessage { body: Some("unhandled".into()), ..Default::default() });
        h.manager.state().queue().enqueue(&envelope(&alice, &pending, 1002)).unwrap();
        h.manager.state().flush().unwrap();
    }
    // backend dropped here, sled flushes on drop

    // Second run on the same directory
    {
        let h = Harness::with_backend(open(dir.path()));
        let state = h.manager.state();

        assert_eq!(state.contact_expiration(&alice).unwrap(), 45);
        let group = state.group_v1(&[1; 16]).unwrap().unwrap();
        assert_eq!(group.name.as_deref(), Some("book club"));
        assert!(group.is_member(&alice));

        let identities = state.identities(&alice).unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].trust_level, TrustLevel::TrustedUnverified);
        assert!(state.own_profile_key().unwrap().is_some());

        assert_eq!(state.queue().len().unwrap(), 1);
        let recorder = Recorder::default();
        h.manager.receive_messages(&options(), &recorder).await.unwrap();

        let calls = recorder.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.timestamp, 1002);
        assert_eq!(state.queue().len().unwrap(), 0);
    }
}

#[test]
fn test_own_profile_key_stable_across_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let first = {
        let h = Harness::with_backend(open(dir.path()));
        let key = h.manager.state().own_profile_key()?;
        key.map(|k| k.as_bytes().to_vec())
    };

    let h = Harness::with_backend(open(dir.path()));
    let second = h.manager.state().own_profile_key()?;
    assert!(first.is_some());
    assert_eq!(first, second.map(|k| k.as_bytes().to_vec()));
    Ok(())
}

//! End-to-end protocol scenarios: frames, handshakes, streams, rotation.

use std::sync::Arc;
use std::time::Duration;
use stt_core::{
    Frame, FrameFlags, FrameType, Handshake, NodeConfig, Session, SessionConfig, SessionError,
    StreamDecoder, StreamEncoder,
};
use stt_crypto::{AdContext, CryptoProvider, SeedCrypto, SessionKey};
use stt_integration_tests::{ALICE_SEED, BOB_SEED, SHARED_SEED, test_node, test_node_with_config};

// ---------------------------------------------------------------------
// Frame round-trip with AEAD binding
// ---------------------------------------------------------------------

#[test]
fn frame_roundtrip_with_aead() {
    let frame = Frame {
        frame_type: FrameType::Data,
        flags: FrameFlags::new(),
        session_id: [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
        sequence: 42,
        timestamp: 1_700_000_000_000,
        payload: b"hello".to_vec(),
    };

    let encoded = frame.encode().unwrap();
    assert_eq!(&encoded[..2], &[0x53, 0x54]);

    let (decoded, consumed) = Frame::decode(&encoded).unwrap();
    assert_eq!(decoded, frame);
    assert_eq!(consumed, encoded.len());

    // Encrypt under the frame's associated data, then try to open the
    // ciphertext bound to sequence 43 instead.
    let crypto = SeedCrypto::new(b"frame-aead-test-seed");
    let ad42 = AdContext::purpose("frame_payload")
        .with_bytes("frame_ad", frame.associated_data().to_vec());
    let (ciphertext, metadata) = crypto.encrypt(&frame.payload, &ad42).unwrap();

    let mut shifted = frame.clone();
    shifted.sequence = 43;
    let ad43 = AdContext::purpose("frame_payload")
        .with_bytes("frame_ad", shifted.associated_data().to_vec());

    assert_eq!(crypto.decrypt(&ciphertext, &metadata, &ad42).unwrap(), b"hello");
    assert!(crypto.decrypt(&ciphertext, &metadata, &ad43).is_err());
}

// ---------------------------------------------------------------------
// Two-node handshake and data exchange
// ---------------------------------------------------------------------

#[tokio::test]
async fn two_node_handshake_and_ping() {
    let alice = test_node(ALICE_SEED);
    let bob = test_node(BOB_SEED);
    alice.start().await.unwrap();
    let bob_addr = bob.start().await.unwrap();

    let session = alice.connect("127.0.0.1", bob_addr.port()).await.unwrap();
    let session_id = session.lock().await.session_id();

    // Both sides hold the same session id and are active.
    let bob_session = bob.get_session(&session_id).expect("bob has no session");
    assert!(session.lock().await.is_active());
    assert!(bob_session.lock().await.is_active());
    assert_eq!(bob_session.lock().await.session_id(), session_id);

    // Alice's stream 1 delivers to Bob's stream 1.
    let stream = session.lock().await.open_stream().unwrap();
    assert_eq!(stream.id(), 1);
    alice.send(&session, stream.id(), b"ping").await.unwrap();

    let packet = bob
        .recv_timeout(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("receive queue closed");
    assert_eq!(packet.session_id, session_id);
    assert_eq!(packet.stream_id, 1);
    assert_eq!(packet.data, b"ping");

    // The chunk is also readable through Bob's stream handle.
    let handle = bob_session.lock().await.stream_handle(1).unwrap();
    assert_eq!(handle.receive(None).await.unwrap().unwrap(), b"ping");

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn bidirectional_streams() {
    let alice = test_node(ALICE_SEED);
    let bob = test_node(BOB_SEED);
    alice.start().await.unwrap();
    let bob_addr = bob.start().await.unwrap();

    let a_session = alice.connect("127.0.0.1", bob_addr.port()).await.unwrap();
    let session_id = a_session.lock().await.session_id();
    let b_session = bob.get_session(&session_id).unwrap();

    let a_stream = a_session.lock().await.open_stream().unwrap();
    alice.send(&a_session, a_stream.id(), b"from alice").await.unwrap();

    let b_stream = b_session.lock().await.open_stream().unwrap();
    bob.send(&b_session, b_stream.id(), b"from bob").await.unwrap();

    let at_bob = bob.recv_timeout(Duration::from_secs(2)).await.unwrap().unwrap();
    assert_eq!(at_bob.data, b"from alice");
    let at_alice = alice.recv_timeout(Duration::from_secs(2)).await.unwrap().unwrap();
    assert_eq!(at_alice.data, b"from bob");

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn many_chunks_arrive_in_order() {
    let alice = test_node(ALICE_SEED);
    let bob = test_node(BOB_SEED);
    alice.start().await.unwrap();
    let bob_addr = bob.start().await.unwrap();

    let session = alice.connect("127.0.0.1", bob_addr.port()).await.unwrap();
    let stream = session.lock().await.open_stream().unwrap();

    for i in 0..32u32 {
        let msg = format!("chunk-{i:03}");
        alice.send(&session, stream.id(), msg.as_bytes()).await.unwrap();
    }

    for i in 0..32u32 {
        let packet = bob
            .recv_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("queue closed early");
        assert_eq!(packet.data, format!("chunk-{i:03}").as_bytes());
    }

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn large_payload_fragments_across_frames() {
    let alice = test_node(ALICE_SEED);
    let bob = test_node(BOB_SEED);
    alice.start().await.unwrap();
    let bob_addr = bob.start().await.unwrap();

    let session = alice.connect("127.0.0.1", bob_addr.port()).await.unwrap();
    let stream = session.lock().await.open_stream().unwrap();

    let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    alice.send(&session, stream.id(), &data).await.unwrap();

    let mut reassembled = Vec::new();
    while reassembled.len() < data.len() {
        let packet = bob
            .recv_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("queue closed before all fragments arrived");
        reassembled.extend(packet.data);
    }
    assert_eq!(reassembled, data);

    alice.stop().await;
    bob.stop().await;
}

// ---------------------------------------------------------------------
// Stream reordering
// ---------------------------------------------------------------------

#[test]
fn stream_reordering_restores_sender_order() {
    let key = SessionKey::new([4u8; 32]);
    let session_id = [6u8; 8];
    let mut encoder = StreamEncoder::new(stt_core::stream_codec::stream_context(
        &key, &session_id, 1,
    ));
    let mut decoder = StreamDecoder::new(stt_core::stream_codec::stream_context(
        &key, &session_id, 1,
    ));

    let segments: Vec<(u64, Vec<u8>)> = [b"a".as_slice(), b"b", b"c", b"d"]
        .iter()
        .map(|chunk| encoder.encode_segment(chunk).unwrap())
        .collect();
    assert_eq!(
        segments.iter().map(|(seq, _)| *seq).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );

    for idx in [2usize, 0, 3, 1] {
        let (seq, segment) = &segments[idx];
        decoder.decode_segment(segment, Some(*seq)).unwrap();
    }

    assert_eq!(
        decoder.get_ordered_chunks(),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
    );
}

// ---------------------------------------------------------------------
// Key rotation
// ---------------------------------------------------------------------

#[tokio::test]
async fn key_rotation_threshold_and_recovery() {
    let config = SessionConfig {
        rotation_message_threshold: 3,
        rotation_grace_frames: 0,
        ..SessionConfig::default()
    };
    let key = SessionKey::new([8u8; 32]);
    let sid = [2u8; 8];
    let mut alice = Session::new(sid, [1u8; 32], [2u8; 32], key.clone(), vec![], config.clone());
    let mut bob = Session::new(sid, [2u8; 32], [1u8; 32], key, vec![], config);
    alice.activate();
    bob.activate();

    let stream = alice.open_stream().unwrap();

    // Three sends cross the message threshold.
    assert!(!alice.should_rotate());
    for msg in [b"one".as_slice(), b"two", b"three"] {
        let wire = alice.encode_data_frame(stream.id(), msg).unwrap();
        let (frame, _) = Frame::decode(&wire).unwrap();
        bob.ingest_data_frame(&frame).unwrap();
    }
    assert!(alice.should_rotate());

    // Rotation bumps the version and resets counters.
    let next = alice.derive_next_key();
    alice.rotate_keys(next).unwrap();
    assert_eq!(alice.key_version(), 1);
    assert!(!alice.should_rotate());

    // Bob still holds version 0: the next frame fails to decrypt.
    let wire = alice.encode_data_frame(stream.id(), b"rotated").unwrap();
    let (frame, _) = Frame::decode(&wire).unwrap();
    assert!(matches!(
        bob.ingest_data_frame(&frame),
        Err(SessionError::DecryptFailure)
    ));

    // After Bob rotates in response, the same frame decrypts.
    let next = bob.derive_next_key();
    bob.rotate_keys(next).unwrap();
    assert_eq!(bob.key_version(), 1);
    let (_, chunks) = bob.ingest_data_frame(&frame).unwrap();
    assert_eq!(chunks, vec![b"rotated".to_vec()]);
}

#[test]
fn rotation_atomicity_without_grace() {
    // No frame encrypted under version 0 opens under version 1 once the
    // grace window (zero here) is spent.
    let config = SessionConfig {
        rotation_grace_frames: 0,
        ..SessionConfig::default()
    };
    let key = SessionKey::new([9u8; 32]);
    let sid = [3u8; 8];
    let mut sender = Session::new(sid, [1u8; 32], [2u8; 32], key.clone(), vec![], config.clone());
    let mut receiver = Session::new(sid, [2u8; 32], [1u8; 32], key, vec![], config);
    sender.activate();
    receiver.activate();
    let stream = sender.open_stream().unwrap();

    let old_wire = sender.encode_data_frame(stream.id(), b"old key").unwrap();

    let next = receiver.derive_next_key();
    receiver.rotate_keys(next).unwrap();

    let (frame, _) = Frame::decode(&old_wire).unwrap();
    assert!(matches!(
        receiver.ingest_data_frame(&frame),
        Err(SessionError::DecryptFailure)
    ));
}

// ---------------------------------------------------------------------
// Handshake properties at the engine level
// ---------------------------------------------------------------------

#[test]
fn handshake_determinism() {
    let crypto: Arc<dyn CryptoProvider> = Arc::new(SeedCrypto::new(SHARED_SEED));
    let mut alice = Handshake::new(Arc::clone(&crypto), [0xAA; 32]);
    let mut bob = Handshake::new(crypto, [0xBB; 32]);

    let hello = alice.initiate().unwrap();
    let response = bob.handle_hello(&hello).unwrap();
    let auth = alice.handle_response(&response).unwrap();
    let fin = bob.handle_auth_proof(&auth).unwrap();
    alice.handle_final(&fin).unwrap();

    assert_eq!(alice.session_id().unwrap(), bob.session_id().unwrap());
    assert_eq!(
        alice.session_key().unwrap().as_bytes(),
        bob.session_key().unwrap().as_bytes()
    );
}

// ---------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------

#[tokio::test]
async fn stop_wakes_stream_receivers() {
    let alice = test_node(ALICE_SEED);
    let bob = test_node(BOB_SEED);
    alice.start().await.unwrap();
    let bob_addr = bob.start().await.unwrap();

    let session = alice.connect("127.0.0.1", bob_addr.port()).await.unwrap();
    let stream = session.lock().await.open_stream().unwrap();

    let pending = tokio::spawn(async move { stream.receive(None).await });
    tokio::task::yield_now().await;

    alice.stop().await;

    // The pending receiver observes end-of-stream, not an error.
    let outcome = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("receiver never woke")
        .unwrap();
    assert_eq!(outcome.unwrap(), None);

    bob.stop().await;
}

#[tokio::test]
async fn chamber_persists_session_records() {
    let dir = tempfile::TempDir::new().unwrap();
    let alice = test_node_with_config(
        ALICE_SEED,
        NodeConfig {
            chamber_path: Some(dir.path().join("alice-chamber")),
            ..NodeConfig::default()
        },
    );
    let bob = test_node(BOB_SEED);
    alice.start().await.unwrap();
    let bob_addr = bob.start().await.unwrap();

    let session = alice.connect("127.0.0.1", bob_addr.port()).await.unwrap();
    let session_id = session.lock().await.session_id();

    // The chamber wrote an encrypted record for the new session.
    let record_path = dir
        .path()
        .join("alice-chamber")
        .join("sessions")
        .join(format!("{}.session", hex::encode(session_id)));
    assert!(record_path.exists());
    let key_path = dir
        .path()
        .join("alice-chamber")
        .join("keys")
        .join(format!("{}.key", hex::encode(session_id)));
    assert!(key_path.exists());

    alice.stop().await;
    bob.stop().await;
}

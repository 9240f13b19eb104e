use crate::*;

use meshwire_core::{ChannelKey, PrivateMessagePacket};

/// Two peers that never exchanged anything but a password can read each
/// other's envelopes; a peer with the wrong password cannot.
#[test]
fn test_shared_password_interop() {
    let alice = Peer::new("alice");
    let bob = Peer::new("bob");
    let mallory = Peer::new("mallory");

    let id_a = alice.channels.join("#Mesh", "correct horse").unwrap();
    let id_b = bob.channels.join(" mesh ", "correct horse").unwrap();
    let id_m = mallory.channels.join("mesh", "battery staple").unwrap();
    assert_eq!(id_a, id_b);
    assert_ne!(id_a, id_m);

    let envelope = alice
        .channels
        .seal_active(b"hello from alice", b"")
        .unwrap()
        .unwrap();
    let wire = envelope.encode().unwrap();

    let received = ChannelEncryptedPacket::decode(&wire).unwrap();
    let (channel, plaintext) = bob.channels.open_with_known(&received, b"").unwrap();
    assert_eq!(channel, "mesh");
    assert_eq!(plaintext, b"hello from alice");

    assert!(mallory.channels.open_with_known(&received, b"").is_none());
}

/// A private message rides inside an envelope and survives the wire intact.
#[test]
fn test_private_message_in_envelope() {
    let alice = Peer::new("alice");
    let bob = Peer::new("bob");
    alice.channels.join("ops", "pw").unwrap();
    bob.channels.join("ops", "pw").unwrap();

    let message = PrivateMessagePacket {
        message_id: "3f1c-0001".into(),
        content: "meet at the north gate".into(),
    };
    let sealed = alice
        .channels
        .seal_active(&message.encode().unwrap(), b"alice")
        .unwrap()
        .unwrap()
        .encode()
        .unwrap();

    let envelope = ChannelEncryptedPacket::decode(&sealed).unwrap();
    let (_, inner) = bob.channels.open_with_known(&envelope, b"alice").unwrap();
    assert_eq!(PrivateMessagePacket::decode(&inner).unwrap(), message);

    // Binding the sender into the associated data stops replay under another name.
    assert!(bob.channels.open_with_known(&envelope, b"mallory").is_none());
}

/// A peer in several channels attributes each envelope to the right one.
#[test]
fn test_routing_across_channels() {
    let hub = Peer::new("hub");
    for (name, pw) in [("alpha", "a"), ("beta", "b"), ("gamma", "c")] {
        hub.channels.join(name, pw).unwrap();
    }

    for (name, pw) in [("gamma", "c"), ("alpha", "a"), ("beta", "b")] {
        let sender = Peer::new("sender");
        sender.channels.join(name, pw).unwrap();
        let envelope = sender
            .channels
            .seal_active(name.as_bytes(), b"")
            .unwrap()
            .unwrap();

        let (channel, plaintext) = hub.channels.open_with_known(&envelope, b"").unwrap();
        assert_eq!(channel, name);
        assert_eq!(plaintext, name.as_bytes());
    }
}

/// Any corruption of the encoded envelope is caught: either the decode
/// fails or no key opens it.
#[test]
fn test_wire_corruption_detected() {
    let alice = Peer::new("alice");
    let bob = Peer::new("bob");
    alice.channels.join("mesh", "pw").unwrap();
    bob.channels.join("mesh", "pw").unwrap();

    let wire = alice
        .channels
        .seal_active(b"integrity matters", b"")
        .unwrap()
        .unwrap()
        .encode()
        .unwrap();

    for i in 0..wire.len() {
        let mut corrupted = wire.clone();
        corrupted[i] ^= 0x01;
        let opened = ChannelEncryptedPacket::decode(&corrupted)
            .ok()
            .and_then(|env| bob.channels.open_with_known(&env, b""));
        assert!(opened.is_none(), "flip at byte {i} went undetected");
    }
}

/// Peers with rotating keys interoperate across epochs, and the channel id
/// does not reveal the epoch.
#[test]
fn test_rotating_channel_interop() {
    let alice = Peer::with_epoch("alice", 60);
    let bob = Peer::with_epoch("bob", 60);
    alice.channels.join("night-watch", "pw").unwrap();
    bob.channels.join("night-watch", "pw").unwrap();

    let key = alice.channels.key_for_active().unwrap();
    let early = key.seal_at(b"first", b"", 600).unwrap();
    let late = key.seal_at(b"second", b"", 6_000).unwrap();
    assert_eq!(early.epoch, 10);
    assert_eq!(late.epoch, 100);
    assert_eq!(early.channel_id, late.channel_id);

    for (envelope, text) in [(early, &b"first"[..]), (late, &b"second"[..])] {
        let (_, plaintext) = bob.channels.open_with_known(&envelope, b"").unwrap();
        assert_eq!(plaintext, text);
    }
}

/// A static-key peer refuses an epoch-stamped envelope for its channel.
#[test]
fn test_static_peer_rejects_rotating_envelope() {
    let rotating = ChannelKey::derive_with_epoch("mesh", "pw", 60);
    let fixed = Peer::new("fixed");
    fixed.channels.join("mesh", "pw").unwrap();

    let envelope = rotating.seal_at(b"x", b"", 6_000).unwrap();
    assert!(fixed.channels.open_with_known(&envelope, b"").is_none());
}

/// Registry bookkeeping after a join/leave sequence.
#[test]
fn test_join_leave_active_tracking() {
    let peer = Peer::new("peer");
    peer.channels.join("alpha", "p").unwrap();
    peer.channels.join("beta", "p").unwrap();
    assert_eq!(peer.channels.active().as_deref(), Some("alpha"));

    assert!(peer.channels.leave("alpha"));
    assert_eq!(peer.channels.list(), vec!["beta"]);
    assert_eq!(peer.channels.active().as_deref(), Some("beta"));
    assert!(peer.channels.key_for_active().is_some());
}

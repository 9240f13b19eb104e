use crate::*;

use meshwire_core::transfer::{BitTransferChunk, BitTransferManifest, MAX_SEALED_CHUNK_PAYLOAD};

fn joined_pair(channel: &str) -> (Peer, Peer) {
    let a = Peer::new("a");
    let b = Peer::new("b");
    a.channels.join(channel, "pw").unwrap();
    b.channels.join(channel, "pw").unwrap();
    (a, b)
}

/// The worked example: 500 bytes at chunk size 192, chunks delivered as
/// encoded packets in the order 2, 0, 1.
#[test]
fn test_out_of_order_wire_delivery() {
    let sender = Peer::new("sender");
    let receiver = Peer::new("receiver");
    let data = payload(500, 1);

    let manifest = start_transfer(&sender, "report.bin", &data, 192).unwrap();
    assert_eq!(manifest.total_chunks, 3);

    let manifest_bytes = manifest.encode().unwrap();
    let decoded = BitTransferManifest::decode(&manifest_bytes).unwrap();
    assert_eq!(decoded, manifest);
    receiver.transfers.handle_manifest(decoded);

    let wire: Vec<Vec<u8>> = sender
        .transfers
        .next_chunks(&manifest.file_id, 4)
        .iter()
        .map(|c| c.encode().unwrap())
        .collect();
    assert_eq!(wire.len(), 3);

    let mut acks = Vec::new();
    for i in [2usize, 0, 1] {
        let chunk = BitTransferChunk::decode(&wire[i]).unwrap();
        acks.push(receiver.transfers.handle_chunk(chunk).map(|a| a.acked_up_to));
        if i != 1 {
            assert!(receiver
                .transfers
                .assemble_if_complete(&manifest.file_id)
                .unwrap()
                .is_none());
        }
    }
    assert_eq!(acks, vec![None, Some(0), Some(2)]);

    let file = receiver
        .transfers
        .assemble_if_complete(&manifest.file_id)
        .unwrap()
        .unwrap();
    assert_eq!(&file[..], &data[..]);
}

/// A full transfer over a reliable link, sealed inside channel envelopes.
#[test]
fn test_sealed_transfer_reliable_link() {
    let (sender, receiver) = joined_pair("files");
    let data = payload(2_000, 2);
    let manifest = start_transfer(&sender, "doc.pdf", &data, 150).unwrap();

    let (file, rounds) = run_transfer(
        &sender,
        &receiver,
        &manifest,
        4,
        &mut Link::reliable(),
        &mut Link::reliable(),
        100,
    )
    .unwrap();

    assert_eq!(&file[..], &data[..]);
    // 14 chunks at 4 per round.
    assert_eq!(rounds, 4);
    assert!(sender.transfers.outgoing_ids().is_empty());
    assert!(receiver.transfers.incoming_ids().is_empty());
}

/// Heavy loss and reordering in both directions; retransmission driven by
/// `last_acked`/`rewind` still delivers the exact bytes.
#[test]
fn test_lossy_link_recovers() {
    for seed in [1u64, 7, 42] {
        let (sender, receiver) = joined_pair("lossy");
        let data = payload(5_000, seed as u8);
        let manifest = start_transfer(&sender, "big.bin", &data, 100).unwrap();

        let mut uplink = Link::lossy(30, seed);
        let mut downlink = Link::lossy(30, seed + 1000);
        let (file, _) = run_transfer(
            &sender,
            &receiver,
            &manifest,
            8,
            &mut uplink,
            &mut downlink,
            5_000,
        )
        .unwrap();

        assert_eq!(&file[..], &data[..], "seed {seed}");
        assert!(uplink.dropped > 0, "seed {seed} dropped nothing");
    }
}

/// Chunks too large for one envelope travel in the clear and still arrive.
#[test]
fn test_large_chunks_bypass_envelope() {
    let (sender, receiver) = joined_pair("mixed");
    let data = payload(1_000, 3);
    let manifest = start_transfer(&sender, "raw.bin", &data, 250).unwrap();

    let chunk = sender.transfers.chunk_at(&manifest.file_id, 0).unwrap();
    let framed = sender.frame(&TransferPacket::from(chunk)).unwrap();
    assert_eq!(framed[0], tag::CHUNK);

    let (file, _) = run_transfer(
        &sender,
        &receiver,
        &manifest,
        4,
        &mut Link::reliable(),
        &mut Link::reliable(),
        50,
    )
    .unwrap();
    assert_eq!(&file[..], &data[..]);
}

/// Two transfers in opposite directions share engines without interfering.
#[test]
fn test_bidirectional_transfers_are_independent() {
    let (a, b) = joined_pair("duplex");
    let to_b = payload(900, 4);
    let to_a = payload(700, 5);

    let m_ab = start_transfer(&a, "a-to-b", &to_b, 120).unwrap();
    let m_ba = start_transfer(&b, "b-to-a", &to_a, 120).unwrap();

    let (got_b, _) = run_transfer(
        &a,
        &b,
        &m_ab,
        3,
        &mut Link::lossy(20, 9),
        &mut Link::lossy(20, 10),
        2_000,
    )
    .unwrap();
    let (got_a, _) = run_transfer(
        &b,
        &a,
        &m_ba,
        3,
        &mut Link::lossy(20, 11),
        &mut Link::lossy(20, 12),
        2_000,
    )
    .unwrap();

    assert_eq!(&got_b[..], &to_b[..]);
    assert_eq!(&got_a[..], &to_a[..]);
}

/// A cancel from the receiver tears down the sender's state over the wire.
#[test]
fn test_cancel_over_the_wire() {
    let (sender, receiver) = joined_pair("cancel");
    let data = payload(1_000, 6);
    let manifest = start_transfer(&sender, "abort.bin", &data, 100).unwrap();

    receiver
        .receive(&sender.frame(&TransferPacket::from(manifest.clone())).unwrap())
        .unwrap();
    for chunk in sender.transfers.next_chunks(&manifest.file_id, 3) {
        let frame = sender.frame(&TransferPacket::from(chunk)).unwrap();
        if let Some(ack) = receiver.receive(&frame).unwrap() {
            sender.receive(&ack).unwrap();
        }
    }
    assert_eq!(sender.transfers.last_acked(&manifest.file_id), Some(2));

    let cancel = receiver.transfers.cancel(&manifest.file_id);
    assert!(receiver.transfers.incoming_ids().is_empty());

    assert!(sender.receive(&sender.frame(&TransferPacket::from(cancel)).unwrap()).unwrap().is_none());
    assert!(sender.transfers.outgoing_ids().is_empty());
    assert!(sender.transfers.next_chunks(&manifest.file_id, 4).is_empty());
}

/// A chunk corrupted on the wire after hashing is ignored; its clean
/// retransmission completes the file.
#[test]
fn test_corrupted_chunk_then_retransmit() {
    let sender = Peer::new("sender");
    let receiver = Peer::new("receiver");
    let data = payload(300, 7);
    let manifest = start_transfer(&sender, "c.bin", &data, 100).unwrap();
    receiver.transfers.handle_manifest(manifest.clone());

    let chunks = sender.transfers.next_chunks(&manifest.file_id, 3);
    let mut bad = chunks[1].encode().unwrap();
    let last = bad.len() - 1;
    bad[last] ^= 0x55;

    assert!(receiver.receive(&chunks[0].encode().unwrap()).unwrap().is_some());
    assert!(receiver.receive(&bad).unwrap().is_none());
    let ack = receiver.receive(&chunks[2].encode().unwrap()).unwrap().unwrap();
    sender.receive(&ack).unwrap();
    assert_eq!(sender.transfers.last_acked(&manifest.file_id), Some(0));

    assert!(sender.transfers.rewind(&manifest.file_id));
    let resent = sender.transfers.next_chunks(&manifest.file_id, 1).remove(0);
    assert_eq!(resent.index, 1);
    receiver.receive(&resent.encode().unwrap()).unwrap();

    let file = receiver
        .transfers
        .assemble_if_complete(&manifest.file_id)
        .unwrap()
        .unwrap();
    assert_eq!(&file[..], &data[..]);
}

/// Many threads feed one receiver through cloned engine handles.
#[test]
fn test_concurrent_chunk_delivery() {
    let sender = Peer::new("sender");
    let receiver = TransferEngine::new();
    let data = payload(20_000, 8);
    let manifest = start_transfer(&sender, "parallel.bin", &data, 200).unwrap();
    receiver.handle_manifest(manifest.clone());

    let chunks = sender
        .transfers
        .next_chunks(&manifest.file_id, manifest.total_chunks as usize);
    assert_eq!(chunks.len(), 100);

    std::thread::scope(|s| {
        for lane in chunks.chunks(13) {
            let engine = receiver.clone();
            s.spawn(move || {
                for chunk in lane.iter().rev() {
                    engine.handle_chunk(chunk.clone());
                }
            });
        }
    });

    let progress = receiver.incoming_progress(&manifest.file_id).unwrap();
    assert_eq!(progress.received, 100);
    assert_eq!(progress.contiguous, 100);

    let file = receiver
        .assemble_if_complete(&manifest.file_id)
        .unwrap()
        .unwrap();
    assert_eq!(&file[..], &data[..]);
}

/// A zero-length file completes from the manifest alone.
#[test]
fn test_empty_file() {
    let (sender, receiver) = joined_pair("empty");
    let manifest = start_transfer(&sender, "empty.txt", &[], 192).unwrap();
    assert_eq!(manifest.total_chunks, 0);

    let (file, rounds) = run_transfer(
        &sender,
        &receiver,
        &manifest,
        4,
        &mut Link::reliable(),
        &mut Link::reliable(),
        5,
    )
    .unwrap();
    assert!(file.is_empty());
    assert_eq!(rounds, 1);
}

/// At the sealed ceiling every chunk crosses the wire inside an envelope and
/// the file bytes never appear in the clear.
#[test]
fn test_sealed_ceiling_keeps_payload_private() {
    let (sender, receiver) = joined_pair("private");
    let data = vec![0x5a; 1_000];
    let manifest = start_transfer(&sender, "secret.bin", &data, MAX_SEALED_CHUNK_PAYLOAD).unwrap();

    for chunk in sender.transfers.next_chunks(&manifest.file_id, 8) {
        let frame = sender.frame(&TransferPacket::from(chunk)).unwrap();
        assert_ne!(frame[0], tag::CHUNK);
        assert!(!frame.windows(16).any(|w| w == [0x5a; 16]));
    }
    sender.transfers.rewind(&manifest.file_id);

    let (file, _) = run_transfer(
        &sender,
        &receiver,
        &manifest,
        4,
        &mut Link::reliable(),
        &mut Link::reliable(),
        50,
    )
    .unwrap();
    assert_eq!(&file[..], &data[..]);
}

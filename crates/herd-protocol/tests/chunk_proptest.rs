use herd_protocol::chunk::split;
use herd_protocol::{Channel, ChunkCodec, ChunkPacket, PeerId};
use proptest::prelude::*;

fn sender() -> PeerId {
    PeerId::new("12D3KooWproptest")
}

proptest! {
    /// Slices are bounded and concatenate back to the payload.
    #[test]
    fn split_is_contiguous_and_bounded(payload in ".{0,2000}", size in 4usize..600) {
        let slices = split(&payload, size).unwrap();
        for slice in &slices {
            prop_assert!(!slice.is_empty());
            prop_assert!(slice.len() <= size);
        }
        prop_assert_eq!(slices.concat(), payload);
    }

    /// Any permutation of the fragments reassembles to the original.
    #[test]
    fn permuted_fragments_reassemble(
        (payload, order) in "[\\PC]{1,1500}".prop_flat_map(|p| {
            let n = split(&p, 16).unwrap().len();
            (Just(p), Just((0..n).collect::<Vec<_>>()).prop_shuffle())
        })
    ) {
        let sender_codec = ChunkCodec::new(16).unwrap();
        let mut receiver = ChunkCodec::new(16).unwrap();
        let frames = sender_codec.encode(&payload).unwrap();
        prop_assert_eq!(frames.len(), order.len());

        let mut result = None;
        for (i, &idx) in order.iter().enumerate() {
            let out = receiver.ingest(&sender(), Channel::Posts, &frames[idx]).unwrap();
            if i + 1 < order.len() {
                prop_assert!(out.is_none(), "completed early after {} of {}", i + 1, order.len());
            } else {
                result = out;
            }
        }
        prop_assert_eq!(result, Some(payload));
        prop_assert_eq!(receiver.in_flight(), 0);
    }

    /// Duplicated fragments do not change the result.
    #[test]
    fn duplicates_are_harmless(payload in "[a-z]{20,400}", dup in 0usize..8) {
        let codec = ChunkCodec::new(8).unwrap();
        let mut receiver = ChunkCodec::new(8).unwrap();
        let packets = codec.fragment(&payload).unwrap();
        let dup = dup % packets.len();

        prop_assert!(receiver
            .ingest_packet(&sender(), Channel::Backlog, packets[dup].clone())
            .unwrap()
            .is_none());

        let mut result = None;
        for packet in packets {
            if let Some(done) = receiver.ingest_packet(&sender(), Channel::Backlog, packet).unwrap() {
                result = Some(done);
            }
        }
        prop_assert_eq!(result, Some(payload));
    }

    /// Without every index present, nothing is released.
    #[test]
    fn missing_index_never_completes(payload in "[a-z]{40,400}", missing in any::<prop::sample::Index>()) {
        let codec = ChunkCodec::new(8).unwrap();
        let mut receiver = ChunkCodec::new(8).unwrap();
        let packets: Vec<ChunkPacket> = codec.fragment(&payload).unwrap();
        let skip = missing.index(packets.len());

        for (i, packet) in packets.into_iter().enumerate() {
            if i == skip {
                continue;
            }
            prop_assert!(receiver.ingest_packet(&sender(), Channel::Posts, packet).unwrap().is_none());
        }
        prop_assert_eq!(receiver.in_flight(), 1);
    }

    /// Whatever its characters, a payload within `max_payload_len` is emitted.
    #[test]
    fn payload_within_limit_always_fragments(payload in "\\PC{1,400}", size in 4usize..64) {
        let needed = payload.len().div_ceil(size - 3) as u32;
        let codec = ChunkCodec::new(size).unwrap().with_max_fragments(needed);
        prop_assert!(payload.len() <= codec.max_payload_len());
        let packets = codec.fragment(&payload).unwrap();
        prop_assert!(packets.len() as u32 <= needed);
    }
}

//! Property-based tests over the wire layer and the transfer machinery.

use proptest::prelude::*;

mod frame_properties {
    use super::*;
    use slipwire_proto::{Chunk, ChunkFlags, PeerFooter, PeerHeader};

    proptest! {
        /// Header serialization is a bijection for every field value.
        #[test]
        fn header_roundtrip(
            session_id in any::<u32>(),
            chunk_id in any::<u32>(),
            offset in any::<u64>(),
            total_size in any::<u64>(),
            length in any::<u32>(),
            flags in any::<u32>(),
            ack_id in any::<u32>(),
            ack_sub_id in any::<u32>(),
            ack_size in any::<u64>(),
        ) {
            let header = PeerHeader {
                session_id,
                chunk_id,
                offset,
                total_size,
                length,
                flags: ChunkFlags::from_raw(flags),
                ack_id,
                ack_sub_id,
                ack_size,
            };
            prop_assert_eq!(PeerHeader::parse(&header.to_bytes()).unwrap(), header);
        }

        /// A built chunk always parses back to the same header and body.
        #[test]
        fn chunk_roundtrip(body in prop::collection::vec(any::<u8>(), 0..2048), app_id in 0u32..4) {
            let header = PeerHeader {
                session_id: 9,
                chunk_id: 1,
                offset: 0,
                total_size: body.len() as u64,
                length: body.len() as u32,
                flags: ChunkFlags::new().with_file(),
                ack_id: 0,
                ack_sub_id: 0,
                ack_size: 0,
            };
            let framed = Chunk::build(&header, &body, &PeerFooter { value: app_id });
            let parsed = Chunk::parse(&framed).unwrap();
            prop_assert_eq!(parsed.header, header);
            prop_assert_eq!(parsed.body, &body[..]);
            prop_assert_eq!(parsed.footer.value, app_id);
        }

        /// Truncating a framed chunk is always detected.
        #[test]
        fn truncated_chunk_rejected(body in prop::collection::vec(any::<u8>(), 8..512), cut in 1usize..8) {
            let header = PeerHeader {
                session_id: 1,
                chunk_id: 1,
                offset: 0,
                total_size: body.len() as u64,
                length: body.len() as u32,
                flags: ChunkFlags::new().with_file(),
                ack_id: 0,
                ack_sub_id: 0,
                ack_size: 0,
            };
            let mut framed = Chunk::build(&header, &body, &PeerFooter::default());
            framed.truncate(framed.len() - cut);
            prop_assert!(Chunk::parse(&framed).is_err());
        }
    }
}

mod command_properties {
    use super::*;
    use slipwire_proto::Command;

    proptest! {
        /// Command lines survive a serialize/parse cycle.
        #[test]
        fn line_roundtrip(
            name in "[A-Z0-9]{3,4}",
            params in prop::collection::vec("[a-zA-Z0-9@.-]{1,16}", 0..6),
        ) {
            let cmd = Command::new(&name, params);
            let parsed = Command::from_line(cmd.to_line().trim_end()).unwrap();
            prop_assert_eq!(parsed.name, cmd.name);
            prop_assert_eq!(parsed.params, cmd.params);
        }
    }
}

mod message_properties {
    use super::*;
    use slipwire_proto::Message;

    proptest! {
        /// Text message payloads survive a serialize/parse cycle with
        /// arbitrary attributes.
        #[test]
        fn payload_roundtrip(
            body in "[ -~]{0,256}",
            attrs in prop::collection::vec(("X-[A-Za-z0-9][A-Za-z0-9-]{0,10}", "[!-9;-~]{1,24}"), 0..5),
        ) {
            let mut msg = Message::text(&body);
            for (k, v) in &attrs {
                msg.set_attr(k, v.trim());
            }
            let parsed = Message::parse_payload(&msg.gen_payload()).unwrap();
            prop_assert_eq!(&parsed.body[..], body.as_bytes());
            for (k, _) in &attrs {
                prop_assert!(parsed.attr(k).is_some());
            }
        }
    }
}

mod transfer_properties {
    use super::*;
    use slipwire_core::{InboundTransfer, MemoryStore, OutboundTransfer};

    proptest! {
        /// Splitting a blob and replaying the chunks in order reproduces
        /// the blob exactly, in ceil(len / chunk) chunks.
        #[test]
        fn split_reassemble_roundtrip(len in 1usize..50_000, chunk in 1u32..2048) {
            let data: Vec<u8> = (0..len).map(|i| (i % 249) as u8).collect();
            let mut out = OutboundTransfer::new(1, Box::new(MemoryStore::from_vec(data.clone())));
            let sink = MemoryStore::with_capacity(len as u64);
            let contents = sink.contents();
            let mut inbound = InboundTransfer::new(1, Box::new(sink));

            let mut chunks = 0usize;
            let mut complete = false;
            while let Some((offset, body)) = out.next_chunk(chunk).unwrap() {
                chunks += 1;
                complete = inbound.handle_chunk(offset, &body).unwrap();
            }
            prop_assert!(complete);
            prop_assert_eq!(chunks, len.div_ceil(chunk as usize));
            prop_assert_eq!(inbound.cursor(), len as u64);
            prop_assert_eq!(&*contents.borrow(), &data);
        }

        /// Cumulative acks replayed in order always drain the in-flight
        /// window and end at the total size.
        #[test]
        fn cumulative_acks_drain_window(len in 1usize..20_000, chunk in 64u32..1500) {
            let data = vec![0xA5u8; len];
            let mut out = OutboundTransfer::new(1, Box::new(MemoryStore::from_vec(data)));
            let mut sent = Vec::new();
            let mut chunk_id = 0u32;
            while let Some((offset, body)) = out.next_chunk(chunk).unwrap() {
                chunk_id += 1;
                out.record_in_flight(chunk_id, offset, body.len() as u32);
                sent.push((chunk_id, offset + body.len() as u64));
            }
            let mut last = 0u64;
            for (id, cumulative) in sent {
                prop_assert!(cumulative > last);
                last = cumulative;
                out.handle_ack(id, cumulative).unwrap();
            }
            prop_assert_eq!(last, len as u64);
            prop_assert_eq!(out.in_flight(), 0);
        }
    }
}

mod session_properties {
    use super::*;
    use slipwire_core::{MemoryStore, ProtocolConfig, SessionEvent};
    use slipwire_integration_tests::{Harness, blob};
    use std::time::Instant;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// A full relay transfer delivers the blob intact for arbitrary
        /// sizes and chunk limits.
        #[test]
        fn relayed_transfer_is_lossless(len in 1usize..6_000, chunk in 64usize..1400) {
            let now = Instant::now();
            let data = blob(len);
            let config = ProtocolConfig {
                max_chunk_size: chunk,
                ..ProtocolConfig::default()
            };
            let mut harness = Harness::new("a@example.com", "b@example.com", config);
            harness.left.request_transfer(
                now,
                "b@example.com",
                Box::new(MemoryStore::from_vec(data.clone())),
                "blob",
                2,
                None,
            );
            harness.pump(now);

            let handle = harness
                .right_events
                .iter()
                .find_map(|e| match e {
                    SessionEvent::IncomingTransfer { handle, .. } => Some(*handle),
                    _ => None,
                })
                .unwrap();
            let sink = MemoryStore::with_capacity(len as u64);
            let contents = sink.contents();
            harness.right.accept_transfer(now, handle, Box::new(sink), None).unwrap();
            harness.pump(now);

            prop_assert_eq!(&*contents.borrow(), &data);
            let completions = harness
                .left_events
                .iter()
                .chain(&harness.right_events)
                .filter(|e| matches!(e, SessionEvent::TransferComplete { .. }))
                .count();
            prop_assert_eq!(completions, 2);
        }
    }
}

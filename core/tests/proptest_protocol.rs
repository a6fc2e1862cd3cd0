use openclipboard_core::protocol::{decode_frame, encode_frame, Clip, ClipKind, SyncMessage, TrustAckPayload, TrustRequestPayload};
use openclipboard_core::trust::TrustedDevice;

use proptest::prelude::*;
use std::panic::catch_unwind;

proptest! {
    #[test]
    fn decode_frame_never_panics(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
        catch_unwind(|| {
            let _ = decode_frame(&data);
        }).expect("decode_frame panicked");
    }

    #[test]
    fn sync_message_frame_roundtrip(msg in arb_sync_message()) {
        let frame = encode_frame(&msg).expect("encode_frame");
        let decoded = decode_frame(&frame).expect("decode_frame");
        prop_assert_eq!(format!("{decoded:?}"), format!("{msg:?}"));
    }
}

fn arb_device() -> impl Strategy<Value = TrustedDevice> {
    let small_string = "[ -~]{0,64}";
    (small_string, small_string, any::<i64>()).prop_map(|(device_id, device_name, created_at)| TrustedDevice {
        device_id: device_id.clone(),
        device_name,
        public_key: vec![1, 2, 3, 4],
        multiaddrs: vec![format!("/ip4/127.0.0.1/tcp/9/p2p/{device_id}")],
        created_at,
        last_seen: None,
    })
}

fn arb_clip() -> impl Strategy<Value = Clip> {
    let small_string = "[ -~]{0,128}";
    (small_string, small_string, any::<i64>(), small_string).prop_map(|(id, content, timestamp, sender_id)| Clip {
        id,
        kind: ClipKind::Text,
        content,
        timestamp,
        sender_id,
        expires_at: None,
    })
}

fn arb_sync_message() -> impl Strategy<Value = SyncMessage> {
    let small_string = "[ -~]{0,64}";
    prop_oneof![
        (small_string, arb_clip(), any::<i64>()).prop_map(|(from, clip, sent_at)| SyncMessage::Clip { from, clip, sent_at }),
        (small_string, small_string, arb_device(), any::<i64>()).prop_map(|(from, to, payload, sent_at)| SyncMessage::TrustRequest {
            from,
            to,
            payload,
            sent_at,
            sig: vec![9, 9, 9],
        }),
        (small_string, small_string, any::<bool>(), arb_device(), arb_device(), any::<i64>()).prop_map(
            |(from, to, accepted, requester, responder, sent_at)| SyncMessage::TrustAck {
                from,
                to,
                payload: TrustAckPayload {
                    accepted,
                    request: TrustRequestPayload { from: requester.device_id.clone(), to: responder.device_id.clone(), payload: requester, sent_at, sig: vec![1] },
                    responder,
                },
                sent_at,
            }
        ),
        (small_string, proptest::collection::vec(arb_clip(), 0..5), any::<i64>())
            .prop_map(|(from, payload, sent_at)| SyncMessage::HistorySync { from, payload, sent_at }),
    ]
}

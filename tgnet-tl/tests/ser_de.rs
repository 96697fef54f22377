use tgnet_tl::mtproto::*;
use tgnet_tl::{Deserializable, Serializable};

fn roundtrip<T: Serializable + Deserializable + PartialEq + std::fmt::Debug>(value: T) {
    let bytes = value.to_bytes();
    let back = T::from_bytes(&bytes).unwrap();
    assert_eq!(back, value);
    // Byte-identical re-serialization.
    assert_eq!(back.to_bytes(), bytes);
}

// ── Primitives ────────────────────────────────────────────────────────────────

#[test]
fn roundtrip_integers() {
    for v in [0i32, -1, i32::MAX, i32::MIN, 42] {
        roundtrip(v);
    }
    for v in [0i64, -1, i64::MAX, i64::MIN, 1_234_567_890] {
        roundtrip(v);
    }
    for v in [0u64, u64::MAX] {
        roundtrip(v);
    }
}

#[test]
fn bool_uses_tl_constructors() {
    assert_eq!(true.to_bytes(), 0x997275b5u32.to_le_bytes());
    assert_eq!(false.to_bytes(), 0xbc799737u32.to_le_bytes());
}

#[test]
fn strings_are_padded_to_four_bytes() {
    for len in 0..=10usize {
        let s = "x".repeat(len);
        let bytes = s.to_bytes();
        assert_eq!(bytes.len() % 4, 0, "len {len} not aligned");
        assert_eq!(String::from_bytes(&bytes).unwrap(), s);
    }
}

#[test]
fn long_bytes_use_the_four_byte_header() {
    let v: Vec<u8> = (0..300).map(|i| i as u8).collect();
    let bytes = v.to_bytes();
    assert_eq!(bytes[0], 0xfe);
    assert_eq!(Vec::<u8>::from_bytes(&bytes).unwrap(), v);
}

// ── Handshake constructors ────────────────────────────────────────────────────

#[test]
fn roundtrip_handshake_requests() {
    roundtrip(ReqPqMulti { nonce: [7; 16] });
    roundtrip(ResPq {
        nonce: [1; 16],
        server_nonce: [2; 16],
        pq: vec![0, 1, 2, 3, 4, 5, 6, 7],
        server_public_key_fingerprints: vec![-3414540481677951611, 17],
    });
    roundtrip(ReqDhParams {
        nonce: [1; 16],
        server_nonce: [2; 16],
        p: vec![1, 2, 3, 4],
        q: vec![5, 6, 7, 8],
        public_key_fingerprint: -1,
        encrypted_data: vec![9; 256],
    });
    roundtrip(SetClientDhParams {
        nonce: [1; 16],
        server_nonce: [2; 16],
        encrypted_data: vec![0xaa; 336],
    });
}

#[test]
fn roundtrip_dh_answers() {
    roundtrip(ServerDhParams::Ok(ServerDhParamsOk {
        nonce: [1; 16],
        server_nonce: [2; 16],
        encrypted_answer: vec![3; 592],
    }));
    roundtrip(ServerDhParams::Fail(ServerDhParamsFail {
        nonce: [1; 16],
        server_nonce: [2; 16],
        new_nonce_hash: [4; 16],
    }));
    roundtrip(DhGen::Ok(DhGenOk {
        nonce: [1; 16],
        server_nonce: [2; 16],
        new_nonce_hash1: [3; 16],
    }));
    roundtrip(DhGen::Retry(DhGenRetry {
        nonce: [1; 16],
        server_nonce: [2; 16],
        new_nonce_hash2: [3; 16],
    }));
    roundtrip(DhGen::Fail(DhGenFail {
        nonce: [1; 16],
        server_nonce: [2; 16],
        new_nonce_hash3: [3; 16],
    }));
}

// ── Envelope constructors ─────────────────────────────────────────────────────

#[test]
fn roundtrip_service_messages() {
    roundtrip(MsgsAck { msg_ids: vec![1, 2, 3] });
    roundtrip(Ping { ping_id: -9 });
    roundtrip(PingDelayDisconnect { ping_id: 4, disconnect_delay: 75 });
    roundtrip(Pong { msg_id: 8, ping_id: 4 });
    roundtrip(BadServerSalt {
        bad_msg_id: 44,
        bad_msg_seqno: 3,
        error_code: 48,
        new_server_salt: 0xDEAD,
    });
    roundtrip(BadMsgNotification { bad_msg_id: 44, bad_msg_seqno: 3, error_code: 16 });
    roundtrip(NewSessionCreated { first_msg_id: 1, unique_id: 2, server_salt: 3 });
    roundtrip(MsgsStateReq { msg_ids: vec![5] });
    roundtrip(MsgResendReq { msg_ids: vec![6, 7] });
    roundtrip(DestroySession { session_id: 99 });
    roundtrip(RpcError { error_code: 420, error_message: "FLOOD_WAIT_3".into() });
    roundtrip(GzipPacked { packed_data: vec![0x1f, 0x8b, 0, 0] });
}

#[test]
fn roundtrip_rpc_result_with_raw_tail() {
    let result = RpcResult { req_msg_id: 123, result: vec![1, 2, 3, 4, 5] };
    let bytes = result.to_bytes();
    // Raw tail: no length prefix between req_msg_id and the payload.
    assert_eq!(bytes.len(), 4 + 8 + 5);
    roundtrip(result);
}

#[test]
fn roundtrip_containers() {
    let container = MsgContainer {
        messages: vec![
            ContainerMessage { msg_id: 1, seqno: 2, body: vec![1, 2, 3, 4] },
            ContainerMessage { msg_id: 5, seqno: 6, body: MsgsAck { msg_ids: vec![1] }.to_bytes() },
        ],
    };
    roundtrip(container);

    roundtrip(MsgCopy {
        orig_message: ContainerMessage { msg_id: 9, seqno: 1, body: vec![0; 8] },
    });
}

#[test]
fn roundtrip_config_sketch() {
    roundtrip(Config {
        test_mode: false,
        this_dc: 2,
        dc_options: vec![DcOption {
            flags: 0,
            id: 5,
            ip_address: "91.108.56.130".into(),
            port: 443,
        }],
    });
}

#[test]
fn dc_option_flags() {
    let opt = DcOption { flags: 0b1010, id: 4, ip_address: "::1".into(), port: 443 };
    assert!(!opt.ipv6());
    assert!(opt.media_only());
    assert!(!opt.tcpo_only());
    assert!(opt.cdn());
}

//! Two parties agreeing on keys and talking through the ratchet.

use std::thread;

use kestrel_crypto::{
    sealer, Algorithm, CryptoError, EphemeralKeypair, Identity, Ratchet, RatchetState,
};

const SESSION: &str = "0123456789abcdef0123456789abcdef";

fn pair(threshold: u64) -> (Ratchet, Ratchet) {
    let alice = EphemeralKeypair::generate();
    let bob = EphemeralKeypair::generate();

    let salt = [[1u8; 16], [2u8; 16]].concat();
    let a_shared = alice.diffie_hellman(&bob.public_bytes()).unwrap();
    let b_shared = bob.diffie_hellman(&alice.public_bytes()).unwrap();
    let a_root = sealer::derive_key(&a_shared[..], Some(salt.as_slice()), b"root").unwrap();
    let b_root = sealer::derive_key(&b_shared[..], Some(salt.as_slice()), b"root").unwrap();

    let a = Ratchet::new(
        &a_root[..],
        alice.secret().clone(),
        bob.public_bytes(),
        SESSION,
        threshold,
    )
    .unwrap();
    let b = Ratchet::new(
        &b_root[..],
        bob.secret().clone(),
        alice.public_bytes(),
        SESSION,
        threshold,
    )
    .unwrap();
    (a, b)
}

#[test]
fn test_conversation_over_key_agreement() {
    let (mut alice, mut bob) = pair(5);

    for round in 0..30u32 {
        let text = format!("ping {}", round);
        let (header, ct) = alice.encrypt(text.as_bytes()).unwrap();
        assert_eq!(bob.decrypt(&header, &ct).unwrap(), text.as_bytes());

        let text = format!("pong {}", round);
        let (header, ct) = bob.encrypt(text.as_bytes()).unwrap();
        assert_eq!(alice.decrypt(&header, &ct).unwrap(), text.as_bytes());
    }
}

#[test]
fn test_directions_run_on_separate_threads() {
    let (alice, bob) = pair(4);
    let (mut a_send, mut a_recv) = alice.split();
    let (mut b_send, mut b_recv) = bob.split();

    let a_out: Vec<_> = (0..40u32)
        .map(|i| a_send.encrypt(&i.to_be_bytes()).unwrap())
        .collect();
    let b_out: Vec<_> = (0..40u32)
        .map(|i| b_send.encrypt(&i.to_be_bytes()).unwrap())
        .collect();

    let at_bob = thread::spawn(move || {
        for (i, (header, ct)) in a_out.iter().enumerate() {
            assert_eq!(b_recv.decrypt(header, ct).unwrap(), (i as u32).to_be_bytes());
        }
    });
    let at_alice = thread::spawn(move || {
        for (i, (header, ct)) in b_out.iter().enumerate() {
            assert_eq!(a_recv.decrypt(header, ct).unwrap(), (i as u32).to_be_bytes());
        }
    });
    at_bob.join().unwrap();
    at_alice.join().unwrap();
}

#[test]
fn test_both_sides_resume_from_json() {
    let (mut alice, mut bob) = pair(3);
    for _ in 0..7 {
        let (h, ct) = alice.encrypt(b"before").unwrap();
        bob.decrypt(&h, &ct).unwrap();
        let (h, ct) = bob.encrypt(b"before").unwrap();
        alice.decrypt(&h, &ct).unwrap();
    }

    let a_json = alice.save().to_json().unwrap();
    let b_json = bob.save().to_json().unwrap();
    drop(alice);
    drop(bob);

    let mut alice = Ratchet::restore(&RatchetState::from_json(&a_json).unwrap()).unwrap();
    let mut bob = Ratchet::restore(&RatchetState::from_json(&b_json).unwrap()).unwrap();

    let (h, ct) = alice.encrypt(b"after").unwrap();
    assert_eq!(bob.decrypt(&h, &ct).unwrap(), b"after");
    let (h, ct) = bob.encrypt(b"after").unwrap();
    assert_eq!(alice.decrypt(&h, &ct).unwrap(), b"after");

    // Replaying the same frame is refused.
    assert!(matches!(
        alice.decrypt(&h, &ct),
        Err(CryptoError::StaleMessage(0))
    ));
}

#[test]
fn test_signed_then_sealed() {
    let identity = Identity::generate(Algorithm::Ed25519);
    let key = sealer::Sealer::new(b"shared", None, b"test").unwrap();

    let message = b"signed payload";
    let signature = identity.sign(message);
    let sealed = key.seal(message, &signature).unwrap();

    let opened = key.open(&sealed, &signature).unwrap();
    assert!(identity.public_key().verify(&opened, &signature));
    assert!(key.open(&sealed, b"other aad").is_err());
}

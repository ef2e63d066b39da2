//! Human-comparable renderings of public keys.
//!
//! Two people compare these out of band before trusting a new peer.

use qrcode::render::unicode::Dense1x2;
use qrcode::{EcLevel, QrCode};
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};

use crate::identity::PeerId;
use crate::CryptoError;

const EMOJI: [&str; 64] = [
    "🐶", "🐱", "🦁", "🐹", "🐰", "🦊", "🐻", "🐼",
    "🐸", "🐵", "🦉", "🐢", "🐙", "🦋", "🐝", "🐳",
    "🌸", "🌼", "🌹", "🌺", "🍁", "🌳", "🌵", "🍄",
    "🍎", "🍌", "🍇", "🍓", "🍒", "🍕", "🍔", "🍟",
    "☕", "🍦", "🥕", "🌙", "⭐", "☁", "❄", "🌈",
    "💡", "🎹", "💎", "📷", "🏀", "🎮", "🎲", "🎩",
    "🎁", "⏰", "🧲", "🔑", "🚗", "🚀", "⛵", "🚲",
    "✨", "🔥", "🎉", "🎶", "🔒", "📌", "⚓", "🧭",
];

const ADJECTIVES: [&str; 16] = [
    "amber", "brisk", "calm", "dusky", "eager", "fleet", "gentle", "hollow",
    "icy", "jolly", "keen", "lucid", "mellow", "nimble", "quiet", "rustic",
];

const NOUNS: [&str; 16] = [
    "badger", "comet", "delta", "ember", "falcon", "glacier", "harbor", "island",
    "juniper", "lantern", "meadow", "nebula", "orchid", "pebble", "raven", "summit",
];

/// Eight symbols derived from the SHA-256 of `key`.
pub fn emoji(key: &[u8]) -> Vec<&'static str> {
    let digest = Sha256::digest(key);
    digest
        .chunks_exact(4)
        .take(8)
        .map(|chunk| {
            let n = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            EMOJI[(n % EMOJI.len() as u32) as usize]
        })
        .collect()
}

/// Upper-case hex pairs separated by colons, e.g. `0A:FF:12`.
pub fn hex(key: &[u8]) -> String {
    key.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Terminal QR code of the peer id for `key`, two modules per character
/// row, for scanning from another device instead of reading digits aloud.
pub fn qr(key: &[u8]) -> Result<String, CryptoError> {
    let peer_id = PeerId::from_bytes(key);
    let code = QrCode::with_error_correction_level(peer_id.as_str(), EcLevel::L)
        .map_err(|e| CryptoError::Fingerprint(e.to_string()))?;
    Ok(code.render::<Dense1x2>().quiet_zone(true).build())
}

/// Random "adjective noun" display name.
pub fn pseudonym() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("raven");
    format!("{} {}", adjective, noun)
}

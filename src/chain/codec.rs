//! Event topics and call data layout.
//!
//! Topics and selectors are derived from the event or function signature:
//! `topic = sha256(signature)`, `selector = sha256(signature)[..4]`.
//! Arguments are 32-byte big-endian words.
//!
//! ```text
//! SubscriptionCreated   topics: [topic, handle, owner]          data: -
//! RandomnessRequested   topics: [topic, sequence, request_id]   data: commitment
//! createSubscription    selector || owner
//! requestRandomness     selector || handle || consumer || request_id || commitment
//! ```

use super::{LogEntry, SubmitParams};
use crate::types::{Address, Hash32, RequestId, ResourceHandle, SequenceNumber};
use sha2::{Digest, Sha256};

pub const SUBSCRIPTION_CREATED: &str = "SubscriptionCreated(uint64,address)";
pub const RANDOMNESS_REQUESTED: &str = "RandomnessRequested(uint64,bytes32,bytes32)";
pub const CREATE_SUBSCRIPTION: &str = "createSubscription(address)";
pub const REQUEST_RANDOMNESS: &str = "requestRandomness(uint64,address,bytes32,bytes32)";

pub fn topic(signature: &str) -> Hash32 {
    Sha256::digest(signature.as_bytes()).into()
}

pub fn selector(signature: &str) -> [u8; 4] {
    let digest = topic(signature);
    [digest[0], digest[1], digest[2], digest[3]]
}

pub fn u64_word(value: u64) -> Hash32 {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Decode a word that must hold a `u64`; wider values are rejected.
pub fn word_u64(word: &[u8]) -> Option<u64> {
    if word.len() != 32 || word[..24].iter().any(|b| *b != 0) {
        return None;
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&word[24..]);
    Some(u64::from_be_bytes(bytes))
}

fn word_at(data: &[u8], index: usize) -> Option<Hash32> {
    let start = index.checked_mul(32)?;
    let slice = data.get(start..start + 32)?;
    slice.try_into().ok()
}

pub fn subscription_created_log(emitter: Address, handle: ResourceHandle, owner: &Address) -> LogEntry {
    LogEntry {
        emitter,
        topics: vec![topic(SUBSCRIPTION_CREATED), u64_word(handle), owner.to_word()],
        data: Vec::new(),
    }
}

/// `(handle, owner)` if `log` is a well-formed `SubscriptionCreated` event.
pub fn decode_subscription_created(log: &LogEntry) -> Option<(ResourceHandle, Address)> {
    if log.topics.len() != 3 || log.topics[0] != topic(SUBSCRIPTION_CREATED) {
        return None;
    }
    let handle = word_u64(&log.topics[1])?;
    Some((handle, Address::from_word(&log.topics[2])))
}

pub fn randomness_requested_log(
    emitter: Address,
    sequence: SequenceNumber,
    request_id: &RequestId,
    commitment: &Hash32,
) -> LogEntry {
    LogEntry {
        emitter,
        topics: vec![topic(RANDOMNESS_REQUESTED), u64_word(sequence), request_id.to_word()],
        data: commitment.to_vec(),
    }
}

/// `(sequence, request_id, commitment)` of a `RandomnessRequested` event.
pub fn decode_randomness_requested(log: &LogEntry) -> Option<(SequenceNumber, RequestId, Hash32)> {
    if log.topics.len() != 3 || log.topics[0] != topic(RANDOMNESS_REQUESTED) {
        return None;
    }
    let sequence = word_u64(&log.topics[1])?;
    let request_id = RequestId::from_digest(&log.topics[2]);
    let commitment = word_at(&log.data, 0)?;
    Some((sequence, request_id, commitment))
}

/// A decoded call, as understood by the simulation path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedCall {
    CreateSubscription { owner: Address },
    RequestRandomness(SubmitParams),
}

pub fn encode_create_subscription(owner: &Address) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32);
    data.extend_from_slice(&selector(CREATE_SUBSCRIPTION));
    data.extend_from_slice(&owner.to_word());
    data
}

pub fn encode_request_randomness(params: &SubmitParams) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 * 4);
    data.extend_from_slice(&selector(REQUEST_RANDOMNESS));
    data.extend_from_slice(&u64_word(params.handle));
    data.extend_from_slice(&params.consumer.to_word());
    data.extend_from_slice(&params.request_id.to_word());
    data.extend_from_slice(&params.commitment);
    data
}

pub fn decode_call(data: &[u8]) -> Option<DecodedCall> {
    if data.len() < 4 {
        return None;
    }
    let (head, args) = data.split_at(4);
    if head == selector(CREATE_SUBSCRIPTION) {
        let owner = Address::from_word(&word_at(args, 0)?);
        return Some(DecodedCall::CreateSubscription { owner });
    }
    if head == selector(REQUEST_RANDOMNESS) {
        return Some(DecodedCall::RequestRandomness(SubmitParams {
            handle: word_u64(&word_at(args, 0)?)?,
            consumer: Address::from_word(&word_at(args, 1)?),
            request_id: RequestId::from_digest(&word_at(args, 2)?),
            commitment: word_at(args, 3)?,
        }));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> Address {
        Address::new("0x00000000000000000000000000000000000000aa")
    }

    #[test]
    fn test_subscription_created_decodes() {
        let log = subscription_created_log(Address::new("0x01"), 42, &owner());
        assert_eq!(decode_subscription_created(&log), Some((42, owner())));
    }

    #[test]
    fn test_foreign_topic_is_ignored() {
        let mut log = subscription_created_log(Address::new("0x01"), 42, &owner());
        log.topics[0] = topic("Transfer(address,address,uint256)");
        assert_eq!(decode_subscription_created(&log), None);
    }

    #[test]
    fn test_oversized_handle_is_rejected() {
        let mut log = subscription_created_log(Address::new("0x01"), 42, &owner());
        log.topics[1] = [0xff; 32];
        assert_eq!(decode_subscription_created(&log), None);
    }

    #[test]
    fn test_randomness_requested_decodes() {
        let id = RequestId::from_digest(&[5u8; 32]);
        let log = randomness_requested_log(Address::new("0x02"), 9, &id, &[6u8; 32]);
        assert_eq!(decode_randomness_requested(&log), Some((9, id, [6u8; 32])));
    }

    #[test]
    fn test_calls_decode() {
        let create = encode_create_subscription(&owner());
        assert_eq!(decode_call(&create), Some(DecodedCall::CreateSubscription { owner: owner() }));

        let params = SubmitParams {
            handle: 3,
            consumer: Address::new("0x00000000000000000000000000000000000000cc"),
            request_id: RequestId::from_digest(&[1u8; 32]),
            commitment: [2u8; 32],
        };
        let submit = encode_request_randomness(&params);
        assert_eq!(decode_call(&submit), Some(DecodedCall::RequestRandomness(params)));

        assert_eq!(decode_call(&[0u8; 3]), None);
        assert_eq!(decode_call(&[0u8; 40]), None);
    }
}

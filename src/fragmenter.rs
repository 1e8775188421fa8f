//! Fragmentation of messages over a fixed-MTU BLE link.
//!
//! Each fragment starts with a header byte: bits 0-3 carry a counter that
//! wraps mod 16, `0x40` marks the last fragment and `0x80` the first. The
//! first fragment follows its header with the total message length as a
//! LEB128 varint. A fragment never exceeds `mtu - 3` bytes.

use tracing::{debug, instrument, trace, warn};

use crate::error::FragmentError;

/// Largest message the codec accepts, in bytes.
pub const MAX_MESSAGE_LEN: usize = 1024;

const FIRST_FLAG: u8 = 0x80;
const LAST_FLAG: u8 = 0x40;
const COUNTER_MASK: u8 = 0x0F;
const MTU_OVERHEAD: usize = 3;
const MAX_VARINT_LEN: usize = 10;

/// Encodes `value` as a little-endian base-128 varint.
///
/// ```
/// assert_eq!(vec![0xAC, 0x02], taglink::encode_varint(300));
/// ```
#[must_use]
pub fn encode_varint(mut value: u64) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(MAX_VARINT_LEN);
    loop {
        let low_bits = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            encoded.push(low_bits);
            return encoded;
        }
        encoded.push(low_bits | 0x80);
    }
}

/// Decodes a varint from the front of `bytes`.
///
/// Returns the value and the number of bytes consumed, or `None` when the
/// varint is truncated or longer than ten bytes.
#[must_use]
pub fn decode_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (index, byte) in bytes.iter().take(MAX_VARINT_LEN).enumerate() {
        let shift = 7 * index as u32;
        let bits = u64::from(byte & 0x7F);
        if shift == 63 && bits > 1 {
            return None;
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Some((value, index + 1));
        }
    }
    None
}

/// Splits outgoing messages into fragments and reassembles incoming ones.
///
/// Encoding is stateless per call. Decoding tracks one in-flight message.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Fragmenter {
    expected_counter: u8,
    expected_len: Option<usize>,
    buffer: Vec<u8>,
}

impl Fragmenter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits `message` into fragments no longer than `mtu - 3` bytes.
    ///
    /// ```
    /// let fragments = taglink::Fragmenter::fragment(&[1, 2, 3], 23)?;
    /// assert_eq!(vec![vec![0xC0, 0x03, 1, 2, 3]], fragments);
    /// # Ok::<(), taglink::FragmentError>(())
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error when the message exceeds [`MAX_MESSAGE_LEN`] or the
    /// MTU cannot fit a header, the length prefix and one payload byte.
    #[instrument(skip(message), level = "trace", fields(message_len = message.len()))]
    pub fn fragment(message: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>, FragmentError> {
        if message.len() > MAX_MESSAGE_LEN {
            let error = FragmentError::MessageTooLarge { len: message.len() };
            warn!(%error, "refusing to fragment message");
            return Err(error);
        }

        let max_fragment_len = mtu.saturating_sub(MTU_OVERHEAD);
        let length_prefix = encode_varint(message.len() as u64);
        if max_fragment_len < 1 + length_prefix.len() + 1 {
            return Err(FragmentError::MtuTooSmall { mtu });
        }

        let mut fragments = Vec::new();
        let mut counter = 0u8;
        let mut offset = 0usize;
        loop {
            let first = fragments.is_empty();
            let mut fragment = Vec::with_capacity(max_fragment_len);
            fragment.push(0);
            if first {
                fragment.extend_from_slice(&length_prefix);
            }

            let end = (offset + max_fragment_len - fragment.len()).min(message.len());
            fragment.extend_from_slice(&message[offset..end]);
            offset = end;

            let last = offset == message.len();
            fragment[0] = header(counter, first, last);
            trace!(counter, first, last, len = fragment.len(), "built fragment");
            fragments.push(fragment);

            if last {
                return Ok(fragments);
            }
            counter = (counter + 1) & COUNTER_MASK;
        }
    }

    /// Feeds one incoming fragment.
    ///
    /// Returns `Ok(Some(message))` when a `LAST` fragment completes a message
    /// and `Ok(None)` while more fragments are expected.
    ///
    /// # Errors
    ///
    /// Returns an error, after logging it and resetting the decoder, when the
    /// fragment is out of sequence, malformed, or completes a message whose
    /// length differs from the announced one. The in-flight message is
    /// dropped; the next `FIRST` fragment starts over.
    #[instrument(skip(self, fragment), level = "trace", fields(payload = %hex::encode(fragment)))]
    pub fn decode_fragment(&mut self, fragment: &[u8]) -> Result<Option<Vec<u8>>, FragmentError> {
        let Some((&header, body)) = fragment.split_first() else {
            return self.fail(FragmentError::EmptyFragment);
        };
        let counter = header & COUNTER_MASK;

        let payload = if header & FIRST_FLAG != 0 {
            let Some((announced, consumed)) = decode_varint(body) else {
                return self.fail(FragmentError::MalformedLength);
            };
            let Ok(announced) = usize::try_from(announced) else {
                return self.fail(FragmentError::MalformedLength);
            };
            if announced > MAX_MESSAGE_LEN {
                return self.fail(FragmentError::MessageTooLarge { len: announced });
            }
            if self.expected_len.is_some() {
                debug!(
                    discarded = self.buffer.len(),
                    "new first fragment replaces partial message"
                );
            }
            self.expected_len = Some(announced);
            self.buffer.clear();
            &body[consumed..]
        } else {
            if self.expected_len.is_none() {
                return self.fail(FragmentError::NoMessageInProgress { counter });
            }
            if counter != self.expected_counter {
                return self.fail(FragmentError::CounterMismatch {
                    expected: self.expected_counter,
                    actual: counter,
                });
            }
            body
        };

        self.expected_counter = (counter + 1) & COUNTER_MASK;
        self.buffer.extend_from_slice(payload);
        if header & LAST_FLAG == 0 {
            return Ok(None);
        }

        let expected = self.expected_len.unwrap_or_default();
        let message = std::mem::take(&mut self.buffer);
        self.reset();
        if message.len() != expected {
            let error = FragmentError::LengthMismatch {
                expected,
                actual: message.len(),
            };
            warn!(%error, "dropping reassembled message");
            return Err(error);
        }

        trace!(len = message.len(), "reassembled message");
        Ok(Some(message))
    }

    /// Discards any partially reassembled message.
    pub fn reset(&mut self) {
        self.expected_counter = 0;
        self.expected_len = None;
        self.buffer.clear();
    }

    fn fail(&mut self, error: FragmentError) -> Result<Option<Vec<u8>>, FragmentError> {
        warn!(%error, "dropping fragmented message");
        self.reset();
        Err(error)
    }
}

fn header(counter: u8, first: bool, last: bool) -> u8 {
    let mut header = counter & COUNTER_MASK;
    if first {
        header |= FIRST_FLAG;
    }
    if last {
        header |= LAST_FLAG;
    }
    header
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn message(len: usize) -> Vec<u8> {
        (0..len).map(|index| (index * 31 % 251) as u8).collect()
    }

    fn reassemble(decoder: &mut Fragmenter, fragments: &[Vec<u8>]) -> Option<Vec<u8>> {
        let mut completed = None;
        for (index, fragment) in fragments.iter().enumerate() {
            let decoded = decoder
                .decode_fragment(fragment)
                .expect("in-order fragments should decode");
            if index + 1 < fragments.len() {
                assert_eq!(None, decoded, "only the last fragment completes a message");
            }
            completed = decoded;
        }
        completed
    }

    #[rstest]
    fn every_message_size_round_trips(#[values(20, 23, 185)] mtu: usize) {
        let mut decoder = Fragmenter::new();
        for len in 0..=MAX_MESSAGE_LEN {
            let original = message(len);
            let fragments = Fragmenter::fragment(&original, mtu).expect("message should fragment");

            assert!(fragments.iter().all(|fragment| fragment.len() <= mtu - 3));
            assert_eq!(Some(original), reassemble(&mut decoder, &fragments));
        }
    }

    #[test]
    fn fragments_are_wire_exact() {
        let fragments = Fragmenter::fragment(&message(20), 20).expect("message should fragment");
        let rendered = fragments
            .iter()
            .map(hex::encode)
            .collect::<Vec<_>>()
            .join(" ");

        assert_snapshot!(rendered, @"8014001f3e5d7c9bbad9f81c3b5a7998b7 41d6f5193857");
    }

    #[test]
    fn counter_wraps_after_sixteen_fragments() {
        let fragments = Fragmenter::fragment(&message(MAX_MESSAGE_LEN), 20)
            .expect("maximum message should fragment");

        assert!(fragments.len() > 16);
        for (index, fragment) in fragments.iter().enumerate() {
            assert_eq!((index % 16) as u8, fragment[0] & COUNTER_MASK);
        }
        assert_eq!(FIRST_FLAG, fragments[0][0] & (FIRST_FLAG | LAST_FLAG));
        assert_eq!(
            LAST_FLAG,
            fragments[fragments.len() - 1][0] & (FIRST_FLAG | LAST_FLAG)
        );
    }

    #[test]
    fn empty_message_is_a_single_first_and_last_fragment() {
        let fragments = Fragmenter::fragment(&[], 20).expect("empty message should fragment");
        assert_eq!(vec![vec![0xC0, 0x00]], fragments);

        let mut decoder = Fragmenter::new();
        assert_eq!(Some(Vec::new()), reassemble(&mut decoder, &fragments));
    }

    #[test]
    fn oversized_message_is_rejected() {
        let result = Fragmenter::fragment(&message(MAX_MESSAGE_LEN + 1), 185);
        assert_matches!(result, Err(FragmentError::MessageTooLarge { len: 1025 }));
    }

    #[rstest]
    #[case(0)]
    #[case(5)]
    fn tiny_mtu_is_rejected(#[case] mtu: usize) {
        let result = Fragmenter::fragment(&message(4), mtu);
        assert_matches!(result, Err(FragmentError::MtuTooSmall { .. }));
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(127)]
    #[case(128)]
    #[case(300)]
    #[case(16_384)]
    #[case(u64::from(u32::MAX))]
    #[case(u64::MAX)]
    fn varint_round_trips(#[case] value: u64) {
        let encoded = encode_varint(value);
        assert_eq!(Some((value, encoded.len())), decode_varint(&encoded));
    }

    #[rstest]
    #[case(&[0x80])]
    #[case(&[])]
    #[case(&[0xFF; 11])]
    #[case(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x02])]
    fn varint_rejects_truncated_or_overlong_input(#[case] bytes: &[u8]) {
        assert_eq!(None, decode_varint(bytes));
    }

    #[test]
    fn counter_mismatch_resets_decoder() {
        let original = message(40);
        let fragments = Fragmenter::fragment(&original, 20).expect("message should fragment");
        assert_eq!(3, fragments.len());

        let mut decoder = Fragmenter::new();
        assert_eq!(Ok(None), decoder.decode_fragment(&fragments[0]));
        assert_eq!(
            Err(FragmentError::CounterMismatch {
                expected: 1,
                actual: 2,
            }),
            decoder.decode_fragment(&fragments[2])
        );
        assert_eq!(Fragmenter::new(), decoder);

        assert_eq!(Some(original), reassemble(&mut decoder, &fragments));
    }

    #[test]
    fn continuation_without_first_fragment_is_dropped() {
        let mut decoder = Fragmenter::new();
        let result = decoder.decode_fragment(&[0x40, 0x01]);
        assert_matches!(result, Err(FragmentError::NoMessageInProgress { counter: 0 }));
    }

    #[test]
    fn length_mismatch_drops_message_and_resets() {
        let mut decoder = Fragmenter::new();
        let result = decoder.decode_fragment(&[0xC0, 0x05, 0x01, 0x02]);

        assert_eq!(
            Err(FragmentError::LengthMismatch {
                expected: 5,
                actual: 2,
            }),
            result
        );
        assert_eq!(Fragmenter::new(), decoder);
    }

    #[test]
    fn new_first_fragment_discards_partial_message() {
        let first = Fragmenter::fragment(&message(40), 20).expect("message should fragment");
        let second = Fragmenter::fragment(&[9, 8, 7], 20).expect("message should fragment");

        let mut decoder = Fragmenter::new();
        assert_eq!(Ok(None), decoder.decode_fragment(&first[0]));
        assert_eq!(Some(vec![9, 8, 7]), reassemble(&mut decoder, &second));
    }

    #[rstest]
    #[case(&[], FragmentError::EmptyFragment)]
    #[case(&[0x80, 0x80], FragmentError::MalformedLength)]
    #[case(&[0xC0, 0x81, 0x08], FragmentError::MessageTooLarge { len: 1025 })]
    fn malformed_fragments_are_rejected(#[case] fragment: &[u8], #[case] expected: FragmentError) {
        let mut decoder = Fragmenter::new();
        assert_eq!(Err(expected), decoder.decode_fragment(fragment));
    }
}

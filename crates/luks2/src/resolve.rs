// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Cross-entity resolution
//!
//! Unlocking a keyslot needs three objects: the keyslot itself, the digest
//! that will verify the key it produces, and the segment that digest unlocks.
//! The metadata links them by index bitmaps on the digest, so resolution is
//! keyslot → first digest referencing it → first segment that digest
//! references.
//!
//! A parse failure anywhere in the scan aborts this resolution; the trial
//! loop treats that as a problem with the current keyslot only and moves on
//! to the next.

use snafu::{OptionExt, ResultExt};

use crate::metadata::{Digest, Keyslot, Metadata, Segment};
use crate::{
    Error, InvalidDigestSnafu, InvalidKeyslotSnafu, InvalidSegmentSnafu, MissingDigestSnafu, MissingKeyslotSnafu,
    MissingSegmentSnafu,
};

/// A keyslot with its verification digest and payload segment
pub struct Resolved {
    /// The keyslot's own index (its JSON object key)
    pub slot_index: u32,
    pub keyslot: Keyslot,
    pub digest: Digest,
    pub segment: Segment,
}

/// Resolve the keyslot at `position` (ascending index order) together with
/// the digest that references it and the segment that digest references
pub fn get_keyslot(metadata: &Metadata, position: usize) -> Result<Resolved, Error> {
    let (&slot_index, raw) = metadata
        .keyslots
        .iter()
        .nth(position)
        .context(MissingKeyslotSnafu { position })?;
    let keyslot: Keyslot =
        serde_json::from_value(raw.clone()).context(InvalidKeyslotSnafu { index: slot_index })?;

    let mut matched = None;
    for (&index, raw) in &metadata.digests {
        let digest: Digest = serde_json::from_value(raw.clone()).context(InvalidDigestSnafu { index })?;
        if digest.keyslots.contains(slot_index) {
            matched = Some((index, digest));
            break;
        }
    }
    let (digest_index, digest) = matched.context(MissingDigestSnafu { keyslot: slot_index })?;

    for (&index, raw) in &metadata.segments {
        let segment: Segment = serde_json::from_value(raw.clone()).context(InvalidSegmentSnafu { index })?;
        if digest.segments.contains(index) {
            return Ok(Resolved {
                slot_index,
                keyslot,
                digest,
                segment,
            });
        }
    }

    MissingSegmentSnafu { digest: digest_index }.fail()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_log::test;

    fn metadata(value: serde_json::Value) -> Metadata {
        serde_json::from_value(value).unwrap()
    }

    fn slot() -> serde_json::Value {
        json!({
            "type": "luks2",
            "key_size": 64,
            "af": { "type": "luks1", "stripes": 4000, "hash": "sha256" },
            "area": {
                "type": "raw", "offset": "32768", "size": "258048",
                "encryption": "aes-xts-plain64", "key_size": 64
            },
            "kdf": { "type": "pbkdf2", "hash": "sha256", "iterations": 1000, "salt": "c2FsdA==" }
        })
    }

    fn segment() -> serde_json::Value {
        json!({
            "type": "crypt", "offset": "16777216", "size": "dynamic",
            "encryption": "aes-xts-plain64", "sector_size": 512
        })
    }

    fn digest(keyslots: Vec<&str>, segments: Vec<&str>) -> serde_json::Value {
        json!({
            "type": "pbkdf2", "keyslots": keyslots, "segments": segments,
            "hash": "sha256", "iterations": 1000, "salt": "c2FsdA==", "digest": "c2FsdA=="
        })
    }

    #[test]
    fn resolves_through_matching_digest() {
        let metadata = metadata(json!({
            "keyslots": { "0": slot(), "4": slot() },
            "segments": { "0": segment() },
            // First digest covers a different slot; the second matches
            "digests": { "0": digest(vec!["0"], vec!["0"]), "1": digest(vec!["4"], vec!["0"]) }
        }));

        let resolved = get_keyslot(&metadata, 1).unwrap();
        assert_eq!(resolved.slot_index, 4);
        assert!(resolved.digest.keyslots.contains(4));
    }

    #[test]
    fn unreferenced_keyslot_has_no_digest() {
        let metadata = metadata(json!({
            "keyslots": { "0": slot(), "1": slot() },
            "segments": { "0": segment() },
            "digests": { "0": digest(vec!["0"], vec!["0"]) }
        }));

        let err = get_keyslot(&metadata, 1).unwrap_err();
        assert!(matches!(err, Error::MissingDigest { keyslot: 1 }));
    }

    #[test]
    fn digest_without_segment_fails() {
        let metadata = metadata(json!({
            "keyslots": { "0": slot() },
            "segments": { "1": segment() },
            "digests": { "0": digest(vec!["0"], vec!["0"]) }
        }));

        let err = get_keyslot(&metadata, 0).unwrap_err();
        assert!(matches!(err, Error::MissingSegment { digest: 0 }));
    }

    #[test]
    fn malformed_digest_aborts_resolution() {
        let metadata = metadata(json!({
            "keyslots": { "0": slot() },
            "segments": { "0": segment() },
            // The broken digest sits before the matching one in scan order
            "digests": { "0": { "type": "pbkdf2" }, "1": digest(vec!["0"], vec!["0"]) }
        }));

        let err = get_keyslot(&metadata, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidDigest { index: 0, .. }));
    }

    #[test]
    fn position_past_end_fails() {
        let metadata = metadata(json!({
            "keyslots": {}, "segments": {}, "digests": {}
        }));
        assert!(matches!(
            get_keyslot(&metadata, 0).unwrap_err(),
            Error::MissingKeyslot { position: 0 }
        ));
    }
}

//! Property tests for the wire primitives and the bundle codec law.

use bpa_proto::bundle::{Bundle, BundleFlags};
use bpa_proto::cbor::{CborReader, CborWriter};
use bpa_proto::{codec, sdnv};
use proptest::prelude::*;

proptest! {
    #[test]
    fn sdnv_round_trip(value: u64) {
        let mut buf = Vec::new();
        sdnv::encode(value, &mut buf);
        prop_assert_eq!(buf.len(), sdnv::encoded_len(value));
        let (decoded, used) = sdnv::decode(&buf).unwrap();
        prop_assert_eq!(decoded, value);
        prop_assert_eq!(used, buf.len());
    }

    #[test]
    fn cbor_uint_round_trip(value: u64) {
        let mut w = CborWriter::new();
        w.uint(value);
        let bytes = w.into_bytes();
        prop_assert_eq!(CborReader::new(&bytes).uint().unwrap(), value);
    }

    #[test]
    fn cbor_bytes_round_trip(data: Vec<u8>) {
        let mut w = CborWriter::new();
        w.bytes(&data);
        let bytes = w.into_bytes();
        prop_assert_eq!(CborReader::new(&bytes).bytes().unwrap(), data.as_slice());
    }

    /// `parse(serialize(b)) == b` across generated model bundles.
    #[test]
    fn bundle_codec_law(
        payload in prop::collection::vec(any::<u8>(), 0..512),
        creation_s in 1u64..1_000_000,
        seq in 0u64..10_000,
        lifetime_s in 1u64..100_000,
        report_delivery: bool,
        // offset + payload length stays below the total ADU length.
        fragment in proptest::option::of((0u64..400, 1_000u64..10_000)),
    ) {
        let mut flags = BundleFlags::empty();
        if report_delivery {
            flags |= BundleFlags::REPORT_DELIVERY;
        }
        let mut bundle = Bundle::new_v7(
            "dtn://src/app",
            "dtn://dst/app",
            creation_s * 1000,
            seq,
            lifetime_s * 1000,
            flags,
            payload,
        )
        .unwrap();
        if let Some((offset, total)) = fragment {
            bundle.proc_flags |= BundleFlags::IS_FRAGMENT;
            bundle.fragment_offset = offset;
            bundle.total_adu_length = total;
        }
        let bytes = codec::serialize_to_vec(&bundle).unwrap();
        let (parsed, consumed) = codec::parse(&bytes).unwrap();
        prop_assert_eq!(consumed, bytes.len());
        prop_assert_eq!(parsed, bundle);
    }
}

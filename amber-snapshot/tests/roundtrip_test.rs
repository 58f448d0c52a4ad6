// amber-snapshot - Image round-trip and corruption tests
// Copyright (c) 2025 Tom Waddington. MIT licensed.

use amber_ast::{AstBuilder, Program};
use amber_il::Value;
use amber_snapshot::{
    ComponentKind, InvalidBytecode, Region, crc16_ccitt, decode_snapshot, encode_snapshot,
};
use amber_vm::Vm;

/// `let s = "hello"; vmExport(0, () => s);` - one exported function, one
/// global `let` (captured, so it gets a global slot), one string literal.
fn scenario_program() -> Program {
    let mut b = AstBuilder::new();
    let hello = b.string("hello");
    let decl = b.let_("s", Some(hello));
    let zero = b.number(0.0);
    let s_ref = b.id_expr("s");
    let arrow = b.arrow(&[], s_ref);
    let export = b.call_name("vmExport", vec![zero, arrow]);
    let stmt = b.expr_stmt(export);
    b.program("scenario.js", vec![decl, stmt])
}

fn scenario_snapshot() -> Vec<u8> {
    let mut vm = Vm::new();
    vm.evaluate_module(&scenario_program()).expect("evaluate");
    let info = vm.create_snapshot_info().expect("snapshot info");
    encode_snapshot(&info).expect("encode")
}

#[test]
fn the_crc_field_validates() {
    let bytes = scenario_snapshot();
    let stored = u16::from_le_bytes([bytes[4], bytes[5]]);
    assert_eq!(stored, crc16_ccitt(&bytes[6..]));
}

#[test]
fn the_mapping_accounts_for_every_byte() {
    let bytes = scenario_snapshot();
    let (_, mapping) = decode_snapshot(&bytes).expect("decode");
    assert!(!mapping.has_overlaps());
    assert_eq!(mapping.reassemble(), bytes);
}

#[test]
fn the_mapping_has_the_expected_regions() {
    let bytes = scenario_snapshot();
    let (_, mapping) = decode_snapshot(&bytes).expect("decode");

    assert!(mapping.region(Region::Header).next().is_some());

    // The globals region labels slots positionally.
    let global_labels: Vec<&str> = mapping
        .region(Region::Globals)
        .map(|c| c.label.as_str())
        .collect();
    assert!(global_labels.contains(&"[0]"));

    // The string literal is interned exactly once.
    let strings: Vec<&str> = mapping
        .region(Region::StringTable)
        .map(|c| c.label.as_str())
        .collect();
    assert!(strings.iter().any(|l| l.contains("hello")), "{:?}", strings);

    // Exactly one GC allocation: the module's namespace object.
    let heap_allocations = mapping
        .region(Region::GcHeap)
        .filter(|c| c.kind == ComponentKind::Allocation)
        .count();
    assert_eq!(heap_allocations, 1);
}

#[test]
fn decoded_state_matches_the_vm_state() {
    let mut vm = Vm::new();
    vm.evaluate_module(&scenario_program()).expect("evaluate");
    let info = vm.create_snapshot_info().expect("snapshot info");
    let bytes = encode_snapshot(&info).expect("encode");
    let (decoded, _) = decode_snapshot(&bytes).expect("decode");

    assert_eq!(decoded.globals.len(), info.globals.len());
    assert_eq!(decoded.exports.len(), 1);
    // The entry function is unreachable from the final state and is not
    // carried into the image; the exported arrow is.
    assert_eq!(decoded.functions.len(), 1);
    // The captured global carries the string value.
    assert!(
        decoded
            .globals
            .iter()
            .any(|(_, v)| *v == Value::string("hello"))
    );
}

#[test]
fn reencoding_a_decoded_image_still_decodes() {
    let bytes = scenario_snapshot();
    let (decoded, _) = decode_snapshot(&bytes).expect("decode");
    let again = encode_snapshot(&decoded).expect("re-encode");
    let (decoded_again, mapping) = decode_snapshot(&again).expect("re-decode");
    assert_eq!(mapping.reassemble(), again);
    assert_eq!(decoded_again.globals.len(), decoded.globals.len());
    assert_eq!(decoded_again.functions.len(), decoded.functions.len());
}

#[test]
fn corrupting_covered_bytes_fails_the_crc() {
    let bytes = scenario_snapshot();
    for offset in [6, 13, 20, bytes.len() / 2, bytes.len() - 1] {
        let mut corrupted = bytes.clone();
        corrupted[offset] ^= 0x01;
        match decode_snapshot(&corrupted) {
            Err(InvalidBytecode::CrcMismatch { .. }) => {}
            other => panic!(
                "flip at {} should fail the CRC, got {:?}",
                offset,
                other.err()
            ),
        }
    }
}

#[test]
fn size_mismatch_is_detected_before_anything_else() {
    let bytes = scenario_snapshot();

    // Patching the declared size field.
    let mut corrupted = bytes.clone();
    corrupted[2] ^= 0xFF;
    assert!(matches!(
        decode_snapshot(&corrupted),
        Err(InvalidBytecode::SizeMismatch { .. })
    ));

    // Truncating the file.
    let truncated = &bytes[..bytes.len() - 2];
    assert!(matches!(
        decode_snapshot(truncated),
        Err(InvalidBytecode::SizeMismatch { .. })
    ));
}

#[test]
fn header_size_and_version_are_checked() {
    let bytes = scenario_snapshot();

    let mut wrong_header = bytes.clone();
    wrong_header[1] = 40;
    assert!(matches!(
        decode_snapshot(&wrong_header),
        Err(InvalidBytecode::HeaderSizeMismatch { declared: 40, .. })
    ));

    // The version byte is outside CRC coverage, so this reaches the
    // version check itself.
    let mut wrong_version = bytes.clone();
    wrong_version[0] = 99;
    assert!(matches!(
        decode_snapshot(&wrong_version),
        Err(InvalidBytecode::VersionMismatch { .. })
    ));
}

#[test]
fn an_empty_vm_snapshots_and_decodes() {
    // Only the built-in vmExport global is present.
    let vm = Vm::new();
    let info = vm.create_snapshot_info().expect("info");
    let bytes = encode_snapshot(&info).expect("encode");
    let (decoded, mapping) = decode_snapshot(&bytes).expect("decode");
    assert_eq!(decoded.globals.len(), 1);
    assert!(decoded.allocations.is_empty());
    assert_eq!(mapping.reassemble(), bytes);
}
